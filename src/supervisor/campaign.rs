//! Explicit state for the supervisor's two pool-shaping campaigns
//!
//! A campaign stands in for an event listener: while it is stored on the
//! supervisor it receives pool events, and replacing or dropping it is the
//! only way to deregister it.

use super::pool::WorkerId;
use std::collections::VecDeque;

/// Identity of a campaign, unique for the life of the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignId(pub u64);

impl std::fmt::Display for CampaignId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Starts workers one at a time until the configured count is reached
#[derive(Debug)]
pub struct MaintainCampaign {
    pub id: CampaignId,
    /// The worker whose listening report the campaign waits for
    pub pending: Option<WorkerId>,
    /// Port a worker must report to count as online
    pub port: u16,
}

impl MaintainCampaign {
    pub fn new(id: CampaignId, pending: Option<WorkerId>, port: u16) -> Self {
        Self { id, pending, port }
    }

    /// Whether a listening report advances this campaign
    pub fn accepts(&self, worker: WorkerId, port: u16) -> bool {
        let expected_worker = self.pending.map_or(true, |pending| pending == worker);
        expected_worker && port == self.port
    }
}

/// What a rolling restart waits for before closing the next worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The closed worker has exited
    Exit(WorkerId),
    /// Some worker came online on `port`
    Listening { port: u16 },
}

/// Replaces the queued workers one at a time
#[derive(Debug)]
pub struct RestartCampaign {
    pub id: CampaignId,
    pub queue: VecDeque<WorkerId>,
    pub target: usize,
    pub port: u16,
    /// Registered continuation; `None` before the first step
    pub waiting: Option<Trigger>,
}

impl RestartCampaign {
    pub fn new(id: CampaignId, queue: VecDeque<WorkerId>, target: usize, port: u16) -> Self {
        Self {
            id,
            queue,
            target,
            port,
            waiting: None,
        }
    }

    /// Dequeue the next worker and choose the event that continues the campaign.
    ///
    /// While the remaining queue still covers the target, the pool has spare
    /// capacity and only the closed worker's exit is awaited. Otherwise a
    /// replacement must come online first.
    pub fn next_step(&mut self) -> Option<(WorkerId, Trigger)> {
        let worker = self.queue.pop_front()?;
        let trigger = if self.queue.len() >= self.target {
            Trigger::Exit(worker)
        } else {
            Trigger::Listening { port: self.port }
        };
        self.waiting = Some(trigger);
        Some((worker, trigger))
    }

    pub fn fired_by_exit(&self, worker: WorkerId) -> bool {
        self.waiting == Some(Trigger::Exit(worker))
    }

    pub fn fired_by_listening(&self, port: u16) -> bool {
        self.waiting == Some(Trigger::Listening { port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maintain_filters_worker_and_port() {
        let campaign = MaintainCampaign::new(CampaignId(1), Some(WorkerId(2)), 8080);
        assert!(campaign.accepts(WorkerId(2), 8080));
        assert!(!campaign.accepts(WorkerId(3), 8080));
        assert!(!campaign.accepts(WorkerId(2), 9090));
    }

    #[test]
    fn test_maintain_without_pending_accepts_any_worker() {
        let campaign = MaintainCampaign::new(CampaignId(1), None, 8080);
        assert!(campaign.accepts(WorkerId(7), 8080));
        assert!(!campaign.accepts(WorkerId(7), 8081));
    }

    #[test]
    fn test_restart_trigger_choice() {
        let queue = (1..=4).map(WorkerId).collect();
        let mut campaign = RestartCampaign::new(CampaignId(1), queue, 2, 8080);

        // 3 and 2 remaining cover the target of 2: wait for exits
        assert_eq!(
            campaign.next_step(),
            Some((WorkerId(1), Trigger::Exit(WorkerId(1))))
        );
        assert!(campaign.fired_by_exit(WorkerId(1)));
        assert_eq!(
            campaign.next_step(),
            Some((WorkerId(2), Trigger::Exit(WorkerId(2))))
        );

        // below target: wait for replacements
        assert_eq!(
            campaign.next_step(),
            Some((WorkerId(3), Trigger::Listening { port: 8080 }))
        );
        assert!(campaign.fired_by_listening(8080));
        assert!(!campaign.fired_by_listening(9090));
        assert_eq!(
            campaign.next_step(),
            Some((WorkerId(4), Trigger::Listening { port: 8080 }))
        );
        assert_eq!(campaign.next_step(), None);
    }
}
