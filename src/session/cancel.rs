//! Per-request disconnect signalling
//!
//! The HTTP layer holds a [`DisconnectTrigger`] for as long as the client is
//! waiting. Dropping it without [`DisconnectTrigger::disarm`] marks every
//! [`CancelToken`] of that request dead.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Create the trigger and token for one request
pub fn disconnect_pair() -> (DisconnectTrigger, CancelToken) {
    let (tx, rx) = watch::channel(false);
    let trigger = DisconnectTrigger { tx, armed: true };
    let token = CancelToken {
        rx,
        listeners: Arc::new(AtomicUsize::new(0)),
    };
    (trigger, token)
}

/// Fires the disconnect when dropped while armed
pub struct DisconnectTrigger {
    tx: watch::Sender<bool>,
    armed: bool,
}

impl DisconnectTrigger {
    /// Mark the request dead now
    pub fn fire(&self) {
        let _ = self.tx.send(true);
    }

    /// The response was handed off; dropping no longer counts as a disconnect
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectTrigger {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.tx.send(true);
        }
    }
}

#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    listeners: Arc<AtomicUsize>,
}

impl CancelToken {
    /// A token that never fires
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self {
            rx,
            listeners: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_dead(&self) -> bool {
        *self.rx.borrow()
    }

    /// Number of registered disconnect listeners
    pub fn listeners(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }

    /// Register interest in the disconnect; dropping the returned guard deregisters it
    pub fn on_disconnect(&self) -> DisconnectListener {
        self.listeners.fetch_add(1, Ordering::SeqCst);
        DisconnectListener {
            listeners: Arc::clone(&self.listeners),
        }
    }
}

pub struct DisconnectListener {
    listeners: Arc<AtomicUsize>,
}

impl Drop for DisconnectListener {
    fn drop(&mut self) {
        self.listeners.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropping_armed_trigger_marks_dead() {
        let (trigger, token) = disconnect_pair();
        assert!(!token.is_dead());
        drop(trigger);
        assert!(token.is_dead());
    }

    #[tokio::test]
    async fn test_disarmed_trigger_stays_alive() {
        let (trigger, token) = disconnect_pair();
        trigger.disarm();
        assert!(!token.is_dead());
        assert!(!CancelToken::never().is_dead());
    }

    #[tokio::test]
    async fn test_listener_guard_deregisters() {
        let (trigger, token) = disconnect_pair();
        {
            let _first = token.on_disconnect();
            let _second = token.clone().on_disconnect();
            assert_eq!(token.listeners(), 2);
            trigger.fire();
            assert!(token.is_dead());
        }
        assert_eq!(token.listeners(), 0);
    }
}
