//! Turning a failed session into a redirect, a pass-through, or an error

use super::rejection::Rejection;
use super::Next;
use hyper::header::HeaderValue;
use std::time::Instant;
use tracing::debug;

/// Login route, relative to the app's basepath
pub const LOGIN_ROUTE: &str = "login/";

/// Where the failing request was headed
#[derive(Debug, Clone, Copy)]
pub struct RedirectScope<'a> {
    pub basepath: &'a str,
    /// Request path relative to the basepath
    pub scope: &'a str,
    pub original_url: &'a str,
    /// Scope prefixes that must never redirect to login
    pub allow_unauthenticated: &'a [String],
    pub started: Instant,
}

/// Decide what a rejected session turns into.
///
/// `Err` hands the reason back to the caller for the generic error path; it
/// only happens for unauthenticated requests on allow-listed scopes.
pub fn maybe_redirect(
    target: &RedirectScope<'_>,
    dead: bool,
    reason: Rejection,
) -> Result<Next, Rejection> {
    if dead {
        return Ok(Next::Aborted);
    }

    let elapsed_ms = target.started.elapsed().as_millis() as u64;
    match reason.reduce() {
        reason @ Rejection::Error(_) => Ok(Next::Fail(reason)),
        Rejection::LoginAction { route } => {
            if target.scope.starts_with(&route) {
                return Ok(Next::Continue);
            }
            debug!(url = target.original_url, route = %route, elapsed_ms, "Redirecting to login action");
            let location = with_return(
                format!("{}{}", target.basepath, route),
                target.basepath,
                target.original_url,
            );
            Ok(redirect(location))
        }
        reason => {
            let allowed = target
                .allow_unauthenticated
                .iter()
                .any(|prefix| target.scope.starts_with(prefix.as_str()));
            if allowed {
                return Err(reason);
            }
            debug!(url = target.original_url, reason = %reason, elapsed_ms, "Redirecting to login");
            let location = with_return(
                format!("{}{}", target.basepath, LOGIN_ROUTE),
                target.basepath,
                target.original_url,
            );
            Ok(redirect(location))
        }
    }
}

/// Append `return=<original url>` unless the original URL is the basepath itself
fn with_return(location: String, basepath: &str, original_url: &str) -> String {
    if original_url == basepath {
        return location;
    }
    let relative = original_url.strip_prefix(basepath).unwrap_or(original_url);
    format!("{}?return={}", location, urlencoding::encode(relative))
}

fn redirect(location: String) -> Next {
    match HeaderValue::from_str(&location) {
        Ok(value) => Next::Redirect(value),
        Err(e) => Next::Fail(Rejection::Error(anyhow::anyhow!(
            "Cannot redirect to {:?}: {}",
            location,
            e
        ))),
    }
}
