use thiserror::Error;

/// Why a session could not be established
///
/// [`Rejection::Error`] is a plain failure and goes straight to the error
/// handler. Every other variant is a control signal that may turn into a
/// redirect.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("service document has no user workspace")]
    NoUserWorkspace,

    #[error("not authenticated: {0}")]
    Unauthenticated(String),

    #[error("identity service responded with status {status}")]
    HttpStatus { status: u16, body: String },

    #[error("status {0}")]
    Status(u16),

    #[error("login action required: {route}")]
    LoginAction { route: String },

    #[error(transparent)]
    Error(#[from] anyhow::Error),
}

impl Rejection {
    pub fn login_action(route: impl Into<String>) -> Self {
        Rejection::LoginAction {
            route: route.into(),
        }
    }

    /// Status code carried by the rejection, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Rejection::HttpStatus { status, .. } | Rejection::Status(status) => Some(*status),
            _ => None,
        }
    }

    /// Reduce a status-carrying rejection to its bare code
    pub fn reduce(self) -> Self {
        match self {
            Rejection::HttpStatus { status, .. } => Rejection::Status(status),
            other => other,
        }
    }
}
