//! Per-request session resolution
//!
//! [`SessionManager::middleware`] resolves the user behind a request, runs the
//! app's setup hook and returns exactly one [`Next`] outcome. A request whose
//! client went away always ends as [`Next::Aborted`].

pub mod cancel;
pub mod identity;
pub mod redirect;
pub mod rejection;

use async_trait::async_trait;
use cancel::CancelToken;
use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;
use identity::{Credentials, IdentityService, ServiceDocument, LOGOUT_LINK};
use redirect::{maybe_redirect, RedirectScope};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

pub use rejection::Rejection;

/// What the request pipeline does after the session middleware
#[derive(Debug)]
pub enum Next {
    /// Continue to rendering
    Continue,
    /// Send a redirect to this location
    Redirect(HeaderValue),
    /// The client is gone; send nothing
    Aborted,
    /// Hand the reason to the error handler
    Fail(Rejection),
}

/// App-supplied hook run once the service document is known
#[async_trait]
pub trait SessionSetup: Send + Sync {
    async fn setup(&self, document: &ServiceDocument) -> Result<(), Rejection>;
}

/// Sends users with pending login actions to the first action's route
pub struct LoginActionGate;

#[async_trait]
impl SessionSetup for LoginActionGate {
    async fn setup(&self, document: &ServiceDocument) -> Result<(), Rejection> {
        match document.login_actions.first() {
            Some(route) => Err(Rejection::login_action(route.as_str())),
            None => Ok(()),
        }
    }
}

/// Per-request session state, threaded through every step
pub struct SessionContext {
    pub original_url: String,
    /// Request path relative to the app's basepath
    pub scope: String,
    pub credentials: Credentials,
    pub username: Option<String>,
    pub service_document: Option<Arc<ServiceDocument>>,
    /// Headers collected during the session, merged into the response on success
    pub pending_headers: Vec<(String, String)>,
    pub response_headers: HeaderMap,
    pub headers_sent: bool,
    cancel: CancelToken,
}

impl SessionContext {
    pub fn new(
        original_url: impl Into<String>,
        scope: impl Into<String>,
        credentials: Credentials,
        cancel: CancelToken,
    ) -> Self {
        Self {
            original_url: original_url.into(),
            scope: scope.into(),
            credentials,
            username: None,
            service_document: None,
            pending_headers: Vec::new(),
            response_headers: HeaderMap::new(),
            headers_sent: false,
            cancel,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.cancel.is_dead()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Logout URL attached to the resolved service document
    pub fn logout_url(&self) -> Option<&str> {
        self.service_document.as_ref().and_then(|d| d.logout_url())
    }
}

/// Resolves sessions for one app
pub struct SessionManager {
    identity: Arc<dyn IdentityService>,
    setup: Option<Arc<dyn SessionSetup>>,
    allow_unauthenticated: Vec<String>,
}

impl SessionManager {
    pub fn new(identity: Arc<dyn IdentityService>) -> Self {
        Self {
            identity,
            setup: None,
            allow_unauthenticated: Vec::new(),
        }
    }

    /// Set the session setup hook (builder pattern)
    pub fn with_setup(mut self, setup: Arc<dyn SessionSetup>) -> Self {
        self.setup = Some(setup);
        self
    }

    /// Set scope prefixes that never redirect to login (builder pattern)
    pub fn with_allow_unauthenticated(mut self, prefixes: Vec<String>) -> Self {
        self.allow_unauthenticated = prefixes;
        self
    }

    /// Handshake for the logout URL, then fetch the full service document
    pub async fn get_service_document(
        &self,
        ctx: &mut SessionContext,
    ) -> Result<Arc<ServiceDocument>, Rejection> {
        let pong = self.identity.ping(&ctx.credentials).await?;
        if ctx.is_dead() {
            return Err(anyhow::anyhow!("Client disconnected during identity lookup").into());
        }
        ctx.pending_headers.extend(
            pong.set_cookies
                .iter()
                .map(|cookie| ("set-cookie".to_string(), cookie.clone())),
        );

        let mut document = self.identity.service_document(&ctx.credentials).await?;
        document.set_logout_url(pong.get_link(LOGOUT_LINK).map(String::from));
        Ok(Arc::new(document))
    }

    /// Resolve the username from the user workspace title
    pub async fn get_user(&self, ctx: &mut SessionContext) -> Result<String, Rejection> {
        let document = self.get_service_document(ctx).await?;
        ctx.service_document = Some(Arc::clone(&document));
        document
            .user_workspace()
            .map(|workspace| workspace.title.clone())
            .ok_or(Rejection::NoUserWorkspace)
    }

    /// Make the service document available and run the setup hook
    pub async fn setup_initial_data(&self, ctx: &mut SessionContext) -> Result<(), Rejection> {
        let document = match ctx.service_document.clone() {
            Some(document) => document,
            None => {
                let document = self.get_service_document(ctx).await?;
                ctx.service_document = Some(Arc::clone(&document));
                document
            }
        };

        if let Some(ref setup) = self.setup {
            setup.setup(&document).await?;
        }
        Ok(())
    }

    async fn authenticate(&self, ctx: &mut SessionContext) -> Result<(), Rejection> {
        let username = self.get_user(ctx).await?;
        debug!(url = %ctx.original_url, user = %username, "Session user resolved");
        ctx.username = Some(username);

        if ctx.is_dead() {
            return Ok(());
        }
        self.setup_initial_data(ctx).await
    }

    /// Resolve the session for one request
    pub async fn middleware(&self, basepath: &str, ctx: &mut SessionContext) -> Next {
        let started = Instant::now();

        if ctx.headers_sent {
            error!(url = %ctx.original_url, "Response already sent before session middleware");
            return Next::Aborted;
        }

        let _listener = ctx.cancel.on_disconnect();

        let result = self.authenticate(ctx).await;
        if ctx.is_dead() {
            debug!(url = %ctx.original_url, "Client disconnected, session aborted");
            return Next::Aborted;
        }

        match result {
            Ok(()) => {
                merge_headers(ctx);
                Next::Continue
            }
            Err(reason) => {
                let target = RedirectScope {
                    basepath,
                    scope: &ctx.scope,
                    original_url: &ctx.original_url,
                    allow_unauthenticated: &self.allow_unauthenticated,
                    started,
                };
                match maybe_redirect(&target, ctx.is_dead(), reason) {
                    Ok(Next::Continue) => {
                        merge_headers(ctx);
                        Next::Continue
                    }
                    Ok(next) => next,
                    Err(reason) => {
                        error!(url = %ctx.original_url, error = %reason, "Session rejected");
                        Next::Fail(reason)
                    }
                }
            }
        }
    }
}

/// Move pending headers onto the response; unusable ones are logged and skipped
fn merge_headers(ctx: &mut SessionContext) {
    for (name, value) in std::mem::take(&mut ctx.pending_headers) {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| e.to_string())
            .and_then(|n| HeaderValue::from_str(&value).map(|v| (n, v)).map_err(|e| e.to_string()));
        match header {
            Ok((name, value)) => {
                ctx.response_headers.append(name, value);
            }
            Err(e) => {
                warn!(url = %ctx.original_url, header = %name, error = %e, "Failed to set response header");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cancel::{disconnect_pair, DisconnectTrigger};
    use identity::{Link, Pong, Workspace};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Behaviour {
        User(&'static str),
        NoWorkspace,
        PingStatus(u16),
        Unreachable,
    }

    struct MockIdentity {
        behaviour: Behaviour,
        login_actions: Vec<String>,
        disconnect_on_ping: Mutex<Option<DisconnectTrigger>>,
        pings: AtomicUsize,
        documents: AtomicUsize,
    }

    impl MockIdentity {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                login_actions: Vec::new(),
                disconnect_on_ping: Mutex::new(None),
                pings: AtomicUsize::new(0),
                documents: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IdentityService for MockIdentity {
        async fn ping(&self, _credentials: &Credentials) -> Result<Pong, Rejection> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if let Some(trigger) = self.disconnect_on_ping.lock().unwrap().take() {
                drop(trigger);
            }
            match self.behaviour {
                Behaviour::PingStatus(status) => Err(Rejection::HttpStatus {
                    status,
                    body: String::new(),
                }),
                Behaviour::Unreachable => Err(anyhow::anyhow!("connection refused").into()),
                _ => Ok(Pong {
                    links: vec![Link {
                        rel: LOGOUT_LINK.to_string(),
                        href: "https://id.example.com/logout".to_string(),
                    }],
                    set_cookies: vec!["sid=renewed; Path=/".to_string()],
                }),
            }
        }

        async fn service_document(&self, _credentials: &Credentials) -> Result<ServiceDocument, Rejection> {
            self.documents.fetch_add(1, Ordering::SeqCst);
            let workspaces = match self.behaviour {
                Behaviour::User(name) => vec![Workspace {
                    title: name.to_string(),
                    kind: "user".to_string(),
                }],
                _ => Vec::new(),
            };
            let mut document = ServiceDocument::default();
            document.workspaces = workspaces;
            document.login_actions = self.login_actions.clone();
            Ok(document)
        }
    }

    fn manager(identity: Arc<MockIdentity>) -> SessionManager {
        SessionManager::new(identity)
            .with_setup(Arc::new(LoginActionGate))
            .with_allow_unauthenticated(vec!["api".to_string(), "login".to_string()])
    }

    fn context(scope: &str, url: &str, cancel: CancelToken) -> SessionContext {
        SessionContext::new(url, scope, Credentials::default(), cancel)
    }

    #[tokio::test]
    async fn test_resolved_user_continues() {
        let identity = Arc::new(MockIdentity::new(Behaviour::User("alice")));
        let manager = manager(Arc::clone(&identity));
        let (_trigger, token) = disconnect_pair();
        let mut ctx = context("dashboard", "/dashboard", token.clone());

        let next = manager.middleware("/", &mut ctx).await;

        assert!(matches!(next, Next::Continue));
        assert_eq!(ctx.username.as_deref(), Some("alice"));
        assert_eq!(ctx.logout_url(), Some("https://id.example.com/logout"));
        assert_eq!(ctx.response_headers.get("set-cookie").unwrap(), "sid=renewed; Path=/");
        assert!(ctx.pending_headers.is_empty());
        assert_eq!(identity.pings.load(Ordering::SeqCst), 1);
        assert_eq!(identity.documents.load(Ordering::SeqCst), 1);
        assert_eq!(token.listeners(), 0);
    }

    #[tokio::test]
    async fn test_missing_workspace_redirects_to_login() {
        let identity = Arc::new(MockIdentity::new(Behaviour::NoWorkspace));
        let (_trigger, token) = disconnect_pair();
        let mut ctx = context("", "/original-url", token.clone());

        let next = manager(identity).middleware("/", &mut ctx).await;

        match next {
            Next::Redirect(location) => assert_eq!(location, "/login/?return=original-url"),
            other => panic!("expected redirect, got {:?}", other),
        }
        assert!(ctx.username.is_none());
        assert!(ctx.response_headers.is_empty());
        assert_eq!(token.listeners(), 0);
    }

    #[tokio::test]
    async fn test_pending_login_action_redirects() {
        let mut identity = MockIdentity::new(Behaviour::User("alice"));
        identity.login_actions = vec!["tos".to_string()];
        let identity = Arc::new(identity);

        let (_trigger, token) = disconnect_pair();
        let mut ctx = context("", "/", token.clone());
        match manager(Arc::clone(&identity)).middleware("/", &mut ctx).await {
            Next::Redirect(location) => assert_eq!(location, "/tos"),
            other => panic!("expected redirect, got {:?}", other),
        }

        let mut ctx = context("tos/fooboo", "/tos/fooboo", token.clone());
        let next = manager(identity).middleware("/", &mut ctx).await;
        assert!(matches!(next, Next::Continue));
        assert_eq!(token.listeners(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_identity_service_fails() {
        let identity = Arc::new(MockIdentity::new(Behaviour::Unreachable));
        let (_trigger, token) = disconnect_pair();
        let mut ctx = context("", "/original-url", token.clone());

        let next = manager(identity).middleware("/", &mut ctx).await;
        assert!(matches!(next, Next::Fail(Rejection::Error(_))));
        assert_eq!(token.listeners(), 0);
    }

    #[tokio::test]
    async fn test_allow_listed_scope_fails_with_status() {
        let identity = Arc::new(MockIdentity::new(Behaviour::PingStatus(401)));
        let (_trigger, token) = disconnect_pair();
        let mut ctx = context("api/me", "/api/me", token.clone());

        let next = manager(identity).middleware("/", &mut ctx).await;
        assert!(matches!(next, Next::Fail(Rejection::Status(401))));
        assert_eq!(token.listeners(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_mid_session_aborts() {
        let identity = MockIdentity::new(Behaviour::User("alice"));
        let (trigger, token) = disconnect_pair();
        *identity.disconnect_on_ping.lock().unwrap() = Some(trigger);
        let identity = Arc::new(identity);

        let mut ctx = context("dashboard", "/dashboard", token.clone());
        let next = manager(Arc::clone(&identity)).middleware("/", &mut ctx).await;

        assert!(matches!(next, Next::Aborted));
        assert!(ctx.response_headers.is_empty());
        assert_eq!(identity.documents.load(Ordering::SeqCst), 0);
        assert_eq!(token.listeners(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_aborts_failed_session_too() {
        let identity = MockIdentity::new(Behaviour::NoWorkspace);
        let (trigger, token) = disconnect_pair();
        *identity.disconnect_on_ping.lock().unwrap() = Some(trigger);

        let mut ctx = context("", "/original-url", token.clone());
        let next = manager(Arc::new(identity)).middleware("/", &mut ctx).await;
        assert!(matches!(next, Next::Aborted));
    }

    #[tokio::test]
    async fn test_headers_already_sent_aborts_without_lookups() {
        let identity = Arc::new(MockIdentity::new(Behaviour::User("alice")));
        let mut ctx = context("", "/", CancelToken::never());
        ctx.headers_sent = true;

        let next = manager(Arc::clone(&identity)).middleware("/", &mut ctx).await;
        assert!(matches!(next, Next::Aborted));
        assert_eq!(identity.pings.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.cancel_token().listeners(), 0);
    }

    #[tokio::test]
    async fn test_unusable_header_is_skipped() {
        let identity = Arc::new(MockIdentity::new(Behaviour::User("alice")));
        let mut ctx = context("", "/", CancelToken::never());
        ctx.pending_headers.push(("bad header".to_string(), "x".to_string()));
        ctx.pending_headers.push(("x-trace".to_string(), "line\nbreak".to_string()));

        let next = manager(identity).middleware("/", &mut ctx).await;
        assert!(matches!(next, Next::Continue));
        assert!(ctx.response_headers.get("x-trace").is_none());
        assert!(ctx.response_headers.get("set-cookie").is_some());
    }

    #[tokio::test]
    async fn test_setup_reuses_fetched_document() {
        let identity = Arc::new(MockIdentity::new(Behaviour::User("alice")));
        let manager = manager(Arc::clone(&identity));
        let mut ctx = context("", "/", CancelToken::never());

        manager.setup_initial_data(&mut ctx).await.unwrap();
        assert_eq!(identity.documents.load(Ordering::SeqCst), 1);
        manager.setup_initial_data(&mut ctx).await.unwrap();
        assert_eq!(identity.documents.load(Ordering::SeqCst), 1);
        assert!(ctx.service_document.is_some());
    }
}
