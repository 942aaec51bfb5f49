//! The worker's HTTP listener
//!
//! Serves the health and version endpoints, routes everything else to the
//! mounted apps and runs authenticated requests through the session manager.

use super::proxy_protocol;
use crate::config::{AppConfig, PoolConfig};
use crate::error::{
    full_body, json_error_response, rejection_response, ErrorCode, ResponseBody,
};
use crate::render::{render_shell, route, Route, ShellState};
use crate::session::cancel::disconnect_pair;
use crate::session::identity::{Credentials, IdentityService};
use crate::session::{LoginActionGate, Next, SessionContext, SessionManager};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Header carrying the request ID
const X_REQUEST_ID: &str = "x-request-id";

pub const HEALTH_PATH: &str = "/_health";
pub const VERSION_PATH: &str = "/_version";

/// Interval between checks of the open connection count while draining
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// Everything a request handler needs, shared by all connections
struct AppState {
    config: PoolConfig,
    /// Session managers of authenticated apps, by basepath
    sessions: HashMap<String, Arc<SessionManager>>,
}

impl AppState {
    fn new(config: PoolConfig, identity: Arc<dyn IdentityService>) -> Self {
        let sessions = config
            .apps
            .iter()
            .filter(|app| app.session)
            .map(|app| (app.basepath.clone(), Arc::new(session_manager(app, &identity))))
            .collect();
        Self { config, sessions }
    }

    fn version(&self) -> &str {
        self.config.version.as_deref().unwrap_or(VERSION)
    }
}

fn session_manager(app: &AppConfig, identity: &Arc<dyn IdentityService>) -> SessionManager {
    let manager = SessionManager::new(Arc::clone(identity))
        .with_allow_unauthenticated(app.allow_unauthenticated.clone());
    if app.login_actions {
        manager.with_setup(Arc::new(LoginActionGate))
    } else {
        manager
    }
}

/// A bound listener, ready to serve
pub struct FrontendServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<AppState>,
    tls_acceptor: Option<TlsAcceptor>,
    proxy_protocol: bool,
    drain_timeout: Duration,
}

impl FrontendServer {
    /// Bind the configured address and prepare TLS if configured
    pub async fn bind(config: &PoolConfig, identity: Arc<dyn IdentityService>) -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}:{}: {}", config.server.bind, config.server.port, e))?;

        let tls_acceptor = match (&config.server.tls_cert, &config.server.tls_key) {
            (Some(cert), Some(key)) => Some(tls_acceptor(cert, key)?),
            _ => None,
        };

        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e))?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(AppState::new(config.clone(), identity)),
            tls_acceptor,
            proxy_protocol: config.server.proxy_protocol,
            drain_timeout: config.server.drain_timeout(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    /// Accept connections until `shutdown_rx` turns true, then drain open connections
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let protocol = if self.tls_enabled() { "HTTPS" } else { "HTTP" };
        info!(
            addr = %self.local_addr,
            protocol,
            proxy_protocol = self.proxy_protocol,
            apps = self.state.config.apps.len(),
            "Worker listening (HTTP/1.1 and HTTP/2)"
        );

        let open_connections = Arc::new(AtomicUsize::new(0));

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            set_keepalive(&stream);
                            open_connections.fetch_add(1, Ordering::SeqCst);

                            let guard = ConnectionGuard(Arc::clone(&open_connections));
                            let state = Arc::clone(&self.state);
                            let tls_acceptor = self.tls_acceptor.clone();
                            let proxy_protocol = self.proxy_protocol;
                            let shutdown_rx = shutdown_rx.clone();

                            tokio::spawn(async move {
                                let _guard = guard;
                                if let Err(e) = accept_connection(stream, addr, state, tls_acceptor, proxy_protocol, shutdown_rx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Worker listener closing");
                        break;
                    }
                }
            }
        }

        drop(self.listener);
        drain(&open_connections, self.drain_timeout).await;
        Ok(())
    }
}

/// Wait for open connections to finish, bounded by `timeout`
async fn drain(open_connections: &AtomicUsize, timeout: Duration) {
    let drain_start = Instant::now();
    while open_connections.load(Ordering::SeqCst) > 0 {
        if drain_start.elapsed() > timeout {
            warn!(
                remaining = open_connections.load(Ordering::SeqCst),
                "Drain timeout exceeded, closing anyway"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
    }
    let drained_in = drain_start.elapsed();
    if drained_in > Duration::from_millis(100) {
        info!(drained_in_ms = drained_in.as_millis() as u64, "Drained open connections");
    }
}

struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(unix)]
fn set_keepalive(stream: &TcpStream) {
    use std::os::unix::io::AsRawFd;

    let enable: libc::c_int = 1;
    let result = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result != 0 {
        debug!(error = %std::io::Error::last_os_error(), "Failed to enable TCP keep-alive");
    }
}

#[cfg(not(unix))]
fn set_keepalive(_stream: &TcpStream) {}

async fn accept_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: Arc<AppState>,
    tls_acceptor: Option<TlsAcceptor>,
    proxy_protocol: bool,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client_addr = if proxy_protocol {
        proxy_protocol::read_header(&mut stream, proxy_protocol::HEADER_TIMEOUT).await?.unwrap_or(peer)
    } else {
        peer
    };

    match tls_acceptor {
        Some(acceptor) => {
            let tls_stream = acceptor
                .accept(stream)
                .await
                .map_err(|e| anyhow::anyhow!("TLS handshake failed: {}", e))?;
            serve_connection(tls_stream, client_addr, state, shutdown_rx).await
        }
        None => serve_connection(stream, client_addr, state, shutdown_rx).await,
    }
}

async fn serve_connection<S>(
    stream: S,
    client_addr: SocketAddr,
    state: Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, client_addr, state).await }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = async { let _ = shutdown_rx.wait_for(|closing| *closing).await; } => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))
}

fn text_response(status: StatusCode, content_type: &'static str, body: impl Into<hyper::body::Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

fn redirect_response(location: &str) -> Response<ResponseBody> {
    match HeaderValue::from_str(location) {
        Ok(location) => redirect_to(location),
        Err(_) => json_error_response(ErrorCode::InternalError, "Invalid redirect location"),
    }
}

fn redirect_to(location: HeaderValue) -> Response<ResponseBody> {
    let mut response = text_response(StatusCode::FOUND, "text/plain", "");
    response.headers_mut().insert(LOCATION, location);
    response
}

async fn handle_request(
    req: Request<Incoming>,
    client_addr: SocketAddr,
    state: Arc<AppState>,
) -> Result<Response<ResponseBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    debug!(method = %req.method(), uri = %req.uri(), client = %client_addr, request_id, "Incoming request");

    let mut response = serve_request(req, &state).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    Ok(response)
}

async fn serve_request(req: Request<Incoming>, state: &Arc<AppState>) -> Response<ResponseBody> {
    let path = req.uri().path().to_string();

    if req.method() == Method::GET {
        match path.as_str() {
            HEALTH_PATH => return text_response(StatusCode::OK, "text/plain", "ok"),
            VERSION_PATH => {
                let body = serde_json::json!({ "name": PKG_NAME, "version": state.version() });
                return text_response(StatusCode::OK, "application/json", body.to_string());
            }
            _ => {}
        }
    }

    let (app, scope) = match route(&state.config.apps, &path) {
        Route::App { app, scope } => (app.clone(), scope),
        Route::AddSlash(location) => {
            let location = match req.uri().query() {
                Some(query) => format!("{}?{}", location, query),
                None => location,
            };
            return redirect_response(&location);
        }
        Route::NotFound => {
            return json_error_response(ErrorCode::UnknownApp, "No app is mounted at this path");
        }
    };

    let original_url = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let session = match state.sessions.get(&app.basepath) {
        Some(session) => Arc::clone(session),
        None => return render_app(state, &app, None),
    };

    let credentials = Credentials::from_headers(req.headers());
    let (trigger, token) = disconnect_pair();
    let basepath = app.basepath.clone();

    // Dropping this future on client disconnect drops the armed trigger
    let task = tokio::spawn(async move {
        let mut ctx = SessionContext::new(original_url, scope, credentials, token);
        let next = session.middleware(&basepath, &mut ctx).await;
        (next, ctx)
    });

    let (next, ctx) = match task.await {
        Ok(outcome) => {
            trigger.disarm();
            outcome
        }
        Err(e) => {
            trigger.disarm();
            error!(app = %app.name, error = %e, "Session task failed");
            return json_error_response(ErrorCode::InternalError, "Internal error");
        }
    };

    match next {
        Next::Continue => render_app(state, &app, Some(ctx)),
        Next::Redirect(location) => redirect_to(location),
        Next::Aborted => json_error_response(ErrorCode::ClientClosedRequest, "Client closed request"),
        Next::Fail(reason) => rejection_response(&reason),
    }
}

/// Render the app shell, attaching the session's user and headers when present
fn render_app(state: &AppState, app: &AppConfig, session: Option<SessionContext>) -> Response<ResponseBody> {
    let shell = ShellState::new(app, &state.config.client, Some(state.version()));
    let (html, headers) = match session {
        Some(ctx) => {
            let shell = shell.with_user(ctx.username.as_deref(), ctx.logout_url());
            (render_shell(app.title(), &shell), ctx.response_headers)
        }
        None => (render_shell(app.title(), &shell), Default::default()),
    };

    let mut response = text_response(StatusCode::OK, "text/html; charset=utf-8", html);
    response.headers_mut().extend(headers);
    response
}

fn tls_acceptor(cert_path: &str, key_path: &str) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

    info!(cert = %cert_path, key = %key_path, "TLS enabled");
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}
