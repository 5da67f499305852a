pub mod admin;
pub mod engine;
pub mod forward;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use hyper::client::HttpConnector;
use hyper::header::HeaderValue;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Request, Response, Server, StatusCode};
use thiserror::Error;
use tracing::{info, warn};

use crate::render::ErrorRenderer;
use crate::supervisor::{unix_now, Supervisor, SupervisorError};
use crate::watcher::WatchFlags;

use self::admin::{admin_route, authorize, client_ip, AdminRoute};
use self::engine::{build_client, Engine};
use self::forward::{forward, ForwardError};

/// `X-Server-Upgraded` is attached while the last swap is younger than
/// this; afterwards the stamp is cleared.
const UPGRADE_HEADER_WINDOW_SECS: i64 = 3600;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("bad listen address `{0}`")]
    BadAddress(String),

    #[error("port ({0}) already in use: {1}")]
    Bind(String, #[source] hyper::Error),

    #[error("proxy server error: {0}")]
    Serve(#[source] hyper::Error),
}

/// The supervisor surface the proxy depends on. Keeping this an interface
/// (rather than the concrete supervisor) breaks the supervisor⇄proxy cycle
/// and lets request-pipeline tests run against a mock.
#[cfg_attr(test, mockall::automock)]
pub trait BackendView: Send + Sync + 'static {
    fn current_port(&self) -> String;
    fn is_alive(&self) -> bool;
    fn is_quit(&self) -> bool;
    /// Single read-and-clear of the pending-swap flag.
    fn take_switch_pending(&self) -> bool;
    fn build_error(&self) -> Option<String>;
    fn runtime_error(&self) -> Option<String>;
    fn clear_runtime_error(&self);
    fn restart(&self) -> Result<(), SupervisorError>;
    fn recover(&self) -> Result<(), SupervisorError>;
    /// Reap children superseded by the last swap.
    fn clean_draining(&self);
}

pub struct SupervisorBackend(pub Arc<Supervisor>);

impl BackendView for SupervisorBackend {
    fn current_port(&self) -> String {
        self.0.current_port()
    }
    fn is_alive(&self) -> bool {
        self.0.is_alive()
    }
    fn is_quit(&self) -> bool {
        self.0.is_quit()
    }
    fn take_switch_pending(&self) -> bool {
        self.0.take_switch_pending()
    }
    fn build_error(&self) -> Option<String> {
        self.0.build_error()
    }
    fn runtime_error(&self) -> Option<String> {
        self.0.runtime_error()
    }
    fn clear_runtime_error(&self) {
        self.0.clear_runtime_error()
    }
    fn restart(&self) -> Result<(), SupervisorError> {
        self.0.restart()
    }
    fn recover(&self) -> Result<(), SupervisorError> {
        self.0.recover()
    }
    fn clean_draining(&self) {
        self.0.clean(None)
    }
}

pub struct ProxyConfig {
    pub listen_ip: String,
    pub listen_port: String,
    pub engine: Engine,
    /// Per-request forwarding budget; `None` leaves it unbounded.
    pub request_timeout: Option<Duration>,
    pub log_request: bool,
    pub admin_password: String,
    pub admin_ips: Vec<String>,
}

/// Fixed-port front-end. Every request consults the supervisor state:
/// admin dispatch, crash recovery, swap completion, then the forward and
/// the error-page post-hook.
pub struct Proxy {
    cfg: ProxyConfig,
    backend: Arc<dyn BackendView>,
    watch: Arc<WatchFlags>,
    renderer: ErrorRenderer,
    client: Client<HttpConnector>,
    /// Authority currently forwarded to, e.g. `localhost:5001`.
    target: RwLock<String>,
    /// Unix seconds of the last completed swap; 0 = none.
    upgraded_at: AtomicI64,
}

impl Proxy {
    pub fn new(
        cfg: ProxyConfig,
        backend: Arc<dyn BackendView>,
        watch: Arc<WatchFlags>,
        renderer: ErrorRenderer,
    ) -> Arc<Self> {
        let client = build_client(cfg.engine);
        let target = format!("localhost:{}", backend.current_port());
        Arc::new(Self {
            cfg,
            backend,
            watch,
            renderer,
            client,
            target: RwLock::new(target),
            upgraded_at: AtomicI64::new(0),
        })
    }

    pub async fn handle(self: Arc<Self>, req: Request<Body>, remote: SocketAddr) -> Response<Body> {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let resp = self.dispatch(req, remote).await;

        if self.cfg.log_request {
            info!(
                "{} {} => completed {} in {:.3}s",
                method,
                path,
                resp.status().as_u16(),
                started.elapsed().as_secs_f64()
            );
        }
        resp
    }

    async fn dispatch(&self, req: Request<Body>, remote: SocketAddr) -> Response<Body> {
        if let Some(resp) = self.handle_admin(&req, &remote).await {
            return resp;
        }

        // pre-forward hook
        self.backend.clear_runtime_error();
        let upgraded_secs = self.seconds_since_upgrade();

        if self.backend.is_quit() {
            let backend = self.backend.clone();
            let _ = tokio::task::spawn_blocking(move || backend.recover()).await;
            if !self.backend.is_alive() {
                return match self.backend.build_error() {
                    Some(stderr) => {
                        html_page(StatusCode::INTERNAL_SERVER_ERROR, self.renderer.render_build_error(&stderr))
                    }
                    None => html_page(
                        StatusCode::BAD_GATEWAY,
                        self.renderer.render_error("App quit unexpectedly."),
                    ),
                };
            }
        }

        // a failed build keeps the old child serving, but the developer
        // sees the toolchain output until the next build succeeds
        if let Some(stderr) = self.backend.build_error() {
            return html_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                self.renderer.render_build_error(&stderr),
            );
        }

        // backend selection: exactly one request observes a pending swap
        if self.backend.take_switch_pending() {
            let port = self.backend.current_port();
            let authority = format!("localhost:{port}");
            self.upgraded_at.store(unix_now(), Ordering::SeqCst);
            *self
                .target
                .write()
                .unwrap_or_else(PoisonError::into_inner) = authority.clone();
            let backend = self.backend.clone();
            tokio::task::spawn_blocking(move || backend.clean_draining());
            info!(to = %authority, "switched backend");
        } else if !self.backend.is_alive() && self.watch.has_changed() {
            self.watch.reset_changed();
            let backend = self.backend.clone();
            let _ = tokio::task::spawn_blocking(move || backend.restart()).await;
        }

        let target = self
            .target
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let ip = client_ip(&remote.to_string());

        match forward(
            &self.client,
            self.cfg.request_timeout,
            req,
            &target,
            &ip,
        )
        .await
        {
            Ok(mut resp) => {
                // post-forward hook: a panic captured mid-request replaces
                // the response with the diagnostic page
                if let Some(dump) = self.backend.runtime_error() {
                    return html_page(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        self.renderer.render_app_error(&dump),
                    );
                }
                if let Some(secs) = upgraded_secs {
                    if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                        resp.headers_mut().insert("X-Server-Upgraded", value);
                    }
                }
                resp
            }
            Err(err) => {
                warn!(error = %err, target = %target, "forward failed");
                if self.backend.is_quit() {
                    html_page(
                        StatusCode::BAD_GATEWAY,
                        self.renderer.render_error("App quit unexpectedly."),
                    )
                } else {
                    let context = self.backend.runtime_error().unwrap_or_default();
                    let message = match err {
                        ForwardError::Timeout => format!("backend request timed out\n{context}"),
                        other => format!("{other}\n{context}"),
                    };
                    html_page(
                        StatusCode::SERVICE_UNAVAILABLE,
                        self.renderer.render_error(message.trim_end()),
                    )
                }
            }
        }
    }

    async fn handle_admin(
        &self,
        req: &Request<Body>,
        remote: &SocketAddr,
    ) -> Option<Response<Body>> {
        let route = admin_route(req.uri().path())?;

        if route == AdminRoute::Status {
            let status = if self.watch.is_paused() { "Pause" } else { "OK" };
            return Some(text_page(StatusCode::OK, format!("watch status: {status}")));
        }

        let authorized = authorize(
            &self.cfg.admin_password,
            &self.cfg.admin_ips,
            req.uri().query(),
            &remote.to_string(),
        );
        if !authorized {
            return Some(text_page(
                StatusCode::UNAUTHORIZED,
                "Authentication failed".to_string(),
            ));
        }

        Some(match route {
            AdminRoute::Restart => {
                let backend = self.backend.clone();
                match tokio::task::spawn_blocking(move || backend.restart()).await {
                    Ok(Ok(())) => text_page(StatusCode::OK, "done".to_string()),
                    Ok(Err(err)) => {
                        text_page(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
                    }
                    Err(_) => text_page(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "restart task failed".to_string(),
                    ),
                }
            }
            AdminRoute::Pause => {
                self.watch.pause();
                text_page(StatusCode::OK, "done".to_string())
            }
            AdminRoute::Begin => {
                self.watch.resume();
                text_page(StatusCode::OK, "done".to_string())
            }
            AdminRoute::Status => unreachable!("handled above"),
        })
    }

    fn seconds_since_upgrade(&self) -> Option<i64> {
        let at = self.upgraded_at.load(Ordering::SeqCst);
        if at == 0 {
            return None;
        }
        let elapsed = unix_now() - at;
        if elapsed < UPGRADE_HEADER_WINDOW_SECS {
            Some(elapsed)
        } else {
            self.upgraded_at.store(0, Ordering::SeqCst);
            None
        }
    }
}

fn text_page(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(body))
        .unwrap_or_default()
}

fn html_page(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/html;charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_default()
}

/// Binds the public address and serves until the shutdown signal fires.
/// A bind conflict is surfaced as [`ProxyError::Bind`] so boot can exit
/// with the documented status code.
pub async fn serve(
    proxy: Arc<Proxy>,
    shutdown: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), ProxyError> {
    let ip = if proxy.cfg.listen_ip.is_empty() {
        "0.0.0.0"
    } else {
        proxy.cfg.listen_ip.as_str()
    };
    let addr_str = format!("{}:{}", ip, proxy.cfg.listen_port);
    let addr: SocketAddr = addr_str
        .parse()
        .map_err(|_| ProxyError::BadAddress(addr_str.clone()))?;

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let proxy = proxy.clone();
        let remote = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let proxy = proxy.clone();
                async move { Ok::<_, Infallible>(proxy.handle(req, remote).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| ProxyError::Bind(addr_str, e))?
        .serve(make_svc);
    info!(addr = %addr, "proxy listening");

    server
        .with_graceful_shutdown(async {
            let _ = shutdown.await;
        })
        .await
        .map_err(ProxyError::Serve)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProxyConfig {
        ProxyConfig {
            listen_ip: "127.0.0.1".to_string(),
            listen_port: "0".to_string(),
            engine: Engine::Standard,
            request_timeout: Some(Duration::from_secs(5)),
            log_request: false,
            admin_password: "s3cret".to_string(),
            admin_ips: vec!["127.0.0.1".to_string(), "::1".to_string()],
        }
    }

    fn test_proxy(mock: MockBackendView) -> (Arc<Proxy>, Arc<WatchFlags>) {
        let flags = WatchFlags::new();
        let renderer = ErrorRenderer::new(std::env::temp_dir());
        let proxy = Proxy::new(test_config(), Arc::new(mock), flags.clone(), renderer);
        (proxy, flags)
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    async fn body_string(resp: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        String::from_utf8_lossy(&bytes).to_string()
    }

    /// A real backend answering `hello from backend` for forwarding tests.
    async fn spawn_backend() -> SocketAddr {
        let make_svc = make_service_fn(|_conn: &AddrStream| async {
            Ok::<_, Infallible>(service_fn(|_req| async {
                Ok::<_, Infallible>(Response::new(Body::from("hello from backend")))
            }))
        });
        let server = Server::bind(&addr("127.0.0.1:0")).serve(make_svc);
        let local = server.local_addr();
        tokio::spawn(server);
        local
    }

    #[tokio::test]
    async fn status_endpoint_is_unauthenticated() {
        let mut mock = MockBackendView::new();
        mock.expect_current_port().return_const("5001".to_string());
        let (proxy, flags) = test_proxy(mock);

        let resp = proxy
            .clone()
            .handle(get("/tower-proxy/watch"), addr("203.0.113.7:40000"))
            .await;
        assert_eq!(StatusCode::OK, resp.status());
        assert_eq!("watch status: OK", body_string(resp).await);

        flags.pause();
        let resp = proxy
            .handle(get("/tower-proxy/watch"), addr("203.0.113.7:40000"))
            .await;
        assert_eq!("watch status: Pause", body_string(resp).await);
    }

    #[tokio::test]
    async fn pause_requires_authentication() {
        let mut mock = MockBackendView::new();
        mock.expect_current_port().return_const("5001".to_string());
        let (proxy, flags) = test_proxy(mock);

        let resp = proxy
            .clone()
            .handle(get("/tower-proxy/watch/pause"), addr("203.0.113.7:40000"))
            .await;
        assert_eq!(StatusCode::UNAUTHORIZED, resp.status());
        assert_eq!("Authentication failed", body_string(resp).await);
        assert!(!flags.is_paused());

        // password in the query authorises any client
        let resp = proxy
            .clone()
            .handle(
                get("/tower-proxy/watch/pause?pwd=s3cret"),
                addr("203.0.113.7:40000"),
            )
            .await;
        assert_eq!(StatusCode::OK, resp.status());
        assert_eq!("done", body_string(resp).await);
        assert!(flags.is_paused());

        // an allowlisted IP needs no password
        let resp = proxy
            .handle(get("/tower-proxy/watch/begin"), addr("127.0.0.1:40000"))
            .await;
        assert_eq!(StatusCode::OK, resp.status());
        assert!(!flags.is_paused());
    }

    #[tokio::test]
    async fn restart_endpoint_invokes_the_supervisor() {
        let mut mock = MockBackendView::new();
        mock.expect_current_port().return_const("5001".to_string());
        mock.expect_restart().times(1).returning(|| Ok(()));
        let (proxy, _flags) = test_proxy(mock);

        let resp = proxy
            .handle(get("/tower-proxy/watch/restart"), addr("127.0.0.1:40000"))
            .await;
        assert_eq!(StatusCode::OK, resp.status());
        assert_eq!("done", body_string(resp).await);
    }

    #[tokio::test]
    async fn restart_endpoint_reports_failure() {
        let mut mock = MockBackendView::new();
        mock.expect_current_port().return_const("5001".to_string());
        mock.expect_restart()
            .times(1)
            .returning(|| Err(SupervisorError::RestartExhausted));
        let (proxy, _flags) = test_proxy(mock);

        let resp = proxy
            .handle(get("/tower-proxy/watch/restart"), addr("127.0.0.1:40000"))
            .await;
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, resp.status());
    }

    #[tokio::test]
    async fn forwards_to_the_current_backend() {
        let backend_addr = spawn_backend().await;

        let mut mock = MockBackendView::new();
        mock.expect_current_port()
            .return_const(backend_addr.port().to_string());
        mock.expect_clear_runtime_error().return_const(());
        mock.expect_is_quit().return_const(false);
        mock.expect_build_error().return_const(None);
        mock.expect_take_switch_pending().return_const(false);
        mock.expect_is_alive().return_const(true);
        mock.expect_runtime_error().return_const(None);
        let (proxy, _flags) = test_proxy(mock);

        let resp = proxy.handle(get("/anything"), addr("127.0.0.1:50000")).await;
        assert_eq!(StatusCode::OK, resp.status());
        assert_eq!("hello from backend", body_string(resp).await);
    }

    #[tokio::test]
    async fn failed_build_surfaces_even_while_old_child_serves() {
        let backend_addr = spawn_backend().await;

        let mut mock = MockBackendView::new();
        mock.expect_current_port()
            .return_const(backend_addr.port().to_string());
        mock.expect_clear_runtime_error().return_const(());
        mock.expect_is_quit().return_const(false);
        mock.expect_build_error()
            .return_const(Some("./main.go:9:1: syntax error".to_string()));
        let (proxy, _flags) = test_proxy(mock);

        let resp = proxy.handle(get("/"), addr("127.0.0.1:50000")).await;
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, resp.status());
        let body = body_string(resp).await;
        assert!(body.contains("Build Error"));
        assert!(body.contains("syntax error"));
    }

    #[tokio::test]
    async fn swap_rebinds_on_first_request_and_stamps_upgrade() {
        let old_backend = spawn_backend().await;
        let new_backend = spawn_backend().await;

        let mut mock = MockBackendView::new();
        // construction reads the old port once
        mock.expect_current_port()
            .times(1)
            .return_const(old_backend.port().to_string());
        mock.expect_clear_runtime_error().return_const(());
        mock.expect_is_quit().return_const(false);
        mock.expect_build_error().return_const(None);
        mock.expect_take_switch_pending()
            .times(1)
            .return_const(true);
        mock.expect_take_switch_pending().return_const(false);
        mock.expect_current_port()
            .return_const(new_backend.port().to_string());
        mock.expect_clean_draining().times(1).return_const(());
        mock.expect_is_alive().return_const(true);
        mock.expect_runtime_error().return_const(None);
        let (proxy, _flags) = test_proxy(mock);

        // the swapping request reaches the new backend without the header
        let resp = proxy
            .clone()
            .handle(get("/"), addr("127.0.0.1:50000"))
            .await;
        assert_eq!(StatusCode::OK, resp.status());
        assert!(resp.headers().get("X-Server-Upgraded").is_none());

        // subsequent requests carry seconds-since-upgrade
        let resp = proxy.handle(get("/"), addr("127.0.0.1:50000")).await;
        assert!(resp.headers().get("X-Server-Upgraded").is_some());
    }

    #[tokio::test]
    async fn dead_backend_renders_error_page() {
        let mut mock = MockBackendView::new();
        // a port nothing listens on
        mock.expect_current_port().return_const("1".to_string());
        mock.expect_clear_runtime_error().return_const(());
        mock.expect_is_quit().return_const(false);
        mock.expect_build_error().return_const(None);
        mock.expect_take_switch_pending().return_const(false);
        mock.expect_is_alive().return_const(true);
        mock.expect_runtime_error().return_const(None);
        let (proxy, _flags) = test_proxy(mock);

        let resp = proxy.handle(get("/"), addr("127.0.0.1:50000")).await;
        assert_eq!(StatusCode::SERVICE_UNAVAILABLE, resp.status());
        let body = body_string(resp).await;
        assert!(body.contains("Error"));
    }

    #[tokio::test]
    async fn crashed_backend_recovers_or_reports() {
        let mut mock = MockBackendView::new();
        mock.expect_current_port().return_const("5001".to_string());
        mock.expect_clear_runtime_error().return_const(());
        mock.expect_is_quit().return_const(true);
        mock.expect_recover()
            .times(1)
            .returning(|| Err(SupervisorError::RestartExhausted));
        mock.expect_is_alive().return_const(false);
        mock.expect_build_error().return_const(None);
        let (proxy, _flags) = test_proxy(mock);

        let resp = proxy.handle(get("/"), addr("127.0.0.1:50000")).await;
        assert_eq!(StatusCode::BAD_GATEWAY, resp.status());
        let body = body_string(resp).await;
        assert!(body.contains("App quit unexpectedly."));
    }

    #[tokio::test]
    async fn build_error_page_wins_after_failed_recovery() {
        let mut mock = MockBackendView::new();
        mock.expect_current_port().return_const("5001".to_string());
        mock.expect_clear_runtime_error().return_const(());
        mock.expect_is_quit().return_const(true);
        mock.expect_recover()
            .times(1)
            .returning(|| Err(SupervisorError::BuildFailed("syntax error".to_string())));
        mock.expect_is_alive().return_const(false);
        mock.expect_build_error()
            .return_const(Some("./main.go:4:2: syntax error".to_string()));
        let (proxy, _flags) = test_proxy(mock);

        let resp = proxy.handle(get("/"), addr("127.0.0.1:50000")).await;
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, resp.status());
        let body = body_string(resp).await;
        assert!(body.contains("Build Error"));
        assert!(body.contains("syntax error"));
    }

    #[tokio::test]
    async fn panic_mid_request_replaces_the_response() {
        let backend_addr = spawn_backend().await;

        let mut mock = MockBackendView::new();
        mock.expect_current_port()
            .return_const(backend_addr.port().to_string());
        mock.expect_clear_runtime_error().return_const(());
        mock.expect_is_quit().return_const(false);
        mock.expect_build_error().return_const(None);
        mock.expect_take_switch_pending().return_const(false);
        mock.expect_is_alive().return_const(true);
        mock.expect_runtime_error().return_const(Some(
            "2025/01/01 12:00:00 http: panic serving 127.0.0.1:54321: division by zero"
                .to_string(),
        ));
        let (proxy, _flags) = test_proxy(mock);

        let resp = proxy.handle(get("/div"), addr("127.0.0.1:50000")).await;
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, resp.status());
        let body = body_string(resp).await;
        assert!(body.contains("Application Error"));
        assert!(body.contains("panic: division by zero"));
    }
}
