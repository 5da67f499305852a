use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::{Body, Client};
use tracing::warn;

/// Forwarding engine selected by `proxy.engine`.
///
/// `standard` opens a fresh backend connection per request, which keeps the
/// swap window trivial; `fast` keeps a pooled keep-alive client with
/// TCP_NODELAY for lower per-request latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Standard,
    Fast,
}

impl Engine {
    pub fn parse(value: &str) -> Self {
        match value {
            "fast" => Engine::Fast,
            "standard" | "" => Engine::Standard,
            other => {
                warn!(engine = other, "unknown proxy engine, using standard");
                Engine::Standard
            }
        }
    }
}

pub fn build_client(engine: Engine) -> Client<HttpConnector> {
    match engine {
        Engine::Standard => Client::builder().pool_max_idle_per_host(0).build_http(),
        Engine::Fast => {
            let mut connector = HttpConnector::new();
            connector.set_nodelay(true);
            Client::builder()
                .pool_idle_timeout(Duration::from_secs(90))
                .build(connector)
        }
    }
}
