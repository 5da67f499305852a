use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::header::{HeaderValue, HOST, UPGRADE};
use hyper::{Body, Client, Request, Response, StatusCode, Uri};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("backend request timed out")]
    Timeout,

    #[error("backend transport error: {0}")]
    Transport(#[from] hyper::Error),

    #[error("bad forwarding target: {0}")]
    BadTarget(String),
}

/// Is this a websocket (or other `Upgrade`) request that must be tunneled
/// rather than proxied per-message?
pub fn is_upgrade_request(req: &Request<Body>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Points the request at the backend: target URI, rewritten `Host`, and
/// the client appended to `X-Forwarded-For`.
pub fn rewrite_request(
    req: &mut Request<Body>,
    target_authority: &str,
    client_ip: &str,
) -> Result<(), ForwardError> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let uri: Uri = format!("http://{target_authority}{path_and_query}")
        .parse()
        .map_err(|e| ForwardError::BadTarget(format!("{target_authority}: {e}")))?;
    *req.uri_mut() = uri;

    let chain = match req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        req.headers_mut().insert("x-forwarded-for", value);
    }
    if let Ok(value) = HeaderValue::from_str(target_authority) {
        req.headers_mut().insert(HOST, value);
    }
    Ok(())
}

/// Forwards one request. Plain requests are buffered so the post-forward
/// hook can still replace the body with an error page; upgrade requests
/// are tunneled byte-for-byte.
pub async fn forward(
    client: &Client<HttpConnector>,
    timeout: Option<Duration>,
    mut req: Request<Body>,
    target_authority: &str,
    client_ip: &str,
) -> Result<Response<Body>, ForwardError> {
    rewrite_request(&mut req, target_authority, client_ip)?;

    if is_upgrade_request(&req) {
        return tunnel(client, req).await;
    }

    let exchange = async {
        let resp = client.request(req).await?;
        let (parts, body) = resp.into_parts();
        let bytes = hyper::body::to_bytes(body).await?;
        Ok::<_, hyper::Error>(Response::from_parts(parts, Body::from(bytes)))
    };

    match timeout {
        Some(budget) => tokio::time::timeout(budget, exchange)
            .await
            .map_err(|_| ForwardError::Timeout)?
            .map_err(ForwardError::Transport),
        None => exchange.await.map_err(ForwardError::Transport),
    }
}

/// Upgrades both ends and pumps bytes bidirectionally until either side
/// closes. The response (101) is returned to the client immediately; the
/// pump runs on its own task.
async fn tunnel(
    client: &Client<HttpConnector>,
    mut req: Request<Body>,
) -> Result<Response<Body>, ForwardError> {
    let client_upgrade = hyper::upgrade::on(&mut req);
    let mut resp = client.request(req).await?;

    if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
        let backend_upgrade = hyper::upgrade::on(&mut resp);
        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, backend_upgrade) {
                Ok((mut client_io, mut backend_io)) => {
                    if let Err(err) =
                        tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await
                    {
                        debug!(error = %err, "websocket tunnel closed");
                    }
                }
                Err(err) => debug!(error = %err, "websocket upgrade failed"),
            }
        });
    }
    Ok(resp)
}
