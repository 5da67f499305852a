/// The four fixed operational endpoints. Anything else, including
/// sub-paths of these, is forwarded to the backend untouched.
pub const ADMIN_RESTART_PATH: &str = "/tower-proxy/watch/restart";
pub const ADMIN_PAUSE_PATH: &str = "/tower-proxy/watch/pause";
pub const ADMIN_BEGIN_PATH: &str = "/tower-proxy/watch/begin";
pub const ADMIN_STATUS_PATH: &str = "/tower-proxy/watch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminRoute {
    Restart,
    Pause,
    Begin,
    Status,
}

pub fn admin_route(path: &str) -> Option<AdminRoute> {
    match path {
        ADMIN_RESTART_PATH => Some(AdminRoute::Restart),
        ADMIN_PAUSE_PATH => Some(AdminRoute::Pause),
        ADMIN_BEGIN_PATH => Some(AdminRoute::Begin),
        ADMIN_STATUS_PATH => Some(AdminRoute::Status),
        _ => None,
    }
}

/// Strips the port from a remote-address string, bracket-aware for IPv6:
/// `[::1]:5000` → `::1`, `127.0.0.1:5000` → `127.0.0.1`.
pub fn client_ip(remote_addr: &str) -> String {
    if let Some(pos) = remote_addr.rfind("]:") {
        return remote_addr[..pos].trim_start_matches('[').to_string();
    }
    if let Some(pos) = remote_addr.rfind(':') {
        return remote_addr[..pos].to_string();
    }
    remote_addr.to_string()
}

/// Minimal query-string lookup; admin credentials are plain words, so no
/// percent-decoding is attempted.
pub fn query_value(query: Option<&str>, key: &str) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == key {
            return Some(v.to_string());
        }
    }
    None
}

/// Admin access: the `pwd` query parameter matching the configured
/// password, or the client IP on the allowlist.
pub fn authorize(
    password: &str,
    allowed_ips: &[String],
    query: Option<&str>,
    remote_addr: &str,
) -> bool {
    if !password.is_empty() {
        if let Some(pwd) = query_value(query, "pwd") {
            if pwd == password {
                return true;
            }
        }
    }
    let ip = client_ip(remote_addr);
    allowed_ips.iter().any(|allowed| *allowed == ip)
}
