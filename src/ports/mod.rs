use std::net::TcpStream;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortError {
    #[error("empty port specification")]
    Empty,

    #[error("malformed port specification `{0}`")]
    Malformed(String),
}

/// The candidate local ports a child may be bound to.
///
/// Ports stay strings end to end: they flow into child arguments and
/// forwarding URLs. Order matters — selection walks the pool in the order
/// the configuration listed it — so entries live in a `Vec`, not a map.
#[derive(Debug, Clone)]
pub struct PortPool {
    entries: Vec<PortEntry>,
}

#[derive(Debug, Clone)]
struct PortEntry {
    port: String,
    /// Unix seconds of the last `run` on this port; 0 means never used.
    last_used: i64,
}

impl PortPool {
    /// Parses `"a,b,c-d"`: a union of single ports and inclusive ranges.
    pub fn parse(spec: &str) -> Result<Self, PortError> {
        let mut entries: Vec<PortEntry> = Vec::new();
        let mut push = |port: String| {
            if !entries.iter().any(|e| e.port == port) {
                entries.push(PortEntry { port, last_used: 0 });
            }
        };

        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u16 = lo
                        .trim()
                        .parse()
                        .map_err(|_| PortError::Malformed(part.to_string()))?;
                    let hi: u16 = hi
                        .trim()
                        .parse()
                        .map_err(|_| PortError::Malformed(part.to_string()))?;
                    if lo > hi {
                        return Err(PortError::Malformed(part.to_string()));
                    }
                    for p in lo..=hi {
                        push(p.to_string());
                    }
                }
                None => {
                    let p: u16 = part
                        .parse()
                        .map_err(|_| PortError::Malformed(part.to_string()))?;
                    push(p.to_string());
                }
            }
        }

        if entries.is_empty() {
            return Err(PortError::Empty);
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ports(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.port.as_str())
    }

    pub fn contains(&self, port: &str) -> bool {
        self.entries.iter().any(|e| e.port == port)
    }

    pub fn last_used(&self, port: &str) -> Option<i64> {
        self.entries
            .iter()
            .find(|e| e.port == port)
            .map(|e| e.last_used)
    }

    /// Records that `port` just started hosting a child.
    pub fn mark_used(&mut self, port: &str, now: i64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.port == port) {
            entry.last_used = now;
        }
    }

    /// Returns the port to the never-used state after its child has been
    /// stopped and its artifact removed.
    pub fn release(&mut self, port: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.port == port) {
            entry.last_used = 0;
        }
    }

    /// Port rotation: the first port that is never-used, or not running
    /// under this supervisor, or free on the OS; with the whole pool busy,
    /// the port idle the longest wins.
    pub fn pick<R, F>(&self, mut is_running: R, mut is_free: F) -> String
    where
        R: FnMut(&str) -> bool,
        F: FnMut(&str) -> bool,
    {
        for entry in &self.entries {
            if entry.last_used == 0 || !is_running(&entry.port) || is_free(&entry.port) {
                return entry.port.clone();
            }
        }
        self.entries
            .iter()
            .min_by_key(|e| e.last_used)
            .map(|e| e.port.clone())
            .unwrap_or_default()
    }
}

/// A port is free when nothing on localhost accepts a connection to it.
pub fn probe_is_free(port: &str) -> bool {
    let addr = format!("127.0.0.1:{port}");
    match addr.parse() {
        Ok(sock) => TcpStream::connect_timeout(&sock, Duration::from_millis(200)).is_err(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(spec: &str) -> PortPool {
        PortPool::parse(spec).unwrap()
    }

    #[test]
    fn parses_singles_and_ranges() {
        let p = pool("5001-5003,5010");
        let got: Vec<&str> = p.ports().collect();
        assert_eq!(vec!["5001", "5002", "5003", "5010"], got);
    }

    #[test]
    fn parses_mixed_and_dedups() {
        let p = pool("5001,5003,5001-5002");
        let got: Vec<&str> = p.ports().collect();
        assert_eq!(vec!["5001", "5003", "5002"], got);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(Err(PortError::Empty), PortPool::parse("").map(|_| ()));
        assert!(PortPool::parse("50x1").is_err());
        assert!(PortPool::parse("5003-5001").is_err());
        assert!(PortPool::parse("-5001").is_err());
    }

    #[test]
    fn pick_prefers_configuration_order_when_unused() {
        let p = pool("5001-5002");
        assert_eq!("5001", p.pick(|_| true, |_| false));
    }

    #[test]
    fn pick_skips_running_ports() {
        let mut p = pool("5001-5003");
        p.mark_used("5001", 100);
        assert_eq!("5002", p.pick(|port| port == "5001", |_| false));
    }

    #[test]
    fn pick_takes_free_port_even_if_marked_running() {
        let mut p = pool("5001-5002");
        p.mark_used("5001", 100);
        p.mark_used("5002", 200);
        // everything "running", but the OS says 5002 no longer listens
        assert_eq!("5002", p.pick(|_| true, |port| port == "5002"));
    }

    #[test]
    fn pick_on_exhausted_pool_returns_oldest() {
        let mut p = pool("5001-5003");
        p.mark_used("5001", 300);
        p.mark_used("5002", 100);
        p.mark_used("5003", 200);
        assert_eq!("5002", p.pick(|_| true, |_| false));
    }

    #[test]
    fn release_resets_timestamp() {
        let mut p = pool("5001-5002");
        p.mark_used("5001", 100);
        p.release("5001");
        assert_eq!(Some(0), p.last_used("5001"));
        assert_eq!("5001", p.pick(|_| true, |_| false));
    }
}
