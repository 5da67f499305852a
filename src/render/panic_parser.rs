use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// One frame of a parsed panic dump.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trace {
    pub func: String,
    pub file: String,
    pub line: usize,
    /// True when the frame points into the supervised project rather than
    /// the runtime or standard library.
    pub app_file: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPanic {
    pub message: Vec<String>,
    pub trace: Vec<Trace>,
    /// Index of the first app frame, the one worth opening for a snippet.
    pub app_index: Option<usize>,
}

/// Trailing ` (0xabc)` / ` +0xabc` address forms on frame locations.
fn mem_addr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r" [(+]0x[a-z0-9]+[)]?$").unwrap())
}

/// The `YYYY/MM/DD HH:MM:SS http: panic serving <ip>:<port>: ` prefix on
/// the first message line.
fn serving_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r".+\d+\.\d+\.\d+\.\d+:\d+: ").unwrap())
}

/// Splits a runtime panic dump into the panic message and its stack, the
/// pairs being `<function-with-args>` followed by an indented
/// `<file>:<line> (<hex-addr>)` location line.
pub fn parse_panic(dump: &str, workdir: &Path) -> ParsedPanic {
    let mut wd = workdir.to_string_lossy().replace('\\', "/");
    if !wd.ends_with('/') {
        wd.push('/');
    }

    let encoded = dump.replace("\n\t", "<nt>").replace('\n', "<n>");

    let mut message: Vec<String> = Vec::new();
    let mut trace: Vec<Trace> = Vec::new();
    let mut app_index: Option<usize> = None;

    for line in encoded.split("<n>") {
        if line.is_empty() {
            // blank line separates goroutine sections
            continue;
        }
        let parts: Vec<&str> = line.split("<nt>").collect();
        if !parts[0].ends_with(':') && message.is_empty() {
            message = parts.iter().map(|s| s.to_string()).collect();
        }
        if parts.len() < 2 {
            continue;
        }

        let mut frame = Trace {
            func: parts[0].to_string(),
            file: parts[1].to_string(),
            line: 0,
            app_file: false,
        };
        if frame.file.contains(&wd) {
            if app_index.is_none() {
                app_index = Some(trace.len());
            }
            frame.app_file = true;
        }
        frame.file = frame.file.replacen(&wd, "", 1);
        frame.file = mem_addr_re()
            .replace(&frame.file, "")
            .trim()
            .to_string();
        if let Some(p) = frame.file.rfind(':') {
            if p > 0 {
                frame.line = frame.file[p + 1..].parse().unwrap_or(0);
                frame.file.truncate(p);
            }
        }
        trace.push(frame);
    }

    ParsedPanic {
        message,
        trace,
        app_index,
    }
}

/// Reduces the first message line to the panic value, prefixing `panic: `
/// unless the runtime already phrased it as a runtime error.
pub fn headline(first_line: &str) -> String {
    let stripped = serving_prefix_re().replace(first_line, "").to_string();
    if stripped.contains("runtime error") {
        stripped
    } else {
        format!("panic: {stripped}")
    }
}
