use std::io::{Read, Write};
use std::thread::{self, JoinHandle};

/// Marker the child's HTTP server prints when a handler panics mid-request.
pub const PANIC_MARKER: &str = "http: panic serving";

const BANNER_OPEN: &[u8] = b"----------- Application Error -----------\n";
const BANNER_CLOSE: &[u8] = b"-----------------------------------------\n";

/// Pumps a child's stderr into `out` verbatim, except that any chunk
/// containing [`PANIC_MARKER`] is first handed to `on_panic` (which stores
/// it as the supervisor's last runtime error) and framed between banner
/// lines so it stands out on the terminal.
///
/// The scan is deliberately chunk-based and dumb: the child's output is
/// diagnostic text, not a protocol.
pub fn pump<R, W, F>(mut input: R, mut out: W, on_panic: F)
where
    R: Read,
    W: Write,
    F: Fn(String),
{
    let mut buf = [0u8; 8192];
    loop {
        match input.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                let text = String::from_utf8_lossy(chunk);
                if text.contains(PANIC_MARKER) {
                    on_panic(text.to_string());
                    let _ = out.write_all(BANNER_OPEN);
                    let _ = out.write_all(chunk);
                    let _ = out.write_all(BANNER_CLOSE);
                } else {
                    let _ = out.write_all(chunk);
                }
                let _ = out.flush();
            }
        }
    }
}

/// Runs [`pump`] against the parent's own stderr on a background thread.
pub fn spawn_capturer<R, F>(input: R, on_panic: F) -> JoinHandle<()>
where
    R: Read + Send + 'static,
    F: Fn(String) + Send + 'static,
{
    thread::spawn(move || pump(input, std::io::stderr(), on_panic))
}
