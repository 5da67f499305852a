pub mod channel;

/// Stream of output lines captured from a supervised child process.
#[derive(Debug)]
pub enum OutputEvent {
    Stdout(String),
    Stderr(String),
}
