use std::time::{Duration, Instant};

use super::CommandError;

const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Terminates a child by pid: SIGTERM, a bounded wait for the caller's
/// exit predicate, then SIGKILL.
pub struct ProcessTerminator {
    pid: u32,
    exit_timeout: Duration,
}

impl ProcessTerminator {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
        }
    }

    pub fn with_custom_timeout(mut self, timeout: Duration) -> Self {
        self.exit_timeout = timeout;
        self
    }

    #[cfg(target_family = "unix")]
    pub fn shutdown<F>(&self, mut is_exited: F) -> Result<(), CommandError>
    where
        F: FnMut() -> bool,
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(self.pid as i32);
        signal::kill(pid, Signal::SIGTERM)
            .map_err(|e| CommandError::SignalError(e.to_string()))?;

        let deadline = Instant::now() + self.exit_timeout;
        while Instant::now() < deadline {
            if is_exited() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        let _ = signal::kill(pid, Signal::SIGKILL);
        Ok(())
    }

    #[cfg(not(target_family = "unix"))]
    pub fn shutdown<F>(&self, _is_exited: F) -> Result<(), CommandError>
    where
        F: FnMut() -> bool,
    {
        // Non-unix children are stopped through Child::kill by the caller.
        Err(CommandError::SignalError(
            "signal shutdown unsupported on this platform".to_string(),
        ))
    }
}

#[cfg(target_family = "unix")]
#[cfg(test)]
mod tests {
    use std::process::Command;
    use std::time::Duration;

    use super::*;

    #[test]
    fn sigterm_is_enough_for_a_cooperative_child() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap 'exit 0' TERM; while true; do sleep 0.1; done")
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let terminator = ProcessTerminator::new(child.id());
        terminator
            .shutdown(|| matches!(child.try_wait(), Ok(Some(_))))
            .unwrap();

        let status = child.wait().unwrap();
        assert!(status.success());
    }

    #[test]
    fn stubborn_child_gets_sigkill() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; while true; do sleep 0.1; done")
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let terminator =
            ProcessTerminator::new(child.id()).with_custom_timeout(Duration::from_millis(300));
        terminator
            .shutdown(|| matches!(child.try_wait(), Ok(Some(_))))
            .unwrap();

        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
