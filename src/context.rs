use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

/// Cancellation token shared between the proxy, the watcher loop, the stdin
/// listener and the supervisor's wait loops. Cloning is cheap; all clones
/// observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct Context(Arc<(Mutex<bool>, Condvar)>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cancellation signal and wakes every thread blocked in
    /// [`Context::wait_timeout`].
    pub fn cancel(&self) {
        let (lck, cvar) = &*self.0;
        if let Ok(mut cancelled) = lck.lock() {
            *cancelled = true;
            cvar.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        let (lck, _) = &*self.0;
        lck.lock().map(|c| *c).unwrap_or(true)
    }

    /// Blocks for up to `dur`, returning early (true) when cancelled.
    pub fn wait_timeout(&self, dur: Duration) -> bool {
        let (lck, cvar) = &*self.0;
        let Ok(guard) = lck.lock() else {
            return true;
        };
        match cvar.wait_timeout_while(guard, dur, |cancelled| !*cancelled) {
            Ok((cancelled, _)) => *cancelled,
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn cancel_unblocks_waiters() {
        let ctx = Context::new();
        let waiter = ctx.clone();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(50));
        ctx.cancel();
        let started = Instant::now();
        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn timeout_without_cancel_returns_false() {
        let ctx = Context::new();
        assert!(!ctx.wait_timeout(Duration::from_millis(10)));
        assert!(!ctx.is_cancelled());
    }
}
