use std::sync::{Condvar, Mutex};

/// A once-latch that re-arms itself after every completed critical section.
///
/// The first caller of [`ResettableLatch::coalesce`] becomes the leader and
/// runs the closure; callers arriving while the leader is inside the closure
/// do not run anything and instead block until the leader finishes, then
/// observe the leader's result. Once the leader is done the latch accepts a
/// fresh leader, so two serial bursts execute twice.
///
/// This is what turns a burst of N concurrent restart/build requests into a
/// single build while keeping every caller informed of the outcome.
pub struct ResettableLatch<T> {
    state: Mutex<Inner<T>>,
    done: Condvar,
}

struct Inner<T> {
    busy: bool,
    generation: u64,
    last: Option<T>,
}

impl<T: Clone> ResettableLatch<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Inner {
                busy: false,
                generation: 0,
                last: None,
            }),
            done: Condvar::new(),
        }
    }

    /// Runs `f` as the leader, or waits for the in-flight leader and returns
    /// its result.
    pub fn coalesce<F>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.busy {
            let entered_at = guard.generation;
            while guard.busy && guard.generation == entered_at {
                guard = match self.done.wait(guard) {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
            if let Some(last) = guard.last.clone() {
                return last;
            }
            // The leader panicked and left no result; fall through and lead.
        }
        guard.busy = true;
        drop(guard);

        let release = Release { latch: self };
        let out = f();
        std::mem::forget(release);

        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.busy = false;
        guard.generation += 1;
        guard.last = Some(out.clone());
        self.done.notify_all();
        out
    }

    fn release_on_unwind(&self) {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.busy = false;
        guard.generation += 1;
        guard.last = None;
        self.done.notify_all();
    }
}

impl<T: Clone> Default for ResettableLatch<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-arms the latch if the leader's closure unwinds, so waiting followers
/// are not stranded behind a permanently-busy latch.
struct Release<'a, T: Clone> {
    latch: &'a ResettableLatch<T>,
}

impl<T: Clone> Drop for Release<'_, T> {
    fn drop(&mut self) {
        self.latch.release_on_unwind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn burst_coalesces_into_one_execution() {
        let latch = Arc::new(ResettableLatch::new());
        let executions = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(10));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let latch = latch.clone();
            let executions = executions.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                latch.coalesce(|| {
                    executions.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(300));
                    7usize
                })
            }));
        }

        let results: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(1, executions.load(Ordering::SeqCst));
        assert!(results.iter().all(|r| *r == 7));
    }

    #[test]
    fn serial_bursts_execute_twice() {
        let latch = ResettableLatch::new();
        let executions = AtomicUsize::new(0);

        latch.coalesce(|| {
            executions.fetch_add(1, Ordering::SeqCst);
        });
        latch.coalesce(|| {
            executions.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(2, executions.load(Ordering::SeqCst));
    }

    #[test]
    fn followers_observe_leader_error() {
        let latch = Arc::new(ResettableLatch::<Result<(), String>>::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let barrier = Arc::new(Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let latch = latch.clone();
            let executions = executions.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                latch.coalesce(|| {
                    executions.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(300));
                    Err::<(), String>("build failed".to_string())
                })
            }));
        }

        for handle in handles {
            assert_eq!(Err("build failed".to_string()), handle.join().unwrap());
        }
        assert_eq!(1, executions.load(Ordering::SeqCst));
    }
}
