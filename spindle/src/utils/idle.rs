use parking_lot::{Condvar, Mutex};
use std::time::Instant;

/// Wakes a thread waiting for counters owned elsewhere to drop to zero.
///
/// Owners update their counter first and call [`notify`](IdleSignal::notify)
/// after. The waiter evaluates its condition under the same lock it sleeps on,
/// so an update racing with the check is never missed.
#[derive(Debug, Default)]
pub(crate) struct IdleSignal {
    lock: Mutex<()>,
    changed: Condvar,
}

impl IdleSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Must not be called while holding a lock `idle` takes.
    pub(crate) fn notify(&self) {
        let _guard = self.lock.lock();
        self.changed.notify_all();
    }

    /// Blocks until `idle` holds. Returns false if `deadline` passed first.
    pub(crate) fn wait_until<F: Fn() -> bool>(&self, deadline: Option<Instant>, idle: F) -> bool {
        let mut guard = self.lock.lock();
        loop {
            if idle() {
                return true;
            }

            match deadline {
                Some(at) => {
                    if self.changed.wait_until(&mut guard, at).timed_out() {
                        return idle();
                    }
                }
                None => self.changed.wait(&mut guard),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wakes_when_counter_drops_to_zero() {
        let signal = Arc::new(IdleSignal::new());
        let count = Arc::new(AtomicUsize::new(1));

        let releaser = {
            let (signal, count) = (Arc::clone(&signal), Arc::clone(&count));
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                count.store(0, Ordering::Release);
                signal.notify();
            })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(signal.wait_until(Some(deadline), || count.load(Ordering::Acquire) == 0));
        assert!(Instant::now() < deadline);
        releaser.join().unwrap();
    }

    #[test]
    fn test_deadline_passes_while_busy() {
        let signal = IdleSignal::new();
        let deadline = Instant::now() + Duration::from_millis(5);
        assert!(!signal.wait_until(Some(deadline), || false));
    }
}
