use crate::error::{Error, Result};
use crate::instance::Handle;
use crate::timer::{TimerAction, TimerId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) struct UserTimer {
    callback: Box<dyn Fn() + Send + Sync>,
    armed: Mutex<Option<TimerId>>,
}

impl fmt::Debug for UserTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserTimer")
            .field("armed", &*self.armed.lock())
            .finish()
    }
}

impl UserTimer {
    /// Runs the callback as a task on the handler pool, unless `id` is an
    /// expiry the timer was re-armed past.
    pub(crate) fn fire(self: Arc<Self>, id: TimerId, handle: &Handle) {
        {
            let mut armed = self.armed.lock();
            if *armed != Some(id) {
                return;
            }
            *armed = None;
        }
        handle.spawn(async move { (self.callback)() });
    }
}

impl Handle {
    /// Creates a timer that runs `callback` on the handler pool each time it
    /// is started and expires.
    pub fn timer<F>(&self, callback: F) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        Timer {
            handle: self.clone(),
            inner: Arc::new(UserTimer {
                callback: Box::new(callback),
                armed: Mutex::new(None),
            }),
        }
    }
}

/// A restartable one-shot timer. Dropping it cancels a pending expiry.
pub struct Timer {
    handle: Handle,
    inner: Arc<UserTimer>,
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl Timer {
    /// Arms the timer, replacing any pending expiry.
    ///
    /// Fails with [`Error::InvalidArg`] if `timeout` does not fit in an
    /// [`Instant`].
    pub fn start(&self, timeout: Duration) -> Result<()> {
        self.handle.check_submit()?;
        let deadline = Instant::now()
            .checked_add(timeout)
            .ok_or_else(|| Error::InvalidArg("timer timeout overflows".into()))?;

        let timers = &self.handle.shared.timers;
        let mut armed = self.inner.armed.lock();
        if let Some(previous) = armed.take() {
            timers.cancel(previous);
        }
        *armed = Some(timers.insert(
            deadline,
            TimerAction::Callback(Arc::clone(&self.inner)),
        ));
        drop(armed);

        self.handle.signal_pending();
        Ok(())
    }

    /// Returns false if the timer was not armed.
    pub fn cancel(&self) -> bool {
        match self.inner.armed.lock().take() {
            Some(id) => self.handle.shared.timers.cancel(id),
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.inner.armed.lock().is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}
