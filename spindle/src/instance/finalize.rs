use crate::error::{Error, LifecycleError, Result};
use crate::instance::{Instance, LifecycleState};
use crate::monitor::EventArgs;
use crate::registry::OpKind;
use crate::runtime::current_owner;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

impl Instance {
    /// Tears the instance down. Blocks until the progress loop and every
    /// in-flight operation and handler drained, then stops the pools.
    ///
    /// Refused from the instance's own workers, use
    /// [`Handle::request_finalize`](crate::Handle::request_finalize) there.
    pub fn finalize(&self) -> Result<()> {
        if current_owner() == Some(self.shared.id) {
            return Err(LifecycleError::FinalizeFromWorker.into());
        }

        self.transition(LifecycleState::Running, LifecycleState::Prefinalizing)?;
        tracing::debug!(address = %self.address(), "prefinalize");

        {
            let mut span = self.shared.monitor.begin(EventArgs::Prefinalize);
            let callbacks = std::mem::take(&mut self.shared.callbacks.lock().prefinalize);
            callbacks.into_iter().rev().for_each(|cb| cb());
            self.drain();
            span.succeed();
        }

        self.transition(LifecycleState::Prefinalizing, LifecycleState::Finalizing)?;

        {
            let mut span = self.shared.monitor.begin(EventArgs::Finalize);
            self.stop_progress();

            let callbacks = std::mem::take(&mut self.shared.callbacks.lock().finalize);
            callbacks.into_iter().rev().for_each(|cb| cb());

            let cleared = self.shared.timers.clear_callbacks();
            self.shared.rpcs.clear();
            self.shared.registry.seal();

            for pool in self.threads.iter().rev() {
                if let Err(e) = pool.shutdown() {
                    tracing::warn!(pool = pool.pool().name(), error = %e, "pool shutdown failed");
                }
            }

            tracing::debug!(cleared_timers = cleared, "instance torn down");
            span.succeed();
        }

        self.shared.monitor.shutdown();
        self.shared.engine.close();

        self.transition(LifecycleState::Finalizing, LifecycleState::Finalized)?;
        tracing::debug!(address = %self.address(), "finalized");
        Ok(())
    }

    /// Blocks until some handle calls `request_finalize`, then finalizes.
    /// Returns once the instance is finalized, whoever finalized it.
    pub fn wait_for_finalize(&self) -> Result<()> {
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            while !lifecycle.finalize_requested && lifecycle.state == LifecycleState::Running {
                self.shared.lifecycle_changed.wait(&mut lifecycle);
            }
        }

        match self.finalize() {
            Ok(()) | Err(Error::Finalized) => Ok(()),
            Err(Error::Lifecycle(LifecycleError::AlreadyFinalizing)) => {
                let mut lifecycle = self.shared.lifecycle.lock();
                while lifecycle.state != LifecycleState::Finalized {
                    self.shared.lifecycle_changed.wait(&mut lifecycle);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<()> {
        let mut lifecycle = self.shared.lifecycle.lock();
        match lifecycle.state {
            state if state == from => {
                lifecycle.state = to;
                self.shared.lifecycle_changed.notify_all();
                Ok(())
            }
            LifecycleState::Finalized => Err(Error::Finalized),
            _ => Err(LifecycleError::AlreadyFinalizing.into()),
        }
    }

    /// Waits until no network operation is registered and no handler runs.
    /// With a drain timeout, what is left is cancelled once, and abandoned if
    /// it still does not drain. Sleeps are not waited on, they are cancelled
    /// once the drain is over.
    fn drain(&self) {
        let shared = &self.shared;
        let drained = || shared.registry.outstanding() == 0 && shared.rpcs.in_flight() == 0;
        let timeout = shared.config.finalize_drain_timeout_ms.map(Duration::from_millis);
        let deadline = || timeout.and_then(|t| Instant::now().checked_add(t));

        if !shared.idle.wait_until(deadline(), drained) {
            let (ops, handlers) = (shared.registry.outstanding(), shared.rpcs.in_flight());
            tracing::warn!(ops, handlers, "drain timed out, cancelling in-flight operations");

            for op in shared.registry.cancel_all() {
                if let Err(e) = shared.engine.cancel(op) {
                    tracing::debug!(?op, error = %e, "engine cancel failed");
                }
            }

            if !shared.idle.wait_until(deadline(), drained) {
                let (ops, handlers) = (shared.registry.outstanding(), shared.rpcs.in_flight());
                tracing::warn!(ops, handlers, "abandoning work that did not drain");
            }
        }

        let sleepers = shared.registry.cancel_kind(OpKind::Sleep);
        if sleepers > 0 {
            tracing::debug!(sleepers, "cancelled pending sleeps");
        }
    }

    fn stop_progress(&self) {
        self.shared.stop_progress.store(true, Ordering::Release);
        self.shared.engine.interrupt();

        let Some(progress) = self.progress.lock().take() else {
            return;
        };
        if let Err(e) = futures::executor::block_on(progress) {
            tracing::error!(error = %e, "progress loop did not stop cleanly");
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.state() == LifecycleState::Finalized {
            return;
        }

        if let Err(e) = self.finalize() {
            tracing::error!(error = %e, "failed to finalize dropped instance");
        }
    }
}
