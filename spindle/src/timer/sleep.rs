use crate::error::Result;
use crate::instance::Handle;
use crate::monitor::{EventArgs, MonitorSpan};
use crate::registry::{OpKind, Operation};
use crate::task;
use crate::timer::TimerAction;
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

impl Handle {
    /// Suspends the calling task for at least `duration`. Resolution is
    /// bounded by how often the progress loop runs.
    ///
    /// A duration too large to be represented never expires. Such a sleep
    /// ends when the instance finalizes, with [`Error::Cancelled`].
    ///
    /// Fails with [`Error::Finalizing`] once finalize started, unless called
    /// from a handler still being drained. Pending sleeps are cancelled when
    /// the drain completes.
    ///
    /// [`Error::Cancelled`]: crate::Error::Cancelled
    /// [`Error::Finalizing`]: crate::Error::Finalizing
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep::new(self.clone(), Instant::now().checked_add(duration), duration)
    }

    pub fn sleep_until(&self, deadline: Instant) -> Sleep {
        let duration = deadline.saturating_duration_since(Instant::now());
        Sleep::new(self.clone(), Some(deadline), duration)
    }

    /// Handlers may keep sleeping while the instance drains them, anything
    /// else is new work.
    fn check_sleep(&self) -> Result<()> {
        match task::try_id() {
            Some(current) if self.shared.rpcs.is_handler_task(current) => self.check_respond(),
            _ => self.check_submit(),
        }
    }
}

#[derive(Debug)]
enum State {
    /// Nothing registered until the first poll.
    Init,
    Waiting(Operation),
    /// A zero-length sleep gave its worker away once.
    Yielded,
    Done,
}

/// Future returned by [`Handle::sleep`].
#[pin_project]
#[must_use = "futures do nothing unless polled"]
pub struct Sleep {
    handle: Handle,
    deadline: Option<Instant>,
    duration: Duration,
    state: State,
    span: Option<MonitorSpan>,
}

impl Sleep {
    fn new(handle: Handle, deadline: Option<Instant>, duration: Duration) -> Self {
        Self {
            handle,
            deadline,
            duration,
            state: State::Init,
            span: None,
        }
    }

    /// `None` for a sleep that never expires.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        loop {
            match this.state {
                State::Init => {
                    *this.span = Some(this.handle.shared.monitor.begin(EventArgs::Sleep {
                        timeout_ms: this.duration.as_secs_f64() * 1000.0,
                    }));

                    if this.duration.is_zero() {
                        if let Err(e) = this.handle.check_sleep() {
                            return finish(this.state, this.span, Err(e));
                        }
                        *this.state = State::Yielded;
                        cx.waker().wake_by_ref();
                        return Poll::Pending;
                    }

                    let shared = &this.handle.shared;
                    let key = match shared.registry.register(OpKind::Sleep) {
                        Ok(key) => key,
                        Err(e) => return finish(this.state, this.span, Err(e)),
                    };
                    let op = this.handle.operation(key);

                    // Registered before the check: either finalize cancels this
                    // sleep after its drain, or the check sees finalize.
                    if let Err(e) = this.handle.check_sleep() {
                        drop(op);
                        return finish(this.state, this.span, Err(e));
                    }

                    if let Some(deadline) = *this.deadline {
                        let timer = shared.timers.insert(deadline, TimerAction::Wake(key));
                        shared.registry.attach_timer(key, timer);
                    }
                    *this.state = State::Waiting(op);
                    this.handle.signal_pending();
                }
                State::Waiting(op) => {
                    let res = std::task::ready!(Pin::new(op).poll(cx));
                    return finish(this.state, this.span, res.map(|_| ()));
                }
                State::Yielded => return finish(this.state, this.span, Ok(())),
                State::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

fn finish(state: &mut State, span: &mut Option<MonitorSpan>, res: Result<()>) -> Poll<Result<()>> {
    *state = State::Done;
    if let Some(mut span) = span.take() {
        span.set_outcome(&res);
    }
    Poll::Ready(res)
}
