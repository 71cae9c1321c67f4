use crate::task::{Id, Task};
use futures::channel::oneshot;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// The task was dropped before finishing, usually at pool shutdown.
    #[error("task {0} was cancelled")]
    Cancelled(Id),

    #[error("task {0} panicked")]
    Panicked(Id),
}

/// An owned permission to await the output of a spawned task.
///
/// Dropping a `JoinHandle` detaches the task: it keeps running and its output
/// is discarded.
pub struct JoinHandle<T> {
    rx: oneshot::Receiver<T>,
    task: Arc<Task>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(rx: oneshot::Receiver<T>, task: Arc<Task>) -> Self {
        Self { rx, task }
    }

    pub fn id(&self) -> Id {
        self.task.id()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_complete()
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.task.id())
            .finish()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(output)) => Poll::Ready(Ok(output)),
            Poll::Ready(Err(oneshot::Canceled)) => {
                let id = self.task.id();
                if self.task.panicked() {
                    Poll::Ready(Err(JoinError::Panicked(id)))
                } else {
                    Poll::Ready(Err(JoinError::Cancelled(id)))
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
