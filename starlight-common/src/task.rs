use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use tokio::task::{JoinError, JoinHandle};

/// A thin wrapper around [`tokio::task::JoinHandle`] that adds the
/// `#[must_use]` lint, so every spawned worker is either joined by the agent
/// facade's `CloseWait` or explicitly annotated as fire-and-forget.
#[must_use]
pub struct LxTask<T>(JoinHandle<T>);

impl<T> LxTask<T> {
    pub fn spawn<F>(future: F) -> LxTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        Self(tokio::spawn(future))
    }
}

impl<T> Future for LxTask<T> {
    type Output = Result<T, JoinError>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}
