//! Pass-through byte stream that counts what it forwards.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;

use crate::error::ComposeError;

type CompletionFn = Box<dyn FnOnce(u64) + Send>;

/// Forwards every chunk unchanged while accumulating the byte count.
///
/// The completion callback fires exactly once with the bytes actually passed:
/// on natural end of the inner stream, or on drop if the consumer goes away
/// first (client disconnect). Errors pass through without affecting the count.
pub struct MeteredStream<S> {
    inner: S,
    count: u64,
    on_complete: Option<CompletionFn>,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, on_complete: impl FnOnce(u64) + Send + 'static) -> Self {
        Self {
            inner,
            count: 0,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    fn complete(&mut self) {
        if let Some(callback) = self.on_complete.take() {
            callback(self.count);
        }
    }
}

impl<S> Stream for MeteredStream<S>
where
    S: Stream<Item = Result<Bytes, ComposeError>> + Unpin,
{
    type Item = Result<Bytes, ComposeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.count += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                this.complete();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for MeteredStream<S> {
    fn drop(&mut self) {
        self.complete();
    }
}
