use crate::Context;
use futures_core::Stream;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::Context as TaskContext;
use std::task::Poll;

pin_project! {
    /// A future or stream that owns the trace context of one unit of work.
    ///
    /// The stored context is installed as current for the duration of every
    /// poll and captured back (with any pushes and pops the poll made) when
    /// the poll returns, so the unit's open-entity stack survives suspension
    /// without leaking into whatever is polled next on the thread.
    #[derive(Debug)]
    pub struct WithContext<T> {
        #[pin]
        inner: T,
        trace_cx: Option<Context>,
    }
}

impl<T: std::future::Future> std::future::Future for WithContext<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let guard = this.trace_cx.take().unwrap_or_default().attach();
        let poll = this.inner.poll(task_cx);
        *this.trace_cx = Some(guard.detach());
        poll
    }
}

impl<T: Stream> Stream for WithContext<T> {
    type Item = T::Item;

    fn poll_next(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let guard = this.trace_cx.take().unwrap_or_default().attach();
        let poll = this.inner.poll_next(task_cx);
        *this.trace_cx = Some(guard.detach());
        poll
    }
}

impl<F: std::future::Future> FutureContextExt for F {}

/// Extension trait attaching a forked trace context to a future.
pub trait FutureContextExt: Sized {
    /// Attaches the provided [`Context`] snapshot to this future, returning
    /// a [`WithContext`] wrapper.
    ///
    /// This is the fork-for-child-task operation: apply it at the point the
    /// future is handed to the executor (or to a gather/join combinator) so
    /// the context is current from the child's first instruction.
    fn with_context(self, trace_cx: Context) -> WithContext<Self> {
        WithContext {
            inner: self,
            trace_cx: Some(trace_cx),
        }
    }

    /// Attaches a snapshot of the caller's current [`Context`] to this
    /// future, returning a [`WithContext`] wrapper.
    fn with_current_context(self) -> WithContext<Self> {
        self.with_context(Context::current())
    }
}

impl<S: Stream> StreamContextExt for S {}

/// Extension trait attaching a forked trace context to a stream.
pub trait StreamContextExt: Sized {
    /// Attaches the provided [`Context`] snapshot to this stream, returning
    /// a [`WithContext`] wrapper.
    ///
    /// The attached context is current while the stream is being polled.
    fn with_context(self, trace_cx: Context) -> WithContext<Self> {
        WithContext {
            inner: self,
            trace_cx: Some(trace_cx),
        }
    }

    /// Attaches a snapshot of the caller's current [`Context`] to this
    /// stream, returning a [`WithContext`] wrapper.
    fn with_current_context(self) -> WithContext<Self> {
        self.with_context(Context::current())
    }
}
