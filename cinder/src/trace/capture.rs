//! Wrapping arbitrary units of work in a subsegment.
//!
//! [`Recorder::capture`] and [`Recorder::try_capture`] bracket a closure;
//! [`FutureCaptureExt`] brackets a future with identical semantics — the
//! subsegment opens at the first poll, stays open across suspension and
//! closes on completion. In every variant the close is tied to scope exit:
//! an early return, a panic unwind or a cancelled future still closes the
//! subsegment (as a fault) instead of leaking it into the emitted tree.

use crate::cinder_warn;
use crate::context::Context;
use crate::trace::{Entity, Namespace, Recorder};
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

/// An open capture subsegment that guarantees close-on-exit.
///
/// Dropping the scope without [`finish`](CaptureScope::finish) closes the
/// subsegment as a fault; this is what turns cancellation and unwinding
/// into a closed, marked entity rather than a dangling one.
#[derive(Debug)]
struct CaptureScope {
    entity: Option<Arc<Entity>>,
}

impl CaptureScope {
    /// Opens a subsegment named `name` under the current entity.
    ///
    /// Capture never alters application control flow, so an unavailable
    /// context degrades to an untraced scope regardless of the
    /// context-missing policy.
    fn enter(recorder: &Recorder, name: &str) -> CaptureScope {
        let entity = match recorder.begin_subsegment(name, Namespace::Local) {
            Ok(Some(subsegment)) => Some(subsegment.entity().clone()),
            Ok(None) => None,
            Err(err) => {
                cinder_warn!(name: "Capture.Untraced", message = err.to_string());
                None
            }
        };
        CaptureScope { entity }
    }

    /// Closes the subsegment normally.
    fn finish(mut self) {
        if let Some(entity) = self.entity.take() {
            entity.close();
            Context::unwind_active(&entity);
        }
    }

    /// Records `err`, then closes the subsegment.
    fn fail<E>(mut self, err: &E, max_depth: usize)
    where
        E: std::error::Error + ?Sized,
    {
        if let Some(entity) = self.entity.take() {
            entity.add_exception(err, max_depth, false);
            entity.close();
            Context::unwind_active(&entity);
        }
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        if let Some(entity) = self.entity.take() {
            entity.set_fault();
            entity.close();
            Context::unwind_active(&entity);
        }
    }
}

impl Recorder {
    /// Runs `f` inside a subsegment named `name`.
    ///
    /// The subsegment's open interval exactly brackets the call; a panic
    /// unwinding through the closure closes it as a fault.
    pub fn capture<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let scope = CaptureScope::enter(self, name);
        let output = f();
        scope.finish();
        output
    }

    /// Runs `f` inside a subsegment named `name`, recording an `Err` as an
    /// exception before closing. The result is returned unchanged either
    /// way.
    pub fn try_capture<T, E>(&self, name: &str, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: std::error::Error + 'static,
    {
        let scope = CaptureScope::enter(self, name);
        match f() {
            Ok(output) => {
                scope.finish();
                Ok(output)
            }
            Err(err) => {
                scope.fail(&err, self.max_cause_depth());
                Err(err)
            }
        }
    }
}

pin_project! {
    /// Future returned by [`FutureCaptureExt::capture`].
    #[derive(Debug)]
    #[must_use = "futures do nothing unless polled"]
    pub struct Captured<F> {
        #[pin]
        inner: F,
        recorder: Arc<Recorder>,
        name: String,
        scope: Option<CaptureScope>,
        started: bool,
    }
}

impl<F: Future> Future for Captured<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if !*this.started {
            *this.started = true;
            *this.scope = Some(CaptureScope::enter(this.recorder, this.name));
        }
        match this.inner.poll(task_cx) {
            Poll::Ready(output) => {
                if let Some(scope) = this.scope.take() {
                    scope.finish();
                }
                Poll::Ready(output)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

pin_project! {
    /// Future returned by [`FutureCaptureExt::try_capture`].
    #[derive(Debug)]
    #[must_use = "futures do nothing unless polled"]
    pub struct TryCaptured<F> {
        #[pin]
        inner: F,
        recorder: Arc<Recorder>,
        name: String,
        scope: Option<CaptureScope>,
        started: bool,
    }
}

impl<F, T, E> Future for TryCaptured<F>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if !*this.started {
            *this.started = true;
            *this.scope = Some(CaptureScope::enter(this.recorder, this.name));
        }
        match this.inner.poll(task_cx) {
            Poll::Ready(output) => {
                if let Some(scope) = this.scope.take() {
                    match &output {
                        Ok(_) => scope.finish(),
                        Err(err) => scope.fail(err, this.recorder.max_cause_depth()),
                    }
                }
                Poll::Ready(output)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<F: Future> FutureCaptureExt for F {}

/// Extension trait wrapping a future in a subsegment.
pub trait FutureCaptureExt: Sized + Future {
    /// Brackets this future with a subsegment named `name`.
    ///
    /// The subsegment opens in the context current at the first poll and
    /// closes when the future completes. Dropping the wrapper while the
    /// subsegment is open — cancellation — closes it as a fault.
    fn capture(self, recorder: Arc<Recorder>, name: impl Into<String>) -> Captured<Self> {
        Captured {
            inner: self,
            recorder,
            name: name.into(),
            scope: None,
            started: false,
        }
    }

    /// Like [`capture`](FutureCaptureExt::capture), additionally recording
    /// an `Err` output as an exception before closing. The output is passed
    /// through unchanged.
    fn try_capture<T, E>(
        self,
        recorder: Arc<Recorder>,
        name: impl Into<String>,
    ) -> TryCaptured<Self>
    where
        Self: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        TryCaptured {
            inner: self,
            recorder,
            name: name.into(),
            scope: None,
            started: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::InMemoryEmitter;
    use crate::trace::RecorderBuilder;

    fn recorder() -> Recorder {
        RecorderBuilder::default()
            .with_service("capture-test")
            .with_sampling(false)
            .with_emitter(InMemoryEmitter::new())
            .build()
            .unwrap()
    }

    #[derive(Debug, thiserror::Error)]
    #[error("lookup failed")]
    struct LookupError;

    #[test]
    fn capture_brackets_the_closure()  {
        let recorder = recorder();
        let segment = recorder.begin_segment("test", None).unwrap().unwrap();

        let out = recorder.capture("unit", || {
            let current = recorder.current_subsegment().unwrap();
            assert_eq!(current.name(), "unit");
            assert!(current.in_progress());
            21 * 2
        });
        assert_eq!(out, 42);

        let children = segment.children();
        assert_eq!(children.len(), 1);
        assert!(!children[0].in_progress());
        assert!(!children[0].fault());
        recorder.end_segment().unwrap();
    }

    #[test]
    fn try_capture_records_the_error_and_returns_it_unchanged() {
        let recorder = recorder();
        let segment = recorder.begin_segment("test", None).unwrap().unwrap();

        let out: Result<(), LookupError> =
            recorder.try_capture("lookup", || Err(LookupError));
        assert!(matches!(out, Err(LookupError)));

        let child = &segment.children()[0];
        assert!(child.fault());
        assert_eq!(child.cause()[0].message, "lookup failed");
        assert_eq!(child.cause()[0].kind, "LookupError");
        recorder.end_segment().unwrap();
    }

    #[test]
    fn capture_without_a_segment_still_runs_the_body() {
        let recorder = recorder();
        assert_eq!(recorder.capture("untraced", || 7), 7);
    }

    #[test]
    fn panicking_capture_closes_the_subsegment_as_a_fault() {
        let recorder = recorder();
        let segment = recorder.begin_segment("test", None).unwrap().unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            recorder.capture("exploding", || panic!("boom"))
        }));
        assert!(result.is_err());

        let child = &segment.children()[0];
        assert!(!child.in_progress());
        assert!(child.fault());
        // The stack is clean again: new subsegments attach to the segment.
        assert_eq!(
            recorder.current_entity().unwrap().id(),
            segment.id()
        );
        recorder.end_segment().unwrap();
    }

    #[tokio::test]
    async fn cancelled_capture_closes_the_subsegment_as_a_fault() {
        let recorder = Arc::new(recorder());
        let segment = recorder.begin_segment("test", None).unwrap().unwrap();

        let mut wrapped = Box::pin(
            std::future::pending::<()>().capture(recorder.clone(), "cancelled"),
        );
        // One poll opens the subsegment; dropping the future cancels it.
        let _ = futures_util::poll!(wrapped.as_mut());
        assert_eq!(segment.child_count(), 1);
        drop(wrapped);

        let child = &segment.children()[0];
        assert!(!child.in_progress());
        assert!(child.fault());
        recorder.end_segment().unwrap();
    }
}
