//! Segment-based distributed tracing for async services.
//!
//! `cinder` records one [`Segment`] per traced request and nests
//! [`Subsegment`]s under it for outbound calls and explicitly captured units
//! of work. A per-task [`Context`] tracks which entity is currently open, a
//! rule-based [`Sampler`] decides once per trace whether detail is recorded,
//! and closed segment trees are handed to an [`Emitter`] such as the UDP
//! [`DaemonEmitter`].
//!
//! # Getting started
//!
//! ```no_run
//! use cinder::{Context, FutureCaptureExt, FutureContextExt, Recorder};
//! use std::sync::Arc;
//!
//! # async fn serve() -> Result<(), cinder::Error> {
//! let recorder = Arc::new(
//!     Recorder::builder()
//!         .with_service("booking")
//!         .with_daemon_address("127.0.0.1:2000")
//!         .build()?,
//! );
//!
//! // One segment per inbound request.
//! let _segment = recorder.begin_segment("booking", None)?;
//!
//! // Fan out, handing each branch a snapshot of the current context so its
//! // subsegments attach to the segment that is open right now.
//! let branch = async { /* .. */ }
//!     .capture(recorder.clone(), "lookup")
//!     .with_context(Context::current());
//! branch.await;
//!
//! recorder.end_segment()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency model
//!
//! Contexts fork by value: wrapping a future with
//! [`FutureContextExt::with_context`] gives it an independent copy of the
//! open-entity stack (entities shared by reference), so concurrent branches
//! push and pop without disturbing their siblings while still attributing
//! new subsegments to the entity that was open at the fork point.

#![warn(missing_docs, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod context;
pub mod emitter;
pub mod instrument;
pub mod propagation;
pub mod trace;

mod internal_logging;

pub use context::{Context, ContextGuard, FutureContextExt, StreamContextExt, WithContext};
pub use emitter::{DaemonEmitter, Emitter, InMemoryEmitter, SegmentData};
pub use instrument::InstrumentationRegistry;
pub use trace::{
    AnnotationValue, Captured, Config, ContextMissing, Entity, Error, FutureCaptureExt,
    IdGenerator, IncrementIdGenerator, Namespace, Pattern, RandomIdGenerator, Recorder,
    RecorderBuilder, SampleDecision, SamplingRequest, SamplingRule, SamplingRuleSet, Sampler,
    Segment, SegmentId, StartupPolicy, Subsegment, TraceHeader, TraceId, TryCaptured,
    TRACE_HEADER,
};

#[doc(hidden)]
#[cfg(feature = "internal-logs")]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}
