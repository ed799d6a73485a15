//! The trace recording API: entities, sampling, and the recorder.
//!
//! A trace is a tree of timed entities. The root [`Segment`] covers one
//! inbound request; [`Subsegment`]s nest under it for outbound calls
//! (`namespace = remote`) and captured in-process work (`namespace =
//! local`). The [`Recorder`] owns the begin/end operations, consults the
//! [`Sampler`] once per trace, and hands closed sampled trees to the
//! configured emitter.

mod capture;
mod config;
mod error;
mod header;
mod ids;
mod recorder;
mod sampler;
mod segment;

pub use capture::{Captured, FutureCaptureExt, TryCaptured};
pub use config::{Config, ContextMissing, StartupPolicy};
pub use error::Error;
pub use header::{
    extract_trace_header, inject_trace_header, SampleDecision, TraceHeader, TRACE_HEADER,
};
pub use ids::{IdGenerator, IncrementIdGenerator, RandomIdGenerator, SegmentId, TraceId};
pub use recorder::{Recorder, RecorderBuilder, Segment, Subsegment};
pub use sampler::{
    Pattern, Sampler, SamplingRequest, SamplingRule, SamplingRuleSet, DEFAULT_FIXED_TARGET,
    DEFAULT_RATE,
};
pub use segment::{
    AnnotationValue, Cause, Entity, ExceptionRecord, HttpMeta, Namespace, RequestMeta,
    ResponseMeta,
};

pub(crate) use segment::is_false;
