use thiserror::Error;

/// Errors returned by the trace API.
///
/// Only the context-missing family (`SegmentNotFound`, `EntityAlreadyOpen`)
/// ever reaches application code, and then only under
/// [`ContextMissing::RuntimeError`](crate::ContextMissing). Everything else
/// is degraded to a logged warning inside the recorder so that tracing can
/// never alter application control flow.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An operation required an open segment or subsegment and none was
    /// found in the current context.
    #[error("no segment or subsegment is open in the current context")]
    SegmentNotFound,

    /// `begin_segment` was called while a segment is already open; root
    /// segments do not nest.
    #[error("a segment is already open in the current context")]
    EntityAlreadyOpen,

    /// The entity at the top of the current context has already ended.
    #[error("the current entity has already ended")]
    AlreadyEnded,

    /// The collector daemon address could not be resolved or connected at
    /// startup.
    #[error("trace daemon unreachable at {addr}: {source}")]
    DaemonUnreachable {
        /// The configured daemon address.
        addr: String,
        /// The probe failure.
        #[source]
        source: std::io::Error,
    },

    /// Sending a completed segment to the collector failed.
    #[error("failed to emit segment: {0}")]
    Emit(#[source] std::io::Error),

    /// A completed segment could not be serialized for emission.
    #[error("failed to serialize segment: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A trace id did not have the `1-xxxxxxxx-x{24}` form.
    #[error("invalid trace id `{0}`")]
    InvalidTraceId(String),

    /// A segment id was not 16 hex characters.
    #[error("invalid segment id `{0}`")]
    InvalidSegmentId(String),

    /// A sampling rule document failed validation.
    #[error("invalid sampling rule document: {0}")]
    InvalidRule(String),
}
