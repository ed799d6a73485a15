//! In-memory trace-tree entities.
//!
//! A trace is a tree of [`Entity`] nodes: one root segment per inbound
//! request, subsegments below it. Entities are shared by reference between
//! forked contexts, so all mutable state sits behind a mutex and children
//! are append-only — concurrent branches may both hold the same parent open
//! but only ever add new children to it, never rewrite what a sibling wrote.

use crate::emitter::SegmentData;
use crate::trace::ids::with_rng;
use crate::trace::{SegmentId, TraceId};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// Classifies a subsegment as representing a network call or in-process
/// work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// The subsegment brackets a call to another service.
    Remote,
    /// The subsegment brackets in-process work.
    Local,
}

/// A scalar annotation value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AnnotationValue {
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Float value.
    Float(f64),
    /// String value.
    String(String),
}

impl From<bool> for AnnotationValue {
    fn from(value: bool) -> Self {
        AnnotationValue::Bool(value)
    }
}

impl From<i64> for AnnotationValue {
    fn from(value: i64) -> Self {
        AnnotationValue::Int(value)
    }
}

impl From<f64> for AnnotationValue {
    fn from(value: f64) -> Self {
        AnnotationValue::Float(value)
    }
}

impl From<&str> for AnnotationValue {
    fn from(value: &str) -> Self {
        AnnotationValue::String(value.to_string())
    }
}

impl From<String> for AnnotationValue {
    fn from(value: String) -> Self {
        AnnotationValue::String(value)
    }
}

/// HTTP metadata recorded on an entity.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HttpMeta {
    /// Request-side fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestMeta>,
    /// Response-side fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseMeta>,
}

impl HttpMeta {
    /// True when no field has been recorded.
    pub fn is_empty(&self) -> bool {
        self.request.is_none() && self.response.is_none()
    }

    fn request_mut(&mut self) -> &mut RequestMeta {
        self.request.get_or_insert_with(RequestMeta::default)
    }

    fn response_mut(&mut self) -> &mut ResponseMeta {
        self.response.get_or_insert_with(ResponseMeta::default)
    }
}

/// Request-side HTTP metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RequestMeta {
    /// Request method.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request url, without the query string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Address of the calling client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    /// Client user agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Response-side HTTP metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ResponseMeta {
    /// Response status code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Response body length, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
}

/// One recorded exception.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExceptionRecord {
    /// Random identifier for cross-referencing.
    pub id: SegmentId,
    /// Rendered error message.
    pub message: String,
    /// Short error type name.
    #[serde(rename = "type")]
    pub kind: String,
    /// True when the error came back from a downstream service.
    #[serde(skip_serializing_if = "is_false")]
    pub remote: bool,
}

impl ExceptionRecord {
    fn new(message: String, kind: &str, remote: bool) -> Self {
        ExceptionRecord {
            id: SegmentId::from(with_rng(|rng| rng.gen::<u64>())),
            message,
            kind: kind.to_string(),
            remote,
        }
    }
}

/// The structured exception list recorded on a faulted entity.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Cause {
    /// Recorded exceptions, outermost first.
    pub exceptions: Vec<ExceptionRecord>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntityKind {
    Segment,
    Subsegment,
}

/// One node of the trace tree.
///
/// The identity fields (ids, name, sampled flag, parent linkage) are fixed
/// at creation and never change; everything else lives behind a mutex. An
/// unsampled entity keeps its place in the tree but silently drops
/// annotations, HTTP metadata and exceptions so unsampled requests cost as
/// little as possible.
#[derive(Debug)]
pub struct Entity {
    id: SegmentId,
    trace_id: TraceId,
    name: String,
    sampled: bool,
    parent_id: Option<SegmentId>,
    kind: EntityKind,
    state: Mutex<EntityState>,
}

#[derive(Debug)]
struct EntityState {
    start_time: SystemTime,
    end_time: Option<SystemTime>,
    namespace: Option<Namespace>,
    http: HttpMeta,
    annotations: BTreeMap<String, AnnotationValue>,
    error: bool,
    fault: bool,
    throttle: bool,
    cause: Vec<ExceptionRecord>,
    children: Vec<Arc<Entity>>,
}

impl EntityState {
    fn open() -> Self {
        EntityState {
            start_time: SystemTime::now(),
            end_time: None,
            namespace: None,
            http: HttpMeta::default(),
            annotations: BTreeMap::new(),
            error: false,
            fault: false,
            throttle: false,
            cause: Vec::new(),
            children: Vec::new(),
        }
    }
}

impl Entity {
    pub(crate) fn new_segment(
        name: impl Into<String>,
        trace_id: TraceId,
        parent_id: Option<SegmentId>,
        id: SegmentId,
        sampled: bool,
    ) -> Arc<Entity> {
        Arc::new(Entity {
            id,
            trace_id,
            name: name.into(),
            sampled,
            parent_id,
            kind: EntityKind::Segment,
            state: Mutex::new(EntityState::open()),
        })
    }

    /// Creates a subsegment under `parent` and appends it to the parent's
    /// child collection. The child inherits the parent's trace id and
    /// sampling flag; its parent linkage never changes afterwards.
    pub(crate) fn new_subsegment(
        name: impl Into<String>,
        namespace: Namespace,
        parent: &Arc<Entity>,
        id: SegmentId,
    ) -> Arc<Entity> {
        let child = Arc::new(Entity {
            id,
            trace_id: parent.trace_id,
            name: name.into(),
            sampled: parent.sampled,
            parent_id: Some(parent.id),
            kind: EntityKind::Subsegment,
            state: Mutex::new(EntityState::open()),
        });
        child.with_state(|state| state.namespace = Some(namespace));
        parent.add_child(child.clone());
        child
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut EntityState) -> T) -> T {
        let mut guard: MutexGuard<'_, EntityState> = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Runs `f` against the mutable state only when this entity is sampled.
    fn with_sampled_state<T>(&self, f: impl FnOnce(&mut EntityState) -> T) -> Option<T> {
        if !self.sampled {
            return None;
        }
        Some(self.with_state(f))
    }

    /// Id of this entity.
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Trace this entity belongs to.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Entity name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether detail is recorded for this entity. Fixed at creation.
    pub fn sampled(&self) -> bool {
        self.sampled
    }

    /// Parent id: the upstream caller's id for a root segment, the owning
    /// entity's id for a subsegment.
    pub fn parent_id(&self) -> Option<SegmentId> {
        self.parent_id
    }

    /// True for a root segment.
    pub fn is_segment(&self) -> bool {
        self.kind == EntityKind::Segment
    }

    /// True for a subsegment.
    pub fn is_subsegment(&self) -> bool {
        self.kind == EntityKind::Subsegment
    }

    /// True while the entity has not ended.
    pub fn in_progress(&self) -> bool {
        self.with_state(|state| state.end_time.is_none())
    }

    /// Closes the entity, setting its end time exactly once. Returns false
    /// when the entity had already ended, in which case nothing changes.
    pub fn close(&self) -> bool {
        self.with_state(|state| {
            if state.end_time.is_some() {
                return false;
            }
            state.end_time = Some(SystemTime::now());
            true
        })
    }

    /// Appends a child entity. Children are insertion-ordered and never
    /// removed; concurrent branches only ever append.
    pub(crate) fn add_child(&self, child: Arc<Entity>) {
        self.with_state(|state| state.children.push(child));
    }

    /// Snapshot of the child list.
    pub fn children(&self) -> Vec<Arc<Entity>> {
        self.with_state(|state| state.children.clone())
    }

    /// Number of children.
    pub fn child_count(&self) -> usize {
        self.with_state(|state| state.children.len())
    }

    /// Namespace of this entity, when one was recorded.
    pub fn namespace(&self) -> Option<Namespace> {
        self.with_state(|state| state.namespace)
    }

    /// Reclassifies the entity, e.g. flipping an outbound call that failed
    /// before leaving the host to [`Namespace::Local`].
    pub fn set_namespace(&self, namespace: Namespace) {
        self.with_sampled_state(|state| state.namespace = Some(namespace));
    }

    /// Records an annotation on a sampled entity.
    pub fn put_annotation(&self, key: impl Into<String>, value: impl Into<AnnotationValue>) {
        self.with_sampled_state(|state| state.annotations.insert(key.into(), value.into()));
    }

    /// Reads back an annotation.
    pub fn annotation(&self, key: &str) -> Option<AnnotationValue> {
        self.with_state(|state| state.annotations.get(key).cloned())
    }

    /// Records the request method.
    pub fn put_http_method(&self, method: impl Into<String>) {
        self.with_sampled_state(|state| state.http.request_mut().method = Some(method.into()));
    }

    /// Records the request url.
    pub fn put_http_url(&self, url: impl Into<String>) {
        self.with_sampled_state(|state| state.http.request_mut().url = Some(url.into()));
    }

    /// Records the calling client address.
    pub fn put_http_client_ip(&self, client_ip: impl Into<String>) {
        self.with_sampled_state(|state| state.http.request_mut().client_ip = Some(client_ip.into()));
    }

    /// Records the client user agent.
    pub fn put_http_user_agent(&self, user_agent: impl Into<String>) {
        self.with_sampled_state(|state| {
            state.http.request_mut().user_agent = Some(user_agent.into())
        });
    }

    /// Records the response status and derives the error flags from it:
    /// client errors mark `error` (429 also marks `throttle`), server
    /// errors mark `fault`.
    pub fn put_http_status(&self, status: u16) {
        self.with_sampled_state(|state| {
            state.http.response_mut().status = Some(status);
            match status {
                429 => {
                    state.error = true;
                    state.throttle = true;
                }
                400..=499 => state.error = true,
                500..=599 => state.fault = true,
                _ => {}
            }
        });
    }

    /// Records the response content length.
    pub fn put_http_content_length(&self, content_length: u64) {
        self.with_sampled_state(|state| {
            state.http.response_mut().content_length = Some(content_length)
        });
    }

    /// Recorded response status, if any.
    pub fn http_status(&self) -> Option<u16> {
        self.with_state(|state| state.http.response.as_ref().and_then(|r| r.status))
    }

    /// Records `err` and its `source()` chain, bounded to `max_depth`
    /// records, and marks the entity faulted. `remote` flags errors that
    /// came back from a downstream service.
    pub fn add_exception<E>(&self, err: &E, max_depth: usize, remote: bool)
    where
        E: std::error::Error + ?Sized,
    {
        self.with_sampled_state(|state| {
            state.fault = true;
            state.cause.push(ExceptionRecord::new(
                err.to_string(),
                short_type_name(std::any::type_name_of_val(err)),
                remote,
            ));
            let mut source = err.source();
            while let Some(cause) = source {
                if state.cause.len() >= max_depth.max(1) {
                    break;
                }
                state.cause.push(ExceptionRecord::new(
                    cause.to_string(),
                    short_type_name(std::any::type_name_of_val(cause)),
                    false,
                ));
                source = cause.source();
            }
        });
    }

    /// Marks the entity faulted without an exception record, e.g. when a
    /// captured unit of work is cancelled while its subsegment is open.
    pub fn set_fault(&self) {
        self.with_sampled_state(|state| state.fault = true);
    }

    /// Client-error flag.
    pub fn error(&self) -> bool {
        self.with_state(|state| state.error)
    }

    /// Server-fault flag.
    pub fn fault(&self) -> bool {
        self.with_state(|state| state.fault)
    }

    /// Throttle flag.
    pub fn throttle(&self) -> bool {
        self.with_state(|state| state.throttle)
    }

    /// Recorded exceptions.
    pub fn cause(&self) -> Vec<ExceptionRecord> {
        self.with_state(|state| state.cause.clone())
    }

    /// Serializable snapshot of this entity and everything below it.
    pub fn snapshot(&self) -> SegmentData {
        self.with_state(|state| SegmentData {
            name: self.name.clone(),
            id: self.id,
            trace_id: self.trace_id,
            start_time: epoch_seconds(state.start_time),
            end_time: state.end_time.map(epoch_seconds),
            in_progress: state.end_time.is_none(),
            parent_id: self.parent_id,
            namespace: state.namespace,
            error: state.error,
            fault: state.fault,
            throttle: state.throttle,
            http: state.http.clone(),
            annotations: state.annotations.clone(),
            cause: if state.cause.is_empty() {
                None
            } else {
                Some(Cause {
                    exceptions: state.cause.clone(),
                })
            },
            subsegments: state.children.iter().map(|child| child.snapshot()).collect(),
        })
    }
}

pub(crate) fn is_false(value: &bool) -> bool {
    !*value
}

fn epoch_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

fn short_type_name(full: &str) -> &str {
    full.rsplit("::").next().unwrap_or(full)
}
