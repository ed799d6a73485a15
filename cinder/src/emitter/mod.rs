//! Emission of completed segment trees to a collector.
//!
//! The recorder hands every closed, sampled root segment to an [`Emitter`]
//! as a [`SegmentData`] snapshot. The stock [`DaemonEmitter`] serializes the
//! snapshot to JSON and sends it as a single UDP datagram to the local
//! collector daemon; [`InMemoryEmitter`] collects snapshots for tests.

use crate::trace::{is_false, AnnotationValue, Cause, Error, HttpMeta, Namespace, SegmentId, TraceId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::Mutex;

/// Serializable snapshot of one entity and everything below it.
///
/// Field names follow the collector daemon's JSON document; empty fields
/// are omitted so unsampled and sparsely annotated entities stay small.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SegmentData {
    /// Entity name.
    pub name: String,
    /// Entity id.
    pub id: SegmentId,
    /// Trace this entity belongs to.
    pub trace_id: TraceId,
    /// Start time as fractional epoch seconds.
    pub start_time: f64,
    /// End time as fractional epoch seconds; absent while open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    /// True while the entity has not ended.
    #[serde(skip_serializing_if = "is_false")]
    pub in_progress: bool,
    /// Parent entity (or upstream caller) id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SegmentId>,
    /// Remote/local classification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<Namespace>,
    /// Client-error flag.
    #[serde(skip_serializing_if = "is_false")]
    pub error: bool,
    /// Server-fault flag.
    #[serde(skip_serializing_if = "is_false")]
    pub fault: bool,
    /// Throttle flag.
    #[serde(skip_serializing_if = "is_false")]
    pub throttle: bool,
    /// HTTP metadata.
    #[serde(skip_serializing_if = "HttpMeta::is_empty")]
    pub http: HttpMeta,
    /// Annotations.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, AnnotationValue>,
    /// Recorded exceptions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Cause>,
    /// Child snapshots, in insertion order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subsegments: Vec<SegmentData>,
}

/// Accepts completed segment trees for delivery to a collector.
///
/// Implementations must not block request handling; failures are returned
/// to the recorder, which degrades them to logged warnings.
pub trait Emitter: Send + Sync + fmt::Debug {
    /// Serialize and send one completed segment tree.
    fn emit(&self, segment: SegmentData) -> Result<(), Error>;
}

impl<E: Emitter + ?Sized> Emitter for std::sync::Arc<E> {
    fn emit(&self, segment: SegmentData) -> Result<(), Error> {
        (**self).emit(segment)
    }
}

/// Header line prefixed to every daemon datagram.
const DAEMON_PROTOCOL_HEADER: &str = "{\"format\": \"json\", \"version\": 1}\n";

/// Sends completed segments to the local collector daemon over UDP.
#[derive(Debug)]
pub struct DaemonEmitter {
    conn: UdpSocket,
}

impl DaemonEmitter {
    /// Binds an ephemeral local socket and connects it to the daemon at
    /// `addr`, verifying the address resolves.
    pub fn new<T: ToSocketAddrs>(addr: T) -> std::io::Result<DaemonEmitter> {
        let conn = UdpSocket::bind("0.0.0.0:0")?;
        conn.connect(addr)?;
        Ok(DaemonEmitter { conn })
    }
}

impl Emitter for DaemonEmitter {
    fn emit(&self, segment: SegmentData) -> Result<(), Error> {
        let body = serde_json::to_string(&segment)?;
        let mut datagram = String::with_capacity(DAEMON_PROTOCOL_HEADER.len() + body.len());
        datagram.push_str(DAEMON_PROTOCOL_HEADER);
        datagram.push_str(&body);
        self.conn
            .send(datagram.as_bytes())
            .map_err(Error::Emit)?;
        Ok(())
    }
}

/// Collects emitted segments in memory for inspection in tests.
#[derive(Debug, Default)]
pub struct InMemoryEmitter {
    segments: Mutex<Vec<SegmentData>>,
}

impl InMemoryEmitter {
    /// Creates an empty emitter.
    pub fn new() -> Self {
        InMemoryEmitter::default()
    }

    /// Segments emitted so far.
    pub fn finished_segments(&self) -> Vec<SegmentData> {
        self.lock().clone()
    }

    /// Clears collected segments.
    pub fn reset(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SegmentData>> {
        match self.segments.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Emitter for InMemoryEmitter {
    fn emit(&self, segment: SegmentData) -> Result<(), Error> {
        self.lock().push(segment);
        Ok(())
    }
}

/// Discards every segment; installed when tracing is soft-disabled.
#[derive(Debug, Default)]
pub struct NoopEmitter;

impl Emitter for NoopEmitter {
    fn emit(&self, _segment: SegmentData) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{Entity, IdGenerator, IncrementIdGenerator, Namespace};
    use std::time::Duration;

    #[test]
    fn daemon_datagram_carries_protocol_header_and_body() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let ids = IncrementIdGenerator::new();
        let segment = Entity::new_segment(
            "emit-test",
            ids.new_trace_id(),
            None,
            ids.new_segment_id(),
            true,
        );
        Entity::new_subsegment("child", Namespace::Local, &segment, ids.new_segment_id())
            .close();
        segment.close();

        let emitter = DaemonEmitter::new(receiver.local_addr().unwrap()).unwrap();
        emitter.emit(segment.snapshot()).unwrap();

        let mut buf = [0u8; 65_000];
        let received = receiver.recv(&mut buf).unwrap();
        let datagram = std::str::from_utf8(&buf[..received]).unwrap();

        let (header, body) = datagram.split_once('\n').unwrap();
        assert_eq!(header, "{\"format\": \"json\", \"version\": 1}");

        let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(parsed["name"], "emit-test");
        assert_eq!(parsed["subsegments"][0]["name"], "child");
        assert!(parsed.get("in_progress").is_none());
    }

    #[test]
    fn snapshot_serialization_omits_empty_fields() {
        let ids = IncrementIdGenerator::new();
        let segment = Entity::new_segment(
            "sparse",
            ids.new_trace_id(),
            None,
            ids.new_segment_id(),
            true,
        );

        let open = serde_json::to_value(segment.snapshot()).unwrap();
        assert_eq!(open["in_progress"], true);
        assert!(open.get("end_time").is_none());
        assert!(open.get("http").is_none());
        assert!(open.get("error").is_none());
        assert!(open.get("subsegments").is_none());

        segment.put_http_status(429);
        segment.close();
        let closed = serde_json::to_value(segment.snapshot()).unwrap();
        assert!(closed.get("in_progress").is_none());
        assert_eq!(closed["error"], true);
        assert_eq!(closed["throttle"], true);
        assert_eq!(closed["http"]["response"]["status"], 429);
    }
}
