//! The correlation header carried between services.
//!
//! The header rides in `x-amzn-trace-id` as a compact delimited key=value
//! list, e.g. `Root=1-58406520-a006649127e371903a2de979;Parent=4c721bf33e3caf8f;Sampled=1`,
//! and must round-trip byte-for-byte so downstream services and the
//! collector daemon agree on the trace.

use crate::propagation::{Extractor, Injector};
use crate::trace::{Entity, SegmentId, TraceId};
use once_cell::sync::Lazy;
use std::fmt;
use std::str::FromStr;

/// Name of the request header carrying the trace context.
pub const TRACE_HEADER: &str = "x-amzn-trace-id";

const HEADER_ROOT_KEY: &str = "Root";
const HEADER_PARENT_KEY: &str = "Parent";
const HEADER_SAMPLED_KEY: &str = "Sampled";

const SAMPLED: &str = "1";
const NOT_SAMPLED: &str = "0";
const REQUESTED_SAMPLE_DECISION: &str = "?";

static TRACE_HEADER_FIELD: Lazy<[String; 1]> = Lazy::new(|| [TRACE_HEADER.to_owned()]);

/// The sampling directive carried by a [`TraceHeader`].
///
/// Upstream decisions are absolute: a `Sampled` or `NotSampled` directive is
/// honored verbatim by the local sampler so that one trace is recorded
/// consistently across every service it touches. `Requested` leaves the
/// decision to this service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SampleDecision {
    /// The upstream service decided to record this trace.
    Sampled,
    /// The upstream service decided not to record this trace.
    NotSampled,
    /// No decision has been made yet; unknown directives also map here.
    #[default]
    Requested,
}

impl SampleDecision {
    fn as_str(&self) -> &'static str {
        match self {
            SampleDecision::Sampled => SAMPLED,
            SampleDecision::NotSampled => NOT_SAMPLED,
            SampleDecision::Requested => REQUESTED_SAMPLE_DECISION,
        }
    }
}

impl FromStr for SampleDecision {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            SAMPLED => SampleDecision::Sampled,
            NOT_SAMPLED => SampleDecision::NotSampled,
            _ => SampleDecision::Requested,
        })
    }
}

/// Parsed form of the correlation header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceHeader {
    /// Trace id shared by every service participating in this trace.
    pub trace_id: Option<TraceId>,
    /// Id of the segment or subsegment that issued the call.
    pub parent_id: Option<SegmentId>,
    /// Upstream sampling directive.
    pub decision: SampleDecision,
}

impl TraceHeader {
    /// Parses a header value.
    ///
    /// Parsing is lenient: unknown keys are ignored and malformed `Root` or
    /// `Parent` values clear the corresponding field rather than failing,
    /// mirroring how an unreadable header simply starts a fresh trace.
    pub fn parse(value: &str) -> TraceHeader {
        let mut header = TraceHeader::default();

        for (key, value) in value.trim().split_terminator(';').filter_map(from_key_value) {
            match key {
                HEADER_ROOT_KEY => header.trace_id = TraceId::from_hex(value).ok(),
                HEADER_PARENT_KEY => header.parent_id = SegmentId::from_hex(value).ok(),
                HEADER_SAMPLED_KEY => {
                    header.decision = value.parse().unwrap_or_default();
                }
                _ => {}
            }
        }

        header
    }

    /// Header announcing `entity` as the parent of the downstream call.
    pub fn from_entity(entity: &Entity) -> TraceHeader {
        TraceHeader {
            trace_id: Some(entity.trace_id()),
            parent_id: Some(entity.id()),
            decision: if entity.sampled() {
                SampleDecision::Sampled
            } else {
                SampleDecision::NotSampled
            },
        }
    }

    /// Header field names written by [`inject_trace_header`].
    pub fn fields() -> impl Iterator<Item = &'static str> {
        TRACE_HEADER_FIELD.iter().map(|field| field.as_str())
    }

    /// True when neither a trace id nor a parent id is present.
    pub fn is_empty(&self) -> bool {
        self.trace_id.is_none() && self.parent_id.is_none()
    }
}

impl fmt::Display for TraceHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        if let Some(trace_id) = &self.trace_id {
            write!(f, "{HEADER_ROOT_KEY}={trace_id}")?;
            wrote = true;
        }
        if let Some(parent_id) = &self.parent_id {
            if wrote {
                f.write_str(";")?;
            }
            write!(f, "{HEADER_PARENT_KEY}={parent_id}")?;
            wrote = true;
        }
        if wrote {
            f.write_str(";")?;
        }
        write!(f, "{HEADER_SAMPLED_KEY}={}", self.decision.as_str())
    }
}

/// Reads a [`TraceHeader`] out of an inbound carrier.
///
/// Returns `None` when the carrier has no usable header, which callers
/// treat as the start of a fresh trace.
pub fn extract_trace_header(extractor: &dyn Extractor) -> Option<TraceHeader> {
    let value = extractor.get(TRACE_HEADER)?;
    let header = TraceHeader::parse(value);
    if header.is_empty() && header.decision == SampleDecision::Requested {
        None
    } else {
        Some(header)
    }
}

/// Writes `header` onto an outbound carrier, byte-compatibly with
/// [`TraceHeader::parse`].
pub fn inject_trace_header(injector: &mut dyn Injector, header: &TraceHeader) {
    injector.set(TRACE_HEADER, header.to_string());
}

fn from_key_value(pair: &str) -> Option<(&str, &str)> {
    let index = pair.find('=')?;
    let (key, value) = pair.split_at(index);
    Some((key.trim(), value.trim_start_matches('=').trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn trace_id() -> TraceId {
        TraceId::from_hex("1-58406520-a006649127e371903a2de979").unwrap()
    }

    fn parent_id() -> SegmentId {
        SegmentId::from_hex("4c721bf33e3caf8f").unwrap()
    }

    #[rustfmt::skip]
    fn parse_test_data() -> Vec<(&'static str, TraceHeader)> {
        vec![
            ("", TraceHeader::default()),
            ("Sampled=1", TraceHeader { trace_id: None, parent_id: None, decision: SampleDecision::Sampled }),
            ("Root=1-bogus-bad", TraceHeader::default()),
            ("Root=1-too-many-parts", TraceHeader::default()),
            ("Root=1-58406520-a006649127e371903a2de979;Parent=garbage", TraceHeader { trace_id: Some(trace_id()), parent_id: None, decision: SampleDecision::Requested }),
            ("Root=1-58406520-a006649127e371903a2de979;Sampled=1", TraceHeader { trace_id: Some(trace_id()), parent_id: None, decision: SampleDecision::Sampled }),
            ("Root=1-58406520-a006649127e371903a2de979;Parent=4c721bf33e3caf8f;Sampled=0", TraceHeader { trace_id: Some(trace_id()), parent_id: Some(parent_id()), decision: SampleDecision::NotSampled }),
            ("Root=1-58406520-a006649127e371903a2de979;Parent=4c721bf33e3caf8f;Sampled=1", TraceHeader { trace_id: Some(trace_id()), parent_id: Some(parent_id()), decision: SampleDecision::Sampled }),
            ("Root=1-58406520-a006649127e371903a2de979;Parent=4c721bf33e3caf8f", TraceHeader { trace_id: Some(trace_id()), parent_id: Some(parent_id()), decision: SampleDecision::Requested }),
            ("Root=1-58406520-a006649127e371903a2de979;Parent=4c721bf33e3caf8f;Sampled=?", TraceHeader { trace_id: Some(trace_id()), parent_id: Some(parent_id()), decision: SampleDecision::Requested }),
            ("Root=1-58406520-a006649127e371903a2de979;Parent=4c721bf33e3caf8f;Sampled=garbage", TraceHeader { trace_id: Some(trace_id()), parent_id: Some(parent_id()), decision: SampleDecision::Requested }),
            ("Root=1-58406520-a006649127e371903a2de979;Self=1-58406520-bf42676c05e20ba4a90e448e;Parent=4c721bf33e3caf8f;Sampled=1", TraceHeader { trace_id: Some(trace_id()), parent_id: Some(parent_id()), decision: SampleDecision::Sampled }),
        ]
    }

    #[test]
    fn parse() {
        for (value, expected) in parse_test_data() {
            assert_eq!(TraceHeader::parse(value), expected, "parsing {value:?}");
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let headers = vec![
            TraceHeader {
                trace_id: Some(trace_id()),
                parent_id: Some(parent_id()),
                decision: SampleDecision::Sampled,
            },
            TraceHeader {
                trace_id: Some(trace_id()),
                parent_id: Some(parent_id()),
                decision: SampleDecision::NotSampled,
            },
            TraceHeader {
                trace_id: Some(trace_id()),
                parent_id: None,
                decision: SampleDecision::Requested,
            },
        ];

        for header in headers {
            let encoded = header.to_string();
            assert_eq!(TraceHeader::parse(&encoded), header, "decoding {encoded:?}");
            // A second encode of the decoded value must be byte-identical.
            assert_eq!(TraceHeader::parse(&encoded).to_string(), encoded);
        }
    }

    #[test]
    fn encode_format_is_byte_compatible() {
        let header = TraceHeader {
            trace_id: Some(trace_id()),
            parent_id: Some(parent_id()),
            decision: SampleDecision::Sampled,
        };
        assert_eq!(
            header.to_string(),
            "Root=1-58406520-a006649127e371903a2de979;Parent=4c721bf33e3caf8f;Sampled=1"
        );
    }

    #[test]
    fn extract_and_inject_through_a_carrier() {
        let header = TraceHeader {
            trace_id: Some(trace_id()),
            parent_id: Some(parent_id()),
            decision: SampleDecision::NotSampled,
        };

        let mut carrier: HashMap<String, String> = HashMap::new();
        inject_trace_header(&mut carrier, &header);
        assert_eq!(extract_trace_header(&carrier), Some(header));
    }

    #[test]
    fn extract_ignores_empty_carriers() {
        let carrier: HashMap<String, String> = HashMap::new();
        assert_eq!(extract_trace_header(&carrier), None);

        let mut carrier = HashMap::new();
        carrier.insert(TRACE_HEADER.to_string(), "Self=foo".to_string());
        assert_eq!(extract_trace_header(&carrier), None);
    }
}
