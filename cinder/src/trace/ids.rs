//! Trace and segment identifiers.

use crate::trace::Error;
use rand::{rngs, Rng, SeedableRng};
use serde::{Serialize, Serializer};
use std::cell::RefCell;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifies one distributed trace across every service it touches.
///
/// The textual form is three hyphen-separated fields: the version (always
/// `1`), the start time of the original request as 8 hex digits of Unix
/// epoch seconds, and a 96-bit globally unique identifier as 24 hex digits.
/// For example `1-58406520-a006649127e371903a2de979`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId {
    epoch: u32,
    unique: [u8; 12],
}

impl TraceId {
    /// Invalid trace id.
    pub const INVALID: TraceId = TraceId {
        epoch: 0,
        unique: [0; 12],
    };

    /// Converts the `1-xxxxxxxx-x{24}` textual form into a trace id.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidTraceId(s.to_string());

        let mut parts = s.split_terminator('-');
        let (version, epoch_hex, unique_hex) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(version), Some(epoch), Some(unique), None) => (version, epoch, unique),
            _ => return Err(invalid()),
        };

        if version != "1" || epoch_hex.len() != 8 || unique_hex.len() != 24 {
            return Err(invalid());
        }

        let epoch = u32::from_str_radix(epoch_hex, 16).map_err(|_| invalid())?;
        let mut unique = [0u8; 12];
        for (i, chunk) in unique.iter_mut().enumerate() {
            let byte = unique_hex.get(i * 2..i * 2 + 2).ok_or_else(invalid)?;
            *chunk = u8::from_str_radix(byte, 16).map_err(|_| invalid())?;
        }

        let id = TraceId { epoch, unique };
        if id == TraceId::INVALID {
            return Err(invalid());
        }
        Ok(id)
    }

    /// Epoch seconds recorded in this trace id.
    pub fn timestamp(&self) -> u32 {
        self.epoch
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "1-{:08x}-", self.epoch)?;
        for byte in &self.unique {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({self})")
    }
}

impl FromStr for TraceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TraceId::from_hex(s)
    }
}

impl Serialize for TraceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A 64-bit value identifying one segment or subsegment, rendered as 16
/// lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(u64);

impl SegmentId {
    /// Invalid segment id.
    pub const INVALID: SegmentId = SegmentId(0);

    /// Converts 16 hex characters into a segment id.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        if s.len() != 16 {
            return Err(Error::InvalidSegmentId(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(SegmentId)
            .map_err(|_| Error::InvalidSegmentId(s.to_string()))
    }
}

impl From<u64> for SegmentId {
    fn from(value: u64) -> Self {
        SegmentId(value)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({self})")
    }
}

impl FromStr for SegmentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SegmentId::from_hex(s)
    }
}

impl Serialize for SegmentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Interface for generating ids.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new `TraceId`.
    fn new_trace_id(&self) -> TraceId;

    /// Generate a new `SegmentId`.
    fn new_segment_id(&self) -> SegmentId;
}

/// Default [`IdGenerator`] implementation.
///
/// Generates trace and segment ids using a thread-local random number
/// generator; trace ids carry the current epoch seconds in their timestamp
/// field.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();
        let mut unique = [0u8; 12];
        with_rng(|rng| rng.fill(&mut unique[..]));
        TraceId { epoch, unique }
    }

    fn new_segment_id(&self) -> SegmentId {
        SegmentId(with_rng(|rng| rng.gen::<u64>()))
    }
}

thread_local! {
    /// Store random number generator for each thread.
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

pub(crate) fn with_rng<T>(f: impl FnOnce(&mut rngs::SmallRng) -> T) -> T {
    CURRENT_RNG.with(|rng| f(&mut rng.borrow_mut()))
}

/// [`IdGenerator`] implementation that increments a counter for each new id.
/// This helps produce predictable ids for testing.
#[derive(Clone, Debug)]
pub struct IncrementIdGenerator(Arc<AtomicU64>);

impl IncrementIdGenerator {
    /// Create a new [`IncrementIdGenerator`].
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for IncrementIdGenerator {
    fn default() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }
}

impl IdGenerator for IncrementIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        let n = self.0.fetch_add(1, Ordering::SeqCst);
        let mut unique = [0u8; 12];
        unique[4..].copy_from_slice(&n.to_be_bytes());
        TraceId { epoch: 1, unique }
    }

    fn new_segment_id(&self) -> SegmentId {
        SegmentId(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_round_trips_through_hex() {
        let id = TraceId::from_hex("1-58406520-a006649127e371903a2de979").unwrap();
        assert_eq!(id.timestamp(), 0x5840_6520);
        assert_eq!(id.to_string(), "1-58406520-a006649127e371903a2de979");
    }

    #[test]
    fn trace_id_rejects_malformed_input() {
        for bad in [
            "",
            "1-bogus-bad",
            "1-58406520",
            "2-58406520-a006649127e371903a2de979",
            "1-58406520-a006649127e371903a2de979-extra",
            "1-58406520-short",
            "1-00000000-000000000000000000000000",
        ] {
            assert!(TraceId::from_hex(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn segment_id_round_trips_through_hex() {
        let id = SegmentId::from_hex("4c721bf33e3caf8f").unwrap();
        assert_eq!(id.to_string(), "4c721bf33e3caf8f");
        assert!(SegmentId::from_hex("4c72").is_err());
        assert!(SegmentId::from_hex("zz721bf33e3caf8f").is_err());
    }

    #[test]
    fn random_ids_are_distinct() {
        let generator = RandomIdGenerator::default();
        assert_ne!(generator.new_trace_id(), generator.new_trace_id());
        assert_ne!(generator.new_segment_id(), generator.new_segment_id());
    }

    #[test]
    fn increment_ids_are_predictable() {
        let generator = IncrementIdGenerator::new();
        assert_eq!(generator.new_segment_id(), SegmentId::from(1));
        assert_eq!(generator.new_segment_id(), SegmentId::from(2));
    }
}
