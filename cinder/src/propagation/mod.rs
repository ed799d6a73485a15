//! Carrier interfaces for propagating trace context between processes.
//!
//! [`Injector`] and [`Extractor`] decouple the header codec from the
//! transport's header storage; `cinder-http` provides adapters for
//! `http::HeaderMap`, and any string map works out of the box.

use std::collections::HashMap;

/// Injector provides an interface for adding fields to an underlying
/// carrier like a header map.
pub trait Injector {
    /// Add a key and value to the underlying data.
    fn set(&mut self, key: &str, value: String);
}

/// Extractor provides an interface for reading fields from an underlying
/// carrier like a header map.
pub trait Extractor {
    /// Get a value for a key from the underlying data.
    fn get(&self, key: &str) -> Option<&str>;

    /// Collect all the keys from the underlying data.
    fn keys(&self) -> Vec<&str>;
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    /// Set a key and value in the HashMap.
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    /// Get a value for a key from the HashMap.
    fn get(&self, key: &str) -> Option<&str> {
        self.get(&key.to_lowercase()).map(|v| v.as_str())
    }

    /// Collect all the keys from the HashMap.
    fn keys(&self) -> Vec<&str> {
        self.keys().map(|k| k.as_str()).collect::<Vec<_>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_map_carrier_round_trip() {
        let mut carrier = HashMap::new();
        Injector::set(&mut carrier, "X-Amzn-Trace-Id", "Root=1".to_string());

        assert_eq!(Extractor::get(&carrier, "x-amzn-trace-id"), Some("Root=1"));
        assert_eq!(Extractor::get(&carrier, "X-AMZN-TRACE-ID"), Some("Root=1"));
        assert_eq!(Extractor::keys(&carrier), vec!["x-amzn-trace-id"]);
    }
}
