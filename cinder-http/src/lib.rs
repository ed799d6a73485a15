//! HTTP glue for [`cinder`]: header carriers and the request/response
//! interceptors.
//!
//! [`HeaderInjector`] and [`HeaderExtractor`] adapt `http::HeaderMap` to
//! cinder's propagation traits; [`ServerInterceptor`] brackets inbound
//! requests with a segment and [`ClientInterceptor`] brackets outbound
//! calls with a subsegment, injecting the trace header for the downstream
//! service.

#![warn(missing_docs, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod client;
mod redact;
mod server;

pub use client::{ClientInterceptor, OutboundCall};
pub use server::ServerInterceptor;

use cinder::propagation::{Extractor, Injector};

/// Helper for injecting the trace header into outbound HTTP requests.
pub struct HeaderInjector<'a>(pub &'a mut http::HeaderMap);

impl Injector for HeaderInjector<'_> {
    /// Set a key and value in the HeaderMap. Does nothing if the key or
    /// value are not valid inputs.
    fn set(&mut self, key: &str, value: String) {
        if let Ok(name) = http::header::HeaderName::from_bytes(key.as_bytes()) {
            if let Ok(val) = http::header::HeaderValue::from_str(&value) {
                self.0.insert(name, val);
            }
        }
    }
}

/// Helper for extracting the trace header from inbound HTTP requests.
pub struct HeaderExtractor<'a>(pub &'a http::HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    /// Get a value for a key from the HeaderMap. If the value is not valid
    /// ASCII, returns None.
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    /// Collect all the keys from the HeaderMap.
    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect::<Vec<_>>()
    }
}

/// The request url without its query string, as recorded in http metadata
/// and used to name outbound subsegments.
pub(crate) fn strip_query(uri: &http::Uri) -> String {
    let mut url = String::new();
    if let Some(scheme) = uri.scheme_str() {
        url.push_str(scheme);
        url.push_str("://");
    }
    if let Some(authority) = uri.authority() {
        url.push_str(authority.as_str());
    }
    url.push_str(uri.path());
    url
}
