//! The inbound request/response interceptor.

use crate::{strip_query, HeaderExtractor};
use cinder::trace::extract_trace_header;
use cinder::{cinder_warn, Recorder, SamplingRequest, Segment};
use std::net::IpAddr;
use std::sync::Arc;

/// Brackets inbound requests with a root segment.
///
/// Wire [`on_request`](ServerInterceptor::on_request) into the host
/// framework's request hook and [`on_response`](ServerInterceptor::on_response)
/// / [`on_error`](ServerInterceptor::on_error) into its response and error
/// hooks. Requests whose path ends with an excluded suffix (health checks
/// and the like) are skipped entirely — no sampler consult, no segment.
#[derive(Clone, Debug)]
pub struct ServerInterceptor {
    recorder: Arc<Recorder>,
    excluded_paths: Vec<String>,
}

impl ServerInterceptor {
    /// Creates an interceptor excluding `/health` by default.
    pub fn new(recorder: Arc<Recorder>) -> Self {
        ServerInterceptor {
            recorder,
            excluded_paths: vec!["/health".to_string()],
        }
    }

    /// Replaces the excluded path suffixes.
    pub fn with_excluded_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths
            .iter()
            .any(|suffix| path.ends_with(suffix))
    }

    /// Begins the segment for one inbound request.
    ///
    /// Returns `None` for excluded paths and when the segment could not be
    /// opened; request handling proceeds untraced either way.
    pub fn on_request<B>(
        &self,
        request: &http::Request<B>,
        client_addr: Option<IpAddr>,
    ) -> Option<Segment> {
        let path = request.uri().path();
        if self.is_excluded(path) {
            return None;
        }

        let header = extract_trace_header(&HeaderExtractor(request.headers()));
        let sampled = self.recorder.sampler().decide(
            header.as_ref(),
            &SamplingRequest {
                service: Some(self.recorder.service()),
                method: Some(request.method().as_str()),
                path: Some(path),
            },
        );

        let segment = match self.recorder.begin_segment_with_decision(
            self.recorder.service(),
            header.as_ref(),
            sampled,
        ) {
            Ok(segment) => segment?,
            Err(err) => {
                cinder_warn!(name: "ServerInterceptor.BeginFailed", message = err.to_string());
                return None;
            }
        };

        if segment.sampled() {
            segment.put_http_method(request.method().as_str());
            segment.put_http_url(strip_query(request.uri()));
            // Prefer the forwarding header over the peer address.
            let forwarded = request
                .headers()
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .map(|value| value.trim().to_string());
            if let Some(client_ip) = forwarded.or_else(|| client_addr.map(|ip| ip.to_string())) {
                segment.put_http_client_ip(client_ip);
            }
            if let Some(user_agent) = request
                .headers()
                .get(http::header::USER_AGENT)
                .and_then(|value| value.to_str().ok())
            {
                segment.put_http_user_agent(user_agent);
            }
        }

        Some(segment)
    }

    /// Closes the current segment with the response status.
    ///
    /// A no-op when the request was excluded or untraced.
    pub fn on_response(&self, status: http::StatusCode) {
        let Some(segment) = self.recorder.current_segment() else {
            return;
        };
        segment.put_http_status(status.as_u16());
        if let Err(err) = self.recorder.end_segment() {
            cinder_warn!(name: "ServerInterceptor.EndFailed", message = err.to_string());
        }
    }

    /// Records an unhandled error, then closes the current segment.
    ///
    /// The error stays with the caller; this only records it.
    pub fn on_error(&self, err: &(dyn std::error::Error + 'static)) {
        let Some(segment) = self.recorder.current_segment() else {
            return;
        };
        segment
            .entity()
            .add_exception(err, self.recorder.max_cause_depth(), false);
        if let Err(err) = self.recorder.end_segment() {
            cinder_warn!(name: "ServerInterceptor.EndFailed", message = err.to_string());
        }
    }
}
