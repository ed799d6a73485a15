//! The outbound-call interceptor.

use crate::redact::safe_snapshot;
use crate::{strip_query, HeaderInjector};
use cinder::trace::{inject_trace_header, TraceHeader};
use cinder::{cinder_warn, Namespace, Recorder, Subsegment};
use std::sync::Arc;

/// Brackets outbound HTTP calls with a `remote` subsegment.
///
/// Call [`on_request_start`](ClientInterceptor::on_request_start) before
/// dispatching the request, then exactly one of
/// [`on_response`](ClientInterceptor::on_response) or
/// [`on_error`](ClientInterceptor::on_error) with the returned
/// [`OutboundCall`]. When tracing is unavailable for a call the handle
/// carries a give-up flag and both end hooks short-circuit identically, so
/// partial state is never recorded.
#[derive(Clone, Debug)]
pub struct ClientInterceptor {
    recorder: Arc<Recorder>,
    name: Option<String>,
}

/// In-flight state for one outbound call.
#[derive(Debug)]
pub struct OutboundCall {
    subsegment: Option<Subsegment>,
}

impl OutboundCall {
    /// True when tracing was unavailable for this call and the end hooks
    /// will do nothing.
    pub fn gave_up(&self) -> bool {
        self.subsegment.is_none()
    }

    /// The subsegment bracketing this call, unless given up.
    pub fn subsegment(&self) -> Option<&Subsegment> {
        self.subsegment.as_ref()
    }
}

impl ClientInterceptor {
    /// Creates an interceptor naming subsegments after the request url.
    pub fn new(recorder: Arc<Recorder>) -> Self {
        ClientInterceptor {
            recorder,
            name: None,
        }
    }

    /// Overrides the subsegment name for every call through this
    /// interceptor, e.g. with the logical downstream service name.
    pub fn named(recorder: Arc<Recorder>, name: impl Into<String>) -> Self {
        ClientInterceptor {
            recorder,
            name: Some(name.into()),
        }
    }

    /// Opens the subsegment and injects the trace header into the request.
    pub fn on_request_start<B>(&self, request: &mut http::Request<B>) -> OutboundCall {
        let name = match &self.name {
            Some(name) => name.clone(),
            None => strip_query(request.uri()),
        };

        let subsegment = match self.recorder.begin_subsegment(&name, Namespace::Remote) {
            Ok(subsegment) => subsegment,
            Err(err) => {
                cinder_warn!(name: "ClientInterceptor.BeginFailed", message = err.to_string());
                None
            }
        };

        // No-op end hooks when no subsegment could be opened.
        let Some(subsegment) = subsegment else {
            return OutboundCall { subsegment: None };
        };

        subsegment.put_http_method(request.method().as_str());
        subsegment.put_http_url(strip_query(request.uri()));
        inject_trace_header(
            &mut HeaderInjector(request.headers_mut()),
            &TraceHeader::from_entity(subsegment.entity()),
        );

        OutboundCall {
            subsegment: Some(subsegment),
        }
    }

    /// Closes the subsegment with the response status.
    ///
    /// A client-error status marks the subsegment `error` and attaches a
    /// redacted snapshot of `body` as the `response` annotation; it is not
    /// treated as a local failure.
    pub fn on_response(&self, call: &OutboundCall, status: http::StatusCode, body: Option<&str>) {
        let Some(subsegment) = &call.subsegment else {
            return;
        };
        subsegment.put_http_status(status.as_u16());
        if status.as_u16() >= 400 {
            if let Some(body) = body {
                subsegment.put_annotation("response", safe_snapshot(body));
            }
        }
        self.end(subsegment);
    }

    /// Records a transport error and closes the subsegment.
    ///
    /// An `std::io::Error` anywhere in the source chain means the call
    /// failed before reaching the remote service, so the subsegment is
    /// reclassified as [`Namespace::Local`]. The error itself stays with
    /// the caller; this only records it.
    pub fn on_error(&self, call: &OutboundCall, err: &(dyn std::error::Error + 'static)) {
        let Some(subsegment) = &call.subsegment else {
            return;
        };
        subsegment
            .entity()
            .add_exception(err, self.recorder.max_cause_depth(), true);
        if is_connection_error(err) {
            subsegment.set_namespace(Namespace::Local);
        }
        self.end(subsegment);
    }

    fn end(&self, subsegment: &Subsegment) {
        // The normal case pops the context stack; entities left open by the
        // wrapped call were already warned about by the recorder.
        if self
            .recorder
            .current_subsegment()
            .is_some_and(|current| current.id() == subsegment.id())
        {
            if let Err(err) = self.recorder.end_subsegment() {
                cinder_warn!(name: "ClientInterceptor.EndFailed", message = err.to_string());
            }
        } else {
            subsegment.close();
        }
    }
}

fn is_connection_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(err) = current {
        if err.is::<std::io::Error>() {
            return true;
        }
        current = err.source();
    }
    false
}
