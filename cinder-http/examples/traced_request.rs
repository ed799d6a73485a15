//! Simulates one traced request lifecycle end to end: inbound segment,
//! concurrent captured work, an outbound call with header injection, and
//! emission to a local collector daemon (soft-failing when none runs).
//!
//! Run with `cargo run --example traced_request`.

use cinder::{Context, FutureCaptureExt, FutureContextExt, Recorder};
use cinder_http::{ClientInterceptor, ServerInterceptor};
use futures_util::future::join_all;
use std::sync::Arc;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), cinder::Error> {
    let recorder = Arc::new(
        Recorder::builder()
            .with_service("booking")
            .with_daemon_address("127.0.0.1:2000")
            .build()?,
    );
    let server = ServerInterceptor::new(recorder.clone());
    let client = ClientInterceptor::named(recorder.clone(), "pricing");

    // Inbound request arrives.
    let inbound = http::Request::builder()
        .method(http::Method::GET)
        .uri("https://booking.test/api/trips")
        .body(())
        .unwrap();
    server.on_request(&inbound, None);

    // Fan out two units of work, each under its own subsegment.
    let branches: Vec<_> = ["availability", "loyalty"]
        .into_iter()
        .map(|name| {
            async move { tokio::task::yield_now().await }
                .capture(recorder.clone(), name)
                .with_context(Context::current())
        })
        .collect();
    join_all(branches).await;

    // One outbound call to the pricing service.
    let mut outbound = http::Request::builder()
        .method(http::Method::GET)
        .uri("https://pricing.test/quotes")
        .body(())
        .unwrap();
    let call = client.on_request_start(&mut outbound);
    println!(
        "outbound headers: {:?}",
        outbound.headers().get(cinder::TRACE_HEADER)
    );
    client.on_response(&call, http::StatusCode::OK, None);

    // Respond, closing and emitting the segment tree.
    server.on_response(http::StatusCode::OK);
    Ok(())
}
