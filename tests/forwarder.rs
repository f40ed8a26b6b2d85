//! End-to-end forwarding scenarios against a stubbed destination.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use http::header::HOST;
use http::{Method, Request, Response, StatusCode, Version};
use http_body_util::BodyExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use relay_core::config::ForwarderConfig;
use relay_core::BoxError;
use relay_core::forwarder::{
    error_feature, ErrorSlot, ForwardDestination, ForwardErrorKind, HttpForwarder, ReasonPhrase,
    RequestContext, UpgradeHandle,
};
use relay_core::telemetry::ForwarderStage;
use relay_core::transform::{OriginalHostTransform, TransformPipeline};
use relay_core::config::XForwardedConfig;
use relay_core::transform::XForwardedTransform;

use common::{Event, RecordingTelemetry, StubClient};

type Captured = Arc<Mutex<Option<(http::request::Parts, Bytes)>>>;

fn forwarder() -> HttpForwarder {
    HttpForwarder::new(ForwarderConfig::default())
}

/// Stub that captures the outbound request and returns a canned response.
fn capturing_stub(
    captured: Captured,
    make_response: impl Fn() -> Response<Body> + Send + Sync + 'static,
) -> StubClient {
    StubClient::new(move |request: Request<Body>| {
        let captured = Arc::clone(&captured);
        let response = make_response();
        async move {
            let (parts, body) = request.into_parts();
            let bytes = body
                .collect()
                .await
                .map_err(|e| Box::new(e) as BoxError)?
                .to_bytes();
            *captured.lock().unwrap() = Some((parts, bytes));
            Ok(response)
        }
    })
}

#[tokio::test]
async fn normal_post_forwarding() {
    let request = Request::builder()
        .method(Method::POST)
        .uri("http://example.com:3456/path/base/dropped/api/test?a=b&c=d")
        .header("x-ms-request-test", "request")
        .header("content-language", "requestLanguage")
        .body(Body::from("request content"))
        .unwrap();

    let transforms = Arc::new(
        TransformPipeline::builder()
            .request(OriginalHostTransform)
            .build(),
    );

    let ctx = RequestContext::new(
        request,
        ForwardDestination::new("https://localhost:123/a/b/".parse().unwrap()),
    )
    .with_transforms(transforms)
    .with_path_base("/path/base/dropped");

    let captured: Captured = Arc::new(Mutex::new(None));
    let client = capturing_stub(Arc::clone(&captured), || {
        let mut response = Response::builder()
            .status(StatusCode::from_u16(234).unwrap())
            .header("x-ms-response-test", "response")
            .body(Body::from("response content"))
            .unwrap();
        response
            .extensions_mut()
            .insert(ReasonPhrase("Test Reason Phrase".to_string()));
        response
    });

    let response = forwarder().forward(ctx, &client).await;

    // Inbound response: status, reason, headers, body relayed verbatim.
    assert_eq!(response.status().as_u16(), 234);
    assert_eq!(
        response.extensions().get::<ReasonPhrase>().unwrap().0,
        "Test Reason Phrase"
    );
    assert_eq!(
        response.headers().get("x-ms-response-test").unwrap(),
        "response"
    );
    assert!(error_feature(&response).is_none());
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), b"response content");

    // Outbound request: URI composed, version 2.0, headers filtered.
    let (parts, bytes) = captured.lock().unwrap().take().unwrap();
    assert_eq!(parts.method, Method::POST);
    assert_eq!(parts.version, Version::HTTP_2);
    assert_eq!(
        parts.uri.to_string(),
        "https://localhost:123/a/b/api/test?a=b&c=d"
    );
    assert_eq!(parts.headers.get(HOST).unwrap(), "example.com:3456");
    assert_eq!(parts.headers.get("x-ms-request-test").unwrap(), "request");
    assert_eq!(
        parts.headers.get("content-language").unwrap(),
        "requestLanguage"
    );
    assert!(parts
        .headers
        .iter()
        .all(|(name, _)| !name.as_str().starts_with(':')));
    assert_eq!(bytes.as_ref(), b"request content");
}

#[tokio::test]
async fn host_header_is_cleared_by_default() {
    let request = Request::builder()
        .method(Method::GET)
        .uri("http://example.com/api")
        .header(HOST, "example.com")
        .body(Body::empty())
        .unwrap();

    let ctx = RequestContext::new(
        request,
        ForwardDestination::new("http://backend:8080/".parse().unwrap()),
    );

    let captured: Captured = Arc::new(Mutex::new(None));
    let client = capturing_stub(Arc::clone(&captured), || {
        Response::new(Body::empty())
    });

    let _ = forwarder().forward(ctx, &client).await;

    let (parts, _) = captured.lock().unwrap().take().unwrap();
    assert!(parts.headers.get(HOST).is_none());
}

#[tokio::test]
async fn hop_by_hop_headers_never_forwarded() {
    let request = Request::builder()
        .method(Method::POST)
        .uri("http://example.com/api")
        .header("connection", "keep-alive, x-nominated")
        .header("keep-alive", "timeout=5")
        .header("te", "trailers")
        .header("trailer", "x-checksum")
        .header("proxy-authorization", "Basic abc")
        .header("proxy-authenticate", "Basic")
        .header("upgrade", "h2c")
        .header("x-kept", "yes")
        .body(Body::from("data"))
        .unwrap();

    let ctx = RequestContext::new(
        request,
        ForwardDestination::new("http://backend:8080/".parse().unwrap()),
    );

    let captured: Captured = Arc::new(Mutex::new(None));
    let client = capturing_stub(Arc::clone(&captured), || Response::new(Body::empty()));

    let _ = forwarder().forward(ctx, &client).await;

    let (parts, _) = captured.lock().unwrap().take().unwrap();
    for name in [
        "connection",
        "keep-alive",
        "te",
        "trailer",
        "proxy-authorization",
        "proxy-authenticate",
        "upgrade",
        "transfer-encoding",
    ] {
        assert!(
            parts.headers.get(name).is_none(),
            "{name} must not be forwarded"
        );
    }
    assert_eq!(parts.headers.get("x-kept").unwrap(), "yes");
}

#[tokio::test]
async fn x_forwarded_values_append_over_existing() {
    let request = Request::builder()
        .method(Method::GET)
        .uri("http://example.com:3456/base/api")
        .header("x-forwarded-for", "::1")
        .header("x-forwarded-proto", "https")
        .header("x-forwarded-host", "front.example")
        .header("x-forwarded-pathbase", "/old")
        .body(Body::empty())
        .unwrap();

    let transforms = Arc::new(
        TransformPipeline::builder()
            .request(XForwardedTransform::new(XForwardedConfig::all()))
            .build(),
    );

    let ctx = RequestContext::new(
        request,
        ForwardDestination::new("http://backend:8080/".parse().unwrap()),
    )
    .with_transforms(transforms)
    .with_scheme("http")
    .with_client_addr("127.0.0.1:4242".parse().unwrap())
    .with_path_base("/base");

    let captured: Captured = Arc::new(Mutex::new(None));
    let client = capturing_stub(Arc::clone(&captured), || Response::new(Body::empty()));

    let _ = forwarder().forward(ctx, &client).await;

    let (parts, _) = captured.lock().unwrap().take().unwrap();
    let values = |name: &str| -> Vec<String> {
        parts
            .headers
            .get_all(name)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    };

    assert_eq!(values("x-forwarded-for"), vec!["::1", "127.0.0.1"]);
    assert_eq!(values("x-forwarded-proto"), vec!["https", "http"]);
    assert_eq!(
        values("x-forwarded-host"),
        vec!["front.example", "example.com:3456"]
    );
    assert_eq!(values("x-forwarded-pathbase"), vec!["/old", "/base"]);
}

#[tokio::test]
async fn suppressed_header_copy_keeps_transform_output_only() {
    let request = Request::builder()
        .method(Method::GET)
        .uri("http://example.com/api")
        .header("x-inbound", "dropped")
        .body(Body::empty())
        .unwrap();

    let mut x_forwarded = XForwardedConfig::default();
    x_forwarded.client_for = true;
    let transforms = Arc::new(
        TransformPipeline::builder()
            .copy_request_headers(false)
            .request(XForwardedTransform::new(x_forwarded))
            .build(),
    );

    let ctx = RequestContext::new(
        request,
        ForwardDestination::new("http://backend:8080/".parse().unwrap()),
    )
    .with_transforms(transforms)
    .with_client_addr("10.0.0.9:1000".parse().unwrap());

    let captured: Captured = Arc::new(Mutex::new(None));
    let client = capturing_stub(Arc::clone(&captured), || Response::new(Body::empty()));

    let _ = forwarder().forward(ctx, &client).await;

    let (parts, _) = captured.lock().unwrap().take().unwrap();
    assert!(parts.headers.get("x-inbound").is_none());
    assert_eq!(parts.headers.get("x-forwarded-for").unwrap(), "10.0.0.9");
}

#[tokio::test]
async fn upgrade_success_relays_bytes_both_ways() {
    let (inbound_engine, mut inbound_test) = tokio::io::duplex(4096);
    let (outbound_engine, mut outbound_test) = tokio::io::duplex(4096);

    let mut request = Request::builder()
        .method(Method::GET)
        .uri("http://example.com/ws")
        .header("upgrade", "WebSocket")
        .header("connection", "Upgrade")
        .body(Body::empty())
        .unwrap();
    request
        .extensions_mut()
        .insert(UpgradeHandle::from_io(inbound_engine));

    let telemetry = RecordingTelemetry::new();
    let forwarder =
        HttpForwarder::new(ForwarderConfig::default()).with_telemetry(telemetry.clone());

    let outbound_engine = Arc::new(Mutex::new(Some(outbound_engine)));
    let client = StubClient::new(move |_request: Request<Body>| {
        let stream = outbound_engine.lock().unwrap().take().unwrap();
        async move {
            let mut response = Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header("upgrade", "WebSocket")
                .body(Body::empty())
                .unwrap();
            response
                .extensions_mut()
                .insert(UpgradeHandle::from_io(stream));
            Ok(response)
        }
    });

    let ctx = RequestContext::new(
        request,
        ForwardDestination::new("http://backend:8080/".parse().unwrap()),
    );

    let response = forwarder.forward(ctx, &client).await;
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    assert_eq!(response.headers().get("upgrade").unwrap(), "WebSocket");
    assert_eq!(response.headers().get("connection").unwrap(), "upgrade");

    let exchange = async {
        inbound_test.write_all(b"request content").await.unwrap();
        inbound_test.shutdown().await.unwrap();
        outbound_test.write_all(b"response content").await.unwrap();
        outbound_test.shutdown().await.unwrap();

        let mut to_destination = Vec::new();
        outbound_test.read_to_end(&mut to_destination).await.unwrap();
        let mut to_client = Vec::new();
        inbound_test.read_to_end(&mut to_client).await.unwrap();
        (to_destination, to_client)
    };
    let (to_destination, to_client) = tokio::time::timeout(Duration::from_secs(10), exchange)
        .await
        .expect("upgrade exchange timed out");

    assert_eq!(to_destination, b"request content");
    assert_eq!(to_client, b"response content");

    // The trace closes once both pumps are done.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if telemetry.events().contains(&Event::Stop(101)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("trace never closed");

    let events = telemetry.events();
    assert!(events.contains(&Event::Stage(ForwarderStage::ResponseUpgrade)));
    assert!(!events.iter().any(|e| matches!(e, Event::Failed(_))));
}

#[tokio::test]
async fn connection_refused_maps_to_request_error() {
    let request = Request::builder()
        .method(Method::POST)
        .uri("http://example.com/api")
        .body(Body::from("request content"))
        .unwrap();

    let ctx = RequestContext::new(
        request,
        ForwardDestination::new("http://backend:8080/".parse().unwrap()),
    );

    let client = StubClient::new(|_request: Request<Body>| async {
        Err(Box::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        )) as _)
    });

    let response = forwarder().forward(ctx, &client).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        error_feature(&response).unwrap().kind,
        ForwardErrorKind::Request
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(body.is_empty());
}

#[tokio::test]
async fn inbound_body_failure_maps_to_request_body_client() {
    let stream = futures_util::stream::iter(vec![
        Ok::<_, std::io::Error>(Bytes::from_static(b"partial")),
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "client hung up",
        )),
    ]);
    let request = Request::builder()
        .method(Method::POST)
        .uri("http://example.com/api")
        .body(Body::from_stream(stream))
        .unwrap();

    let ctx = RequestContext::new(
        request,
        ForwardDestination::new("http://backend:8080/".parse().unwrap()),
    );

    // The destination reads the upload and hits the client-side failure.
    let client = StubClient::new(|request: Request<Body>| async {
        match request.into_body().collect().await {
            Ok(_) => Ok(Response::new(Body::empty())),
            Err(e) => Err(Box::new(e) as _),
        }
    });

    let response = forwarder().forward(ctx, &client).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        error_feature(&response).unwrap().kind,
        ForwardErrorKind::RequestBodyClient
    );
}

#[tokio::test]
async fn destination_failure_after_commit_keeps_status_and_aborts() {
    let request = Request::builder()
        .method(Method::GET)
        .uri("http://example.com/api")
        .body(Body::empty())
        .unwrap();

    let ctx = RequestContext::new(
        request,
        ForwardDestination::new("http://backend:8080/".parse().unwrap()),
    );

    let client = StubClient::new(|_request: Request<Body>| async {
        let stream = futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"partial")),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "destination died",
            )),
        ]);
        Ok(Response::new(Body::from_stream(stream)))
    });

    let response = forwarder().forward(ctx, &client).await;

    // Headers were committed with the destination's status.
    assert_eq!(response.status(), StatusCode::OK);

    let (parts, body) = response.into_parts();
    let err = body.collect().await.unwrap_err();
    assert!(err.to_string().contains("destination died"));

    let slot = parts.extensions.get::<Arc<ErrorSlot>>().unwrap();
    assert_eq!(slot.kind(), ForwardErrorKind::ResponseBodyDestination);
}

#[tokio::test]
async fn destination_failure_before_first_byte_synthesizes_502() {
    let request = Request::builder()
        .method(Method::GET)
        .uri("http://example.com/api")
        .body(Body::empty())
        .unwrap();

    let ctx = RequestContext::new(
        request,
        ForwardDestination::new("http://backend:8080/".parse().unwrap()),
    );

    let client = StubClient::new(|_request: Request<Body>| async {
        let stream = futures_util::stream::iter(vec![Err::<Bytes, _>(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "destination died",
        ))]);
        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Body::from_stream(stream))
            .unwrap())
    });

    let response = forwarder().forward(ctx, &client).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        error_feature(&response).unwrap().kind,
        ForwardErrorKind::ResponseBodyDestination
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(body.is_empty());
}

#[tokio::test]
async fn request_cancellation_maps_to_request_canceled() {
    let request = Request::builder()
        .method(Method::GET)
        .uri("http://example.com/api")
        .body(Body::empty())
        .unwrap();

    let cancel = tokio_util::sync::CancellationToken::new();
    let ctx = RequestContext::new(
        request,
        ForwardDestination::new("http://backend:8080/".parse().unwrap()),
    )
    .with_cancellation(cancel.clone(), tokio_util::sync::CancellationToken::new());

    // A destination that never answers.
    let client = StubClient::new(|_request: Request<Body>| async {
        futures_util::future::pending::<()>().await;
        unreachable!()
    });

    let forward = forwarder();
    let task = async { forward.forward(ctx, &client).await };
    let cancel_task = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    };
    let (response, ()) = tokio::join!(task, cancel_task);

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        error_feature(&response).unwrap().kind,
        ForwardErrorKind::RequestCanceled
    );
}

#[tokio::test]
async fn stage_events_bracket_the_request() {
    let request = Request::builder()
        .method(Method::GET)
        .uri("http://example.com/api")
        .body(Body::empty())
        .unwrap();

    let ctx = RequestContext::new(
        request,
        ForwardDestination::new("http://backend:8080/".parse().unwrap())
            .with_ids("cluster-a", "route-1", "dest-7"),
    );

    let telemetry = RecordingTelemetry::new();
    let forwarder =
        HttpForwarder::new(ForwarderConfig::default()).with_telemetry(telemetry.clone());

    let client = StubClient::new(|_request: Request<Body>| async {
        Ok(Response::builder()
            .status(StatusCode::from_u16(234).unwrap())
            .body(Body::empty())
            .unwrap())
    });

    let response = forwarder.forward(ctx, &client).await;
    assert_eq!(response.status().as_u16(), 234);

    let events = telemetry.events();
    assert_eq!(
        events,
        vec![
            Event::Start,
            Event::Invoke("cluster-a".into(), "route-1".into(), "dest-7".into()),
            Event::Stage(ForwarderStage::ReceivedRequest),
            Event::Stage(ForwarderStage::SentRequest),
            Event::Stage(ForwarderStage::ReceivedResponse),
            Event::Stage(ForwarderStage::ResponseContentTransferStart),
            Event::Stage(ForwarderStage::Completed),
            Event::Stop(234),
        ]
    );
}

#[tokio::test]
async fn get_without_body_sends_empty_upload() {
    let request = Request::builder()
        .method(Method::GET)
        .uri("http://example.com/api")
        .body(Body::from("ignored by the classifier"))
        .unwrap();

    let ctx = RequestContext::new(
        request,
        ForwardDestination::new("http://backend:8080/".parse().unwrap()),
    );

    let captured: Captured = Arc::new(Mutex::new(None));
    let client = capturing_stub(Arc::clone(&captured), || Response::new(Body::empty()));

    let _ = forwarder().forward(ctx, &client).await;

    let (_, bytes) = captured.lock().unwrap().take().unwrap();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn response_trailers_pass_through_transforms() {
    let request = Request::builder()
        .method(Method::GET)
        .uri("http://example.com/api")
        .body(Body::empty())
        .unwrap();

    let transforms = Arc::new(
        TransformPipeline::builder()
            .trailer(|trailers: &mut http::HeaderMap| {
                trailers.insert("x-trailer-added", "yes".parse().unwrap());
            })
            .build(),
    );

    let ctx = RequestContext::new(
        request,
        ForwardDestination::new("http://backend:8080/".parse().unwrap()),
    )
    .with_transforms(transforms);

    let client = StubClient::new(|_request: Request<Body>| async {
        let mut trailers = http::HeaderMap::new();
        trailers.insert("x-checksum", "abc123".parse().unwrap());
        let frames = vec![
            Ok::<_, std::io::Error>(http_body::Frame::data(Bytes::from_static(b"payload"))),
            Ok(http_body::Frame::trailers(trailers)),
        ];
        let body = http_body_util::StreamBody::new(futures_util::stream::iter(frames));
        Ok(Response::new(Body::new(body)))
    });

    let response = forwarder().forward(ctx, &client).await;
    assert_eq!(response.status(), StatusCode::OK);

    let collected = response.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned().expect("trailers relayed");
    assert_eq!(trailers.get("x-checksum").unwrap(), "abc123");
    assert_eq!(trailers.get("x-trailer-added").unwrap(), "yes");
    assert_eq!(collected.to_bytes().as_ref(), b"payload");
}
