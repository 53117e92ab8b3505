use anyhow::Result;
use axum::body::{Body, Bytes};
use axum::http::{header, Request, Response, StatusCode};
use axum::routing::{get, post};
use axum::{Extension, Router};
use base64::{engine::general_purpose::STANDARD, Engine};
use hyper::body::HttpBody;
use observatory::config::ExporterKind;
use observatory::loggers::{ChannelRegistry, MemoryChannel};
use observatory::server::{self, RequestId};
use observatory::{Observatory, ObservatoryConfig};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

fn observatory(adjust: impl FnOnce(&mut ObservatoryConfig)) -> Arc<Observatory> {
    let mut config = ObservatoryConfig::default();
    config.app_name = "storefront".into();
    config.prometheus.enabled = true;
    adjust(&mut config);
    Arc::new(Observatory::new(config))
}

async fn body_text(response: axum::response::Response) -> Result<String> {
    let bytes = hyper::body::to_bytes(response.into_body()).await?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

fn get_request(uri: &str) -> Result<Request<Body>> {
    Ok(Request::builder().uri(uri).body(Body::empty())?)
}

#[tokio::test]
async fn test_metrics_endpoint_serves_text_format() -> Result<()> {
    let obs = observatory(|_| {});
    obs.increment("carts.created", &[], 1);

    let response = server::metrics_router(obs).oneshot(get_request("/metrics")?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain; charset=utf-8");

    let text = body_text(response).await?;
    assert!(text.contains("# TYPE storefront_carts_created counter"));
    assert!(text.contains("storefront_carts_created 1"));
    Ok(())
}

#[tokio::test]
async fn test_metrics_endpoint_basic_auth() -> Result<()> {
    let obs = observatory(|c| {
        c.prometheus.auth.enabled = true;
        c.prometheus.auth.username = "prom".into();
        c.prometheus.auth.password = "scrape-me".into();
    });
    let router = server::metrics_router(obs);

    let response = router.clone().oneshot(get_request("/metrics")?).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Basic realm=\"Metrics\"");

    let wrong = Request::builder()
        .uri("/metrics")
        .header(header::AUTHORIZATION, format!("Basic {}", STANDARD.encode("prom:nope")))
        .body(Body::empty())?;
    assert_eq!(router.clone().oneshot(wrong).await?.status(), StatusCode::UNAUTHORIZED);

    let right = Request::builder()
        .uri("/metrics")
        .header(header::AUTHORIZATION, format!("Basic {}", STANDARD.encode("prom:scrape-me")))
        .body(Body::empty())?;
    assert_eq!(router.oneshot(right).await?.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_metrics_endpoint_custom_path_and_push_exporter() -> Result<()> {
    let obs = observatory(|c| c.prometheus.endpoint = "/internal/metrics".into());
    let response = server::metrics_router(obs).oneshot(get_request("/internal/metrics")?).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let push = observatory(|c| c.exporter = ExporterKind::Push);
    let response = server::metrics_router(push).oneshot(get_request("/metrics")?).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_request_id_is_echoed() -> Result<()> {
    let obs = observatory(|_| {});
    let app = server::instrument(
        Router::new().route("/whoami", get(|Extension(id): Extension<RequestId>| async move { id.0 })),
        obs,
    );

    let request = Request::builder().uri("/whoami").header("X-Request-Id", "req-abc").body(Body::empty())?;
    let response = app.oneshot(request).await?;
    assert_eq!(response.headers()["x-request-id"], "req-abc");
    assert_eq!(body_text(response).await?, "req-abc");
    Ok(())
}

#[tokio::test]
async fn test_request_id_is_generated() -> Result<()> {
    let obs = observatory(|c| c.request_id.header = "X-Correlation-Id".into());
    let app = server::instrument(
        Router::new().route("/whoami", get(|Extension(id): Extension<RequestId>| async move { id.0 })),
        obs,
    );

    let response = app.oneshot(get_request("/whoami")?).await?;
    let echoed = response.headers()["x-correlation-id"].to_str()?.to_string();
    assert!(Uuid::parse_str(&echoed).is_ok());
    assert_eq!(body_text(response).await?, echoed);
    Ok(())
}

#[tokio::test]
async fn test_request_id_not_generated_when_disabled() -> Result<()> {
    let obs = observatory(|c| c.request_id.generate_if_missing = false);
    let app = server::instrument(Router::new().route("/ping", get(|| async { "pong" })), obs);

    let response = app.oneshot(get_request("/ping")?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-request-id").is_none());
    Ok(())
}

#[tokio::test]
async fn test_requests_are_recorded_by_route_template() -> Result<()> {
    let obs = observatory(|_| {});
    let app = server::create_server(obs.clone());

    let response = app.clone().oneshot(get_request("/orders/7")?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let response = app.clone().oneshot(get_request("/orders/8")?).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let output = obs.output();
    assert!(output.contains(
        "storefront_http_requests_total{method=\"GET\",route=\"/orders/:id\",status_code=\"200\"} 2"
    ));
    assert!(output.contains("# TYPE storefront_http_request_duration_seconds histogram"));
    assert!(output.contains(
        "storefront_http_request_duration_seconds_count{method=\"GET\",route=\"/orders/:id\",status_code=\"200\"} 2"
    ));

    // Excluded by default
    app.oneshot(get_request("/health")?).await?;
    assert!(!obs.output().contains("route=\"/health\""));
    Ok(())
}

#[tokio::test]
async fn test_failing_handler_reports_exception() -> Result<()> {
    let obs = observatory(|_| {});
    let app = server::create_server(obs.clone());

    let response = app.oneshot(get_request("/fail")?).await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let output = obs.output();
    assert!(output.contains("exception_class=\"demo::CheckoutError\""));
    assert!(output.contains("route=\"/fail\",status_code=\"500\""));
    Ok(())
}

#[tokio::test]
async fn test_bodies_survive_buffering() -> Result<()> {
    let obs = observatory(|c| {
        c.inbound.record_body = true;
        c.inbound_logger.log_body = true;
    });
    let app = server::instrument(Router::new().route("/echo", post(|body: String| async move { body })), obs);

    let request = Request::builder()
        .method("POST")
        .uri("/echo")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"sku":"A-1","qty":2}"#))?;
    let response = app.oneshot(request).await?;
    assert_eq!(body_text(response).await?, r#"{"sku":"A-1","qty":2}"#);
    Ok(())
}

/// An event stream that sends one chunk and then stays open.
async fn endless_stream() -> Response<Body> {
    let (mut sender, body) = Body::channel();
    tokio::spawn(async move {
        if sender.send_data(Bytes::from_static(b"data: first\n\n")).await.is_ok() {
            std::future::pending::<()>().await;
        }
        drop(sender);
    });
    Response::new(body)
}

async fn assert_stream_flows(obs: Arc<Observatory>) -> Result<()> {
    let app = server::instrument(Router::new().route("/events", get(endless_stream)), obs);

    let response = tokio::time::timeout(Duration::from_millis(500), app.oneshot(get_request("/events")?)).await??;
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let chunk = tokio::time::timeout(Duration::from_millis(500), body.data()).await?;
    let chunk = chunk.ok_or_else(|| anyhow::anyhow!("stream ended early"))??;
    assert_eq!(&chunk[..], b"data: first\n\n");
    Ok(())
}

#[tokio::test]
async fn test_streaming_response_is_not_held_back() -> Result<()> {
    assert_stream_flows(observatory(|_| {})).await
}

#[tokio::test]
async fn test_streaming_response_flows_when_bodies_are_captured() -> Result<()> {
    assert_stream_flows(observatory(|c| {
        c.inbound.record_body = true;
        c.inbound_logger.log_response_body = true;
    }))
    .await
}

#[tokio::test]
async fn test_oversized_body_passes_through_uncaptured() -> Result<()> {
    let mut config = ObservatoryConfig::default();
    config.inbound_logger.log_body = true;
    config.inbound_logger.max_body_size = 8;
    let channels = Arc::new(ChannelRegistry::new());
    let logs = Arc::new(MemoryChannel::new());
    channels.register(config.log_channel.clone(), logs.clone());
    let obs = Arc::new(Observatory::with_channels(config, channels));

    let app = server::instrument(Router::new().route("/echo", post(|body: String| async move { body })), obs);
    let payload = r#"{"note":"longer than eight bytes"}"#;
    let request = Request::builder().method("POST").uri("/echo").body(Body::from(payload))?;
    let response = app.oneshot(request).await?;
    assert_eq!(body_text(response).await?, payload);

    let lines = logs.lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].record["request_body"].is_null());
    Ok(())
}
