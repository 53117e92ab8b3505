use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use observatory::config::ExporterKind;
use observatory::masker::SensitiveDataMasker;
use observatory::metrics::{BufferedPushExporter, Exporter};
use observatory::ObservatoryConfig;
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct Captured {
    path: String,
    authorization: Option<String>,
    content_type: Option<String>,
    project_id: Option<String>,
    body: Value,
}

/// Local ingest endpoint that records every request and answers `status`.
fn spawn_ingest(status: StatusCode) -> (SocketAddr, Arc<Mutex<Vec<Captured>>>) {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();

    let make = make_service_fn(move |_| {
        let sink = sink.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let sink = sink.clone();
                async move {
                    let (parts, body) = req.into_parts();
                    let bytes = hyper::body::to_bytes(body).await?;
                    let header = |name: &str| {
                        parts.headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
                    };
                    sink.lock().unwrap().push(Captured {
                        path: parts.uri.path().to_string(),
                        authorization: header("authorization"),
                        content_type: header("content-type"),
                        project_id: header("x-project-id"),
                        body: serde_json::from_slice(&bytes).unwrap_or(Value::Null),
                    });
                    let mut response = Response::new(Body::from("{\"accepted\":true}"));
                    *response.status_mut() = status;
                    Ok::<_, hyper::Error>(response)
                }
            }))
        }
    });

    let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make);
    let addr = server.local_addr();
    tokio::spawn(server);
    (addr, captured)
}

fn push_config(endpoint: String, api_key: Option<&str>) -> ObservatoryConfig {
    let mut config = ObservatoryConfig::default();
    config.app_name = "billing".into();
    config.exporter = ExporterKind::Push;
    config.push.endpoint = endpoint;
    config.push.api_key = api_key.map(str::to_string);
    config.push.project_id = "proj-42".into();
    config.push.batch_size = 1_000;
    config
}

#[tokio::test]
async fn test_flush_posts_batch_with_headers() -> Result<()> {
    let (addr, captured) = spawn_ingest(StatusCode::ACCEPTED);
    let config = push_config(format!("http://{}/", addr), Some("sk-test"));
    let exporter = BufferedPushExporter::new(&config, Arc::new(SensitiveDataMasker::default()));

    exporter.increment_counter("invoices.sent", &[("plan", "pro")], 3);
    exporter.set_gauge("open_invoices", 12.0, &[]);
    assert_eq!(exporter.buffer_size(), 2);

    exporter.flush().await;
    assert_eq!(exporter.buffer_size(), 0);

    let requests = captured.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.path, "/api/v1/ingest");
    assert_eq!(request.authorization.as_deref(), Some("Bearer sk-test"));
    assert_eq!(request.content_type.as_deref(), Some("application/json"));
    assert_eq!(request.project_id.as_deref(), Some("proj-42"));

    assert_eq!(request.body["project_id"], "proj-42");
    let data = request.body["data"].as_array().cloned().unwrap_or_default();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["type"], "metric");
    assert_eq!(data[0]["data"]["name"], "invoices.sent");
    assert_eq!(data[0]["data"]["value"], 3);
    assert_eq!(data[0]["app_name"], "billing");
    assert_eq!(data[1]["data"]["type"], "gauge");
    Ok(())
}

#[tokio::test]
async fn test_flush_without_key_sends_nothing() -> Result<()> {
    let (addr, captured) = spawn_ingest(StatusCode::OK);
    let config = push_config(format!("http://{}", addr), None);
    let exporter = BufferedPushExporter::new(&config, Arc::new(SensitiveDataMasker::default()));

    exporter.increment_counter("signups", &[], 1);
    exporter.flush().await;

    assert_eq!(exporter.buffer_size(), 0);
    assert!(captured.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_rejected_batch_is_dropped() -> Result<()> {
    let (addr, captured) = spawn_ingest(StatusCode::INTERNAL_SERVER_ERROR);
    let config = push_config(format!("http://{}", addr), Some("sk-test"));
    let exporter = BufferedPushExporter::new(&config, Arc::new(SensitiveDataMasker::default()));

    exporter.increment_counter("signups", &[], 1);
    exporter.flush().await;
    assert_eq!(exporter.buffer_size(), 0);
    assert_eq!(captured.lock().unwrap().len(), 1);

    // Nothing is retried on the next flush
    exporter.flush().await;
    assert_eq!(captured.lock().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_endpoint_does_not_fail() -> Result<()> {
    let mut config = push_config("http://127.0.0.1:1".into(), Some("sk-test"));
    config.push.timeout_secs = 1;
    let exporter = BufferedPushExporter::new(&config, Arc::new(SensitiveDataMasker::default()));

    exporter.observe_histogram("render_seconds", 0.3, &[]);
    exporter.flush().await;
    assert_eq!(exporter.buffer_size(), 0);
    Ok(())
}

#[tokio::test]
async fn test_output_reports_status() -> Result<()> {
    let config = push_config("https://ingest.example.test".into(), Some("sk-test"));
    let exporter = BufferedPushExporter::new(&config, Arc::new(SensitiveDataMasker::default()));
    exporter.increment_counter("signups", &[], 1);

    let status: Value = serde_json::from_str(&exporter.output())?;
    assert_eq!(status["status"], "active");
    assert_eq!(status["endpoint"], "https://ingest.example.test");
    assert_eq!(status["project_id"], "proj-42");
    assert_eq!(status["buffer_size"], 1);

    let unconfigured = BufferedPushExporter::new(
        &push_config("https://ingest.example.test".into(), None),
        Arc::new(SensitiveDataMasker::default()),
    );
    let status: Value = serde_json::from_str(&unconfigured.output())?;
    assert_eq!(status["status"], "unconfigured");
    Ok(())
}
