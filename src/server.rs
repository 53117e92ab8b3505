use crate::config::{BasicAuthConfig, ExporterKind};
use crate::constants::{METRICS_AUTH_REALM, METRICS_CONTENT_TYPE};
use crate::error::{ObservatoryError, Result};
use crate::observatory::Observatory;
use crate::types::{ExceptionInfo, RequestInfo, ResponseInfo};
use axum::{
    body::{boxed, Body, Bytes},
    extract::{ConnectInfo, MatchedPath, Path, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE, HOST, WWW_AUTHENTICATE},
        HeaderMap, HeaderName, HeaderValue, Request, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Extension, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use hyper::body::HttpBody;
use hyper::Server;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Correlation id of the current inbound request, stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Router serving the scrape endpoint. Empty unless the registry exporter is configured.
pub fn metrics_router(observatory: Arc<Observatory>) -> Router {
    if observatory.exporter().kind() != ExporterKind::Registry {
        return Router::new();
    }
    let endpoint = observatory.config().prometheus.endpoint.clone();
    Router::new().route(&endpoint, get(metrics_handler)).with_state(observatory)
}

async fn metrics_handler(State(observatory): State<Arc<Observatory>>, headers: HeaderMap) -> Response {
    if !authorized(&observatory.config().prometheus.auth, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            [(WWW_AUTHENTICATE, format!("Basic realm=\"{}\"", METRICS_AUTH_REALM))],
            "Unauthorized",
        )
            .into_response();
    }

    (StatusCode::OK, [(CONTENT_TYPE, METRICS_CONTENT_TYPE)], observatory.output()).into_response()
}

fn authorized(auth: &BasicAuthConfig, headers: &HeaderMap) -> bool {
    if !auth.enabled {
        return true;
    }
    let Some(encoded) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    match credentials.split_once(':') {
        Some((user, pass)) => user == auth.username && pass == auth.password,
        None => false,
    }
}

/// Wrap `router` with request-id propagation (outer) and request observation (inner).
pub fn instrument(router: Router, observatory: Arc<Observatory>) -> Router {
    router
        .layer(middleware::from_fn_with_state(observatory.clone(), observe_requests))
        .layer(middleware::from_fn_with_state(observatory, request_id))
}

/// Reads or generates the request id, runs the request inside a span carrying
/// it and echoes it on the response.
pub async fn request_id(
    State(observatory): State<Arc<Observatory>>,
    mut request: Request<Body>,
    next: Next<Body>,
) -> Response {
    let config = &observatory.config().request_id;
    if !config.enabled {
        return next.run(request).await;
    }
    let header = match HeaderName::from_bytes(config.header.as_bytes()) {
        Ok(header) => header,
        Err(e) => {
            warn!("Invalid request id header '{}': {}", config.header, e);
            return next.run(request).await;
        }
    };

    let incoming = request
        .headers()
        .get(&header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let id = match incoming {
        Some(id) => id,
        None if config.generate_if_missing => {
            let id = Uuid::new_v4().to_string();
            if let Ok(value) = HeaderValue::from_str(&id) {
                request.headers_mut().insert(header.clone(), value);
            }
            id
        }
        None => return next.run(request).await,
    };

    request.extensions_mut().insert(RequestId(id.clone()));

    let mut response = if config.include_in_log_context {
        next.run(request).instrument(info_span!("request", request_id = %id)).await
    } else {
        next.run(request).await
    };

    if config.include_in_response {
        if let Ok(value) = HeaderValue::from_str(&id) {
            response.headers_mut().insert(header, value);
        }
    }
    response
}

/// Runs the inbound collector lifecycle around the rest of the stack.
pub async fn observe_requests(
    State(observatory): State<Arc<Observatory>>,
    request: Request<Body>,
    next: Next<Body>,
) -> Response {
    let collector = observatory.inbound();
    let limit = collector.body_limit();

    let (parts, body) = request.into_parts();
    let mut info = request_info(&parts);

    let body = if collector.wants_request_body() {
        match capture(body, limit).await {
            Capture::Read(bytes) => {
                info.body = body_text(&bytes);
                Body::from(bytes)
            }
            Capture::Skipped(body) => body,
            Capture::Failed => Body::empty(),
        }
    } else {
        body
    };

    let observation = collector.start(&info);
    let response = next.run(Request::from_parts(parts, body)).await;

    let mut result = ResponseInfo::new(response.status().as_u16());
    result.headers = header_pairs(response.headers());

    let response = if collector.wants_response_body() {
        let (parts, body) = response.into_parts();
        let body = match capture(body, limit).await {
            Capture::Read(bytes) => {
                result.body = body_text(&bytes);
                boxed(Body::from(bytes))
            }
            Capture::Skipped(body) => body,
            Capture::Failed => boxed(Body::empty()),
        };
        Response::from_parts(parts, body)
    } else {
        response
    };

    collector.end(observation, &info, &result);
    response
}

enum Capture<B> {
    Read(Bytes),
    Skipped(B),
    Failed,
}

/// Reads `body` only when its exact length is known and at most `limit`.
/// Streaming and oversized bodies come back untouched.
async fn capture<B>(body: B, limit: usize) -> Capture<B>
where
    B: HttpBody<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    match body.size_hint().exact() {
        Some(len) if len <= limit as u64 => {}
        _ => return Capture::Skipped(body),
    }
    match hyper::body::to_bytes(body).await {
        Ok(bytes) => Capture::Read(bytes),
        Err(e) => {
            warn!("Failed to read body for capture: {}", e);
            Capture::Failed
        }
    }
}

fn body_text(bytes: &Bytes) -> Option<String> {
    (!bytes.is_empty()).then(|| String::from_utf8_lossy(bytes).into_owned())
}

fn request_info(parts: &axum::http::request::Parts) -> RequestInfo {
    let path = parts.uri.path().to_string();
    let mut info = RequestInfo::new(parts.method.as_str(), path);

    info.url = match (parts.uri.scheme_str(), parts.headers.get(HOST).and_then(|h| h.to_str().ok())) {
        (None, Some(host)) => format!("http://{}{}", host, parts.uri),
        _ => parts.uri.to_string(),
    };
    info.query = parts.uri.query().map(str::to_string);
    info.route = parts.extensions.get::<MatchedPath>().map(|m| m.as_str().to_string());
    info.headers = header_pairs(&parts.headers);
    info.request_id = parts.extensions.get::<RequestId>().map(|id| id.0.clone());
    info.ip = client_ip(parts);
    info
}

fn client_ip(parts: &axum::http::request::Parts) -> Option<String> {
    let forwarded = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match forwarded {
        Some(ip) => Some(ip.to_string()),
        None => parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string()),
    }
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "observatory",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn order(Path(id): Path<u64>) -> impl IntoResponse {
    Json(json!({ "id": id, "status": "shipped" }))
}

async fn fail(
    State(observatory): State<Arc<Observatory>>,
    request_id: Option<Extension<RequestId>>,
) -> impl IntoResponse {
    let mut request = RequestInfo::new("GET", "/fail").with_route("/fail");
    request.request_id = request_id.map(|Extension(id)| id.0);

    let exception = ExceptionInfo::new("demo::CheckoutError", "payment provider rejected the charge");
    let mut context = Map::new();
    context.insert("handler".into(), Value::from("fail"));
    observatory.report_exception(&exception, &context, Some(&request));

    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": exception.message })))
}

/// Demo application: a few routes behind the full middleware stack, plus the
/// metrics endpoint.
pub fn create_server(observatory: Arc<Observatory>) -> Router {
    let app = Router::new()
        .route("/health", get(health))
        .route("/orders/:id", get(order))
        .route("/fail", get(fail))
        .with_state(observatory.clone())
        .merge(metrics_router(observatory.clone()));

    instrument(app, observatory).layer(TraceLayer::new_for_http())
}

/// Serve the demo application until Ctrl-C, then flush buffered telemetry.
pub async fn start_server(observatory: Arc<Observatory>, addr: SocketAddr) -> Result<()> {
    let app = create_server(observatory.clone());
    let flusher = observatory.spawn_periodic_flush();

    info!("HTTP server listening on http://{}", addr);
    if observatory.exporter().kind() == ExporterKind::Registry {
        info!("Metrics: http://{}{}", addr, observatory.config().prometheus.endpoint);
    }

    Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|e| ObservatoryError::Server(e.to_string()))?;

    if let Some(flusher) = flusher {
        flusher.abort();
    }
    observatory.flush().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> BasicAuthConfig {
        BasicAuthConfig { enabled: true, username: "scraper".into(), password: "s3cret".into() }
    }

    fn basic(credentials: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let value = format!("Basic {}", STANDARD.encode(credentials));
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
        headers
    }

    #[test]
    fn test_authorized() {
        assert!(authorized(&auth(), &basic("scraper:s3cret")));
        assert!(!authorized(&auth(), &basic("scraper:wrong")));
        assert!(!authorized(&auth(), &basic("no-colon")));
        assert!(!authorized(&auth(), &HeaderMap::new()));

        let open = BasicAuthConfig { enabled: false, ..auth() };
        assert!(authorized(&open, &HeaderMap::new()));
    }

    #[test]
    fn test_password_may_contain_colons() {
        let config = BasicAuthConfig { password: "a:b".into(), ..auth() };
        assert!(authorized(&config, &basic("scraper:a:b")));
    }

    #[test]
    fn test_request_info_from_parts() {
        let request = Request::builder()
            .method("POST")
            .uri("/orders/7?expand=items")
            .header(HOST, "shop.test")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(())
            .unwrap();
        let (parts, _) = request.into_parts();

        let info = request_info(&parts);
        assert_eq!(info.method, "POST");
        assert_eq!(info.path, "/orders/7");
        assert_eq!(info.url, "http://shop.test/orders/7?expand=items");
        assert_eq!(info.query.as_deref(), Some("expand=items"));
        assert_eq!(info.ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(info.route, None);
    }
}
