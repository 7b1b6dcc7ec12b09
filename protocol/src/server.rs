//! HTTP binding for pipelines: one `POST /{kind}` route per registered
//! message kind.

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;

use crate::pipeline::Dispatch;
use crate::types::{header, Headers, WireRequest, WireResponse};

type Routes = HashMap<String, Arc<dyn Dispatch>>;

pub fn create_router(routes: impl IntoIterator<Item = Arc<dyn Dispatch>>, body_limit: usize) -> Router {
    let routes: Routes = routes
        .into_iter()
        .map(|route| (route.kind().to_string(), route))
        .collect();
    for kind in routes.keys() {
        tracing::debug!(%kind, "Registered route");
    }

    Router::new()
        .route("/{kind}", post(dispatch_handler))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(Arc::new(routes))
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

async fn dispatch_handler(
    State(routes): State<Arc<Routes>>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(pipeline) = routes.get(&kind) else {
        tracing::debug!(%kind, "Unknown message kind");
        return (StatusCode::NOT_FOUND, format!("unknown message kind `{kind}`")).into_response();
    };

    let request = WireRequest {
        kind,
        headers: envelope_headers(&headers),
        body,
    };
    into_http(pipeline.dispatch(request).await)
}

/// Keep only protocol headers; anything non-UTF-8 is dropped
fn envelope_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with(header::PREFIX))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn into_http(response: WireResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let content_type = if response.is_streaming() {
        "application/x-ndjson"
    } else {
        "application/json"
    };

    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type);
    for (name, value) in &response.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&header_safe(value)),
        ) else {
            continue;
        };
        builder = builder.header(name, value);
    }

    builder
        .body(Body::from_stream(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Status messages may carry arbitrary text
fn header_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '?' })
        .collect()
}
