use std::time::Duration;

use axum::body::Body;
use axum::extract::Extension;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn, Span};

use crate::client::{client_key, ClientKey, TrustedProxyList};
use crate::error::ApiError;
use crate::limits::{UploadAdmission, UNKNOWN_CLIENT};

/// Gates upload routes through the admission controller.
pub async fn enforce_upload_limit(
    Extension(limiter): Extension<UploadAdmission>,
    Extension(trusted): Extension<TrustedProxyList>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let key = client_key(&req, &trusted);

    let _guard = match limiter.try_start(key.as_str()) {
        Ok(guard) => guard,
        Err(rejection) => {
            warn!(
                "Rejected upload from {}: {} (retry after {}s)",
                key.as_str(),
                rejection.reason.code(),
                rejection.retry_after_secs
            );
            return ApiError::from(rejection).into_response();
        }
    };

    // Held until the handler finishes or this future is dropped.
    next.run(req).await
}

/// Records the request's [`ClientKey`] once so logging and limiting agree.
pub async fn record_client_key(
    Extension(trusted): Extension<TrustedProxyList>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let key = client_key(&req, &trusted);
    req.extensions_mut().insert(key);
    next.run(req).await
}

fn client_for_logging<B>(req: &Request<B>) -> &str {
    req.extensions()
        .get::<ClientKey>()
        .map_or(UNKNOWN_CLIENT, ClientKey::as_str)
}

fn full_path<B>(req: &Request<B>) -> String {
    let path = req.uri().path();
    match req.uri().query() {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    }
}

pub fn make_request_span<B>(req: &Request<B>) -> Span {
    tracing::info_span!(
        "http_request",
        method = %req.method(),
        path = %full_path(req),
        client = %client_for_logging(req)
    )
}

pub fn on_request<B>(req: &Request<B>, _span: &Span) {
    info!(
        "{} {} from {}",
        req.method(),
        full_path(req),
        client_for_logging(req)
    );
}

pub fn on_response<B>(response: &Response<B>, latency: Duration, _span: &Span) {
    info!("Response {} in {}ms", response.status(), latency.as_millis());
}
