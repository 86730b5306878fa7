pub mod api_constants;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod limits;
pub mod middleware;
pub mod upload;

use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::{header, HeaderName, HeaderValue};
use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::{BoxError, Router};
use tower::timeout::error::Elapsed;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::RequestBodyTimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::client::TrustedProxyList;
use crate::error::ApiError;
use crate::limits::UploadAdmission;
use crate::upload::{UploadStore, MULTIPART_OVERHEAD_BYTES};

/// Maximum time any non-upload request can take before being terminated.
const GLOBAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Maximum time to receive the full request body for uploads.
/// A 20MB PDF over a slow connection might take 30s.
const UPLOAD_BODY_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum time for upload requests (body + processing). Also bounds how long
/// a hung upload can hold an admission slot.
const UPLOAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const BUILD_VERSION_HEADER: &str = "x-build-version";

async fn handle_layer_error(err: BoxError) -> ApiError {
    if err.is::<Elapsed>() {
        ApiError::service_unavailable("Request timed out")
    } else {
        ApiError::internal("Request failed")
    }
}

/// Assembles the service: health and status routes plus the gated upload
/// route.
pub fn build_router(
    limiter: UploadAdmission,
    trusted: TrustedProxyList,
    store: UploadStore,
) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(BUILD_VERSION_HEADER),
            header::RETRY_AFTER,
        ]);

    let build_version_header = SetResponseHeaderLayer::if_not_present(
        HeaderName::from_static(BUILD_VERSION_HEADER),
        HeaderValue::from_static(handlers::build_version()),
    );

    let ingest_layer = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(handle_layer_error))
        .layer(RequestBodyLimitLayer::new(
            store.max_bytes().saturating_add(MULTIPART_OVERHEAD_BYTES),
        ))
        .layer(RequestBodyTimeoutLayer::new(UPLOAD_BODY_TIMEOUT))
        .timeout(UPLOAD_REQUEST_TIMEOUT)
        .into_inner();

    let ingest_routes = Router::new()
        .route(api_constants::UPLOAD_ROUTE, post(upload::upload_pdf))
        .route_layer(ingest_layer)
        .route_layer(from_fn(middleware::enforce_upload_limit))
        .layer(DefaultBodyLimit::disable());

    let api_routes = Router::new()
        .route(api_constants::HEALTH_ROUTE, get(handlers::health_check))
        .route(api_constants::VERSION_ROUTE, get(handlers::version_info))
        .route(
            api_constants::UPLOAD_STATUS_ROUTE,
            get(handlers::upload_status),
        )
        .route_layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_layer_error))
                .timeout(GLOBAL_REQUEST_TIMEOUT)
                .into_inner(),
        );

    Router::new()
        .merge(api_routes)
        .merge(ingest_routes)
        .layer(build_version_header)
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(middleware::make_request_span)
                .on_request(middleware::on_request)
                .on_response(middleware::on_response),
        )
        .layer(from_fn(middleware::record_client_key))
        .layer(Extension(limiter))
        .layer(Extension(trusted))
        .layer(CatchPanicLayer::new())
        .with_state(store)
}
