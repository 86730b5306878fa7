use axum::extract::Extension;
use axum::Json;
use serde::Serialize;

use crate::limits::UploadAdmission;

const BUILD_VERSION: &str = env!("BUILD_VERSION");
const BUILD_DATE: &str = env!("BUILD_DATE");
const RUSTC_VERSION: &str = env!("RUSTC_VERSION");

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub git_hash: &'static str,
    pub build_date: &'static str,
    pub rustc_version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub in_flight: usize,
    pub concurrency_ceiling: usize,
    pub tracked_clients: usize,
}

pub const fn build_version() -> &'static str {
    BUILD_VERSION
}

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn version_info() -> Json<VersionInfo> {
    Json(VersionInfo {
        git_hash: BUILD_VERSION,
        build_date: BUILD_DATE,
        rustc_version: RUSTC_VERSION,
    })
}

pub async fn upload_status(Extension(limiter): Extension<UploadAdmission>) -> Json<UploadStatus> {
    Json(UploadStatus {
        in_flight: limiter.in_flight(),
        concurrency_ceiling: limiter.config().concurrency_ceiling,
        tracked_clients: limiter.tracked_clients(),
    })
}
