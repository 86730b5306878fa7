use std::net::SocketAddr;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use feedback_uploads::client::TrustedProxyList;
use feedback_uploads::config::AppConfig;
use feedback_uploads::limits::UploadAdmission;
use feedback_uploads::upload::UploadStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("feedback_uploads=debug".parse()?),
        )
        .init();

    info!("Starting feedback upload service");

    let config = AppConfig::from_env()?;

    let store = UploadStore::new(config.upload_dir.clone(), config.max_upload_bytes);
    store.prepare().await?;

    let limiter = UploadAdmission::new(config.admission);
    let _sweeper = config
        .sweep
        .then(|| limiter.spawn_sweeper(config.admission.cleanup_interval));

    let trusted = TrustedProxyList::new(config.trusted_proxies);
    if trusted.is_empty() {
        warn!("No trusted proxy ranges configured; keying uploads by peer address only");
    } else {
        info!("Loaded {} trusted proxy ranges", trusted.len());
    }

    let app = feedback_uploads::build_router(limiter, trusted, store);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
