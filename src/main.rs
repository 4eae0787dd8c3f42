use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use meetscribe::stitch::FfmpegStitcher;
use meetscribe::summarize::HttpSummarizer;
use meetscribe::transcribe::HttpTranscriber;
use meetscribe::{create_router, AppState, Config, Database, FragmentStore, Processor};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("meetscribe v0.1.0 - streaming audio processor");

    let config = Config::load("meetscribe")?;

    let db = Database::open(&config.storage.db_path)?;
    let store = Arc::new(FragmentStore::new(
        config.storage.fragment_root.clone(),
        config.storage.debug_save_stitched,
    ));
    let stitcher = Arc::new(FfmpegStitcher::new(&config.processor));
    let transcriber = Arc::new(HttpTranscriber::new(&config.transcriber)?);
    let summarizer = Arc::new(HttpSummarizer::new(&config.summarizer)?);

    let processor = Processor::new(
        config.processor.clone(),
        config.storage.debug_save_stitched,
        db,
        store.clone(),
        stitcher,
        transcriber,
        summarizer,
    );

    // Re-attach sessions that were in flight when the process died
    processor.recover().await?;

    // Background sweep for session directories past retention
    let retention = Duration::from_secs(config.storage.retention_days * 24 * 60 * 60);
    let sweep_store = store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = sweep_store.sweep_expired(retention).await {
                warn!("Retention sweep failed: {}", e);
            }
        }
    });

    let app = create_router(AppState::new(processor));

    let addr = format!("{}:{}", config.service.bind, config.service.port);
    info!("Starting server on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
