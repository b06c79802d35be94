use agri_analytics_engine::{agent::AnalyticsEngine, api::start_server, config::EngineConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let config = EngineConfig::from_env()?;
    if !config.has_gemini() {
        warn!("GEMINI_API_KEY not set; ambiguous questions will not be escalated");
    }
    let port = config.port;

    info!("Analytics Resolution Engine - API Server");
    info!("Port: {}", port);

    let engine = Arc::new(AnalyticsEngine::from_config(config)?);

    // Idle sessions are swept once a minute.
    let sweeper = engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            if let Err(e) = sweeper.purge_expired_sessions().await {
                warn!(error = %e, "Session purge failed");
            }
        }
    });

    info!("Engine initialized, starting API server");

    start_server(engine, port).await?;

    Ok(())
}
