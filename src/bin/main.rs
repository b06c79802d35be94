use agri_analytics_engine::{agent::AnalyticsEngine, config::EngineConfig};
use tracing::{error, info};

const SAMPLE_QUESTIONS: &[&str] = &[
    "What is revenue for FY2025?",
    "Why did gross margin miss budget in FY2025?",
    "And for wheat?",
    "What if wheat prices drop by 15%?",
    "Where can we improve gross margin?",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    dotenv::dotenv().ok();

    let config = EngineConfig::from_env()?;
    let engine = AnalyticsEngine::from_config(config)?;

    // Questions come from the command line, or the samples when none are given.
    let args: Vec<String> = std::env::args().skip(1).collect();
    let questions: Vec<String> = if args.is_empty() {
        SAMPLE_QUESTIONS.iter().map(|q| q.to_string()).collect()
    } else {
        vec![args.join(" ")]
    };

    let session_id = uuid::Uuid::new_v4().to_string();
    info!(session_id = %session_id, questions = questions.len(), "Analytics demo starting");

    for question in &questions {
        println!("\n=== {} ===", question);
        match engine.handle(question, &session_id).await {
            Ok(response) => {
                println!(
                    "Intent: {} ({:?})",
                    response.classification.intent, response.classification.method
                );
                println!("\n{}", response.summary);
                println!("Provenance:");
                for note in &response.provenance {
                    println!("  - {}", note);
                }
            }
            Err(e) => {
                error!(error = %e, "Question failed");
                eprintln!("Failed: {}", e);
            }
        }
    }

    Ok(())
}
