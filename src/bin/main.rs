use finance_insight_orchestrator::{
    config::{Capabilities, OrchestratorConfig},
    llm::GeminiClient,
    models::Request,
    orchestrator::{cancel_pair, Orchestrator},
    providers::ProviderChain,
    trace::LogTraceSink,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let query = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let query = if query.trim().is_empty() {
        "How is AAPL doing this month?".to_string()
    } else {
        query
    };

    let capabilities = Capabilities::from_env();
    info!(?capabilities, "Finance Insight Orchestrator starting");

    let config = OrchestratorConfig::from_env();
    let chain = Arc::new(ProviderChain::from_env(&capabilities));
    let orchestrator = Orchestrator::new(
        Arc::new(GeminiClient::from_env()),
        chain,
        config,
        Arc::new(LogTraceSink),
    );

    let request = Request::from_query(query);
    let job_id = Uuid::new_v4();
    let (_handle, token) = cancel_pair();

    info!(job_id = %job_id, query = %request.query, "Running research job");

    match orchestrator.run(job_id, &request, token).await {
        Ok((report, log)) => {
            println!("\n=== FINAL REPORT ({}) ===\n", report.audit_status);
            println!("{}", report.answer);
            if !report.limitations.is_empty() {
                println!("Limitations:");
                for limitation in &report.limitations {
                    println!("  - {}", limitation);
                }
            }
            println!("\nContext log: {} entries", log.len());
            for (i, entry) in log.entries().iter().enumerate() {
                println!(
                    "  {}: {} attempt {} [{:?}]",
                    i + 1,
                    entry.stage,
                    entry.attempt,
                    entry.status
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Research job failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
