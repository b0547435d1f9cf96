use finance_insight_orchestrator::{
    api::{start_server, ApiState},
    config::{Capabilities, OrchestratorConfig},
    jobs::JobManager,
    llm::GeminiClient,
    orchestrator::Orchestrator,
    providers::ProviderChain,
    state::InMemoryContextStore,
    trace::MemoryTraceSink,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    let capabilities = Capabilities::from_env();
    if !capabilities.llm {
        eprintln!("GEMINI_API_KEY not set; submitted jobs will fail fast");
    }

    info!("Finance Insight Orchestrator - API server");
    info!("Port: {}", api_port);

    let config = OrchestratorConfig::from_env();
    let job_budget = config.job_budget;
    let chain = Arc::new(ProviderChain::from_env(&capabilities));
    let trace = Arc::new(MemoryTraceSink::new());

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(GeminiClient::from_env()),
        chain,
        config,
        trace.clone(),
    ));

    let jobs = Arc::new(JobManager::new(
        orchestrator,
        Arc::new(InMemoryContextStore::new()),
        trace,
        job_budget,
    ));

    let api_key = std::env::var("API_KEY").ok().filter(|k| !k.trim().is_empty());
    let state = ApiState {
        jobs,
        capabilities,
        api_key,
    };

    info!("Orchestrator initialized, starting API server");

    start_server(state, api_port).await?;

    Ok(())
}
