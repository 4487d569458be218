use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use surfer_agent::config::Cli;
use surfer_agent::face::{self, AppState};
use surfer_agent::orchestrator::{ChromeLauncher, LoopSettings, Orchestrator};
use surfer_agent::patcher::XmlChangePatcher;
use surfer_agent::queue::{FileTaskStore, TaskStore};
use surfer_agent::state::AgentHandle;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Cli::parse().into_config();
    info!(brain = ?config.resolved_brain(), agents = %config.agents_dir.display(), "starting agent");

    let store: Arc<dyn TaskStore> = Arc::new(FileTaskStore::open(&config.agents_dir)?);
    let agent = AgentHandle::new();

    // Control surface first, so status is visible while browsers launch.
    let app = AppState::new(agent.clone(), store.clone(), config.default_task.clone());
    let (addr, server) = face::start_server(config.port, app).await?;
    info!("control surface at http://{addr}");

    let orchestrator = Orchestrator::new(
        agent,
        store,
        Box::new(ChromeLauncher::new(config.clone())),
        Box::new(XmlChangePatcher),
        LoopSettings::from(&config),
    );

    orchestrator
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "could not listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    server.abort();
    Ok(())
}
