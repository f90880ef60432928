use anyhow::Result;
use clap::{Parser, Subcommand};
use crp_pipeline::{build_orchestrator, PipelineConfig, Scheduler, Stores};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "crp-cli")]
#[command(about = "Churn risk report pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one report workflow for a user right now.
    Trigger {
        #[arg(long)]
        user: String,
    },
    /// Scan for due workflows on a cron cadence until interrupted.
    Schedule,
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("CRP_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Schedule) {
        Commands::Trigger { user } => {
            let stores = stores_from(&config).await?;
            let orchestrator = build_orchestrator(&config, stores)?;
            let outcome = orchestrator.trigger_user(&user).await?;
            println!(
                "run complete: run_id={} status={} companies={} executed={} reused={}",
                outcome.run_id,
                outcome.status,
                outcome.companies_combined,
                outcome.steps_executed.len(),
                outcome.steps_reused.len()
            );
            if let Some(error) = outcome.error {
                println!("run error: {error}");
            }
        }
        Commands::Schedule => {
            let stores = stores_from(&config).await?;
            let configs = stores.configs.clone();
            let orchestrator = Arc::new(build_orchestrator(&config, stores)?);
            let scheduler = Scheduler::new(orchestrator, configs, config.scheduler_cron.clone());
            let mut running = scheduler.start().await?;
            info!(
                cron = config.scheduler_cron.as_str(),
                "scheduler running, press ctrl-c to stop"
            );
            tokio::signal::ctrl_c().await?;
            running.shutdown().await?;
        }
        Commands::Migrate => {
            let database_url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;
            let pool = crp_storage::connect(database_url).await?;
            crp_storage::migrate(&pool).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn stores_from(config: &PipelineConfig) -> Result<Stores> {
    match config.database_url.as_deref() {
        Some(url) => {
            let pool = crp_storage::connect(url).await?;
            Ok(Stores::postgres(&pool))
        }
        None => {
            warn!("DATABASE_URL not set, runs will use in-memory stores");
            Ok(Stores::in_memory())
        }
    }
}
