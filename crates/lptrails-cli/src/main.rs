use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lptrails_engine::{maybe_build_scheduler, EngineConfig, ScrapeEngine, ScrapeOptions};
use lptrails_web::AppState;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "lptrails-cli")]
#[command(about = "La Palma trail status scraper")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (default).
    Serve,
    /// Run one fresh scrape and print the result as JSON.
    Scrape(ScrapeArgs),
}

#[derive(Debug, Args)]
struct ScrapeArgs {
    #[arg(long)]
    status_page: Option<String>,
    /// Milliseconds.
    #[arg(long)]
    status_page_timeout: Option<u64>,
    /// Milliseconds.
    #[arg(long)]
    detail_page_timeout: Option<u64>,
    #[arg(long)]
    clear_lookups: bool,
}

impl ScrapeArgs {
    fn apply(self, mut options: ScrapeOptions) -> ScrapeOptions {
        if let Some(page) = self.status_page {
            options.status_page = page;
        }
        if let Some(ms) = self.status_page_timeout {
            options.status_page_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.detail_page_timeout {
            options.detail_page_timeout = Duration::from_millis(ms);
        }
        options.clear_lookups = self.clear_lookups;
        options.use_cache = false;
        options
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    let engine = Arc::new(ScrapeEngine::from_config(&config).context("building scrape engine")?);
    if engine.lookups().load_from_file().await {
        info!(
            entries = engine.lookups().len(),
            path = %engine.lookups().path().display(),
            "loaded url lookup table"
        );
    } else {
        warn!(
            path = %engine.lookups().path().display(),
            "no usable url lookup table; starting empty"
        );
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let sched = maybe_build_scheduler(engine.clone(), &config).await?;
            if let Some(sched) = &sched {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.refresh_cron, "scheduled refresh enabled");
            }
            lptrails_web::serve(AppState::new(engine, config.options.clone())).await?;
        }
        Commands::Scrape(args) => {
            let options = args.apply(config.options.clone());
            let result = engine.get_trail_statuses(&options).await;
            println!("{}", serde_json::to_string_pretty(&*result)?);
        }
    }

    Ok(())
}
