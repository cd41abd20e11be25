//! Swiss Trader: weekly LLM-driven paper-trading run.
//!
//! Entry point. Loads `.env` and configuration, initialises structured
//! logging, wires the provider, model and ledger together, and runs the
//! pipeline once. The exit status tells the scheduler how the run ended.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use swiss_trader::config::AppConfig;
use swiss_trader::data::yahoo::YahooProvider;
use swiss_trader::data::MarketDataProvider;
use swiss_trader::engine::coordinator::{RunCoordinator, RunSettings};
use swiss_trader::engine::decision::DecisionEngine;
use swiss_trader::engine::fetcher::{FetchSettings, MarketDataFetcher};
use swiss_trader::llm;
use swiss_trader::storage::LedgerStore;
use swiss_trader::types::TraderError;

#[derive(Debug, Parser)]
#[command(name = "swiss-trader", version, about = "Autonomous LLM paper-trading agent")]
struct Cli {
    /// Run the full pipeline and log decisions without writing the ledger.
    #[arg(long)]
    dry_run: bool,

    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    init_logging();

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code(&e);
            error!(error = %format!("{e:#}"), exit_code = code, "Run aborted");
            ExitCode::from(code)
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let cfg = AppConfig::load(&cli.config).map_err(|e| TraderError::Config(format!("{e:#}")))?;

    info!(
        agent_name = %cfg.agent.name,
        currency = %cfg.agent.currency,
        initial_cash = %format!("${:.2}", cfg.agent.initial_cash),
        symbols = cfg.watchlist.symbols.len(),
        dry_run = cli.dry_run,
        "Swiss Trader starting up"
    );

    // -- Initialise components -------------------------------------------

    let provider: Arc<dyn MarketDataProvider> = match cfg.market_data.provider.as_str() {
        "yahoo" => Arc::new(YahooProvider::new(Duration::from_secs(
            cfg.market_data.request_timeout_secs,
        ))?),
        other => {
            return Err(TraderError::Config(format!("Unknown market_data.provider: {other}")).into())
        }
    };
    let fetcher = MarketDataFetcher::new(provider, FetchSettings::from_config(&cfg.market_data));

    let api_key = cfg.llm_api_key()?;
    let model = llm::build_model(&cfg.llm, api_key)?;
    let engine = DecisionEngine::new(model);

    let store = LedgerStore::new(&cfg.agent.ledger_path);
    let settings = RunSettings {
        watchlist: cfg.watchlist.symbols.clone(),
        initial_cash: cfg.agent.initial_cash,
        limits: cfg.risk.limits(),
        dry_run: cli.dry_run,
    };

    // -- Run once ---------------------------------------------------------

    RunCoordinator::new(fetcher, engine, store, settings).run().await?;
    Ok(())
}

/// Map the first `TraderError` in the chain to its exit status; anything
/// else is 1.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<TraderError>())
        .map(TraderError::exit_code)
        .unwrap_or(1)
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("swiss_trader=info"));

    let json_logging = std::env::var("SWISS_TRADER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stdout)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stdout)
            .init();
    }
}
