mod chat;
mod skill;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vesper_config::AppConfig;

const CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Parser)]
#[command(name = "vesper", version, about = "A persistent memory-centric AI agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Boot the gateway: runs the background gardener loop until interrupted.
    Start {
        #[arg(long)]
        verbose: bool,
    },
    /// Start an interactive REPL against a (new or existing) session.
    Chat {
        #[arg(long)]
        session: Option<uuid::Uuid>,
    },
    /// Print the current configuration.
    Config {
        #[arg(long)]
        json: bool,
    },
    /// Skill package management.
    Skill {
        #[command(subcommand)]
        command: SkillCommands,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum SkillCommands {
    /// List skills available in this build.
    List,
    /// Show a skill's input contract.
    Info { name: String },
    /// Search a skill marketplace (not available in this build).
    Search { query: String },
    /// Install a skill from a marketplace (not available in this build).
    Install { name: String },
    /// Remove an installed skill.
    Uninstall { name: String },
    /// Update an installed skill to its latest version.
    Update { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = Arc::new(AppConfig::load_from(CONFIG_PATH)?);

    let cli = Cli::parse();
    let exit_code = match cli.command.unwrap_or(Commands::Start { verbose: false }) {
        Commands::Start { verbose } => run_start(config, verbose).await,
        Commands::Chat { session } => chat::run_repl(config, session).await,
        Commands::Config { json } => run_config(&config, json),
        Commands::Skill { command } => skill::run(command),
    };

    match exit_code {
        Ok(()) => Ok(()),
        Err(error) => {
            eprintln!("error: {error:#}");
            std::process::exit(1);
        }
    }
}

fn run_config(config: &AppConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&config.describe())?);
    } else {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}

/// Boots the persistence layer and runs the gardener's tick loop on
/// `light_tick_secs` cadence until the process receives a shutdown signal.
/// There is no separate daemon/IPC process in this build — a channel embeds
/// this crate's `vesper_agent::process_message` directly for per-turn work,
/// and this command only owns the background maintenance loop.
async fn run_start(config: Arc<AppConfig>, verbose: bool) -> Result<()> {
    if verbose {
        eprintln!("starting with data dir {}", config.persistence.data_dir);
    }

    let store = vesper_memory::MemoryStore::new(vesper_memory::Store::open(&config.persistence).await?);
    let router = Arc::new(build_router(&config));
    let embeddings: Arc<dyn vesper_thinker::EmbeddingProvider> =
        Arc::new(vesper_runtime::OllamaEmbeddingProvider::new(config.llm.ollama_base_url.clone(), config.llm.ollama_model.clone()));

    let gardener = vesper_runtime::Gardener::new(
        store,
        router,
        embeddings,
        config.memory.clone(),
        config.extraction.clone(),
        config.scheduler.clone(),
    );

    println!("vesper gateway running (ctrl-c to stop)");
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(config.scheduler.light_tick_secs));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(error) = gardener.run_due_ticks(&vesper_runtime::LoggingSink).await {
                    tracing::warn!(component = "cli", cause = %error, "gardener tick failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("shutting down");
                return Ok(());
            }
        }
    }
}

pub(crate) fn build_router(config: &AppConfig) -> vesper_llm::LlmRouter {
    let timeout = std::time::Duration::from_secs(config.llm.request_timeout_secs);
    let providers: Vec<Arc<dyn vesper_llm::Provider>> = vec![
        Arc::new(vesper_llm::OllamaProvider::new(config.llm.ollama_base_url.clone(), config.llm.ollama_model.clone(), timeout)),
        Arc::new(vesper_llm::OpenRouterProvider::new(config.llm.openrouter_model.clone(), vesper_llm::Tier::Standard, timeout)),
        Arc::new(vesper_llm::OpenRouterProvider::new(config.llm.openrouter_capable_model.clone(), vesper_llm::Tier::Capable, timeout)),
    ];
    let caps = vesper_llm::BudgetCaps { daily_budget_usd: config.router.daily_budget_usd, monthly_budget_usd: config.router.monthly_budget_usd };
    let default_tier = match config.router.default_tier.as_str() {
        "fast" => vesper_llm::Tier::Fast,
        "capable" => vesper_llm::Tier::Capable,
        _ => vesper_llm::Tier::Standard,
    };
    vesper_llm::LlmRouter::new(providers, caps, default_tier)
}
