//! GovShield - Governance policy engine for generative-AI data flows
//!
//! Screens prompts against guardrails, detects and de-identifies sensitive
//! data, and reports compliance status from the audit log.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use govshield::{
    api::build_app,
    config::GovernanceConfig,
    pipeline::{GovernanceEngine, ScreenRequest},
    privacy::{Category, TokenizeKey},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "govshield")]
#[command(author = "GovShield Team")]
#[command(version)]
#[command(about = "Governance policy engine for generative-AI data flows")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "GOVSHIELD_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Screen text through guardrails, detection and transformation
    Scan {
        /// Text to scan (stdin when neither text nor --file is given)
        text: Option<String>,

        /// Read the text from a file
        #[arg(short, long, conflicts_with = "text")]
        file: Option<PathBuf>,

        /// Apply transformation rules as if persisting
        #[arg(long)]
        persist: bool,

        /// Comma-separated categories (default: configured set)
        #[arg(long, value_delimiter = ',')]
        categories: Vec<String>,

        /// Subject recorded on audit events
        #[arg(long, default_value = "cli")]
        subject: String,
    },

    /// Print the compliance report
    Report {
        /// Window size in days
        #[arg(long, default_value = "30")]
        days: i64,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },

    /// Generate a tokenize key
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays machine-readable
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("govshield={},tower_http={}", log_level, log_level).into());
    let json_layer = cli
        .log_json
        .then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!cli.log_json)
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();

    let config = GovernanceConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve { host, port } => {
            run_server(config, host, port).await?;
        }
        Commands::Scan {
            text,
            file,
            persist,
            categories,
            subject,
        } => {
            let text = read_input(text, file)?;
            run_scan(&config, subject, text, persist, &categories).await?;
        }
        Commands::Report { days } => {
            run_report(&config, days).await?;
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
        Commands::Keygen => {
            let key = TokenizeKey::generate();
            println!("{}", key.expose());
            eprintln!("Export it as GOVSHIELD_TOKENIZE_KEY or set transformation.tokenize_key_env");
        }
    }

    Ok(())
}

async fn run_server(config: GovernanceConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    let engine = Arc::new(GovernanceEngine::from_config(&config).await?);
    let app = build_app(engine, &config.server.cors_origins);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("GovShield API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down...");
        })
        .await?;

    Ok(())
}

fn read_input(text: Option<String>, file: Option<PathBuf>) -> Result<String> {
    match (text, file) {
        (Some(text), _) => Ok(text),
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display())),
        (None, None) => {
            std::io::read_to_string(std::io::stdin()).context("Failed to read stdin")
        }
    }
}

async fn run_scan(
    config: &GovernanceConfig,
    subject: String,
    text: String,
    persist: bool,
    categories: &[String],
) -> Result<()> {
    let engine = GovernanceEngine::from_config(config).await?;

    let mut request = ScreenRequest::new(subject, text);
    request.persist = persist;
    if !categories.is_empty() {
        let parsed = categories
            .iter()
            .map(|c| c.parse::<Category>())
            .collect::<govshield::Result<Vec<_>>>()?;
        request = request.with_categories(parsed);
    }

    let outcome = engine.screen(&request).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if !outcome.audit_ok {
        bail!("Audit events for this scan could not be recorded");
    }
    Ok(())
}

async fn run_report(config: &GovernanceConfig, days: i64) -> Result<()> {
    let engine = GovernanceEngine::from_config(config).await?;
    let report = engine.compliance_report(days).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn show_config(config: Option<&GovernanceConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    println!("{}", config.to_toml()?);
    Ok(())
}
