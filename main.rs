//! `advisor-exporter` command line entry point.

// ============================================================================
// SECTION 1: IMPORTS
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use advisor_exporter::{
    build_registry, init_logging, serve, ExporterConfig, ExporterError, ExporterResult, EXPORTER_NAME,
    EXPORTER_VERSION,
};

// ============================================================================
// SECTION 2: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 2.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Advisor Exporter CLI
#[derive(Parser, Debug)]
#[command(
    name = "advisor-exporter",
    version,
    about = "Prometheus exporter for Trusted Advisor service limits",
    long_about = "Polls the Trusted Advisor service-limit checks of every configured \
                  account, caches each account's answer for five minutes and serves \
                  the limits and current usage as Prometheus gauges."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "advisor-exporter.toml", env = "ADVISOR_EXPORTER_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "ADVISOR_EXPORTER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "ADVISOR_EXPORTER_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the scrape server (default)
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the metrics this exporter can publish
    Describe,

    /// Run one collection and print the exposition text
    Collect,

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 2.2 CLI Handler Functions
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> ExporterResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match ExporterConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Instance name: {}", config.exporter.instance_name);
            println!("  • Namespace: {}", config.namespace().unwrap_or("(none)"));
            println!("  • Listening on: {}{}", config.server.address, config.server.path);
            println!(
                "  • Scrape timeout: {}",
                humantime::format_duration(config.server.scrape_timeout)
            );
            println!(
                "  • Trusted Advisor: {}",
                if config.advisor.enabled { "enabled" } else { "disabled" }
            );
            println!("  • Accounts: {}", config.advisor.accounts.len());
            for account in &config.advisor.accounts {
                println!("    - {} via {}", account.account_id, account.endpoint);
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(ExporterError::Config(e))
        }
    }
}

fn handle_generate_config(output: Option<&Path>) -> ExporterResult<()> {
    let config_str = ExporterConfig::generate_default()?;

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

fn handle_describe(config: &ExporterConfig) -> ExporterResult<()> {
    let registry = build_registry(config)?;
    for descriptor in registry.describe() {
        println!(
            "{} [{}]\n    {}",
            descriptor.fq_name(registry.namespace()),
            descriptor.labels.join(", "),
            descriptor.help
        );
    }
    Ok(())
}

async fn handle_collect(config: &ExporterConfig) -> ExporterResult<()> {
    let registry = build_registry(config)?;
    let report = registry.scrape().await;
    print!("{}", registry.render(&report.samples)?);

    for (collector, error) in &report.failures {
        eprintln!("❌ {}: {}", collector, error);
    }
    match report.failures.into_iter().next() {
        Some((_, error)) => Err(error.into()),
        None => Ok(()),
    }
}

fn handle_version() {
    println!("📈 {} v{}", EXPORTER_NAME, EXPORTER_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Collectors:");
    println!("  • Trusted Advisor service limits and usage");
}

// ----------------------------------------------------------------------------
// 2.3 Server Lifecycle
// ----------------------------------------------------------------------------

async fn handle_run(config: ExporterConfig) -> ExporterResult<()> {
    let registry = Arc::new(build_registry(&config)?);
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        token.cancel();
    });

    info!(
        target: "advisor_exporter::main",
        instance = %config.exporter.instance_name,
        accounts = config.advisor.accounts.len(),
        "Exporter starting"
    );

    serve(registry, &config.server, shutdown).await
}

#[cfg(unix)]
async fn wait_for_signal() {
    let sigterm = signal::unix::signal(signal::unix::SignalKind::terminate());
    let sigint = signal::unix::signal(signal::unix::SignalKind::interrupt());

    match (sigterm, sigint) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!(target: "advisor_exporter::main", "Received SIGTERM"),
                _ = sigint.recv() => info!(target: "advisor_exporter::main", "Received SIGINT"),
            }
        }
        _ => {
            warn!(target: "advisor_exporter::main", "Failed to install signal handlers, falling back to ctrl-c");
            if signal::ctrl_c().await.is_ok() {
                info!(target: "advisor_exporter::main", "Received ctrl-c");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if signal::ctrl_c().await.is_ok() {
        info!(target: "advisor_exporter::main", "Received ctrl-c");
    }
}

// ============================================================================
// SECTION 3: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that need no logging or loaded configuration
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config_missing = !cli.config.exists();
    let config = if config_missing {
        ExporterConfig::from_env().context("Failed to load config from environment")?
    } else {
        ExporterConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if config_missing {
        warn!(
            target: "advisor_exporter::main",
            path = %cli.config.display(),
            "Config file not found, using defaults and environment"
        );
    }

    match cli.command {
        Some(Commands::Describe) => handle_describe(&config)?,
        Some(Commands::Collect) => handle_collect(&config).await?,
        Some(Commands::Run) | None => {
            info!("📈 {} v{}", EXPORTER_NAME, EXPORTER_VERSION);
            handle_run(config).await?;
        }
        Some(Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. }) => {}
    }

    Ok(())
}
