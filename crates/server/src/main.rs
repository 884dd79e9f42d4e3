//! Keygate - Main entry point
//!
//! On-demand TLS certificates for dynamic hostnames, gated by a domain registry.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use keygate_common::MemoryRegistry;
use keygate_config::{validate, Config, LogLevel};
use keygate_server::bootstrap::{BootstrapCertificateGenerator, Subject};
use keygate_server::{init_tracing, Engine};

const DEFAULT_CONFIG_PATH: &str = "keygate.toml";

/// Keygate - on-demand TLS certificate engine
#[derive(Parser, Debug)]
#[command(name = "keygate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        env = "KEYGATE_CONFIG",
        default_value = DEFAULT_CONFIG_PATH
    )]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the TLS engine (default)
    Run,
    /// Validate the configuration file and exit
    Check,
    /// Generate a self-signed certificate and key
    GenCert {
        /// Hostnames or IP addresses to include as SANs
        #[arg(long = "host", required = true)]
        hosts: Vec<String>,

        /// Subject common name (defaults to the first host)
        #[arg(long = "common-name", default_value = "")]
        common_name: String,

        /// Certificate output path
        #[arg(long = "cert", default_value = "certs/admin.crt")]
        cert: PathBuf,

        /// Private key output path
        #[arg(long = "key", default_value = "certs/admin.key")]
        key: PathBuf,

        /// Do not add 127.0.0.1, ::1 and localhost
        #[arg(long = "no-loopback")]
        no_loopback: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => run_engine(cli.config, cli.verbose),
        Some(Commands::Check) => check_config(cli.config),
        Some(Commands::GenCert {
            hosts,
            common_name,
            cert,
            key,
            no_loopback,
        }) => gen_cert(&hosts, common_name, cert, key, no_loopback),
    }
}

/// Check configuration file and exit
fn check_config(config_path: PathBuf) -> Result<()> {
    // Initialize minimal logging for config check
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    info!("Checking configuration file: {}", config_path.display());
    let config = Config::from_file(&config_path).context("Failed to load configuration file")?;

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(validate::validate_all(&config));

    for warning in &result.warnings {
        warn!("{}", warning);
    }
    if !result.is_ok() {
        for error in &result.errors {
            tracing::error!("{}", error);
        }
        anyhow::bail!(
            "configuration check failed with {} error(s)",
            result.errors.len()
        );
    }

    info!("Configuration check successful:");
    info!("  - mode: {:?}", config.mode);
    info!("  - admin hostname: {}", config.admin.hostname);
    info!("  - {} domain(s)", config.domains.len());

    println!(
        "keygate: configuration file {} check is successful",
        config_path.display()
    );
    Ok(())
}

/// Generate a self-signed certificate and exit
fn gen_cert(
    hosts: &[String],
    common_name: String,
    cert: PathBuf,
    key: PathBuf,
    no_loopback: bool,
) -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let generated = BootstrapCertificateGenerator::new()
        .with_loopback(!no_loopback)
        .generate(&Subject::new(common_name), hosts, &cert, &key)
        .context("Failed to generate certificate")?;

    println!(
        "keygate: wrote certificate for {} to {} (valid until {})",
        generated.common_name,
        cert.display(),
        generated.not_after
    );
    Ok(())
}

/// Run the engine until SIGTERM or SIGINT
fn run_engine(config_path: PathBuf, verbose: bool) -> Result<()> {
    let mut config = Config::from_file(&config_path).with_context(|| {
        format!("Failed to load configuration from {}", config_path.display())
    })?;
    if verbose {
        config.logging.level = LogLevel::Debug;
    }

    init_tracing(&config.logging).context("Failed to initialize logging")?;
    info!("Loaded configuration from: {}", config_path.display());

    let registry = Arc::new(MemoryRegistry::with_records(config.domains.clone()));

    // Create runtime for the engine; startup errors surface before any bind
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let engine = Engine::build(config, registry).context("Failed to start certificate engine")?;
        engine
            .run(config_path)
            .await
            .context("Certificate engine failed")
    })?;

    info!("Keygate stopped");
    Ok(())
}
