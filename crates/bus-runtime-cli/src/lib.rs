//! # Bus Runtime CLI
//!
//! Command-line interface for the bus runtime.
//!
//! This module provides CLI commands for:
//! - Configuration validation and display
//! - Soak runs that drive a transport over an in-memory broker

use bus_runtime::{BusConfig, BusError, ConfigurationError};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod soak;

pub use soak::{run_soak, SoakOptions, SoakReport};

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "BUS_RUNTIME_CONFIG";

/// Prefix of environment variables that override configuration values
pub const CONFIG_ENV_PREFIX: &str = "BUS";

// ============================================================================
// CLI Structure
// ============================================================================

/// Bus runtime CLI - transactional message delivery
#[derive(Parser)]
#[command(name = "bus-runtime")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Transactional message bus runtime")]
pub struct Cli {
    /// Configuration file path (TOML, YAML or JSON by extension)
    #[arg(short, long, env = CONFIG_PATH_ENV)]
    pub config: Option<PathBuf>,

    /// Logging level or filter directive
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate configuration
    Config {
        /// Print the resolved configuration
        #[arg(short, long)]
        show: bool,

        /// Output format for configuration
        #[arg(short = 'f', long, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// Drive the configured transport over an in-memory broker
    Soak {
        /// Number of messages to send
        #[arg(short, long, default_value = "1000")]
        messages: usize,

        /// Number of concurrent receive loops
        #[arg(short, long, default_value = "4")]
        workers: usize,

        /// Inject a fault and reject a delivery every K processed messages
        #[arg(long)]
        fail_every: Option<u32>,

        /// Give up if not every message arrived within this many seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },
}

/// Configuration format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// JSON format
    Json,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Soak run failed: {message}")]
    SoakFailed { message: String },
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Bus(_) => 2,
            Self::InvalidArgument { .. } => 3,
            Self::Io(_) => 4,
            Self::SoakFailed { .. } => 5,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] ConfigurationError),
}

// ============================================================================
// Configuration and Logging
// ============================================================================

/// Load configuration from an optional file, then `BUS__*` environment variables
///
/// Every setting has a default, so no file and no variables still yields a
/// valid configuration. The result is validated before it is returned.
pub fn load_configuration(path: Option<&Path>) -> Result<BusConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        if !path.is_file() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        info!(path = %path.display(), "Loading configuration file");
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let settings = builder
        .add_source(config::Environment::with_prefix(CONFIG_ENV_PREFIX).separator("__"))
        .build()?;

    let config: BusConfig = settings.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Install the global tracing subscriber; logs go to stderr
pub fn initialize_logging(level: &str, json: bool) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| CliError::InvalidArgument {
            arg: "--log-level".to_string(),
            message: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    installed.map_err(|e| CliError::Io(std::io::Error::other(e)))
}

/// Render configuration in the requested format
pub fn render_config(config: &BusConfig, format: &ConfigFormat) -> Result<String, CliError> {
    let rendered = match format {
        ConfigFormat::Json => {
            serde_json::to_string_pretty(config).map_err(std::io::Error::other)?
        }
        ConfigFormat::Yaml => serde_yaml::to_string(config).map_err(std::io::Error::other)?,
    };
    Ok(rendered)
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli.log_level, cli.json_logs)?;

    let config = load_configuration(cli.config.as_deref())?;

    match cli.command {
        Commands::Config { show, format } => execute_config_command(&config, show, format),
        Commands::Soak {
            messages,
            workers,
            fail_every,
            timeout_secs,
        } => {
            let options = SoakOptions {
                messages,
                workers,
                fail_every,
                timeout: Duration::from_secs(timeout_secs),
            };
            execute_soak_command(&config, &options).await
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn execute_config_command(
    config: &BusConfig,
    show: bool,
    format: ConfigFormat,
) -> Result<(), CliError> {
    info!(
        delivery_model = ?config.transport.delivery_model,
        input_queue = ?config.transport.input_queue,
        "Configuration is valid"
    );

    if show {
        println!("{}", render_config(config, &format)?);
    }
    Ok(())
}

async fn execute_soak_command(config: &BusConfig, options: &SoakOptions) -> Result<(), CliError> {
    info!(
        messages = options.messages,
        workers = options.workers,
        fail_every = ?options.fail_every,
        "Starting soak run"
    );

    let report = run_soak(config, options).await?;

    println!("delivery model: {:?}", report.delivery_model);
    println!("sent:           {}", report.sent);
    println!("received:       {}", report.received);
    println!("redelivered:    {}", report.redelivered);
    println!("duplicates:     {}", report.duplicates);
    println!("faults:         {}", report.faults_injected);
    Ok(())
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
