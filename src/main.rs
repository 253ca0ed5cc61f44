use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use syncbridge::api::{serve, AppState};
use syncbridge::config::AppConfig;
use syncbridge::logging::{init_logging, LogLevel, LoggingConfig};
use syncbridge::Engine;

#[derive(Parser, Debug)]
#[command(name = "syncbridge")]
#[command(version)]
#[command(about = "Field mapping and webhook delivery engine")]
struct Cli {
    /// Path to a TOML config file (defaults to ./syncbridge.toml when present)
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Suppress all log output except errors
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(long, short, global = true, action = ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Address to bind to (overrides server.bind_address)
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on (overrides server.port)
        #[arg(long, short)]
        port: Option<u16>,
    },
    /// Probe a running server's /health endpoint
    Health {
        /// Base URL of the server (defaults to the configured address)
        #[arg(long)]
        url: Option<String>,

        /// Request timeout in seconds
        #[arg(long, default_value = "5")]
        timeout: u64,
    },
    /// Print the effective configuration as TOML (secrets redacted)
    Config,
}

/// Exit codes for the health command
mod exit_codes {
    use std::process::ExitCode;

    /// Server answered and reports itself healthy
    pub fn healthy() -> ExitCode {
        ExitCode::SUCCESS
    }

    /// Server unreachable or unhealthy
    pub fn unhealthy() -> ExitCode {
        ExitCode::from(1)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;

    let level = if cli.quiet {
        LogLevel::Error
    } else {
        config.logging.level
    };
    init_logging(
        LoggingConfig::new()
            .with_level(level)
            .with_verbosity(cli.verbose),
    );

    match cli.command {
        Commands::Serve { bind, port } => {
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }

            let engine = Arc::new(Engine::init(config).await?);
            serve(AppState::new(engine)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Health { url, timeout } => {
            let base = url.unwrap_or_else(|| format!("http://{}", config.listen_address()));
            Ok(probe_health(&base, Duration::from_secs(timeout)).await)
        }
        Commands::Config => {
            print!("{}", config.to_redacted_toml()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn probe_health(base: &str, timeout: Duration) -> ExitCode {
    let url = format!("{}/health", base.trim_end_matches('/'));
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            eprintln!("failed to create HTTP client: {}", e);
            return exit_codes::unhealthy();
        }
    };

    match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => {
            let body = response.text().await.unwrap_or_default();
            println!("{}", body);
            exit_codes::healthy()
        }
        Ok(response) => {
            eprintln!("{} answered {}", url, response.status());
            exit_codes::unhealthy()
        }
        Err(e) => {
            eprintln!("{} unreachable: {}", url, e);
            exit_codes::unhealthy()
        }
    }
}
