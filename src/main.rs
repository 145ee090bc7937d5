use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::io::Write;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use getpool::{config, Core};

#[derive(Parser)]
#[command(name = "getpool")]
#[command(version, about = "Pooled HTTP GET client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (environment variables are used when omitted)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a URL and print the body of a 200 response
    Get {
        /// Absolute URL
        url: String,

        /// Query parameter as key=value (repeatable)
        #[arg(short = 'q', long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Request header as name:value (repeatable)
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },

    /// Print the effective configuration
    Config,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw.split_once('=').unwrap_or((raw, ""));
    if key.is_empty() {
        return Err(format!("missing key in parameter: {}", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected name:value, got: {}", raw))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<ExitCode> {
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Get { url, params, headers } => {
            let core = Core::new(config)?;
            let client = core.client();

            let params: BTreeMap<String, String> = params.into_iter().collect();
            let headers: BTreeMap<String, String> = headers.into_iter().collect();

            let body = client
                .execute_get(
                    Some(&url),
                    (!params.is_empty()).then_some(&params),
                    (!headers.is_empty()).then_some(&headers),
                )
                .await;

            match body {
                Some(body) => {
                    let mut stdout = std::io::stdout().lock();
                    stdout
                        .write_all(body.as_bytes())
                        .context("Failed to write response body")?;
                    stdout.flush()?;
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    tracing::warn!(url = %url, "No result");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Config => {
            let yaml = serde_yaml::to_string(&config).context("Failed to render configuration")?;
            print!("{}", yaml);
            Ok(ExitCode::SUCCESS)
        }
    }
}
