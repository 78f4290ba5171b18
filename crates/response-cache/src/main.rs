//! Command line access to a response cache directory
//!
//! Configuration comes from the environment (`CACHE_DIR`, `CACHE_VERSION`,
//! `MAX_CACHE_SIZE`, `CACHE_TTL_SECS`) and can be overridden with flags.

use chrono::Utc;
use clap::{Parser, Subcommand};
use response_cache::{ResponseCache, ResponseCacheConfig, Result};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "response-cache", version, about = "Inspect and edit a response cache")]
struct Cli {
    /// Cache directory (overrides CACHE_DIR)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Cache format version (overrides CACHE_VERSION)
    #[arg(long, global = true)]
    cache_version: Option<u32>,

    /// Size budget in bytes (overrides MAX_CACHE_SIZE)
    #[arg(long, global = true)]
    max_cache_size: Option<u64>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print cache statistics as JSON
    Stats,
    /// Write the cached body for a URL to stdout
    Get {
        url: String,
        /// Also return stale responses
        #[arg(long)]
        allow_stale: bool,
    },
    /// Store the contents of a file as the response for a URL
    Put {
        url: String,
        file: PathBuf,
        /// Lifetime in seconds, 0 never expires (defaults to CACHE_TTL_SECS)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Mark the response for a URL as expired without deleting it
    Expire { url: String },
    /// Delete the response for a URL
    Remove { url: String },
    /// Delete every cached response
    Clear,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize logging; stdout is reserved for command output
    let env_filter = EnvFilter::from_default_env().add_directive("response_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    };

    let cli = Cli::parse();
    let config = load_config(&cli);
    info!("Cache dir: {:?}", config.cache_dir);
    info!(
        "Max cache size: {} MB",
        config.max_cache_size / (1024 * 1024)
    );

    let cache = ResponseCache::open(config).await?;
    let code = run(&cache, cli.cmd).await;
    cache.close().await?;
    code
}

fn load_config(cli: &Cli) -> ResponseCacheConfig {
    let mut config = ResponseCacheConfig::from_env();
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = dir.clone();
    }
    if let Some(version) = cli.cache_version {
        config.cache_version = version;
    }
    if let Some(size) = cli.max_cache_size.filter(|&size| size > 0) {
        config.max_cache_size = size;
    }
    config
}

async fn run(cache: &ResponseCache, cmd: Command) -> Result<ExitCode> {
    match cmd {
        Command::Stats => {
            let stats = cache.stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Get { url, allow_stale } => {
            let Some(response) = cache.get(&url).await? else {
                warn!(url = %url, "Not cached");
                return Ok(ExitCode::FAILURE);
            };
            let fresh = response.is_fresh(Utc::now());
            info!(url = %url, fresh, expiry = ?response.expiry, "Cached response");
            if !fresh && !allow_stale {
                warn!(url = %url, "Cached response has expired");
                return Ok(ExitCode::FAILURE);
            }
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&response.body)?;
            stdout.flush()?;
        }
        Command::Put {
            url,
            file,
            ttl_secs,
        } => {
            let body = tokio::fs::read(&file).await?;
            let stored = cache.put(&url, body, ttl_secs).await?;
            return Ok(outcome(
                stored,
                &url,
                "Stored response",
                "Response is being written by another writer",
            ));
        }
        Command::Expire { url } => {
            let expired = cache.expire_now(&url).await?;
            return Ok(outcome(expired, &url, "Expired response", "Nothing to expire"));
        }
        Command::Remove { url } => {
            let removed = cache.remove(&url).await?;
            return Ok(outcome(removed, &url, "Removed response", "Nothing to remove"));
        }
        Command::Clear => cache.clear().await?,
    }
    Ok(ExitCode::SUCCESS)
}

/// Exit status of a command that may find nothing to act on
fn outcome(done: bool, url: &str, done_msg: &str, skipped_msg: &str) -> ExitCode {
    if done {
        info!(url = %url, "{}", done_msg);
        ExitCode::SUCCESS
    } else {
        warn!(url = %url, "{}", skipped_msg);
        ExitCode::FAILURE
    }
}
