use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use count_core::{FileLog, Window};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "countctl", version, about = "Request counter client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask a running daemon for the current count. Counts as a request.
    Count {
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        url: String,

        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
    /// Inspect or rewrite a durable log while the daemon is stopped.
    Log {
        #[command(subcommand)]
        command: LogCommands,
    },
}

#[derive(Subcommand, Debug)]
enum LogCommands {
    Stats {
        #[arg(long, default_value = "./requests.log")]
        path: PathBuf,
    },
    /// Drop records older than the window and collapse duplicates.
    Compact {
        #[arg(long, default_value = "./requests.log")]
        path: PathBuf,

        #[arg(long, default_value_t = 60)]
        window: u64,
    },
}

#[derive(Debug, Deserialize)]
struct CountBody {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Count { url, timeout } => count(&url, Duration::from_secs(timeout)).await,
        Commands::Log { command } => match command {
            LogCommands::Stats { path } => stats(&path),
            LogCommands::Compact { path, window } => compact(&path, Window::from_secs(window)?),
        },
    }
}

async fn count(base: &str, timeout: Duration) -> Result<()> {
    let url = format!("{}/count", base.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("build http client")?;
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("request {url}"))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.json::<ErrorBody>().await.context("decode error body")?;
        anyhow::bail!("server returned {status}: {}", body.message);
    }
    let body = response.json::<CountBody>().await.context("decode count")?;
    println!("{}", body.count);
    Ok(())
}

fn stats(path: &Path) -> Result<()> {
    let stats = FileLog::stats(path).with_context(|| format!("read {}", path.display()))?;
    println!("records   {}", stats.records);
    println!("malformed {}", stats.malformed);
    println!("last id   {}", stats.last_id);
    println!("oldest    {}", local(stats.oldest));
    println!("newest    {}", local(stats.newest));
    Ok(())
}

fn compact(path: &Path, window: Window) -> Result<()> {
    let keep_from = window.cutoff(Utc::now());
    let report = FileLog::compact(path, keep_from).with_context(|| format!("compact {}", path.display()))?;
    info!(path = %path.display(), kept = report.kept, "log compacted");
    println!(
        "kept {} expired {} duplicates {} malformed {}",
        report.kept, report.expired, report.duplicates, report.malformed
    );
    Ok(())
}

fn local(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => "-".into(),
    }
}
