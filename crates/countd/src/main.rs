use anyhow::{Context, Result};
use axum::Router;
use clap::{Parser, Subcommand};
use count_core::{
    bootstrap, flush, release, spawn_evictor, DurableLog, EventStore, FileLog, MemoryLog,
    TrustedProxies, Window,
};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};

mod http;

use http::AppState;

#[derive(Parser, Debug)]
#[command(name = "countd", version, about = "Sliding-window request counter")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(long, default_value = "0.0.0.0:3000")]
    bind: String,

    /// Trailing window in seconds.
    #[arg(long, default_value_t = 60)]
    window: u64,

    #[arg(long, default_value_t = 1000)]
    evict_interval_ms: u64,

    /// Durable log path, or `memory` to keep nothing across restarts.
    #[arg(long, default_value = "./requests.log")]
    log: String,

    #[arg(long)]
    redis: Option<String>,

    /// Bound on the startup load, the shutdown flush and closing the log.
    #[arg(long, default_value_t = 2000)]
    io_timeout_ms: u64,

    #[arg(long, default_value = "./proxies.toml")]
    proxies: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Proxies {
        #[command(subcommand)]
        command: ProxyCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ProxyCommands {
    Add { entry: String },
    Remove { entry: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Some(command) = &cli.command {
        return handle_admin(command, &cli);
    }

    let window = Window::from_secs(cli.window)?;
    let io_timeout = Duration::from_millis(cli.io_timeout_ms);
    let proxies = Arc::new(TrustedProxies::load(&cli.proxies)?);
    let log = open_log(&cli).await?;

    let store = Arc::new(EventStore::new());
    bootstrap(&store, log.as_ref(), window, io_timeout).await;

    let evictor = spawn_evictor(
        store.clone(),
        window,
        Duration::from_millis(cli.evict_interval_ms.max(1)),
    );

    let listener = TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("bind {}", cli.bind))?;
    info!(bind = %listener.local_addr()?, window_secs = window.as_secs(), "countd listening");

    let app = http::router(AppState {
        store: store.clone(),
        proxies,
        window,
    });
    let served = serve_until_signal(listener, app, io_timeout).await;
    if let Err(err) = &served {
        error!(%err, "http server stopped with error");
    }

    evictor.abort();
    flush(&store, log.as_ref(), io_timeout).await;
    release(log.as_ref(), io_timeout).await;
    info!("countd stopped");

    served
}

/// Serves until a shutdown signal, then gives open connections `grace` to
/// finish before dropping the server.
async fn serve_until_signal(listener: TcpListener, app: Router, grace: Duration) -> Result<()> {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = stop_rx.changed().await;
    });
    let mut server = tokio::spawn(server.into_future());

    let joined = tokio::select! {
        joined = &mut server => joined,
        _ = shutdown_signal() => {
            let _ = stop_tx.send(true);
            match timeout(grace, &mut server).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(?grace, "connections still open, stopping server");
                    server.abort();
                    return Ok(());
                }
            }
        }
    };
    joined.context("http server task")?.context("serve http")
}

fn handle_admin(command: &Commands, cli: &Cli) -> Result<()> {
    match command {
        Commands::Proxies { command } => match command {
            ProxyCommands::Add { entry } => {
                TrustedProxies::add(&cli.proxies, entry)?;
                println!("added {entry}");
            }
            ProxyCommands::Remove { entry } => {
                TrustedProxies::remove(&cli.proxies, entry)?;
                println!("removed {entry}");
            }
            ProxyCommands::List => {
                for entry in TrustedProxies::load(&cli.proxies)?.trusted {
                    println!("{entry}");
                }
            }
        },
    }
    Ok(())
}

async fn open_log(cli: &Cli) -> Result<Arc<dyn DurableLog>> {
    if let Some(url) = cli.redis.clone() {
        #[cfg(feature = "redis")]
        {
            let client = redis::Client::open(url).context("parse redis url")?;
            client
                .get_multiplexed_async_connection()
                .await
                .context("connect to redis")?;
            info!("using redis durable log");
            let log = count_core::log::redis_log::RedisLog::new(client, "countd:requests");
            return Ok(Arc::new(log));
        }
        #[cfg(not(feature = "redis"))]
        {
            let _ = url;
            warn!("redis feature not enabled, using --log");
        }
    }
    if cli.log == "memory" {
        warn!("memory log selected, counts will not survive a restart");
        return Ok(Arc::new(MemoryLog::new()));
    }
    Ok(Arc::new(FileLog::open(&cli.log)?))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(%err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested, no longer accepting requests");
}
