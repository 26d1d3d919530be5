//! crxd - browser extension cache and update server

use anyhow::{Context, Result};
use clap::Parser;
use crx_common::Config;
use crxd::server::{self, AppState};
use crxd::{listener, logging, watcher, CacheStore, Coordinator, HttpSourceFactory};
use futures_util::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "crxd")]
#[command(about = "Cache browser extensions and serve an update manifest", long_about = None)]
#[command(version = crx_common::VERSION)]
struct Cli {
    /// Config file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (DEBUG, INFO, WARNING, ERROR, CRITICAL); overrides the config
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log = logging::init(cli.log_level.as_deref())?;

    info!("crxd v{} starting", crx_common::VERSION);

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    log.apply_config(&config);
    let specs = config.extension_specs()?;

    let store = CacheStore::open(&config.cache_dir).with_context(|| {
        format!("Failed to open cache directory {}", config.cache_dir.display())
    })?;
    let sources = HttpSourceFactory::new(config.timeout());
    let coordinator = Arc::new(Coordinator::new(
        Arc::new(store),
        Arc::new(sources),
        config.timeout(),
    ));
    coordinator.start(specs).await;

    let (reload_tx, reload_rx) = mpsc::unbounded_channel();
    let config_watcher = match watcher::ConfigWatcher::new(&cli.config, reload_tx.clone()) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!("Config hot reload disabled: {:#}", e);
            None
        }
    };
    #[cfg(unix)]
    spawn_sighup_handler(reload_tx);
    let reload_task = tokio::spawn(watcher::reload_loop(
        cli.config.clone(),
        reload_rx,
        coordinator.clone(),
        log.clone(),
        config.clone(),
    ));

    let mut listeners = Vec::new();
    if let Some(tcp) = &config.listen.tcp {
        listeners.push(listener::bind_tcp(tcp).await?);
    }
    if let Some(unix) = &config.listen.unix {
        listeners.push(listener::bind_unix(unix).await?);
    }
    let app = server::router(
        AppState {
            coordinator: coordinator.clone(),
            base: config.base.clone(),
            prefix: config.prefix.clone(),
        },
        &config.manifest_path,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });
    join_all(
        listeners
            .into_iter()
            .map(|l| listener::serve(l, app.clone(), shutdown.clone())),
    )
    .await;

    info!("Shutting down");
    drop(config_watcher);
    reload_task.abort();
    coordinator.stop().await;
    info!("crxd stopped");

    Ok(())
}

/// Reload the config on SIGHUP as well.
#[cfg(unix)]
fn spawn_sighup_handler(tx: mpsc::UnboundedSender<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to install SIGHUP handler: {}", e);
                return;
            }
        };
        while sighup.recv().await.is_some() {
            info!("SIGHUP received, reloading config");
            if tx.send(()).is_err() {
                break;
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
