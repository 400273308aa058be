use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Semaphore, watch};
use tracing::info;

use rentledger::auth::TokenAuth;
use rentledger::catalog::load_catalog;
use rentledger::config::{Config, StoreKind};
use rentledger::dispatch::Dispatcher;
use rentledger::flush::FlushCoordinator;
use rentledger::ledger::Ledger;
use rentledger::notify::NotifyHub;
use rentledger::store::{CsvStore, RecordStore, SnapshotStore};
use rentledger::wire;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rentledger=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    rentledger::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let store: Arc<dyn RecordStore> = match config.store {
        StoreKind::Csv => Arc::new(CsvStore::new(config.store_path())),
        StoreKind::Snapshot => Arc::new(SnapshotStore::new(config.store_path())),
    };
    let catalog = load_catalog(&config.items_file).await?;
    if catalog.is_empty() {
        tracing::warn!("no items in {}; every booking will be rejected", config.items_file.display());
    }

    // Load-then-serve: nothing is accepted until the ledger mirrors the store.
    let notify = Arc::new(NotifyHub::new());
    let ledger = Arc::new(Ledger::new(notify));
    let coordinator = Arc::new(FlushCoordinator::new(ledger.clone(), store.clone(), config.flush_config()));
    coordinator.bootstrap(catalog).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flusher = tokio::spawn(coordinator.clone().run(shutdown_rx));

    let dispatcher = Arc::new(Dispatcher::new(ledger.clone(), config.admins.clone(), config.command_timeout));
    let auth = TokenAuth::new(config.chat_token.clone());
    let semaphore = Arc::new(Semaphore::new(config.max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("rentledger listening on {addr}");
    info!("  store: {}", store.describe());
    info!("  items: {}", ledger.item_count());
    info!("  max_connections: {}", config.max_connections);
    info!("  auth: {}", if auth.required() { "token" } else { "disabled" });
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(rentledger::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(rentledger::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(rentledger::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let dispatcher = dispatcher.clone();
                let auth = auth.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, dispatcher, auth).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(rentledger::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == config.max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = config.max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    // The flusher's final flush runs once it sees the signal.
    let _ = shutdown_tx.send(true);
    match flusher.await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::error!("final flush failed: {e}"),
        Err(e) => tracing::error!("flush task panicked: {e}"),
    }

    info!("rentledger stopped");
    Ok(())
}
