use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use slotkeeper::config::Configuration;
use slotkeeper::engine::Engine;
use slotkeeper::notify::{self, AuditLog, Collaborator, NotifyHub};
use slotkeeper::{compactor, observability, tls, wire};

const NOTICE_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Resolves on ctrl-c or, on Unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("cannot listen for SIGTERM: {e}"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

/// Re-read the business configuration on SIGHUP.
#[cfg(unix)]
fn spawn_config_reloader(engine: Arc<Engine>, path: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("cannot listen for SIGHUP, config reload disabled: {e}");
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP: reloading {}", path.display());
            let result = Configuration::load(&path)
                .map_err(|e| e.to_string())
                .and_then(|cfg| engine.replace_config(cfg).map_err(|e| e.to_string()));
            if let Err(e) = result {
                tracing::error!("config reload failed, keeping current version: {e}");
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("SLOTKEEPER_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    observability::init(metrics_port)?;

    let port = std::env::var("SLOTKEEPER_PORT").unwrap_or_else(|_| "5433".into());
    let bind = std::env::var("SLOTKEEPER_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = PathBuf::from(std::env::var("SLOTKEEPER_DATA_DIR").unwrap_or_else(|_| "./data".into()));
    let config_path =
        PathBuf::from(std::env::var("SLOTKEEPER_CONFIG").unwrap_or_else(|_| "./slotkeeper.toml".into()));
    let password = std::env::var("SLOTKEEPER_PASSWORD").unwrap_or_else(|_| "slotkeeper".into());
    let max_connections: usize = env_or("SLOTKEEPER_MAX_CONNECTIONS", 256);
    let compact_threshold: u64 = env_or("SLOTKEEPER_COMPACT_THRESHOLD", 1000);

    let tls_cert = std::env::var("SLOTKEEPER_TLS_CERT").ok();
    let tls_key = std::env::var("SLOTKEEPER_TLS_KEY").ok();
    let tls_acceptor = tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    let config = Configuration::load(&config_path)?;
    info!(
        version = config.version,
        timezone = %config.timezone,
        services = config.services.len(),
        agents = config.agents.len(),
        "loaded {}",
        config_path.display()
    );

    std::fs::create_dir_all(&data_dir)?;
    let notify_hub = Arc::new(NotifyHub::new());
    let collaborators: Vec<Arc<dyn Collaborator>> = vec![Arc::new(AuditLog)];
    let dispatcher = notify::spawn_dispatcher(&notify_hub, collaborators, NOTICE_DELIVERY_TIMEOUT);

    let engine = Arc::new(Engine::new(data_dir.join("bookings.wal"), config, notify_hub)?);
    tokio::spawn(compactor::run_compactor(engine.clone(), compact_threshold));
    #[cfg(unix)]
    spawn_config_reloader(engine.clone(), config_path.clone());

    let semaphore = Arc::new(Semaphore::new(max_connections));
    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("slotkeeper listening on {addr}");
    info!("  data_dir: {}", data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let shutdown = shutdown_signal();
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
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, engine, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(DRAIN_TIMEOUT);
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    dispatcher.abort();
    info!("slotkeeper stopped");
    Ok(())
}
