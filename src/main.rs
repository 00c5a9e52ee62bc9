use hostproxy::config::{conf_dir, default_config_path, load_config, load_from_path};
use hostproxy::logging::{self, LogFiles};
use hostproxy::pipeline::{PipelineFactory, TransportConfig};
use hostproxy::proxy::{ProxyHandler, ProxyServer};
use hostproxy::ratelimit::{self, RateLimiter};
use hostproxy::routes::ProxyConfig;
use hostproxy::watcher::watch_config_file;
use hostproxy::{tls, PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Time allowed for listeners to finish after shutdown is signalled
const SHUTDOWN_GRACE: Duration = Duration::from_secs(8);
/// Interval between counter reports
const STATS_INTERVAL: Duration = Duration::from_secs(300);
/// Interval between rate limit window purges
const PURGE_INTERVAL: Duration = Duration::from_secs(60);
/// TLS server name used for generated certificates
const SERVER_NAME: &str = "private.proxy";

/// Listener address from `var`, `None` when set to an empty string
fn listen_addr(var: &str, default: &str) -> anyhow::Result<Option<SocketAddr>> {
    let value = std::env::var(var).unwrap_or_else(|_| default.to_string());
    if value.trim().is_empty() {
        return Ok(None);
    }
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", var, value, e))
}

fn watch_interval() -> Duration {
    std::env::var("HOSTPROXY_WATCH_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(30))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_files = logging::init()?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let factory = PipelineFactory::new(TransportConfig::default());
    let config = load_config(&config_path, factory).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    let config = Arc::new(config);

    let settings = config.settings();
    log_files.apply(&settings.access_log, &settings.error_log);

    let http_addr = listen_addr("HOSTPROXY_HTTP_ADDR", "0.0.0.0:80")?;
    let https_addr = listen_addr("HOSTPROXY_HTTPS_ADDR", "0.0.0.0:443")?;
    print_startup_banner(&config, &config_path, http_addr, https_addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handler = Arc::new(ProxyHandler::new(Arc::clone(&config)));
    let limiter = Arc::new(RateLimiter::new(Arc::clone(&config)));

    let http_handle = http_addr.map(|addr| {
        let server = ProxyServer::new(addr, Arc::clone(&handler), shutdown_rx.clone())
            .with_rate_limiter(Arc::clone(&limiter));
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "HTTP proxy server error");
            }
        })
    });

    let https_handle = match https_addr {
        Some(addr) => {
            let acceptor = tls::load_or_generate(&settings.tls_cert, &settings.tls_key, SERVER_NAME, &conf_dir())?;
            let server = ProxyServer::new(addr, Arc::clone(&handler), shutdown_rx.clone())
                .with_rate_limiter(Arc::clone(&limiter))
                .with_tls(acceptor);
            Some(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "HTTPS proxy server error");
                }
            }))
        }
        None => None,
    };

    if http_handle.is_none() && https_handle.is_none() {
        anyhow::bail!("Both HOSTPROXY_HTTP_ADDR and HOSTPROXY_HTTPS_ADDR are disabled");
    }

    let watcher_handle = tokio::spawn(watch_config_file(
        Some(Arc::clone(&config)),
        config_path.clone(),
        watch_interval(),
        shutdown_rx.clone(),
    ));

    tokio::spawn(ratelimit::purge_loop(Arc::clone(&limiter), PURGE_INTERVAL, shutdown_rx.clone()));
    tokio::spawn(stats_loop(Arc::clone(&handler), Arc::clone(&limiter), shutdown_rx.clone()));

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    reload(&config, &config_path, &log_files);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        if let Some(handle) = http_handle {
            let _ = handle.await;
        }
        if let Some(handle) = https_handle {
            let _ = handle.await;
        }
        let _ = watcher_handle.await;
    })
    .await;

    handler.close_idle_connections();

    info!("Shutdown complete");
    Ok(())
}

fn reload(config: &ProxyConfig, path: &Path, log_files: &LogFiles) {
    match load_from_path(config, path) {
        Ok(()) => {
            let settings = config.settings();
            log_files.apply(&settings.access_log, &settings.error_log);
            info!(hosts = ?config.hostnames(), "Configuration reloaded successfully");
        }
        Err(e) => {
            error!(error = %e, "Failed to reload configuration, keeping previous");
        }
    }
}

async fn stats_loop(handler: Arc<ProxyHandler>, limiter: Arc<RateLimiter>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(STATS_INTERVAL) => {
                let stats = handler.stats().snapshot();
                info!(
                    forwarded = stats.forwarded,
                    not_found = stats.not_found,
                    build_failures = stats.build_failures,
                    bad_gateway = stats.bad_gateway,
                    rate_limited = stats.rate_limited,
                    tracked_clients = limiter.tracked_clients(),
                    generation = handler.config().generation(),
                    "Proxy statistics"
                );
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn print_startup_banner(
    config: &ProxyConfig,
    path: &Path,
    http_addr: Option<SocketAddr>,
    https_addr: Option<SocketAddr>,
) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");

    let settings = config.settings();
    info!(
        config = %path.display(),
        http = ?http_addr,
        https = ?https_addr,
        watch_interval_secs = watch_interval().as_secs(),
        "Server configuration"
    );
    info!(
        max_requests = settings.max_requests,
        window_secs = settings.window_size.as_secs(),
        "Rate limit settings"
    );
    let transport = config.factory().transport_config();
    info!(
        max_idle_per_host = transport.idle_per_pipeline(),
        idle_timeout_secs = transport.idle_timeout.as_secs(),
        tls_handshake_timeout_secs = transport.tls_handshake_timeout.as_secs(),
        "Backend transport settings"
    );
    info!(hosts = ?config.hostnames(), "Configured hosts");
}
