use devgate::config::Config;
use devgate::gate::DevServerGate;
use devgate::pool::PoolConfig;
use devgate::proxy::ProxyServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("devgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let host_address = config.server.host_address();
    let grace_period = config.dev_server.shutdown_grace_period();
    let gate = Arc::new(DevServerGate::attach(
        config.dev_server.clone(),
        Some(host_address),
    )?);

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let proxy =
        ProxyServer::with_pool_config(bind_addr, Arc::clone(&gate), shutdown_rx, pool_config);
    let pool_stats = proxy.pool().stats();
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    info!("Stopping dev server...");
    gate.shutdown(grace_period).await;

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!(
        forwarded = pool_stats.get_forwarded_requests(),
        failed = pool_stats.get_failed_requests(),
        "Dev server traffic"
    );

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting dev server gate");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        host_address = %config.server.host_address(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    let dev = &config.dev_server;
    info!(
        source_path = %dev.source_path,
        script = %dev.script,
        package_manager = %dev.package_manager,
        readiness_marker = %dev.readiness_marker,
        "Dev server"
    );
    info!(
        startup_timeout_secs = dev.startup_timeout_secs,
        request_timeout_secs = dev.request_timeout_secs,
        shutdown_grace_period_secs = dev.shutdown_grace_period_secs,
        "Timeouts"
    );
}
