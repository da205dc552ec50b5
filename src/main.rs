use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use wakegate::config::Config;
use wakegate::pool::PoolConfig;
use wakegate::process::CommandSpawner;
use wakegate::proxy::ProxyServer;
use wakegate::setup::SetupRoutes;
use wakegate::supervisor::{ConfigFile, Supervisor, SupervisorOptions};
use wakegate::token::{resolve_token, GatewayToken};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Optional config file; environment wins over it
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("wakegate.toml"));

    let mut config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;

    let token = resolve_token(
        config.gateway.token.as_deref(),
        &config.state.token_path(),
    );

    print_startup_banner(&config, &token);

    let bind_ip: IpAddr = config
        .server
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e))?;
    let bind_addr = SocketAddr::new(bind_ip, config.server.port);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway_config_path = config.state.config_path();
    let supervisor = Supervisor::new(
        SupervisorOptions::from_config(&config, &token)?,
        Arc::new(CommandSpawner),
        Arc::new(ConfigFile::new(&gateway_config_path)),
    );

    let setup = SetupRoutes::new(
        Arc::clone(&supervisor),
        config.server.setup_password.clone(),
        gateway_config_path,
        token.source(),
    );

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        request_timeout: config.server.request_timeout(),
    };

    let proxy = ProxyServer::with_pool_config(
        bind_addr,
        Arc::clone(&supervisor),
        setup,
        shutdown_rx,
        pool_config,
    );

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or restart request (SIGHUP)
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
                    info!("Received SIGHUP, restarting gateway...");
                    let supervisor = Arc::clone(&supervisor);
                    tokio::spawn(async move {
                        match supervisor.restart().await {
                            Ok(ready) => info!(gateway = %ready.target, "Gateway restarted"),
                            Err(e) => error!(error = %e, "Gateway restart failed"),
                        }
                    });
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
    supervisor.shutdown();

    let _ = tokio::time::timeout(Duration::from_secs(2), proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config, token: &GatewayToken) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        state_dir = %config.state.state_dir().display(),
        workspace_dir = %config.state.workspace_dir().display(),
        config_path = %config.state.config_path().display(),
        "State locations"
    );
    info!(
        command = %config.gateway.command,
        host = %config.gateway.host,
        port = config.gateway.port,
        startup_timeout_ms = config.gateway.startup_timeout_ms,
        probe_interval_ms = config.gateway.probe_interval_ms,
        "Gateway settings"
    );
    info!(
        token_set = !token.as_str().is_empty(),
        token_source = ?token.source(),
        token_persisted = token.is_persisted(),
        "Gateway token"
    );
    if config.server.setup_password.is_none() {
        warn!("SETUP_PASSWORD is not set; /setup endpoints will refuse requests");
    }
}
