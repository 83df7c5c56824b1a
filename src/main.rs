use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tor2web_gateway::config::GatewayConfig;
use tor2web_gateway::gateway::Gateway;
use tor2web_gateway::server::{self, GatewayServer, RedirectServer};
use tor2web_gateway::tls::TlsIdentity;
use tor2web_gateway::{PKG_NAME, VERSION};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tor2web_gateway=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tor2web.conf"));

    let config = GatewayConfig::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let identity = TlsIdentity::load(&config.tls).map_err(|e| {
        error!(error = %e, "Failed to load TLS identity");
        e
    })?;
    info!(
        cert = %config.tls.cert.display(),
        chain_len = identity.chain_len(),
        "TLS identity loaded"
    );
    let acceptor = identity.acceptor()?;

    let config = Arc::new(config);
    let gateway = Arc::new(Gateway::new(Arc::clone(&config))?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bind before spawning so an unavailable port fails startup
    let https_listener = server::bind(config.https_bind_addr()).await.map_err(|e| {
        error!(error = %e, "Failed to bind HTTPS listener");
        e
    })?;
    let http_listener = match config.http_bind_addr() {
        Some(addr) => Some(server::bind(addr).await.map_err(|e| {
            error!(error = %e, "Failed to bind HTTP redirect listener");
            e
        })?),
        None => None,
    };

    let https_server = GatewayServer::new(Arc::clone(&gateway), acceptor, shutdown_rx.clone());
    let https_handle = tokio::spawn(async move {
        if let Err(e) = https_server.serve(https_listener).await {
            error!(error = %e, "HTTPS server error");
        }
    });

    let http_handle = http_listener.map(|listener| {
        let redirect = RedirectServer::new(config.public_base_url(), shutdown_rx.clone());
        tokio::spawn(async move {
            if let Err(e) = redirect.serve(listener).await {
                error!(error = %e, "HTTP redirect server error");
            }
        })
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

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = https_handle.await;
        if let Some(handle) = http_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &GatewayConfig) {
    info!(name = PKG_NAME, version = VERSION, "Starting Tor2web gateway");
    info!(
        basehost = %config.basehost,
        mode = config.mode.name(),
        bind = %config.listen.address,
        https_port = config.listen.https_port,
        http_port = config.http_bind_addr().map(|a| a.port()),
        "Gateway configuration"
    );
    if config.onion_address().is_some() {
        info!(socks = %config.socks_addr, "Hidden service reached through Tor SOCKS5");
    }
    info!(
        connect_timeout_secs = config.timeouts.connect.as_secs(),
        read_timeout_secs = config.timeouts.read.as_secs(),
        handshake_timeout_secs = config.timeouts.handshake.as_secs(),
        "Timeouts"
    );
    info!(
        pool_max_idle = config.pool.max_idle,
        pool_idle_timeout_secs = config.pool.idle_timeout.as_secs(),
        rewrite_buffer_limit = config.rewrite_buffer_limit,
        "Upstream settings"
    );
    info!(
        blockhotlinking = config.features.block_hotlinking,
        blockcrawl = config.features.block_crawl,
        overriderobotstxt = config.features.override_robots_txt,
        disable_banner = config.features.disable_banner,
        disable_disclaimer = config.features.disable_disclaimer,
        disable_tor_redirection = config.features.disable_tor_redirection,
        gettor = config.gettor_enabled(),
        "Features"
    );
}
