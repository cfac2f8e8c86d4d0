use std::path::PathBuf;

use clap::Parser;

use proxy_request::config::{load_config, validate_config, ConfigError, ProxyConfig};
use proxy_request::lifecycle::{wait_for_signal, Shutdown};
use proxy_request::net::listener::Listener;
use proxy_request::observability::logging;
use proxy_request::ProxyServer;

/// Forward HTTP and websocket traffic to a backend.
#[derive(Debug, Parser)]
#[command(name = "proxy-request", version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, env = "PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(long)]
    bind: Option<String>,

    /// Override `backend.host`.
    #[arg(long)]
    backend_host: Option<String>,

    /// Override `backend.port`.
    #[arg(long)]
    backend_port: Option<u16>,

    /// Dial the backend over TLS.
    #[arg(long)]
    secure: bool,
}

impl Args {
    fn into_config(self) -> Result<ProxyConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ProxyConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.listener.bind_address = bind;
        }
        if let Some(host) = self.backend_host {
            config.backend.host = host;
        }
        if let Some(port) = self.backend_port {
            config.backend.port = port;
        }
        if self.secure {
            config.backend.secure = true;
        }

        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Args::parse().into_config()?;
    logging::init(&config.observability)?;

    tracing::info!("proxy-request v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        backend = %format_args!("{}:{}", config.backend.host, config.backend.port),
        connect_timeout_secs = config.timeouts.connect_secs,
        "Configuration loaded"
    );

    let listener = Listener::bind(&config.listener).await?;
    let server = ProxyServer::new(config)?;

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signals"),
        }
        shutdown.trigger();
    });

    server.run(listener, receiver).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
