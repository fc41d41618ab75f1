//! Bridge Proxy - Entry point

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bridge_proxy::config::TelemetrySettings;
use bridge_proxy::{request_log, ProxyConfig, ProxyServer, ProxyState};

/// Command-line arguments.
struct Args {
    /// Path to configuration file.
    config: Option<PathBuf>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    config = args.next().map(PathBuf::from);
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("bridge-proxy {}", bridge_proxy::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
            }
        }

        Self { config }
    }
}

fn print_help() {
    println!(
        r"Bridge Proxy - one appservice registration for many Matrix bridges

USAGE:
    bridge-proxy [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file (TOML or JSON)
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT VARIABLES:
    BRIDGE_PROXY_LISTEN_PORT        Listen port (default: 8090)
    BRIDGE_PROXY_LISTEN_ADDR        Listen address (default: 0.0.0.0)
    BRIDGE_PROXY_UPSTREAM_TIMEOUT   Outbound timeout, e.g. 30s
    BRIDGE_PROXY_REGISTRY_PATH      Bridge registry file (TOML or JSON)
    BRIDGE_PROXY_REQUEST_LOG_PATH   Append request rows to this JSON lines file
    BRIDGE_PROXY_LOG_LEVEL          Log filter (default: bridge_proxy=info,warn)

EXAMPLES:
    # Run with configuration file
    bridge-proxy --config /etc/bridge-proxy/proxy.toml

    # Run with a registry file and defaults for everything else
    BRIDGE_PROXY_REGISTRY_PATH=/etc/bridge-proxy/bridges.toml bridge-proxy
"
    );
}

fn init_tracing(settings: &TelemetrySettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if settings.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<ProxyConfig> {
    let config = match path {
        Some(path) => ProxyConfig::from_file(&path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => ProxyConfig::default(),
    };
    let config = config.with_env_overrides();
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let (logger, writer) = request_log::from_settings(&config.request_log)
        .await
        .context("failed to open request log")?;
    let state = ProxyState::from_config(config).context("failed to create proxy state")?;
    let server = ProxyServer::new(state, logger);
    let listener = server.bind().await.context("failed to bind listener")?;

    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await?;

    if let Some(writer) = writer {
        if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
            warn!("request log writer did not drain in time");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    };
    init_tracing(&config.telemetry);

    info!("Starting bridge proxy v{}", bridge_proxy::VERSION);
    info!(
        "Listening on {}:{}",
        config.server.listen_addr, config.server.listen_port
    );
    info!("Appservice: {}", config.appservice.id);

    if let Err(e) = run(config).await {
        error!("Server error: {:#}", e);
        std::process::exit(1);
    }
}
