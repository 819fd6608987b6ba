use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing::info;
use wsproxy_capture::Config;
use wsproxy_capture::JsonlSink;
use wsproxy_capture::SinkRegistry;
use wsproxy_network_proxy::PromptProxy;

#[derive(Debug, Parser)]
#[command(
    name = "wsproxy-network-proxy",
    about = "AI prompt intercepting HTTP(S) proxy"
)]
struct Args {
    /// Listening port (overrides PROXY_PORT).
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.proxy_port = port;
    }
    init_tracing(&config.log_level);

    let mut sinks = SinkRegistry::new();
    sinks.push(Arc::new(JsonlSink::new("logs")));

    let proxy = PromptProxy::builder()
        .config(config.clone())
        .sinks(sinks)
        .build()?;
    let ca_cert_path = proxy.ca_cert_path();
    let handle = proxy.run().await?;

    let addr = handle.addr();
    info!("configure the client with HTTP_PROXY=http://{addr} HTTPS_PROXY=http://{addr}");
    info!("CA certificate (add to the host trust store): {}", ca_cert_path.display());

    shutdown_signal().await;
    info!("shutting down");
    handle.shutdown().await
}

fn init_tracing(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
