mod api;

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing::info;
use tracing::warn;
use wsproxy_capture::Config;
use wsproxy_capture::DocumentSink;
use wsproxy_capture::JsonlSink;
use wsproxy_capture::MemoryStore;
use wsproxy_capture::PromptParser;
use wsproxy_capture::SinkRegistry;
use wsproxy_capture::capture_user;
use wsproxy_network_proxy::PromptProxy;
use wsproxy_sniffer::Sniffer;
use wsproxy_sniffer::SnifferHandle;
use wsproxy_sniffer::has_capture_privileges;

#[derive(Debug, Parser)]
#[command(
    name = "wsproxy",
    about = "Windsurf prompt interceptor: MITM proxy + loopback sniffer"
)]
struct Args {
    /// Verbose logging for troubleshooting missed prompts.
    #[arg(long, short)]
    debug: bool,

    /// Serve the read-side prompt API.
    #[arg(long)]
    api: bool,

    /// Port for the read-side API.
    #[arg(long, default_value_t = 8000)]
    api_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;
    init_tracing(if args.debug {
        "debug"
    } else {
        config.log_level.as_str()
    });

    info!("starting Windsurf prompt interceptor");

    let store = Arc::new(MemoryStore::new());
    let mut sinks = SinkRegistry::new();
    // Delivery order: the append-only log first, then the document store.
    sinks.push(Arc::new(JsonlSink::new("logs")));
    sinks.push(Arc::new(DocumentSink::new(store.clone(), capture_user())));

    let proxy = PromptProxy::builder()
        .config(config.clone())
        .sinks(sinks.clone())
        .build()?;
    let proxy_handle = proxy.run().await?;

    let sniffer_handle = start_sniffer(&config, sinks.clone()).await;

    let api_addr = args
        .api
        .then(|| SocketAddr::from(([127, 0, 0, 1], args.api_port)));
    let api_task = api_addr.map(|addr| {
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(err) = api::serve(store, addr).await {
                warn!("prompt API stopped: {err:#}");
            }
        })
    });

    status_panel(
        &config,
        proxy_handle.addr(),
        sniffer_handle.as_ref(),
        api_addr,
    );

    shutdown_signal().await;
    info!("shutting down");

    // Stop accepting first, then the capture subprocess, then any helpers;
    // sinks are dropped last.
    proxy_handle.shutdown().await?;
    if let Some(handle) = sniffer_handle {
        handle.shutdown().await?;
    }
    if let Some(task) = api_task {
        task.abort();
        let _ = task.await;
    }
    info!("interceptor stopped");
    Ok(())
}

/// Start the loopback sniffer when privileges allow; a failure disables the
/// component and leaves the proxy running.
async fn start_sniffer(config: &Config, sinks: SinkRegistry) -> Option<SnifferHandle> {
    if !has_capture_privileges() {
        warn!("not running as root; loopback sniffer disabled (rerun with sudo to capture local prompts)");
        return None;
    }
    let parser = PromptParser::new(config.monitored_patterns());
    match Sniffer::new(parser, sinks).spawn().await {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!("loopback sniffer disabled: {err:#}");
            None
        }
    }
}

/// One status block summarising which components are live and why; emitted
/// as a single log call so concurrent output cannot interleave it.
fn status_panel(
    config: &Config,
    proxy_addr: SocketAddr,
    sniffer: Option<&SnifferHandle>,
    api_addr: Option<SocketAddr>,
) {
    let mut panel = String::from("\n==== Windsurf Prompt Interceptor ====\n");
    let _ = writeln!(panel, "proxy:     listening on {proxy_addr}");
    let _ = writeln!(
        panel,
        "           configure the client with HTTPS_PROXY=http://{proxy_addr}"
    );
    match sniffer {
        Some(_) => {
            let _ = writeln!(panel, "sniffer:   active (capturing local cascade traffic)");
        }
        None => {
            let _ = writeln!(panel, "sniffer:   disabled (needs root for loopback capture)");
        }
    }
    match api_addr {
        Some(addr) => {
            let _ = writeln!(panel, "api:       http://{addr}");
        }
        None => {
            let _ = writeln!(panel, "api:       disabled (pass --api to enable)");
        }
    }
    let _ = writeln!(panel, "ca cert:   {}", config.cert_path.display());
    let patterns = config.monitored_patterns();
    let head = patterns
        .iter()
        .take(5)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    let _ = writeln!(panel, "monitoring: {head}, ...");
    panel.push_str("press Ctrl+C to stop");
    info!("{panel}");
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
