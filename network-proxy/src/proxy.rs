use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use anyhow::Result;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::info;
use wsproxy_capture::Config;
use wsproxy_capture::PromptParser;
use wsproxy_capture::SinkRegistry;

use crate::certs::CertificateAuthority;
use crate::ensure_crypto_provider;
use crate::http_proxy;

/// Shared state handed to every connection task.
pub struct ProxyContext {
    pub(crate) parser: PromptParser,
    pub(crate) sinks: SinkRegistry,
    pub(crate) ca: CertificateAuthority,
    pub(crate) origin_tls: TlsConnector,
}

#[derive(Default)]
pub struct PromptProxyBuilder {
    config: Option<Config>,
    sinks: SinkRegistry,
    state_dir: Option<PathBuf>,
    bind_addr: Option<SocketAddr>,
}

impl PromptProxyBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn sinks(mut self, sinks: SinkRegistry) -> Self {
        self.sinks = sinks;
        self
    }

    /// Overrides the CA/leaf-cache directory (defaults to
    /// `~/.windsurf-proxy`).
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    pub fn build(self) -> Result<PromptProxy> {
        ensure_crypto_provider();

        let config = self.config.unwrap_or_default();
        let state_dir = self
            .state_dir
            .unwrap_or_else(wsproxy_capture::state_dir);
        let ca = CertificateAuthority::load_or_create(state_dir)
            .context("failed to initialize certificate authority")?;
        let parser = PromptParser::new(config.monitored_patterns());
        let origin_tls = TlsConnector::from(Arc::new(origin_client_config()));
        let addr = self
            .bind_addr
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], config.proxy_port)));

        Ok(PromptProxy {
            ctx: Arc::new(ProxyContext {
                parser,
                sinks: self.sinks,
                ca,
                origin_tls,
            }),
            addr,
        })
    }
}

/// The MITM proxy server: a threaded-model accept loop over tokio tasks.
pub struct PromptProxy {
    ctx: Arc<ProxyContext>,
    addr: SocketAddr,
}

impl PromptProxy {
    pub fn builder() -> PromptProxyBuilder {
        PromptProxyBuilder::default()
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.ctx.ca.ca_cert_path()
    }

    pub async fn run(&self) -> Result<ProxyHandle> {
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("failed to bind proxy listener on {}", self.addr))?;
        let addr = listener
            .local_addr()
            .context("failed to read proxy listener address")?;
        info!("HTTP proxy listening on {addr}");

        let ctx = self.ctx.clone();
        let task = tokio::spawn(http_proxy::run(listener, ctx));
        Ok(ProxyHandle {
            addr,
            task: Some(task),
            completed: false,
        })
    }
}

pub struct ProxyHandle {
    addr: SocketAddr,
    task: Option<JoinHandle<Result<()>>>,
    completed: bool,
}

impl ProxyHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn wait(mut self) -> Result<()> {
        let task = self.task.take().context("missing proxy task")?;
        let result = task.await;
        self.completed = true;
        result?
    }

    /// Stops accepting and abandons outstanding connection tasks; the OS
    /// reclaims their sockets.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.completed = true;
        Ok(())
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn origin_client_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}
