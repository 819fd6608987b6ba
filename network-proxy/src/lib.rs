#![deny(clippy::print_stdout, clippy::print_stderr)]

mod certs;
mod http_proxy;
mod mitm;
mod proxy;

pub use certs::CertificateAuthority;
pub use proxy::PromptProxy;
pub use proxy::PromptProxyBuilder;
pub use proxy::ProxyHandle;

/// Install the ring crypto provider as the process default. Safe to call
/// more than once.
pub fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
