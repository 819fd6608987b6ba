use std::sync::Arc;

use anyhow::Context as _;
use anyhow::Result;
use rustls_pki_types::ServerName;
use tokio::io::AsyncWriteExt as _;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::debug;
use tracing::warn;

use crate::http_proxy::CLIENT_READ_TIMEOUT;
use crate::http_proxy::HttpReader;
use crate::http_proxy::ORIGIN_CONNECT_TIMEOUT;
use crate::http_proxy::ORIGIN_READ_TIMEOUT;
use crate::http_proxy::PrefixedStream;
use crate::http_proxy::RESPONSE_200_ESTABLISHED;
use crate::http_proxy::capture_exchange;
use crate::http_proxy::read_http_response;
use crate::proxy::ProxyContext;

const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n";

/// Terminate a CONNECT tunnel with a forged leaf certificate and serve the
/// decrypted stream request-by-request until the client closes.
pub(crate) async fn serve_intercepted(
    ctx: Arc<ProxyContext>,
    mut stream: TcpStream,
    leftover: Vec<u8>,
    host: String,
    port: u16,
) -> Result<()> {
    // Certificate failures are fatal to this request only, never to the
    // process.
    let server_config = match ctx.ca.server_config_for(&host) {
        Ok(config) => config,
        Err(err) => {
            warn!("failed to prepare leaf certificate for {host}: {err:#}");
            return Ok(());
        }
    };

    stream.write_all(RESPONSE_200_ESTABLISHED).await?;

    let acceptor = TlsAcceptor::from(server_config);
    let tls = match acceptor.accept(PrefixedStream::new(leftover, stream)).await {
        Ok(tls) => tls,
        Err(err) => {
            // Expected whenever the client has not trusted our CA.
            debug!("client TLS handshake failed for {host}: {err}");
            return Ok(());
        }
    };

    let mut reader = HttpReader::new(tls);
    loop {
        let request = match timeout(CLIENT_READ_TIMEOUT, reader.read_request()).await {
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => break,
            Ok(Err(err)) => {
                debug!("failed to read intercepted request for {host}: {err:#}");
                break;
            }
            Err(_) => break,
        };

        let url = format!("https://{host}{}", request.target);
        let response = match forward_upstream(&ctx, &host, port, &request.raw).await {
            Ok(response) => response,
            Err(err) => {
                debug!("upstream exchange with {host}:{port} failed: {err:#}");
                capture_exchange(
                    &ctx,
                    &url,
                    &request.method,
                    &request.headers,
                    &request.body,
                    None,
                );
                let _ = reader.stream_mut().write_all(RESPONSE_502).await;
                break;
            }
        };

        capture_exchange(
            &ctx,
            &url,
            &request.method,
            &request.headers,
            &request.body,
            Some(&response),
        );

        if response.is_empty() {
            break;
        }
        if reader.stream_mut().write_all(&response).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Replay the raw request bytes verbatim over a validated TLS connection to
/// the real origin and collect its response.
async fn forward_upstream(
    ctx: &ProxyContext,
    host: &str,
    port: u16,
    raw_request: &[u8],
) -> Result<Vec<u8>> {
    let tcp = timeout(ORIGIN_CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .context("origin connect timed out")?
        .with_context(|| format!("failed to connect to {host}:{port}"))?;
    let server_name =
        ServerName::try_from(host.to_string()).context("invalid origin server name")?;
    let mut tls = ctx
        .origin_tls
        .connect(server_name, tcp)
        .await
        .with_context(|| format!("origin TLS handshake with {host} failed"))?;
    tls.write_all(raw_request)
        .await
        .context("failed to replay request upstream")?;
    read_http_response(&mut tls, ORIGIN_READ_TIMEOUT).await
}
