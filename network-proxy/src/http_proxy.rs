use std::collections::HashMap;
use std::io::Read as _;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt as _;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt as _;
use tokio::io::ReadBuf;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;
use url::Url;
use wsproxy_capture::is_log_only_host;
use wsproxy_capture::is_mitm_host;

use crate::mitm;
use crate::proxy::ProxyContext;

pub(crate) const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const ORIGIN_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const ORIGIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TUNNEL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TUNNEL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_HEAD_BYTES: usize = 64 * 1024;
const READ_CHUNK: usize = 64 * 1024;

const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n";
pub(crate) const RESPONSE_200_ESTABLISHED: &[u8] =
    b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Upper bound on concurrently served connections; accepts park until a
/// worker slot frees up.
const MAX_CONNECTIONS: usize = 256;

/// Accept loop feeding a bounded pool of per-connection tasks.
pub(crate) async fn run(listener: TcpListener, ctx: Arc<ProxyContext>) -> Result<()> {
    let slots = Arc::new(tokio::sync::Semaphore::new(MAX_CONNECTIONS));
    loop {
        let permit = slots
            .clone()
            .acquire_owned()
            .await
            .context("connection limiter closed")?;
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("proxy accept failed: {err}");
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = handle_connection(ctx, stream).await {
                debug!("connection from {peer} failed: {err:#}");
            }
        });
    }
}

async fn handle_connection(ctx: Arc<ProxyContext>, stream: TcpStream) -> Result<()> {
    let mut reader = HttpReader::new(stream);
    let first = match timeout(CLIENT_READ_TIMEOUT, reader.read_request()).await {
        Ok(result) => result?,
        Err(_) => return Ok(()),
    };
    let Some(request) = first else {
        return Ok(());
    };

    if request.method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_authority(&request.target, 443);
        let (stream, leftover) = reader.into_parts();
        handle_connect(ctx, stream, leftover, host, port).await
    } else {
        serve_plain(ctx, reader, request).await
    }
}

async fn handle_connect(
    ctx: Arc<ProxyContext>,
    mut stream: TcpStream,
    leftover: Vec<u8>,
    host: String,
    port: u16,
) -> Result<()> {
    if is_mitm_host(&host) {
        return mitm::serve_intercepted(ctx, stream, leftover, host, port).await;
    }

    if is_log_only_host(&host) {
        info!("tunnel (no MITM): {host}:{port}");
    }

    let origin = match timeout(
        TUNNEL_CONNECT_TIMEOUT,
        TcpStream::connect((host.as_str(), port)),
    )
    .await
    {
        Ok(Ok(origin)) => origin,
        Ok(Err(err)) => {
            debug!("tunnel connect to {host}:{port} failed: {err}");
            let _ = stream.write_all(RESPONSE_502).await;
            return Ok(());
        }
        Err(_) => {
            debug!("tunnel connect to {host}:{port} timed out");
            let _ = stream.write_all(RESPONSE_502).await;
            return Ok(());
        }
    };

    stream.write_all(RESPONSE_200_ESTABLISHED).await?;
    relay(stream, origin, leftover).await
}

/// Blind byte relay between the client and the origin. Either side's EOF or
/// error ends the tunnel, as does a 30-second all-idle window.
async fn relay(mut client: TcpStream, mut origin: TcpStream, leftover: Vec<u8>) -> Result<()> {
    if !leftover.is_empty() {
        origin.write_all(&leftover).await?;
    }

    let (mut client_read, mut client_write) = client.split();
    let (mut origin_read, mut origin_write) = origin.split();
    let mut client_buf = vec![0u8; READ_CHUNK];
    let mut origin_buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            read = client_read.read(&mut client_buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if origin_write.write_all(&client_buf[..n]).await.is_err() {
                        break;
                    }
                }
            },
            read = origin_read.read(&mut origin_buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if client_write.write_all(&origin_buf[..n]).await.is_err() {
                        break;
                    }
                }
            },
            _ = tokio::time::sleep(TUNNEL_IDLE_TIMEOUT) => break,
        }
    }
    Ok(())
}

/// Plain HTTP proxying: rewrite the absolute-form request line, forward over
/// a raw TCP connection, parse both directions, echo the response.
async fn serve_plain(
    ctx: Arc<ProxyContext>,
    mut reader: HttpReader<TcpStream>,
    mut request: RawRequest,
) -> Result<()> {
    loop {
        forward_plain(&ctx, &mut reader, &request).await?;
        request = match timeout(CLIENT_READ_TIMEOUT, reader.read_request()).await {
            Ok(Ok(Some(next))) => next,
            _ => break,
        };
    }
    Ok(())
}

async fn forward_plain(
    ctx: &ProxyContext,
    reader: &mut HttpReader<TcpStream>,
    request: &RawRequest,
) -> Result<()> {
    let absolute = if request.target.starts_with("http://") || request.target.starts_with("https://")
    {
        request.target.clone()
    } else {
        let host = request
            .headers
            .get("host")
            .cloned()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        format!("http://{host}{}", request.target)
    };

    let Ok(url) = Url::parse(&absolute) else {
        debug!("unparseable request target: {absolute}");
        let _ = reader.stream_mut().write_all(RESPONSE_502).await;
        return Ok(());
    };
    let host = url.host_str().unwrap_or("127.0.0.1").to_string();
    let port = url.port().unwrap_or(80);
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.clone(),
    };
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    let mut origin = match timeout(
        ORIGIN_CONNECT_TIMEOUT,
        TcpStream::connect((host.as_str(), port)),
    )
    .await
    {
        Ok(Ok(origin)) => origin,
        Ok(Err(err)) => {
            debug!("plain forward connect to {authority} failed: {err}");
            let _ = reader.stream_mut().write_all(RESPONSE_502).await;
            return Ok(());
        }
        Err(_) => {
            debug!("plain forward connect to {authority} timed out");
            let _ = reader.stream_mut().write_all(RESPONSE_502).await;
            return Ok(());
        }
    };

    let method = &request.method;
    let mut head = format!("{method} {path} HTTP/1.1\r\nHost: {authority}\r\n");
    for (name, value) in &request.headers {
        if name == "host" || name == "proxy-connection" {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    origin.write_all(head.as_bytes()).await?;
    origin.write_all(&request.body).await?;

    let response = read_http_response(&mut origin, ORIGIN_READ_TIMEOUT).await?;
    capture_exchange(
        ctx,
        &absolute,
        &request.method,
        &request.headers,
        &request.body,
        Some(&response),
    );
    reader.stream_mut().write_all(&response).await?;
    Ok(())
}

/// Run an exchange through the parser and emit the record when a prompt is
/// present.
pub(crate) fn capture_exchange(
    ctx: &ProxyContext,
    url: &str,
    method: &str,
    headers: &HashMap<String, String>,
    body: &[u8],
    response_raw: Option<&[u8]>,
) {
    let body_text = String::from_utf8_lossy(body);
    let Some(mut record) = ctx
        .parser
        .extract_prompt_from_request(url, method, &body_text, headers)
    else {
        return;
    };
    if record.prompt.is_empty() {
        return;
    }
    if let Some(raw) = response_raw {
        record.response = response_text(raw).and_then(|text| ctx.parser.extract_response(&text));
    }
    let source = record.source;
    let chars = record.prompt.chars().count();
    info!("AI prompt captured (source={source}, method={method}, url={url}, chars={chars})");
    ctx.sinks.emit(&record);
}

/// A parsed HTTP/1.x request, keeping the raw bytes for verbatim replay.
pub(crate) struct RawRequest {
    pub method: String,
    pub target: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub raw: Vec<u8>,
}

/// Minimal buffered HTTP/1.x request reader; whatever was read past the
/// current request stays buffered for the next one (keep-alive, pipelining,
/// or a TLS ClientHello following a CONNECT head).
pub(crate) struct HttpReader<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> HttpReader<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub(crate) fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub(crate) fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream, self.buf)
    }

    /// Read one request: head until `\r\n\r\n`, then exactly Content-Length
    /// body bytes (0 when absent). `None` on clean EOF between requests.
    pub(crate) async fn read_request(&mut self) -> Result<Option<RawRequest>> {
        let head_end = loop {
            if let Some(pos) = find_subsequence(&self.buf, b"\r\n\r\n") {
                break pos + 4;
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                bail!("request head exceeds {MAX_HEAD_BYTES} bytes");
            }
            let mut chunk = [0u8; 8192];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                bail!("connection closed mid request head");
            }
            self.buf.extend_from_slice(&chunk[..n]);
        };

        let head_bytes: Vec<u8> = self.buf.drain(..head_end).collect();
        let head_text = String::from_utf8_lossy(&head_bytes[..head_end - 4]).into_owned();
        let mut lines = head_text.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().context("missing request method")?.to_string();
        let target = parts.next().context("missing request target")?.to_string();
        let headers = parse_header_lines(lines);

        let content_length: usize = headers
            .get("content-length")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        while self.buf.len() < content_length {
            let mut chunk = [0u8; 65536];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
        let take = content_length.min(self.buf.len());
        let body: Vec<u8> = self.buf.drain(..take).collect();

        let mut raw = head_bytes;
        raw.extend_from_slice(&body);
        Ok(Some(RawRequest {
            method,
            target,
            headers,
            body,
            raw,
        }))
    }
}

/// Read an HTTP response: head, then body bounded by Content-Length or
/// chunked framing when announced, otherwise until the origin closes. A read
/// timeout returns whatever was received so far.
pub(crate) async fn read_http_response<S: AsyncRead + Unpin>(
    stream: &mut S,
    read_timeout: Duration,
) -> Result<Vec<u8>> {
    let mut raw: Vec<u8> = Vec::new();

    let head_end = loop {
        if let Some(pos) = find_subsequence(&raw, b"\r\n\r\n") {
            break pos + 4;
        }
        match timeout(read_timeout, stream.read_buf(&mut raw)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return Ok(raw),
            Ok(Ok(_)) => {}
        }
    };

    let headers = parse_header_block(&raw[..head_end - 4]);
    let content_length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok());
    let chunked = headers
        .get("transfer-encoding")
        .is_some_and(|value| value.to_lowercase().contains("chunked"));

    if let Some(content_length) = content_length {
        let total = head_end + content_length;
        while raw.len() < total {
            match timeout(read_timeout, stream.read_buf(&mut raw)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return Ok(raw),
                Ok(Ok(_)) => {}
            }
        }
        raw.truncate(total);
    } else if chunked {
        while !chunked_body_complete(&raw[head_end..]) {
            match timeout(read_timeout, stream.read_buf(&mut raw)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return Ok(raw),
                Ok(Ok(_)) => {}
            }
        }
    } else {
        loop {
            match timeout(read_timeout, stream.read_buf(&mut raw)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return Ok(raw),
                Ok(Ok(_)) => {}
            }
        }
    }
    Ok(raw)
}

fn chunked_body_complete(body: &[u8]) -> bool {
    let terminal_chunk = if body.starts_with(b"0\r\n") {
        Some(0)
    } else {
        find_subsequence(body, b"\r\n0\r\n").map(|pos| pos + 2)
    };
    // The last chunk is followed by (possibly empty) trailers and a blank line.
    terminal_chunk.is_some_and(|pos| find_subsequence(&body[pos..], b"\r\n\r\n").is_some())
}

/// Decoded textual view of a raw HTTP response: de-chunked, gunzipped when
/// flagged, lossily UTF-8 decoded. `None` when no complete head is present.
pub(crate) fn response_text(raw: &[u8]) -> Option<String> {
    let head_end = find_subsequence(raw, b"\r\n\r\n")? + 4;
    let headers = parse_header_block(&raw[..head_end - 4]);
    let mut body = raw[head_end..].to_vec();

    if headers
        .get("transfer-encoding")
        .is_some_and(|value| value.to_lowercase().contains("chunked"))
    {
        body = dechunk(&body);
    }
    if headers
        .get("content-encoding")
        .is_some_and(|value| value.to_lowercase() == "gzip")
    {
        if let Some(decompressed) = gunzip(&body) {
            body = decompressed;
        }
    }
    Some(String::from_utf8_lossy(&body).into_owned())
}

fn dechunk(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = data;
    loop {
        let Some(line_end) = find_subsequence(rest, b"\r\n") else {
            break;
        };
        let size_line = String::from_utf8_lossy(&rest[..line_end]);
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let Ok(size) = usize::from_str_radix(size_hex, 16) else {
            break;
        };
        if size == 0 {
            break;
        }
        let chunk_start = line_end + 2;
        let chunk_end = chunk_start + size;
        if chunk_end > rest.len() {
            // Truncated chunk; keep what we have.
            out.extend_from_slice(&rest[chunk_start..]);
            break;
        }
        out.extend_from_slice(&rest[chunk_start..chunk_end]);
        rest = rest.get(chunk_end + 2..).unwrap_or_default();
    }
    out
}

fn gunzip(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data).read_to_end(&mut out).ok()?;
    Some(out)
}

/// `host[:port]` authority with a default port.
pub(crate) fn split_authority(authority: &str, default_port: u16) -> (String, u16) {
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (authority.to_string(), default_port),
        },
        None => (authority.to_string(), default_port),
    }
}

pub(crate) fn parse_header_block(head: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    // Skip the start line.
    let _ = lines.next();
    parse_header_lines(lines)
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }
    headers
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Stream adapter that serves already-buffered bytes before reading from the
/// underlying socket; writes pass straight through.
pub(crate) struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub(crate) fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            this.offset += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
