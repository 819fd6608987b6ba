use std::collections::HashMap;

use serde_json::Value;

/// Candidates below this size are never real cascade messages.
const MIN_CANDIDATE_BYTES: usize = 10;

const RPC_PATH: &str = "/exa.language_server_pb.LanguageServerService/SendUserCascadeMessage";

/// A complete JSON body recovered from a flow buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub json: String,
    /// Bytes from the start of the buffer that were consumed, including any
    /// headers or framing in front of the JSON.
    pub consumed: usize,
    /// HTTP/1.1 headers when the request carried them in cleartext; empty on
    /// the framed path.
    pub headers: HashMap<String, String>,
    /// Reconstructed request URL when the buffer revealed one.
    pub url: Option<String>,
}

/// Best-effort extraction of one complete cascade JSON body from the front
/// of a flow buffer.
pub(crate) fn try_extract(buf: &[u8]) -> Option<Extraction> {
    // Strategy 1: plain HTTP/1.1 — headers, blank line, JSON body.
    if let Some(header_end) = find_subsequence(buf, b"\r\n\r\n") {
        let body_start = header_end + 4;
        let body = &buf[body_start..];
        if let Some((json, json_end)) = extract_json(body) {
            if let Ok(data) = serde_json::from_str::<Value>(&json) {
                if data.get("cascadeId").is_some() && data.get("items").is_some() {
                    let headers = parse_headers(&buf[..header_end]);
                    let url = url_from_headers(&headers);
                    return Some(Extraction {
                        json,
                        consumed: body_start + json_end,
                        headers,
                        url,
                    });
                }
            }
        }
    }

    // Strategy 2: framed transport (HTTP/2, Connect-Web, gRPC) — headers are
    // compressed or elsewhere, so scan the bytes for the JSON directly.
    if buf.contains(&b'{') {
        if let Some((json, json_end)) = extract_json(buf) {
            if let Ok(data) = serde_json::from_str::<Value>(&json) {
                if data.get("cascadeId").is_some() {
                    return Some(Extraction {
                        json,
                        consumed: json_end,
                        headers: HashMap::new(),
                        url: url_from_bytes(buf),
                    });
                }
            }
        }
    }

    None
}

/// Candidate start offsets in priority order: the enclosing brace behind
/// `"cascadeId"` is the most reliable anchor, then a brace following a
/// `Content-Length` header, then gRPC-style length-prefixed framing, then
/// every standalone brace.
fn candidate_starts(data: &[u8]) -> Vec<usize> {
    let mut starts: Vec<usize> = Vec::new();

    if let Some(marker) = find_subsequence(data, b"\"cascadeId\"") {
        if let Some(brace) = data[..marker].iter().rposition(|&b| b == b'{') {
            starts.push(brace);
        }
    }

    if let Some(header) = find_subsequence(data, b"Content-Length:") {
        let search_start = header + 15;
        if let Some(brace) = data[search_start..].iter().position(|&b| b == b'{') {
            starts.push(search_start + brace);
        }
    }

    // 5-byte framing: compression flag 0x00, big-endian length, then the
    // message. False positives on stray NULs are weeded out by the JSON
    // validation that follows.
    for i in 0..data.len().saturating_sub(5) {
        if data[i] == 0 && data[i + 5] == b'{' {
            starts.push(i + 5);
        }
    }

    for (i, &b) in data.iter().enumerate() {
        if b == b'{' {
            starts.push(i);
        }
    }

    let mut deduped = Vec::with_capacity(starts.len());
    for start in starts {
        if !deduped.contains(&start) {
            deduped.push(start);
        }
    }
    deduped
}

fn extract_json(data: &[u8]) -> Option<(String, usize)> {
    for start in candidate_starts(data) {
        if let Some(found) = validate_candidate(data, start) {
            return Some(found);
        }
    }
    None
}

fn validate_candidate(data: &[u8], start: usize) -> Option<(String, usize)> {
    let end = balanced_json_end(data, start)?;
    let candidate = &data[start..end];
    if candidate.len() < MIN_CANDIDATE_BYTES {
        return None;
    }
    if find_subsequence(candidate, b"cascadeId").is_none() {
        return None;
    }
    let text = std::str::from_utf8(candidate).ok()?;
    serde_json::from_str::<Value>(text).ok()?;
    Some((text.to_string(), end))
}

/// Streaming depth counter over the bytes starting at `start` (which must be
/// a `{`). Handles string literals and backslash escapes; multi-byte UTF-8
/// never aliases the ASCII delimiters, so byte-wise scanning is exact.
/// Returns the exclusive end offset once the depth returns to zero.
fn balanced_json_end(data: &[u8], start: usize) -> Option<usize> {
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in data.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

pub(crate) fn parse_headers(head: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let _ = lines.next(); // request line
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }
    headers
}

/// URL from a cleartext Host header pointing at the client's local RPC
/// endpoint.
fn url_from_headers(headers: &HashMap<String, String>) -> Option<String> {
    let host = headers.get("host")?;
    if host.contains(".localhost") {
        Some(format!("http://{host}{RPC_PATH}"))
    } else {
        None
    }
}

/// Scan raw bytes for a `<letter>.localhost:<port>` marker and rebuild the
/// endpoint URL from it.
pub(crate) fn url_from_bytes(data: &[u8]) -> Option<String> {
    let marker = b".localhost:";
    let mut offset = 0;
    while let Some(found) = find_subsequence(&data[offset..], marker) {
        let pos = offset + found;
        let letter_ok = pos > 0 && data[pos - 1].is_ascii_lowercase();
        if letter_ok {
            let subdomain = data[pos - 1] as char;
            let digits_start = pos + marker.len();
            let digits: String = data[digits_start..]
                .iter()
                .take_while(|b| b.is_ascii_digit())
                .map(|&b| b as char)
                .collect();
            if !digits.is_empty() {
                return Some(format!("http://{subdomain}.localhost:{digits}{RPC_PATH}"));
            }
        }
        offset = pos + marker.len();
    }
    None
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
