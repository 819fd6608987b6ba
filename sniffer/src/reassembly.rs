use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;
use tracing::warn;

use crate::extract;
use crate::extract::Extraction;
use crate::extract::find_subsequence;

/// Per-flow buffers are capped at 5 MiB; on overflow only the trailing
/// 256 KiB survives, in case a JSON body straddles the cut.
const MAX_BUFFER_BYTES: usize = 5 * 1024 * 1024;
const BUFFER_RETAIN_BYTES: usize = 256 * 1024;

/// Destination ports that once served the RPC endpoint are remembered, but
/// dropped again after sitting idle this long.
const KNOWN_PORT_TTL: Duration = Duration::from_secs(600);

/// Running counters exposed to operators and test harnesses.
#[derive(Default)]
pub struct Counters {
    pub(crate) packets: AtomicU64,
    payloads: AtomicU64,
    extraction_attempts: AtomicU64,
    extractions: AtomicU64,
    active_buffers: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub packets: u64,
    pub payloads: u64,
    pub extraction_attempts: u64,
    pub extractions: u64,
    pub active_buffers: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            payloads: self.payloads.load(Ordering::Relaxed),
            extraction_attempts: self.extraction_attempts.load(Ordering::Relaxed),
            extractions: self.extractions.load(Ordering::Relaxed),
            active_buffers: self.active_buffers.load(Ordering::Relaxed),
        }
    }
}

/// TCP flow reassembly state, keyed by `(src_port, dst_port)`. Confined to
/// the sniffer's single consumer task; packet order within a flow is
/// preserved.
pub struct FlowTable {
    buffers: HashMap<(u16, u16), Vec<u8>>,
    known_ports: HashMap<u16, Instant>,
    counters: Arc<Counters>,
}

impl FlowTable {
    pub fn new(counters: Arc<Counters>) -> Self {
        Self {
            buffers: HashMap::new(),
            known_ports: HashMap::new(),
            counters,
        }
    }

    /// Feed one TCP payload; returns every complete JSON body it unlocked,
    /// in stream order.
    pub fn ingest(&mut self, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<Extraction> {
        self.counters.payloads.fetch_add(1, Ordering::Relaxed);
        self.known_ports
            .retain(|_, seen| seen.elapsed() < KNOWN_PORT_TTL);

        let has_url_target = payload_mentions_endpoint(payload);
        if has_url_target {
            self.known_ports.insert(dst_port, Instant::now());
            debug!("learned language server port {dst_port}");
        }
        let has_body_target = find_subsequence(payload, b"\"cascadeId\"").is_some()
            || find_subsequence(payload, b"\"items").is_some()
            || find_subsequence(payload, b"LanguageServerService").is_some();
        let is_known_port = match self.known_ports.get_mut(&dst_port) {
            Some(seen) => {
                *seen = Instant::now();
                true
            }
            None => false,
        };

        let key = (src_port, dst_port);
        let tracked = self.buffers.contains_key(&key);
        if !(has_url_target || has_body_target || is_known_port || tracked) {
            return Vec::new();
        }
        self.buffers.entry(key).or_default().extend_from_slice(payload);

        if let Some(buffer) = self.buffers.get_mut(&key) {
            if buffer.len() > MAX_BUFFER_BYTES {
                warn!(
                    "buffer overflow for flow {src_port}->{dst_port} ({} bytes); keeping the tail",
                    buffer.len()
                );
                let cut = buffer.len() - BUFFER_RETAIN_BYTES;
                buffer.drain(..cut);
                self.update_active_buffers();
                return Vec::new();
            }
        }

        let mut extractions = Vec::new();
        loop {
            let result = match self.buffers.get(&key) {
                Some(buffer) => {
                    self.counters
                        .extraction_attempts
                        .fetch_add(1, Ordering::Relaxed);
                    extract::try_extract(buffer)
                }
                None => None,
            };
            let Some(extraction) = result else {
                break;
            };
            self.counters.extractions.fetch_add(1, Ordering::Relaxed);
            if let Some(buffer) = self.buffers.get_mut(&key) {
                // Drop only the consumed prefix; trailing bytes may belong
                // to a pipelined request.
                buffer.drain(..extraction.consumed.min(buffer.len()));
                if buffer.is_empty() {
                    self.buffers.remove(&key);
                }
            }
            extractions.push(extraction);
        }

        self.update_active_buffers();
        extractions
    }

    pub fn active_buffer_len(&self, src_port: u16, dst_port: u16) -> Option<usize> {
        self.buffers.get(&(src_port, dst_port)).map(Vec::len)
    }

    fn update_active_buffers(&self) {
        self.counters
            .active_buffers
            .store(self.buffers.len() as u64, Ordering::Relaxed);
    }
}

/// Does the payload mention the RPC endpoint in cleartext: the method name,
/// the service name, or a `<letter>.localhost` host.
fn payload_mentions_endpoint(payload: &[u8]) -> bool {
    if find_subsequence(payload, b"SendUserCascadeMessage").is_some()
        || find_subsequence(payload, b"LanguageServerService").is_some()
    {
        return true;
    }
    let marker = b".localhost";
    let mut offset = 0;
    while let Some(found) = find_subsequence(&payload[offset..], marker) {
        let pos = offset + found;
        if pos > 0 && payload[pos - 1].is_ascii_lowercase() {
            return true;
        }
        offset = pos + marker.len();
    }
    false
}
