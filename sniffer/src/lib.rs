#![deny(clippy::print_stdout, clippy::print_stderr)]

mod decode;
mod extract;
mod pcap;
mod reassembly;

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use tokio::io::AsyncReadExt as _;
use tokio::process::Child;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use wsproxy_capture::CaptureMethod;
use wsproxy_capture::PromptParser;
use wsproxy_capture::SinkRegistry;

pub use decode::TcpSegment;
pub use decode::decode_segment;
pub use pcap::CapturedPacket;
pub use pcap::LinkType;
pub use pcap::PcapReader;
pub use reassembly::CounterSnapshot;
pub use reassembly::Counters;
pub use reassembly::FlowTable;

use extract::Extraction;

/// Fallback URL when neither headers nor raw bytes reveal the endpoint.
const FALLBACK_URL: &str =
    "http://localhost/exa.language_server_pb.LanguageServerService/SendUserCascadeMessage";

const STARTUP_PROBE_DELAY: Duration = Duration::from_millis(500);
const CHILD_TERM_GRACE: Duration = Duration::from_secs(3);

/// Raw capture on loopback needs elevated privileges on every supported
/// platform.
pub fn has_capture_privileges() -> bool {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

fn default_interface() -> &'static str {
    if cfg!(target_os = "macos") {
        "lo0"
    } else {
        "lo"
    }
}

/// Loopback sniffer: drives tcpdump, reassembles TCP flows, and emits every
/// prompt found in the client's local RPC traffic.
pub struct Sniffer {
    parser: PromptParser,
    sinks: SinkRegistry,
    interface: String,
}

impl Sniffer {
    pub fn new(parser: PromptParser, sinks: SinkRegistry) -> Self {
        Self {
            parser,
            sinks,
            interface: default_interface().to_string(),
        }
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    /// Start tcpdump and the consumer task. Fails with a clear report when
    /// capture cannot start (missing binary, missing privileges); the caller
    /// is expected to keep the rest of the system running.
    pub async fn spawn(self) -> Result<SnifferHandle> {
        let mut child = Command::new("tcpdump")
            .args(["-i", &self.interface, "-w", "-", "-U", "-s", "0", "tcp"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    anyhow::anyhow!("tcpdump not found; is it in PATH?")
                }
                std::io::ErrorKind::PermissionDenied => {
                    anyhow::anyhow!("permission denied starting tcpdump; run with sudo")
                }
                _ => anyhow::Error::from(err).context("failed to start tcpdump"),
            })?;

        let stdout = child
            .stdout
            .take()
            .context("tcpdump child has no stdout")?;

        // tcpdump exits immediately when it cannot open the interface; give
        // it a moment and surface its own diagnostics.
        tokio::time::sleep(STARTUP_PROBE_DELAY).await;
        if child.try_wait().context("failed to poll tcpdump")?.is_some() {
            let mut stderr_text = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_string(&mut stderr_text).await;
            }
            bail!("tcpdump failed to start: {}", stderr_text.trim());
        }

        let interface = self.interface.clone();
        info!("loopback sniffer started (tcpdump on {interface})");

        let counters = Arc::new(Counters::default());
        let task = tokio::spawn(run_capture(
            stdout,
            self.parser,
            self.sinks,
            counters.clone(),
        ));

        Ok(SnifferHandle {
            child,
            task: Some(task),
            counters,
        })
    }
}

pub struct SnifferHandle {
    child: Child,
    task: Option<JoinHandle<Result<()>>>,
    counters: Arc<Counters>,
}

impl SnifferHandle {
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub async fn wait(mut self) -> Result<()> {
        let task = self.task.take().context("missing sniffer task")?;
        task.await?
    }

    /// Terminate the capture subprocess (SIGTERM, then SIGKILL after a grace
    /// period) and stop the consumer.
    pub async fn shutdown(mut self) -> Result<()> {
        terminate_child(&mut self.child).await;
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        Ok(())
    }
}

async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: sending SIGTERM to our own child process.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if timeout(CHILD_TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

/// Serial consumer: all reassembly state lives on this single task.
async fn run_capture<R: tokio::io::AsyncRead + Unpin>(
    stdout: R,
    parser: PromptParser,
    sinks: SinkRegistry,
    counters: Arc<Counters>,
) -> Result<()> {
    let mut reader = PcapReader::new(stdout)
        .await
        .context("failed to read pcap stream header")?;
    let link_type = reader.link_type();
    let mut flows = FlowTable::new(counters.clone());

    while let Some(packet) = reader.next_packet().await? {
        counters.packets.fetch_add(1, Ordering::Relaxed);
        let Some(segment) = decode::decode_segment(link_type, &packet.data) else {
            continue;
        };
        for extraction in flows.ingest(segment.src_port, segment.dst_port, segment.payload) {
            emit_extraction(&parser, &sinks, &extraction);
        }
    }
    debug!("pcap stream ended");
    Ok(())
}

/// Turn one extracted JSON body into a prompt record and deliver it. The
/// local RPC channel is trusted, so the advisory logging filter is bypassed.
fn emit_extraction(parser: &PromptParser, sinks: &SinkRegistry, extraction: &Extraction) {
    let url = extraction
        .url
        .clone()
        .unwrap_or_else(|| FALLBACK_URL.to_string());
    let Some(mut record) =
        parser.extract_prompt_from_request(&url, "POST", &extraction.json, &extraction.headers)
    else {
        return;
    };
    if record.prompt.is_empty() {
        return;
    }
    record.capture_method = CaptureMethod::LoopbackSniffer;

    let model = record.metadata.model.clone().unwrap_or_default();
    let cascade_id = record.metadata.cascade_id.clone().unwrap_or_default();
    let chars = record.prompt.chars().count();
    info!("cascade prompt captured (cascade_id={cascade_id}, model={model}, chars={chars})");
    sinks.emit(&record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use wsproxy_capture::Config;
    use wsproxy_capture::InterceptedPrompt;
    use wsproxy_capture::PromptSink;
    use wsproxy_capture::Source;

    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<InterceptedPrompt>>,
    }

    impl PromptSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn accept(&self, prompt: &InterceptedPrompt) -> Result<()> {
            self.records
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(prompt.clone());
            Ok(())
        }
    }

    fn harness() -> (PromptParser, SinkRegistry, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let mut sinks = SinkRegistry::new();
        sinks.push(sink.clone());
        let parser = PromptParser::new(Config::default().monitored_patterns());
        (parser, sinks, sink)
    }

    const SCENARIO_BODY: &str = concat!(
        r#"{"cascadeId":"abc","items":[{"text":"Refactor foo"}],"#,
        r#""metadata":{"ideName":"windsurf","ideVersion":"1.9","extensionVersion":"1.48"},"#,
        r#""cascadeConfig":{"plannerConfig":{"requestedModelUid":"MODEL_X","#,
        r#""conversational":{"plannerMode":"DEFAULT"}},"brainConfig":{"enabled":true}}}"#
    );

    fn scenario_request() -> Vec<u8> {
        let len = SCENARIO_BODY.len();
        format!(
            "POST /exa.language_server_pb.LanguageServerService/SendUserCascadeMessage HTTP/1.1\r\n\
             Host: d.localhost:55123\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {len}\r\n\r\n{SCENARIO_BODY}"
        )
        .into_bytes()
    }

    /// Drive the full pipeline below the packet source: pcap bytes in,
    /// records out.
    async fn run_synthetic_capture(chunks: &[&[u8]]) -> (Vec<InterceptedPrompt>, CounterSnapshot) {
        let mut stream = pcap::test_support::global_header(0);
        for chunk in chunks {
            let packet = decode::test_support::loopback_packet(50000, 55123, chunk);
            stream.extend_from_slice(&pcap::test_support::record(&packet));
        }

        let (parser, sinks, sink) = harness();
        let counters = Arc::new(Counters::default());
        run_capture(stream.as_slice(), parser, sinks, counters.clone())
            .await
            .unwrap();

        let records = sink
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        (records, counters.snapshot())
    }

    #[tokio::test]
    async fn cascade_request_in_one_packet_emits_one_record() {
        let request = scenario_request();
        let (records, counters) = run_synthetic_capture(&[request.as_slice()]).await;

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.prompt, "Refactor foo");
        assert_eq!(record.source, Source::Windsurf);
        assert_eq!(record.capture_method, CaptureMethod::LoopbackSniffer);
        assert_eq!(record.metadata.model.as_deref(), Some("MODEL_X"));
        assert_eq!(record.metadata.cascade_id.as_deref(), Some("abc"));
        assert_eq!(record.metadata.planner_mode.as_deref(), Some("DEFAULT"));
        assert_eq!(record.metadata.brain_enabled, Some(true));
        assert_eq!(
            record.url,
            "http://d.localhost:55123/exa.language_server_pb.LanguageServerService/SendUserCascadeMessage"
        );
        assert_eq!(counters.packets, 1);
        assert_eq!(counters.extractions, 1);
        assert_eq!(counters.active_buffers, 0);
    }

    #[tokio::test]
    async fn cascade_request_split_across_packets_emits_once() {
        let request = scenario_request();
        let third = request.len() / 3;
        let chunks = [
            &request[..third],
            &request[third..2 * third],
            &request[2 * third..],
        ];
        let (records, counters) = run_synthetic_capture(&chunks).await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].prompt, "Refactor foo");
        assert_eq!(counters.extractions, 1);
        assert_eq!(counters.active_buffers, 0);
    }

    #[tokio::test]
    async fn framed_body_without_headers_emits_with_fallback_url() {
        let json = r#"{"cascadeId":"z","items":[{"text":"hi there"}]}"#;
        let mut framed = vec![0x00, 0x00, 0x00, 0x00, 0x4c];
        framed.extend_from_slice(json.as_bytes());
        let (records, _) = run_synthetic_capture(&[framed.as_slice()]).await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].prompt, "hi there");
        assert_eq!(records[0].source, Source::Windsurf);
        assert_eq!(records[0].url, FALLBACK_URL);
    }

    #[tokio::test]
    async fn non_cascade_traffic_emits_nothing() {
        let (records, counters) =
            run_synthetic_capture(&[b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".as_slice()])
                .await;
        assert_eq!(records.len(), 0);
        assert_eq!(counters.extractions, 0);
    }
}
