use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;

use anyhow::Context as _;
use anyhow::Result;
use chrono::DateTime;
use chrono::Local;
use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::record::InterceptedPrompt;
use crate::record::StoredDocument;

/// Destination for captured prompt records. Implementations must be
/// thread-safe; failures are contained by the registry and never reach the
/// capture path.
pub trait PromptSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn accept(&self, prompt: &InterceptedPrompt) -> Result<()>;
}

/// Ordered set of sinks. Delivery order is registration order (file sink
/// first, then document store); a failing sink is logged and skipped.
#[derive(Default, Clone)]
pub struct SinkRegistry {
    sinks: Vec<Arc<dyn PromptSink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Arc<dyn PromptSink>) {
        self.sinks.push(sink);
    }

    pub fn emit(&self, prompt: &InterceptedPrompt) {
        for sink in &self.sinks {
            if let Err(err) = sink.accept(prompt) {
                let name = sink.name();
                warn!("sink {name} failed to accept prompt {id}: {err:#}", id = prompt.id);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

/// Append-only JSON-line log, one file per local date under a `logs/`
/// directory.
pub struct JsonlSink {
    dir: PathBuf,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn log_path(&self) -> PathBuf {
        let date = Local::now().format("%Y-%m-%d");
        self.dir.join(format!("prompts_{date}.jsonl"))
    }
}

impl PromptSink for JsonlSink {
    fn name(&self) -> &'static str {
        "jsonl-log"
    }

    fn accept(&self, prompt: &InterceptedPrompt) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.log_path();
        let line = serde_json::to_string(prompt).context("failed to serialize prompt record")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;
        Ok(())
    }
}

/// External document database collaborator. Only the write half is part of
/// the capture contract; the query half backs the read-side API.
pub trait DocumentStore: Send + Sync {
    fn insert(&self, doc: StoredDocument) -> Result<()>;
}

/// Sink adapter that flattens records into store documents at emission time.
pub struct DocumentSink {
    store: Arc<dyn DocumentStore>,
    user: String,
}

impl DocumentSink {
    pub fn new(store: Arc<dyn DocumentStore>, user: impl Into<String>) -> Self {
        Self {
            store,
            user: user.into(),
        }
    }
}

impl PromptSink for DocumentSink {
    fn name(&self) -> &'static str {
        "document-store"
    }

    fn accept(&self, prompt: &InterceptedPrompt) -> Result<()> {
        self.store
            .insert(StoredDocument::from_prompt(prompt, &self.user))
    }
}

/// The account the capture process runs for. Under sudo the invoking user is
/// reported, not root.
pub fn capture_user() -> String {
    std::env::var("SUDO_USER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Aggregate statistics over the stored documents.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StoreStats {
    pub total_prompts: usize,
    pub unique_users: usize,
    pub unique_models: Vec<String>,
    pub unique_cascades: usize,
    pub avg_prompt_length: f64,
    pub avg_word_count: f64,
    pub total_words: usize,
    pub brain_enabled_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_prompt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_prompt: Option<DateTime<Utc>>,
    pub model_usage: BTreeMap<String, usize>,
    pub hourly_distribution: BTreeMap<String, usize>,
}

/// In-process document store; backs the read-side API and tests.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<Vec<StoredDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent documents first, with pagination and an optional user
    /// filter.
    pub fn recent(&self, limit: usize, skip: usize, user: Option<&str>) -> Vec<StoredDocument> {
        let docs = self.docs.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut matching: Vec<StoredDocument> = docs
            .iter()
            .filter(|doc| user.is_none_or(|u| doc.user == u))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.into_iter().skip(skip).take(limit).collect()
    }

    pub fn count(&self, user: Option<&str>) -> usize {
        let docs = self.docs.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        docs.iter().filter(|doc| user.is_none_or(|u| doc.user == u)).count()
    }

    pub fn stats(&self) -> StoreStats {
        let docs = self.docs.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        if docs.is_empty() {
            return StoreStats::default();
        }

        let mut users = BTreeSet::new();
        let mut models = BTreeSet::new();
        let mut cascades = BTreeSet::new();
        let mut model_usage: BTreeMap<String, usize> = BTreeMap::new();
        let mut hourly: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_length = 0usize;
        let mut total_words = 0usize;
        let mut brain_enabled = 0usize;
        let mut first = docs[0].timestamp;
        let mut last = docs[0].timestamp;

        for doc in docs.iter() {
            users.insert(doc.user.clone());
            if !doc.model.is_empty() {
                models.insert(doc.model.clone());
                *model_usage.entry(doc.model.clone()).or_default() += 1;
            }
            if !doc.cascade_id.is_empty() {
                cascades.insert(doc.cascade_id.clone());
            }
            *hourly.entry(doc.hour_of_day.to_string()).or_default() += 1;
            total_length += doc.prompt_length;
            total_words += doc.word_count;
            if doc.brain_enabled {
                brain_enabled += 1;
            }
            first = first.min(doc.timestamp);
            last = last.max(doc.timestamp);
        }

        let count = docs.len();
        StoreStats {
            total_prompts: count,
            unique_users: users.len(),
            unique_models: models.into_iter().collect(),
            unique_cascades: cascades.len(),
            avg_prompt_length: (total_length as f64 / count as f64 * 10.0).round() / 10.0,
            avg_word_count: (total_words as f64 / count as f64 * 10.0).round() / 10.0,
            total_words,
            brain_enabled_count: brain_enabled,
            first_prompt: Some(first),
            last_prompt: Some(last),
            model_usage,
            hourly_distribution: hourly,
        }
    }
}

impl DocumentStore for MemoryStore {
    fn insert(&self, doc: StoredDocument) -> Result<()> {
        let mut docs = self.docs.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        docs.push(doc);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CaptureMethod;
    use crate::record::Message;
    use crate::record::PromptMetadata;
    use crate::record::Source;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn record(prompt: &str) -> InterceptedPrompt {
        InterceptedPrompt {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: Source::Windsurf,
            user_agent: String::new(),
            url: "http://d.localhost:1/x".to_string(),
            method: "POST".to_string(),
            prompt: prompt.to_string(),
            messages: vec![Message::user(prompt)],
            response: None,
            metadata: PromptMetadata {
                model: Some("MODEL_X".to_string()),
                cascade_id: Some("c1".to_string()),
                brain_enabled: Some(true),
                ..PromptMetadata::default()
            },
            capture_method: CaptureMethod::LoopbackSniffer,
        }
    }

    #[test]
    fn jsonl_sink_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(dir.path());
        let first = record("first prompt");
        let second = record("second prompt");
        sink.accept(&first).unwrap();
        sink.accept(&second).unwrap();

        let date = Local::now().format("%Y-%m-%d");
        let path = dir.path().join(format!("prompts_{date}.jsonl"));
        let contents = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: InterceptedPrompt = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, first);
        let parsed: InterceptedPrompt = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed, second);
    }

    struct FailingSink;

    impl PromptSink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn accept(&self, _prompt: &InterceptedPrompt) -> Result<()> {
            anyhow::bail!("store unreachable")
        }
    }

    #[test]
    fn registry_isolates_sink_failures() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = SinkRegistry::new();
        registry.push(Arc::new(FailingSink));
        registry.push(Arc::new(DocumentSink::new(store.clone(), "alice")));

        registry.emit(&record("still delivered to later sinks"));
        assert_eq!(store.count(None), 1);
    }

    #[test]
    fn memory_store_paginates_and_filters() {
        let store = MemoryStore::new();
        for i in 0..5i64 {
            let mut doc = StoredDocument::from_prompt(&record(&format!("prompt {i}")), "alice");
            doc.timestamp = Utc::now() + chrono::Duration::seconds(i);
            store.insert(doc).unwrap();
        }
        store
            .insert(StoredDocument::from_prompt(&record("other user"), "bob"))
            .unwrap();

        assert_eq!(store.count(None), 6);
        assert_eq!(store.count(Some("alice")), 5);
        let page = store.recent(2, 1, Some("alice"));
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].prompt, "prompt 3");
        assert_eq!(page[1].prompt, "prompt 2");
    }

    #[test]
    fn stats_aggregate_across_documents() {
        let store = MemoryStore::new();
        store
            .insert(StoredDocument::from_prompt(&record("one two three"), "alice"))
            .unwrap();
        store
            .insert(StoredDocument::from_prompt(&record("four five"), "bob"))
            .unwrap();

        let stats = store.stats();
        assert_eq!(stats.total_prompts, 2);
        assert_eq!(stats.unique_users, 2);
        assert_eq!(stats.unique_models, vec!["MODEL_X".to_string()]);
        assert_eq!(stats.unique_cascades, 1);
        assert_eq!(stats.total_words, 5);
        assert_eq!(stats.brain_enabled_count, 2);
        assert_eq!(stats.model_usage.get("MODEL_X"), Some(&2));
    }
}
