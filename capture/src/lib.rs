mod config;
mod parser;
mod record;
mod sink;

pub use config::AI_API_PATTERNS;
pub use config::Config;
pub use config::LOG_ONLY_HOSTS;
pub use config::MITM_ALLOWLIST;
pub use config::MonitorConfig;
pub use config::is_log_only_host;
pub use config::is_mitm_host;
pub use config::state_dir;
pub use parser::PromptParser;
pub use record::CaptureMethod;
pub use record::InterceptedPrompt;
pub use record::Message;
pub use record::PromptMetadata;
pub use record::Source;
pub use record::StoredDocument;
pub use sink::DocumentSink;
pub use sink::DocumentStore;
pub use sink::JsonlSink;
pub use sink::MemoryStore;
pub use sink::PromptSink;
pub use sink::SinkRegistry;
pub use sink::StoreStats;
pub use sink::capture_user;
