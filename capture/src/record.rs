use chrono::DateTime;
use chrono::Timelike as _;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Application that originated an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Windsurf,
    Cursor,
    Vscode,
    GithubCopilot,
    ElectronApp,
    Unknown,
}

impl Source {
    /// Detect the source application from the request's User-Agent and URL.
    pub fn detect(user_agent: &str, url: &str) -> Self {
        let ua = user_agent.to_lowercase();
        let url = url.to_lowercase();
        if ua.contains("windsurf") || url.contains("windsurf") {
            Self::Windsurf
        } else if ua.contains("cursor") || url.contains("cursor") {
            Self::Cursor
        } else if ua.contains("vscode") || url.contains("vscode") {
            Self::Vscode
        } else if ua.contains("copilot") || url.contains("copilot") {
            Self::GithubCopilot
        } else if ua.contains("electron") || url.contains("electron") {
            Self::ElectronApp
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Windsurf => "windsurf",
            Self::Cursor => "cursor",
            Self::Vscode => "vscode",
            Self::GithubCopilot => "github-copilot",
            Self::ElectronApp => "electron-app",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which capture channel produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    MitmProxy,
    LoopbackSniffer,
}

/// One turn of the conversation view carried by a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Typed view of the metadata map; absent fields are omitted from the
/// serialized record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cascade_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planner_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ide_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ide_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brain_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_present: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_present: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

/// Canonical record emitted for every captured prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptedPrompt {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: Source,
    pub user_agent: String,
    pub url: String,
    pub method: String,
    pub prompt: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub metadata: PromptMetadata,
    pub capture_method: CaptureMethod,
}

/// Flattened document handed to the document store, with the analytics
/// fields derived at emission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub prompt: String,
    pub user: String,
    pub source: Source,
    pub timestamp: DateTime<Utc>,

    pub model: String,
    pub planner_mode: String,
    pub brain_enabled: bool,

    pub cascade_id: String,

    pub ide_name: String,
    pub ide_version: String,
    pub extension_version: String,

    pub prompt_length: usize,
    pub word_count: usize,
    pub hour_of_day: u32,
    pub day_of_week: String,
    pub date: String,

    pub metadata: PromptMetadata,
}

impl StoredDocument {
    pub fn from_prompt(prompt: &InterceptedPrompt, user: &str) -> Self {
        let meta = &prompt.metadata;
        let ts = prompt.timestamp;
        Self {
            prompt: prompt.prompt.clone(),
            user: user.to_string(),
            source: prompt.source,
            timestamp: ts,
            model: meta.model.clone().unwrap_or_default(),
            planner_mode: meta.planner_mode.clone().unwrap_or_default(),
            brain_enabled: meta.brain_enabled.unwrap_or_default(),
            cascade_id: meta.cascade_id.clone().unwrap_or_default(),
            ide_name: meta.ide_name.clone().unwrap_or_default(),
            ide_version: meta.ide_version.clone().unwrap_or_default(),
            extension_version: meta.extension_version.clone().unwrap_or_default(),
            prompt_length: prompt.prompt.chars().count(),
            word_count: prompt.prompt.split_whitespace().count(),
            hour_of_day: ts.hour(),
            day_of_week: ts.format("%A").to_string(),
            date: ts.format("%Y-%m-%d").to_string(),
            metadata: meta.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;
    use pretty_assertions::assert_eq;

    fn sample_prompt() -> InterceptedPrompt {
        InterceptedPrompt {
            id: Uuid::new_v4(),
            timestamp: Utc.with_ymd_and_hms(2025, 11, 3, 14, 30, 0).unwrap(),
            source: Source::Windsurf,
            user_agent: "windsurf/1.9".to_string(),
            url: "http://d.localhost:55123/exa.language_server_pb.LanguageServerService/SendUserCascadeMessage".to_string(),
            method: "POST".to_string(),
            prompt: "Refactor the foo module".to_string(),
            messages: vec![Message::user("Refactor the foo module")],
            response: None,
            metadata: PromptMetadata {
                model: Some("MODEL_X".to_string()),
                cascade_id: Some("abc".to_string()),
                planner_mode: Some("DEFAULT".to_string()),
                ide_name: Some("windsurf".to_string()),
                brain_enabled: Some(true),
                ..PromptMetadata::default()
            },
            capture_method: CaptureMethod::LoopbackSniffer,
        }
    }

    #[test]
    fn record_round_trips_through_json_line() {
        let record = sample_prompt();
        let line = serde_json::to_string(&record).unwrap();
        let parsed: InterceptedPrompt = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn record_serializes_spec_field_names() {
        let record = sample_prompt();
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();
        assert_eq!(value["source"], "windsurf");
        assert_eq!(value["capture_method"], "loopback_sniffer");
        assert_eq!(value["metadata"]["cascade_id"], "abc");
        assert_eq!(value["messages"][0]["role"], "user");
        // Absent optional fields are omitted entirely.
        assert!(value.get("response").is_none());
        assert!(value["metadata"].get("temperature").is_none());
    }

    #[test]
    fn source_detection_scans_user_agent_and_url() {
        assert_eq!(Source::detect("Windsurf/1.9 Electron", ""), Source::Windsurf);
        assert_eq!(Source::detect("", "https://api.windsurf.ai/x"), Source::Windsurf);
        assert_eq!(Source::detect("Cursor/0.44", ""), Source::Cursor);
        assert_eq!(Source::detect("vscode-copilot", ""), Source::Vscode);
        assert_eq!(Source::detect("GitHub-Copilot-Chat", ""), Source::GithubCopilot);
        assert_eq!(Source::detect("Electron/28", ""), Source::ElectronApp);
        assert_eq!(Source::detect("curl/8.0", "https://example.com"), Source::Unknown);
    }

    #[test]
    fn stored_document_derives_analytics_fields() {
        let doc = StoredDocument::from_prompt(&sample_prompt(), "alice");
        assert_eq!(doc.user, "alice");
        assert_eq!(doc.model, "MODEL_X");
        assert_eq!(doc.prompt_length, 23);
        assert_eq!(doc.word_count, 4);
        assert_eq!(doc.hour_of_day, 14);
        assert_eq!(doc.day_of_week, "Monday");
        assert_eq!(doc.date, "2025-11-03");
    }
}
