use std::collections::HashMap;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::record::CaptureMethod;
use crate::record::InterceptedPrompt;
use crate::record::Message;
use crate::record::PromptMetadata;
use crate::record::Source;

/// Substrings that mark the client's local language-server RPC endpoint.
const RPC_ENDPOINT_MARKERS: &[&str] = &[
    "sendusercascademessage",
    "languageserverservice",
    "exa.language_server_pb",
];

/// Loose keywords that flag a request body as likely AI traffic. Downstream
/// filtering (`should_log_request`) narrows this back down.
const BODY_KEYWORDS: &[&str] = &[
    "messages",
    "prompt",
    "completion",
    "chat",
    "model",
    "gpt",
    "claude",
    "temperature",
    "max_tokens",
    "stream",
    "assistant",
    "user",
    "system",
];

const UA_MARKERS: &[&str] = &["windsurf", "cursor", "vscode", "electron", "copilot"];

/// URL substrings for system/internal endpoints that are never worth logging.
const NOISE_URL_MARKERS: &[&str] = &["health", "ping", "status", "auth", "token"];

/// Minimum prompt length worth recording; anything shorter is almost always
/// autocomplete chatter.
const MIN_PROMPT_CHARS: usize = 10;

/// Extracts prompt records from intercepted HTTP exchanges. Stateless apart
/// from the configured URL pattern list; callable from any thread.
pub struct PromptParser {
    patterns: Vec<String>,
}

impl PromptParser {
    pub fn new(patterns: Vec<String>) -> Self {
        let patterns = patterns.into_iter().map(|p| p.to_lowercase()).collect();
        Self { patterns }
    }

    /// Loose classification of an exchange as AI traffic.
    pub fn is_ai_request(&self, url: &str, body: &str, headers: &HashMap<String, String>) -> bool {
        let url = url.to_lowercase();
        let body = body.to_lowercase();
        let user_agent = headers
            .get("user-agent")
            .map(|ua| ua.to_lowercase())
            .unwrap_or_default();

        if RPC_ENDPOINT_MARKERS.iter().any(|m| url.contains(m)) {
            return true;
        }
        if self.patterns.iter().any(|p| url.contains(p)) {
            return true;
        }
        if BODY_KEYWORDS.iter().any(|k| body.contains(k)) {
            return true;
        }
        UA_MARKERS.iter().any(|m| user_agent.contains(m))
    }

    /// Extract a prompt record from a request body. Returns `None` for
    /// non-AI traffic and for bodies that are not valid JSON.
    pub fn extract_prompt_from_request(
        &self,
        url: &str,
        method: &str,
        body: &str,
        headers: &HashMap<String, String>,
    ) -> Option<InterceptedPrompt> {
        if !self.is_ai_request(url, body, headers) {
            return None;
        }

        let data: Value = if body.is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            match serde_json::from_str(body) {
                Ok(data) => data,
                Err(err) => {
                    debug!("failed to parse JSON body for {url}: {err}");
                    return None;
                }
            }
        };

        if data.get("cascadeId").is_some() && data.get("items").is_some() {
            return self.extract_cascade(&data, url, method, body, headers);
        }

        let mut messages = Vec::new();
        let mut prompt = String::new();

        if let Some(list) = data.get("messages").and_then(Value::as_array) {
            // Chat schema: the conversation passes through verbatim and the
            // prompt is the last user turn.
            for msg in list {
                messages.push(Message {
                    role: text_field(msg, "role"),
                    content: text_field(msg, "content"),
                });
            }
            if let Some(last_user) = list
                .iter()
                .rev()
                .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            {
                prompt = text_field(last_user, "content");
            }
        } else if data.get("prompt").is_some() {
            prompt = text_field(&data, "prompt");
            messages.push(Message::user(prompt.clone()));
        } else if data.get("query").is_some() || data.get("text").is_some() {
            prompt = if data.get("query").is_some() {
                text_field(&data, "query")
            } else {
                text_field(&data, "text")
            };
            messages.push(Message::user(prompt.clone()));
        }

        let metadata = PromptMetadata {
            model: data
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string),
            temperature: data.get("temperature").and_then(Value::as_f64),
            max_tokens: data.get("max_tokens").and_then(Value::as_u64),
            stream: data.get("stream").and_then(Value::as_bool),
            content_type: headers.get("content-type").cloned(),
            authorization_present: Some(headers.contains_key("authorization")),
            request_size: Some(body.len() as u64),
            ..PromptMetadata::default()
        };

        let user_agent = headers.get("user-agent").cloned().unwrap_or_default();
        Some(InterceptedPrompt {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: Source::detect(&user_agent, url),
            user_agent,
            url: url.to_string(),
            method: method.to_string(),
            prompt,
            messages,
            response: None,
            metadata,
            capture_method: CaptureMethod::MitmProxy,
        })
    }

    /// Parse the client's `SendUserCascadeMessage` body shape.
    fn extract_cascade(
        &self,
        data: &Value,
        url: &str,
        method: &str,
        body: &str,
        headers: &HashMap<String, String>,
    ) -> Option<InterceptedPrompt> {
        let cascade: CascadeBody = match serde_json::from_value(data.clone()) {
            Ok(cascade) => cascade,
            Err(err) => {
                debug!("unexpected cascade body shape for {url}: {err}");
                return None;
            }
        };

        let prompt = cascade
            .items
            .iter()
            .filter_map(CascadeItem::text)
            .collect::<Vec<_>>()
            .join("\n");

        let planner = &cascade.cascade_config.planner_config;
        let client_meta = &cascade.metadata;
        let metadata = PromptMetadata {
            model: non_empty(&planner.requested_model_uid),
            cascade_id: Some(cascade.cascade_id.clone()),
            planner_mode: non_empty(&planner.conversational.planner_mode),
            ide_name: Some(
                client_meta
                    .ide_name
                    .clone()
                    .unwrap_or_else(|| "windsurf".to_string()),
            ),
            ide_version: non_empty(&client_meta.ide_version),
            extension_version: non_empty(&client_meta.extension_version),
            locale: non_empty(&client_meta.locale),
            api_key_present: Some(!client_meta.api_key.is_empty()),
            brain_enabled: Some(cascade.cascade_config.brain_config.enabled),
            content_type: headers.get("content-type").cloned(),
            request_size: Some(body.len() as u64),
            ..PromptMetadata::default()
        };

        Some(InterceptedPrompt {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: Source::Windsurf,
            user_agent: headers.get("user-agent").cloned().unwrap_or_default(),
            url: url.to_string(),
            method: method.to_string(),
            prompt: prompt.clone(),
            messages: vec![Message::user(prompt)],
            response: None,
            metadata,
            capture_method: CaptureMethod::MitmProxy,
        })
    }

    /// Extract the assistant's reply from a response body: server-sent
    /// events are concatenated delta-by-delta, plain JSON is probed for the
    /// known response shapes.
    pub fn extract_response(&self, response_body: &str) -> Option<String> {
        if response_body.is_empty() {
            return None;
        }

        if response_body.starts_with("data: ") {
            let mut text = String::new();
            for line in response_body.lines() {
                let Some(payload) = line.strip_prefix("data: ") else {
                    continue;
                };
                if payload == "[DONE]" {
                    continue;
                }
                // Non-parseable chunks are skipped.
                let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
                    continue;
                };
                if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str() {
                    text.push_str(content);
                }
            }
            return if text.is_empty() { None } else { Some(text) };
        }

        let data: Value = serde_json::from_str(response_body).ok()?;

        if let Some(content) = data["choices"][0]["message"]["content"].as_str() {
            return Some(content.to_string());
        }
        match data.get("content") {
            Some(Value::Array(items)) => {
                return items
                    .first()
                    .and_then(|item| item.get("text"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
            Some(Value::String(content)) => return Some(content.clone()),
            _ => {}
        }
        data.get("response")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Advisory filter applied before persisting a record. Callers on an
    /// already-trusted channel (the local RPC endpoint) bypass it.
    pub fn should_log_request(&self, prompt: &InterceptedPrompt) -> bool {
        if prompt.prompt.trim().is_empty() {
            return false;
        }
        if prompt.prompt.chars().count() < MIN_PROMPT_CHARS {
            return false;
        }
        let url = prompt.url.to_lowercase();
        !NOISE_URL_MARKERS.iter().any(|m| url.contains(m))
    }
}

/// A JSON field rendered as text: strings verbatim, anything else as its
/// compact JSON form, missing fields as the empty string.
fn text_field(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CascadeBody {
    #[serde(default)]
    cascade_id: String,
    #[serde(default)]
    items: Vec<CascadeItem>,
    #[serde(default)]
    metadata: CascadeClientMetadata,
    #[serde(default)]
    cascade_config: CascadeConfig,
}

/// Items are either `{ "text": … }` objects or bare strings; anything else
/// contributes nothing to the prompt.
#[derive(Deserialize)]
#[serde(untagged)]
enum CascadeItem {
    Text { text: String },
    Plain(String),
    Other(Value),
}

impl CascadeItem {
    fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Plain(text) => Some(text),
            Self::Other(_) => None,
        }
    }
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CascadeClientMetadata {
    #[serde(default)]
    api_key: String,
    ide_name: Option<String>,
    #[serde(default)]
    ide_version: String,
    #[serde(default)]
    extension_version: String,
    #[serde(default)]
    locale: String,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CascadeConfig {
    #[serde(default)]
    planner_config: PlannerConfig,
    #[serde(default)]
    brain_config: BrainConfig,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlannerConfig {
    #[serde(default)]
    requested_model_uid: String,
    #[serde(default)]
    conversational: ConversationalConfig,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationalConfig {
    #[serde(default)]
    planner_mode: String,
}

#[derive(Default, Deserialize)]
struct BrainConfig {
    #[serde(default)]
    enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use pretty_assertions::assert_eq;

    fn parser() -> PromptParser {
        PromptParser::new(Config::default().monitored_patterns())
    }

    fn no_headers() -> HashMap<String, String> {
        HashMap::new()
    }

    const CASCADE_BODY: &str = r#"{"cascadeId":"abc","items":[{"text":"Refactor foo"}],
        "metadata":{"ideName":"windsurf","ideVersion":"1.9","extensionVersion":"1.48"},
        "cascadeConfig":{"plannerConfig":{"requestedModelUid":"MODEL_X",
        "conversational":{"plannerMode":"DEFAULT"}},"brainConfig":{"enabled":true}}}"#;

    const CASCADE_URL: &str =
        "http://d.localhost:55123/exa.language_server_pb.LanguageServerService/SendUserCascadeMessage";

    #[test]
    fn cascade_body_yields_windsurf_record() {
        let prompt = parser()
            .extract_prompt_from_request(CASCADE_URL, "POST", CASCADE_BODY, &no_headers())
            .unwrap();

        assert_eq!(prompt.source, Source::Windsurf);
        assert_eq!(prompt.prompt, "Refactor foo");
        assert_eq!(prompt.messages, vec![Message::user("Refactor foo")]);
        assert_eq!(prompt.metadata.model.as_deref(), Some("MODEL_X"));
        assert_eq!(prompt.metadata.cascade_id.as_deref(), Some("abc"));
        assert_eq!(prompt.metadata.planner_mode.as_deref(), Some("DEFAULT"));
        assert_eq!(prompt.metadata.ide_name.as_deref(), Some("windsurf"));
        assert_eq!(prompt.metadata.ide_version.as_deref(), Some("1.9"));
        assert_eq!(prompt.metadata.extension_version.as_deref(), Some("1.48"));
        assert_eq!(prompt.metadata.brain_enabled, Some(true));
        assert_eq!(prompt.metadata.api_key_present, Some(false));
    }

    #[test]
    fn cascade_joins_items_and_accepts_bare_strings() {
        let body = r#"{"cascadeId":"c1","items":[{"text":"first"},"second",{"other":1}]}"#;
        let prompt = parser()
            .extract_prompt_from_request(CASCADE_URL, "POST", body, &no_headers())
            .unwrap();
        assert_eq!(prompt.prompt, "first\nsecond");
        assert_eq!(prompt.metadata.ide_name.as_deref(), Some("windsurf"));
        assert_eq!(prompt.metadata.brain_enabled, Some(false));
    }

    #[test]
    fn chat_schema_takes_last_user_message() {
        let body = r#"{"model":"gpt-4","messages":[
            {"role":"system","content":"S"},
            {"role":"user","content":"first question"},
            {"role":"assistant","content":"answer"},
            {"role":"user","content":"Hello"}]}"#;
        let prompt = parser()
            .extract_prompt_from_request(
                "https://api.openai.com/v1/chat/completions",
                "POST",
                body,
                &no_headers(),
            )
            .unwrap();
        assert_eq!(prompt.prompt, "Hello");
        assert_eq!(prompt.metadata.model.as_deref(), Some("gpt-4"));
        assert_eq!(prompt.messages.len(), 4);
        assert_eq!(prompt.messages[0].role, "system");
        assert_eq!(prompt.messages[3].content, "Hello");
    }

    #[test]
    fn direct_prompt_builds_single_user_message() {
        let body = r#"{"prompt":"complete this function","max_tokens":256}"#;
        let prompt = parser()
            .extract_prompt_from_request(
                "https://api.openai.com/v1/completions",
                "POST",
                body,
                &no_headers(),
            )
            .unwrap();
        assert_eq!(prompt.prompt, "complete this function");
        assert_eq!(prompt.messages, vec![Message::user("complete this function")]);
        assert_eq!(prompt.metadata.max_tokens, Some(256));
    }

    #[test]
    fn query_wins_over_text() {
        let body = r#"{"query":"from query","text":"from text","model":"m"}"#;
        let prompt = parser()
            .extract_prompt_from_request("https://api.codeium.com/search", "POST", body, &no_headers())
            .unwrap();
        assert_eq!(prompt.prompt, "from query");
    }

    #[test]
    fn non_ai_request_yields_none() {
        let headers = HashMap::from([("user-agent".to_string(), "curl/8.0".to_string())]);
        let parser = parser();
        let url = "https://example.com/index.html";
        let body = r#"{"page":1}"#;
        assert!(!parser.is_ai_request(url, body, &headers));
        assert_eq!(parser.extract_prompt_from_request(url, "GET", body, &headers), None);
    }

    #[test]
    fn invalid_json_yields_none() {
        let prompt = parser().extract_prompt_from_request(
            "https://api.openai.com/v1/chat/completions",
            "POST",
            "{\"messages\": [",
            &no_headers(),
        );
        assert_eq!(prompt, None);
    }

    #[test]
    fn is_ai_request_matches_url_body_and_user_agent() {
        let parser = parser();
        assert!(parser.is_ai_request(
            "http://d.localhost:1234/exa.language_server_pb.LanguageServerService/SendUserCascadeMessage",
            "",
            &no_headers(),
        ));
        assert!(parser.is_ai_request("https://api.anthropic.com/v1/messages", "", &no_headers()));
        assert!(parser.is_ai_request("https://example.com", r#"{"temperature":0.2}"#, &no_headers()));
        let headers = HashMap::from([("user-agent".to_string(), "Windsurf/1.9".to_string())]);
        assert!(parser.is_ai_request("https://example.com", "", &headers));
        assert!(!parser.is_ai_request("https://example.com", "{}", &no_headers()));
    }

    #[test]
    fn streaming_response_concatenates_deltas() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"he\"}}]}\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\
                    data: [DONE]\n";
        assert_eq!(parser().extract_response(body).as_deref(), Some("hello"));
    }

    #[test]
    fn streaming_response_skips_unparseable_chunks() {
        let body = "data: not json\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n";
        assert_eq!(parser().extract_response(body).as_deref(), Some("ok"));
    }

    #[test]
    fn response_shapes_are_probed_in_order() {
        let parser = parser();
        assert_eq!(
            parser
                .extract_response(r#"{"choices":[{"message":{"content":"openai"}}]}"#)
                .as_deref(),
            Some("openai")
        );
        assert_eq!(
            parser
                .extract_response(r#"{"content":[{"type":"text","text":"anthropic"}]}"#)
                .as_deref(),
            Some("anthropic")
        );
        assert_eq!(
            parser.extract_response(r#"{"content":"plain"}"#).as_deref(),
            Some("plain")
        );
        assert_eq!(
            parser.extract_response(r#"{"response":"generic"}"#).as_deref(),
            Some("generic")
        );
        assert_eq!(parser.extract_response("not json at all"), None);
        assert_eq!(parser.extract_response(r#"{"unrelated":true}"#), None);
    }

    #[test]
    fn should_log_request_filters_short_and_system_traffic() {
        let parser = parser();
        let mut prompt = parser
            .extract_prompt_from_request(
                "https://api.openai.com/v1/chat/completions",
                "POST",
                r#"{"messages":[{"role":"user","content":"a prompt long enough to log"}]}"#,
                &no_headers(),
            )
            .unwrap();
        assert!(parser.should_log_request(&prompt));

        prompt.prompt = "short".to_string();
        assert!(!parser.should_log_request(&prompt));

        prompt.prompt = "a prompt long enough to log".to_string();
        prompt.url = "https://api.openai.com/v1/auth/token".to_string();
        assert!(!parser.should_log_request(&prompt));

        prompt.url = "https://api.openai.com/health".to_string();
        assert!(!parser.should_log_request(&prompt));
    }
}
