use std::path::PathBuf;

use anyhow::Context as _;
use anyhow::Result;

/// Hostnames whose CONNECT tunnels are terminated and decrypted. These are
/// the endpoints that actually carry prompts and completions.
pub const MITM_ALLOWLIST: &[&str] = &[
    "api.openai.com",
    "api.anthropic.com",
    "api.codeium.com",
    "copilot-proxy.githubusercontent.com",
    "api.github.com",
    "generativelanguage.googleapis.com",
    "api.groq.com",
    "api.mistral.ai",
    "api.cohere.com",
    "api.together.xyz",
    "api.windsurf.ai",
    "server.windsurf.ai",
];

/// Hostnames announced when tunnelled but never decrypted.
pub const LOG_ONLY_HOSTS: &[&str] = &[
    "unleash.codeium.com",
    "telemetry.codeium.com",
    "app.codeium.com",
    "codeium.com",
];

/// URL substrings that classify a request as AI traffic.
pub const AI_API_PATTERNS: &[&str] = &[
    "api.openai.com",
    "api.anthropic.com",
    "api.codeium.com",
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/messages",
    "/chat/completions",
    "windsurf",
    "cursor",
    "copilot",
];

pub fn is_mitm_host(host: &str) -> bool {
    let host = host.to_lowercase();
    MITM_ALLOWLIST.iter().any(|h| *h == host)
}

pub fn is_log_only_host(host: &str) -> bool {
    let host = host.to_lowercase();
    LOG_ONLY_HOSTS.iter().any(|h| *h == host)
}

/// Directory holding the CA material and the leaf certificate cache.
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".windsurf-proxy")
}

/// Which URL pattern families are monitored.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub openai: bool,
    pub anthropic: bool,
    pub codeium: bool,
    pub all_ai_apis: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            openai: true,
            anthropic: true,
            codeium: true,
            all_ai_apis: true,
        }
    }
}

/// Runtime configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub proxy_port: u16,
    pub monitor: MonitorConfig,
    pub log_level: String,
    /// CA certificate path advertised to the operator for trust installation.
    pub cert_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_port: 8080,
            monitor: MonitorConfig::default(),
            log_level: "INFO".to_string(),
            cert_path: state_dir().join("ca-cert.pem"),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(port) = std::env::var("PROXY_PORT") {
            config.proxy_port = port
                .parse()
                .with_context(|| format!("invalid PROXY_PORT value: {port}"))?;
        }
        config.monitor = MonitorConfig {
            openai: env_flag("MONITOR_OPENAI", true),
            anthropic: env_flag("MONITOR_ANTHROPIC", true),
            codeium: env_flag("MONITOR_CODEIUM", true),
            all_ai_apis: env_flag("MONITOR_ALL_AI_APIS", true),
        };
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }
        if let Ok(path) = std::env::var("CERT_PATH") {
            config.cert_path = PathBuf::from(path);
        }
        Ok(config)
    }

    /// URL patterns to monitor, assembled from the enabled families.
    pub fn monitored_patterns(&self) -> Vec<String> {
        let mut patterns: Vec<&str> = Vec::new();
        if self.monitor.openai {
            patterns.extend(["api.openai.com", "/v1/chat/completions", "/v1/completions"]);
        }
        if self.monitor.anthropic {
            patterns.extend(["api.anthropic.com", "/v1/messages"]);
        }
        if self.monitor.codeium {
            patterns.extend(["api.codeium.com", "codeium"]);
        }
        if self.monitor.all_ai_apis {
            patterns.extend(AI_API_PATTERNS);
        }
        let mut deduped: Vec<String> = Vec::new();
        for pattern in patterns {
            if !deduped.iter().any(|p| p == pattern) {
                deduped.push(pattern.to_string());
            }
        }
        deduped
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|value| value.to_lowercase() == "true")
        .unwrap_or(default)
}
