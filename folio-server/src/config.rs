// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Result;
use folio_core::{ContextConfig, Profile};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum number of upstream credentials the dispatcher rotates through.
pub const MAX_API_KEYS: usize = 3;

/// Environment variables holding upstream credentials, in rotation order.
pub const API_KEY_ENV_VARS: [&str; MAX_API_KEYS] =
    ["GEMINI_API_KEY", "GEMINI_API_KEY_2", "GEMINI_API_KEY_3"];

/// Folio Server Configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpServerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub llm: LLMConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub profile: Profile,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpServerConfig {
    /// HTTP API listen address (e.g., "127.0.0.1:3000")
    #[serde(default = "default_http_addr")]
    pub listen_addr: String,

    /// Whole-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Enable CORS
    #[serde(default = "default_enable_cors")]
    pub enable_cors: bool,

    /// Allowed CORS origins (empty = allow all)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_http_addr(),
            request_timeout_secs: default_request_timeout(),
            enable_cors: default_enable_cors(),
            cors_origins: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatConfig {
    /// Largest accepted request body in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Largest accepted message in characters, after trimming
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,

    /// Number of most recent history entries forwarded upstream
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
            max_message_chars: default_max_message_chars(),
            history_window: default_history_window(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterBackend {
    /// In-process counters (single instance deployments and tests)
    #[default]
    Memory,
    /// Upstash-compatible Redis REST endpoint
    Upstash,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Enable IP rate limiting on the chat endpoint
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,

    /// Maximum requests per window
    #[serde(default = "default_rate_limit_max_requests")]
    pub max_requests: u32,

    /// Window length in seconds
    #[serde(default = "default_rate_limit_window_secs")]
    pub window_secs: u64,

    /// Prefix of counter keys (`<prefix>:ip:<ip>`)
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Let requests through when the counter store is unreachable
    #[serde(default)]
    pub fail_open: bool,

    /// Key clients by `X-Forwarded-For` / `X-Real-IP`; turn off unless a proxy
    /// in front of the server overwrites those headers
    #[serde(default = "default_trust_proxy_headers")]
    pub trust_proxy_headers: bool,

    #[serde(default)]
    pub backend: CounterBackend,

    /// REST endpoint for the upstash backend
    #[serde(default)]
    pub upstash_url: Option<String>,

    /// Bearer token for the upstash backend
    #[serde(default)]
    pub upstash_token: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            max_requests: default_rate_limit_max_requests(),
            window_secs: default_rate_limit_window_secs(),
            key_prefix: default_key_prefix(),
            fail_open: false,
            trust_proxy_headers: default_trust_proxy_headers(),
            backend: CounterBackend::default(),
            upstash_url: None,
            upstash_token: None,
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct LLMConfig {
    /// Upstream API keys in rotation order
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Gemini model name
    #[serde(default = "default_model")]
    pub model: String,

    /// Generative Language API base URL
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Per-attempt upstream timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Seconds a throttled key is skipped before it is retried
    #[serde(default = "default_key_reset_secs")]
    pub key_reset_secs: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            api_keys: vec![],
            model: default_model(),
            base_url: default_llm_base_url(),
            timeout_secs: default_llm_timeout(),
            key_reset_secs: default_key_reset_secs(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

impl std::fmt::Debug for LLMConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LLMConfig")
            .field("api_keys", &format_args!("<{} redacted>", self.api_keys.len()))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .field("key_reset_secs", &self.key_reset_secs)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .finish()
    }
}

impl LLMConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn key_reset_interval(&self) -> Duration {
        Duration::from_secs(self.key_reset_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentConfig {
    /// Sanity project id; enables the Sanity content source
    #[serde(default)]
    pub sanity_project_id: Option<String>,

    #[serde(default = "default_sanity_dataset")]
    pub sanity_dataset: String,

    #[serde(default = "default_sanity_api_version")]
    pub sanity_api_version: String,

    /// Read token for private datasets
    #[serde(default)]
    pub sanity_token: Option<String>,

    /// JSON file with `projects`, `certificates` and `experiences` arrays,
    /// used when no Sanity project is configured
    #[serde(default)]
    pub static_path: Option<PathBuf>,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            sanity_project_id: None,
            sanity_dataset: default_sanity_dataset(),
            sanity_api_version: default_sanity_api_version(),
            sanity_token: None,
            static_path: None,
        }
    }
}

// Default values
fn default_http_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_enable_cors() -> bool {
    true
}

fn default_max_body_bytes() -> usize {
    1_000_000
}

fn default_max_message_chars() -> usize {
    folio_core::DEFAULT_MAX_MESSAGE_CHARS
}

fn default_history_window() -> usize {
    10
}

fn default_rate_limit_enabled() -> bool {
    true
}

fn default_rate_limit_max_requests() -> u32 {
    15
}

fn default_rate_limit_window_secs() -> u64 {
    3600
}

fn default_trust_proxy_headers() -> bool {
    true
}

fn default_key_prefix() -> String {
    "chat_ratelimit".to_string()
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_llm_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_llm_timeout() -> u64 {
    20
}

fn default_key_reset_secs() -> u64 {
    300
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_output_tokens() -> u32 {
    500
}

fn default_sanity_dataset() -> String {
    "production".to_string()
}

fn default_sanity_api_version() -> String {
    "2024-01-01".to_string()
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| match v.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    })
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Supported environment variables:
    /// - FOLIO_HTTP_ADDR: HTTP listen address (default: 127.0.0.1:3000)
    /// - FOLIO_ENABLE_CORS / FOLIO_CORS_ORIGINS: CORS switch and comma-separated origins
    /// - FOLIO_RATE_LIMIT_ENABLED / FOLIO_RATE_LIMIT_MAX / FOLIO_RATE_LIMIT_WINDOW_SECS
    /// - FOLIO_RATE_LIMIT_FAIL_OPEN: allow requests when the counter store is down
    /// - FOLIO_TRUST_PROXY_HEADERS: take the client IP from forwarding headers
    /// - UPSTASH_REDIS_REST_URL / UPSTASH_REDIS_REST_TOKEN: selects the upstash backend
    /// - GEMINI_API_KEY, GEMINI_API_KEY_2, GEMINI_API_KEY_3: upstream keys
    /// - GEMINI_MODEL: model name
    /// - SANITY_PROJECT_ID / SANITY_DATASET / SANITY_API_VERSION / SANITY_API_TOKEN
    /// - FOLIO_CONTENT_PATH: static content JSON file
    pub fn from_env() -> Self {
        Self::default().merge_with_env()
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let config = if let Some(path) = config_file {
            if path.exists() {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            } else {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
        } else {
            Self::default()
        };

        Ok(config.merge_with_env())
    }

    /// Overlay any explicitly set environment variables
    fn merge_with_env(mut self) -> Self {
        if let Ok(addr) = std::env::var("FOLIO_HTTP_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Some(cors) = env_flag("FOLIO_ENABLE_CORS") {
            self.server.enable_cors = cors;
        }
        if let Ok(origins) = std::env::var("FOLIO_CORS_ORIGINS") {
            self.server.cors_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }

        if let Some(enabled) = env_flag("FOLIO_RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = enabled;
        }
        if let Some(max) = env_parse("FOLIO_RATE_LIMIT_MAX") {
            self.rate_limit.max_requests = max;
        }
        if let Some(window) = env_parse("FOLIO_RATE_LIMIT_WINDOW_SECS") {
            self.rate_limit.window_secs = window;
        }
        if let Some(fail_open) = env_flag("FOLIO_RATE_LIMIT_FAIL_OPEN") {
            self.rate_limit.fail_open = fail_open;
        }
        if let Some(trust) = env_flag("FOLIO_TRUST_PROXY_HEADERS") {
            self.rate_limit.trust_proxy_headers = trust;
        }
        if let (Ok(url), Ok(token)) = (
            std::env::var("UPSTASH_REDIS_REST_URL"),
            std::env::var("UPSTASH_REDIS_REST_TOKEN"),
        ) {
            self.rate_limit.backend = CounterBackend::Upstash;
            self.rate_limit.upstash_url = Some(url);
            self.rate_limit.upstash_token = Some(token);
        }

        let env_keys: Vec<String> = API_KEY_ENV_VARS
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .collect();
        if !env_keys.is_empty() {
            self.llm.api_keys = env_keys;
        }
        if let Ok(model) = std::env::var("GEMINI_MODEL") {
            self.llm.model = model;
        }

        if let Ok(project_id) = std::env::var("SANITY_PROJECT_ID") {
            self.content.sanity_project_id = Some(project_id);
        }
        if let Ok(dataset) = std::env::var("SANITY_DATASET") {
            self.content.sanity_dataset = dataset;
        }
        if let Ok(version) = std::env::var("SANITY_API_VERSION") {
            self.content.sanity_api_version = version;
        }
        if let Ok(token) = std::env::var("SANITY_API_TOKEN") {
            self.content.sanity_token = Some(token);
        }
        if let Ok(path) = std::env::var("FOLIO_CONTENT_PATH") {
            self.content.static_path = Some(PathBuf::from(path));
        }

        self
    }

    /// Parse listen address as SocketAddr
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;

        if self.llm.api_keys.len() > MAX_API_KEYS {
            anyhow::bail!(
                "At most {} upstream API keys are supported, got {}",
                MAX_API_KEYS,
                self.llm.api_keys.len()
            );
        }
        url::Url::parse(&self.llm.base_url)?;
        if self.llm.timeout_secs == 0 || self.llm.key_reset_secs == 0 {
            anyhow::bail!("llm.timeout_secs and llm.key_reset_secs must be greater than 0");
        }

        if self.rate_limit.max_requests == 0 || self.rate_limit.window_secs == 0 {
            anyhow::bail!("Rate limit max_requests and window_secs must be greater than 0");
        }
        if self.rate_limit.backend == CounterBackend::Upstash {
            match (&self.rate_limit.upstash_url, &self.rate_limit.upstash_token) {
                (Some(url), Some(_)) => {
                    url::Url::parse(url)?;
                }
                _ => anyhow::bail!(
                    "Upstash rate-limit backend requires upstash_url and upstash_token"
                ),
            }
        }

        if self.chat.history_window == 0 {
            anyhow::bail!("chat.history_window must be greater than 0");
        }
        if self.chat.max_message_chars == 0 || self.chat.max_body_bytes == 0 {
            anyhow::bail!("chat.max_message_chars and chat.max_body_bytes must be greater than 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.rate_limit.max_requests, 15);
        assert_eq!(config.rate_limit.window_secs, 3600);
        assert!(!config.rate_limit.fail_open);
        assert!(config.rate_limit.trust_proxy_headers);
        assert_eq!(config.chat.max_body_bytes, 1_000_000);
        assert_eq!(config.chat.history_window, 10);
        assert_eq!(config.llm.key_reset_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [llm]
            api_keys = ["a", "b"]

            [rate_limit]
            max_requests = 5

            [profile]
            name = "Sam"
            tech_stack = ["Rust"]
            "#,
        )
        .unwrap();

        assert_eq!(config.llm.api_keys, vec!["a", "b"]);
        assert_eq!(config.llm.model, "gemini-2.0-flash");
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.window_secs, 3600);
        assert_eq!(config.profile.name, "Sam");
        assert_eq!(config.server.listen_addr, "127.0.0.1:3000");
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = ServerConfig::default();
        config.llm.api_keys = vec!["1".into(), "2".into(), "3".into(), "4".into()];
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.rate_limit.backend = CounterBackend::Upstash;
        assert!(config.validate().is_err());
        config.rate_limit.upstash_url = Some("https://example.upstash.io".into());
        config.rate_limit.upstash_token = Some("token".into());
        assert!(config.validate().is_ok());

        let mut config = ServerConfig::default();
        config.server.listen_addr = "not an address".into();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.chat.history_window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_upstream_intervals() {
        let mut config = ServerConfig::default();
        config.llm.timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));

        let mut config = ServerConfig::default();
        config.llm.key_reset_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("FOLIO_HTTP_ADDR", "0.0.0.0:8080");
        std::env::set_var("GEMINI_API_KEY", "first");
        std::env::set_var("GEMINI_API_KEY_3", "third");

        let config = ServerConfig::from_env();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.llm.api_keys, vec!["first", "third"]);

        std::env::remove_var("FOLIO_HTTP_ADDR");
        std::env::remove_var("GEMINI_API_KEY");
        std::env::remove_var("GEMINI_API_KEY_3");
    }
}
