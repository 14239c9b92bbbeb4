// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Input validation for chat requests
//!
//! Request bodies arrive as untrusted JSON. Validation runs a fixed sequence of
//! checks and stops at the first failure:
//!
//! 1. message present and non-empty after trimming
//! 2. message length within the configured maximum
//! 3. message free of known prompt-injection phrasing
//! 4. page is one of the known site sections
//! 5. history is an array of well-formed messages
//!
//! The injection check is a best-effort heuristic. It catches the common
//! phrasings and nothing more; the system prompt separately instructs the model
//! to ignore attempts to override its instructions.

use crate::message::{ChatMessage, Page, Role};
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use regex::RegexSet;
use serde_json::{json, Value};
use thiserror::Error;

/// Default maximum message length in characters (after trimming).
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 500;

/// Case-insensitive prompt-injection signatures.
const INJECTION_PATTERNS: &[&str] = &[
    r"(?i)ignore\s+(all\s+)?(the\s+)?(previous|prior|above|earlier)\s+(instructions|prompts|rules|messages)",
    r"(?i)disregard\s+(all\s+)?(the\s+)?(previous|prior|above|your)\s+(instructions|prompts|rules)",
    r"(?i)forget\s+(all\s+)?(your|the|previous|prior)\s+(instructions|rules|prompts)",
    r"(?i)you\s+are\s+now\b",
    r"(?i)pretend\s+(to\s+be|you\s+are)",
    r"(?i)system\s*prompt",
    r"(?i)jail\s*break",
    r"(?i)\b(developer|admin|god|dan)\s+mode\b",
    r"(?i)new\s+instructions\s*:",
    r"(?i)override\s+(your|the)\s+(instructions|rules|guidelines)",
];

static INJECTION_SET: Lazy<RegexSet> =
    Lazy::new(|| RegexSet::new(INJECTION_PATTERNS).expect("injection patterns are valid regexes"));

static HISTORY_ITEM_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    let schema = json!({
        "type": "object",
        "required": ["role", "content", "timestamp"],
        "properties": {
            "id": { "type": "string" },
            "role": { "type": "string", "enum": ["user", "assistant"] },
            "content": { "type": "string", "minLength": 1 },
            "timestamp": { "type": "number" }
        }
    });
    JSONSchema::compile(&schema).expect("history item schema is valid")
});

/// Why a chat request was rejected. `Display` is the reason shown to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Message is required")]
    EmptyOrMissing,

    #[error("Message too long (maximum {max} characters)")]
    TooLong { max: usize },

    #[error("Message contains disallowed content")]
    SuspiciousContent,

    #[error("Invalid page")]
    InvalidPage,

    #[error("Invalid history format")]
    InvalidHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    pub max_message_chars: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
        }
    }
}

/// A request that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatInput {
    /// Trimmed message text.
    pub message: String,
    pub page: Page,
    pub history: Vec<ChatMessage>,
}

/// Returns true when the text matches any known prompt-injection signature.
pub fn is_suspicious(text: &str) -> bool {
    INJECTION_SET.is_match(text)
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    limits: ValidationLimits,
}

impl Validator {
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    /// Validate a whole request body `{message, page, history?}`.
    pub fn validate_body(&self, body: &Value) -> Result<ChatInput, ValidationError> {
        let Some(object) = body.as_object() else {
            return Err(ValidationError::EmptyOrMissing);
        };
        self.validate(
            object.get("message"),
            object.get("page"),
            object.get("history"),
        )
    }

    /// Validate the individual request fields.
    ///
    /// A missing `history` is treated as an empty conversation; an explicit
    /// `null` or any other non-array value is rejected.
    pub fn validate(
        &self,
        message: Option<&Value>,
        page: Option<&Value>,
        history: Option<&Value>,
    ) -> Result<ChatInput, ValidationError> {
        let message = self.check_message(message)?;
        let page = check_page(page)?;
        let history = match history {
            None => Vec::new(),
            Some(value) => check_history(value)?,
        };

        Ok(ChatInput {
            message,
            page,
            history,
        })
    }

    fn check_message(&self, message: Option<&Value>) -> Result<String, ValidationError> {
        let trimmed = message
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or(ValidationError::EmptyOrMissing)?;

        if trimmed.chars().count() > self.limits.max_message_chars {
            return Err(ValidationError::TooLong {
                max: self.limits.max_message_chars,
            });
        }

        if is_suspicious(trimmed) {
            tracing::warn!(
                chars = trimmed.chars().count(),
                "Rejected chat message matching a prompt-injection signature"
            );
            return Err(ValidationError::SuspiciousContent);
        }

        Ok(trimmed.to_string())
    }
}

fn check_page(page: Option<&Value>) -> Result<Page, ValidationError> {
    page.and_then(Value::as_str)
        .and_then(|p| p.parse().ok())
        .ok_or(ValidationError::InvalidPage)
}

fn check_history(history: &Value) -> Result<Vec<ChatMessage>, ValidationError> {
    let items = history.as_array().ok_or(ValidationError::InvalidHistory)?;

    items
        .iter()
        .map(|item| {
            if !HISTORY_ITEM_SCHEMA.is_valid(item) {
                return Err(ValidationError::InvalidHistory);
            }
            to_message(item).ok_or(ValidationError::InvalidHistory)
        })
        .collect()
}

fn to_message(item: &Value) -> Option<ChatMessage> {
    let role = match item.get("role")?.as_str()? {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        _ => return None,
    };
    let timestamp = item.get("timestamp")?;
    let timestamp = timestamp
        .as_i64()
        .or_else(|| timestamp.as_f64().map(|t| t as i64))?;

    Some(ChatMessage {
        id: item
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        role,
        content: item.get("content")?.as_str()?.to_string(),
        timestamp,
    })
}
