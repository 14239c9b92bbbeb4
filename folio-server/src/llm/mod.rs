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

//! Upstream language-model access.

mod dispatcher;
mod providers;

pub use dispatcher::{is_quota_message, is_retriable, DispatchError, KeyDispatcher, UpstreamTimeout};
pub use providers::*;

use folio_core::ChatMessage;
use serde::{Deserialize, Serialize};

/// One generation request: the assembled system prompt, prior turns and the
/// visitor's new message.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub history: Vec<ChatMessage>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub finish_reason: Option<String>,
    pub duration_ms: u32,
}

#[async_trait::async_trait]
pub trait LLMProvider: Send + Sync {
    /// Perform one call against the provider using `api_key`.
    async fn chat(&self, api_key: &str, request: &CompletionRequest)
        -> anyhow::Result<ChatResponse>;

    fn name(&self) -> &str;

    fn model(&self) -> &str;
}
