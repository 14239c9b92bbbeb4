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

use super::{ChatResponse, CompletionRequest, LLMProvider};
use crate::config::LLMConfig;
use folio_core::Role;
use serde_json::{json, Value};
use std::time::Instant;

// Gemini Provider
pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
}

impl GeminiProvider {
    pub fn new(config: &LLMConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model)
    }

    /// Gemini requires the conversation to open with a user turn, so any
    /// leading assistant turns are dropped.
    fn build_body(&self, request: &CompletionRequest) -> Value {
        let mut contents: Vec<Value> = request
            .history
            .iter()
            .skip_while(|m| m.role == Role::Assistant)
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                };
                json!({"role": role, "parts": [{"text": m.content}]})
            })
            .collect();
        contents.push(json!({"role": "user", "parts": [{"text": request.message}]}));

        json!({
            "systemInstruction": {"parts": [{"text": request.system_prompt}]},
            "contents": contents,
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_output_tokens,
            },
        })
    }
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

#[async_trait::async_trait]
impl LLMProvider for GeminiProvider {
    async fn chat(
        &self,
        api_key: &str,
        request: &CompletionRequest,
    ) -> anyhow::Result<ChatResponse> {
        let start = Instant::now();

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", api_key)
            .json(&self.build_body(request))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        let json: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if !status.is_success() {
            let message = json["error"]["message"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or(text);
            anyhow::bail!("Gemini API error ({}): {}", status.as_u16(), message);
        }

        let candidate = &json["candidates"][0];
        let content = candidate["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if content.trim().is_empty() {
            if let Some(reason) = json["promptFeedback"]["blockReason"].as_str() {
                anyhow::bail!("Gemini blocked the prompt: {}", reason);
            }
            anyhow::bail!("Gemini returned an empty response");
        }

        let input_tokens = json["usageMetadata"]["promptTokenCount"]
            .as_u64()
            .map(|t| t as u32);
        let output_tokens = json["usageMetadata"]["candidatesTokenCount"]
            .as_u64()
            .map(|t| t as u32);
        let finish_reason = candidate["finishReason"].as_str().map(|s| s.to_lowercase());

        Ok(ChatResponse {
            content,
            provider: "gemini".to_string(),
            model: self.model.clone(),
            input_tokens,
            output_tokens,
            finish_reason,
            duration_ms: start.elapsed().as_millis() as u32,
        })
    }

    fn name(&self) -> &str {
        "Gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::is_retriable;
    use folio_core::ChatMessage;
    use mockito::Matcher;

    fn provider(base_url: String) -> GeminiProvider {
        let config = LLMConfig {
            base_url,
            model: "gemini-2.0-flash".to_string(),
            ..LLMConfig::default()
        };
        GeminiProvider::new(&config).unwrap()
    }

    fn request(history: Vec<ChatMessage>) -> CompletionRequest {
        CompletionRequest {
            system_prompt: "You are a helpful assistant.".to_string(),
            history,
            message: "What do you build?".to_string(),
        }
    }

    #[tokio::test]
    async fn test_generate_content() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1beta/models/gemini-2.0-flash:generateContent")
            .match_header("x-goog-api-key", "secret-key")
            .match_body(Matcher::PartialJson(json!({
                "systemInstruction": {"parts": [{"text": "You are a helpful assistant."}]},
                "contents": [
                    {"role": "user", "parts": [{"text": "hi"}]},
                    {"role": "model", "parts": [{"text": "hello"}]},
                    {"role": "user", "parts": [{"text": "What do you build?"}]}
                ]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "candidates": [{
                        "content": {"role": "model", "parts": [{"text": "Web apps"}, {"text": " and tools."}]},
                        "finishReason": "STOP"
                    }],
                    "usageMetadata": {"promptTokenCount": 42, "candidatesTokenCount": 7}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let history = vec![
            ChatMessage::assistant("Welcome!"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ];
        let response = provider(server.url())
            .chat("secret-key", &request(history))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.content, "Web apps and tools.");
        assert_eq!(response.input_tokens, Some(42));
        assert_eq!(response.output_tokens, Some(7));
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_quota_error_is_retriable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1beta/models/gemini-2.0-flash:generateContent")
            .with_status(429)
            .with_body(r#"{"error":{"code":429,"message":"Resource has been exhausted (e.g. check quota).","status":"RESOURCE_EXHAUSTED"}}"#)
            .create_async()
            .await;

        let err = provider(server.url())
            .chat("k", &request(vec![]))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("429"));
        assert!(is_retriable(&err));
    }

    #[tokio::test]
    async fn test_bad_request_is_not_retriable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1beta/models/gemini-2.0-flash:generateContent")
            .with_status(400)
            .with_body(r#"{"error":{"code":400,"message":"Invalid argument"}}"#)
            .create_async()
            .await;

        let err = provider(server.url())
            .chat("k", &request(vec![]))
            .await
            .unwrap_err();

        assert!(!is_retriable(&err));
    }

    #[tokio::test]
    async fn test_blocked_prompt() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1beta/models/gemini-2.0-flash:generateContent")
            .with_status(200)
            .with_body(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#)
            .create_async()
            .await;

        let err = provider(server.url())
            .chat("k", &request(vec![]))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("SAFETY"));
    }
}
