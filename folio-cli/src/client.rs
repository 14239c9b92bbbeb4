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

//! HTTP client for the chat endpoint plus the local conversation window.

use folio_core::{ChatMessage, Page};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Turns sent along with each question.
pub const HISTORY_WINDOW: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Reply(String),
    /// The server refused the request for throttling reasons.
    Throttled {
        message: String,
        reset_in: Option<u64>,
    },
    Rejected {
        status: u16,
        message: String,
    },
}

#[derive(Serialize)]
struct ChatBody<'a> {
    message: &'a str,
    page: Page,
    history: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct ReplyBody {
    response: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    reset_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct Health {
    pub status: String,
    pub message: String,
}

pub struct ChatClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ChatClient {
    pub fn new(server: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/api/chat", server.trim_end_matches('/')),
        })
    }

    pub async fn send(
        &self,
        message: &str,
        page: Page,
        history: &[ChatMessage],
    ) -> anyhow::Result<SendOutcome> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&ChatBody {
                message,
                page,
                history,
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: ReplyBody = response.json().await?;
            return Ok(SendOutcome::Reply(body.response));
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let text = response.text().await?;
        let (message, reset_in) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.error, body.reset_in.or(retry_after)),
            Err(_) => (format!("Server returned {}", status), retry_after),
        };

        if status == StatusCode::TOO_MANY_REQUESTS {
            Ok(SendOutcome::Throttled { message, reset_in })
        } else {
            Ok(SendOutcome::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }

    pub async fn health(&self) -> anyhow::Result<Health> {
        let response = self.http.get(&self.endpoint).send().await?;
        Ok(response.error_for_status()?.json().await?)
    }
}

/// Most recent turns of the conversation, bounded to a fixed window.
#[derive(Debug, Clone)]
pub struct History {
    window: usize,
    turns: Vec<ChatMessage>,
}

impl History {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            turns: Vec::new(),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.turns.push(message);
        if self.turns.len() > self.window {
            let excess = self.turns.len() - self.window;
            self.turns.drain(..excess);
        }
    }

    pub fn turns(&self) -> &[ChatMessage] {
        &self.turns
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(HISTORY_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn client(url: &str) -> ChatClient {
        ChatClient::new(url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_send_reply() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/chat")
            .match_body(Matcher::PartialJson(json!({
                "message": "What do you build?",
                "page": "projects",
                "history": [{"role": "user", "content": "hi"}]
            })))
            .with_status(200)
            .with_body(r#"{"response":"Mostly Rust services.","page":"projects"}"#)
            .create_async()
            .await;

        let history = vec![ChatMessage::user("hi")];
        let outcome = client(&server.url())
            .send("What do you build?", Page::Projects, &history)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(outcome, SendOutcome::Reply("Mostly Rust services.".to_string()));
    }

    #[tokio::test]
    async fn test_send_throttled() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/chat")
            .with_status(429)
            .with_header("retry-after", "120")
            .with_body(r#"{"error":"Rate limit exceeded","resetIn":120}"#)
            .create_async()
            .await;

        let outcome = client(&server.url())
            .send("hi", Page::Home, &[])
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SendOutcome::Throttled {
                message: "Rate limit exceeded".to_string(),
                reset_in: Some(120),
            }
        );
    }

    #[tokio::test]
    async fn test_send_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/chat")
            .with_status(400)
            .with_body(r#"{"error":"Invalid page"}"#)
            .create_async()
            .await;

        let outcome = client(&format!("{}/", server.url()))
            .send("hi", Page::Home, &[])
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SendOutcome::Rejected {
                status: 400,
                message: "Invalid page".to_string(),
            }
        );
    }

    #[test]
    fn test_history_window() {
        let mut history = History::new(3);
        for i in 0..5 {
            history.push(ChatMessage::user(format!("turn {}", i)));
        }
        let contents: Vec<_> = history.turns().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 2", "turn 3", "turn 4"]);

        history.clear();
        assert!(history.turns().is_empty());
    }
}
