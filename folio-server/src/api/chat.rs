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

//! POST /api/chat
//!
//! Size check, IP rate limit, parse, validation, credential check, context
//! assembly and keyed upstream dispatch, in that order. Each stage
//! short-circuits with its own error response.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap},
    Json,
};
use folio_core::{ChatInput, Page, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

use super::{ApiError, AppState};
use crate::auth::client_ip;
use crate::content::load_context_data;
use crate::llm::CompletionRequest;
use crate::sanitization::{sanitize_history, sanitize_message};

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
    pub page: Page,
}

pub async fn chat(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ChatReply>, ApiError> {
    let ip = client_ip(
        &headers,
        connect_info.map(|ConnectInfo(addr)| addr),
        state.rate_limiter.config().trust_proxy_headers,
    );

    match tokio::time::timeout(state.request_timeout, handle(&state, &ip, &headers, body)).await {
        Ok(result) => result,
        Err(_) => {
            error!(ip = %ip, timeout = ?state.request_timeout, "Chat request timed out");
            Err(ApiError::Unavailable)
        }
    }
}

async fn handle(
    state: &AppState,
    ip: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Json<ChatReply>, ApiError> {
    let bytes = read_body(headers, body, state.chat.max_body_bytes).await?;

    check_rate_limit(state, ip).await?;

    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|_| ApiError::BadRequest("Invalid JSON body".to_string()))?;

    let input = state.validator.validate_body(&value).map_err(|err| {
        if err == ValidationError::SuspiciousContent {
            warn!(ip = %ip, "Suspicious chat input rejected");
        } else {
            debug!(ip = %ip, reason = %err, "Chat input rejected");
        }
        ApiError::from(err)
    })?;

    if !state.dispatcher.has_keys() {
        error!("No upstream API keys configured");
        return Err(ApiError::Unavailable);
    }

    let ChatInput {
        message,
        page,
        history,
    } = input;

    let message = sanitize_message(&message);
    if message.trim().is_empty() {
        return Err(ValidationError::EmptyOrMissing.into());
    }

    let skip = history.len().saturating_sub(state.chat.history_window);
    let history = sanitize_history(history.into_iter().skip(skip).collect());

    let data = load_context_data(state.content.as_ref(), page).await;
    let request = CompletionRequest {
        system_prompt: state.assembler.build(page, &data),
        history,
        message,
    };

    let provider = state.provider.as_ref();
    let request = &request;
    let reply = state
        .dispatcher
        .with_fallback(move |key| async move { provider.chat(&key, request).await })
        .await
        .map_err(|err| {
            error!(ip = %ip, page = %page, error = %err.detail(), "Upstream dispatch failed");
            ApiError::from(err)
        })?;

    info!(
        page = %page,
        provider = %reply.provider,
        model = %reply.model,
        input_tokens = ?reply.input_tokens,
        output_tokens = ?reply.output_tokens,
        duration_ms = reply.duration_ms,
        "Chat response generated"
    );

    Ok(Json(ChatReply {
        response: reply.content,
        page,
    }))
}

async fn read_body(
    headers: &HeaderMap,
    body: Body,
    max_bytes: usize,
) -> Result<axum::body::Bytes, ApiError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > max_bytes as u64) {
        return Err(ApiError::PayloadTooLarge);
    }

    axum::body::to_bytes(body, max_bytes).await.map_err(|e| {
        debug!(error = %e, "Failed to read chat request body");
        ApiError::PayloadTooLarge
    })
}

async fn check_rate_limit(state: &AppState, ip: &str) -> Result<(), ApiError> {
    match state.rate_limiter.check_and_increment(ip).await {
        Ok(decision) if decision.allowed => Ok(()),
        Ok(decision) => {
            info!(ip = %ip, reset_in = decision.reset_in_seconds, "Rate limit exceeded");
            Err(ApiError::RateLimited {
                reset_in: decision.reset_in_seconds,
            })
        }
        Err(e) if state.rate_limiter.config().fail_open => {
            warn!(ip = %ip, error = %e, "Rate limit store unavailable; allowing request");
            Ok(())
        }
        Err(e) => {
            error!(ip = %ip, error = %e, "Rate limit store unavailable; rejecting request");
            Err(ApiError::Unavailable)
        }
    }
}
