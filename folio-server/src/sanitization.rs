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

//! Text clean-up applied to visitor input before it is forwarded upstream.
//!
//! Runs after validation, so it never changes whether a request is accepted.

use folio_core::ChatMessage;

/// Strip NUL and control characters, keeping newlines and tabs.
///
/// `\r\n` pairs collapse to `\n`; a lone `\r` is dropped.
pub fn sanitize_message(input: &str) -> String {
    input
        .chars()
        .filter(|&c| c == '\n' || c == '\t' || !c.is_control())
        .collect()
}

/// Sanitize every turn of a conversation in place, dropping turns left empty.
pub fn sanitize_history(history: Vec<ChatMessage>) -> Vec<ChatMessage> {
    history
        .into_iter()
        .filter_map(|mut message| {
            message.content = sanitize_message(&message.content);
            (!message.content.trim().is_empty()).then_some(message)
        })
        .collect()
}
