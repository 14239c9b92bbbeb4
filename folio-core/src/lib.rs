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

//! Folio Core
//!
//! Domain types and the pure stages of the chat request pipeline: input
//! validation, system-prompt assembly and the client-side session guard.

pub mod content;
pub mod context;
pub mod error;
pub mod message;
pub mod session;
pub mod validation;

pub use content::{Certificate, ContextData, Experience, Project};
pub use context::{truncate_chars, ContextAssembler, ContextConfig, Profile};
pub use error::{CoreError, Result};
pub use message::{ChatMessage, Page, Role};
pub use session::{
    BlockReason, ChatSession, Clock, FileStorage, MemoryStorage, SendCheck, SessionGuard,
    SessionLimits, SessionStorage, SystemClock, SESSION_STORAGE_KEY,
};
pub use validation::{
    is_suspicious, ChatInput, ValidationError, ValidationLimits, Validator,
    DEFAULT_MAX_MESSAGE_CHARS,
};
