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

//! Context configuration.

use serde::{Deserialize, Serialize};

/// Size budgets for the assembled prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Maximum characters kept from any free-text field.
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,

    /// Maximum technologies/skills listed per entity.
    #[serde(default = "default_tags_per_entity")]
    pub tags_per_entity: usize,

    /// Maximum entries listed per category.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Maximum tech-stack entries listed.
    #[serde(default = "default_max_stack")]
    pub max_stack: usize,

    /// Upper bound on answer length stated in the guidelines.
    #[serde(default = "default_answer_words")]
    pub answer_words: usize,
}

fn default_excerpt_chars() -> usize {
    150
}

fn default_tags_per_entity() -> usize {
    5
}

fn default_max_entries() -> usize {
    12
}

fn default_max_stack() -> usize {
    24
}

fn default_answer_words() -> usize {
    150
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            excerpt_chars: default_excerpt_chars(),
            tags_per_entity: default_tags_per_entity(),
            max_entries: default_max_entries(),
            max_stack: default_max_stack(),
            answer_words: default_answer_words(),
        }
    }
}

/// Static facts about the portfolio owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_headline")]
    pub headline: String,

    #[serde(default)]
    pub location: Option<String>,

    /// Short biographical statements, one per line in the prompt.
    #[serde(default)]
    pub facts: Vec<String>,

    #[serde(default = "default_contact_email")]
    pub contact_email: String,

    /// Technologies the owner works with, most important first.
    #[serde(default)]
    pub tech_stack: Vec<String>,
}

fn default_name() -> String {
    "the site owner".to_string()
}

fn default_headline() -> String {
    "Software developer".to_string()
}

fn default_contact_email() -> String {
    "hello@example.com".to_string()
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: default_name(),
            headline: default_headline(),
            location: None,
            facts: Vec::new(),
            contact_email: default_contact_email(),
            tech_stack: Vec::new(),
        }
    }
}
