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

use super::ContentSource;
use anyhow::Context;
use folio_core::{Certificate, Experience, Project};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// On-disk shape of a static content file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentBundle {
    pub projects: Vec<Project>,
    pub certificates: Vec<Certificate>,
    pub experiences: Vec<Experience>,
}

/// Serves content loaded once at start-up.
#[derive(Debug, Clone, Default)]
pub struct StaticContentSource {
    bundle: ContentBundle,
}

impl StaticContentSource {
    pub fn new(bundle: ContentBundle) -> Self {
        Self { bundle }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read content file {}", path.display()))?;
        let bundle: ContentBundle = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse content file {}", path.display()))?;
        Ok(Self::new(bundle))
    }
}

#[async_trait::async_trait]
impl ContentSource for StaticContentSource {
    async fn projects(&self) -> anyhow::Result<Vec<Project>> {
        Ok(self.bundle.projects.clone())
    }

    async fn certificates(&self) -> anyhow::Result<Vec<Certificate>> {
        Ok(self.bundle.certificates.clone())
    }

    async fn experiences(&self) -> anyhow::Result<Vec<Experience>> {
        Ok(self.bundle.experiences.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// No content at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyContentSource;

#[async_trait::async_trait]
impl ContentSource for EmptyContentSource {
    async fn projects(&self) -> anyhow::Result<Vec<Project>> {
        Ok(Vec::new())
    }

    async fn certificates(&self) -> anyhow::Result<Vec<Certificate>> {
        Ok(Vec::new())
    }

    async fn experiences(&self) -> anyhow::Result<Vec<Experience>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "empty"
    }
}
