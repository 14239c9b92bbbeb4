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

//! Portfolio content used to build the system prompt.
//!
//! Every fetch is fail-safe at the loader level: a failing source is logged
//! and contributes an empty list, so a content outage degrades answers
//! instead of failing chat requests.

mod sanity;
mod static_source;

pub use sanity::SanityContentSource;
pub use static_source::{ContentBundle, EmptyContentSource, StaticContentSource};

use crate::config::ContentConfig;
use folio_core::{Certificate, ContextData, Experience, Page, Project};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait::async_trait]
pub trait ContentSource: Send + Sync {
    async fn projects(&self) -> anyhow::Result<Vec<Project>>;

    async fn certificates(&self) -> anyhow::Result<Vec<Certificate>>;

    async fn experiences(&self) -> anyhow::Result<Vec<Experience>>;

    fn name(&self) -> &str;
}

/// Pick the configured content source: Sanity, then a static file, else nothing.
pub fn build_content_source(config: &ContentConfig) -> anyhow::Result<Arc<dyn ContentSource>> {
    if let Some(project_id) = &config.sanity_project_id {
        let source = SanityContentSource::new(
            project_id,
            &config.sanity_dataset,
            &config.sanity_api_version,
            config.sanity_token.clone(),
        )?;
        info!(
            project_id = %project_id,
            dataset = %config.sanity_dataset,
            "Using Sanity content source"
        );
        return Ok(Arc::new(source));
    }

    if let Some(path) = &config.static_path {
        let source = StaticContentSource::from_file(path)?;
        info!(path = %path.display(), "Using static content source");
        return Ok(Arc::new(source));
    }

    warn!("No content source configured; prompts will carry no portfolio data");
    Ok(Arc::new(EmptyContentSource))
}

async fn fail_safe<T, Fut>(source: &str, kind: &'static str, fetch: Fut) -> Vec<T>
where
    Fut: Future<Output = anyhow::Result<Vec<T>>>,
{
    match fetch.await {
        Ok(items) => items,
        Err(e) => {
            warn!(source, kind, error = %e, "Content fetch failed; continuing without it");
            Vec::new()
        }
    }
}

/// Fetch only what `page` renders, concurrently.
pub async fn load_context_data(source: &dyn ContentSource, page: Page) -> ContextData {
    let name = source.name();

    match page {
        Page::Home => {
            let (projects, certificates, experiences) = futures::join!(
                fail_safe(name, "projects", source.projects()),
                fail_safe(name, "certificates", source.certificates()),
                fail_safe(name, "experiences", source.experiences()),
            );
            ContextData {
                projects: Some(projects),
                certificates: Some(certificates),
                experience: None,
                all_experiences: Some(experiences),
            }
        }
        Page::Projects => ContextData {
            projects: Some(fail_safe(name, "projects", source.projects()).await),
            ..ContextData::default()
        },
        Page::Certificates => ContextData {
            certificates: Some(fail_safe(name, "certificates", source.certificates()).await),
            ..ContextData::default()
        },
        Page::Experience => ContextData {
            experience: Some(fail_safe(name, "experiences", source.experiences()).await),
            ..ContextData::default()
        },
    }
}
