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
use folio_core::{Certificate, Experience, Project};
use serde::de::DeserializeOwned;
use serde::Deserialize;

const PROJECTS_QUERY: &str = r#"*[_type == "project"] | order(featured desc, _createdAt desc) {
  title, description, technologies, category, githubUrl, liveUrl, featured
}"#;

const CERTIFICATES_QUERY: &str = r#"*[_type == "certificate"] | order(issueDate desc) {
  title, issuer, issueDate, skills, credentialUrl
}"#;

const EXPERIENCES_QUERY: &str = r#"*[_type == "experience"] | order(current desc, startDate desc) {
  position, company, location, startDate, endDate, current, description, technologies
}"#;

#[derive(Deserialize)]
struct QueryResponse<T> {
    #[serde(default = "Vec::new")]
    result: Vec<T>,
}

/// Reads portfolio documents through the Sanity HTTP query API (GROQ).
pub struct SanityContentSource {
    client: reqwest::Client,
    query_url: String,
    token: Option<String>,
}

impl SanityContentSource {
    pub fn new(
        project_id: &str,
        dataset: &str,
        api_version: &str,
        token: Option<String>,
    ) -> anyhow::Result<Self> {
        let base_url = format!("https://{}.api.sanity.io", project_id);
        Self::with_base_url(&base_url, dataset, api_version, token)
    }

    pub fn with_base_url(
        base_url: &str,
        dataset: &str,
        api_version: &str,
        token: Option<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        let version = api_version.trim_start_matches('v');

        Ok(Self {
            client,
            query_url: format!(
                "{}/v{}/data/query/{}",
                base_url.trim_end_matches('/'),
                version,
                dataset
            ),
            token,
        })
    }

    async fn query<T: DeserializeOwned>(&self, groq: &str) -> anyhow::Result<Vec<T>> {
        let mut request = self.client.get(&self.query_url).query(&[("query", groq)]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Sanity query failed with status {}", status.as_u16());
        }

        let body: QueryResponse<T> = response.json().await?;
        Ok(body.result)
    }
}

impl std::fmt::Debug for SanityContentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SanityContentSource")
            .field("query_url", &self.query_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait::async_trait]
impl ContentSource for SanityContentSource {
    async fn projects(&self) -> anyhow::Result<Vec<Project>> {
        self.query(PROJECTS_QUERY).await
    }

    async fn certificates(&self) -> anyhow::Result<Vec<Certificate>> {
        self.query(CERTIFICATES_QUERY).await
    }

    async fn experiences(&self) -> anyhow::Result<Vec<Experience>> {
        self.query(EXPERIENCES_QUERY).await
    }

    fn name(&self) -> &str {
        "sanity"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_fetch_projects() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v2024-01-01/data/query/production")
            .match_query(Matcher::UrlEncoded(
                "query".to_string(),
                PROJECTS_QUERY.to_string(),
            ))
            .match_header("authorization", "Bearer read-token")
            .with_status(200)
            .with_body(
                r#"{"ms":3,"query":"...","result":[
                    {"title":"Folio","description":"Portfolio site","technologies":["Rust"],"githubUrl":null,"featured":true},
                    {"title":"Untitled","description":null,"technologies":null}
                ]}"#,
            )
            .create_async()
            .await;

        let source = SanityContentSource::with_base_url(
            &server.url(),
            "production",
            "2024-01-01",
            Some("read-token".to_string()),
        )
        .unwrap();

        let projects = source.projects().await.unwrap();
        mock.assert_async().await;
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].technologies, vec!["Rust"]);
        assert!(projects[0].featured);
        assert!(projects[1].description.is_empty());
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2024-01-01/data/query/production")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let source =
            SanityContentSource::with_base_url(&server.url(), "production", "v2024-01-01", None)
                .unwrap();

        let err = source.certificates().await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}
