//! Buildkite GraphQL client.

use async_trait::async_trait;
use kitestack_core::{CiBackend, Error, JobDescriptor, Result};
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::graphql::{GraphQlRequest, GraphQlResponse, JobConnection, MAX_PAGES};

/// Buildkite API client.
pub struct BuildkiteClient {
    client: reqwest::Client,
    endpoint: Url,
    token: String,
}

impl BuildkiteClient {
    pub fn new(token: impl Into<String>, endpoint: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            token: token.into(),
        }
    }

    /// Create with a custom HTTP client.
    pub fn with_client(client: reqwest::Client, token: impl Into<String>, endpoint: Url) -> Self {
        Self {
            client,
            endpoint,
            token: token.into(),
        }
    }

    async fn query(&self, slug: &str, request: GraphQlRequest<'_>) -> Result<JobConnection> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", "kitestack")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let body: GraphQlResponse = response
            .json()
            .await
            .map_err(|e| Error::Network(format!("malformed response: {}", e)))?;

        body.into_jobs(slug)
    }
}

/// Map a non-success HTTP status onto the backend error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> Error {
    let message = format!("{}: {}", status, body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth(message),
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited(message),
        _ => Error::Network(message),
    }
}

#[async_trait]
impl CiBackend for BuildkiteClient {
    fn name(&self) -> &'static str {
        "buildkite"
    }

    async fn list_runnable(&self, org: &str, pipeline: &str) -> Result<Vec<JobDescriptor>> {
        let slug = format!("{}/{}", org, pipeline);
        let mut listing = self
            .query(&slug, GraphQlRequest::runnable_jobs(&slug, None))
            .await?;

        let mut pages = 1;
        while let Some(cursor) = listing.next_cursor().map(str::to_string) {
            if pages >= MAX_PAGES {
                break;
            }
            let page = self
                .query(&slug, GraphQlRequest::runnable_jobs(&slug, Some(&cursor)))
                .await?;
            listing.append(page);
            pages += 1;
        }
        listing.ensure_complete()?;

        let jobs = listing.into_descriptors();
        debug!(pipeline = %slug, count = jobs.len(), pages, "Listed runnable jobs");
        Ok(jobs)
    }

    async fn count_occupied_capacity(&self, org: &str, pipeline: &str) -> Result<usize> {
        let slug = format!("{}/{}", org, pipeline);
        let jobs = self
            .query(&slug, GraphQlRequest::occupied_count(&slug))
            .await?;
        Ok(jobs.count)
    }
}
