//! GraphQL documents and response types.

use chrono::{DateTime, Utc};
use kitestack_core::{Error, JobDescriptor, JobPayload, Result};
use serde::{Deserialize, Serialize};

/// Job states that still need, or hold, an agent.
pub const RUNNABLE_STATES: &[&str] = &["SCHEDULED", "ASSIGNED", "ACCEPTED", "RUNNING"];

/// Job states that hold an agent.
pub const OCCUPIED_STATES: &[&str] = &["ASSIGNED", "ACCEPTED", "RUNNING"];

/// Page size for the jobs connection.
pub const PAGE_SIZE: u32 = 100;

/// Upper bound on pages fetched for one listing.
pub const MAX_PAGES: usize = 50;

pub const RUNNABLE_JOBS_QUERY: &str = r#"
query RunnableJobs($slug: ID!, $states: [JobStates!], $first: Int!, $after: String) {
  pipeline(slug: $slug) {
    jobs(first: $first, after: $after, type: [COMMAND], state: $states) {
      count
      pageInfo {
        hasNextPage
        endCursor
      }
      edges {
        node {
          ... on JobTypeCommand {
            uuid
            state
            command
            env
            agentQueryRules
            scheduledAt
          }
        }
      }
    }
  }
}
"#;

pub const OCCUPIED_COUNT_QUERY: &str = r#"
query OccupiedJobs($slug: ID!, $states: [JobStates!]) {
  pipeline(slug: $slug) {
    jobs(first: 1, type: [COMMAND], state: $states) {
      count
    }
  }
}
"#;

/// A GraphQL request body.
#[derive(Debug, Serialize)]
pub struct GraphQlRequest<'a> {
    pub query: &'a str,
    pub variables: serde_json::Value,
}

impl<'a> GraphQlRequest<'a> {
    /// One page of runnable jobs, starting after `after` when given.
    pub fn runnable_jobs(slug: &str, after: Option<&str>) -> Self {
        Self {
            query: RUNNABLE_JOBS_QUERY,
            variables: serde_json::json!({
                "slug": slug,
                "states": RUNNABLE_STATES,
                "first": PAGE_SIZE,
                "after": after,
            }),
        }
    }

    pub fn occupied_count(slug: &str) -> Self {
        Self {
            query: OCCUPIED_COUNT_QUERY,
            variables: serde_json::json!({
                "slug": slug,
                "states": OCCUPIED_STATES,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GraphQlResponse {
    pub data: Option<ResponseData>,
    #[serde(default)]
    pub errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlError {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ResponseData {
    pub pipeline: Option<PipelineNode>,
}

#[derive(Debug, Deserialize)]
pub struct PipelineNode {
    pub jobs: JobConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConnection {
    pub count: usize,
    pub page_info: Option<PageInfo>,
    #[serde(default)]
    pub edges: Vec<JobEdge>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JobEdge {
    pub node: JobNode,
}

/// A job node. Non-command jobs come back as empty objects.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobNode {
    pub uuid: Option<String>,
    pub state: Option<String>,
    pub command: Option<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub agent_query_rules: Vec<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl GraphQlResponse {
    /// Unwrap the pipeline's job connection, turning GraphQL-level errors
    /// into backend errors.
    pub fn into_jobs(self, slug: &str) -> Result<JobConnection> {
        if let Some(first) = self.errors.first() {
            let message = self
                .errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            let lowered = first.message.to_lowercase();
            if lowered.contains("unauthorized") || lowered.contains("authentication") {
                return Err(Error::Auth(message));
            }
            return Err(Error::Network(format!("graphql error: {}", message)));
        }

        self.data
            .and_then(|data| data.pipeline)
            .map(|pipeline| pipeline.jobs)
            .ok_or_else(|| Error::InvalidInput(format!("pipeline '{}' not found", slug)))
    }
}

impl JobConnection {
    /// Cursor of the next page, if the server has one.
    pub fn next_cursor(&self) -> Option<&str> {
        self.page_info
            .as_ref()
            .filter(|info| info.has_next_page)
            .and_then(|info| info.end_cursor.as_deref())
    }

    /// Append the edges of the following page.
    pub fn append(&mut self, page: JobConnection) {
        self.count = page.count;
        self.page_info = page.page_info;
        self.edges.extend(page.edges);
    }

    /// Fail unless every job the server counted was received.
    ///
    /// A partial listing must never be diffed: the missing jobs would look
    /// cancelled upstream.
    pub fn ensure_complete(&self) -> Result<()> {
        if self.edges.len() < self.count {
            return Err(Error::Network(format!(
                "incomplete job listing: received {} of {} jobs",
                self.edges.len(),
                self.count
            )));
        }
        Ok(())
    }

    /// Command jobs as descriptors, oldest first.
    pub fn into_descriptors(self) -> Vec<JobDescriptor> {
        let mut jobs: Vec<JobDescriptor> = self
            .edges
            .into_iter()
            .filter_map(|edge| {
                let node = edge.node;
                let uuid = node.uuid?;
                let mut job = JobDescriptor::new(
                    uuid,
                    JobPayload {
                        command: node.command.unwrap_or_default(),
                        env: node.env,
                        agent_query_rules: node.agent_query_rules,
                    },
                );
                job.scheduled_at = node.scheduled_at;
                Some(job)
            })
            .collect();

        // Stable, so untimestamped jobs keep Buildkite's order at the end.
        jobs.sort_by_key(|job| (job.scheduled_at.is_none(), job.scheduled_at));
        jobs
    }
}
