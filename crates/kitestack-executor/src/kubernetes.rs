//! Kubernetes executor implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use kitestack_core::executor::*;
use kitestack_core::{Error, JobDescriptor, JobId, Result};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_PIPELINE: &str = "kitestack.io/pipeline";
pub const LABEL_JOB: &str = "kitestack.io/job";
pub const ANNOTATION_JOB_ID: &str = "kitestack.io/job-id";
pub const MANAGER: &str = "kitestack";

const AGENT_CONTAINER: &str = "agent";
const AGENT_TOKEN_KEY: &str = "BUILDKITE_AGENT_TOKEN";

/// Everything needed to turn a CI job into a `batch/v1` Job manifest.
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub namespace: String,
    pub pipeline: String,
    /// Image used when the job carries no `image=` tag.
    pub default_image: String,
    /// Secret holding the agent registration token.
    pub agent_token_secret: String,
}

impl JobTemplate {
    /// Labels shared by every job of this pipeline.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER.to_string());
        labels.insert(LABEL_PIPELINE.to_string(), label_value(&self.pipeline));
        labels
    }

    pub fn label_selector(&self) -> String {
        self.selector_labels()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Build the Job manifest for `job`, named `name`.
    pub fn build_job(&self, name: &str, job: &JobDescriptor) -> Result<Job> {
        let mut labels = self.selector_labels();
        labels.insert(LABEL_JOB.to_string(), label_value(name));

        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_JOB_ID.to_string(), job.id.to_string());

        let image = job.payload.tag("image").unwrap_or(&self.default_image);

        let command = ["buildkite-agent", "start", "--acquire-job", job.id.as_str()];
        let mut env = vec![
            serde_json::json!({ "name": "BUILDKITE_JOB_ID", "value": job.id.as_str() }),
            serde_json::json!({ "name": "BUILDKITE_COMMAND", "value": job.payload.command }),
            serde_json::json!({
                "name": "BUILDKITE_AGENT_TAGS",
                "value": job.payload.agent_query_rules.join(","),
            }),
            serde_json::json!({
                "name": AGENT_TOKEN_KEY,
                "valueFrom": {
                    "secretKeyRef": { "name": self.agent_token_secret, "key": AGENT_TOKEN_KEY }
                }
            }),
        ];
        env.extend(
            job.payload
                .env_pairs()
                .map(|(k, v)| serde_json::json!({ "name": k, "value": v })),
        );

        let manifest = serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": name,
                "namespace": self.namespace,
                "labels": labels,
                "annotations": annotations,
            },
            "spec": {
                "backoffLimit": 0,
                "template": {
                    "metadata": { "labels": labels, "annotations": annotations },
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": AGENT_CONTAINER,
                            "image": image,
                            "command": command,
                            "env": env,
                        }],
                    },
                },
            },
        });

        serde_json::from_value(manifest)
            .map_err(|e| Error::Internal(format!("failed to build job manifest: {}", e)))
    }
}

/// Kubernetes-based cluster executor.
pub struct KubernetesExecutor {
    jobs: Api<Job>,
    template: JobTemplate,
}

impl KubernetesExecutor {
    pub async fn new(template: JobTemplate) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?;
        Ok(Self::with_client(client, template))
    }

    pub fn with_client(client: Client, template: JobTemplate) -> Self {
        Self {
            jobs: Api::namespaced(client, &template.namespace),
            template,
        }
    }
}

#[async_trait]
impl ClusterExecutor for KubernetesExecutor {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn label_selector(&self) -> String {
        self.template.label_selector()
    }

    async fn create_job(&self, name: &str, job: &JobDescriptor) -> Result<ClusterJobHandle> {
        let manifest = self.template.build_job(name, job)?;

        let created = match self.jobs.create(&PostParams::default(), &manifest).await {
            Ok(created) => {
                info!(job_id = %job.id, name = %name, "Created cluster job");
                created
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                info!(job_id = %job.id, name = %name, "Cluster job already exists, adopting");
                let existing = self.jobs.get(name).await.map_err(map_kube_error)?;
                if let Some(owner) = job_id_of(&existing) {
                    if owner != job.id {
                        return Err(Error::InvariantViolation(format!(
                            "cluster job {} belongs to {}, not {}",
                            name, owner, job.id
                        )));
                    }
                }
                existing
            }
            Err(e) => return Err(map_kube_error(e)),
        };

        handle_from_job(&created)
            .ok_or_else(|| Error::Internal(format!("cluster job {} has no name", name)))
    }

    async fn delete_job(&self, handle: &ClusterJobHandle) -> Result<()> {
        match self
            .jobs
            .delete(&handle.name, &DeleteParams::background())
            .await
        {
            Ok(_) => {
                info!(job_id = %handle.job_id, name = %handle.name, "Deleted cluster job");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(name = %handle.name, "Cluster job already gone");
                Ok(())
            }
            Err(e) => Err(map_kube_error(e)),
        }
    }

    async fn list_jobs(&self, label_selector: &str) -> Result<Vec<ClusterJobHandle>> {
        let list = self
            .jobs
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(map_kube_error)?;

        Ok(list
            .items
            .iter()
            .filter_map(|job| {
                let handle = handle_from_job(job);
                if handle.is_none() {
                    warn!(name = ?job.metadata.name, "Skipping cluster job without identity");
                }
                handle
            })
            .collect())
    }

    async fn get_status(&self, handle: &ClusterJobHandle) -> Result<ClusterStatus> {
        let job = self.jobs.get(&handle.name).await.map_err(map_kube_error)?;
        Ok(status_of(&job))
    }
}

/// Map a kube client error onto the executor error taxonomy.
pub fn map_kube_error(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) => {
            let quota = ae.message.to_lowercase().contains("quota");
            match ae.code {
                404 => Error::NotFound(ae.message),
                409 => Error::AlreadyExists(ae.message),
                403 | 422 if quota => Error::QuotaExceeded(ae.message),
                _ => Error::Unavailable(format!("{} ({}): {}", ae.reason, ae.code, ae.message)),
            }
        }
        other => Error::Unavailable(other.to_string()),
    }
}

/// Derive the cluster status from a Job's status block.
pub fn status_of(job: &Job) -> ClusterStatus {
    let Some(status) = job.status.as_ref() else {
        return ClusterStatus::Pending;
    };

    let condition = |kind: &str| {
        status
            .conditions
            .iter()
            .flatten()
            .any(|c| c.type_ == kind && c.status == "True")
    };

    if status.succeeded.unwrap_or(0) > 0 || condition("Complete") {
        ClusterStatus::Succeeded
    } else if status.failed.unwrap_or(0) > 0 || condition("Failed") {
        ClusterStatus::Failed
    } else if status.active.unwrap_or(0) > 0 {
        ClusterStatus::Running
    } else {
        ClusterStatus::Pending
    }
}

/// When the Job finished, if it has.
pub fn completion_time(job: &Job) -> Option<DateTime<Utc>> {
    let status = job.status.as_ref()?;
    if let Some(time) = &status.completion_time {
        return Some(time.0);
    }
    status
        .conditions
        .iter()
        .flatten()
        .filter(|c| (c.type_ == "Complete" || c.type_ == "Failed") && c.status == "True")
        .find_map(|c| c.last_transition_time.as_ref().map(|t| t.0))
}

fn job_id_of(job: &Job) -> Option<JobId> {
    job.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_JOB_ID))
        .map(|id| JobId::new(id.as_str()))
}

/// Build a handle from a Job object. Jobs without a name or job id
/// annotation were not created by us.
pub fn handle_from_job(job: &Job) -> Option<ClusterJobHandle> {
    let name = job.metadata.name.clone()?;
    let job_id = job_id_of(job)?;
    let status = status_of(job);
    let completed_at = if status.is_terminal() {
        completion_time(job)
    } else {
        None
    };

    Some(ClusterJobHandle {
        name,
        job_id,
        created_at: job
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(Utc::now),
        completed_at,
        status,
    })
}

/// Clamp an arbitrary string into a valid label value.
fn label_value(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .take(63)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kitestack_core::JobPayload;

    fn template() -> JobTemplate {
        JobTemplate {
            namespace: "ci".to_string(),
            pipeline: "deploy".to_string(),
            default_image: "buildkite/agent:3".to_string(),
            agent_token_secret: "agent-token".to_string(),
        }
    }

    fn descriptor(id: &str, rules: &[&str]) -> JobDescriptor {
        JobDescriptor::new(
            id,
            JobPayload {
                command: "make test".to_string(),
                env: vec!["CI=true".to_string()],
                agent_query_rules: rules.iter().map(|r| r.to_string()).collect(),
            },
        )
    }

    fn job_with_status(status: JobStatus) -> Job {
        Job {
            status: Some(status),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_job_manifest() {
        let job = descriptor("abc-123", &["queue=k8s"]);
        let name = job.id.cluster_name();
        let manifest = template().build_job(&name, &job).unwrap();

        assert_eq!(manifest.metadata.name.as_deref(), Some("buildkite-abc-123"));
        assert_eq!(manifest.metadata.namespace.as_deref(), Some("ci"));
        let labels = manifest.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_MANAGED_BY).map(String::as_str), Some(MANAGER));
        assert_eq!(labels.get(LABEL_PIPELINE).map(String::as_str), Some("deploy"));
        assert_eq!(job_id_of(&manifest), Some(JobId::new("abc-123")));

        let spec = manifest.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("buildkite/agent:3"));
        assert_eq!(
            container.command.as_ref().unwrap().last().map(String::as_str),
            Some("abc-123")
        );

        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "CI" && e.value.as_deref() == Some("true")));
        assert!(env.iter().any(|e| e.name == AGENT_TOKEN_KEY && e.value_from.is_some()));
    }

    #[test]
    fn test_image_tag_overrides_default() {
        let job = descriptor("abc", &["image=rust:1.85"]);
        let manifest = template().build_job("buildkite-abc", &job).unwrap();
        let pod = manifest.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("rust:1.85"));
    }

    #[test]
    fn test_label_selector() {
        assert_eq!(
            template().label_selector(),
            "app.kubernetes.io/managed-by=kitestack,kitestack.io/pipeline=deploy"
        );
    }

    #[test]
    fn test_label_value_sanitizing() {
        assert_eq!(label_value("my pipeline!"), "my-pipeline");
        assert_eq!(label_value(&"x".repeat(100)).len(), 63);
        assert_eq!(label_value("-edge-"), "edge");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_of(&Job::default()), ClusterStatus::Pending);

        let running = job_with_status(JobStatus {
            active: Some(1),
            ..Default::default()
        });
        assert_eq!(status_of(&running), ClusterStatus::Running);

        let succeeded = job_with_status(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        assert_eq!(status_of(&succeeded), ClusterStatus::Succeeded);

        let failed = job_with_status(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Failed".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(status_of(&failed), ClusterStatus::Failed);
    }

    #[test]
    fn test_completion_time_from_condition() {
        let finished: DateTime<Utc> = "2024-05-01T10:00:00Z".parse().unwrap();
        let job = job_with_status(JobStatus {
            failed: Some(1),
            conditions: Some(vec![JobCondition {
                type_: "Failed".to_string(),
                status: "True".to_string(),
                last_transition_time: Some(Time(finished)),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(completion_time(&job), Some(finished));
    }

    #[test]
    fn test_handle_requires_identity() {
        assert!(handle_from_job(&Job::default()).is_none());

        let job = descriptor("abc", &[]);
        let mut manifest = template().build_job("buildkite-abc", &job).unwrap();
        manifest.status = Some(JobStatus {
            succeeded: Some(1),
            completion_time: Some(Time(Utc::now())),
            ..Default::default()
        });

        let handle = handle_from_job(&manifest).unwrap();
        assert_eq!(handle.job_id, JobId::new("abc"));
        assert_eq!(handle.status, ClusterStatus::Succeeded);
        assert!(handle.completed_at.is_some());
    }

    #[test]
    fn test_error_mapping() {
        let api_error = |code: u16, message: &str| {
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: message.to_string(),
                reason: "Test".to_string(),
                code,
            })
        };

        assert!(matches!(map_kube_error(api_error(404, "gone")), Error::NotFound(_)));
        assert!(matches!(map_kube_error(api_error(409, "exists")), Error::AlreadyExists(_)));
        assert!(matches!(
            map_kube_error(api_error(403, "exceeded quota: pods")),
            Error::QuotaExceeded(_)
        ));
        assert!(matches!(map_kube_error(api_error(403, "forbidden")), Error::Unavailable(_)));
        assert!(matches!(map_kube_error(api_error(503, "down")), Error::Unavailable(_)));
    }
}
