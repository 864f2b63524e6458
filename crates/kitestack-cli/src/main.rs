//! kitestack: runs a Buildkite pipeline's jobs as Kubernetes Jobs.

use anyhow::{Context, Result};
use clap::Parser;
use kitestack_buildkite::BuildkiteClient;
use kitestack_config::{Config, apply_tuning_file, parse_duration};
use kitestack_executor::{JobTemplate, KubernetesExecutor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod shutdown;

#[derive(Parser, Debug)]
#[command(name = "kitestack")]
#[command(about = "Run Buildkite pipeline jobs as Kubernetes Jobs", long_about = None)]
struct Cli {
    /// Pipeline slug to watch
    #[arg(long, env = "KITESTACK_PIPELINE")]
    pipeline: Option<String>,

    /// Buildkite organization slug
    #[arg(long, env = "BUILDKITE_ORG")]
    org: Option<String>,

    /// Buildkite API token
    #[arg(long, env = "BUILDKITE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Maximum number of concurrently admitted jobs
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// How long finished jobs are kept (e.g. 10m, 90s)
    #[arg(long, value_parser = parse_ttl)]
    job_ttl: Option<Duration>,

    /// Namespace to create jobs in
    #[arg(long, env = "KITESTACK_NAMESPACE")]
    namespace: Option<String>,

    /// KDL file with additional tuning
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn parse_ttl(value: &str) -> std::result::Result<Duration, String> {
    parse_duration(value).map_err(|e| e.to_string())
}

impl Cli {
    /// Defaults, then the tuning file, then flags and environment.
    fn into_config(self) -> Result<Config> {
        let mut config = Config::new("", "", "");

        if let Some(path) = &self.config {
            apply_tuning_file(&mut config, path)
                .with_context(|| format!("Failed to load tuning file: {}", path.display()))?;
        }

        if let Some(org) = self.org {
            config.org = org;
        }
        if let Some(pipeline) = self.pipeline {
            config.pipeline = pipeline;
        }
        if let Some(token) = self.token {
            config.token = token;
        }
        if let Some(max_in_flight) = self.max_in_flight {
            config.max_in_flight = max_in_flight;
        }
        if let Some(job_ttl) = self.job_ttl {
            config.job_ttl = job_ttl;
        }
        if let Some(namespace) = self.namespace {
            config.namespace = namespace;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = cli.into_config()?;
    info!(
        pipeline = %config.pipeline_slug(),
        namespace = %config.namespace,
        max_in_flight = config.max_in_flight,
        job_ttl = ?config.job_ttl,
        "Starting kitestack"
    );

    let cancel = shutdown::install_shutdown_handler()?;

    let backend = Arc::new(BuildkiteClient::new(
        config.token.clone(),
        config.graphql_endpoint.clone(),
    ));
    let template = JobTemplate {
        namespace: config.namespace.clone(),
        pipeline: config.pipeline.clone(),
        default_image: config.default_image.clone(),
        agent_token_secret: config.agent_token_secret.clone(),
    };
    let executor = Arc::new(
        KubernetesExecutor::new(template)
            .await
            .context("Failed to connect to Kubernetes")?,
    );

    kitestack_scheduler::run(config, backend, executor, cancel).await;
    Ok(())
}
