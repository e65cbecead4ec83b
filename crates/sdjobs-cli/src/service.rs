//! Wiring between resolved configuration and the job core.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use sdjobs_core::{
    BinaryLocation, ConvertParams, EventBus, GenerateParams, InvocationError, Job, JobKind,
    LogNormalizer, Registry, Subscriptions, Supervisor, resolve_binary,
};

use crate::config::SdConfig;

/// Everything needed to submit and follow jobs.
#[derive(Debug, Clone)]
pub struct JobService {
    pub registry: Arc<Registry>,
    pub supervisor: Supervisor,
    pub subscriptions: Subscriptions,
    binary: BinaryLocation,
    models_dir: PathBuf,
    output_dir: PathBuf,
}

impl JobService {
    pub fn new(config: &SdConfig) -> Result<Self> {
        let binary = resolve_binary(&config.root);
        info!(
            program = %binary.program.display(),
            working_dir = %binary.working_dir.display(),
            "using sd binary"
        );

        let roots = [&config.root, &config.models_dir].map(|p| p.display().to_string());
        let normalizer = LogNormalizer::new(roots).context("failed to build path normalizer")?;

        let registry = Arc::new(Registry::new(EventBus::new()));
        let supervisor = Supervisor::new(
            Arc::clone(&registry),
            Arc::new(normalizer),
            config.supervisor.clone(),
        );
        let subscriptions = Subscriptions::new(Arc::clone(&registry));

        Ok(Self {
            registry,
            supervisor,
            subscriptions,
            binary,
            models_dir: config.models_dir.clone(),
            output_dir: config.output_dir.clone(),
        })
    }

    /// Validate, create, and start a conversion job.
    pub fn submit_convert(&self, params: &ConvertParams) -> Result<Job, InvocationError> {
        let invocation = params.build(&self.binary, &self.models_dir)?;
        let job = self.registry.create(JobKind::Convert);
        self.supervisor.run(job.id, invocation);
        Ok(job)
    }

    /// Validate, create, and start an image generation job.
    pub fn submit_generate(&self, params: &GenerateParams) -> Result<Job, InvocationError> {
        let invocation = params.build(&self.binary, &self.models_dir, &self.output_dir, Utc::now())?;
        let job = self.registry.create(JobKind::Generate);
        self.supervisor.run(job.id, invocation);
        Ok(job)
    }
}

/// Periodically drop finished jobs older than `max_age` until `cancel`
/// fires.
pub fn spawn_reaper(
    registry: Arc<Registry>,
    max_age: Duration,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let removed = registry.reap_older_than(max_age);
                    if removed > 0 {
                        info!(removed, "reaped finished jobs");
                    }
                }
            }
        }
        debug!("reaper stopped");
    })
}
