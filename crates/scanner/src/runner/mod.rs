//! Task runner: submits a scan job with its secrets and waits for completion
//!
//! A run is a single blocking call. It creates the secrets unowned, creates
//! the job, hands secret ownership to the job so they are garbage collected
//! with it, then parks on a job subscription until the first terminal
//! condition or cancellation.

pub mod client;

use crate::error::{Error, Result};
use crate::labels::LABEL_SCAN_JOB_NAME;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

pub use client::{JobClient, JobSubscription, KubeJobClient, LogStream};

/// Races a future against cancellation.
pub(crate) async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        output = fut => Ok(output),
    }
}

/// Ownership state of a secret referenced by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretState {
    /// Not submitted yet.
    Pending,
    /// Exists in the cluster without an owner; nothing will collect it.
    Created,
    /// Owned by the job and deleted with it.
    Owned,
}

#[derive(Debug, Clone)]
struct TrackedSecret {
    secret: Secret,
    state: SecretState,
}

/// A job together with the secrets it mounts.
#[derive(Debug, Clone)]
pub struct RunnableJob {
    job: Job,
    created: Option<Job>,
    secrets: Vec<TrackedSecret>,
}

impl RunnableJob {
    /// Secrets are moved into the job's namespace and labelled with the job
    /// name so they can be found if ownership is never established.
    pub fn new(job: Job, secrets: Vec<Secret>) -> Self {
        let namespace = job.namespace();
        let job_name = job.name_any();
        let secrets = secrets
            .into_iter()
            .map(|mut secret| {
                secret.metadata.namespace.clone_from(&namespace);
                secret
                    .labels_mut()
                    .insert(LABEL_SCAN_JOB_NAME.to_string(), job_name.clone());
                TrackedSecret {
                    secret,
                    state: SecretState::Pending,
                }
            })
            .collect();
        Self {
            job,
            created: None,
            secrets,
        }
    }

    pub fn name(&self) -> String {
        self.job.name_any()
    }

    pub fn namespace(&self) -> String {
        self.job.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// The server's copy once the job was created by this runnable, otherwise
    /// the submitted object.
    pub fn job(&self) -> &Job {
        self.created.as_ref().unwrap_or(&self.job)
    }

    pub fn created_job(&self) -> Option<&Job> {
        self.created.as_ref()
    }

    /// True only if this runnable created the job. A job that already existed
    /// belongs to another scan.
    pub fn was_created(&self) -> bool {
        self.created.is_some()
    }

    pub fn secret_states(&self) -> impl Iterator<Item = (String, SecretState)> + '_ {
        self.secrets
            .iter()
            .map(|tracked| (tracked.secret.name_any(), tracked.state))
    }

    /// Secrets that exist in the cluster but never got the job as owner.
    pub fn orphaned_secrets(&self) -> Vec<String> {
        self.secret_states()
            .filter(|(_, state)| *state == SecretState::Created)
            .map(|(name, _)| name)
            .collect()
    }
}

/// Runs jobs to completion. Holds no state between runs, so one runner can be
/// shared by concurrent scans.
#[derive(Clone)]
pub struct TaskRunner {
    client: Arc<dyn JobClient>,
}

impl TaskRunner {
    pub fn new(client: Arc<dyn JobClient>) -> Self {
        Self { client }
    }

    /// Creates the secrets and the job, then blocks until the job reaches a
    /// terminal condition.
    ///
    /// Only the first status condition is inspected, and only while its status
    /// is `True`: `Complete` yields `Ok(())`, `Failed` yields
    /// [`Error::JobFailed`] carrying the condition's reason and message. The job subscription is closed on every return
    /// path, including cancellation.
    #[instrument(skip_all, fields(job = %runnable.name(), namespace = %runnable.namespace()))]
    pub async fn run(&self, runnable: &mut RunnableJob, cancel: &CancellationToken) -> Result<()> {
        let namespace = runnable.namespace();

        for tracked in &mut runnable.secrets {
            let name = tracked.secret.name_any();
            debug!(secret = %name, "Creating secret");
            let created = cancellable(cancel, self.client.create_secret(&namespace, &tracked.secret))
                .await?
                .map_err(|source| Error::CreatingSecret {
                    name: name.clone(),
                    source,
                })?;
            tracked.secret = created;
            tracked.state = SecretState::Created;
        }

        let job_name = runnable.name();
        debug!("Creating job");
        let created = cancellable(cancel, self.client.create_job(&runnable.job))
            .await?
            .map_err(|source| Error::CreatingJob {
                name: job_name.clone(),
                source,
            })?;
        let uid = created.metadata.uid.clone();
        runnable.created = Some(created);
        let uid = uid.ok_or(Error::MissingField { field: "job.metadata.uid" })?;

        let owner = OwnerReference {
            api_version: "batch/v1".to_string(),
            kind: "Job".to_string(),
            name: job_name.clone(),
            uid: uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(false),
        };
        for tracked in &mut runnable.secrets {
            let name = tracked.secret.name_any();
            debug!(secret = %name, "Setting owner reference secret -> job");
            let mut secret = tracked.secret.clone();
            secret
                .metadata
                .owner_references
                .get_or_insert_with(Vec::new)
                .push(owner.clone());
            let updated = cancellable(cancel, self.client.update_secret(&namespace, &secret))
                .await?
                .map_err(|source| Error::SettingOwnerReference {
                    name: name.clone(),
                    source,
                })?;
            tracked.secret = updated;
            tracked.state = SecretState::Owned;
        }

        let mut subscription = self.client.subscribe(runnable.job());
        let outcome = wait_for_completion(&mut subscription, &uid, cancel).await;
        subscription.close();

        match &outcome {
            Ok(()) => info!("Job completed"),
            Err(e) => info!(error = %e, "Job did not complete"),
        }
        outcome
    }
}

async fn wait_for_completion(
    subscription: &mut JobSubscription,
    uid: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let Some(job) = subscription.next(cancel).await? else {
            return Err(Error::WatchClosed {
                name: subscription.name().to_string(),
            });
        };
        if job.metadata.uid.as_deref() != Some(uid) {
            continue;
        }
        if let Some(outcome) = terminal_outcome(&job) {
            return outcome;
        }
    }
}

/// Outcome encoded by the job's first status condition, if terminal.
pub fn terminal_outcome(job: &Job) -> Option<Result<()>> {
    let condition = job.status.as_ref()?.conditions.as_ref()?.first()?;
    if condition.status != "True" {
        return None;
    }
    match condition.type_.as_str() {
        "Complete" => {
            debug!(job = %job.name_any(), "Stopping runnable job on task completion");
            Some(Ok(()))
        }
        "Failed" => {
            debug!(job = %job.name_any(), "Stopping runnable job on task failure");
            Some(Err(Error::JobFailed {
                reason: condition.reason.clone().unwrap_or_default(),
                message: condition.message.clone().unwrap_or_default(),
            }))
        }
        _ => None,
    }
}
