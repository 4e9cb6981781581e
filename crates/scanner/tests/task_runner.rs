//! TaskRunner edge cases: failed submission, a job without uid and an ending
//! watch.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::error::ErrorResponse;
use kube::ResourceExt;
use scanner::error::{Error, Result};
use scanner::runner::{JobClient, JobSubscription, LogStream, RunnableJob, SecretState, TaskRunner};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Rejects secrets when `reject_secrets` is set; jobs are accepted, without a
/// uid when `omit_uid` is set, and their watch ends immediately without any
/// event.
#[derive(Default)]
struct SilentCluster {
    reject_secrets: bool,
    omit_uid: bool,
    jobs_created: AtomicUsize,
    secrets_updated: AtomicUsize,
}

#[async_trait]
impl JobClient for SilentCluster {
    async fn create_secret(&self, _namespace: &str, secret: &Secret) -> Result<Secret, kube::Error> {
        if self.reject_secrets {
            return Err(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "secrets is forbidden".to_string(),
                reason: "Forbidden".to_string(),
                code: 403,
            }));
        }
        Ok(secret.clone())
    }

    async fn update_secret(&self, _namespace: &str, secret: &Secret) -> Result<Secret, kube::Error> {
        self.secrets_updated.fetch_add(1, Ordering::SeqCst);
        Ok(secret.clone())
    }

    async fn delete_secret(&self, _namespace: &str, _name: &str) -> Result<(), kube::Error> {
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> Result<Job, kube::Error> {
        self.jobs_created.fetch_add(1, Ordering::SeqCst);
        let mut created = job.clone();
        if !self.omit_uid {
            created.metadata.uid = Some("uid-1".to_string());
        }
        Ok(created)
    }

    async fn delete_job(&self, _namespace: &str, _name: &str) -> Result<(), kube::Error> {
        Ok(())
    }

    fn subscribe(&self, job: &Job) -> JobSubscription {
        JobSubscription::new(job.name_any(), stream::empty().boxed())
    }

    async fn container_logs(&self, _job: &Job, _container: &str) -> Result<LogStream> {
        Ok(Box::pin(futures::io::empty()))
    }
}

fn runnable() -> RunnableJob {
    let job = Job {
        metadata: ObjectMeta {
            name: Some("scan-policyreport-abc".to_string()),
            namespace: Some("starboard".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some("trivy-credentials-1".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    RunnableJob::new(job, vec![secret])
}

#[tokio::test]
async fn rejected_secret_stops_before_the_job_is_created() {
    let cluster = Arc::new(SilentCluster {
        reject_secrets: true,
        ..Default::default()
    });
    let runner = TaskRunner::new(cluster.clone());
    let mut runnable = runnable();

    let err = runner
        .run(&mut runnable, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::CreatingSecret { ref name, .. } if name == "trivy-credentials-1"));
    assert_eq!(cluster.jobs_created.load(Ordering::SeqCst), 0);
    assert!(!runnable.was_created());
    assert!(runnable.orphaned_secrets().is_empty());
}

#[tokio::test]
async fn watch_ending_without_terminal_condition_is_an_error() {
    let cluster = Arc::new(SilentCluster::default());
    let runner = TaskRunner::new(cluster);
    let mut runnable = runnable();

    let err = runner
        .run(&mut runnable, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::WatchClosed { ref name } if name == "scan-policyreport-abc"));
    assert!(runnable.was_created());
    assert_eq!(
        runnable.created_job().and_then(|j| j.metadata.uid.as_deref()),
        Some("uid-1")
    );
    assert_eq!(
        runnable.secret_states().collect::<Vec<_>>(),
        vec![("trivy-credentials-1".to_string(), SecretState::Owned)]
    );
}

#[tokio::test]
async fn job_without_uid_is_still_recorded_as_created() {
    let cluster = Arc::new(SilentCluster {
        omit_uid: true,
        ..Default::default()
    });
    let runner = TaskRunner::new(cluster.clone());
    let mut runnable = runnable();

    let err = runner
        .run(&mut runnable, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MissingField { field: "job.metadata.uid" }));
    assert_eq!(cluster.jobs_created.load(Ordering::SeqCst), 1);
    // The job exists, so whoever cleans up must delete it.
    assert!(runnable.was_created());
    assert_eq!(cluster.secrets_updated.load(Ordering::SeqCst), 0);
    assert_eq!(runnable.orphaned_secrets(), vec!["trivy-credentials-1".to_string()]);
}

#[tokio::test]
async fn cancelled_before_start_creates_nothing() {
    let cluster = Arc::new(SilentCluster::default());
    let runner = TaskRunner::new(cluster.clone());
    let mut runnable = runnable();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = runner.run(&mut runnable, &cancel).await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(cluster.jobs_created.load(Ordering::SeqCst), 0);
}
