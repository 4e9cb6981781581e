//! Cluster operations the task runner depends on

use crate::error::{Error, Result};
use crate::labels::LABEL_JOB_NAME;
use async_trait::async_trait;
use futures::future;
use futures::io::{AsyncRead, Cursor};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Output of one container, closed by dropping it.
pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;

/// Full resynchronization interval of a job subscription.
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(30 * 60);

/// Live stream of status updates for one job.
///
/// Dropping or closing the subscription stops the underlying watch.
pub struct JobSubscription {
    name: String,
    events: Option<BoxStream<'static, Job>>,
}

impl JobSubscription {
    pub fn new(name: impl Into<String>, events: BoxStream<'static, Job>) -> Self {
        Self {
            name: name.into(),
            events: Some(events),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next observed state of the job.
    ///
    /// Returns `Ok(None)` once the subscription is closed or the stream ends,
    /// and `Err(Error::Cancelled)` as soon as `cancel` fires.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<Job>> {
        let Some(events) = self.events.as_mut() else {
            return Ok(None);
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            event = events.next() => Ok(event),
        }
    }

    pub fn close(&mut self) {
        if self.events.take().is_some() {
            debug!(job = %self.name, "Closed job subscription");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_none()
    }
}

/// Secret, job, watch and log operations against the cluster.
#[async_trait]
pub trait JobClient: Send + Sync {
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, kube::Error>;

    async fn update_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, kube::Error>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    async fn create_job(&self, job: &Job) -> Result<Job, kube::Error>;

    /// Deletes the job with background propagation so its pods and owned
    /// secrets are garbage collected.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// Subscribes to status changes of the job's namespace, narrowed to the job.
    fn subscribe(&self, job: &Job) -> JobSubscription;

    /// Output of a container of the pod created by the job.
    async fn container_logs(&self, job: &Job, container: &str) -> Result<LogStream>;
}

#[derive(Clone)]
pub struct KubeJobClient {
    client: Client,
    resync: Duration,
}

impl KubeJobClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resync: DEFAULT_RESYNC,
        }
    }

    #[must_use]
    pub fn with_resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }
}

/// Calls `get` once per `period`, starting one period from now, and yields
/// every job it observes. Ticks missed while `get` is running are delayed,
/// not bunched.
pub(crate) fn resync_stream<F, Fut>(period: Duration, get: F) -> impl Stream<Item = Job> + Send + 'static
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Option<Job>> + Send + 'static,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    stream::unfold((get, ticker), |(mut get, mut ticker)| async move {
        ticker.tick().await;
        let observed = get().await;
        Some((observed, (get, ticker)))
    })
    .filter_map(future::ready)
}

#[async_trait]
impl JobClient for KubeJobClient {
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, kube::Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), secret).await
    }

    async fn update_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, kube::Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&secret.name_any(), &PostParams::default(), secret)
            .await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await.map(|_| ())
    }

    async fn create_job(&self, job: &Job) -> Result<Job, kube::Error> {
        let namespace = job.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), job).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::background()).await.map(|_| ())
    }

    fn subscribe(&self, job: &Job) -> JobSubscription {
        let name = job.name_any();
        let namespace = job.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);

        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let watch_name = name.clone();
        let watch = watcher(api.clone(), config)
            .default_backoff()
            .applied_objects()
            .filter_map(move |event| {
                future::ready(match event {
                    Ok(job) => Some(job),
                    Err(e) => {
                        warn!(job = %watch_name, error = %e, "Job watch error, retrying");
                        None
                    }
                })
            });

        let resync = {
            let name = name.clone();
            resync_stream(self.resync, move || {
                let api = api.clone();
                let name = name.clone();
                async move {
                    match api.get_opt(&name).await {
                        Ok(job) => job,
                        Err(e) => {
                            warn!(job = %name, error = %e, "Job resync failed");
                            None
                        }
                    }
                }
            })
        };

        debug!(job = %name, namespace = %namespace, "Subscribed to job status");
        JobSubscription::new(name, stream::select(watch, resync).boxed())
    }

    async fn container_logs(&self, job: &Job, container: &str) -> Result<LogStream> {
        let job_name = job.name_any();
        let namespace = job.namespace().unwrap_or_else(|| "default".to_string());
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        let pod_list = pods
            .list(&ListParams::default().labels(&format!("{LABEL_JOB_NAME}={job_name}")))
            .await?;
        let pod_name = pod_list
            .items
            .into_iter()
            .next()
            .map(|pod| pod.name_any())
            .ok_or_else(|| Error::GettingLogs {
                job: job_name.clone(),
                container: container.to_string(),
                reason: "no pod found for job".to_string(),
            })?;

        debug!(job = %job_name, pod = %pod_name, container = %container, "Reading container logs");
        let params = LogParams {
            container: Some(container.to_string()),
            ..LogParams::default()
        };
        // The pod has terminated, so its full output is fetched at once and
        // handed out as an owned reader.
        let logs = pods.logs(&pod_name, &params).await?;
        Ok(Box::pin(Cursor::new(logs.into_bytes())))
    }
}
