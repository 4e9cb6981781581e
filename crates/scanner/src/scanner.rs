//! Scan pipeline: from a workload reference to its policy reports

use crate::config::ScannerConfig;
use crate::error::{Error, Result, StageExt};
use crate::labels::{
    ANNOTATION_CONTAINER_IMAGES, APP_NAME, LABEL_K8S_APP_MANAGED_BY, LABEL_POD_SPEC_HASH,
    LABEL_POLICY_REPORT_SCANNER,
};
use crate::plugin::{read_output, Plugin, PluginContext, ScannerPlugin};
use crate::report::{PolicyReport, ReportBuilder};
use crate::runner::{cancellable, JobClient, KubeJobClient, LogStream, RunnableJob, TaskRunner};
use crate::workload::credentials::map_container_names_to_docker_auths;
use crate::workload::{
    compute_hash, container_images, scan_job_name, KubeSecretsReader, KubeWorkloadResolver,
    ObjectRef, SecretsReader, Workload, WorkloadResolver,
};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{ObjectReference, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Client, ResourceExt};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const STAGE_RESOLVING: &str = "resolving object";
const STAGE_POD_TEMPLATE: &str = "getting pod template";
const STAGE_PREPARING: &str = "preparing scan job";
const STAGE_RUNNING: &str = "running scan job";
const STAGE_LOGS: &str = "getting logs";
const STAGE_PARSING: &str = "parsing output";
const STAGE_BUILDING: &str = "building report";

async fn cancellable_try<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    cancellable(cancel, fut).await?
}

/// Runs one scan job per workload and turns its output into reports.
///
/// Holds no per-scan state: concurrent scans of different workloads share
/// one orchestrator. Two scans of the same workload collide on the job name
/// and the later one fails with [`Error::CreatingJob`].
#[derive(Clone)]
pub struct ScanOrchestrator {
    ctx: PluginContext,
    plugin: Arc<dyn Plugin>,
    resolver: Arc<dyn WorkloadResolver>,
    secrets: Arc<dyn SecretsReader>,
    jobs: Arc<dyn JobClient>,
    runner: TaskRunner,
}

impl ScanOrchestrator {
    pub fn new(
        ctx: PluginContext,
        plugin: Arc<dyn Plugin>,
        resolver: Arc<dyn WorkloadResolver>,
        secrets: Arc<dyn SecretsReader>,
        jobs: Arc<dyn JobClient>,
    ) -> Self {
        Self {
            ctx,
            plugin,
            resolver,
            secrets,
            runner: TaskRunner::new(jobs.clone()),
            jobs,
        }
    }

    /// Orchestrator backed by the cluster, using the configured plugin.
    pub fn for_cluster(client: Client, config: Arc<ScannerConfig>) -> Self {
        let kind = config.plugin;
        let jobs = KubeJobClient::new(client.clone()).with_resync(config.scan_job.resync());
        Self::new(
            PluginContext::new(kind, config),
            Arc::new(ScannerPlugin::from(kind)),
            Arc::new(KubeWorkloadResolver::new(client.clone())),
            Arc::new(KubeSecretsReader::new(client)),
            Arc::new(jobs),
        )
    }

    fn config(&self) -> &ScannerConfig {
        self.ctx.config()
    }

    /// Lets the plugin check its configuration.
    pub async fn init(&self) -> Result<()> {
        self.plugin.init(&self.ctx).await
    }

    /// Scans the workload and returns one report per container.
    ///
    /// Either every container yields a report or the scan fails. The reports
    /// are not persisted here.
    #[instrument(skip_all, fields(workload = %owner, plugin = %self.ctx.name()))]
    pub async fn scan(
        &self,
        owner: &ObjectRef,
        cancel: &CancellationToken,
    ) -> Result<Vec<PolicyReport>> {
        info!("Scanning workload");
        let workload = cancellable_try(cancel, self.resolver.resolve(owner))
            .await
            .stage(STAGE_RESOLVING)?;
        let spec = workload.pod_spec().stage(STAGE_POD_TEMPLATE)?;

        let pull_secrets = cancellable_try(
            cancel,
            self.secrets
                .list_image_pull_secrets(&spec, workload.namespace()),
        )
        .await
        .stage(STAGE_PREPARING)?;
        let credentials = map_container_names_to_docker_auths(&container_images(&spec), &pull_secrets)
            .stage(STAGE_PREPARING)?;
        debug!(credentials = credentials.len(), "Resolved registry credentials");

        let (template, secrets) = self
            .plugin
            .get_task_spec(&self.ctx, &spec, &credentials)
            .stage(STAGE_PREPARING)?;
        let job = self
            .prepare_job(&workload, &spec, template)
            .stage(STAGE_PREPARING)?;

        let mut runnable = RunnableJob::new(job, secrets);
        let outcome = match self.runner.run(&mut runnable, cancel).await {
            Ok(()) => self.collect_reports(&workload, runnable.job(), cancel).await,
            Err(e) => Err(Error::stage(STAGE_RUNNING, e)),
        };
        self.cleanup(&runnable).await;

        if let Ok(reports) = &outcome {
            info!(reports = reports.len(), "Scan completed");
        }
        outcome
    }

    fn prepare_job(&self, workload: &Workload, spec: &PodSpec, template: PodSpec) -> Result<Job> {
        let config = self.config();
        let owner = workload.object_ref();

        let mut template = template;
        template.service_account_name = Some(config.service_account_name.clone());
        if !config.scan_job.tolerations.is_empty() {
            template
                .tolerations
                .get_or_insert_with(Vec::new)
                .extend(config.scan_job.tolerations.iter().cloned());
        }

        let mut labels = owner.selector_labels();
        labels.insert(LABEL_POD_SPEC_HASH.to_string(), compute_hash(spec)?);
        labels.insert(LABEL_K8S_APP_MANAGED_BY.to_string(), APP_NAME.to_string());
        labels.insert(LABEL_POLICY_REPORT_SCANNER.to_string(), "true".to_string());

        let images = serde_json::to_string(&container_images(spec))?;
        let template_annotations =
            (!config.scan_job.annotations.is_empty()).then(|| config.scan_job.annotations.clone());

        Ok(Job {
            metadata: ObjectMeta {
                name: Some(scan_job_name(&owner)?),
                namespace: Some(config.namespace.clone()),
                labels: Some(labels.clone()),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_CONTAINER_IMAGES.to_string(),
                    images,
                )])),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                completions: Some(1),
                active_deadline_seconds: config.scan_job.timeout_seconds,
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: template_annotations,
                        ..Default::default()
                    }),
                    spec: Some(template),
                },
                ..Default::default()
            }),
            status: None,
        })
    }

    async fn collect_reports(
        &self,
        workload: &Workload,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<Vec<PolicyReport>> {
        let images: BTreeMap<String, String> = job
            .annotations()
            .get(ANNOTATION_CONTAINER_IMAGES)
            .ok_or_else(|| Error::MissingAnnotation(ANNOTATION_CONTAINER_IMAGES.to_string()))
            .and_then(|raw| Ok(serde_json::from_str::<BTreeMap<String, String>>(raw)?))
            .stage(STAGE_LOGS)?;
        let hash = job
            .labels()
            .get(LABEL_POD_SPEC_HASH)
            .cloned()
            .ok_or_else(|| Error::MissingLabel(LABEL_POD_SPEC_HASH.to_string()))
            .stage(STAGE_BUILDING)?;
        let scope = scope_of(workload);

        let mut reports = Vec::with_capacity(images.len());
        let mut outputs: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for (container, image) in &images {
            let source = self.plugin.output_container(container);
            let output = match outputs.entry(source) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    debug!(container = %container, source = %entry.key(), "Getting scan output");
                    let logs = cancellable_try(cancel, self.jobs.container_logs(job, entry.key()))
                        .await
                        .stage(STAGE_LOGS)?;
                    let output = cancellable_try(cancel, read_output(logs))
                        .await
                        .stage(STAGE_LOGS)?;
                    entry.insert(output)
                }
            };
            let ctx = self.ctx.for_container(container.as_str());
            let logs: LogStream = Box::pin(futures::io::Cursor::new(output.clone()));
            let mut data = cancellable_try(cancel, self.plugin.parse_output(&ctx, image, logs))
                .await
                .stage(STAGE_PARSING)?;
            if data.scope.is_none() {
                data.scope = Some(scope.clone());
            }
            let report = ReportBuilder::new()
                .workload(workload)
                .container(container.as_str())
                .pod_spec_hash(hash.as_str())
                .data(data)
                .build()
                .stage(STAGE_BUILDING)?;
            reports.push(report);
        }
        Ok(reports)
    }

    /// Deletes unowned secrets left by a failed run, then the job if this
    /// scan created it and deletion is enabled. Failures are only logged.
    async fn cleanup(&self, runnable: &RunnableJob) {
        let namespace = runnable.namespace();
        for secret in runnable.orphaned_secrets() {
            debug!(secret = %secret, "Deleting orphaned secret");
            if let Err(e) = self.jobs.delete_secret(&namespace, &secret).await {
                warn!(secret = %secret, namespace = %namespace, error = %e, "Failed to delete orphaned secret");
            }
        }

        if !runnable.was_created() {
            return;
        }
        let job = runnable.name();
        if !self.config().scan_job.delete_scan_job {
            debug!(job = %job, namespace = %namespace, "Skipping scan job deletion");
            return;
        }
        debug!(job = %job, namespace = %namespace, "Deleting scan job");
        if let Err(e) = self.jobs.delete_job(&namespace, &job).await {
            warn!(job = %job, namespace = %namespace, error = %e, "Failed to delete scan job");
        }
    }
}

fn scope_of(workload: &Workload) -> ObjectReference {
    let meta = workload.meta();
    ObjectReference {
        api_version: Some(workload.kind().api_version().to_string()),
        kind: Some(workload.kind().to_string()),
        name: meta.name.clone(),
        namespace: meta.namespace.clone(),
        uid: meta.uid.clone(),
        ..Default::default()
    }
}
