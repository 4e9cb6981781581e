//! Persistence of reports in the cluster object store

use super::crd::PolicyReport;
use crate::error::{Error, Result};
use crate::workload::{Kind, ObjectRef, WorkloadResolver};
use async_trait::async_trait;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info};

/// Report API used by the [`ReadWriter`].
#[async_trait]
pub trait ReportClient: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<PolicyReport>>;

    async fn create(&self, report: &PolicyReport) -> Result<PolicyReport>;

    async fn replace(&self, report: &PolicyReport) -> Result<PolicyReport>;

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<PolicyReport>>;
}

#[derive(Clone)]
pub struct KubeReportClient {
    client: Client,
}

impl KubeReportClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<PolicyReport> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ReportClient for KubeReportClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<PolicyReport>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn create(&self, report: &PolicyReport) -> Result<PolicyReport> {
        let namespace = report.namespace().unwrap_or_default();
        Ok(self
            .api(&namespace)
            .create(&PostParams::default(), report)
            .await?)
    }

    async fn replace(&self, report: &PolicyReport) -> Result<PolicyReport> {
        let namespace = report.namespace().unwrap_or_default();
        Ok(self
            .api(&namespace)
            .replace(&report.name_any(), &PostParams::default(), report)
            .await?)
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<PolicyReport>> {
        let list = self
            .api(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }
}

/// Reads and writes the reports of workloads.
#[derive(Clone)]
pub struct ReadWriter {
    client: Arc<dyn ReportClient>,
    resolver: Arc<dyn WorkloadResolver>,
}

impl ReadWriter {
    pub fn new(client: Arc<dyn ReportClient>, resolver: Arc<dyn WorkloadResolver>) -> Self {
        Self { client, resolver }
    }

    /// Creates each report, or updates it in place when it already exists.
    ///
    /// An update keeps the stored object and overwrites only its labels and
    /// payload, so resource version, uid, owner references and annotations
    /// survive. The first failure aborts the remaining writes.
    pub async fn write(&self, reports: &[PolicyReport]) -> Result<()> {
        for report in reports {
            let name = report.name_any();
            let namespace = report.namespace().unwrap_or_default();
            match self.client.get(&namespace, &name).await? {
                Some(existing) => {
                    let mut updated = existing;
                    updated.metadata.labels.clone_from(&report.metadata.labels);
                    updated.data = report.data.clone();
                    self.client.replace(&updated).await?;
                    debug!(report = %name, namespace = %namespace, "Updated report");
                }
                None => {
                    self.client.create(report).await?;
                    debug!(report = %name, namespace = %namespace, "Created report");
                }
            }
        }
        info!(count = reports.len(), "Wrote reports");
        Ok(())
    }

    pub async fn find_by_owner(&self, owner: &ObjectRef) -> Result<Vec<PolicyReport>> {
        self.client
            .list(&owner.namespace, &owner.label_selector())
            .await
    }

    /// Like [`ReadWriter::find_by_owner`], but when a Deployment or Pod has no
    /// reports of its own, looks them up on its related ReplicaSet.
    pub async fn find_by_owner_in_hierarchy(&self, owner: &ObjectRef) -> Result<Vec<PolicyReport>> {
        let reports = self.find_by_owner(owner).await?;
        if !reports.is_empty() || !matches!(owner.kind, Kind::Deployment | Kind::Pod) {
            return Ok(reports);
        }

        let replicaset = self
            .resolver
            .related_replicaset_name(owner)
            .await
            .map_err(|e| Error::stage("getting related replicaset", e))?;
        debug!(owner = %owner, replicaset = %replicaset, "Looking up reports of related replicaset");
        self.find_by_owner(&ObjectRef::new(
            Kind::ReplicaSet,
            owner.namespace.clone(),
            replicaset,
        ))
        .await
    }
}
