use super::{Kind, ObjectRef, Workload};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Pod, ReplicationController};
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::debug;

const ANNOTATION_DEPLOYMENT_REVISION: &str = "deployment.kubernetes.io/revision";

/// Resolves partial workload references against the cluster.
#[async_trait]
pub trait WorkloadResolver: Send + Sync {
    /// Fetch the full object behind a partial reference.
    async fn resolve(&self, object: &ObjectRef) -> Result<Workload>;

    /// Name of the ReplicaSet currently managed by a Deployment, or the
    /// ReplicaSet controlling a Pod.
    async fn related_replicaset_name(&self, object: &ObjectRef) -> Result<String>;
}

#[derive(Clone)]
pub struct KubeWorkloadResolver {
    client: Client,
}

impl KubeWorkloadResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn active_replicaset_for_deployment(&self, object: &ObjectRef) -> Result<String> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &object.namespace);
        let deployment = deployments.get(&object.name).await?;

        let replicasets: Api<ReplicaSet> = Api::namespaced(self.client.clone(), &object.namespace);
        let list = replicasets
            .list(&ListParams::default().labels(&match_label_selector(&deployment)))
            .await?;
        active_replicaset_name(object, &deployment, list.items)
    }

    async fn controlling_replicaset_for_pod(&self, object: &ObjectRef) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &object.namespace);
        let pod = pods.get(&object.name).await?;
        controlling_replicaset_name(object, &pod)
    }
}

fn match_label_selector(deployment: &Deployment) -> String {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.as_ref())
        .map(|labels| {
            labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}

/// The ReplicaSet owned by the deployment at the deployment's current revision.
fn active_replicaset_name(
    object: &ObjectRef,
    deployment: &Deployment,
    replicasets: Vec<ReplicaSet>,
) -> Result<String> {
    let revision = deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_DEPLOYMENT_REVISION))
        .cloned()
        .ok_or_else(|| Error::MissingAnnotation(ANNOTATION_DEPLOYMENT_REVISION.to_string()))?;
    let uid = deployment.metadata.uid.clone().unwrap_or_default();

    replicasets
        .into_iter()
        .find(|rs| {
            let owned = rs
                .metadata
                .owner_references
                .as_ref()
                .is_some_and(|refs| refs.iter().any(|r| r.uid == uid));
            let same_revision = rs
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_DEPLOYMENT_REVISION))
                .is_some_and(|r| *r == revision);
            owned && same_revision
        })
        .and_then(|rs| rs.metadata.name)
        .ok_or_else(|| Error::NoRelatedReplicaSet {
            object: object.to_string(),
            reason: format!("no active replicaset at revision {revision}"),
        })
}

fn controlling_replicaset_name(object: &ObjectRef, pod: &Pod) -> Result<String> {
    pod.metadata
        .owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true) && r.kind == Kind::ReplicaSet.as_str())
        .map(|r| r.name.clone())
        .ok_or_else(|| Error::NoRelatedReplicaSet {
            object: object.to_string(),
            reason: "not controlled by a replicaset".to_string(),
        })
}

#[async_trait]
impl WorkloadResolver for KubeWorkloadResolver {
    async fn resolve(&self, object: &ObjectRef) -> Result<Workload> {
        debug!(workload = %object, "Resolving workload");
        let client = self.client.clone();
        let ns = object.namespace.as_str();
        let name = object.name.as_str();
        let workload = match object.kind {
            Kind::Pod => Workload::Pod(Api::<Pod>::namespaced(client, ns).get(name).await?),
            Kind::ReplicaSet => {
                Workload::ReplicaSet(Api::<ReplicaSet>::namespaced(client, ns).get(name).await?)
            }
            Kind::ReplicationController => Workload::ReplicationController(
                Api::<ReplicationController>::namespaced(client, ns)
                    .get(name)
                    .await?,
            ),
            Kind::Deployment => {
                Workload::Deployment(Api::<Deployment>::namespaced(client, ns).get(name).await?)
            }
            Kind::StatefulSet => {
                Workload::StatefulSet(Api::<StatefulSet>::namespaced(client, ns).get(name).await?)
            }
            Kind::DaemonSet => {
                Workload::DaemonSet(Api::<DaemonSet>::namespaced(client, ns).get(name).await?)
            }
            Kind::CronJob => {
                Workload::CronJob(Api::<CronJob>::namespaced(client, ns).get(name).await?)
            }
            Kind::Job => Workload::Job(Api::<Job>::namespaced(client, ns).get(name).await?),
        };
        Ok(workload)
    }

    async fn related_replicaset_name(&self, object: &ObjectRef) -> Result<String> {
        match object.kind {
            Kind::Deployment => self.active_replicaset_for_deployment(object).await,
            Kind::Pod => self.controlling_replicaset_for_pod(object).await,
            other => Err(Error::NoRelatedReplicaSet {
                object: object.to_string(),
                reason: format!("kind {other} has no related replicaset"),
            }),
        }
    }
}
