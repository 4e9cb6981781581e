//! Workload identity, fingerprints and pod template extraction

pub mod credentials;
pub mod resolver;

use crate::error::{Error, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Pod, PodSpec, ReplicationController};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub use credentials::{DockerAuth, KubeSecretsReader, SecretsReader};
pub use resolver::{KubeWorkloadResolver, WorkloadResolver};

/// Workload kinds the scanner knows how to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Pod,
    ReplicaSet,
    ReplicationController,
    Deployment,
    StatefulSet,
    DaemonSet,
    CronJob,
    Job,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Pod => "Pod",
            Kind::ReplicaSet => "ReplicaSet",
            Kind::ReplicationController => "ReplicationController",
            Kind::Deployment => "Deployment",
            Kind::StatefulSet => "StatefulSet",
            Kind::DaemonSet => "DaemonSet",
            Kind::CronJob => "CronJob",
            Kind::Job => "Job",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            Kind::Pod | Kind::ReplicationController => "v1",
            Kind::ReplicaSet | Kind::Deployment | Kind::StatefulSet | Kind::DaemonSet => "apps/v1",
            Kind::CronJob | Kind::Job => "batch/v1",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = Error;

    /// Accepts kind names case-insensitively plus the usual kubectl short names.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pod" | "pods" | "po" => Ok(Kind::Pod),
            "replicaset" | "replicasets" | "rs" => Ok(Kind::ReplicaSet),
            "replicationcontroller" | "replicationcontrollers" | "rc" => {
                Ok(Kind::ReplicationController)
            }
            "deployment" | "deployments" | "deploy" => Ok(Kind::Deployment),
            "statefulset" | "statefulsets" | "sts" => Ok(Kind::StatefulSet),
            "daemonset" | "daemonsets" | "ds" => Ok(Kind::DaemonSet),
            "cronjob" | "cronjobs" | "cj" => Ok(Kind::CronJob),
            "job" | "jobs" => Ok(Kind::Job),
            _ => Err(Error::UnknownKind(s.to_string())),
        }
    }
}

/// Partial reference to a workload: the identity key of a scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parses `kind/name` as accepted on the command line.
    pub fn parse(reference: &str, namespace: &str) -> Result<Self> {
        let (kind, name) = reference
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("expected <kind>/<name>, got '{reference}'")))?;
        if name.is_empty() {
            return Err(Error::MissingField { field: "name" });
        }
        Ok(Self::new(kind.parse()?, namespace, name))
    }

    /// Labels selecting every object that refers to this workload.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                crate::labels::LABEL_RESOURCE_KIND.to_string(),
                self.kind.as_str().to_string(),
            ),
            (
                crate::labels::LABEL_RESOURCE_NAME.to_string(),
                self.name.clone(),
            ),
            (
                crate::labels::LABEL_RESOURCE_NAMESPACE.to_string(),
                self.namespace.clone(),
            ),
        ])
    }

    pub fn label_selector(&self) -> String {
        self.selector_labels()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Deterministic fingerprint of any serializable value.
///
/// The value is serialized to JSON (k8s-openapi maps are ordered) and hashed
/// with SHA-256; the first 8 bytes are hex encoded so the result always fits in
/// a label value and a job name.
pub fn compute_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(&digest[..8]))
}

/// Name of the job scanning the given workload. Stable across scans so that
/// concurrent scans of the same owner collide on creation.
pub fn scan_job_name(owner: &ObjectRef) -> Result<String> {
    Ok(format!("scan-policyreport-{}", compute_hash(owner)?))
}

/// A resolved workload.
#[derive(Debug, Clone)]
pub enum Workload {
    Pod(Pod),
    ReplicaSet(ReplicaSet),
    ReplicationController(ReplicationController),
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
    CronJob(CronJob),
    Job(Job),
}

impl Workload {
    pub fn kind(&self) -> Kind {
        match self {
            Workload::Pod(_) => Kind::Pod,
            Workload::ReplicaSet(_) => Kind::ReplicaSet,
            Workload::ReplicationController(_) => Kind::ReplicationController,
            Workload::Deployment(_) => Kind::Deployment,
            Workload::StatefulSet(_) => Kind::StatefulSet,
            Workload::DaemonSet(_) => Kind::DaemonSet,
            Workload::CronJob(_) => Kind::CronJob,
            Workload::Job(_) => Kind::Job,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Workload::Pod(o) => o.meta(),
            Workload::ReplicaSet(o) => o.meta(),
            Workload::ReplicationController(o) => o.meta(),
            Workload::Deployment(o) => o.meta(),
            Workload::StatefulSet(o) => o.meta(),
            Workload::DaemonSet(o) => o.meta(),
            Workload::CronJob(o) => o.meta(),
            Workload::Job(o) => o.meta(),
        }
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind(), self.namespace(), self.name())
    }

    /// Pod template of the workload.
    pub fn pod_spec(&self) -> Result<PodSpec> {
        let spec = match self {
            Workload::Pod(o) => o.spec.clone(),
            Workload::ReplicaSet(o) => o
                .spec
                .as_ref()
                .and_then(|s| s.template.as_ref())
                .and_then(|t| t.spec.clone()),
            Workload::ReplicationController(o) => o
                .spec
                .as_ref()
                .and_then(|s| s.template.as_ref())
                .and_then(|t| t.spec.clone()),
            Workload::Deployment(o) => o.spec.as_ref().and_then(|s| s.template.spec.clone()),
            Workload::StatefulSet(o) => o.spec.as_ref().and_then(|s| s.template.spec.clone()),
            Workload::DaemonSet(o) => o.spec.as_ref().and_then(|s| s.template.spec.clone()),
            Workload::CronJob(o) => o
                .spec
                .as_ref()
                .and_then(|s| s.job_template.spec.as_ref())
                .and_then(|s| s.template.spec.clone()),
            Workload::Job(o) => o.spec.as_ref().and_then(|s| s.template.spec.clone()),
        };
        spec.ok_or_else(|| Error::NoPodSpec {
            kind: self.kind().to_string(),
        })
    }

    /// Controller owner reference pointing at this workload.
    ///
    /// `blockOwnerDeletion` is false: setting it to true would require update
    /// permission on the owner's finalizers subresource.
    pub fn controller_owner_ref(&self) -> Result<OwnerReference> {
        let meta = self.meta();
        let name = meta
            .name
            .clone()
            .ok_or(Error::MissingField { field: "owner.metadata.name" })?;
        let uid = meta
            .uid
            .clone()
            .ok_or(Error::MissingField { field: "owner.metadata.uid" })?;
        Ok(OwnerReference {
            api_version: self.kind().api_version().to_string(),
            kind: self.kind().to_string(),
            name,
            uid,
            controller: Some(true),
            block_owner_deletion: Some(false),
        })
    }
}

/// Container name to image reference for every container of the pod spec.
///
/// Init containers are not scanned.
pub fn container_images(spec: &PodSpec) -> BTreeMap<String, String> {
    spec.containers
        .iter()
        .map(|c| (c.name.clone(), c.image.clone().unwrap_or_default()))
        .collect()
}
