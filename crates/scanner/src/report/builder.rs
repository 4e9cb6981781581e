use super::crd::{PolicyReport, PolicyReportData};
use crate::error::{Error, Result};
use crate::labels::{
    LABEL_CONTAINER_NAME, LABEL_POD_SPEC_HASH, LABEL_RESOURCE_KIND, LABEL_RESOURCE_NAME,
    LABEL_RESOURCE_NAMESPACE,
};
use crate::workload::{Kind, Workload};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct Owner {
    kind: String,
    meta: ObjectMeta,
}

/// Assembles a [`PolicyReport`] owned by a workload.
///
/// Setters never fail; everything is validated by [`ReportBuilder::build`].
/// Building twice from the same inputs yields equal reports.
#[derive(Debug, Clone, Default)]
pub struct ReportBuilder {
    owner: Option<Owner>,
    container: Option<String>,
    pod_spec_hash: Option<String>,
    data: Option<PolicyReportData>,
}

impl ReportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the controlling owner from any typed Kubernetes object.
    #[must_use]
    pub fn controller<K: Resource<DynamicType = ()>>(mut self, owner: &K) -> Self {
        self.owner = Some(Owner {
            kind: K::kind(&()).into_owned(),
            meta: owner.meta().clone(),
        });
        self
    }

    #[must_use]
    pub fn workload(mut self, owner: &Workload) -> Self {
        self.owner = Some(Owner {
            kind: owner.kind().to_string(),
            meta: owner.meta().clone(),
        });
        self
    }

    #[must_use]
    pub fn container(mut self, name: impl Into<String>) -> Self {
        self.container = Some(name.into());
        self
    }

    /// An empty hash is treated as unset.
    #[must_use]
    pub fn pod_spec_hash(mut self, hash: impl Into<String>) -> Self {
        let hash = hash.into();
        self.pod_spec_hash = (!hash.is_empty()).then_some(hash);
        self
    }

    #[must_use]
    pub fn data(mut self, data: PolicyReportData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn build(&self) -> Result<PolicyReport> {
        let owner = self.owner.as_ref().ok_or(Error::MissingField { field: "owner" })?;
        let container = self
            .container
            .as_deref()
            .ok_or(Error::MissingField { field: "container" })?;
        let data = self.data.clone().ok_or(Error::MissingField { field: "data" })?;

        let kind: Kind = owner.kind.parse()?;
        let name = owner
            .meta
            .name
            .clone()
            .ok_or(Error::MissingField { field: "owner.metadata.name" })?;
        let uid = owner
            .meta
            .uid
            .clone()
            .ok_or(Error::MissingField { field: "owner.metadata.uid" })?;
        let namespace = owner.meta.namespace.clone().unwrap_or_default();

        let mut labels = BTreeMap::from([
            (LABEL_RESOURCE_KIND.to_string(), kind.to_string()),
            (LABEL_RESOURCE_NAME.to_string(), name.clone()),
            (LABEL_RESOURCE_NAMESPACE.to_string(), namespace.clone()),
            (LABEL_CONTAINER_NAME.to_string(), container.to_string()),
        ]);
        if let Some(hash) = &self.pod_spec_hash {
            labels.insert(LABEL_POD_SPEC_HASH.to_string(), hash.clone());
        }

        let metadata = ObjectMeta {
            name: Some(report_name(kind, &name, container)),
            namespace: Some(namespace),
            labels: Some(labels),
            // blockOwnerDeletion stays false so no update permission on the
            // owner's finalizers subresource is needed.
            owner_references: Some(vec![OwnerReference {
                api_version: kind.api_version().to_string(),
                kind: kind.to_string(),
                name,
                uid,
                controller: Some(true),
                block_owner_deletion: Some(false),
            }]),
            ..Default::default()
        };
        Ok(PolicyReport::new(metadata, data))
    }
}

/// `<lowercase kind>-<owner name>-<container>`
pub fn report_name(kind: Kind, owner_name: &str, container: &str) -> String {
    format!(
        "{}-{owner_name}-{container}",
        kind.as_str().to_ascii_lowercase()
    )
}
