//! ReadWriter behaviour against an in-memory report store.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use scanner::error::{Error, Result};
use scanner::report::{
    PolicyReport, PolicyReportData, PolicyReportResult, ReportClient, ResultStatus,
};
use scanner::workload::WorkloadResolver;
use scanner::{Kind, ObjectRef, ReadWriter, ReportBuilder, Workload};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct FakeReports {
    stored: Mutex<BTreeMap<(String, String), PolicyReport>>,
    creates: AtomicUsize,
    replaces: AtomicUsize,
}

impl FakeReports {
    fn insert(&self, report: PolicyReport) {
        let key = (report.namespace().unwrap_or_default(), report.name_any());
        self.stored.lock().unwrap().insert(key, report);
    }

    fn get_stored(&self, namespace: &str, name: &str) -> Option<PolicyReport> {
        self.stored
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ReportClient for FakeReports {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<PolicyReport>> {
        Ok(self.get_stored(namespace, name))
    }

    async fn create(&self, report: &PolicyReport) -> Result<PolicyReport> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut created = report.clone();
        created.metadata.resource_version = Some("1".to_string());
        self.insert(created.clone());
        Ok(created)
    }

    async fn replace(&self, report: &PolicyReport) -> Result<PolicyReport> {
        self.replaces.fetch_add(1, Ordering::SeqCst);
        self.insert(report.clone());
        Ok(report.clone())
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<PolicyReport>> {
        let wanted: Vec<(&str, &str)> = label_selector
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        Ok(self
            .stored
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.namespace().as_deref() == Some(namespace))
            .filter(|r| {
                wanted
                    .iter()
                    .all(|(k, v)| r.labels().get(*k).map(String::as_str) == Some(*v))
            })
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct CountingResolver {
    replicaset: Option<String>,
    lookups: AtomicUsize,
}

#[async_trait]
impl WorkloadResolver for CountingResolver {
    async fn resolve(&self, object: &ObjectRef) -> Result<Workload> {
        Err(Error::Config(format!("{object} is not resolvable here")))
    }

    async fn related_replicaset_name(&self, object: &ObjectRef) -> Result<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.replicaset
            .clone()
            .ok_or_else(|| Error::NoRelatedReplicaSet {
                object: object.to_string(),
                reason: "not controlled by a replicaset".to_string(),
            })
    }
}

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("ns".to_string()),
        uid: Some(format!("{name}-uid")),
        ..Default::default()
    }
}

fn data(policy: &str) -> PolicyReportData {
    PolicyReportData::from_results(vec![PolicyReportResult {
        policy: policy.to_string(),
        result: ResultStatus::Fail,
        ..Default::default()
    }])
}

fn deployment_report(policy: &str) -> PolicyReport {
    ReportBuilder::new()
        .controller(&Deployment {
            metadata: meta("web"),
            ..Default::default()
        })
        .container("app")
        .pod_spec_hash("h1")
        .data(data(policy))
        .build()
        .unwrap()
}

fn replicaset_report() -> PolicyReport {
    ReportBuilder::new()
        .controller(&ReplicaSet {
            metadata: meta("web-5d9c8"),
            ..Default::default()
        })
        .container("app")
        .data(data("CVE-2021-0002"))
        .build()
        .unwrap()
}

fn read_writer(store: Arc<FakeReports>, resolver: Arc<CountingResolver>) -> ReadWriter {
    ReadWriter::new(store, resolver)
}

#[tokio::test]
async fn write_creates_missing_reports() {
    let store = Arc::new(FakeReports::default());
    let rw = read_writer(store.clone(), Arc::default());

    tokio_test::assert_ok!(rw.write(&[deployment_report("CVE-2021-0001")]).await);

    assert_eq!(store.creates.load(Ordering::SeqCst), 1);
    assert_eq!(store.replaces.load(Ordering::SeqCst), 0);
    assert!(store.get_stored("ns", "deployment-web-app").is_some());
}

#[tokio::test]
async fn write_updates_labels_and_payload_in_place() {
    let store = Arc::new(FakeReports::default());
    let mut existing = deployment_report("CVE-2020-9999");
    existing.metadata.resource_version = Some("42".to_string());
    existing.metadata.uid = Some("report-uid".to_string());
    existing.metadata.annotations = Some(BTreeMap::from([(
        "note".to_string(),
        "kept".to_string(),
    )]));
    store.insert(existing);

    let mut fresh = deployment_report("CVE-2021-0001");
    fresh
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert("pod-spec-hash".to_string(), "h2".to_string());
    let rw = read_writer(store.clone(), Arc::default());
    tokio_test::assert_ok!(rw.write(&[fresh]).await);

    assert_eq!(store.creates.load(Ordering::SeqCst), 0);
    assert_eq!(store.replaces.load(Ordering::SeqCst), 1);
    let stored = store.get_stored("ns", "deployment-web-app").unwrap();
    assert_eq!(stored.metadata.resource_version.as_deref(), Some("42"));
    assert_eq!(stored.metadata.uid.as_deref(), Some("report-uid"));
    assert_eq!(stored.annotations()["note"], "kept");
    assert_eq!(stored.labels()["pod-spec-hash"], "h2");
    assert_eq!(stored.data.results[0].policy, "CVE-2021-0001");
    assert_eq!(stored.owner_references().len(), 1);
}

#[tokio::test]
async fn find_by_owner_matches_kind_name_and_namespace() {
    let store = Arc::new(FakeReports::default());
    store.insert(deployment_report("CVE-2021-0001"));
    store.insert(replicaset_report());
    let rw = read_writer(store, Arc::default());

    let found = rw
        .find_by_owner(&ObjectRef::new(Kind::Deployment, "ns", "web"))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name_any(), "deployment-web-app");

    let none = rw
        .find_by_owner(&ObjectRef::new(Kind::StatefulSet, "ns", "web"))
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn hierarchy_lookup_falls_back_to_active_replicaset() {
    let store = Arc::new(FakeReports::default());
    store.insert(replicaset_report());
    let resolver = Arc::new(CountingResolver {
        replicaset: Some("web-5d9c8".to_string()),
        ..Default::default()
    });
    let rw = read_writer(store, resolver.clone());

    let found = rw
        .find_by_owner_in_hierarchy(&ObjectRef::new(Kind::Deployment, "ns", "web"))
        .await
        .unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name_any(), "replicaset-web-5d9c8-app");
    assert_eq!(resolver.lookups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hierarchy_lookup_prefers_direct_reports() {
    let store = Arc::new(FakeReports::default());
    store.insert(deployment_report("CVE-2021-0001"));
    store.insert(replicaset_report());
    let resolver = Arc::new(CountingResolver {
        replicaset: Some("web-5d9c8".to_string()),
        ..Default::default()
    });
    let rw = read_writer(store, resolver.clone());

    let found = rw
        .find_by_owner_in_hierarchy(&ObjectRef::new(Kind::Deployment, "ns", "web"))
        .await
        .unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name_any(), "deployment-web-app");
    assert_eq!(resolver.lookups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn hierarchy_lookup_does_not_apply_to_other_kinds() {
    let resolver = Arc::new(CountingResolver::default());
    let rw = read_writer(Arc::default(), resolver.clone());

    let found = rw
        .find_by_owner_in_hierarchy(&ObjectRef::new(Kind::StatefulSet, "ns", "db"))
        .await
        .unwrap();

    assert!(found.is_empty());
    assert_eq!(resolver.lookups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn hierarchy_lookup_surfaces_resolution_errors() {
    let rw = read_writer(Arc::default(), Arc::new(CountingResolver::default()));

    let err = rw
        .find_by_owner_in_hierarchy(&ObjectRef::new(Kind::Pod, "ns", "standalone"))
        .await
        .unwrap_err();
    assert!(matches!(err.root(), Error::NoRelatedReplicaSet { .. }));
}
