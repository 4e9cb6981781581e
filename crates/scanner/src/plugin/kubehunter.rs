//! kube-hunter penetration testing from inside a pod
//!
//! The hunt covers the cluster rather than an image, so the scan pod runs a
//! single container and its findings are attributed to every workload
//! container.

use super::{check_image_ref, decode_json, scanner_container, scanner_pod_spec, PluginContext};
use crate::error::Result;
use crate::report::{PolicyReportData, PolicyReportResult, ResultStatus, Severity};
use k8s_openapi::api::core::v1::PodSpec;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Name of the only container of the scan pod.
pub const CONTAINER_NAME: &str = "kube-hunter";

pub(super) fn init(ctx: &PluginContext) -> Result<()> {
    check_image_ref("kubeHunter.imageRef", &ctx.config().kube_hunter.image_ref)
}

pub(super) fn task_spec(ctx: &PluginContext) -> PodSpec {
    let image = &ctx.config().kube_hunter.image_ref;
    let mut container = scanner_container(CONTAINER_NAME, image, ("50m", "100M"), ("300m", "400M"));
    container.args = Some(
        ["--pod", "--report", "json", "--log", "warn"]
            .map(String::from)
            .to_vec(),
    );

    let mut pod = scanner_pod_spec(ctx, vec![container]);
    pod.host_pid = Some(true);
    pod
}

#[derive(Deserialize)]
struct Output {
    #[serde(default)]
    vulnerabilities: Vec<Vulnerability>,
}

#[derive(Deserialize)]
struct Vulnerability {
    #[serde(default)]
    vid: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    severity: String,
    vulnerability: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    evidence: Option<String>,
    #[serde(default)]
    hunter: Option<String>,
}

pub(super) fn parse(output: &[u8]) -> Result<PolicyReportData> {
    let output: Output = decode_json("kube-hunter", output)?;
    let results = output
        .vulnerabilities
        .into_iter()
        .map(|v| {
            let mut properties = BTreeMap::from([("location".to_string(), v.location)]);
            if let Some(evidence) = v.evidence.filter(|e| !e.is_empty() && e != "none") {
                properties.insert("evidence".to_string(), evidence);
            }
            if let Some(hunter) = v.hunter {
                properties.insert("hunter".to_string(), hunter);
            }
            PolicyReportResult {
                policy: if v.vid.is_empty() { v.vulnerability.clone() } else { v.vid },
                rule: Some(v.vulnerability),
                category: (!v.category.is_empty()).then_some(v.category),
                severity: Severity::from_scanner(&v.severity),
                result: ResultStatus::Fail,
                message: v.description,
                properties,
                ..Default::default()
            }
        })
        .collect();
    Ok(PolicyReportData::from_results(results))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::ctx;
    use super::*;

    #[test]
    fn hunts_once_from_host_pid_namespace() {
        let pod = task_spec(&ctx());
        assert_eq!(pod.host_pid, Some(true));
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.containers[0].name, CONTAINER_NAME);
        assert_eq!(pod.containers[0].image.as_deref(), Some("docker.io/aquasec/kube-hunter:0.4.0"));
        assert_eq!(
            pod.containers[0].args.as_deref(),
            Some(&["--pod", "--report", "json", "--log", "warn"].map(String::from)[..])
        );
    }

    #[test]
    fn maps_vulnerabilities() {
        let output = br#"{
          "nodes": [{"type": "Node/Master", "location": "10.0.0.1"}],
          "services": [],
          "vulnerabilities": [
            {
              "location": "10.0.0.1:6443",
              "vid": "KHV002",
              "category": "Information Disclosure",
              "severity": "medium",
              "vulnerability": "K8s Version Disclosure",
              "description": "The kubernetes version could be obtained from the /version endpoint",
              "evidence": "v1.19.4",
              "hunter": "Api Version Hunter"
            },
            {
              "location": "10.0.0.1:10250",
              "vid": "",
              "category": "Access Risk",
              "severity": "high",
              "vulnerability": "Anonymous Authentication",
              "evidence": "none"
            }
          ]
        }"#;
        let data = parse(output).unwrap();
        assert_eq!(data.summary.fail, 2);
        assert_eq!(data.results[0].policy, "KHV002");
        assert_eq!(data.results[0].severity, Some(Severity::Medium));
        assert_eq!(data.results[0].properties["evidence"], "v1.19.4");
        assert_eq!(data.results[1].policy, "Anonymous Authentication");
        assert!(!data.results[1].properties.contains_key("evidence"));
    }
}
