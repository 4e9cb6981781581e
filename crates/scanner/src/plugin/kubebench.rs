//! kube-bench CIS benchmark checks of the node the scan pod lands on
//!
//! The benchmark covers the node rather than an image, so the scan pod runs a
//! single container and its findings are attributed to every workload
//! container.

use super::{check_image_ref, decode_json, scanner_container, scanner_pod_spec, PluginContext};
use crate::error::Result;
use crate::report::{PolicyReportData, PolicyReportResult, ResultStatus};
use k8s_openapi::api::core::v1::{HostPathVolumeSource, PodSpec, Volume, VolumeMount};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Host paths kube-bench inspects, mounted read-only.
const HOST_PATHS: [(&str, &str); 4] = [
    ("var-lib-etcd", "/var/lib/etcd"),
    ("var-lib-kubelet", "/var/lib/kubelet"),
    ("etc-systemd", "/etc/systemd"),
    ("etc-kubernetes", "/etc/kubernetes"),
];

/// Name of the only container of the scan pod.
pub const CONTAINER_NAME: &str = "kube-bench";

pub(super) fn init(ctx: &PluginContext) -> Result<()> {
    check_image_ref("kubeBench.imageRef", &ctx.config().kube_bench.image_ref)
}

pub(super) fn task_spec(ctx: &PluginContext) -> PodSpec {
    let image = &ctx.config().kube_bench.image_ref;
    let mounts: Vec<VolumeMount> = HOST_PATHS
        .iter()
        .map(|(name, path)| VolumeMount {
            name: (*name).to_string(),
            mount_path: (*path).to_string(),
            read_only: Some(true),
            ..Default::default()
        })
        .collect();

    let mut container = scanner_container(CONTAINER_NAME, image, ("50m", "100M"), ("300m", "300M"));
    container.command = Some(vec!["kube-bench".to_string()]);
    container.args = Some(vec!["--json".to_string()]);
    container.volume_mounts = Some(mounts);

    let mut pod = scanner_pod_spec(ctx, vec![container]);
    pod.host_pid = Some(true);
    pod.volumes = Some(
        HOST_PATHS
            .iter()
            .map(|(name, path)| Volume {
                name: (*name).to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: (*path).to_string(),
                    type_: None,
                }),
                ..Default::default()
            })
            .collect(),
    );
    pod
}

/// Older kube-bench releases print a bare list of controls.
#[derive(Deserialize)]
#[serde(untagged)]
enum Output {
    Wrapped {
        #[serde(rename = "Controls")]
        controls: Vec<Control>,
    },
    Controls(Vec<Control>),
}

#[derive(Deserialize)]
struct Control {
    #[serde(default)]
    text: String,
    #[serde(default)]
    tests: Vec<Section>,
}

#[derive(Deserialize)]
struct Section {
    #[serde(default)]
    section: String,
    #[serde(default)]
    desc: String,
    #[serde(default)]
    results: Vec<Check>,
}

#[derive(Deserialize)]
struct Check {
    test_number: String,
    #[serde(default)]
    test_desc: String,
    #[serde(default)]
    remediation: String,
    status: String,
    #[serde(default)]
    scored: bool,
}

fn status(value: &str) -> ResultStatus {
    match value.to_ascii_uppercase().as_str() {
        "PASS" => ResultStatus::Pass,
        "FAIL" => ResultStatus::Fail,
        "WARN" => ResultStatus::Warn,
        "INFO" => ResultStatus::Skip,
        _ => ResultStatus::Error,
    }
}

pub(super) fn parse(output: &[u8]) -> Result<PolicyReportData> {
    let controls = match decode_json::<Output>("kube-bench", output)? {
        Output::Wrapped { controls } | Output::Controls(controls) => controls,
    };

    let mut results = Vec::new();
    for control in controls {
        for section in control.tests {
            for check in section.results {
                let result = status(&check.status);
                results.push(PolicyReportResult {
                    policy: check.test_number,
                    rule: Some(check.test_desc),
                    category: Some(format!("{} {}", section.section, section.desc).trim().to_string()),
                    result,
                    scored: check.scored,
                    message: (result != ResultStatus::Pass && !check.remediation.is_empty())
                        .then_some(check.remediation),
                    properties: BTreeMap::from([("control".to_string(), control.text.clone())]),
                    ..Default::default()
                });
            }
        }
    }
    Ok(PolicyReportData::from_results(results))
}
