//! Polaris configuration audit of the workload's pod template
//!
//! The Polaris checks and one manifest per workload container are handed to
//! the scan pod in a secret. Each manifest is a pod holding only that
//! container, so each scanner container audits exactly one workload container
//! offline with `--audit-path`.

use super::{check_image_ref, decode_json, scanner_container, scanner_pod_spec, PluginContext};
use crate::error::{Error, Result};
use crate::report::{PolicyReportData, PolicyReportResult, ResultStatus, Severity};
use k8s_openapi::api::core::v1::{
    Pod, PodSpec, Secret, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use std::collections::BTreeMap;
use uuid::Uuid;

const CONFIG_VOLUME: &str = "polaris";
const MOUNT_PATH: &str = "/etc/polaris";
const CONFIG_FILE: &str = "config.yaml";

fn manifest_file(container: &str) -> String {
    format!("{container}.yaml")
}

pub(super) fn init(ctx: &PluginContext) -> Result<()> {
    let polaris = &ctx.config().polaris;
    check_image_ref("polaris.imageRef", &polaris.image_ref)?;
    serde_yaml::from_str::<serde_yaml::Value>(&polaris.config_yaml)
        .map_err(|e| Error::Config(format!("polaris.configYaml: {e}")))?;
    Ok(())
}

pub(super) fn task_spec(ctx: &PluginContext, spec: &PodSpec) -> Result<(PodSpec, Vec<Secret>)> {
    let polaris = &ctx.config().polaris;
    let secret_name = format!("polaris-config-{}", Uuid::new_v4());
    let mut files = BTreeMap::from([(CONFIG_FILE.to_string(), polaris.config_yaml.clone())]);

    let mut containers = Vec::with_capacity(spec.containers.len());
    for workload_container in &spec.containers {
        let name = workload_container.name.as_str();
        let manifest = Pod {
            metadata: ObjectMeta {
                name: Some("workload".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![workload_container.clone()],
                init_containers: None,
                ..spec.clone()
            }),
            status: None,
        };
        let manifest = serde_yaml::to_string(&manifest)
            .map_err(|e| Error::Parse(format!("rendering manifest of container {name}: {e}")))?;
        files.insert(manifest_file(name), manifest);

        let mut container = scanner_container(name, &polaris.image_ref, ("50m", "50M"), ("300m", "300M"));
        container.command = Some(vec!["polaris".to_string()]);
        container.args = Some(vec![
            "audit".to_string(),
            "--config".to_string(),
            format!("{MOUNT_PATH}/{CONFIG_FILE}"),
            "--audit-path".to_string(),
            format!("{MOUNT_PATH}/{}", manifest_file(name)),
            "--format".to_string(),
            "json".to_string(),
        ]);
        container.volume_mounts = Some(vec![VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]);
        containers.push(container);
    }

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.clone()),
            ..Default::default()
        },
        string_data: Some(files),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };

    let mut pod = scanner_pod_spec(ctx, containers);
    pod.volumes = Some(vec![Volume {
        name: CONFIG_VOLUME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name),
            ..Default::default()
        }),
        ..Default::default()
    }]);
    Ok((pod, vec![secret]))
}

#[derive(Deserialize)]
struct Output {
    #[serde(rename = "Results", default)]
    results: Vec<ControllerResult>,
}

type CheckResults = BTreeMap<String, Check>;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ControllerResult {
    #[serde(default)]
    results: CheckResults,
    #[serde(default)]
    pod_result: Option<PodResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PodResult {
    #[serde(default)]
    results: CheckResults,
    #[serde(default)]
    container_results: Vec<ContainerResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerResult {
    name: String,
    #[serde(default)]
    results: CheckResults,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Check {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    message: String,
    success: bool,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    category: String,
}

fn to_result(check: Check, level: &str, container: Option<&str>) -> PolicyReportResult {
    let result = match (check.success, check.severity.as_str()) {
        (true, _) => ResultStatus::Pass,
        (false, "warning") => ResultStatus::Warn,
        (false, "ignore") => ResultStatus::Skip,
        (false, _) => ResultStatus::Fail,
    };
    let mut properties = BTreeMap::from([("level".to_string(), level.to_string())]);
    if let Some(container) = container {
        properties.insert("container".to_string(), container.to_string());
    }
    PolicyReportResult {
        policy: check.id,
        category: (!check.category.is_empty()).then_some(check.category),
        severity: Severity::from_scanner(&check.severity),
        result,
        message: (!check.message.is_empty()).then_some(check.message),
        properties,
        ..Default::default()
    }
}

/// Keeps workload and pod checks, and container checks of the container `ctx`
/// is scoped to. An unscoped context keeps every container's checks.
pub(super) fn parse(ctx: &PluginContext, output: &[u8]) -> Result<PolicyReportData> {
    let output: Output = decode_json("polaris", output)?;
    let mut results = Vec::new();
    for controller in output.results {
        results.extend(
            controller
                .results
                .into_values()
                .map(|c| to_result(c, "workload", None)),
        );
        let Some(pod) = controller.pod_result else {
            continue;
        };
        results.extend(pod.results.into_values().map(|c| to_result(c, "pod", None)));
        for container in pod.container_results {
            if ctx.container().is_some_and(|scoped| scoped != container.name) {
                continue;
            }
            let name = container.name;
            results.extend(
                container
                    .results
                    .into_values()
                    .map(|c| to_result(c, "container", Some(&name))),
            );
        }
    }
    Ok(PolicyReportData::from_results(results))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{ctx, workload_spec};
    use super::*;

    #[test]
    fn ships_config_and_one_manifest_per_container_in_a_mounted_secret() {
        let spec = workload_spec(&[("app", "nginx:1.21"), ("proxy", "envoyproxy/envoy:v1.18")]);
        let (pod, secrets) = task_spec(&ctx(), &spec).unwrap();
        assert_eq!(secrets.len(), 1);
        let data = secrets[0].string_data.as_ref().unwrap();
        assert!(data[CONFIG_FILE].contains("hostPIDSet: danger"));
        assert!(data["app.yaml"].contains("nginx:1.21"));
        assert!(!data["app.yaml"].contains("envoy"));
        assert!(data["proxy.yaml"].contains("envoyproxy/envoy:v1.18"));
        assert!(!data["proxy.yaml"].contains("nginx"));

        let volume = &pod.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume.secret.as_ref().unwrap().secret_name,
            secrets[0].metadata.name
        );
        for (container, manifest) in pod.containers.iter().zip(["/etc/polaris/app.yaml", "/etc/polaris/proxy.yaml"]) {
            assert!(container.args.as_ref().unwrap().contains(&manifest.to_string()));
        }
    }

    const TWO_CONTAINER_OUTPUT: &[u8] = br#"{
      "Results": [{
        "Name": "workload",
        "Kind": "Pod",
        "Results": {
          "missingNetworkPolicy": {"ID": "missingNetworkPolicy", "Message": "No network policy", "Success": false, "Severity": "warning", "Category": "Networking"}
        },
        "PodResult": {
          "Name": "workload",
          "Results": {},
          "ContainerResults": [
            {"Name": "app", "Results": {
              "runAsRootAllowed": {"ID": "runAsRootAllowed", "Message": "Should not be allowed to run as root", "Success": false, "Severity": "warning", "Category": "Security"}
            }},
            {"Name": "proxy", "Results": {
              "tagNotSpecified": {"ID": "tagNotSpecified", "Message": "Image tag should be specified", "Success": false, "Severity": "danger", "Category": "Images"}
            }}
          ]
        }
      }]
    }"#;

    #[test]
    fn scoped_parse_keeps_only_the_scoped_container_checks() {
        let app = parse(&ctx().for_container("app"), TWO_CONTAINER_OUTPUT).unwrap();
        let policies: Vec<_> = app.results.iter().map(|r| r.policy.as_str()).collect();
        assert_eq!(policies, ["missingNetworkPolicy", "runAsRootAllowed"]);
        assert!(app
            .results
            .iter()
            .filter_map(|r| r.properties.get("container"))
            .all(|c| c == "app"));

        let proxy = parse(&ctx().for_container("proxy"), TWO_CONTAINER_OUTPUT).unwrap();
        let policies: Vec<_> = proxy.results.iter().map(|r| r.policy.as_str()).collect();
        assert_eq!(policies, ["missingNetworkPolicy", "tagNotSpecified"]);

        let unscoped = parse(&ctx(), TWO_CONTAINER_OUTPUT).unwrap();
        assert_eq!(unscoped.results.len(), 3);
    }

    #[test]
    fn maps_workload_pod_and_container_checks() {
        let output = br#"{
          "PolarisOutputVersion": "1.0",
          "SourceType": "Path",
          "Results": [{
            "Name": "workload",
            "Kind": "Pod",
            "Results": {},
            "PodResult": {
              "Name": "workload",
              "Results": {
                "hostPIDSet": {"ID": "hostPIDSet", "Message": "Host PID is not configured", "Success": true, "Severity": "danger", "Category": "Security"}
              },
              "ContainerResults": [{
                "Name": "app",
                "Results": {
                  "runAsRootAllowed": {"ID": "runAsRootAllowed", "Message": "Should not be allowed to run as root", "Success": false, "Severity": "warning", "Category": "Security"},
                  "tagNotSpecified": {"ID": "tagNotSpecified", "Message": "Image tag is specified", "Success": true, "Severity": "danger", "Category": "Images"},
                  "privilegeEscalationAllowed": {"ID": "privilegeEscalationAllowed", "Message": "Privilege escalation should not be allowed", "Success": false, "Severity": "danger", "Category": "Security"}
                }
              }]
            }
          }]
        }"#;
        let data = parse(&ctx().for_container("app"), output).unwrap();
        assert_eq!(data.results.len(), 4);
        assert_eq!(data.summary.pass, 2);
        assert_eq!(data.summary.warn, 1);
        assert_eq!(data.summary.fail, 1);

        let escalation = data
            .results
            .iter()
            .find(|r| r.policy == "privilegeEscalationAllowed")
            .unwrap();
        assert_eq!(escalation.severity, Some(Severity::High));
        assert_eq!(escalation.properties["container"], "app");
        assert_eq!(escalation.properties["level"], "container");
    }
}
