//! Scanner plugins
//!
//! A plugin describes the pod that scans a workload and converts the output of
//! that pod's containers into report data. Image and configuration scanners
//! run one container per workload container, named after it. Cluster and node
//! scanners run a single container whose output is shared by every workload
//! container; [`Plugin::output_container`] names the container to read.

pub mod kubebench;
pub mod kubehunter;
pub mod polaris;
pub mod trivy;

use crate::config::{PluginKind, ScannerConfig};
use crate::error::{Error, Result};
use crate::report::PolicyReportData;
use crate::runner::LogStream;
use crate::workload::DockerAuth;
use async_trait::async_trait;
use futures::AsyncReadExt;
use k8s_openapi::api::core::v1::{
    Affinity, Container, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PodSpec, ResourceRequirements, Secret,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a plugin knows about the scanner it runs in.
#[derive(Debug, Clone)]
pub struct PluginContext {
    name: String,
    namespace: String,
    service_account_name: String,
    container: Option<String>,
    config: Arc<ScannerConfig>,
}

impl PluginContext {
    pub fn new(kind: PluginKind, config: Arc<ScannerConfig>) -> Self {
        Self {
            name: kind.to_string(),
            namespace: config.namespace.clone(),
            service_account_name: config.service_account_name.clone(),
            container: None,
            config,
        }
    }

    /// Context for handling the output that belongs to one workload container.
    #[must_use]
    pub fn for_container(&self, container: impl Into<String>) -> Self {
        Self {
            container: Some(container.into()),
            ..self.clone()
        }
    }

    /// Workload container whose output is being handled, if scoped.
    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn service_account_name(&self) -> &str {
        &self.service_account_name
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    /// Checks the plugin's configuration before any scan is scheduled.
    async fn init(&self, ctx: &PluginContext) -> Result<()>;

    /// Pod template scanning the workload described by `spec`, plus the
    /// secrets the template refers to. `credentials` maps workload container
    /// names to registry credentials for their images.
    fn get_task_spec(
        &self,
        ctx: &PluginContext,
        spec: &PodSpec,
        credentials: &BTreeMap<String, DockerAuth>,
    ) -> Result<(PodSpec, Vec<Secret>)>;

    /// Name of the scan pod container whose logs hold the findings for the
    /// given workload container.
    fn output_container(&self, workload_container: &str) -> String {
        workload_container.to_string()
    }

    /// Converts the output of the container that scanned `image_ref`. When
    /// `ctx` is scoped to a container, only findings of that container and of
    /// the workload as a whole are kept.
    async fn parse_output(
        &self,
        ctx: &PluginContext,
        image_ref: &str,
        logs: LogStream,
    ) -> Result<PolicyReportData>;
}

/// The built-in scanners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerPlugin {
    Trivy,
    KubeHunter,
    KubeBench,
    Polaris,
}

impl ScannerPlugin {
    pub fn kind(&self) -> PluginKind {
        match self {
            ScannerPlugin::Trivy => PluginKind::Trivy,
            ScannerPlugin::KubeHunter => PluginKind::KubeHunter,
            ScannerPlugin::KubeBench => PluginKind::KubeBench,
            ScannerPlugin::Polaris => PluginKind::Polaris,
        }
    }
}

impl From<PluginKind> for ScannerPlugin {
    fn from(kind: PluginKind) -> Self {
        match kind {
            PluginKind::Trivy => ScannerPlugin::Trivy,
            PluginKind::KubeHunter => ScannerPlugin::KubeHunter,
            PluginKind::KubeBench => ScannerPlugin::KubeBench,
            PluginKind::Polaris => ScannerPlugin::Polaris,
        }
    }
}

#[async_trait]
impl Plugin for ScannerPlugin {
    async fn init(&self, ctx: &PluginContext) -> Result<()> {
        match self {
            ScannerPlugin::Trivy => trivy::init(ctx),
            ScannerPlugin::KubeHunter => kubehunter::init(ctx),
            ScannerPlugin::KubeBench => kubebench::init(ctx),
            ScannerPlugin::Polaris => polaris::init(ctx),
        }
    }

    fn get_task_spec(
        &self,
        ctx: &PluginContext,
        spec: &PodSpec,
        credentials: &BTreeMap<String, DockerAuth>,
    ) -> Result<(PodSpec, Vec<Secret>)> {
        match self {
            ScannerPlugin::Trivy => trivy::task_spec(ctx, spec, credentials),
            ScannerPlugin::KubeHunter => Ok((kubehunter::task_spec(ctx), Vec::new())),
            ScannerPlugin::KubeBench => Ok((kubebench::task_spec(ctx), Vec::new())),
            ScannerPlugin::Polaris => polaris::task_spec(ctx, spec),
        }
    }

    fn output_container(&self, workload_container: &str) -> String {
        match self {
            ScannerPlugin::KubeHunter => kubehunter::CONTAINER_NAME.to_string(),
            ScannerPlugin::KubeBench => kubebench::CONTAINER_NAME.to_string(),
            ScannerPlugin::Trivy | ScannerPlugin::Polaris => workload_container.to_string(),
        }
    }

    async fn parse_output(
        &self,
        ctx: &PluginContext,
        image_ref: &str,
        logs: LogStream,
    ) -> Result<PolicyReportData> {
        let output = read_output(logs).await?;
        match self {
            ScannerPlugin::Trivy => trivy::parse(ctx, image_ref, &output),
            ScannerPlugin::KubeHunter => kubehunter::parse(&output),
            ScannerPlugin::KubeBench => kubebench::parse(&output),
            ScannerPlugin::Polaris => polaris::parse(ctx, &output),
        }
    }
}

pub(crate) async fn read_output(mut logs: LogStream) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    logs.read_to_end(&mut output).await?;
    Ok(output)
}

/// Decodes scanner JSON output, tolerating log lines printed before it.
pub(crate) fn decode_json<T: DeserializeOwned>(scanner: &str, output: &[u8]) -> Result<T> {
    let start = output
        .iter()
        .position(|b| *b == b'{' || *b == b'[')
        .ok_or_else(|| Error::Parse(format!("{scanner} produced no JSON output")))?;
    serde_json::from_slice(&output[start..]).map_err(|e| Error::Parse(format!("{scanner}: {e}")))
}

pub(crate) fn check_image_ref(key: &str, image_ref: &str) -> Result<()> {
    crate::config::version_from_image_ref(image_ref)
        .map(|_| ())
        .map_err(|e| Error::Config(format!("{key}: {e}")))
}

/// Scanner container running `image` with the given requests and limits.
pub(crate) fn scanner_container(name: &str, image: &str, cpu: (&str, &str), memory: (&str, &str)) -> Container {
    let quantities = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        termination_message_policy: Some("FallbackToLogsOnError".to_string()),
        resources: Some(ResourceRequirements {
            requests: Some(quantities(cpu.0, memory.0)),
            limits: Some(quantities(cpu.1, memory.1)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Required node affinity for Linux nodes.
pub(crate) fn linux_node_affinity() -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: "kubernetes.io/os".to_string(),
                        operator: "In".to_string(),
                        values: Some(vec!["linux".to_string()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod spec shared by all scanners: never restarted, Linux nodes only, runs as
/// the scanner's service account.
pub(crate) fn scanner_pod_spec(ctx: &PluginContext, containers: Vec<Container>) -> PodSpec {
    PodSpec {
        restart_policy: Some("Never".to_string()),
        service_account_name: Some(ctx.service_account_name().to_string()),
        automount_service_account_token: Some(false),
        affinity: Some(linux_node_affinity()),
        containers,
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use k8s_openapi::api::core::v1::Container;

    pub fn ctx() -> PluginContext {
        PluginContext::new(PluginKind::Trivy, Arc::new(ScannerConfig::default()))
    }

    pub fn workload_spec(containers: &[(&str, &str)]) -> PodSpec {
        PodSpec {
            containers: containers
                .iter()
                .map(|(name, image)| Container {
                    name: name.to_string(),
                    image: Some(image.to_string()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn logs(output: &str) -> LogStream {
        Box::pin(futures::io::Cursor::new(output.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn decode_json_skips_leading_log_lines() {
        let value: serde_json::Value =
            decode_json("trivy", b"2021-01-01T00:00:00Z INFO Need to update DB\n[1, 2]").unwrap();
        assert_eq!(value, serde_json::json!([1, 2]));
    }

    #[test]
    fn decode_json_without_json_is_a_parse_error() {
        let err = decode_json::<serde_json::Value>("trivy", b"FATAL: cannot pull image").unwrap_err();
        assert!(matches!(err, Error::Parse(msg) if msg.contains("no JSON")));
    }

    const ALL_PLUGINS: [ScannerPlugin; 4] = [
        ScannerPlugin::Trivy,
        ScannerPlugin::KubeHunter,
        ScannerPlugin::KubeBench,
        ScannerPlugin::Polaris,
    ];

    #[tokio::test]
    async fn every_workload_container_maps_to_a_scanner_container() {
        let spec = workload_spec(&[("app", "nginx:1.21"), ("proxy", "envoyproxy/envoy:v1.18")]);
        for plugin in ALL_PLUGINS {
            let ctx = PluginContext::new(plugin.kind(), Arc::new(ScannerConfig::default()));
            plugin.init(&ctx).await.unwrap();
            let (template, _) = plugin.get_task_spec(&ctx, &spec, &BTreeMap::new()).unwrap();
            let names: Vec<_> = template.containers.iter().map(|c| c.name.as_str()).collect();
            for workload_container in ["app", "proxy"] {
                let output = plugin.output_container(workload_container);
                assert!(names.contains(&output.as_str()), "{plugin:?}: {output} not in {names:?}");
            }
            assert_eq!(template.restart_policy.as_deref(), Some("Never"));
            assert_eq!(template.service_account_name.as_deref(), Some("starboard"));

            let terms = &template
                .affinity
                .as_ref()
                .and_then(|a| a.node_affinity.as_ref())
                .and_then(|n| n.required_during_scheduling_ignored_during_execution.as_ref())
                .unwrap()
                .node_selector_terms;
            let requirement = &terms[0].match_expressions.as_ref().unwrap()[0];
            assert_eq!(requirement.key, "kubernetes.io/os");
            assert_eq!(requirement.operator, "In");
            assert_eq!(requirement.values.as_deref(), Some(&["linux".to_string()][..]));
        }
    }

    #[test]
    fn per_container_scanners_mirror_and_cluster_scanners_run_once() {
        let spec = workload_spec(&[
            ("app", "nginx:1.21"),
            ("proxy", "envoyproxy/envoy:v1.18"),
            ("metrics", "prom/statsd-exporter:v0.20.0"),
        ]);
        for plugin in ALL_PLUGINS {
            let ctx = PluginContext::new(plugin.kind(), Arc::new(ScannerConfig::default()));
            let (template, _) = plugin.get_task_spec(&ctx, &spec, &BTreeMap::new()).unwrap();
            let names: Vec<_> = template.containers.iter().map(|c| c.name.clone()).collect();
            match plugin {
                ScannerPlugin::Trivy | ScannerPlugin::Polaris => {
                    assert_eq!(names, ["app", "proxy", "metrics"], "{plugin:?}");
                }
                ScannerPlugin::KubeHunter | ScannerPlugin::KubeBench => {
                    assert_eq!(names, [plugin.output_container("app")], "{plugin:?}");
                    assert_eq!(plugin.output_container("app"), plugin.output_container("proxy"));
                }
            }
        }
    }

    #[test]
    fn scoping_a_context_keeps_the_configuration() {
        let base = ctx();
        let scoped = base.for_container("app");
        assert_eq!(base.container(), None);
        assert_eq!(scoped.container(), Some("app"));
        assert_eq!(scoped.name(), base.name());
        assert_eq!(scoped.namespace(), base.namespace());
    }

    #[tokio::test]
    async fn cluster_scanner_findings_are_shared_by_every_container() {
        let output = r#"{"vulnerabilities": [{"vid": "KHV002", "vulnerability": "K8s Version Disclosure", "severity": "low"}]}"#;
        let plugin = ScannerPlugin::KubeHunter;
        let app = plugin
            .parse_output(&ctx().for_container("app"), "nginx:1.21", logs(output))
            .await
            .unwrap();
        let proxy = plugin
            .parse_output(&ctx().for_container("proxy"), "envoyproxy/envoy:v1.18", logs(output))
            .await
            .unwrap();
        assert_eq!(app.results.len(), 1);
        assert_eq!(app.results[0].policy, proxy.results[0].policy);
        assert_eq!(app.summary, proxy.summary);
    }

    #[tokio::test]
    async fn parse_output_reads_the_whole_stream() {
        let output = r#"{"vulnerabilities": [{"vid": "KHV002", "vulnerability": "K8s Version Disclosure", "severity": "low", "category": "Information Disclosure"}]}"#;
        let data = ScannerPlugin::KubeHunter
            .parse_output(&ctx(), "", logs(output))
            .await
            .unwrap();
        assert_eq!(data.results.len(), 1);
        assert_eq!(data.summary.fail, 1);
    }
}
