//! Scanner configuration
//!
//! Loaded from a mounted `config.yaml` or from the scanner's ConfigMap. The
//! [`ConfigManager`] owns the ConfigMap and companion Secret that `init` and
//! `cleanup` manage.

use crate::error::{is_conflict, is_not_found, Error, Result};
use crate::labels::{APP_NAME, LABEL_K8S_APP_MANAGED_BY};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

pub const CONFIG_MAP_NAME: &str = "starboard";
pub const SECRET_NAME: &str = "starboard";
pub const CONFIG_KEY: &str = "config.yaml";
const GITHUB_TOKEN_KEY: &str = "trivy.githubToken";

const POLARIS_CONFIG_YAML: &str = r"checks:
  # reliability
  multipleReplicasForDeployment: ignore
  priorityClassNotSet: ignore
  # resources
  cpuRequestsMissing: warning
  cpuLimitsMissing: warning
  memoryRequestsMissing: warning
  memoryLimitsMissing: warning
  # images
  tagNotSpecified: danger
  pullPolicyNotAlways: ignore
  # healthChecks
  readinessProbeMissing: warning
  livenessProbeMissing: warning
  # networking
  hostNetworkSet: warning
  hostPortSet: warning
  # security
  hostIPCSet: danger
  hostPIDSet: danger
  notReadOnlyRootFilesystem: warning
  privilegeEscalationAllowed: danger
  runAsRootAllowed: warning
  runAsPrivileged: danger
  dangerousCapabilities: danger
  insecureCapabilities: warning
exemptions:
  - controllerNames:
    - kube-hunter
    rules:
    - hostPIDSet
    - notReadOnlyRootFilesystem
    - runAsRootAllowed
";

/// Scanner selected to run scan jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginKind {
    #[default]
    Trivy,
    KubeHunter,
    KubeBench,
    Polaris,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Trivy => "trivy",
            PluginKind::KubeHunter => "kube-hunter",
            PluginKind::KubeBench => "kube-bench",
            PluginKind::Polaris => "polaris",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trivy" => Ok(PluginKind::Trivy),
            "kube-hunter" | "kubehunter" => Ok(PluginKind::KubeHunter),
            "kube-bench" | "kubebench" => Ok(PluginKind::KubeBench),
            "polaris" => Ok(PluginKind::Polaris),
            other => Err(Error::Config(format!("unknown plugin '{other}'"))),
        }
    }
}

/// Mode in which the Trivy client operates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrivyMode {
    #[default]
    Standalone,
    ClientServer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerConfig {
    /// Namespace scan jobs run in
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_service_account")]
    pub service_account_name: String,

    #[serde(default)]
    pub scan_job: ScanJobConfig,

    #[serde(default)]
    pub plugin: PluginKind,

    #[serde(default)]
    pub trivy: TrivyConfig,

    #[serde(default)]
    pub kube_bench: KubeBenchConfig,

    #[serde(default)]
    pub kube_hunter: KubeHunterConfig,

    #[serde(default)]
    pub polaris: PolarisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanJobConfig {
    /// Becomes the job's `activeDeadlineSeconds`
    #[serde(default)]
    pub timeout_seconds: Option<i64>,

    #[serde(default = "default_true")]
    pub delete_scan_job: bool,

    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    /// Added to the scan pod template
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default = "default_resync_seconds")]
    pub resync_seconds: u64,
}

impl ScanJobConfig {
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrivyConfig {
    #[serde(default = "default_trivy_image")]
    pub image_ref: String,

    #[serde(default = "default_trivy_severity")]
    pub severity: String,

    #[serde(default)]
    pub mode: TrivyMode,

    #[serde(default = "default_trivy_server_url")]
    pub server_url: String,

    /// Read from the companion Secret, never stored in the ConfigMap. When
    /// set, Trivy containers take `GITHUB_TOKEN` from that Secret.
    #[serde(default, skip_serializing)]
    pub github_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeBenchConfig {
    #[serde(default = "default_kube_bench_image")]
    pub image_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeHunterConfig {
    #[serde(default = "default_kube_hunter_image")]
    pub image_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolarisConfig {
    #[serde(default = "default_polaris_image")]
    pub image_ref: String,

    #[serde(default = "default_polaris_config")]
    pub config_yaml: String,
}

fn default_namespace() -> String {
    APP_NAME.to_string()
}

fn default_service_account() -> String {
    APP_NAME.to_string()
}

fn default_true() -> bool {
    true
}

fn default_resync_seconds() -> u64 {
    30 * 60
}

fn default_trivy_image() -> String {
    "docker.io/aquasec/trivy:0.14.0".to_string()
}

fn default_trivy_severity() -> String {
    "UNKNOWN,LOW,MEDIUM,HIGH,CRITICAL".to_string()
}

fn default_trivy_server_url() -> String {
    "http://trivy-server.trivy-server:4954".to_string()
}

fn default_kube_bench_image() -> String {
    "docker.io/aquasec/kube-bench:0.4.0".to_string()
}

fn default_kube_hunter_image() -> String {
    "docker.io/aquasec/kube-hunter:0.4.0".to_string()
}

fn default_polaris_image() -> String {
    "quay.io/fairwinds/polaris:3.0".to_string()
}

fn default_polaris_config() -> String {
    POLARIS_CONFIG_YAML.to_string()
}

impl Default for ScanJobConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: None,
            delete_scan_job: true,
            tolerations: Vec::new(),
            annotations: BTreeMap::new(),
            resync_seconds: default_resync_seconds(),
        }
    }
}

impl Default for TrivyConfig {
    fn default() -> Self {
        Self {
            image_ref: default_trivy_image(),
            severity: default_trivy_severity(),
            mode: TrivyMode::Standalone,
            server_url: default_trivy_server_url(),
            github_token: None,
        }
    }
}

impl Default for KubeBenchConfig {
    fn default() -> Self {
        Self {
            image_ref: default_kube_bench_image(),
        }
    }
}

impl Default for KubeHunterConfig {
    fn default() -> Self {
        Self {
            image_ref: default_kube_hunter_image(),
        }
    }
}

impl Default for PolarisConfig {
    fn default() -> Self {
        Self {
            image_ref: default_polaris_image(),
            config_yaml: default_polaris_config(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            service_account_name: default_service_account(),
            scan_job: ScanJobConfig::default(),
            plugin: PluginKind::default(),
            trivy: TrivyConfig::default(),
            kube_bench: KubeBenchConfig::default(),
            kube_hunter: KubeHunterConfig::default(),
            polaris: PolarisConfig::default(),
        }
    }
}

impl ScannerConfig {
    /// Validate that configuration has required fields
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.namespace.is_empty() {
            return Err(anyhow::anyhow!("namespace must not be empty"));
        }
        if self.service_account_name.is_empty() {
            return Err(anyhow::anyhow!("serviceAccountName must not be empty"));
        }
        if let Some(timeout) = self.scan_job.timeout_seconds {
            if timeout <= 0 {
                return Err(anyhow::anyhow!(
                    "scanJob.timeoutSeconds must be positive, got {timeout}"
                ));
            }
        }
        if self.scan_job.resync_seconds == 0 {
            return Err(anyhow::anyhow!("scanJob.resyncSeconds must be positive"));
        }
        for (key, image_ref) in [
            ("trivy.imageRef", &self.trivy.image_ref),
            ("kubeBench.imageRef", &self.kube_bench.image_ref),
            ("kubeHunter.imageRef", &self.kube_hunter.image_ref),
            ("polaris.imageRef", &self.polaris.image_ref),
        ] {
            version_from_image_ref(image_ref).map_err(|e| anyhow::anyhow!("{key}: {e}"))?;
        }
        if self.trivy.mode == TrivyMode::ClientServer && self.trivy.server_url.is_empty() {
            return Err(anyhow::anyhow!(
                "trivy.serverUrl is required in ClientServer mode"
            ));
        }
        Ok(())
    }

    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let config: ScannerConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;
        Ok(config)
    }

    /// Load configuration from a `ConfigMap`
    pub async fn from_configmap(
        client: &Client,
        namespace: &str,
        name: &str,
    ) -> Result<Self, anyhow::Error> {
        let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
        let cm = api.get(name).await?;

        let data = cm
            .data
            .ok_or_else(|| anyhow::anyhow!("ConfigMap has no data"))?;
        let config_str = data
            .get(CONFIG_KEY)
            .ok_or_else(|| anyhow::anyhow!("ConfigMap missing {CONFIG_KEY}"))?;

        Ok(serde_yaml::from_str(config_str)?)
    }
}

/// Image identifier of an image reference: the digest when pinned by digest,
/// otherwise the tag, defaulting to `latest`.
pub fn version_from_image_ref(image_ref: &str) -> Result<String> {
    let invalid = || Error::Config(format!("invalid image reference '{image_ref}'"));
    if image_ref.is_empty() || image_ref.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    if let Some((repository, digest)) = image_ref.split_once('@') {
        if repository.is_empty() || !digest.contains(':') {
            return Err(invalid());
        }
        return Ok(digest.to_string());
    }
    // A colon before the last slash belongs to a registry port.
    let last_segment = image_ref.rsplit('/').next().unwrap_or(image_ref);
    match last_segment.split_once(':') {
        Some((name, tag)) if !name.is_empty() && !tag.is_empty() => Ok(tag.to_string()),
        Some(_) => Err(invalid()),
        None if last_segment.is_empty() => Err(invalid()),
        None => Ok("latest".to_string()),
    }
}

/// Manages the ConfigMap and Secret holding the scanner configuration.
#[derive(Clone)]
pub struct ConfigManager {
    client: Client,
    namespace: String,
}

impl ConfigManager {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn metadata(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(BTreeMap::from([(
                LABEL_K8S_APP_MANAGED_BY.to_string(),
                APP_NAME.to_string(),
            )])),
            ..Default::default()
        }
    }

    /// Creates the default ConfigMap and an empty Secret unless they exist.
    pub async fn ensure_default(&self) -> Result<()> {
        let defaults = serde_yaml::to_string(&ScannerConfig {
            namespace: self.namespace.clone(),
            ..ScannerConfig::default()
        })
        .map_err(|e| Error::Config(format!("serializing default config: {e}")))?;

        let cm = ConfigMap {
            metadata: self.metadata(CONFIG_MAP_NAME),
            data: Some(BTreeMap::from([(CONFIG_KEY.to_string(), defaults)])),
            ..Default::default()
        };
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        match configmaps.create(&PostParams::default(), &cm).await {
            Ok(_) => info!(namespace = %self.namespace, "Created default scanner ConfigMap"),
            Err(e) if is_conflict(&e) => {
                debug!(namespace = %self.namespace, "Scanner ConfigMap already exists");
            }
            Err(e) => return Err(e.into()),
        }

        let secret = Secret {
            metadata: self.metadata(SECRET_NAME),
            ..Default::default()
        };
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        match secrets.create(&PostParams::default(), &secret).await {
            Ok(_) => info!(namespace = %self.namespace, "Created scanner Secret"),
            Err(e) if is_conflict(&e) => {
                debug!(namespace = %self.namespace, "Scanner Secret already exists");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Reads the configuration, merging sensitive values from the Secret.
    pub async fn read(&self) -> Result<ScannerConfig> {
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let cm = configmaps.get(CONFIG_MAP_NAME).await?;
        let mut config = match cm.data.as_ref().and_then(|d| d.get(CONFIG_KEY)) {
            Some(raw) => serde_yaml::from_str(raw)
                .map_err(|e| Error::Config(format!("parsing {CONFIG_KEY}: {e}")))?,
            None => ScannerConfig::default(),
        };

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        if let Some(secret) = secrets.get_opt(SECRET_NAME).await? {
            merge_secret(&mut config, &secret);
        }
        Ok(config)
    }

    /// Deletes the ConfigMap and Secret; missing objects are not an error.
    pub async fn delete(&self) -> Result<()> {
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        match configmaps.delete(CONFIG_MAP_NAME, &DeleteParams::default()).await {
            Ok(_) => info!(namespace = %self.namespace, "Deleted scanner ConfigMap"),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        match secrets.delete(SECRET_NAME, &DeleteParams::default()).await {
            Ok(_) => info!(namespace = %self.namespace, "Deleted scanner Secret"),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

fn merge_secret(config: &mut ScannerConfig, secret: &Secret) {
    if let Some(token) = secret
        .data
        .as_ref()
        .and_then(|d| d.get(GITHUB_TOKEN_KEY))
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
        .filter(|t| !t.is_empty())
    {
        config.trivy.github_token = Some(token);
    }
}
