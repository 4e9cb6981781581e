//! Registry credentials discovered from image pull secrets

use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::{PodSpec, Secret};
use kube::api::Api;
use kube::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
const DOCKER_HUB_SERVER: &str = "index.docker.io";

/// Basic registry credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct DockerAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for DockerAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerConfigEntry>,
}

#[derive(Deserialize)]
struct DockerConfigEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl DockerConfigEntry {
    fn into_auth(self) -> Result<DockerAuth> {
        if let (Some(username), Some(password)) = (self.username, self.password) {
            return Ok(DockerAuth { username, password });
        }
        let encoded = self
            .auth
            .ok_or(Error::MissingField { field: "auths.auth" })?;
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Parse(format!("decoding registry auth: {e}")))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| Error::Parse(format!("registry auth is not UTF-8: {e}")))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| Error::Parse("registry auth must be <username>:<password>".to_string()))?;
        Ok(DockerAuth {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Reads the image pull secrets a pod spec refers to.
#[async_trait]
pub trait SecretsReader: Send + Sync {
    async fn list_image_pull_secrets(&self, spec: &PodSpec, namespace: &str)
        -> Result<Vec<Secret>>;
}

#[derive(Clone)]
pub struct KubeSecretsReader {
    client: Client,
}

impl KubeSecretsReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretsReader for KubeSecretsReader {
    async fn list_image_pull_secrets(
        &self,
        spec: &PodSpec,
        namespace: &str,
    ) -> Result<Vec<Secret>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let mut found = Vec::new();
        for reference in spec.image_pull_secrets.iter().flatten() {
            let name = reference.name.as_str();
            if name.is_empty() {
                continue;
            }
            // A missing pull secret does not stop the scan: public images
            // still scan fine without credentials.
            match secrets.get_opt(name).await? {
                Some(secret) => found.push(secret),
                None => warn!(secret = %name, namespace = %namespace, "Image pull secret not found"),
            }
        }
        debug!(count = found.len(), namespace = %namespace, "Listed image pull secrets");
        Ok(found)
    }
}

/// Registry server an image is pulled from.
pub fn registry_server(image: &str) -> &str {
    match image.split_once('/') {
        Some((first, _))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            first
        }
        _ => DOCKER_HUB_SERVER,
    }
}

fn normalize_server(server: &str) -> &str {
    let server = server
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let server = server.split('/').next().unwrap_or(server);
    match server {
        "docker.io" | "registry-1.docker.io" => DOCKER_HUB_SERVER,
        other => other,
    }
}

/// Registry server to credentials for every `.dockerconfigjson` secret.
pub fn docker_auths_from_secrets(secrets: &[Secret]) -> Result<BTreeMap<String, DockerAuth>> {
    let mut auths = BTreeMap::new();
    for secret in secrets {
        let Some(raw) = secret
            .data
            .as_ref()
            .and_then(|d| d.get(DOCKER_CONFIG_JSON_KEY))
        else {
            continue;
        };
        let config: DockerConfig = serde_json::from_slice(&raw.0)?;
        for (server, entry) in config.auths {
            auths.insert(normalize_server(&server).to_string(), entry.into_auth()?);
        }
    }
    Ok(auths)
}

/// Container name to registry credentials, for containers whose image registry
/// has credentials in one of the secrets.
pub fn map_container_names_to_docker_auths(
    images: &BTreeMap<String, String>,
    secrets: &[Secret],
) -> Result<BTreeMap<String, DockerAuth>> {
    let auths = docker_auths_from_secrets(secrets)?;
    Ok(images
        .iter()
        .filter_map(|(container, image)| {
            auths
                .get(registry_server(image))
                .map(|auth| (container.clone(), auth.clone()))
        })
        .collect())
}
