//! Trivy vulnerability scanner

use super::{check_image_ref, decode_json, scanner_container, scanner_pod_spec, PluginContext};
use crate::config::{version_from_image_ref, TrivyMode, SECRET_NAME};
use crate::error::{Error, Result};
use crate::report::{PolicyReportData, PolicyReportResult, ResultStatus, Severity};
use crate::workload::DockerAuth;
use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, PodSpec, Secret, SecretKeySelector};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use std::collections::BTreeMap;
use uuid::Uuid;

const GITHUB_TOKEN_KEY: &str = "trivy.githubToken";

pub(super) fn init(ctx: &PluginContext) -> Result<()> {
    let trivy = &ctx.config().trivy;
    check_image_ref("trivy.imageRef", &trivy.image_ref)?;
    if trivy.mode == TrivyMode::ClientServer && trivy.server_url.is_empty() {
        return Err(Error::Config(
            "trivy.serverUrl is required in ClientServer mode".to_string(),
        ));
    }
    Ok(())
}

pub(super) fn task_spec(
    ctx: &PluginContext,
    spec: &PodSpec,
    credentials: &BTreeMap<String, DockerAuth>,
) -> Result<(PodSpec, Vec<Secret>)> {
    let trivy = &ctx.config().trivy;
    let credentials_secret = format!("trivy-credentials-{}", Uuid::new_v4());
    let mut secret_data = BTreeMap::new();

    let mut containers = Vec::with_capacity(spec.containers.len());
    for workload_container in &spec.containers {
        let name = workload_container.name.as_str();
        let image = workload_container
            .image
            .as_deref()
            .ok_or(Error::MissingField { field: "container.image" })?;

        let mut env = vec![EnvVar {
            name: "TRIVY_SEVERITY".to_string(),
            value: Some(trivy.severity.clone()),
            ..Default::default()
        }];
        if trivy.github_token.is_some() {
            env.push(secret_env("GITHUB_TOKEN", SECRET_NAME, GITHUB_TOKEN_KEY, false));
        }
        if let Some(auth) = credentials.get(name) {
            let username_key = format!("{name}.username");
            let password_key = format!("{name}.password");
            env.push(secret_env("TRIVY_USERNAME", &credentials_secret, &username_key, false));
            env.push(secret_env("TRIVY_PASSWORD", &credentials_secret, &password_key, false));
            secret_data.insert(username_key, auth.username.clone());
            secret_data.insert(password_key, auth.password.clone());
        }

        let args = match trivy.mode {
            TrivyMode::Standalone => vec![
                "--quiet".to_string(),
                "image".to_string(),
                "--format".to_string(),
                "json".to_string(),
                "--no-progress".to_string(),
                image.to_string(),
            ],
            TrivyMode::ClientServer => vec![
                "--quiet".to_string(),
                "client".to_string(),
                "--format".to_string(),
                "json".to_string(),
                "--remote".to_string(),
                trivy.server_url.clone(),
                image.to_string(),
            ],
        };

        let mut container =
            scanner_container(name, &trivy.image_ref, ("100m", "100M"), ("500m", "500M"));
        container.command = Some(vec!["trivy".to_string()]);
        container.args = Some(args);
        container.env = Some(env);
        containers.push(container);
    }

    let secrets = if secret_data.is_empty() {
        Vec::new()
    } else {
        vec![Secret {
            metadata: ObjectMeta {
                name: Some(credentials_secret),
                ..Default::default()
            },
            string_data: Some(secret_data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }]
    };
    Ok((scanner_pod_spec(ctx, containers), secrets))
}

fn secret_env(name: &str, secret: &str, key: &str, optional: bool) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(optional),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Trivy 0.14 prints a list of targets, later releases wrap it in `Results`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Output {
    Targets(Vec<Target>),
    Report {
        #[serde(rename = "Results", default)]
        results: Vec<Target>,
    },
}

#[derive(Deserialize)]
struct Target {
    #[serde(rename = "Target", default)]
    target: String,
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Option<Vec<Vulnerability>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Vulnerability {
    #[serde(rename = "VulnerabilityID")]
    vulnerability_id: String,
    pkg_name: String,
    #[serde(default)]
    installed_version: String,
    #[serde(default)]
    fixed_version: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(rename = "PrimaryURL", default)]
    primary_url: Option<String>,
}

pub(super) fn parse(ctx: &PluginContext, image_ref: &str, output: &[u8]) -> Result<PolicyReportData> {
    let targets = match decode_json::<Output>("trivy", output)? {
        Output::Targets(targets) => targets,
        Output::Report { results } => results,
    };
    let scanner_version = version_from_image_ref(&ctx.config().trivy.image_ref)?;

    let results = targets
        .into_iter()
        .flat_map(|target| {
            let name = target.target;
            target
                .vulnerabilities
                .unwrap_or_default()
                .into_iter()
                .map(move |vulnerability| (name.clone(), vulnerability))
        })
        .map(|(target, vulnerability)| {
            let mut properties = BTreeMap::from([
                ("image".to_string(), image_ref.to_string()),
                ("target".to_string(), target),
                ("installedVersion".to_string(), vulnerability.installed_version),
                ("scanner".to_string(), "trivy".to_string()),
                ("scannerVersion".to_string(), scanner_version.clone()),
            ]);
            if !vulnerability.fixed_version.is_empty() {
                properties.insert("fixedVersion".to_string(), vulnerability.fixed_version);
            }
            if let Some(url) = vulnerability.primary_url {
                properties.insert("primaryURL".to_string(), url);
            }
            PolicyReportResult {
                policy: vulnerability.vulnerability_id,
                rule: Some(vulnerability.pkg_name),
                category: Some("vulnerability".to_string()),
                severity: Severity::from_scanner(&vulnerability.severity),
                result: ResultStatus::Fail,
                message: vulnerability.title,
                properties,
                ..Default::default()
            }
        })
        .collect();
    Ok(PolicyReportData::from_results(results))
}
