//! `PolicyReport` resource (`wgpolicyk8s.io/v1alpha2`)
//!
//! The report payload lives at the top level of the object rather than under
//! `spec`, so the resource is declared by hand instead of through
//! `#[derive(CustomResource)]`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::core::Resource;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

pub const GROUP: &str = "wgpolicyk8s.io";
pub const VERSION: &str = "v1alpha2";
pub const KIND: &str = "PolicyReport";
pub const PLURAL: &str = "policyreports";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PolicyReport {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub data: PolicyReportData,
}

impl PolicyReport {
    pub fn new(metadata: ObjectMeta, data: PolicyReportData) -> Self {
        Self {
            api_version: format!("{GROUP}/{VERSION}"),
            kind: KIND.to_string(),
            metadata,
            data,
        }
    }
}

impl Resource for PolicyReport {
    type DynamicType = ();
    type Scope = k8s_openapi::NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        KIND.into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        PLURAL.into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Scanner findings carried by a report.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyReportData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_selector: Option<LabelSelector>,
    #[serde(default)]
    pub summary: PolicyReportSummary,
    #[serde(default)]
    pub results: Vec<PolicyReportResult>,
}

impl PolicyReportData {
    /// Data with a summary computed from the results.
    pub fn from_results(results: Vec<PolicyReportResult>) -> Self {
        let summary = PolicyReportSummary::tally(&results);
        Self {
            summary,
            results,
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PolicyReportSummary {
    #[serde(default)]
    pub pass: u32,
    #[serde(default)]
    pub fail: u32,
    #[serde(default)]
    pub warn: u32,
    #[serde(default)]
    pub error: u32,
    #[serde(default)]
    pub skip: u32,
}

impl PolicyReportSummary {
    pub fn tally(results: &[PolicyReportResult]) -> Self {
        results.iter().fold(Self::default(), |mut summary, result| {
            match result.result {
                ResultStatus::Pass => summary.pass += 1,
                ResultStatus::Fail => summary.fail += 1,
                ResultStatus::Warn => summary.warn += 1,
                ResultStatus::Error => summary.error += 1,
                ResultStatus::Skip => summary.skip += 1,
            }
            summary
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Pass,
    #[default]
    Fail,
    Warn,
    Error,
    Skip,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Maps scanner specific severity names, case-insensitively.
    pub fn from_scanner(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "critical" => Some(Severity::Critical),
            "high" | "danger" => Some(Severity::High),
            "medium" | "warning" | "warn" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            "info" | "unknown" => Some(Severity::Info),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyReportResult {
    pub policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    pub result: ResultStatus,
    #[serde(default)]
    pub scored: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<ObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

/// Protobuf style timestamp used by the report schema.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self {
            seconds: now.timestamp(),
            nanos: i32::try_from(now.timestamp_subsec_nanos()).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resource_coordinates() {
        assert_eq!(PolicyReport::api_version(&()), "wgpolicyk8s.io/v1alpha2");
        assert_eq!(PolicyReport::plural(&()), "policyreports");
    }

    #[test]
    fn payload_is_flattened_into_the_object() {
        let report = PolicyReport::new(
            ObjectMeta {
                name: Some("deployment-web-app".to_string()),
                ..Default::default()
            },
            PolicyReportData::from_results(vec![PolicyReportResult {
                policy: "CVE-2021-1234".to_string(),
                severity: Some(Severity::High),
                result: ResultStatus::Fail,
                ..Default::default()
            }]),
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["apiVersion"], "wgpolicyk8s.io/v1alpha2");
        assert_eq!(value["kind"], "PolicyReport");
        assert_eq!(value["summary"]["fail"], 1);
        assert_eq!(value["results"][0]["severity"], "high");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn summary_and_results_default_when_absent() {
        let report: PolicyReport = serde_json::from_value(json!({
            "apiVersion": "wgpolicyk8s.io/v1alpha2",
            "kind": "PolicyReport",
            "metadata": { "name": "pod-api-main" }
        }))
        .unwrap();
        assert_eq!(report.data, PolicyReportData::default());
    }

    #[test]
    fn severity_maps_scanner_vocabularies() {
        assert_eq!(Severity::from_scanner("CRITICAL"), Some(Severity::Critical));
        assert_eq!(Severity::from_scanner("danger"), Some(Severity::High));
        assert_eq!(Severity::from_scanner("warning"), Some(Severity::Medium));
        assert_eq!(Severity::from_scanner("bogus"), None);
    }
}
