//! Labels and annotations shared with other tooling.
//!
//! These keys are the only schema surface other components rely on: scan jobs
//! and reports are discovered through them.

pub const LABEL_RESOURCE_KIND: &str = "starboard.resource.kind";
pub const LABEL_RESOURCE_NAME: &str = "starboard.resource.name";
pub const LABEL_RESOURCE_NAMESPACE: &str = "starboard.resource.namespace";
pub const LABEL_CONTAINER_NAME: &str = "starboard.container.name";
pub const LABEL_POD_SPEC_HASH: &str = "pod-spec-hash";
pub const LABEL_POLICY_REPORT_SCANNER: &str = "starboard.policyreport.scanner";
pub const LABEL_K8S_APP_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Label put on secrets created for a scan job so they can be found later.
pub const LABEL_SCAN_JOB_NAME: &str = "starboard.scan-job.name";

/// JSON map of container name to image reference of the scanned workload.
pub const ANNOTATION_CONTAINER_IMAGES: &str = "starboard.container-images";

pub const APP_NAME: &str = "starboard";

/// Label set by the Job controller on every pod it creates.
pub const LABEL_JOB_NAME: &str = "job-name";
