//! Error taxonomy for the scanner library

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("creating secret {name}: {source}")]
    CreatingSecret {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("creating job {name}: {source}")]
    CreatingJob {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("setting owner reference on secret {name}: {source}")]
    SettingOwnerReference {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("job failed: {reason}: {message}")]
    JobFailed { reason: String, message: String },

    #[error("watch on job {name} closed before a terminal condition was observed")]
    WatchClosed { name: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("getting logs for container {container} of job {job}: {reason}")]
    GettingLogs {
        job: String,
        container: String,
        reason: String,
    },

    #[error("workload kind {kind} has no pod template")]
    NoPodSpec { kind: String },

    #[error("expected label {0} not set")]
    MissingLabel(String),

    #[error("expected annotation {0} not set")]
    MissingAnnotation(String),

    #[error("unknown workload kind: {0}")]
    UnknownKind(String),

    #[error("no replicaset related to {object}: {reason}")]
    NoRelatedReplicaSet { object: String, reason: String },

    #[error("required field '{field}' is missing")]
    MissingField { field: &'static str },

    #[error("parsing scanner output: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap an error with the name of the scan stage that produced it.
    pub fn stage(stage: &'static str, source: Error) -> Self {
        Error::Stage {
            stage,
            source: Box::new(source),
        }
    }

    /// Returns the innermost error, skipping stage wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when a create call collided with an existing object (HTTP 409).
    pub fn is_already_exists(&self) -> bool {
        match self.root() {
            Error::CreatingJob { source, .. }
            | Error::CreatingSecret { source, .. }
            | Error::Kube(source) => is_conflict(source),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }
}

pub(crate) fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Extension for attaching a stage name to any fallible result.
pub trait StageExt<T> {
    fn stage(self, stage: &'static str) -> Result<T>;
}

impl<T, E: Into<Error>> StageExt<T> for std::result::Result<T, E> {
    fn stage(self, stage: &'static str) -> Result<T> {
        self.map_err(|e| Error::stage(stage, e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn already_exists_is_detected_through_stage_wrappers() {
        let err = Error::stage(
            "running scan job",
            Error::CreatingJob {
                name: "scan-policyreport-abc".to_string(),
                source: api_error(409, "AlreadyExists"),
            },
        );
        assert!(err.is_already_exists());
        assert!(err.to_string().starts_with("running scan job: creating job"));
    }

    #[test]
    fn not_found_is_not_a_conflict() {
        let err = Error::Kube(api_error(404, "NotFound"));
        assert!(!err.is_already_exists());
        assert!(is_not_found(&api_error(404, "NotFound")));
    }

    #[test]
    fn job_failure_message_is_verbatim() {
        let err = Error::JobFailed {
            reason: "DeadlineExceeded".to_string(),
            message: "Job was active longer than specified deadline".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "job failed: DeadlineExceeded: Job was active longer than specified deadline"
        );
    }
}
