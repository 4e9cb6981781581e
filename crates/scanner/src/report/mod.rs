//! Policy reports: resource type, builder and persistence

pub mod builder;
pub mod crd;
pub mod io;

pub use builder::{report_name, ReportBuilder};
pub use crd::{
    PolicyReport, PolicyReportData, PolicyReportResult, PolicyReportSummary, ResultStatus,
    Severity, Timestamp,
};
pub use io::{KubeReportClient, ReadWriter, ReportClient};
