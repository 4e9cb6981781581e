/*
 * 5D Labs Workload Scanner - Security Scan Jobs for Kubernetes Workloads
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Workload scanner core library
//!
//! Runs scanner images as Kubernetes Jobs against workloads, waits for them to
//! finish and turns their output into `PolicyReport` objects owned by the
//! scanned workload.

pub mod config;
pub mod error;
pub mod labels;
pub mod plugin;
pub mod report;
pub mod runner;
pub mod scanner;
pub mod workload;

pub use config::{ConfigManager, PluginKind, ScannerConfig};
pub use error::{Error, Result};
pub use plugin::{Plugin, PluginContext, ScannerPlugin};
pub use report::{PolicyReport, PolicyReportData, ReadWriter, ReportBuilder};
pub use runner::{JobClient, RunnableJob, TaskRunner};
pub use scanner::ScanOrchestrator;
pub use workload::{Kind, ObjectRef, Workload};
