/*
 * 5D Labs Workload Scanner - Command Line Interface
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

//! Workload Scanner CLI
//!
//! Scans a workload with the configured scanner and stores the resulting
//! `PolicyReport` objects next to it.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use scanner::config::CONFIG_MAP_NAME;
use scanner::report::{KubeReportClient, PolicyReport};
use scanner::workload::KubeWorkloadResolver;
use scanner::{
    ConfigManager, ObjectRef, PluginKind, ReadWriter, ScanOrchestrator, ScannerConfig,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "workload-scanner", version, about = "Scan Kubernetes workloads and store PolicyReports")]
struct Cli {
    /// Namespace of the workload
    #[arg(short, long, global = true, default_value = "default")]
    namespace: String,

    /// Namespace holding the scanner configuration and scan jobs
    #[arg(long, global = true, env = "SCANNER_NAMESPACE", default_value = "starboard")]
    scanner_namespace: String,

    /// Read configuration from a file instead of the scanner ConfigMap
    #[arg(long, global = true, env = "SCANNER_CONFIG")]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a scan job against a workload and write its reports
    Scan {
        /// Workload as <kind>/<name>, e.g. deployment/web
        workload: String,

        /// Scanner to use instead of the configured one
        #[arg(long)]
        plugin: Option<PluginKind>,

        /// Delete the scan job once it finishes
        #[arg(long)]
        delete_scan_job: Option<bool>,

        /// Deadline of the scan job in seconds
        #[arg(long)]
        scan_job_timeout: Option<i64>,
    },
    /// Print the reports of a workload
    Get {
        /// Workload as <kind>/<name>
        workload: String,
    },
    /// Create the default scanner configuration
    Init,
    /// Remove the scanner configuration
    Cleanup,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn load_config(cli: &Cli, client: &kube::Client) -> anyhow::Result<ScannerConfig> {
    if let Some(path) = &cli.config {
        return ScannerConfig::from_mounted_file(path);
    }
    match ConfigManager::new(client.clone(), &cli.scanner_namespace).read().await {
        Ok(config) => Ok(config),
        Err(e) => {
            warn!(
                namespace = %cli.scanner_namespace,
                configmap = CONFIG_MAP_NAME,
                error = %e,
                "Using default configuration"
            );
            Ok(ScannerConfig {
                namespace: cli.scanner_namespace.clone(),
                ..ScannerConfig::default()
            })
        }
    }
}

fn print_reports(reports: &[PolicyReport]) {
    for report in reports {
        let summary = &report.data.summary;
        println!(
            "{} {} {} {} {} {}",
            "▶".cyan(),
            report.metadata.name.as_deref().unwrap_or_default().bold(),
            format!("fail={}", summary.fail).red(),
            format!("warn={}", summary.warn).yellow(),
            format!("pass={}", summary.pass).green(),
            format!("skip={}", summary.skip).bright_black(),
        );
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    match &cli.command {
        Command::Init => {
            ConfigManager::new(client, &cli.scanner_namespace)
                .ensure_default()
                .await?;
            println!("{} {}", "✓".green().bold(), "Scanner configuration initialized".green());
        }
        Command::Cleanup => {
            ConfigManager::new(client, &cli.scanner_namespace).delete().await?;
            println!("{} {}", "✓".green().bold(), "Scanner configuration removed".green());
        }
        Command::Get { workload } => {
            let owner = ObjectRef::parse(workload, &cli.namespace)?;
            let read_writer = ReadWriter::new(
                Arc::new(KubeReportClient::new(client.clone())),
                Arc::new(KubeWorkloadResolver::new(client)),
            );
            let reports = read_writer.find_by_owner_in_hierarchy(&owner).await?;
            if reports.is_empty() {
                println!("{} No reports found for {owner}", "ℹ".blue().bold());
            }
            for report in &reports {
                println!("---\n{}", serde_yaml::to_string(report)?);
            }
        }
        Command::Scan {
            workload,
            plugin,
            delete_scan_job,
            scan_job_timeout,
        } => {
            let owner = ObjectRef::parse(workload, &cli.namespace)?;
            let mut config = load_config(&cli, &client).await?;
            if let Some(plugin) = plugin {
                config.plugin = *plugin;
            }
            if let Some(delete) = delete_scan_job {
                config.scan_job.delete_scan_job = *delete;
            }
            if let Some(timeout) = scan_job_timeout {
                config.scan_job.timeout_seconds = Some(*timeout);
            }
            config.validate()?;

            let orchestrator = ScanOrchestrator::for_cluster(client.clone(), Arc::new(config));
            orchestrator.init().await?;
            let reports = orchestrator.scan(&owner, &cancel).await?;

            let read_writer = ReadWriter::new(
                Arc::new(KubeReportClient::new(client.clone())),
                Arc::new(KubeWorkloadResolver::new(client)),
            );
            read_writer.write(&reports).await?;
            print_reports(&reports);
            println!(
                "{} {}",
                "✓".green().bold(),
                format!("Wrote {} report(s) for {owner}", reports.len()).green()
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    if let Err(e) = run(cli, cancel).await {
        error!("{e:#}");
        return Err(e);
    }
    Ok(())
}
