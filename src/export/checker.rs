//! External validator fan-out.
//!
//! After materialization every server directory is checked with the
//! configured config checker (`named-checkconf`) and, for each zone file
//! its `named.conf` references, the zone checker (`named-checkzone`).
//! Checks run concurrently across servers up to the configured bound.
//! Tool output is captured verbatim; any non-zero exit fails the export
//! globally while the archive stays on disk for inspection.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::config::ExporterConfig;
use crate::export::materializer::ExportBundle;
use crate::export::CancelToken;
use crate::zone::named_conf;

#[derive(Debug)]
pub enum CheckError {
    Io { tool: String, error: std::io::Error },
    BadTree { server: String, reason: String },
    Cancelled,
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckError::Io { tool, error } => {
                write!(f, "Failed to run checker tool {}: {}", tool, error)
            }
            CheckError::BadTree { server, reason } => {
                write!(f, "Materialized tree for {} is unreadable: {}", server, reason)
            }
            CheckError::Cancelled => write!(f, "Check stage cancelled"),
        }
    }
}

impl std::error::Error for CheckError {}

type Result<T> = std::result::Result<T, CheckError>;

/// One failed tool invocation, with its output kept verbatim.
#[derive(Debug, Clone)]
pub struct CheckFailure {
    pub tool: String,
    pub subject: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} exited with {:?}: {}",
            self.tool,
            self.subject,
            self.exit_code,
            self.stderr.trim()
        )
    }
}

/// Check outcome for one server directory.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub server: String,
    pub failures: Vec<CheckFailure>,
}

impl CheckReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run the config and zone checkers over every server in the bundle.
pub async fn check_export(
    bundle: &ExportBundle,
    config: &ExporterConfig,
    cancel: &CancelToken,
) -> Result<Vec<CheckReport>> {
    let semaphore = Arc::new(Semaphore::new(config.max_parallel_checks.max(1)));

    let checks = bundle.server_dirs.iter().map(|(server, dir)| {
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|_| CheckError::Cancelled)?;
            check_server(server, dir, config, cancel).await
        }
    });

    let mut reports = Vec::new();
    for result in futures::future::join_all(checks).await {
        reports.push(result?);
    }
    Ok(reports)
}

async fn check_server(
    server: &str,
    dir: &Path,
    config: &ExporterConfig,
    cancel: &CancelToken,
) -> Result<CheckReport> {
    let mut failures = Vec::new();

    let output = run_tool(&config.named_checkconf, &["named.conf"], dir, cancel).await?;
    if !output.status.success() {
        failures.push(failure(&config.named_checkconf, "named.conf", &output));
    }

    // Every zone file the materialized named.conf references gets its own
    // zone check, keyed by the zone origin.
    let conf_path = dir.join("named.conf");
    let conf_text = tokio::fs::read_to_string(&conf_path)
        .await
        .map_err(|e| CheckError::BadTree {
            server: server.to_string(),
            reason: e.to_string(),
        })?;
    let entries = named_conf::parse(&conf_text).map_err(|e| CheckError::BadTree {
        server: server.to_string(),
        reason: e.to_string(),
    })?;
    let conf = named_conf::project(&entries);

    for view in conf.views.values() {
        for (origin, zone) in &view.zones {
            if let Some(file) = &zone.file {
                let output =
                    run_tool(&config.named_checkzone, &[origin.as_str(), file.as_str()], dir, cancel)
                        .await?;
                if !output.status.success() {
                    failures.push(failure(&config.named_checkzone, file, &output));
                }
            }
        }
    }

    if failures.is_empty() {
        log::info!("server {} passed all checks", server);
    } else {
        for fail in &failures {
            log::error!("server {}: {}", server, fail);
        }
    }

    Ok(CheckReport {
        server: server.to_string(),
        failures,
    })
}

async fn run_tool(
    tool: &str,
    args: &[&str],
    dir: &Path,
    cancel: &CancelToken,
) -> Result<std::process::Output> {
    let mut command = Command::new(tool);
    command.args(args).current_dir(dir).kill_on_drop(true);

    tokio::select! {
        _ = cancel.cancelled() => Err(CheckError::Cancelled),
        result = command.output() => result.map_err(|error| CheckError::Io {
            tool: tool.to_string(),
            error,
        }),
    }
}

fn failure(tool: &str, subject: &str, output: &std::process::Output) -> CheckFailure {
    CheckFailure {
        tool: tool.to_string(),
        subject: subject.to_string(),
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }
}
