//! Pusher: ship checked server trees to the name servers.
//!
//! Each server push takes a remote advisory lock (an atomic `mkdir` in
//! the remote working directory), transfers the server sub-tree, triggers
//! the server's reload control command, and releases the lock. Transfers
//! retry with exponential backoff and jitter up to the configured cap.
//! A permanently failed server is reported as failed without rolling back
//! the other servers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use tokio::process::Command;

use crate::config::ExporterConfig;
use crate::export::planner::ExportPlan;
use crate::export::CancelToken;
use crate::store::DnsServer;

const PUSH_LOCK_DIR: &str = ".bindforge.push.lock";
const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug)]
pub enum PushError {
    Io { command: String, error: std::io::Error },
    LockHeld { server: String, stderr: String },
    TransferFailed { server: String, attempts: u32, stderr: String },
    ReloadFailed { server: String, stderr: String },
    Cancelled,
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Io { command, error } => {
                write!(f, "Failed to run {}: {}", command, error)
            }
            PushError::LockHeld { server, stderr } => {
                write!(f, "Push lock already held on {}: {}", server, stderr.trim())
            }
            PushError::TransferFailed { server, attempts, stderr } => write!(
                f,
                "Transfer to {} failed after {} attempt(s): {}",
                server,
                attempts,
                stderr.trim()
            ),
            PushError::ReloadFailed { server, stderr } => {
                write!(f, "Reload on {} failed: {}", server, stderr.trim())
            }
            PushError::Cancelled => write!(f, "Push stage cancelled"),
        }
    }
}

impl std::error::Error for PushError {}

/// Push outcome for one server.
#[derive(Debug)]
pub struct PushReport {
    pub server: String,
    pub attempts: u32,
    pub result: Result<(), PushError>,
}

impl PushReport {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Remote command programs; overridable so tests can substitute stubs.
#[derive(Debug, Clone)]
pub struct PushTransport {
    pub ssh_program: String,
    pub scp_program: String,
}

impl Default for PushTransport {
    fn default() -> Self {
        PushTransport {
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
        }
    }
}

/// Push every server of a plan, fanning out across servers up to the
/// configured bound. Per-server failures land in that server's report;
/// they do not stop the rest of the fleet.
pub async fn push_export(
    plan: &ExportPlan,
    tree_root: &Path,
    config: &ExporterConfig,
    transport: &PushTransport,
    cancel: &CancelToken,
) -> Vec<PushReport> {
    let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(
        config.max_parallel_checks.max(1),
    ));

    let pushes = plan.server_directives.iter().map(|directive| {
        let semaphore = semaphore.clone();
        let local_dir = tree_root.join(&directive.server.name);
        async move {
            let cancelled = PushReport {
                server: directive.server.name.clone(),
                attempts: 0,
                result: Err(PushError::Cancelled),
            };
            let _permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => return cancelled,
            };
            if cancel.is_cancelled() {
                return cancelled;
            }
            push_server(&directive.server, &local_dir, config, transport, cancel).await
        }
    });

    futures::future::join_all(pushes).await
}

async fn push_server(
    server: &DnsServer,
    local_dir: &PathBuf,
    config: &ExporterConfig,
    transport: &PushTransport,
    cancel: &CancelToken,
) -> PushReport {
    let mut attempts = 0;
    let result = push_server_inner(server, local_dir, config, transport, cancel, &mut attempts).await;
    match &result {
        Ok(()) => log::info!("pushed tree to {} in {} attempt(s)", server.name, attempts.max(1)),
        Err(e) => log::error!("push to {} failed: {}", server.name, e),
    }
    PushReport {
        server: server.name.clone(),
        attempts,
        result,
    }
}

async fn push_server_inner(
    server: &DnsServer,
    local_dir: &PathBuf,
    config: &ExporterConfig,
    transport: &PushTransport,
    cancel: &CancelToken,
    attempts: &mut u32,
) -> Result<(), PushError> {
    let remote = format!("{}@{}", server.login, server.name);
    let lock_path = format!("{}/{}", server.directory, PUSH_LOCK_DIR);
    let lock_command = format!("mkdir {}", shell_quote(&lock_path));
    let unlock_command = format!("rmdir {}", shell_quote(&lock_path));

    // Advisory lock: mkdir is atomic on the remote side.
    let output = run_remote(
        &transport.ssh_program,
        &[remote.as_str(), lock_command.as_str()],
        cancel,
    )
    .await?;
    if !output.status.success() {
        return Err(PushError::LockHeld {
            server: server.name.clone(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    let push_result = transfer_with_retries(server, local_dir, config, transport, cancel, attempts).await;

    let reload_result = match &push_result {
        Ok(()) => {
            let output = run_remote(
                &transport.ssh_program,
                &[remote.as_str(), server.control_command.as_str()],
                cancel,
            )
            .await;
            match output {
                Ok(out) if out.status.success() => Ok(()),
                Ok(out) => Err(PushError::ReloadFailed {
                    server: server.name.clone(),
                    stderr: String::from_utf8_lossy(&out.stderr).to_string(),
                }),
                Err(e) => Err(e),
            }
        }
        Err(_) => Ok(()),
    };

    // Unlock on every path once the lock was taken.
    let unlock = run_remote(
        &transport.ssh_program,
        &[remote.as_str(), unlock_command.as_str()],
        cancel,
    )
    .await;
    if let Err(e) = unlock {
        log::warn!("failed to release push lock on {}: {}", server.name, e);
    }

    push_result?;
    reload_result
}

async fn transfer_with_retries(
    server: &DnsServer,
    local_dir: &PathBuf,
    config: &ExporterConfig,
    transport: &PushTransport,
    cancel: &CancelToken,
    attempts: &mut u32,
) -> Result<(), PushError> {
    let remote_target = format!("{}@{}:{}/", server.login, server.name, server.directory);
    let local_source = format!("{}/.", local_dir.display());
    let mut last_stderr = String::new();

    while *attempts <= config.push_retries {
        if cancel.is_cancelled() {
            return Err(PushError::Cancelled);
        }
        *attempts += 1;

        let output = run_remote(
            &transport.scp_program,
            &["-r", local_source.as_str(), remote_target.as_str()],
            cancel,
        )
        .await?;
        if output.status.success() {
            return Ok(());
        }
        last_stderr = String::from_utf8_lossy(&output.stderr).to_string();
        log::warn!(
            "transfer to {} failed (attempt {}/{}): {}",
            server.name,
            attempts,
            config.push_retries + 1,
            last_stderr.trim()
        );

        if *attempts <= config.push_retries {
            tokio::time::sleep(backoff_delay(*attempts)).await;
        }
    }

    Err(PushError::TransferFailed {
        server: server.name.clone(),
        attempts: *attempts,
        stderr: last_stderr,
    })
}

async fn run_remote(
    program: &str,
    args: &[&str],
    cancel: &CancelToken,
) -> Result<std::process::Output, PushError> {
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);

    tokio::select! {
        _ = cancel.cancelled() => Err(PushError::Cancelled),
        result = command.output() => result.map_err(|error| PushError::Io {
            command: program.to_string(),
            error,
        }),
    }
}

/// Exponential backoff with a small random jitter, capped.
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = INITIAL_BACKOFF_MS.saturating_mul(1u64 << exponent);
    let capped = base.min(MAX_BACKOFF_MS) as f64;
    let jitter = rand::thread_rng().gen_range(0.0..0.1);
    Duration::from_millis((capped * (1.0 + jitter)) as u64)
}

fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\\''"))
}
