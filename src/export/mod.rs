//! Export pipeline: snapshot, plan, materialize, check, push.
//!
//! One export run is strictly sequential across stages, so two in-flight
//! exports can never race on the backup or work directories; the process
//! lock enforces the single-writer rule on top. Within the check and push
//! stages, work fans out across servers. The pipeline accepts a
//! cancellation signal between stages; in-flight subprocesses are killed
//! and partial trees roll back through the temp-directory swap.
//!
//! * `planner` - snapshot to build plan, invariant sweep
//! * `materializer` - plan to on-disk tree, archive and snapshot
//! * `checker` - external validator fan-out
//! * `pusher` - remote transfer with retry and backoff
//! * `lock` - process-singleton lock file

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::Config;
use crate::export::checker::{CheckError, CheckReport};
use crate::export::lock::{LockError, ProcessLock};
use crate::export::materializer::{ExportBundle, MaterializeError};
use crate::export::planner::PlanError;
use crate::export::pusher::{PushReport, PushTransport};
use crate::store::audit::AuditLog;
use crate::store::{Store, StoreError};

/// External validator fan-out across server directories
pub mod checker;

/// Process-singleton advisory lock
pub mod lock;

/// Plan execution: trees, archives, snapshots
pub mod materializer;

/// Build-plan computation and invariant checks
pub mod planner;

/// Remote tree transfer and reload
pub mod pusher;

/// Audit action name recorded for a full tree export.
pub const EXPORT_ACTION: &str = "ExportAllBindTrees";

/// Cooperative cancellation signal shared across pipeline stages.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    tx: broadcast::Sender<()>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        let (tx, _) = broadcast::channel(1);
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    /// Signal cancellation to every listener.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait until cancellation is signalled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if self.is_cancelled() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

#[derive(Debug)]
pub enum ExportError {
    Lock(LockError),
    Store(StoreError),
    Plan(PlanError),
    Materialize(MaterializeError),
    Check(CheckError),
    ChecksFailed { reports: Vec<CheckReport> },
    Cancelled,
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportError::Lock(e) => write!(f, "{}", e),
            ExportError::Store(e) => write!(f, "{}", e),
            ExportError::Plan(e) => write!(f, "Export aborted: {}", e),
            ExportError::Materialize(e) => write!(f, "{}", e),
            ExportError::Check(e) => write!(f, "{}", e),
            ExportError::ChecksFailed { reports } => {
                let failed: Vec<&str> = reports
                    .iter()
                    .filter(|r| !r.passed())
                    .map(|r| r.server.as_str())
                    .collect();
                write!(
                    f,
                    "Configuration checks failed on: {} (archive retained for inspection)",
                    failed.join(", ")
                )
            }
            ExportError::Cancelled => write!(f, "Export cancelled"),
        }
    }
}

impl std::error::Error for ExportError {}

impl From<LockError> for ExportError {
    fn from(err: LockError) -> Self {
        ExportError::Lock(err)
    }
}

impl From<StoreError> for ExportError {
    fn from(err: StoreError) -> Self {
        ExportError::Store(err)
    }
}

impl From<PlanError> for ExportError {
    fn from(err: PlanError) -> Self {
        ExportError::Plan(err)
    }
}

impl From<MaterializeError> for ExportError {
    fn from(err: MaterializeError) -> Self {
        ExportError::Materialize(err)
    }
}

impl From<CheckError> for ExportError {
    fn from(err: CheckError) -> Self {
        ExportError::Check(err)
    }
}

/// Everything one export run produced.
#[derive(Debug)]
pub struct ExportOutcome {
    pub bundle: ExportBundle,
    pub check_reports: Vec<CheckReport>,
    pub push_reports: Vec<PushReport>,
}

/// Run the full export pipeline. With `push` false the pipeline stops
/// after a successful check stage, leaving the tree and archive behind.
pub async fn run_export(
    config: &Config,
    store: &Store,
    user: &str,
    push: bool,
    transport: &PushTransport,
    cancel: &CancelToken,
) -> Result<ExportOutcome, ExportError> {
    let audit = AuditLog::new(store.pool().clone());
    let outcome = run_export_inner(config, store, push, transport, cancel).await;

    // The export is itself an audited action; the replay engine skips it
    // by name.
    if let Err(e) = audit
        .record(user, EXPORT_ACTION, &[], outcome.is_ok())
        .await
    {
        log::error!("failed to record export audit entry: {}", e);
    }

    outcome
}

async fn run_export_inner(
    config: &Config,
    store: &Store,
    push: bool,
    transport: &PushTransport,
    cancel: &CancelToken,
) -> Result<ExportOutcome, ExportError> {
    let _lock = ProcessLock::acquire(&config.server.lock_file)?;

    let snapshot = store.snapshot().await?;
    log::info!("exporting at audit id {}", snapshot.audit_id);

    if cancel.is_cancelled() {
        return Err(ExportError::Cancelled);
    }

    let plan = planner::build_plan(&snapshot)?;
    log::info!(
        "plan covers {} server directive(s)",
        plan.server_directives.len()
    );

    if cancel.is_cancelled() {
        return Err(ExportError::Cancelled);
    }

    let bundle = materializer::materialize(&plan, &config.exporter, store.pool()).await?;

    if cancel.is_cancelled() {
        return Err(ExportError::Cancelled);
    }

    let check_reports = checker::check_export(&bundle, &config.exporter, cancel).await?;
    if check_reports.iter().any(|r| !r.passed()) {
        return Err(ExportError::ChecksFailed {
            reports: check_reports,
        });
    }

    let push_reports = if push {
        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        pusher::push_export(&plan, &bundle.tree_root, &config.exporter, transport, cancel).await
    } else {
        Vec::new()
    };

    Ok(ExportOutcome {
        bundle,
        check_reports,
        push_reports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_token_signals_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                true
            })
        };

        token.cancel();
        assert!(token.is_cancelled());
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_after_cancel() {
        let token = CancelToken::new();
        token.cancel();
        // Must not hang even though the broadcast fired before subscribe.
        token.cancelled().await;
    }
}
