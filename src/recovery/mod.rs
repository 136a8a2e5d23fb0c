//! Point-in-time recovery: restore a snapshot, replay the audit tape.
//!
//! Given a target audit id T, the engine picks the most recent database
//! snapshot with id S <= T, restores it inside one transaction, and then
//! replays every audit entry in (S, T] against the API surface, strictly
//! in order. Failed entries are skipped with a note; actions in the
//! forbidden set are skipped because they are filesystem-side-effectful,
//! not database mutations. A single failing replay step aborts recovery.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::export::EXPORT_ACTION;
use crate::store::api::{ApiError, CoreApi};
use crate::store::audit::AuditEntry;
use crate::store::dump::{self, DumpError};
use crate::store::StoreError;

#[derive(Debug)]
pub enum RecoveryError {
    NoSnapshot { target: i64 },
    Dump(DumpError),
    Store(StoreError),
    Io(std::io::Error),
    UnknownReplayAction { id: i64, action: String },
    ArityMismatch { id: i64, action: String, expected: usize, found: usize },
    BadArgument { id: i64, action: String, index: usize, reason: String },
    ReplayFailed { id: i64, action: String, error: ApiError },
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryError::NoSnapshot { target } => {
                write!(f, "No snapshot found at or before audit id {}", target)
            }
            RecoveryError::Dump(e) => write!(f, "{}", e),
            RecoveryError::Store(e) => write!(f, "{}", e),
            RecoveryError::Io(e) => write!(f, "Recovery I/O error: {}", e),
            RecoveryError::UnknownReplayAction { id, action } => {
                write!(f, "Audit entry {} names unknown action {}", id, action)
            }
            RecoveryError::ArityMismatch { id, action, expected, found } => write!(
                f,
                "Audit entry {} ({}) carries {} argument(s), expected {}",
                id, action, found, expected
            ),
            RecoveryError::BadArgument { id, action, index, reason } => write!(
                f,
                "Audit entry {} ({}) has a bad argument at position {}: {}",
                id, action, index, reason
            ),
            RecoveryError::ReplayFailed { id, action, error } => {
                write!(f, "Replay of audit entry {} ({}) failed: {}", id, action, error)
            }
        }
    }
}

impl std::error::Error for RecoveryError {}

impl From<DumpError> for RecoveryError {
    fn from(err: DumpError) -> Self {
        RecoveryError::Dump(err)
    }
}

impl From<StoreError> for RecoveryError {
    fn from(err: StoreError) -> Self {
        RecoveryError::Store(err)
    }
}

impl From<std::io::Error> for RecoveryError {
    fn from(err: std::io::Error) -> Self {
        RecoveryError::Io(err)
    }
}

type Result<T> = std::result::Result<T, RecoveryError>;

lazy_static! {
    /// Replayable actions and their positional argument counts, checked
    /// before dispatch.
    static ref ACTION_ARITIES: HashMap<&'static str, usize> = {
        let mut m = HashMap::new();
        m.insert("MakeView", 1);
        m.insert("RenameView", 2);
        m.insert("RemoveView", 1);
        m.insert("SetViewDependencies", 2);
        m.insert("MakeAcl", 1);
        m.insert("AddAclRange", 3);
        m.insert("RemoveAcl", 1);
        m.insert("AssignAclToView", 2);
        m.insert("MakeZone", 4);
        m.insert("RemoveZone", 1);
        m.insert("AssignZoneToView", 4);
        m.insert("SetReverseCidr", 2);
        m.insert("MakeRecord", 6);
        m.insert("RemoveRecord", 5);
        m.insert("MakeDnsServer", 4);
        m.insert("SetDnsServerControlCommand", 2);
        m.insert("RemoveDnsServer", 1);
        m.insert("MakeDnsServerSet", 1);
        m.insert("RemoveDnsServerSet", 1);
        m.insert("AssignDnsServerToSet", 2);
        m.insert("AssignViewToServerSet", 2);
        m.insert("SetNamedGlobalOptions", 2);
        m
    };

    /// Actions recorded in the audit log whose effect is on the
    /// filesystem, not the database. Replaying them would duplicate
    /// exports, so they are skipped.
    static ref FORBIDDEN_ACTIONS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert(EXPORT_ACTION);
        s
    };

    static ref SNAPSHOT_PATTERN: Regex =
        Regex::new(r"^audit_log_replay_dump-(\d+)\.bz2$").unwrap();
}

/// Summary of one completed recovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySummary {
    pub snapshot_id: i64,
    pub target_id: i64,
    pub replayed: usize,
    pub skipped_failed: usize,
    pub skipped_forbidden: usize,
}

/// Find the newest snapshot with id <= target in the backup directory.
pub fn find_snapshot(backup_dir: &Path, target: i64) -> Result<Option<(i64, PathBuf)>> {
    let mut best: Option<(i64, PathBuf)> = None;
    for entry in std::fs::read_dir(backup_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(captures) = SNAPSHOT_PATTERN.captures(&name) {
            if let Ok(id) = captures[1].parse::<i64>() {
                if id <= target && best.as_ref().map_or(true, |(b, _)| id > *b) {
                    best = Some((id, entry.path()));
                }
            }
        }
    }
    Ok(best)
}

/// Restore the database to the state just after audit id `target`.
pub async fn recover_to(
    api: &CoreApi,
    backup_dir: &Path,
    target: i64,
) -> Result<RecoverySummary> {
    let (snapshot_id, snapshot_path) = find_snapshot(backup_dir, target)?
        .ok_or(RecoveryError::NoSnapshot { target })?;
    log::info!(
        "recovering to audit id {} from snapshot {}",
        target,
        snapshot_path.display()
    );

    // The replay tape must be read before the restore truncates the
    // audit log back to the snapshot point.
    let tape = api.audit().fetch_range(snapshot_id, target).await?;

    let sql = dump::read_snapshot(&snapshot_path)?;
    dump::restore_sql(api.store().pool(), &sql).await?;
    log::info!("restored snapshot {}", snapshot_id);

    let mut summary = RecoverySummary {
        snapshot_id,
        target_id: target,
        replayed: 0,
        skipped_failed: 0,
        skipped_forbidden: 0,
    };

    for entry in tape {
        if !entry.success {
            log::info!(
                "skipping audit entry {} ({}): original call failed",
                entry.id,
                entry.action
            );
            summary.skipped_failed += 1;
            continue;
        }
        if FORBIDDEN_ACTIONS.contains(entry.action.as_str()) {
            log::info!(
                "skipping audit entry {} ({}): action is not replayable",
                entry.id,
                entry.action
            );
            summary.skipped_forbidden += 1;
            continue;
        }
        dispatch(api, &entry).await?;
        summary.replayed += 1;
    }

    log::info!(
        "recovery complete: {} replayed, {} skipped",
        summary.replayed,
        summary.skipped_failed + summary.skipped_forbidden
    );
    Ok(summary)
}

/// Dispatch one audit entry to the API method named by its action.
async fn dispatch(api: &CoreApi, entry: &AuditEntry) -> Result<()> {
    let expected = *ACTION_ARITIES.get(entry.action.as_str()).ok_or_else(|| {
        RecoveryError::UnknownReplayAction {
            id: entry.id,
            action: entry.action.clone(),
        }
    })?;
    if entry.arguments.len() != expected {
        return Err(RecoveryError::ArityMismatch {
            id: entry.id,
            action: entry.action.clone(),
            expected,
            found: entry.arguments.len(),
        });
    }

    let result = match entry.action.as_str() {
        "MakeView" => api.make_view(&str_at(entry, 0)?).await,
        "RenameView" => api.rename_view(&str_at(entry, 0)?, &str_at(entry, 1)?).await,
        "RemoveView" => api.remove_view(&str_at(entry, 0)?).await,
        "SetViewDependencies" => {
            api.set_view_dependencies(&str_at(entry, 0)?, &str_vec_at(entry, 1)?)
                .await
        }
        "MakeAcl" => api.make_acl(&str_at(entry, 0)?).await,
        "AddAclRange" => {
            api.add_acl_range(&str_at(entry, 0)?, &str_at(entry, 1)?, bool_at(entry, 2)?)
                .await
        }
        "RemoveAcl" => api.remove_acl(&str_at(entry, 0)?).await,
        "AssignAclToView" => {
            api.assign_acl_to_view(&str_at(entry, 0)?, &str_at(entry, 1)?).await
        }
        "MakeZone" => {
            api.make_zone(
                &str_at(entry, 0)?,
                &str_at(entry, 1)?,
                &str_at(entry, 2)?,
                &str_at(entry, 3)?,
            )
            .await
        }
        "RemoveZone" => api.remove_zone(&str_at(entry, 0)?).await,
        "AssignZoneToView" => {
            api.assign_zone_to_view(
                &str_at(entry, 0)?,
                &str_at(entry, 1)?,
                &str_at(entry, 2)?,
                bool_at(entry, 3)?,
            )
            .await
        }
        "SetReverseCidr" => {
            api.set_reverse_cidr(&str_at(entry, 0)?, &str_at(entry, 1)?).await
        }
        "MakeRecord" => {
            api.make_record(
                &str_at(entry, 0)?,
                &str_at(entry, 1)?,
                &str_at(entry, 2)?,
                &str_at(entry, 3)?,
                u32_at(entry, 4)?,
                &map_at(entry, 5)?,
            )
            .await
        }
        "RemoveRecord" => {
            api.remove_record(
                &str_at(entry, 0)?,
                &str_at(entry, 1)?,
                &str_at(entry, 2)?,
                &str_at(entry, 3)?,
                &map_at(entry, 4)?,
            )
            .await
        }
        "MakeDnsServer" => {
            api.make_dns_server(
                &str_at(entry, 0)?,
                &str_at(entry, 1)?,
                &str_at(entry, 2)?,
                &str_at(entry, 3)?,
            )
            .await
        }
        "SetDnsServerControlCommand" => {
            api.set_dns_server_control_command(&str_at(entry, 0)?, &str_at(entry, 1)?)
                .await
        }
        "RemoveDnsServer" => api.remove_dns_server(&str_at(entry, 0)?).await,
        "MakeDnsServerSet" => api.make_dns_server_set(&str_at(entry, 0)?).await,
        "RemoveDnsServerSet" => api.remove_dns_server_set(&str_at(entry, 0)?).await,
        "AssignDnsServerToSet" => {
            api.assign_dns_server_to_set(&str_at(entry, 0)?, &str_at(entry, 1)?)
                .await
        }
        "AssignViewToServerSet" => {
            api.assign_view_to_server_set(&str_at(entry, 0)?, &str_at(entry, 1)?)
                .await
        }
        "SetNamedGlobalOptions" => {
            api.set_named_global_options(&str_at(entry, 0)?, &str_at(entry, 1)?)
                .await
        }
        // Unreachable: the arity table gates the action names.
        other => {
            return Err(RecoveryError::UnknownReplayAction {
                id: entry.id,
                action: other.to_string(),
            })
        }
    };

    result.map_err(|error| RecoveryError::ReplayFailed {
        id: entry.id,
        action: entry.action.clone(),
        error,
    })
}

fn bad_arg(entry: &AuditEntry, index: usize, reason: &str) -> RecoveryError {
    RecoveryError::BadArgument {
        id: entry.id,
        action: entry.action.clone(),
        index,
        reason: reason.to_string(),
    }
}

fn str_at(entry: &AuditEntry, index: usize) -> Result<String> {
    match entry.arguments.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(bad_arg(entry, index, "expected a string")),
    }
}

fn bool_at(entry: &AuditEntry, index: usize) -> Result<bool> {
    match entry.arguments.get(index) {
        Some(Value::Bool(b)) => Ok(*b),
        _ => Err(bad_arg(entry, index, "expected a boolean")),
    }
}

fn u32_at(entry: &AuditEntry, index: usize) -> Result<u32> {
    match entry.arguments.get(index) {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| bad_arg(entry, index, "integer out of range")),
        // TTLs recorded by older front ends arrive as numeric strings.
        Some(Value::String(s)) => s
            .trim()
            .parse::<u32>()
            .map_err(|_| bad_arg(entry, index, "expected an unsigned integer")),
        _ => Err(bad_arg(entry, index, "expected an unsigned integer")),
    }
}

fn str_vec_at(entry: &AuditEntry, index: usize) -> Result<Vec<String>> {
    match entry.arguments.get(index) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                _ => Err(bad_arg(entry, index, "expected an array of strings")),
            })
            .collect(),
        _ => Err(bad_arg(entry, index, "expected an array of strings")),
    }
}

fn map_at(entry: &AuditEntry, index: usize) -> Result<serde_json::Map<String, Value>> {
    match entry.arguments.get(index) {
        Some(Value::Object(map)) => Ok(map.clone()),
        _ => Err(bad_arg(entry, index, "expected an argument object")),
    }
}
