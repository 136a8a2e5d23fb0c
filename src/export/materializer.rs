//! Tree materializer: executes a build plan into an on-disk tree.
//!
//! For every server in the plan this writes `named.conf`, one zone file
//! per (view, zone) and a `<server>.info` sidecar under a fresh temporary
//! directory, then swaps the whole tree into the configured work root.
//! On success the tree is archived as `dns_tree_<timestamp>-<id>.tar.bz2`
//! and a database snapshot `audit_log_replay_dump-<id>.bz2` is written
//! next to it. On failure the temporary directory is removed and neither
//! artifact is produced.

use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use bzip2::write::BzEncoder;
use bzip2::Compression;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::ExporterConfig;
use crate::export::planner::{ExportPlan, ServerDirective, ViewDirective};
use crate::store::dump::{self, DumpError};
use crate::zone::codec::{emit_zone_file, ZoneCodecError};
use crate::zone::named_conf::{self, ConfEntry};

/// Header line at the top of every generated named.conf.
pub const NAMED_CONF_HEADER: &str = "# This named.conf is autogenerated. Do not edit by hand.";

#[derive(Debug)]
pub enum MaterializeError {
    Io(std::io::Error),
    Codec(ZoneCodecError),
    BadOptionsBlob { what: String, error: named_conf::NamedConfError },
    Dump(DumpError),
}

impl fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaterializeError::Io(e) => write!(f, "Materialization I/O error: {}", e),
            MaterializeError::Codec(e) => write!(f, "{}", e),
            MaterializeError::BadOptionsBlob { what, error } => {
                write!(f, "Unparseable options blob for {}: {}", what, error)
            }
            MaterializeError::Dump(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for MaterializeError {}

impl From<std::io::Error> for MaterializeError {
    fn from(err: std::io::Error) -> Self {
        MaterializeError::Io(err)
    }
}

impl From<ZoneCodecError> for MaterializeError {
    fn from(err: ZoneCodecError) -> Self {
        MaterializeError::Codec(err)
    }
}

impl From<DumpError> for MaterializeError {
    fn from(err: DumpError) -> Self {
        MaterializeError::Dump(err)
    }
}

type Result<T> = std::result::Result<T, MaterializeError>;

/// Artifacts produced by one export run.
#[derive(Debug, Clone)]
pub struct ExportBundle {
    pub audit_id: i64,
    pub tree_root: PathBuf,
    pub server_dirs: Vec<(String, PathBuf)>,
    pub archive_path: PathBuf,
    pub snapshot_path: PathBuf,
}

#[derive(Serialize)]
struct InfoTools {
    named_checkconf: String,
    named_checkzone: String,
    named_compilezone: String,
    tar: String,
}

#[derive(Serialize)]
struct InfoRemote {
    login: String,
    directory: String,
    test_directory: String,
    control_command: String,
}

#[derive(Serialize)]
struct ServerInfo {
    tools: InfoTools,
    remote: InfoRemote,
}

/// Execute a plan: write the tree, swap it into place, archive it and
/// snapshot the database.
pub async fn materialize(
    plan: &ExportPlan,
    config: &ExporterConfig,
    pool: &SqlitePool,
) -> Result<ExportBundle> {
    let root = &config.root_config_dir;
    let parent = root.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    fs::create_dir_all(&parent)?;

    let run_id = Uuid::new_v4();
    let tmp_root = parent.join(format!(".bindforge-tmp-{}", run_id));

    let build_result = build_tree(plan, config, &tmp_root);
    let server_dirs = match build_result {
        Ok(dirs) => dirs,
        Err(e) => {
            let _ = fs::remove_dir_all(&tmp_root);
            return Err(e);
        }
    };

    swap_into_place(&tmp_root, root, run_id).map_err(|e| {
        let _ = fs::remove_dir_all(&tmp_root);
        e
    })?;

    let server_dirs: Vec<(String, PathBuf)> = server_dirs
        .into_iter()
        .map(|(name, _)| {
            let final_dir = root.join(&name);
            (name, final_dir)
        })
        .collect();

    let archive_path = write_archive(plan.audit_id, &config.backup_dir, &server_dirs)?;
    log::info!("wrote tree archive {}", archive_path.display());

    let sql = dump::dump_sql(pool).await?;
    let snapshot_path = dump::write_snapshot(&config.backup_dir, plan.audit_id, &sql)?;
    log::info!("wrote database snapshot {}", snapshot_path.display());

    Ok(ExportBundle {
        audit_id: plan.audit_id,
        tree_root: root.clone(),
        server_dirs,
        archive_path,
        snapshot_path,
    })
}

fn build_tree(
    plan: &ExportPlan,
    config: &ExporterConfig,
    tmp_root: &Path,
) -> Result<Vec<(String, PathBuf)>> {
    fs::create_dir_all(tmp_root)?;
    let mut server_dirs = Vec::new();

    for directive in &plan.server_directives {
        let server_dir = tmp_root.join(&directive.server.name);
        fs::create_dir_all(&server_dir)?;

        let conf_text = assemble_named_conf(directive, config)?;
        fs::write(server_dir.join("named.conf"), conf_text)?;

        for view in &directive.views {
            let view_dir = server_dir.join(&config.named_dir).join(&view.view);
            fs::create_dir_all(&view_dir)?;
            for emission in &view.zones {
                let text = emit_zone_file(&emission.zone.origin, &emission.records)?;
                fs::write(view_dir.join(format!("{}.db", emission.zone.name)), text)?;
            }
        }

        let info = ServerInfo {
            tools: InfoTools {
                named_checkconf: absolute_tool(&config.named_checkconf, "/usr/sbin"),
                named_checkzone: absolute_tool(&config.named_checkzone, "/usr/sbin"),
                named_compilezone: "/usr/sbin/named-compilezone".to_string(),
                tar: "/bin/tar".to_string(),
            },
            remote: InfoRemote {
                login: directive.server.login.clone(),
                directory: directive.server.directory.clone(),
                test_directory: directive.server.test_directory.clone(),
                control_command: directive.server.control_command.clone(),
            },
        };
        let info_text = toml::to_string(&info).map_err(|e| {
            MaterializeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        fs::write(
            server_dir.join(format!("{}.info", directive.server.name)),
            info_text,
        )?;

        server_dirs.push((directive.server.name.clone(), server_dir));
    }

    Ok(server_dirs)
}

/// Assemble named.conf: the set's global options blob verbatim, then acl
/// stanzas for every referenced ACL, then one view block per view in the
/// authoritative order.
fn assemble_named_conf(directive: &ServerDirective, config: &ExporterConfig) -> Result<String> {
    let mut out = String::new();
    out.push_str(NAMED_CONF_HEADER);
    out.push('\n');
    out.push_str(directive.global_options.trim_end());
    out.push('\n');

    let mut acl_names: Vec<&String> = directive
        .views
        .iter()
        .flat_map(|v| v.acls.iter())
        .collect();
    acl_names.sort();
    acl_names.dedup();
    for name in acl_names {
        out.push_str(&named_conf::emit(&[acl_stanza(directive, name)]));
        out.push('\n');
    }

    for view in &directive.views {
        out.push_str(&named_conf::emit(&[view_block(view, config)?]));
        out.push('\n');
    }

    Ok(out)
}

fn acl_stanza(directive: &ServerDirective, name: &str) -> ConfEntry {
    let ranges = directive
        .views
        .iter()
        .find_map(|v| v.acl_ranges.get(name))
        .cloned()
        .unwrap_or_default();
    let children = ranges
        .into_iter()
        .map(|range| {
            if range.allow {
                ConfEntry::flag(range.cidr.to_string())
            } else {
                ConfEntry::flag(format!("!{}", range.cidr))
            }
        })
        .collect();
    ConfEntry::block(format!("acl {}", named_conf::quoted(name)), children)
}

fn view_block(view: &ViewDirective, config: &ExporterConfig) -> Result<ConfEntry> {
    let match_clients = if view.acls.is_empty() {
        vec![ConfEntry::flag("any")]
    } else {
        view.acls
            .iter()
            .map(|name| ConfEntry::flag(named_conf::quoted(name)))
            .collect()
    };

    let mut children = vec![ConfEntry::block("match-clients", match_clients)];

    for emission in &view.zones {
        let mut zone_children = vec![
            ConfEntry::assign("type", emission.zone.zone_type.as_str()),
            ConfEntry::assign(
                "file",
                named_conf::quoted(&format!(
                    "{}/{}/{}.db",
                    config.named_dir, view.view, emission.zone.name
                )),
            ),
        ];
        zone_children.extend(parse_options_blob(
            &emission.zone.options,
            &format!("zone {}", emission.zone.name),
        )?);
        zone_children.extend(parse_options_blob(
            &emission.options,
            &format!("zone {} in view {}", emission.zone.name, view.view),
        )?);
        children.push(ConfEntry::block(
            format!("zone {}", named_conf::quoted(&emission.zone.origin)),
            zone_children,
        ));
    }

    Ok(ConfEntry::block(
        format!("view {}", named_conf::quoted(&view.view)),
        children,
    ))
}

fn parse_options_blob(blob: &str, what: &str) -> Result<Vec<ConfEntry>> {
    if blob.trim().is_empty() {
        return Ok(Vec::new());
    }
    named_conf::parse(blob).map_err(|error| MaterializeError::BadOptionsBlob {
        what: what.to_string(),
        error,
    })
}

fn absolute_tool(tool: &str, default_dir: &str) -> String {
    if tool.starts_with('/') {
        tool.to_string()
    } else {
        format!("{}/{}", default_dir, tool)
    }
}

fn swap_into_place(tmp_root: &Path, root: &Path, run_id: Uuid) -> Result<()> {
    let parent = root.parent().unwrap_or_else(|| Path::new("."));
    let old_root = parent.join(format!(".bindforge-old-{}", run_id));
    if root.exists() {
        fs::rename(root, &old_root)?;
    }
    fs::rename(tmp_root, root)?;
    if old_root.exists() {
        fs::remove_dir_all(&old_root)?;
    }
    Ok(())
}

/// Archive every server directory into a bz2-compressed tarball named
/// after the export timestamp and audit id.
fn write_archive(
    audit_id: i64,
    backup_dir: &Path,
    server_dirs: &[(String, PathBuf)],
) -> Result<PathBuf> {
    fs::create_dir_all(backup_dir)?;
    let timestamp = Utc::now().format("%Y-%m-%d-%H-%M-%S");
    let filename = format!("dns_tree_{}-{}.tar.bz2", timestamp, audit_id);
    let final_path = backup_dir.join(&filename);
    let tmp_path = backup_dir.join(format!(".{}.tmp", filename));

    let file = File::create(&tmp_path)?;
    let encoder = BzEncoder::new(file, Compression::best());
    let mut builder = tar::Builder::new(encoder);
    let mut sorted: Vec<&(String, PathBuf)> = server_dirs.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, dir) in sorted {
        builder.append_dir_all(name, dir)?;
    }
    let encoder = builder.into_inner()?;
    encoder.finish()?;

    fs::rename(&tmp_path, &final_path)?;
    Ok(final_path)
}
