//! Full-database SQL dump and restore.
//!
//! Snapshots are bz2-compressed text files of plain SQL statements, one
//! per line, named `audit_log_replay_dump-<id>.bz2` after the audit id
//! they capture. A restore wipes every table and replays the statements
//! inside a single transaction, so a failed restore leaves the database
//! untouched.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use derive_more::{Display, Error, From};
use sqlx::{Row, SqlitePool};

use crate::store::StoreError;

#[derive(Debug, Display, Error, From)]
pub enum DumpError {
    Io(std::io::Error),
    Store(StoreError),
}

impl From<sqlx::Error> for DumpError {
    fn from(err: sqlx::Error) -> Self {
        DumpError::Store(StoreError::Sqlx(err))
    }
}

type Result<T> = std::result::Result<T, DumpError>;

enum Col {
    Text(&'static str),
    Int(&'static str),
}

impl Col {
    fn name(&self) -> &'static str {
        match self {
            Col::Text(n) | Col::Int(n) => n,
        }
    }
}

/// Dump order and column layout for every table in the store.
const DUMP_TABLES: &[(&str, &[Col], &str)] = &[
    ("views", &[Col::Text("name")], "name"),
    (
        "view_dependencies",
        &[Col::Text("view_name"), Col::Text("depends_on"), Col::Int("dep_order")],
        "view_name, dep_order",
    ),
    ("acls", &[Col::Text("name")], "name"),
    (
        "acl_ranges",
        &[Col::Text("acl_name"), Col::Text("cidr"), Col::Int("allow")],
        "acl_name, cidr",
    ),
    (
        "view_acl_assignments",
        &[Col::Text("view_name"), Col::Text("acl_name")],
        "view_name, acl_name",
    ),
    (
        "zones",
        &[Col::Text("name"), Col::Text("origin"), Col::Text("zone_type"), Col::Text("options")],
        "name",
    ),
    (
        "zone_view_assignments",
        &[
            Col::Text("zone_name"),
            Col::Text("view_name"),
            Col::Text("options"),
            Col::Int("allow_missing_soa"),
        ],
        "zone_name, view_name",
    ),
    (
        "records",
        &[
            Col::Int("id"),
            Col::Text("zone_name"),
            Col::Text("view_name"),
            Col::Text("target"),
            Col::Text("record_type"),
            Col::Int("ttl"),
            Col::Text("arguments"),
            Col::Text("last_user"),
            Col::Int("timestamp"),
        ],
        "id",
    ),
    (
        "dns_servers",
        &[
            Col::Text("name"),
            Col::Text("login"),
            Col::Text("directory"),
            Col::Text("test_directory"),
            Col::Text("control_command"),
        ],
        "name",
    ),
    ("dns_server_sets", &[Col::Text("name")], "name"),
    (
        "dns_server_set_assignments",
        &[Col::Text("server_name"), Col::Text("set_name")],
        "server_name",
    ),
    (
        "dns_server_set_view_assignments",
        &[Col::Text("set_name"), Col::Text("view_name"), Col::Int("view_order")],
        "set_name, view_order",
    ),
    (
        "named_conf_global_options",
        &[Col::Int("id"), Col::Text("set_name"), Col::Text("options"), Col::Int("timestamp")],
        "id",
    ),
    (
        "reverse_cidr_assignments",
        &[Col::Text("zone_name"), Col::Text("cidr")],
        "zone_name",
    ),
    (
        "audit_log",
        &[
            Col::Int("id"),
            Col::Text("user"),
            Col::Text("action"),
            Col::Text("arguments"),
            Col::Int("success"),
            Col::Int("timestamp"),
        ],
        "id",
    ),
];

/// Deterministic snapshot filename for an audit id.
pub fn snapshot_filename(audit_id: i64) -> String {
    format!("audit_log_replay_dump-{}.bz2", audit_id)
}

/// Serialize the full database as SQL text.
pub async fn dump_sql(pool: &SqlitePool) -> Result<String> {
    let mut out = String::new();
    out.push_str("-- bindforge database dump\n");

    let mut tx = pool.begin().await?;
    for (table, cols, order) in DUMP_TABLES {
        let col_names: Vec<&str> = cols.iter().map(|c| c.name()).collect();
        out.push_str(&format!("DELETE FROM {};\n", table));

        let query = format!(
            "SELECT {} FROM {} ORDER BY {}",
            col_names.join(", "),
            table,
            order
        );
        for row in sqlx::query(&query).fetch_all(&mut *tx).await? {
            let mut values = Vec::with_capacity(cols.len());
            for col in cols.iter() {
                match col {
                    Col::Text(name) => {
                        let v: String = row.try_get(*name).map_err(StoreError::Sqlx)?;
                        values.push(sql_quote(&v));
                    }
                    Col::Int(name) => {
                        let v: i64 = row.try_get(*name).map_err(StoreError::Sqlx)?;
                        values.push(v.to_string());
                    }
                }
            }
            out.push_str(&format!(
                "INSERT INTO {} ({}) VALUES ({});\n",
                table,
                col_names.join(", "),
                values.join(", ")
            ));
        }
    }
    tx.commit().await?;

    Ok(out)
}

/// Replay a dump inside one transaction.
pub async fn restore_sql(pool: &SqlitePool, sql: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    for statement in sql.split(";\n") {
        let statement = statement.trim();
        if statement.is_empty() || statement.starts_with("--") {
            continue;
        }
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Write a snapshot file atomically: compress into a temporary sibling,
/// then rename into place.
pub fn write_snapshot(backup_dir: &Path, audit_id: i64, sql: &str) -> Result<PathBuf> {
    fs::create_dir_all(backup_dir)?;
    let final_path = backup_dir.join(snapshot_filename(audit_id));
    let tmp_path = backup_dir.join(format!(".{}.tmp", snapshot_filename(audit_id)));

    let file = File::create(&tmp_path)?;
    let mut encoder = BzEncoder::new(file, Compression::best());
    encoder.write_all(sql.as_bytes())?;
    encoder.finish()?;

    fs::rename(&tmp_path, &final_path)?;
    Ok(final_path)
}

/// Read and decompress a snapshot file.
pub fn read_snapshot(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut decoder = BzDecoder::new(file);
    let mut sql = String::new();
    decoder.read_to_string(&mut sql)?;
    Ok(sql)
}

/// Quote a string as a SQL literal. Newlines are spliced in through
/// `char(10)`/`char(13)` so every emitted statement stays on one line.
fn sql_quote(s: &str) -> String {
    let escaped = s.replace('\'', "''");
    let escaped = escaped.replace('\r', "'||char(13)||'");
    let escaped = escaped.replace('\n', "'||char(10)||'");
    format!("'{}'", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::api::CoreApi;
    use crate::store::Store;
    use serde_json::json;

    #[test]
    fn test_sql_quote_escapes_quotes_and_newlines() {
        assert_eq!(sql_quote("plain"), "'plain'");
        assert_eq!(sql_quote("it's"), "'it''s'");
        assert_eq!(sql_quote("a\nb"), "'a'||char(10)||'b'");
    }

    #[test]
    fn test_snapshot_filename() {
        assert_eq!(snapshot_filename(42), "audit_log_replay_dump-42.bz2");
    }

    async fn populated_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let api = CoreApi::new(store.clone(), "tester");
        api.make_view("external").await.unwrap();
        api.make_zone(
            "example.com",
            "master",
            "example.com.",
            "allow-transfer { none; };\nnotify no;",
        )
        .await
        .unwrap();
        api.assign_zone_to_view("example.com", "external", "", false)
            .await
            .unwrap();
        api.make_record(
            "a",
            "www",
            "example.com",
            "external",
            60,
            json!({"assignment_ip": "10.0.0.1"}).as_object().unwrap(),
        )
        .await
        .unwrap();
        store
    }

    #[tokio::test]
    async fn test_dump_restore_round_trip() {
        let source = populated_store().await;
        let sql = dump_sql(source.pool()).await.unwrap();

        let target = Store::connect("sqlite::memory:").await.unwrap();
        restore_sql(target.pool(), &sql).await.unwrap();

        let snapshot = target.snapshot().await.unwrap();
        assert!(snapshot.view_exists("external"));
        let zone = snapshot.get_zone("example.com").unwrap();
        assert_eq!(zone.origin, "example.com.");
        assert!(zone.options.contains('\n'));
        assert_eq!(snapshot.list_records("example.com", "external").len(), 1);
        // Audit rows travel with the dump.
        assert!(snapshot.audit_id > 0);
    }

    #[tokio::test]
    async fn test_restore_overwrites_existing_state() {
        let source = populated_store().await;
        let sql = dump_sql(source.pool()).await.unwrap();

        let target = Store::connect("sqlite::memory:").await.unwrap();
        let api = CoreApi::new(target.clone(), "tester");
        api.make_view("stale").await.unwrap();

        restore_sql(target.pool(), &sql).await.unwrap();
        let snapshot = target.snapshot().await.unwrap();
        assert!(!snapshot.view_exists("stale"));
        assert!(snapshot.view_exists("external"));
    }

    #[tokio::test]
    async fn test_snapshot_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sql = "-- bindforge database dump\nDELETE FROM views;\n";
        let path = write_snapshot(dir.path(), 7, sql).unwrap();
        assert!(path.ends_with("audit_log_replay_dump-7.bz2"));
        assert_eq!(read_snapshot(&path).unwrap(), sql);
    }
}
