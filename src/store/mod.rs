//! SQLite-backed intent store.
//!
//! The store holds the operator's intent: views, ACLs, zones, records,
//! server sets and their wiring. Mutations go through the audited API
//! surface in [`api`]; the exporter reads through [`StoreSnapshot`], a
//! consistent in-memory copy of the database bound to the audit id that
//! was current when the snapshot was opened.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::zone::record::{RecordArgsError, RecordData, RecordType, StoredRecord};

/// Audited mutating API surface
pub mod api;

/// Append-only audit log
pub mod audit;

/// bz2-compressed SQL dump and restore
pub mod dump;

/// The reserved catch-all view. Implicitly present, never stored.
pub const ANY_VIEW: &str = "any";

#[derive(Debug)]
pub enum StoreError {
    Sqlx(sqlx::Error),
    InvalidRow { table: &'static str, reason: String },
    Args(RecordArgsError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlx(e) => write!(f, "Database error: {}", e),
            StoreError::InvalidRow { table, reason } => {
                write!(f, "Invalid row in table {}: {}", table, reason)
            }
            StoreError::Args(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Sqlx(err)
    }
}

impl From<RecordArgsError> for StoreError {
    fn from(err: RecordArgsError) -> Self {
        StoreError::Args(err)
    }
}

type Result<T> = std::result::Result<T, StoreError>;

/// Schema statements, one per table. Restores and fresh stores both go
/// through this list.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS views (
        name TEXT PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS view_dependencies (
        view_name TEXT NOT NULL,
        depends_on TEXT NOT NULL,
        dep_order INTEGER NOT NULL,
        PRIMARY KEY (view_name, depends_on)
    )",
    "CREATE TABLE IF NOT EXISTS acls (
        name TEXT PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS acl_ranges (
        acl_name TEXT NOT NULL,
        cidr TEXT NOT NULL,
        allow INTEGER NOT NULL,
        PRIMARY KEY (acl_name, cidr)
    )",
    "CREATE TABLE IF NOT EXISTS view_acl_assignments (
        view_name TEXT NOT NULL,
        acl_name TEXT NOT NULL,
        PRIMARY KEY (view_name, acl_name)
    )",
    "CREATE TABLE IF NOT EXISTS zones (
        name TEXT PRIMARY KEY,
        origin TEXT NOT NULL,
        zone_type TEXT NOT NULL,
        options TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS zone_view_assignments (
        zone_name TEXT NOT NULL,
        view_name TEXT NOT NULL,
        options TEXT NOT NULL DEFAULT '',
        allow_missing_soa INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (zone_name, view_name)
    )",
    "CREATE TABLE IF NOT EXISTS records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        zone_name TEXT NOT NULL,
        view_name TEXT NOT NULL,
        target TEXT NOT NULL,
        record_type TEXT NOT NULL,
        ttl INTEGER NOT NULL,
        arguments TEXT NOT NULL,
        last_user TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS dns_servers (
        name TEXT PRIMARY KEY,
        login TEXT NOT NULL,
        directory TEXT NOT NULL,
        test_directory TEXT NOT NULL,
        control_command TEXT NOT NULL DEFAULT 'rndc reload'
    )",
    "CREATE TABLE IF NOT EXISTS dns_server_sets (
        name TEXT PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS dns_server_set_assignments (
        server_name TEXT PRIMARY KEY,
        set_name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS dns_server_set_view_assignments (
        set_name TEXT NOT NULL,
        view_name TEXT NOT NULL,
        view_order INTEGER NOT NULL,
        PRIMARY KEY (set_name, view_name)
    )",
    "CREATE TABLE IF NOT EXISTS named_conf_global_options (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        set_name TEXT NOT NULL,
        options TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS reverse_cidr_assignments (
        zone_name TEXT PRIMARY KEY,
        cidr TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user TEXT NOT NULL,
        action TEXT NOT NULL,
        arguments TEXT NOT NULL,
        success INTEGER NOT NULL,
        timestamp INTEGER NOT NULL
    )",
];

/// Zone service type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneType {
    Master,
    Slave,
    Forward,
    Hint,
}

impl ZoneType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneType::Master => "master",
            ZoneType::Slave => "slave",
            ZoneType::Forward => "forward",
            ZoneType::Hint => "hint",
        }
    }
}

impl FromStr for ZoneType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "master" => Ok(ZoneType::Master),
            "slave" => Ok(ZoneType::Slave),
            "forward" => Ok(ZoneType::Forward),
            "hint" => Ok(ZoneType::Hint),
            other => Err(format!("unknown zone type: {}", other)),
        }
    }
}

impl fmt::Display for ZoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One CIDR range in an ACL, flagged allow or deny.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRange {
    pub cidr: IpNetwork,
    pub allow: bool,
}

/// An authoritative zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneMeta {
    pub name: String,
    pub origin: String,
    pub zone_type: ZoneType,
    pub options: String,
}

/// A zone bound into a view with view-specific options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneViewAssignment {
    pub zone: String,
    pub view: String,
    pub options: String,
    pub allow_missing_soa: bool,
}

/// A managed name server host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsServer {
    pub name: String,
    pub login: String,
    pub directory: String,
    pub test_directory: String,
    pub control_command: String,
}

/// Handle to the intent database. Writers serialize through a single
/// gate; readers take snapshots.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    write_gate: Arc<tokio::sync::Mutex<()>>,
}

impl Store {
    /// Open (or create) the store and bring the schema up.
    pub async fn connect(url: &str) -> Result<Store> {
        // An in-memory database is per-connection; pooling more than one
        // connection would hand out empty databases.
        let max_connections = if url.contains(":memory:") || url.contains("mode=memory") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&pool).await?;
        }
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_zone_view ON records(zone_name, view_name)")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_time ON audit_log(timestamp)")
            .execute(&pool)
            .await?;
        Ok(Store {
            pool,
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) async fn write_gate(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_gate.lock().await
    }

    /// Load a consistent snapshot of the whole store inside one read
    /// transaction.
    pub async fn snapshot(&self) -> Result<StoreSnapshot> {
        let mut tx = self.pool.begin().await?;

        let audit_id: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM audit_log")
                .fetch_one(&mut *tx)
                .await?;

        let mut views = Vec::new();
        for row in sqlx::query("SELECT name FROM views ORDER BY name")
            .fetch_all(&mut *tx)
            .await?
        {
            views.push(row.try_get::<String, _>("name")?);
        }

        let mut view_deps: HashMap<String, Vec<String>> = HashMap::new();
        for row in sqlx::query(
            "SELECT view_name, depends_on FROM view_dependencies ORDER BY view_name, dep_order",
        )
        .fetch_all(&mut *tx)
        .await?
        {
            view_deps
                .entry(row.try_get::<String, _>("view_name")?)
                .or_default()
                .push(row.try_get::<String, _>("depends_on")?);
        }

        let mut acls: BTreeMap<String, Vec<AclRange>> = BTreeMap::new();
        for row in sqlx::query("SELECT name FROM acls ORDER BY name")
            .fetch_all(&mut *tx)
            .await?
        {
            acls.insert(row.try_get::<String, _>("name")?, Vec::new());
        }
        for row in sqlx::query("SELECT acl_name, cidr, allow FROM acl_ranges ORDER BY acl_name, cidr")
            .fetch_all(&mut *tx)
            .await?
        {
            let acl_name: String = row.try_get("acl_name")?;
            let cidr_text: String = row.try_get("cidr")?;
            let cidr = cidr_text
                .parse::<IpNetwork>()
                .map_err(|e| StoreError::InvalidRow {
                    table: "acl_ranges",
                    reason: format!("bad CIDR '{}': {}", cidr_text, e),
                })?;
            let allow: bool = row.try_get("allow")?;
            acls.entry(acl_name).or_default().push(AclRange { cidr, allow });
        }

        let mut view_acls: HashMap<String, Vec<String>> = HashMap::new();
        for row in sqlx::query(
            "SELECT view_name, acl_name FROM view_acl_assignments ORDER BY view_name, acl_name",
        )
        .fetch_all(&mut *tx)
        .await?
        {
            view_acls
                .entry(row.try_get::<String, _>("view_name")?)
                .or_default()
                .push(row.try_get::<String, _>("acl_name")?);
        }

        let mut zones = BTreeMap::new();
        for row in sqlx::query("SELECT name, origin, zone_type, options FROM zones ORDER BY name")
            .fetch_all(&mut *tx)
            .await?
        {
            let name: String = row.try_get("name")?;
            let zone_type_text: String = row.try_get("zone_type")?;
            let zone_type =
                ZoneType::from_str(&zone_type_text).map_err(|reason| StoreError::InvalidRow {
                    table: "zones",
                    reason,
                })?;
            zones.insert(
                name.clone(),
                ZoneMeta {
                    name,
                    origin: row.try_get("origin")?,
                    zone_type,
                    options: row.try_get("options")?,
                },
            );
        }

        let mut zone_views = Vec::new();
        for row in sqlx::query(
            "SELECT zone_name, view_name, options, allow_missing_soa \
             FROM zone_view_assignments ORDER BY zone_name, view_name",
        )
        .fetch_all(&mut *tx)
        .await?
        {
            zone_views.push(ZoneViewAssignment {
                zone: row.try_get("zone_name")?,
                view: row.try_get("view_name")?,
                options: row.try_get("options")?,
                allow_missing_soa: row.try_get("allow_missing_soa")?,
            });
        }

        let mut records = Vec::new();
        for row in sqlx::query(
            "SELECT zone_name, view_name, target, record_type, ttl, arguments, last_user, timestamp \
             FROM records ORDER BY id",
        )
        .fetch_all(&mut *tx)
        .await?
        {
            let type_text: String = row.try_get("record_type")?;
            let rtype = RecordType::from_str(&type_text).map_err(|e| StoreError::InvalidRow {
                table: "records",
                reason: e.to_string(),
            })?;
            let args_text: String = row.try_get("arguments")?;
            let args: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&args_text).map_err(|e| StoreError::InvalidRow {
                    table: "records",
                    reason: format!("bad argument blob: {}", e),
                })?;
            let data = RecordData::from_args(rtype, &args)?;
            let ttl: i64 = row.try_get("ttl")?;
            records.push(StoredRecord {
                zone: row.try_get("zone_name")?,
                view: row.try_get("view_name")?,
                target: row.try_get("target")?,
                ttl: ttl as u32,
                data,
                last_user: row.try_get("last_user")?,
                timestamp: row.try_get("timestamp")?,
            });
        }

        let mut servers = BTreeMap::new();
        for row in sqlx::query(
            "SELECT name, login, directory, test_directory, control_command \
             FROM dns_servers ORDER BY name",
        )
        .fetch_all(&mut *tx)
        .await?
        {
            let name: String = row.try_get("name")?;
            servers.insert(
                name.clone(),
                DnsServer {
                    name,
                    login: row.try_get("login")?,
                    directory: row.try_get("directory")?,
                    test_directory: row.try_get("test_directory")?,
                    control_command: row.try_get("control_command")?,
                },
            );
        }

        let mut server_sets = Vec::new();
        for row in sqlx::query("SELECT name FROM dns_server_sets ORDER BY name")
            .fetch_all(&mut *tx)
            .await?
        {
            server_sets.push(row.try_get::<String, _>("name")?);
        }

        let mut set_assignments: HashMap<String, Vec<String>> = HashMap::new();
        for row in sqlx::query(
            "SELECT server_name, set_name FROM dns_server_set_assignments \
             ORDER BY set_name, server_name",
        )
        .fetch_all(&mut *tx)
        .await?
        {
            set_assignments
                .entry(row.try_get::<String, _>("set_name")?)
                .or_default()
                .push(row.try_get::<String, _>("server_name")?);
        }

        let mut set_views: HashMap<String, Vec<String>> = HashMap::new();
        for row in sqlx::query(
            "SELECT set_name, view_name FROM dns_server_set_view_assignments \
             ORDER BY set_name, view_order",
        )
        .fetch_all(&mut *tx)
        .await?
        {
            set_views
                .entry(row.try_get::<String, _>("set_name")?)
                .or_default()
                .push(row.try_get::<String, _>("view_name")?);
        }

        // Most recent global-options row wins per server set.
        let mut global_options: HashMap<String, String> = HashMap::new();
        for row in sqlx::query(
            "SELECT set_name, options FROM named_conf_global_options ORDER BY timestamp, id",
        )
        .fetch_all(&mut *tx)
        .await?
        {
            global_options.insert(row.try_get("set_name")?, row.try_get("options")?);
        }

        let mut reverse_cidrs: HashMap<String, String> = HashMap::new();
        for row in sqlx::query("SELECT zone_name, cidr FROM reverse_cidr_assignments")
            .fetch_all(&mut *tx)
            .await?
        {
            reverse_cidrs.insert(row.try_get("zone_name")?, row.try_get("cidr")?);
        }

        tx.commit().await?;

        Ok(StoreSnapshot {
            audit_id,
            views,
            view_deps,
            acls,
            view_acls,
            zones,
            zone_views,
            records,
            servers,
            server_sets,
            set_assignments,
            set_views,
            global_options,
            reverse_cidrs,
        })
    }
}

/// A read-only, in-memory view of the store bound to one audit id.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub audit_id: i64,
    views: Vec<String>,
    view_deps: HashMap<String, Vec<String>>,
    acls: BTreeMap<String, Vec<AclRange>>,
    view_acls: HashMap<String, Vec<String>>,
    zones: BTreeMap<String, ZoneMeta>,
    zone_views: Vec<ZoneViewAssignment>,
    records: Vec<StoredRecord>,
    servers: BTreeMap<String, DnsServer>,
    server_sets: Vec<String>,
    set_assignments: HashMap<String, Vec<String>>,
    set_views: HashMap<String, Vec<String>>,
    global_options: HashMap<String, String>,
    reverse_cidrs: HashMap<String, String>,
}

impl StoreSnapshot {
    /// All views, the implicit reserved view included.
    pub fn list_views(&self) -> Vec<String> {
        let mut views = self.views.clone();
        views.push(ANY_VIEW.to_string());
        views.sort();
        views
    }

    pub fn view_exists(&self, view: &str) -> bool {
        view == ANY_VIEW || self.views.iter().any(|v| v == view)
    }

    /// Zones assigned into a view.
    pub fn list_zones(&self, view: &str) -> Vec<&ZoneMeta> {
        self.zone_views
            .iter()
            .filter(|a| a.view == view)
            .filter_map(|a| self.zones.get(&a.zone))
            .collect()
    }

    pub fn get_zone(&self, name: &str) -> Option<&ZoneMeta> {
        self.zones.get(name)
    }

    pub fn zone_view_assignment(&self, zone: &str, view: &str) -> Option<&ZoneViewAssignment> {
        self.zone_views
            .iter()
            .find(|a| a.zone == zone && a.view == view)
    }

    /// Records for one zone in one view, in insertion order.
    pub fn list_records(&self, zone: &str, view: &str) -> Vec<&StoredRecord> {
        self.records
            .iter()
            .filter(|r| r.zone == zone && r.view == view)
            .collect()
    }

    pub fn list_acls(&self) -> &BTreeMap<String, Vec<AclRange>> {
        &self.acls
    }

    /// ACL names bound to a view.
    pub fn view_acls(&self, view: &str) -> Vec<String> {
        self.view_acls.get(view).cloned().unwrap_or_default()
    }

    pub fn list_dns_server_sets(&self) -> &[String] {
        &self.server_sets
    }

    pub fn list_servers_in_set(&self, set: &str) -> Vec<&DnsServer> {
        self.set_assignments
            .get(set)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| self.servers.get(name))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Views in a server set, in the authoritative declared order.
    pub fn list_views_in_set(&self, set: &str) -> Vec<String> {
        self.set_views.get(set).cloned().unwrap_or_default()
    }

    /// Declared dependencies of a view, in declared order. The implicit
    /// self and `any` members are not part of the declared list.
    pub fn list_view_dependencies(&self, view: &str) -> Vec<String> {
        self.view_deps.get(view).cloned().unwrap_or_default()
    }

    pub fn get_global_options(&self, set: &str) -> Option<&str> {
        self.global_options.get(set).map(|s| s.as_str())
    }

    pub fn get_reverse_cidr(&self, zone: &str) -> Option<&str> {
        self.reverse_cidrs.get(zone).map(|s| s.as_str())
    }
}

/// Normalize shorthand CIDR notation (`192.168.0/24`) by padding missing
/// octets, then parse.
pub fn parse_cidr(raw: &str) -> std::result::Result<IpNetwork, String> {
    let normalized = normalize_cidr_text(raw);
    normalized
        .parse::<IpNetwork>()
        .map_err(|e| format!("bad CIDR '{}': {}", raw, e))
}

fn normalize_cidr_text(raw: &str) -> String {
    if raw.contains(':') {
        return raw.to_string();
    }
    let (addr, prefix) = match raw.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (raw, None),
    };
    let mut octets: Vec<&str> = addr.split('.').collect();
    while octets.len() < 4 {
        octets.push("0");
    }
    let padded = octets.join(".");
    match prefix {
        Some(p) => format!("{}/{}", padded, p),
        None => padded,
    }
}
