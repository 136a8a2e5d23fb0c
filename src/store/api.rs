//! Audited mutating API surface over the intent store.
//!
//! Every public method corresponds to one recorded audit action: the call
//! runs inside a single write transaction behind the store-wide write
//! gate, and an audit row is appended with the action name, the positional
//! argument blob and the success flag whether the call succeeded or not.
//! The recovery engine replays these same methods by action name.

use std::str::FromStr;

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;

use crate::store::audit::AuditLog;
use crate::store::{parse_cidr, Store, StoreError, ZoneType, ANY_VIEW};
use crate::zone::record::{validate_target, RecordArgsError, RecordData, RecordType};

#[derive(Debug)]
pub enum ApiError {
    Store(StoreError),
    Args(RecordArgsError),
    NotFound { kind: &'static str, name: String },
    AlreadyExists { kind: &'static str, name: String },
    InUse { kind: &'static str, name: String, detail: String },
    ReservedName(String),
    InvalidName { name: String, reason: String },
    InvalidCidr(String),
    InvalidOrigin(String),
    DuplicateRecord { zone: String, target: String },
    SoaExists { zone: String, view: String },
    SoaInReservedView { zone: String },
    SoaTargetMismatch { zone: String, target: String },
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Store(e) => write!(f, "{}", e),
            ApiError::Args(e) => write!(f, "{}", e),
            ApiError::NotFound { kind, name } => write!(f, "No such {}: {}", kind, name),
            ApiError::AlreadyExists { kind, name } => {
                write!(f, "{} already exists: {}", kind, name)
            }
            ApiError::InUse { kind, name, detail } => {
                write!(f, "{} '{}' is still referenced by {}", kind, name, detail)
            }
            ApiError::ReservedName(name) => write!(f, "'{}' is a reserved name", name),
            ApiError::InvalidName { name, reason } => {
                write!(f, "Invalid name '{}': {}", name, reason)
            }
            ApiError::InvalidCidr(value) => write!(f, "Invalid CIDR: {}", value),
            ApiError::InvalidOrigin(value) => {
                write!(f, "Invalid zone origin '{}': origins must end with '.'", value)
            }
            ApiError::DuplicateRecord { zone, target } => {
                write!(f, "Duplicate record for target '{}' in zone {}", target, zone)
            }
            ApiError::SoaExists { zone, view } => {
                write!(f, "Zone {} already has an SOA record in view {}", zone, view)
            }
            ApiError::SoaInReservedView { zone } => {
                write!(f, "SOA records may not be placed in view 'any' (zone {})", zone)
            }
            ApiError::SoaTargetMismatch { zone, target } => {
                write!(
                    f,
                    "SOA target '{}' does not name the origin of zone {}",
                    target, zone
                )
            }
        }
    }
}

impl std::error::Error for ApiError {}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Store(StoreError::Sqlx(err))
    }
}

impl From<RecordArgsError> for ApiError {
    fn from(err: RecordArgsError) -> Self {
        ApiError::Args(err)
    }
}

type Result<T> = std::result::Result<T, ApiError>;

/// The mutating API surface, bound to the acting user for audit rows.
#[derive(Clone)]
pub struct CoreApi {
    store: Store,
    audit: AuditLog,
    user: String,
}

impl CoreApi {
    pub fn new(store: Store, user: impl Into<String>) -> CoreApi {
        let audit = AuditLog::new(store.pool().clone());
        CoreApi {
            store,
            audit,
            user: user.into(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Append the audit row for a finished call and hand back its result.
    async fn finish(&self, action: &str, args: Vec<Value>, outcome: Result<()>) -> Result<()> {
        let ok = outcome.is_ok();
        match &outcome {
            Ok(()) => log::info!("{} by {} succeeded", action, self.user),
            Err(e) => log::warn!("{} by {} failed: {}", action, self.user, e),
        }
        self.audit.record(&self.user, action, &args, ok).await?;
        outcome
    }

    // --- views -----------------------------------------------------------

    pub async fn make_view(&self, name: &str) -> Result<()> {
        let args = vec![Value::from(name)];
        let outcome = self.apply_make_view(name).await;
        self.finish("MakeView", args, outcome).await
    }

    async fn apply_make_view(&self, name: &str) -> Result<()> {
        check_name(name)?;
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        if exists(&mut tx, "SELECT COUNT(*) FROM views WHERE name = ?1", name).await? {
            return Err(ApiError::AlreadyExists { kind: "view", name: name.to_string() });
        }
        sqlx::query("INSERT INTO views (name) VALUES (?1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn rename_view(&self, old_name: &str, new_name: &str) -> Result<()> {
        let args = vec![Value::from(old_name), Value::from(new_name)];
        let outcome = self.apply_rename_view(old_name, new_name).await;
        self.finish("RenameView", args, outcome).await
    }

    async fn apply_rename_view(&self, old_name: &str, new_name: &str) -> Result<()> {
        check_name(new_name)?;
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        require(&mut tx, "SELECT COUNT(*) FROM views WHERE name = ?1", old_name, "view").await?;
        if exists(&mut tx, "SELECT COUNT(*) FROM views WHERE name = ?1", new_name).await? {
            return Err(ApiError::AlreadyExists { kind: "view", name: new_name.to_string() });
        }
        for statement in [
            "UPDATE views SET name = ?2 WHERE name = ?1",
            "UPDATE view_dependencies SET view_name = ?2 WHERE view_name = ?1",
            "UPDATE view_dependencies SET depends_on = ?2 WHERE depends_on = ?1",
            "UPDATE view_acl_assignments SET view_name = ?2 WHERE view_name = ?1",
            "UPDATE zone_view_assignments SET view_name = ?2 WHERE view_name = ?1",
            "UPDATE records SET view_name = ?2 WHERE view_name = ?1",
            "UPDATE dns_server_set_view_assignments SET view_name = ?2 WHERE view_name = ?1",
        ] {
            sqlx::query(statement)
                .bind(old_name)
                .bind(new_name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_view(&self, name: &str) -> Result<()> {
        let args = vec![Value::from(name)];
        let outcome = self.apply_remove_view(name).await;
        self.finish("RemoveView", args, outcome).await
    }

    async fn apply_remove_view(&self, name: &str) -> Result<()> {
        if name == ANY_VIEW {
            return Err(ApiError::ReservedName(name.to_string()));
        }
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        require(&mut tx, "SELECT COUNT(*) FROM views WHERE name = ?1", name, "view").await?;
        for (sql, what) in [
            ("SELECT COUNT(*) FROM zone_view_assignments WHERE view_name = ?1", "zone assignments"),
            ("SELECT COUNT(*) FROM view_acl_assignments WHERE view_name = ?1", "ACL bindings"),
            (
                "SELECT COUNT(*) FROM dns_server_set_view_assignments WHERE view_name = ?1",
                "server-set view lists",
            ),
        ] {
            if exists(&mut tx, sql, name).await? {
                return Err(ApiError::InUse {
                    kind: "view",
                    name: name.to_string(),
                    detail: what.to_string(),
                });
            }
        }
        sqlx::query("DELETE FROM view_dependencies WHERE view_name = ?1 OR depends_on = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM views WHERE name = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_view_dependencies(&self, view: &str, deps: &[String]) -> Result<()> {
        let args = vec![
            Value::from(view),
            Value::Array(deps.iter().map(|d| Value::from(d.as_str())).collect()),
        ];
        let outcome = self.apply_set_view_dependencies(view, deps).await;
        self.finish("SetViewDependencies", args, outcome).await
    }

    async fn apply_set_view_dependencies(&self, view: &str, deps: &[String]) -> Result<()> {
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        require(&mut tx, "SELECT COUNT(*) FROM views WHERE name = ?1", view, "view").await?;
        for dep in deps {
            if dep != ANY_VIEW && dep != view {
                require(&mut tx, "SELECT COUNT(*) FROM views WHERE name = ?1", dep, "view").await?;
            }
        }
        sqlx::query("DELETE FROM view_dependencies WHERE view_name = ?1")
            .bind(view)
            .execute(&mut *tx)
            .await?;
        for (order, dep) in deps.iter().enumerate() {
            sqlx::query(
                "INSERT INTO view_dependencies (view_name, depends_on, dep_order) \
                 VALUES (?1, ?2, ?3)",
            )
            .bind(view)
            .bind(dep)
            .bind(order as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // --- ACLs ------------------------------------------------------------

    pub async fn make_acl(&self, name: &str) -> Result<()> {
        let args = vec![Value::from(name)];
        let outcome = self.apply_make_acl(name).await;
        self.finish("MakeAcl", args, outcome).await
    }

    async fn apply_make_acl(&self, name: &str) -> Result<()> {
        check_name(name)?;
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        if exists(&mut tx, "SELECT COUNT(*) FROM acls WHERE name = ?1", name).await? {
            return Err(ApiError::AlreadyExists { kind: "ACL", name: name.to_string() });
        }
        sqlx::query("INSERT INTO acls (name) VALUES (?1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn add_acl_range(&self, acl: &str, cidr: &str, allow: bool) -> Result<()> {
        let args = vec![Value::from(acl), Value::from(cidr), Value::from(allow)];
        let outcome = self.apply_add_acl_range(acl, cidr, allow).await;
        self.finish("AddAclRange", args, outcome).await
    }

    async fn apply_add_acl_range(&self, acl: &str, cidr: &str, allow: bool) -> Result<()> {
        let network = parse_cidr(cidr).map_err(|_| ApiError::InvalidCidr(cidr.to_string()))?;
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        require(&mut tx, "SELECT COUNT(*) FROM acls WHERE name = ?1", acl, "ACL").await?;
        sqlx::query("INSERT OR REPLACE INTO acl_ranges (acl_name, cidr, allow) VALUES (?1, ?2, ?3)")
            .bind(acl)
            .bind(network.to_string())
            .bind(allow)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_acl(&self, name: &str) -> Result<()> {
        let args = vec![Value::from(name)];
        let outcome = self.apply_remove_acl(name).await;
        self.finish("RemoveAcl", args, outcome).await
    }

    async fn apply_remove_acl(&self, name: &str) -> Result<()> {
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        require(&mut tx, "SELECT COUNT(*) FROM acls WHERE name = ?1", name, "ACL").await?;
        if exists(
            &mut tx,
            "SELECT COUNT(*) FROM view_acl_assignments WHERE acl_name = ?1",
            name,
        )
        .await?
        {
            return Err(ApiError::InUse {
                kind: "ACL",
                name: name.to_string(),
                detail: "view bindings".to_string(),
            });
        }
        sqlx::query("DELETE FROM acl_ranges WHERE acl_name = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM acls WHERE name = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn assign_acl_to_view(&self, view: &str, acl: &str) -> Result<()> {
        let args = vec![Value::from(view), Value::from(acl)];
        let outcome = self.apply_assign_acl_to_view(view, acl).await;
        self.finish("AssignAclToView", args, outcome).await
    }

    async fn apply_assign_acl_to_view(&self, view: &str, acl: &str) -> Result<()> {
        if view == ANY_VIEW {
            return Err(ApiError::ReservedName(view.to_string()));
        }
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        require(&mut tx, "SELECT COUNT(*) FROM views WHERE name = ?1", view, "view").await?;
        require(&mut tx, "SELECT COUNT(*) FROM acls WHERE name = ?1", acl, "ACL").await?;
        sqlx::query(
            "INSERT OR REPLACE INTO view_acl_assignments (view_name, acl_name) VALUES (?1, ?2)",
        )
        .bind(view)
        .bind(acl)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // --- zones -----------------------------------------------------------

    pub async fn make_zone(
        &self,
        name: &str,
        zone_type: &str,
        origin: &str,
        options: &str,
    ) -> Result<()> {
        let args = vec![
            Value::from(name),
            Value::from(zone_type),
            Value::from(origin),
            Value::from(options),
        ];
        let outcome = self.apply_make_zone(name, zone_type, origin, options).await;
        self.finish("MakeZone", args, outcome).await
    }

    async fn apply_make_zone(
        &self,
        name: &str,
        zone_type: &str,
        origin: &str,
        options: &str,
    ) -> Result<()> {
        check_name(name)?;
        let zone_type = ZoneType::from_str(zone_type)
            .map_err(|reason| ApiError::InvalidName { name: zone_type.to_string(), reason })?;
        if !origin.ends_with('.') || origin.len() < 2 {
            return Err(ApiError::InvalidOrigin(origin.to_string()));
        }
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        if exists(&mut tx, "SELECT COUNT(*) FROM zones WHERE name = ?1", name).await? {
            return Err(ApiError::AlreadyExists { kind: "zone", name: name.to_string() });
        }
        sqlx::query("INSERT INTO zones (name, origin, zone_type, options) VALUES (?1, ?2, ?3, ?4)")
            .bind(name)
            .bind(origin)
            .bind(zone_type.as_str())
            .bind(options)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_zone(&self, name: &str) -> Result<()> {
        let args = vec![Value::from(name)];
        let outcome = self.apply_remove_zone(name).await;
        self.finish("RemoveZone", args, outcome).await
    }

    async fn apply_remove_zone(&self, name: &str) -> Result<()> {
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        require(&mut tx, "SELECT COUNT(*) FROM zones WHERE name = ?1", name, "zone").await?;
        for statement in [
            "DELETE FROM records WHERE zone_name = ?1",
            "DELETE FROM zone_view_assignments WHERE zone_name = ?1",
            "DELETE FROM reverse_cidr_assignments WHERE zone_name = ?1",
            "DELETE FROM zones WHERE name = ?1",
        ] {
            sqlx::query(statement).bind(name).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn assign_zone_to_view(
        &self,
        zone: &str,
        view: &str,
        options: &str,
        allow_missing_soa: bool,
    ) -> Result<()> {
        let args = vec![
            Value::from(zone),
            Value::from(view),
            Value::from(options),
            Value::from(allow_missing_soa),
        ];
        let outcome = self
            .apply_assign_zone_to_view(zone, view, options, allow_missing_soa)
            .await;
        self.finish("AssignZoneToView", args, outcome).await
    }

    async fn apply_assign_zone_to_view(
        &self,
        zone: &str,
        view: &str,
        options: &str,
        allow_missing_soa: bool,
    ) -> Result<()> {
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        require(&mut tx, "SELECT COUNT(*) FROM zones WHERE name = ?1", zone, "zone").await?;
        if view != ANY_VIEW {
            require(&mut tx, "SELECT COUNT(*) FROM views WHERE name = ?1", view, "view").await?;
        }
        sqlx::query(
            "INSERT OR REPLACE INTO zone_view_assignments \
             (zone_name, view_name, options, allow_missing_soa) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(zone)
        .bind(view)
        .bind(options)
        .bind(allow_missing_soa)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_reverse_cidr(&self, zone: &str, cidr: &str) -> Result<()> {
        let args = vec![Value::from(zone), Value::from(cidr)];
        let outcome = self.apply_set_reverse_cidr(zone, cidr).await;
        self.finish("SetReverseCidr", args, outcome).await
    }

    async fn apply_set_reverse_cidr(&self, zone: &str, cidr: &str) -> Result<()> {
        let network = parse_cidr(cidr).map_err(|_| ApiError::InvalidCidr(cidr.to_string()))?;
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        require(&mut tx, "SELECT COUNT(*) FROM zones WHERE name = ?1", zone, "zone").await?;
        sqlx::query(
            "INSERT OR REPLACE INTO reverse_cidr_assignments (zone_name, cidr) VALUES (?1, ?2)",
        )
        .bind(zone)
        .bind(network.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // --- records ---------------------------------------------------------

    pub async fn make_record(
        &self,
        record_type: &str,
        target: &str,
        zone: &str,
        view: &str,
        ttl: u32,
        arguments: &serde_json::Map<String, Value>,
    ) -> Result<()> {
        let args = vec![
            Value::from(record_type),
            Value::from(target),
            Value::from(zone),
            Value::from(view),
            Value::from(ttl),
            Value::Object(arguments.clone()),
        ];
        let outcome = self
            .apply_make_record(record_type, target, zone, view, ttl, arguments)
            .await;
        self.finish("MakeRecord", args, outcome).await
    }

    async fn apply_make_record(
        &self,
        record_type: &str,
        target: &str,
        zone: &str,
        view: &str,
        ttl: u32,
        arguments: &serde_json::Map<String, Value>,
    ) -> Result<()> {
        let rtype = RecordType::from_str(record_type)?;
        validate_target(target)?;
        let data = RecordData::from_args(rtype, arguments)?;

        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        require(&mut tx, "SELECT COUNT(*) FROM zones WHERE name = ?1", zone, "zone").await?;
        if view != ANY_VIEW {
            require(&mut tx, "SELECT COUNT(*) FROM views WHERE name = ?1", view, "view").await?;
        }

        let origin: String = sqlx::query_scalar("SELECT origin FROM zones WHERE name = ?1")
            .bind(zone)
            .fetch_one(&mut *tx)
            .await?;

        if rtype == RecordType::Soa {
            if view == ANY_VIEW {
                return Err(ApiError::SoaInReservedView { zone: zone.to_string() });
            }
            if target != "@" && target != origin {
                return Err(ApiError::SoaTargetMismatch {
                    zone: zone.to_string(),
                    target: target.to_string(),
                });
            }
            let soa_count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM records \
                 WHERE zone_name = ?1 AND view_name = ?2 AND record_type = 'soa'",
            )
            .bind(zone)
            .bind(view)
            .fetch_one(&mut *tx)
            .await?;
            if soa_count > 0 {
                return Err(ApiError::SoaExists {
                    zone: zone.to_string(),
                    view: view.to_string(),
                });
            }
        }

        // Identical records are rejected zone-wide, whatever the view and
        // TTL; `@` and the spelled-out origin compare equal.
        let normalized_target = if target == "@" { origin.clone() } else { target.to_string() };
        let canonical_args = serde_json::to_string(&Value::Object(data.to_args()))
            .map_err(|e| StoreError::InvalidRow {
                table: "records",
                reason: format!("unserializable argument blob: {}", e),
            })?;
        let rows = sqlx::query(
            "SELECT target, arguments FROM records WHERE zone_name = ?1 AND record_type = ?2",
        )
        .bind(zone)
        .bind(rtype.as_str())
        .fetch_all(&mut *tx)
        .await?;
        for row in rows {
            let existing_target: String = row.try_get("target").map_err(StoreError::Sqlx)?;
            let existing_args: String = row.try_get("arguments").map_err(StoreError::Sqlx)?;
            let existing_normalized = if existing_target == "@" {
                origin.clone()
            } else {
                existing_target
            };
            if existing_normalized == normalized_target && existing_args == canonical_args {
                return Err(ApiError::DuplicateRecord {
                    zone: zone.to_string(),
                    target: target.to_string(),
                });
            }
        }

        sqlx::query(
            "INSERT INTO records \
             (zone_name, view_name, target, record_type, ttl, arguments, last_user, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(zone)
        .bind(view)
        .bind(target)
        .bind(rtype.as_str())
        .bind(ttl as i64)
        .bind(canonical_args)
        .bind(&self.user)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_record(
        &self,
        record_type: &str,
        target: &str,
        zone: &str,
        view: &str,
        arguments: &serde_json::Map<String, Value>,
    ) -> Result<()> {
        let args = vec![
            Value::from(record_type),
            Value::from(target),
            Value::from(zone),
            Value::from(view),
            Value::Object(arguments.clone()),
        ];
        let outcome = self
            .apply_remove_record(record_type, target, zone, view, arguments)
            .await;
        self.finish("RemoveRecord", args, outcome).await
    }

    async fn apply_remove_record(
        &self,
        record_type: &str,
        target: &str,
        zone: &str,
        view: &str,
        arguments: &serde_json::Map<String, Value>,
    ) -> Result<()> {
        let rtype = RecordType::from_str(record_type)?;
        let data = RecordData::from_args(rtype, arguments)?;
        let canonical_args = serde_json::to_string(&Value::Object(data.to_args()))
            .map_err(|e| StoreError::InvalidRow {
                table: "records",
                reason: format!("unserializable argument blob: {}", e),
            })?;

        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        let result = sqlx::query(
            "DELETE FROM records WHERE zone_name = ?1 AND view_name = ?2 \
             AND target = ?3 AND record_type = ?4 AND arguments = ?5",
        )
        .bind(zone)
        .bind(view)
        .bind(target)
        .bind(rtype.as_str())
        .bind(canonical_args)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound {
                kind: "record",
                name: format!("{} {} in {}/{}", rtype.as_str(), target, zone, view),
            });
        }
        tx.commit().await?;
        Ok(())
    }

    // --- servers and server sets ----------------------------------------

    pub async fn make_dns_server(
        &self,
        name: &str,
        login: &str,
        directory: &str,
        test_directory: &str,
    ) -> Result<()> {
        let args = vec![
            Value::from(name),
            Value::from(login),
            Value::from(directory),
            Value::from(test_directory),
        ];
        let outcome = self
            .apply_make_dns_server(name, login, directory, test_directory)
            .await;
        self.finish("MakeDnsServer", args, outcome).await
    }

    async fn apply_make_dns_server(
        &self,
        name: &str,
        login: &str,
        directory: &str,
        test_directory: &str,
    ) -> Result<()> {
        check_name(name)?;
        if login.is_empty() || directory.is_empty() || test_directory.is_empty() {
            return Err(ApiError::InvalidName {
                name: name.to_string(),
                reason: "server login and directories must be non-empty".to_string(),
            });
        }
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        if exists(&mut tx, "SELECT COUNT(*) FROM dns_servers WHERE name = ?1", name).await? {
            return Err(ApiError::AlreadyExists { kind: "DNS server", name: name.to_string() });
        }
        sqlx::query(
            "INSERT INTO dns_servers (name, login, directory, test_directory) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(name)
        .bind(login)
        .bind(directory)
        .bind(test_directory)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_dns_server_control_command(&self, name: &str, command: &str) -> Result<()> {
        let args = vec![Value::from(name), Value::from(command)];
        let outcome = self.apply_set_dns_server_control_command(name, command).await;
        self.finish("SetDnsServerControlCommand", args, outcome).await
    }

    async fn apply_set_dns_server_control_command(
        &self,
        name: &str,
        command: &str,
    ) -> Result<()> {
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        require(&mut tx, "SELECT COUNT(*) FROM dns_servers WHERE name = ?1", name, "DNS server")
            .await?;
        sqlx::query("UPDATE dns_servers SET control_command = ?2 WHERE name = ?1")
            .bind(name)
            .bind(command)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_dns_server(&self, name: &str) -> Result<()> {
        let args = vec![Value::from(name)];
        let outcome = self.apply_remove_dns_server(name).await;
        self.finish("RemoveDnsServer", args, outcome).await
    }

    async fn apply_remove_dns_server(&self, name: &str) -> Result<()> {
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        require(&mut tx, "SELECT COUNT(*) FROM dns_servers WHERE name = ?1", name, "DNS server")
            .await?;
        sqlx::query("DELETE FROM dns_server_set_assignments WHERE server_name = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM dns_servers WHERE name = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn make_dns_server_set(&self, name: &str) -> Result<()> {
        let args = vec![Value::from(name)];
        let outcome = self.apply_make_dns_server_set(name).await;
        self.finish("MakeDnsServerSet", args, outcome).await
    }

    async fn apply_make_dns_server_set(&self, name: &str) -> Result<()> {
        check_name(name)?;
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        if exists(&mut tx, "SELECT COUNT(*) FROM dns_server_sets WHERE name = ?1", name).await? {
            return Err(ApiError::AlreadyExists { kind: "server set", name: name.to_string() });
        }
        sqlx::query("INSERT INTO dns_server_sets (name) VALUES (?1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_dns_server_set(&self, name: &str) -> Result<()> {
        let args = vec![Value::from(name)];
        let outcome = self.apply_remove_dns_server_set(name).await;
        self.finish("RemoveDnsServerSet", args, outcome).await
    }

    async fn apply_remove_dns_server_set(&self, name: &str) -> Result<()> {
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        require(&mut tx, "SELECT COUNT(*) FROM dns_server_sets WHERE name = ?1", name, "server set")
            .await?;
        if exists(
            &mut tx,
            "SELECT COUNT(*) FROM dns_server_set_assignments WHERE set_name = ?1",
            name,
        )
        .await?
        {
            return Err(ApiError::InUse {
                kind: "server set",
                name: name.to_string(),
                detail: "server assignments".to_string(),
            });
        }
        sqlx::query("DELETE FROM dns_server_set_view_assignments WHERE set_name = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM named_conf_global_options WHERE set_name = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM dns_server_sets WHERE name = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn assign_dns_server_to_set(&self, server: &str, set: &str) -> Result<()> {
        let args = vec![Value::from(server), Value::from(set)];
        let outcome = self.apply_assign_dns_server_to_set(server, set).await;
        self.finish("AssignDnsServerToSet", args, outcome).await
    }

    async fn apply_assign_dns_server_to_set(&self, server: &str, set: &str) -> Result<()> {
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        require(&mut tx, "SELECT COUNT(*) FROM dns_servers WHERE name = ?1", server, "DNS server")
            .await?;
        require(&mut tx, "SELECT COUNT(*) FROM dns_server_sets WHERE name = ?1", set, "server set")
            .await?;
        // A server belongs to exactly one set.
        if exists(
            &mut tx,
            "SELECT COUNT(*) FROM dns_server_set_assignments WHERE server_name = ?1",
            server,
        )
        .await?
        {
            return Err(ApiError::AlreadyExists {
                kind: "server-set assignment for server",
                name: server.to_string(),
            });
        }
        sqlx::query("INSERT INTO dns_server_set_assignments (server_name, set_name) VALUES (?1, ?2)")
            .bind(server)
            .bind(set)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn assign_view_to_server_set(&self, view: &str, set: &str) -> Result<()> {
        let args = vec![Value::from(view), Value::from(set)];
        let outcome = self.apply_assign_view_to_server_set(view, set).await;
        self.finish("AssignViewToServerSet", args, outcome).await
    }

    async fn apply_assign_view_to_server_set(&self, view: &str, set: &str) -> Result<()> {
        if view == ANY_VIEW {
            return Err(ApiError::ReservedName(view.to_string()));
        }
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        require(&mut tx, "SELECT COUNT(*) FROM views WHERE name = ?1", view, "view").await?;
        require(&mut tx, "SELECT COUNT(*) FROM dns_server_sets WHERE name = ?1", set, "server set")
            .await?;
        let next_order: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(view_order) + 1, 0) \
             FROM dns_server_set_view_assignments WHERE set_name = ?1",
        )
        .bind(set)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO dns_server_set_view_assignments (set_name, view_name, view_order) \
             VALUES (?1, ?2, ?3)",
        )
        .bind(set)
        .bind(view)
        .bind(next_order)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_named_global_options(&self, set: &str, options: &str) -> Result<()> {
        let args = vec![Value::from(set), Value::from(options)];
        let outcome = self.apply_set_named_global_options(set, options).await;
        self.finish("SetNamedGlobalOptions", args, outcome).await
    }

    async fn apply_set_named_global_options(&self, set: &str, options: &str) -> Result<()> {
        let _gate = self.store.write_gate().await;
        let mut tx = self.store.pool().begin().await?;
        require(&mut tx, "SELECT COUNT(*) FROM dns_server_sets WHERE name = ?1", set, "server set")
            .await?;
        sqlx::query(
            "INSERT INTO named_conf_global_options (set_name, options, timestamp) \
             VALUES (?1, ?2, ?3)",
        )
        .bind(set)
        .bind(options)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ApiError::InvalidName {
            name: name.to_string(),
            reason: "empty name".to_string(),
        });
    }
    if name == ANY_VIEW {
        return Err(ApiError::ReservedName(name.to_string()));
    }
    if !name.is_ascii() || name.chars().any(|c| c.is_whitespace()) {
        return Err(ApiError::InvalidName {
            name: name.to_string(),
            reason: "names must be ASCII without whitespace".to_string(),
        });
    }
    Ok(())
}

async fn exists(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    sql: &'static str,
    name: &str,
) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(sql)
        .bind(name)
        .fetch_one(&mut **tx)
        .await?;
    Ok(count > 0)
}

async fn require(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    sql: &'static str,
    name: &str,
    kind: &'static str,
) -> Result<()> {
    if exists(tx, sql, name).await? {
        Ok(())
    } else {
        Err(ApiError::NotFound {
            kind,
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde_json::json;

    async fn api() -> CoreApi {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        CoreApi::new(store, "tester")
    }

    fn obj(v: Value) -> serde_json::Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_make_view_rejects_reserved_and_duplicate() {
        let api = api().await;
        api.make_view("external").await.unwrap();
        assert!(matches!(
            api.make_view("any").await.unwrap_err(),
            ApiError::ReservedName(_)
        ));
        assert!(matches!(
            api.make_view("external").await.unwrap_err(),
            ApiError::AlreadyExists { .. }
        ));
    }

    #[tokio::test]
    async fn test_remove_view_blocked_while_referenced() {
        let api = api().await;
        api.make_view("external").await.unwrap();
        api.make_zone("example.com", "master", "example.com.", "")
            .await
            .unwrap();
        api.assign_zone_to_view("example.com", "external", "", false)
            .await
            .unwrap();
        assert!(matches!(
            api.remove_view("external").await.unwrap_err(),
            ApiError::InUse { .. }
        ));
    }

    #[tokio::test]
    async fn test_every_call_is_audited() {
        let api = api().await;
        api.make_view("external").await.unwrap();
        let _ = api.make_view("any").await; // fails, still audited
        let entries = api.audit().fetch_range(0, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].success);
        assert!(!entries[1].success);
        assert_eq!(entries[1].action, "MakeView");
    }

    #[tokio::test]
    async fn test_soa_rules_enforced_at_ingress() {
        let api = api().await;
        api.make_view("external").await.unwrap();
        api.make_zone("example.com", "master", "example.com.", "")
            .await
            .unwrap();
        api.assign_zone_to_view("example.com", "external", "", false)
            .await
            .unwrap();

        let soa = obj(json!({
            "name_server": "ns1.example.com.",
            "admin_email": "admin.example.com.",
            "serial_number": 1,
            "refresh_seconds": 30,
            "retry_seconds": 30,
            "expiry_seconds": 30,
            "minimum_seconds": 30
        }));

        // SOA in the reserved view is refused.
        assert!(matches!(
            api.make_record("soa", "@", "example.com", "any", 30, &soa)
                .await
                .unwrap_err(),
            ApiError::SoaInReservedView { .. }
        ));

        // SOA target must name the origin.
        assert!(matches!(
            api.make_record("soa", "www", "example.com", "external", 30, &soa)
                .await
                .unwrap_err(),
            ApiError::SoaTargetMismatch { .. }
        ));

        api.make_record("soa", "@", "example.com", "external", 30, &soa)
            .await
            .unwrap();

        // A second SOA in the same view is refused.
        assert!(matches!(
            api.make_record("soa", "@", "example.com", "external", 30, &soa)
                .await
                .unwrap_err(),
            ApiError::SoaExists { .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_record_rejected_across_views() {
        let api = api().await;
        api.make_view("ext").await.unwrap();
        api.make_view("int").await.unwrap();
        api.make_zone("example.com", "master", "example.com.", "")
            .await
            .unwrap();
        api.assign_zone_to_view("example.com", "ext", "", false)
            .await
            .unwrap();
        api.assign_zone_to_view("example.com", "int", "", false)
            .await
            .unwrap();

        let a = obj(json!({"assignment_ip": "10.0.0.1"}));
        api.make_record("a", "www", "example.com", "ext", 60, &a)
            .await
            .unwrap();
        // Same target/type/arguments in another view and with another TTL
        // is still a duplicate.
        assert!(matches!(
            api.make_record("a", "www", "example.com", "int", 999, &a)
                .await
                .unwrap_err(),
            ApiError::DuplicateRecord { .. }
        ));
    }

    #[tokio::test]
    async fn test_server_belongs_to_exactly_one_set() {
        let api = api().await;
        api.make_dns_server("ns1.example.com", "dns", "/var/named", "/tmp/test")
            .await
            .unwrap();
        api.make_dns_server_set("primary").await.unwrap();
        api.make_dns_server_set("secondary").await.unwrap();
        api.assign_dns_server_to_set("ns1.example.com", "primary")
            .await
            .unwrap();
        assert!(matches!(
            api.assign_dns_server_to_set("ns1.example.com", "secondary")
                .await
                .unwrap_err(),
            ApiError::AlreadyExists { .. }
        ));
    }

    #[tokio::test]
    async fn test_view_order_in_set_is_append_only() {
        let api = api().await;
        api.make_view("internal").await.unwrap();
        api.make_view("external").await.unwrap();
        api.make_dns_server_set("primary").await.unwrap();
        api.assign_view_to_server_set("internal", "primary").await.unwrap();
        api.assign_view_to_server_set("external", "primary").await.unwrap();

        let snapshot = api.store().snapshot().await.unwrap();
        assert_eq!(
            snapshot.list_views_in_set("primary"),
            vec!["internal".to_string(), "external".to_string()]
        );
    }

    #[tokio::test]
    async fn test_latest_global_options_win() {
        let api = api().await;
        api.make_dns_server_set("primary").await.unwrap();
        api.set_named_global_options("primary", "options { recursion no; };")
            .await
            .unwrap();
        api.set_named_global_options("primary", "options { recursion yes; };")
            .await
            .unwrap();
        let snapshot = api.store().snapshot().await.unwrap();
        assert_eq!(
            snapshot.get_global_options("primary"),
            Some("options { recursion yes; };")
        );
    }
}
