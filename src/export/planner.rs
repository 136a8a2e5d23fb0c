//! Exporter planner: from a store snapshot to a deterministic build plan.
//!
//! The planner is a pure function of the snapshot. It decides which
//! (server set, view, zone) triples to materialize, resolves view
//! dependency inheritance, merges records with view priority, and runs
//! the full invariant sweep. The first violation aborts the plan with an
//! error naming the offending entity; nothing is written before the plan
//! validates.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::store::{parse_cidr, AclRange, DnsServer, StoreSnapshot, ZoneMeta, ANY_VIEW};
use crate::zone::record::{RecordType, ZoneRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    MissingSoa { zone: String, view: String },
    MultipleSoa { zone: String, view: String },
    SoaTargetMismatch { zone: String, view: String, target: String },
    DuplicateRecord { zone: String, target: String, rtype: String },
    MissingReverseCidr { zone: String },
    InvalidReverseCidr { zone: String, cidr: String, reason: String },
    ReverseCidrMismatch { zone: String, cidr: String, expected_origin: String, origin: String },
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::MissingSoa { zone, view } => {
                write!(f, "no SOA for {} in view {}", zone, view)
            }
            PlanError::MultipleSoa { zone, view } => {
                write!(f, "more than one SOA for {} in view {}", zone, view)
            }
            PlanError::SoaTargetMismatch { zone, view, target } => write!(
                f,
                "SOA target '{}' does not name the origin of {} in view {}",
                target, zone, view
            ),
            PlanError::DuplicateRecord { zone, target, rtype } => write!(
                f,
                "duplicate {} record for target '{}' in zone {}",
                rtype, target, zone
            ),
            PlanError::MissingReverseCidr { zone } => {
                write!(f, "reverse zone {} has no CIDR assignment", zone)
            }
            PlanError::InvalidReverseCidr { zone, cidr, reason } => {
                write!(f, "reverse zone {} has invalid CIDR '{}': {}", zone, cidr, reason)
            }
            PlanError::ReverseCidrMismatch { zone, cidr, expected_origin, origin } => write!(
                f,
                "reverse zone {} with CIDR {} should have origin {} but has {}",
                zone, cidr, expected_origin, origin
            ),
        }
    }
}

impl std::error::Error for PlanError {}

type Result<T> = std::result::Result<T, PlanError>;

/// One zone to emit into one view, with merged and validated records.
#[derive(Debug, Clone)]
pub struct ZoneEmission {
    pub zone: ZoneMeta,
    pub options: String,
    pub records: Vec<ZoneRecord>,
}

/// One view block of a server's named.conf.
#[derive(Debug, Clone)]
pub struct ViewDirective {
    pub view: String,
    pub acls: Vec<String>,
    pub acl_ranges: HashMap<String, Vec<AclRange>>,
    pub zones: Vec<ZoneEmission>,
}

/// Everything to materialize for one server.
#[derive(Debug, Clone)]
pub struct ServerDirective {
    pub server: DnsServer,
    pub server_set: String,
    pub global_options: String,
    pub views: Vec<ViewDirective>,
}

/// The full build plan for one export run.
#[derive(Debug, Clone)]
pub struct ExportPlan {
    pub audit_id: i64,
    pub server_directives: Vec<ServerDirective>,
}

/// Compute the build plan for a snapshot.
pub fn build_plan(snapshot: &StoreSnapshot) -> Result<ExportPlan> {
    let mut server_directives = Vec::new();

    for set in snapshot.list_dns_server_sets() {
        let views = snapshot.list_views_in_set(set);
        let servers = snapshot.list_servers_in_set(set);
        let global_options = snapshot.get_global_options(set);

        // A set only exports once it has views, servers and a global
        // options blob.
        let global_options = match (views.is_empty(), servers.is_empty(), global_options) {
            (false, false, Some(options)) => options.to_string(),
            _ => {
                log::debug!("skipping incomplete server set {}", set);
                continue;
            }
        };

        let mut view_directives = Vec::new();
        for view in &views {
            view_directives.push(plan_view(snapshot, view)?);
        }

        for server in servers {
            server_directives.push(ServerDirective {
                server: server.clone(),
                server_set: set.clone(),
                global_options: global_options.clone(),
                views: view_directives.clone(),
            });
        }
    }

    Ok(ExportPlan {
        audit_id: snapshot.audit_id,
        server_directives,
    })
}

fn plan_view(snapshot: &StoreSnapshot, view: &str) -> Result<ViewDirective> {
    let closure = dependency_closure(snapshot, view);
    let mut zones = Vec::new();

    for zone in snapshot.list_zones(view) {
        validate_zone_wide(snapshot, zone)?;
        validate_reverse_cidr(snapshot, zone)?;

        let records = merge_records(snapshot, zone, &closure);

        let assignment = snapshot
            .zone_view_assignment(&zone.name, view)
            .cloned()
            .unwrap_or_else(|| crate::store::ZoneViewAssignment {
                zone: zone.name.clone(),
                view: view.to_string(),
                options: String::new(),
                allow_missing_soa: false,
            });

        let soa_count = records
            .iter()
            .filter(|r| r.data.rtype() == RecordType::Soa)
            .count();
        match soa_count {
            0 if assignment.allow_missing_soa => {
                log::info!(
                    "zone {} in view {} has no SOA and is flagged allow_missing_soa, skipping",
                    zone.name,
                    view
                );
                continue;
            }
            0 => {
                return Err(PlanError::MissingSoa {
                    zone: zone.name.clone(),
                    view: view.to_string(),
                })
            }
            1 => {}
            _ => {
                return Err(PlanError::MultipleSoa {
                    zone: zone.name.clone(),
                    view: view.to_string(),
                })
            }
        }

        for record in &records {
            if record.data.rtype() == RecordType::Soa
                && record.target != "@"
                && record.target != zone.origin
            {
                return Err(PlanError::SoaTargetMismatch {
                    zone: zone.name.clone(),
                    view: view.to_string(),
                    target: record.target.clone(),
                });
            }
        }

        zones.push(ZoneEmission {
            zone: zone.clone(),
            options: assignment.options,
            records,
        });
    }

    let acls = snapshot.view_acls(view);
    let mut acl_ranges = HashMap::new();
    for name in &acls {
        if let Some(ranges) = snapshot.list_acls().get(name) {
            acl_ranges.insert(name.clone(), ranges.clone());
        }
    }

    Ok(ViewDirective {
        view: view.to_string(),
        acls,
        acl_ranges,
        zones,
    })
}

/// Expand a view through its dependency closure. The view itself comes
/// first, declared dependencies follow in order transitively, and the
/// reserved catch-all view is always last.
pub fn dependency_closure(snapshot: &StoreSnapshot, view: &str) -> Vec<String> {
    let mut closure = vec![view.to_string()];
    let mut seen: HashSet<String> = closure.iter().cloned().collect();
    seen.insert(ANY_VIEW.to_string());

    let mut cursor = 0;
    while cursor < closure.len() {
        let current = closure[cursor].clone();
        for dep in snapshot.list_view_dependencies(&current) {
            if seen.insert(dep.clone()) {
                closure.push(dep);
            }
        }
        cursor += 1;
    }

    closure.push(ANY_VIEW.to_string());
    closure
}

/// Merge records for one zone across a view closure. When the same
/// (target, type, arguments) key shows up in several views, the earlier
/// (higher-priority) view wins.
fn merge_records(snapshot: &StoreSnapshot, zone: &ZoneMeta, closure: &[String]) -> Vec<ZoneRecord> {
    let mut merged = Vec::new();
    let mut seen = HashSet::new();

    for view in closure {
        for stored in snapshot.list_records(&zone.name, view) {
            let record = stored.to_zone_record();
            let key = record.dedup_key(&zone.origin);
            if seen.insert(key) {
                merged.push(record);
            }
        }
    }

    merged
}

/// Invariant sweep across every view of a zone: no two records may be
/// identical once TTL, user and view are stripped and `@` is normalized.
fn validate_zone_wide(snapshot: &StoreSnapshot, zone: &ZoneMeta) -> Result<()> {
    let mut seen = HashSet::new();
    for view in snapshot.list_views() {
        for stored in snapshot.list_records(&zone.name, &view) {
            let record = stored.to_zone_record();
            if !seen.insert(record.dedup_key(&zone.origin)) {
                return Err(PlanError::DuplicateRecord {
                    zone: zone.name.clone(),
                    target: record.target.clone(),
                    rtype: record.data.rtype().as_str().to_string(),
                });
            }
        }
    }
    Ok(())
}

fn is_reverse_origin(origin: &str) -> bool {
    let lower = origin.to_ascii_lowercase();
    lower.ends_with(".in-addr.arpa.") || lower.ends_with(".ip6.arpa.")
}

fn validate_reverse_cidr(snapshot: &StoreSnapshot, zone: &ZoneMeta) -> Result<()> {
    if !is_reverse_origin(&zone.origin) {
        return Ok(());
    }
    let cidr_text = snapshot
        .get_reverse_cidr(&zone.name)
        .ok_or_else(|| PlanError::MissingReverseCidr {
            zone: zone.name.clone(),
        })?;
    let network = parse_cidr(cidr_text).map_err(|reason| PlanError::InvalidReverseCidr {
        zone: zone.name.clone(),
        cidr: cidr_text.to_string(),
        reason,
    })?;
    let expected = expected_reverse_origin(&network).ok_or_else(|| {
        PlanError::InvalidReverseCidr {
            zone: zone.name.clone(),
            cidr: cidr_text.to_string(),
            reason: "prefix is not on an octet or nibble boundary".to_string(),
        }
    })?;
    if !zone.origin.eq_ignore_ascii_case(&expected) {
        return Err(PlanError::ReverseCidrMismatch {
            zone: zone.name.clone(),
            cidr: cidr_text.to_string(),
            expected_origin: expected,
            origin: zone.origin.clone(),
        });
    }
    Ok(())
}

/// The reverse-zone origin a CIDR block maps to: reversed significant
/// octets for IPv4 (octet-boundary prefixes), reversed significant
/// nibbles for IPv6 (nibble-boundary prefixes).
pub fn expected_reverse_origin(network: &IpNetwork) -> Option<String> {
    match network.network() {
        IpAddr::V4(addr) => {
            let prefix = network.prefix();
            if prefix == 0 || prefix % 8 != 0 {
                return None;
            }
            let octets = addr.octets();
            let significant = (prefix / 8) as usize;
            let mut parts: Vec<String> = octets[..significant]
                .iter()
                .map(|o| o.to_string())
                .collect();
            parts.reverse();
            Some(format!("{}.in-addr.arpa.", parts.join(".")))
        }
        IpAddr::V6(addr) => {
            let prefix = network.prefix();
            if prefix == 0 || prefix % 4 != 0 {
                return None;
            }
            let significant = (prefix / 4) as usize;
            let mut nibbles: Vec<String> = Vec::with_capacity(32);
            for octet in addr.octets() {
                nibbles.push(format!("{:x}", octet >> 4));
                nibbles.push(format!("{:x}", octet & 0xf));
            }
            nibbles.truncate(significant);
            nibbles.reverse();
            Some(format!("{}.ip6.arpa.", nibbles.join(".")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::api::CoreApi;
    use crate::store::Store;
    use serde_json::json;

    fn obj(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        v.as_object().unwrap().clone()
    }

    fn soa_args() -> serde_json::Map<String, serde_json::Value> {
        obj(json!({
            "name_server": "ns1.example.com.",
            "admin_email": "admin.example.com.",
            "serial_number": 1,
            "refresh_seconds": 30,
            "retry_seconds": 30,
            "expiry_seconds": 30,
            "minimum_seconds": 30
        }))
    }

    /// View `ext`, zone example.com with SOA + NS + A, one server set
    /// with one server.
    async fn exportable_api() -> CoreApi {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let api = CoreApi::new(store, "tester");
        api.make_view("ext").await.unwrap();
        api.make_zone("example.com", "master", "example.com.", "")
            .await
            .unwrap();
        api.assign_zone_to_view("example.com", "ext", "", false)
            .await
            .unwrap();
        api.make_record("soa", "@", "example.com", "ext", 30, &soa_args())
            .await
            .unwrap();
        api.make_record(
            "ns",
            "@",
            "example.com",
            "ext",
            60,
            json!({"name_server": "ns1.example.com."}).as_object().unwrap(),
        )
        .await
        .unwrap();
        api.make_record(
            "a",
            "www",
            "example.com",
            "ext",
            60,
            json!({"assignment_ip": "10.0.0.1"}).as_object().unwrap(),
        )
        .await
        .unwrap();
        api.make_dns_server("ns1.example.com", "dns", "/var/named", "/tmp/dns-test")
            .await
            .unwrap();
        api.make_dns_server_set("primary").await.unwrap();
        api.assign_dns_server_to_set("ns1.example.com", "primary")
            .await
            .unwrap();
        api.assign_view_to_server_set("ext", "primary").await.unwrap();
        api.set_named_global_options("primary", "options { directory \"/var/named\"; };")
            .await
            .unwrap();
        api
    }

    #[tokio::test]
    async fn test_plan_simple_forward_zone() {
        let api = exportable_api().await;
        let snapshot = api.store().snapshot().await.unwrap();
        let plan = build_plan(&snapshot).unwrap();

        assert_eq!(plan.server_directives.len(), 1);
        let directive = &plan.server_directives[0];
        assert_eq!(directive.server.name, "ns1.example.com");
        assert_eq!(directive.views.len(), 1);
        let view = &directive.views[0];
        assert_eq!(view.view, "ext");
        assert_eq!(view.zones.len(), 1);
        assert_eq!(view.zones[0].zone.name, "example.com");
        assert_eq!(view.zones[0].records.len(), 3);
    }

    #[tokio::test]
    async fn test_incomplete_sets_are_skipped() {
        let api = exportable_api().await;
        // A second set with no servers, views or options must not plan.
        api.make_dns_server_set("empty").await.unwrap();
        let snapshot = api.store().snapshot().await.unwrap();
        let plan = build_plan(&snapshot).unwrap();
        assert_eq!(plan.server_directives.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_soa_aborts_plan() {
        let api = exportable_api().await;
        api.remove_record("soa", "@", "example.com", "ext", &soa_args())
            .await
            .unwrap();
        let snapshot = api.store().snapshot().await.unwrap();
        let err = build_plan(&snapshot).unwrap_err();
        assert_eq!(
            err.to_string(),
            "no SOA for example.com in view ext"
        );
    }

    #[tokio::test]
    async fn test_duplicate_record_aborts_plan() {
        let api = exportable_api().await;
        // The API refuses duplicates, so inject one behind its back to
        // prove the planner re-validates the snapshot.
        sqlx::query(
            "INSERT INTO records \
             (zone_name, view_name, target, record_type, ttl, arguments, last_user, timestamp) \
             SELECT zone_name, view_name, target, record_type, 999, arguments, 'intruder', 0 \
             FROM records WHERE target = 'www'",
        )
        .execute(api.store().pool())
        .await
        .unwrap();

        let snapshot = api.store().snapshot().await.unwrap();
        let err = build_plan(&snapshot).unwrap_err();
        match err {
            PlanError::DuplicateRecord { target, .. } => assert_eq!(target, "www"),
            other => panic!("expected duplicate record error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_view_dependency_merging() {
        let api = exportable_api().await;
        api.make_view("int").await.unwrap();
        api.assign_zone_to_view("example.com", "int", "", false)
            .await
            .unwrap();
        api.assign_view_to_server_set("int", "primary").await.unwrap();
        // NS defined only in the reserved view is inherited everywhere.
        api.make_record(
            "ns",
            "@",
            "example.com",
            "any",
            60,
            json!({"name_server": "ns9.example.com."}).as_object().unwrap(),
        )
        .await
        .unwrap();
        // The int view needs its own SOA.
        let mut int_soa = soa_args();
        int_soa.insert("serial_number".into(), json!(2));
        api.make_record("soa", "@", "example.com", "int", 30, &int_soa)
            .await
            .unwrap();

        let snapshot = api.store().snapshot().await.unwrap();
        let plan = build_plan(&snapshot).unwrap();
        let views = &plan.server_directives[0].views;
        assert_eq!(views.len(), 2);

        for view in views {
            let records = &view.zones[0].records;
            let inherited = records.iter().any(|r| {
                matches!(&r.data, crate::zone::record::RecordData::Ns { name_server }
                    if name_server == "ns9.example.com.")
            });
            assert!(inherited, "view {} should inherit the ns9 record", view.view);
        }
    }

    #[tokio::test]
    async fn test_reverse_zone_requires_consistent_cidr() {
        let api = exportable_api().await;
        api.make_zone(
            "reverse-192-168-0",
            "master",
            "0.168.192.in-addr.arpa.",
            "",
        )
        .await
        .unwrap();
        api.assign_zone_to_view("reverse-192-168-0", "ext", "", false)
            .await
            .unwrap();
        api.make_record("soa", "@", "reverse-192-168-0", "ext", 30, &soa_args())
            .await
            .unwrap();

        // No CIDR assignment: abort.
        let snapshot = api.store().snapshot().await.unwrap();
        assert!(matches!(
            build_plan(&snapshot).unwrap_err(),
            PlanError::MissingReverseCidr { .. }
        ));

        // Mismatched CIDR: abort.
        api.set_reverse_cidr("reverse-192-168-0", "10.0.0/24").await.unwrap();
        let snapshot = api.store().snapshot().await.unwrap();
        assert!(matches!(
            build_plan(&snapshot).unwrap_err(),
            PlanError::ReverseCidrMismatch { .. }
        ));

        // Matching shorthand CIDR: plans.
        api.set_reverse_cidr("reverse-192-168-0", "192.168.0/24").await.unwrap();
        let snapshot = api.store().snapshot().await.unwrap();
        assert!(build_plan(&snapshot).is_ok());
    }

    #[test]
    fn test_expected_reverse_origin_v4() {
        let network: IpNetwork = "192.168.0.0/24".parse().unwrap();
        assert_eq!(
            expected_reverse_origin(&network).unwrap(),
            "0.168.192.in-addr.arpa."
        );
        let network: IpNetwork = "10.0.0.0/8".parse().unwrap();
        assert_eq!(expected_reverse_origin(&network).unwrap(), "10.in-addr.arpa.");
        let network: IpNetwork = "10.0.0.0/12".parse().unwrap();
        assert!(expected_reverse_origin(&network).is_none());
    }

    #[test]
    fn test_expected_reverse_origin_v6() {
        let network: IpNetwork = "3ffe::/16".parse().unwrap();
        assert_eq!(
            expected_reverse_origin(&network).unwrap(),
            "e.f.f.3.ip6.arpa."
        );
    }

    #[tokio::test]
    async fn test_dependency_closure_order() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let api = CoreApi::new(store, "tester");
        api.make_view("a").await.unwrap();
        api.make_view("b").await.unwrap();
        api.make_view("c").await.unwrap();
        api.set_view_dependencies("a", &["b".to_string()]).await.unwrap();
        api.set_view_dependencies("b", &["c".to_string()]).await.unwrap();

        let snapshot = api.store().snapshot().await.unwrap();
        assert_eq!(
            dependency_closure(&snapshot, "a"),
            vec!["a", "b", "c", "any"]
        );
    }
}
