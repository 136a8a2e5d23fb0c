//! End-to-end export pipeline tests: seed the intent store through the
//! audited API, run the exporter, and inspect the materialized trees.

use std::fs;
use std::path::Path;

use serde_json::json;

use bindforge::config::Config;
use bindforge::export::pusher::PushTransport;
use bindforge::export::{run_export, CancelToken, ExportError};
use bindforge::store::api::CoreApi;
use bindforge::store::Store;

fn test_config(base: &Path, checkzone: &str) -> Config {
    let text = format!(
        r#"
[database]
server = "localhost"
login = "bindforge"
passwd = "secret"
database = ":memory:"
big_lock_timeout = 90
big_lock_wait = 5
ssl = false
ssl_ca = "/etc/ssl/ca.pem"

[server]
host = "127.0.0.1"
port = 8000
lock_file = "{base}/bindforge.lock"
inf_renew_time = 15
core_die_time = 1200
run_as_username = "bindforge"
server_killswitch = false
server_log_file = "{base}/bindforge.log"
ssl_key_file = "{base}/key.pem"
ssl_cert_file = "{base}/cert.pem"

[credentials]
authentication_method = "general_ldap"
exp_time = 60

[exporter]
backup_dir = "{base}/backups"
root_config_dir = "{base}/trees"
named_dir = "named"
named_checkconf = "true"
named_checkzone = "{checkzone}"
"#,
        base = base.display(),
        checkzone = checkzone,
    );
    Config::from_str(&text).expect("test config must parse")
}

fn soa_args() -> serde_json::Map<String, serde_json::Value> {
    json!({
        "name_server": "ns1.example.com.",
        "admin_email": "admin.example.com.",
        "serial_number": 1,
        "refresh_seconds": 30,
        "retry_seconds": 30,
        "expiry_seconds": 30,
        "minimum_seconds": 30
    })
    .as_object()
    .unwrap()
    .clone()
}

/// View `ext`, zone example.com with SOA/NS/A, one server in one set.
async fn seed_simple_forward_zone(api: &CoreApi) {
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
        "ns1",
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
    api.make_dns_server("ns1.example.com", "dns", "/var/named-work", "/tmp/dns-test")
        .await
        .unwrap();
    api.make_dns_server_set("primary").await.unwrap();
    api.assign_dns_server_to_set("ns1.example.com", "primary")
        .await
        .unwrap();
    api.assign_view_to_server_set("ext", "primary").await.unwrap();
    api.set_named_global_options("primary", "options { directory \"/var/named-work\"; };")
        .await
        .unwrap();
}

async fn export(config: &Config, store: &Store) -> Result<bindforge::export::ExportOutcome, ExportError> {
    run_export(
        config,
        store,
        "tester",
        false,
        &PushTransport::default(),
        &CancelToken::new(),
    )
    .await
}

#[tokio::test]
async fn test_simple_forward_zone_export() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config(base.path(), "true");
    let store = Store::connect("sqlite::memory:").await.unwrap();
    let api = CoreApi::new(store.clone(), "tester");
    seed_simple_forward_zone(&api).await;

    let outcome = export(&config, &store).await.unwrap();

    let server_dir = config.exporter.root_config_dir.join("ns1.example.com");
    let zone_file = server_dir.join("named/ext/example.com.db");
    let zone = fs::read_to_string(&zone_file).unwrap();

    assert!(zone.contains("$ORIGIN example.com."));
    assert_eq!(zone.matches(" in soa ").count(), 1);
    assert_eq!(zone.matches(" in ns ").count(), 1);
    assert_eq!(zone.matches(" in a ").count(), 1);

    let conf = fs::read_to_string(server_dir.join("named.conf")).unwrap();
    assert!(conf.contains("named/ext/example.com.db"));

    assert!(outcome.bundle.archive_path.is_file());
    assert!(outcome.bundle.snapshot_path.is_file());
    assert!(server_dir.join("ns1.example.com.info").is_file());
}

#[tokio::test]
async fn test_duplicate_record_aborts_before_any_write() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config(base.path(), "true");
    let store = Store::connect("sqlite::memory:").await.unwrap();
    let api = CoreApi::new(store.clone(), "tester");
    seed_simple_forward_zone(&api).await;

    // The audited API refuses duplicates, so plant one directly to prove
    // the exporter validates the snapshot itself.
    sqlx::query(
        "INSERT INTO records \
         (zone_name, view_name, target, record_type, ttl, arguments, last_user, timestamp) \
         SELECT zone_name, view_name, target, record_type, 999, arguments, 'intruder', 0 \
         FROM records WHERE target = 'www'",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let err = export(&config, &store).await.unwrap_err();
    assert!(err.to_string().contains("www"), "error should name the target: {}", err);
    assert!(!config.exporter.root_config_dir.exists());
    assert!(!config.exporter.backup_dir.exists());
}

#[tokio::test]
async fn test_missing_soa_aborts_with_named_entity() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config(base.path(), "true");
    let store = Store::connect("sqlite::memory:").await.unwrap();
    let api = CoreApi::new(store.clone(), "tester");
    seed_simple_forward_zone(&api).await;
    api.remove_record("soa", "@", "example.com", "ext", &soa_args())
        .await
        .unwrap();

    let err = export(&config, &store).await.unwrap_err();
    assert!(
        err.to_string().contains("no SOA for example.com in view ext"),
        "unexpected error: {}",
        err
    );
}

#[tokio::test]
async fn test_reverse_zone_ptr_emission() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config(base.path(), "true");
    let store = Store::connect("sqlite::memory:").await.unwrap();
    let api = CoreApi::new(store.clone(), "tester");
    seed_simple_forward_zone(&api).await;

    api.make_zone(
        "0.168.192.in-addr.arpa",
        "master",
        "0.168.192.in-addr.arpa.",
        "",
    )
    .await
    .unwrap();
    api.assign_zone_to_view("0.168.192.in-addr.arpa", "ext", "", false)
        .await
        .unwrap();
    api.set_reverse_cidr("0.168.192.in-addr.arpa", "192.168.0/24")
        .await
        .unwrap();
    api.make_record("soa", "@", "0.168.192.in-addr.arpa", "ext", 30, &soa_args())
        .await
        .unwrap();
    api.make_record(
        "ptr",
        "5",
        "0.168.192.in-addr.arpa",
        "ext",
        86400,
        json!({"assignment_host": "host3.example.com."}).as_object().unwrap(),
    )
    .await
    .unwrap();

    export(&config, &store).await.unwrap();

    let zone = fs::read_to_string(
        config
            .exporter
            .root_config_dir
            .join("ns1.example.com/named/ext/0.168.192.in-addr.arpa.db"),
    )
    .unwrap();
    assert!(zone.contains("5 86400 in ptr host3.example.com."));
}

#[tokio::test]
async fn test_view_dependency_merging_across_views() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config(base.path(), "true");
    let store = Store::connect("sqlite::memory:").await.unwrap();
    let api = CoreApi::new(store.clone(), "tester");
    seed_simple_forward_zone(&api).await;

    api.make_view("int").await.unwrap();
    api.assign_zone_to_view("example.com", "int", "", false)
        .await
        .unwrap();
    api.assign_view_to_server_set("int", "primary").await.unwrap();
    let mut int_soa = soa_args();
    int_soa.insert("serial_number".into(), json!(2));
    api.make_record("soa", "@", "example.com", "int", 30, &int_soa)
        .await
        .unwrap();
    // NS defined only in the reserved view; both views inherit it.
    api.make_record(
        "ns",
        "ns2",
        "example.com",
        "any",
        60,
        json!({"name_server": "ns2.example.com."}).as_object().unwrap(),
    )
    .await
    .unwrap();

    export(&config, &store).await.unwrap();

    let server_dir = config.exporter.root_config_dir.join("ns1.example.com");
    for view in ["ext", "int"] {
        let zone = fs::read_to_string(server_dir.join(format!("named/{}/example.com.db", view)))
            .unwrap();
        assert_eq!(
            zone.matches("ns2.example.com.").count(),
            1,
            "view {} should carry the inherited NS exactly once",
            view
        );
    }

    // View blocks appear in the authoritative assignment order.
    let conf = fs::read_to_string(server_dir.join("named.conf")).unwrap();
    let ext_pos = conf.find("view \"ext\"").unwrap();
    let int_pos = conf.find("view \"int\"").unwrap();
    assert!(ext_pos < int_pos);
}

#[tokio::test]
async fn test_two_exports_produce_identical_files() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config(base.path(), "true");
    let store = Store::connect("sqlite::memory:").await.unwrap();
    let api = CoreApi::new(store.clone(), "tester");
    seed_simple_forward_zone(&api).await;

    export(&config, &store).await.unwrap();
    let server_dir = config.exporter.root_config_dir.join("ns1.example.com");
    let first_zone = fs::read_to_string(server_dir.join("named/ext/example.com.db")).unwrap();
    let first_conf = fs::read_to_string(server_dir.join("named.conf")).unwrap();

    export(&config, &store).await.unwrap();
    let second_zone = fs::read_to_string(server_dir.join("named/ext/example.com.db")).unwrap();
    let second_conf = fs::read_to_string(server_dir.join("named.conf")).unwrap();

    assert_eq!(first_zone, second_zone);
    assert_eq!(first_conf, second_conf);
}

#[tokio::test]
async fn test_failed_checks_keep_archive_and_block_push() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config(base.path(), "false");
    let store = Store::connect("sqlite::memory:").await.unwrap();
    let api = CoreApi::new(store.clone(), "tester");
    seed_simple_forward_zone(&api).await;

    let err = export(&config, &store).await.unwrap_err();
    assert!(matches!(err, ExportError::ChecksFailed { .. }));

    // The archive stays on disk for inspection.
    let archives: Vec<_> = fs::read_dir(&config.exporter.backup_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("dns_tree_"))
        .collect();
    assert_eq!(archives.len(), 1);
}

#[tokio::test]
async fn test_existing_lock_file_fails_fast() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config(base.path(), "true");
    let store = Store::connect("sqlite::memory:").await.unwrap();
    let api = CoreApi::new(store.clone(), "tester");
    seed_simple_forward_zone(&api).await;

    fs::create_dir_all(base.path()).unwrap();
    fs::write(base.path().join("bindforge.lock"), "12345\n").unwrap();

    let err = export(&config, &store).await.unwrap_err();
    assert!(matches!(err, ExportError::Lock(_)));
    assert!(err.to_string().contains("12345"));
}

#[tokio::test]
async fn test_ipv6_forms_collapse_to_one_record() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config(base.path(), "true");
    let store = Store::connect("sqlite::memory:").await.unwrap();
    let api = CoreApi::new(store.clone(), "tester");
    seed_simple_forward_zone(&api).await;

    api.make_record(
        "aaaa",
        "v6host",
        "example.com",
        "ext",
        60,
        json!({"assignment_ip": "3ffe::1"}).as_object().unwrap(),
    )
    .await
    .unwrap();

    // The long form is the same canonical record: refused as duplicate.
    let err = api
        .make_record(
            "aaaa",
            "v6host",
            "example.com",
            "ext",
            60,
            json!({"assignment_ip": "3ffe:0000:0000:0000:0000:0000:0000:0001"})
                .as_object()
                .unwrap(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Duplicate"));

    export(&config, &store).await.unwrap();
    let zone = fs::read_to_string(
        config
            .exporter
            .root_config_dir
            .join("ns1.example.com/named/ext/example.com.db"),
    )
    .unwrap();
    assert!(zone.contains("v6host 60 in aaaa 3ffe:0000:0000:0000:0000:0000:0000:0001"));
}
