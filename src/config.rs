//! Typed configuration loading.
//!
//! The configuration file is TOML with one table per section. Every
//! section is a struct with explicit fields and `deny_unknown_fields`, so
//! an unknown key in a known section is rejected at load time instead of
//! being silently ignored. Loading also refuses configuration files whose
//! permissions grant world read, write or execute, since the database
//! credentials live here.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    InsecurePermissions { path: PathBuf, mode: u32 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read configuration: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse configuration: {}", e),
            ConfigError::InsecurePermissions { path, mode } => write!(
                f,
                "Refusing configuration file {} with world-accessible mode {:o}",
                path.display(),
                mode
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err)
    }
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Intent-store connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub server: String,
    pub login: String,
    pub passwd: String,
    /// Database name; for the SQLite backend this is the file path.
    pub database: String,
    /// Seconds a writer may hold the big lock.
    pub big_lock_timeout: u64,
    /// Seconds a writer waits for the big lock before giving up.
    pub big_lock_wait: u64,
    pub ssl: bool,
    pub ssl_ca: String,
}

impl DatabaseConfig {
    /// Connection URL for the SQLite backend.
    pub fn connection_url(&self) -> String {
        if self.database == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", self.database)
        }
    }
}

/// RPC front-end settings. The transport itself is an external
/// collaborator; the pipeline only consumes `lock_file` and the logging
/// destination from here.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub lock_file: PathBuf,
    /// Credential cache renew interval, minutes.
    pub inf_renew_time: u64,
    /// Idle core shutdown interval, minutes.
    pub core_die_time: u64,
    pub run_as_username: String,
    pub server_killswitch: bool,
    pub server_log_file: PathBuf,
    pub ssl_key_file: PathBuf,
    pub ssl_cert_file: PathBuf,
}

/// Authentication plug-in selection; consumed by the RPC layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialsConfig {
    pub authentication_method: String,
    /// Credential lifetime, minutes.
    pub exp_time: u64,
}

/// Exporter pipeline settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExporterConfig {
    /// Snapshot and tree-archive root.
    pub backup_dir: PathBuf,
    /// Materialization work root.
    pub root_config_dir: PathBuf,
    /// Remote BIND directory name used in emitted zone file paths.
    pub named_dir: String,
    #[serde(default = "default_named_checkconf")]
    pub named_checkconf: String,
    #[serde(default = "default_named_checkzone")]
    pub named_checkzone: String,
    #[serde(default = "default_max_parallel_checks")]
    pub max_parallel_checks: usize,
    #[serde(default = "default_push_retries")]
    pub push_retries: u32,
}

fn default_named_checkconf() -> String {
    "named-checkconf".to_string()
}

fn default_named_checkzone() -> String {
    "named-checkzone".to_string()
}

fn default_max_parallel_checks() -> usize {
    8
}

fn default_push_retries() -> u32 {
    4
}

/// Top-level configuration: one field per recognized section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub credentials: CredentialsConfig,
    pub exporter: ExporterConfig,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Config> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(path)?.permissions().mode();
            if mode & 0o007 != 0 {
                return Err(ConfigError::InsecurePermissions {
                    path: path.to_path_buf(),
                    mode: mode & 0o777,
                });
            }
        }
        let text = fs::read_to_string(path)?;
        Config::from_str(&text)
    }

    /// Parse configuration text without touching the filesystem.
    pub fn from_str(text: &str) -> Result<Config> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
[database]
server = "localhost"
login = "bindforge"
passwd = "secret"
database = "/var/lib/bindforge/intent.db"
big_lock_timeout = 90
big_lock_wait = 5
ssl = false
ssl_ca = "/etc/ssl/ca.pem"

[server]
host = "0.0.0.0"
port = 8000
lock_file = "/var/run/bindforge.lock"
inf_renew_time = 15
core_die_time = 1200
run_as_username = "bindforge"
server_killswitch = false
server_log_file = "/var/log/bindforge.log"
ssl_key_file = "/etc/bindforge/key.pem"
ssl_cert_file = "/etc/bindforge/cert.pem"

[credentials]
authentication_method = "general_ldap"
exp_time = 60

[exporter]
backup_dir = "/var/lib/bindforge/backups"
root_config_dir = "/var/lib/bindforge/trees"
named_dir = "/var/named"
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_str(FULL_CONFIG).unwrap();
        assert_eq!(config.database.server, "localhost");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.credentials.exp_time, 60);
        assert_eq!(config.exporter.named_dir, "/var/named");
    }

    #[test]
    fn test_exporter_defaults_applied() {
        let config = Config::from_str(FULL_CONFIG).unwrap();
        assert_eq!(config.exporter.named_checkconf, "named-checkconf");
        assert_eq!(config.exporter.named_checkzone, "named-checkzone");
        assert_eq!(config.exporter.max_parallel_checks, 8);
        assert_eq!(config.exporter.push_retries, 4);
    }

    #[test]
    fn test_unknown_key_in_known_section_rejected() {
        let bad = format!("{}\nbogus_key = 1\n", FULL_CONFIG.trim_end());
        let err = Config::from_str(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_required_key_rejected() {
        let bad = FULL_CONFIG.replace("named_dir = \"/var/named\"\n", "");
        let err = Config::from_str(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_memory_database_url() {
        let mut config = Config::from_str(FULL_CONFIG).unwrap();
        config.database.database = ":memory:".to_string();
        assert_eq!(config.database.connection_url(), "sqlite::memory:");
    }

    #[cfg(unix)]
    #[test]
    fn test_world_accessible_config_refused() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL_CONFIG.as_bytes()).unwrap();
        let path = file.path().to_path_buf();

        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(Config::load(&path).is_ok());

        fs::set_permissions(&path, fs::Permissions::from_mode(0o646)).unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InsecurePermissions { .. }));
    }
}
