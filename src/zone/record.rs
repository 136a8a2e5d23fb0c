//! DNS record model shared by the zone file codec, the intent store and
//! the exporter planner.
//!
//! Record arguments are carried over the wire and in the audit log as JSON
//! objects keyed by argument name. Internally every record is a tagged
//! [`RecordData`] variant; the mapping between the two goes through a
//! central schema table so that extra or missing keys are rejected in one
//! place and emission order is fixed in one place.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use lazy_static::lazy_static;
use serde_json::{Map, Value};

/// Record types supported by the management plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordType {
    Soa,
    Ns,
    A,
    Aaaa,
    Cname,
    Ptr,
    Mx,
    Txt,
    Hinfo,
    Srv,
}

impl RecordType {
    /// Lowercase tag used in storage, audit blobs and zone file emission.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Soa => "soa",
            RecordType::Ns => "ns",
            RecordType::A => "a",
            RecordType::Aaaa => "aaaa",
            RecordType::Cname => "cname",
            RecordType::Ptr => "ptr",
            RecordType::Mx => "mx",
            RecordType::Txt => "txt",
            RecordType::Hinfo => "hinfo",
            RecordType::Srv => "srv",
        }
    }

    /// Ordered argument names for this type, from the schema table.
    pub fn argument_order(&self) -> &'static [&'static str] {
        RECORD_ARGUMENT_SCHEMA
            .get(self.as_str())
            .copied()
            .unwrap_or(&[])
    }
}

impl FromStr for RecordType {
    type Err = RecordArgsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "soa" => Ok(RecordType::Soa),
            "ns" => Ok(RecordType::Ns),
            "a" => Ok(RecordType::A),
            "aaaa" => Ok(RecordType::Aaaa),
            "cname" => Ok(RecordType::Cname),
            "ptr" => Ok(RecordType::Ptr),
            "mx" => Ok(RecordType::Mx),
            "txt" => Ok(RecordType::Txt),
            "hinfo" => Ok(RecordType::Hinfo),
            "srv" => Ok(RecordType::Srv),
            other => Err(RecordArgsError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

lazy_static! {
    /// Central schema table: type tag to ordered argument-name list.
    ///
    /// Both argument validation and zone file emission consult this table,
    /// so the wire shape and the file shape cannot drift apart.
    pub static ref RECORD_ARGUMENT_SCHEMA: HashMap<&'static str, &'static [&'static str]> = {
        let mut m: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
        m.insert(
            "soa",
            &[
                "name_server",
                "admin_email",
                "serial_number",
                "refresh_seconds",
                "retry_seconds",
                "expiry_seconds",
                "minimum_seconds",
            ][..],
        );
        m.insert("ns", &["name_server"][..]);
        m.insert("a", &["assignment_ip"][..]);
        m.insert("aaaa", &["assignment_ip"][..]);
        m.insert("cname", &["assignment_host"][..]);
        m.insert("ptr", &["assignment_host"][..]);
        m.insert("mx", &["priority", "mail_server"][..]);
        m.insert("txt", &["quoted_text"][..]);
        m.insert("hinfo", &["hardware", "os"][..]);
        m.insert("srv", &["priority", "weight", "port", "assignment_host"][..]);
        m
    };
}

/// Errors raised while validating record arguments.
///
/// These are input errors: they surface to the caller that supplied the
/// arguments and are never treated as internal faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordArgsError {
    UnknownType(String),
    MissingArgument { rtype: &'static str, name: &'static str },
    UnexpectedArgument { rtype: &'static str, name: String },
    InvalidValue { name: &'static str, value: String, reason: String },
    NotFullyQualified { name: &'static str, value: String },
    InvalidTarget { target: String, reason: String },
}

impl fmt::Display for RecordArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordArgsError::UnknownType(t) => write!(f, "Unknown record type: {}", t),
            RecordArgsError::MissingArgument { rtype, name } => {
                write!(f, "Missing argument '{}' for {} record", name, rtype)
            }
            RecordArgsError::UnexpectedArgument { rtype, name } => {
                write!(f, "Unexpected argument '{}' for {} record", name, rtype)
            }
            RecordArgsError::InvalidValue { name, value, reason } => {
                write!(f, "Invalid value '{}' for argument '{}': {}", value, name, reason)
            }
            RecordArgsError::NotFullyQualified { name, value } => {
                write!(
                    f,
                    "Argument '{}' must be fully qualified (end with '.'): {}",
                    name, value
                )
            }
            RecordArgsError::InvalidTarget { target, reason } => {
                write!(f, "Invalid record target '{}': {}", target, reason)
            }
        }
    }
}

impl std::error::Error for RecordArgsError {}

type Result<T> = std::result::Result<T, RecordArgsError>;

/// Type-specific record arguments as a tagged variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordData {
    Soa {
        name_server: String,
        admin_email: String,
        serial_number: u32,
        refresh_seconds: u32,
        retry_seconds: u32,
        expiry_seconds: u32,
        minimum_seconds: u32,
    },
    Ns {
        name_server: String,
    },
    A {
        assignment_ip: Ipv4Addr,
    },
    Aaaa {
        /// Canonicalized textual form: eight groups of four hex digits.
        assignment_ip: String,
    },
    Cname {
        assignment_host: String,
    },
    Ptr {
        assignment_host: String,
    },
    Mx {
        priority: u16,
        mail_server: String,
    },
    Txt {
        /// Stored with surrounding quotes.
        quoted_text: String,
    },
    Hinfo {
        hardware: String,
        os: String,
    },
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        assignment_host: String,
    },
}

impl RecordData {
    pub fn rtype(&self) -> RecordType {
        match self {
            RecordData::Soa { .. } => RecordType::Soa,
            RecordData::Ns { .. } => RecordType::Ns,
            RecordData::A { .. } => RecordType::A,
            RecordData::Aaaa { .. } => RecordType::Aaaa,
            RecordData::Cname { .. } => RecordType::Cname,
            RecordData::Ptr { .. } => RecordType::Ptr,
            RecordData::Mx { .. } => RecordType::Mx,
            RecordData::Txt { .. } => RecordType::Txt,
            RecordData::Hinfo { .. } => RecordType::Hinfo,
            RecordData::Srv { .. } => RecordType::Srv,
        }
    }

    /// Build a record from a JSON argument object, validating against the
    /// schema table. Extra keys and missing keys are both rejected.
    pub fn from_args(rtype: RecordType, args: &Map<String, Value>) -> Result<RecordData> {
        let schema = rtype.argument_order();
        for key in args.keys() {
            if !schema.contains(&key.as_str()) {
                return Err(RecordArgsError::UnexpectedArgument {
                    rtype: rtype.as_str(),
                    name: key.clone(),
                });
            }
        }

        match rtype {
            RecordType::Soa => Ok(RecordData::Soa {
                name_server: str_arg(rtype, args, "name_server")?,
                admin_email: str_arg(rtype, args, "admin_email")?,
                serial_number: u32_arg(rtype, args, "serial_number")?,
                refresh_seconds: u32_arg(rtype, args, "refresh_seconds")?,
                retry_seconds: u32_arg(rtype, args, "retry_seconds")?,
                expiry_seconds: u32_arg(rtype, args, "expiry_seconds")?,
                minimum_seconds: u32_arg(rtype, args, "minimum_seconds")?,
            }),
            RecordType::Ns => Ok(RecordData::Ns {
                name_server: str_arg(rtype, args, "name_server")?,
            }),
            RecordType::A => {
                let raw = str_arg(rtype, args, "assignment_ip")?;
                let assignment_ip =
                    Ipv4Addr::from_str(&raw).map_err(|_| RecordArgsError::InvalidValue {
                        name: "assignment_ip",
                        value: raw,
                        reason: "not a valid IPv4 address".to_string(),
                    })?;
                Ok(RecordData::A { assignment_ip })
            }
            RecordType::Aaaa => {
                let raw = str_arg(rtype, args, "assignment_ip")?;
                Ok(RecordData::Aaaa {
                    assignment_ip: canonicalize_ipv6(&raw)?,
                })
            }
            RecordType::Cname => {
                let assignment_host = str_arg(rtype, args, "assignment_host")?;
                require_fully_qualified("assignment_host", &assignment_host)?;
                Ok(RecordData::Cname { assignment_host })
            }
            RecordType::Ptr => Ok(RecordData::Ptr {
                assignment_host: str_arg(rtype, args, "assignment_host")?,
            }),
            RecordType::Mx => {
                let mail_server = str_arg(rtype, args, "mail_server")?;
                require_fully_qualified("mail_server", &mail_server)?;
                Ok(RecordData::Mx {
                    priority: u16_arg(rtype, args, "priority")?,
                    mail_server,
                })
            }
            RecordType::Txt => {
                let raw = str_arg(rtype, args, "quoted_text")?;
                Ok(RecordData::Txt {
                    quoted_text: ensure_quoted(&raw),
                })
            }
            RecordType::Hinfo => Ok(RecordData::Hinfo {
                hardware: str_arg(rtype, args, "hardware")?,
                os: str_arg(rtype, args, "os")?,
            }),
            RecordType::Srv => {
                let assignment_host = str_arg(rtype, args, "assignment_host")?;
                Ok(RecordData::Srv {
                    priority: u16_arg(rtype, args, "priority")?,
                    weight: u16_arg(rtype, args, "weight")?,
                    port: u16_arg(rtype, args, "port")?,
                    assignment_host,
                })
            }
        }
    }

    /// Inverse of [`RecordData::from_args`]: the JSON object stored in the
    /// database and replayed from the audit log.
    pub fn to_args(&self) -> Map<String, Value> {
        let mut m = Map::new();
        match self {
            RecordData::Soa {
                name_server,
                admin_email,
                serial_number,
                refresh_seconds,
                retry_seconds,
                expiry_seconds,
                minimum_seconds,
            } => {
                m.insert("name_server".into(), Value::from(name_server.clone()));
                m.insert("admin_email".into(), Value::from(admin_email.clone()));
                m.insert("serial_number".into(), Value::from(*serial_number));
                m.insert("refresh_seconds".into(), Value::from(*refresh_seconds));
                m.insert("retry_seconds".into(), Value::from(*retry_seconds));
                m.insert("expiry_seconds".into(), Value::from(*expiry_seconds));
                m.insert("minimum_seconds".into(), Value::from(*minimum_seconds));
            }
            RecordData::Ns { name_server } => {
                m.insert("name_server".into(), Value::from(name_server.clone()));
            }
            RecordData::A { assignment_ip } => {
                m.insert("assignment_ip".into(), Value::from(assignment_ip.to_string()));
            }
            RecordData::Aaaa { assignment_ip } => {
                m.insert("assignment_ip".into(), Value::from(assignment_ip.clone()));
            }
            RecordData::Cname { assignment_host } | RecordData::Ptr { assignment_host } => {
                m.insert("assignment_host".into(), Value::from(assignment_host.clone()));
            }
            RecordData::Mx { priority, mail_server } => {
                m.insert("priority".into(), Value::from(*priority));
                m.insert("mail_server".into(), Value::from(mail_server.clone()));
            }
            RecordData::Txt { quoted_text } => {
                m.insert("quoted_text".into(), Value::from(quoted_text.clone()));
            }
            RecordData::Hinfo { hardware, os } => {
                m.insert("hardware".into(), Value::from(hardware.clone()));
                m.insert("os".into(), Value::from(os.clone()));
            }
            RecordData::Srv {
                priority,
                weight,
                port,
                assignment_host,
            } => {
                m.insert("priority".into(), Value::from(*priority));
                m.insert("weight".into(), Value::from(*weight));
                m.insert("port".into(), Value::from(*port));
                m.insert("assignment_host".into(), Value::from(assignment_host.clone()));
            }
        }
        m
    }

    /// Argument values as strings, in the fixed schema order used for
    /// zone file emission and canonical comparison.
    pub fn argument_values(&self) -> Vec<String> {
        match self {
            RecordData::Soa {
                name_server,
                admin_email,
                serial_number,
                refresh_seconds,
                retry_seconds,
                expiry_seconds,
                minimum_seconds,
            } => vec![
                name_server.clone(),
                admin_email.clone(),
                serial_number.to_string(),
                refresh_seconds.to_string(),
                retry_seconds.to_string(),
                expiry_seconds.to_string(),
                minimum_seconds.to_string(),
            ],
            RecordData::Ns { name_server } => vec![name_server.clone()],
            RecordData::A { assignment_ip } => vec![assignment_ip.to_string()],
            RecordData::Aaaa { assignment_ip } => vec![assignment_ip.clone()],
            RecordData::Cname { assignment_host } | RecordData::Ptr { assignment_host } => {
                vec![assignment_host.clone()]
            }
            RecordData::Mx { priority, mail_server } => {
                vec![priority.to_string(), mail_server.clone()]
            }
            RecordData::Txt { quoted_text } => vec![quoted_text.clone()],
            RecordData::Hinfo { hardware, os } => vec![hardware.clone(), os.clone()],
            RecordData::Srv {
                priority,
                weight,
                port,
                assignment_host,
            } => vec![
                priority.to_string(),
                weight.to_string(),
                port.to_string(),
                assignment_host.clone(),
            ],
        }
    }
}

/// A record as held by the zone codec: target relative to the origin
/// (`@` for the origin itself), a TTL in seconds and typed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ZoneRecord {
    pub target: String,
    pub ttl: u32,
    pub data: RecordData,
}

impl ZoneRecord {
    pub fn new(target: impl Into<String>, ttl: u32, data: RecordData) -> ZoneRecord {
        ZoneRecord {
            target: target.into(),
            ttl,
            data,
        }
    }

    /// Target with `@` normalized to the zone origin.
    pub fn normalized_target(&self, origin: &str) -> String {
        if self.target == "@" {
            origin.to_string()
        } else {
            self.target.clone()
        }
    }

    /// Identity under the duplicate rule: TTL, last-user and view are
    /// stripped; `@` and the origin compare equal.
    pub fn dedup_key(&self, origin: &str) -> (String, &'static str, Vec<String>) {
        (
            self.normalized_target(origin),
            self.data.rtype().as_str(),
            self.data.argument_values(),
        )
    }
}

/// A record row as held by the intent store: a [`ZoneRecord`] plus its
/// zone/view binding and bookkeeping columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub zone: String,
    pub view: String,
    pub target: String,
    pub ttl: u32,
    pub data: RecordData,
    pub last_user: String,
    pub timestamp: i64,
}

impl StoredRecord {
    pub fn to_zone_record(&self) -> ZoneRecord {
        ZoneRecord {
            target: self.target.clone(),
            ttl: self.ttl,
            data: self.data.clone(),
        }
    }
}

/// Canonicalize an IPv6 address to eight groups of four hex digits, with
/// zero groups expanded. `3ffe::1` and its long form produce the same
/// output and therefore compare equal everywhere downstream.
pub fn canonicalize_ipv6(raw: &str) -> Result<String> {
    let addr = Ipv6Addr::from_str(raw).map_err(|_| RecordArgsError::InvalidValue {
        name: "assignment_ip",
        value: raw.to_string(),
        reason: "not a valid IPv6 address".to_string(),
    })?;
    let segments = addr.segments();
    let groups: Vec<String> = segments.iter().map(|s| format!("{:04x}", s)).collect();
    Ok(groups.join(":"))
}

/// Validate a record target: a label relative to the origin or `@`.
pub fn validate_target(target: &str) -> Result<()> {
    if target.is_empty() {
        return Err(RecordArgsError::InvalidTarget {
            target: target.to_string(),
            reason: "empty target".to_string(),
        });
    }
    if target == "@" {
        return Ok(());
    }
    if !target.is_ascii() {
        return Err(RecordArgsError::InvalidTarget {
            target: target.to_string(),
            reason: "target contains non-ASCII characters".to_string(),
        });
    }
    if target.chars().any(|c| c.is_whitespace()) {
        return Err(RecordArgsError::InvalidTarget {
            target: target.to_string(),
            reason: "target contains whitespace".to_string(),
        });
    }
    Ok(())
}

fn require_fully_qualified(name: &'static str, value: &str) -> Result<()> {
    if value.len() > 1 && value.ends_with('.') {
        Ok(())
    } else {
        Err(RecordArgsError::NotFullyQualified {
            name,
            value: value.to_string(),
        })
    }
}

fn ensure_quoted(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        raw.to_string()
    } else {
        format!("\"{}\"", raw)
    }
}

fn str_arg(rtype: RecordType, args: &Map<String, Value>, name: &'static str) -> Result<String> {
    match args.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(RecordArgsError::InvalidValue {
            name,
            value: other.to_string(),
            reason: "expected a string".to_string(),
        }),
        None => Err(RecordArgsError::MissingArgument {
            rtype: rtype.as_str(),
            name,
        }),
    }
}

/// Numeric arguments arrive either as JSON numbers or as numeric strings;
/// both normalize to an integer at ingress.
fn u32_arg(rtype: RecordType, args: &Map<String, Value>, name: &'static str) -> Result<u32> {
    match args.get(name) {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| RecordArgsError::InvalidValue {
                name,
                value: n.to_string(),
                reason: "out of range for a 32-bit unsigned value".to_string(),
            }),
        Some(Value::String(s)) => s.trim().parse::<u32>().map_err(|_| {
            RecordArgsError::InvalidValue {
                name,
                value: s.clone(),
                reason: "not an unsigned integer".to_string(),
            }
        }),
        Some(other) => Err(RecordArgsError::InvalidValue {
            name,
            value: other.to_string(),
            reason: "expected an integer".to_string(),
        }),
        None => Err(RecordArgsError::MissingArgument {
            rtype: rtype.as_str(),
            name,
        }),
    }
}

fn u16_arg(rtype: RecordType, args: &Map<String, Value>, name: &'static str) -> Result<u16> {
    let v = u32_arg(rtype, args, name)?;
    u16::try_from(v).map_err(|_| RecordArgsError::InvalidValue {
        name,
        value: v.to_string(),
        reason: "out of range for a 16-bit unsigned value".to_string(),
    })
}
