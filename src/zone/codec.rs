//! Master-format zone file parser and deterministic emitter.
//!
//! The parser accepts standard RFC 1035 master files for a single origin:
//! `$ORIGIN`/`$TTL` directives, `;` comments, parenthesized multi-line
//! records, optional TTL and class fields. Records come back in first-seen
//! order with targets stored relative to the origin (`@` for the origin
//! itself).
//!
//! The emitter is the inverse with a fixed section ordering, so that two
//! runs over the same record set produce byte-identical files.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::zone::record::{
    canonicalize_ipv6, RecordArgsError, RecordData, RecordType, ZoneRecord,
};

/// Header line emitted at the top of every generated zone file.
pub const GENERATED_HEADER: &str = "; This zone file is autogenerated. Do not edit by hand.";

/// Parser and emitter errors with line numbers where available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneCodecError {
    Syntax { line: usize, message: String },
    UnknownRecordType { line: usize, rtype: String },
    UnknownDirective { line: usize, directive: String },
    DuplicateRecord { target: String, rtype: String },
    MissingSoa { origin: String },
    MultipleSoa { origin: String },
    Args(RecordArgsError),
}

impl fmt::Display for ZoneCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneCodecError::Syntax { line, message } => {
                write!(f, "Line {}: zone file syntax error: {}", line, message)
            }
            ZoneCodecError::UnknownRecordType { line, rtype } => {
                write!(f, "Line {}: unknown record type: {}", line, rtype)
            }
            ZoneCodecError::UnknownDirective { line, directive } => {
                write!(f, "Line {}: unknown directive: {}", line, directive)
            }
            ZoneCodecError::DuplicateRecord { target, rtype } => {
                write!(f, "Duplicate {} record for target '{}'", rtype, target)
            }
            ZoneCodecError::MissingSoa { origin } => {
                write!(f, "No SOA record for origin {}", origin)
            }
            ZoneCodecError::MultipleSoa { origin } => {
                write!(f, "More than one SOA record for origin {}", origin)
            }
            ZoneCodecError::Args(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ZoneCodecError {}

impl From<RecordArgsError> for ZoneCodecError {
    fn from(err: RecordArgsError) -> Self {
        ZoneCodecError::Args(err)
    }
}

type Result<T> = std::result::Result<T, ZoneCodecError>;

/// Zone file parser state for a single origin.
pub struct ZoneFileParser {
    origin: String,
    default_ttl: u32,
    current_ttl: Option<u32>,
    line_number: usize,
    last_target: Option<String>,
}

impl ZoneFileParser {
    /// Create a parser rooted at `origin` (made fully qualified if the
    /// caller forgot the trailing dot) with a default TTL.
    pub fn new(origin: &str, default_ttl: u32) -> ZoneFileParser {
        let origin = if origin.ends_with('.') {
            origin.to_string()
        } else {
            format!("{}.", origin)
        };
        ZoneFileParser {
            origin,
            default_ttl,
            current_ttl: None,
            line_number: 0,
            last_target: None,
        }
    }

    /// Parse zone file text into records in first-seen order.
    pub fn parse(&mut self, content: &str) -> Result<Vec<ZoneRecord>> {
        let mut records = Vec::new();

        let mut in_multiline = false;
        let mut multiline_buffer = String::new();
        let mut multiline_start = 0;

        for (idx, raw_line) in content.lines().enumerate() {
            self.line_number = idx + 1;
            let line = strip_comment(raw_line);

            if in_multiline {
                multiline_buffer.push(' ');
                multiline_buffer.push_str(line.trim());
                if line.contains(')') {
                    in_multiline = false;
                    self.line_number = multiline_start;
                    let joined = multiline_buffer.replace('(', " ").replace(')', " ");
                    self.parse_line(&joined, &mut records)?;
                    multiline_buffer.clear();
                }
                continue;
            }

            if line.contains('(') && !line.contains(')') {
                in_multiline = true;
                multiline_start = self.line_number;
                multiline_buffer = line.to_string();
                continue;
            }

            let line = line.replace('(', " ").replace(')', " ");
            self.parse_line(&line, &mut records)?;
        }

        if in_multiline {
            return Err(ZoneCodecError::Syntax {
                line: multiline_start,
                message: "unclosed parentheses in multi-line record".to_string(),
            });
        }

        Ok(records)
    }

    fn parse_line(&mut self, line: &str, records: &mut Vec<ZoneRecord>) -> Result<()> {
        let continuation = line.starts_with(' ') || line.starts_with('\t');
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(());
        }

        if trimmed.starts_with('$') {
            return self.parse_directive(trimmed);
        }

        let parts = tokenize(trimmed);
        if parts.is_empty() {
            return Ok(());
        }

        let mut idx = 0;

        // Leading whitespace means the owner of the previous record.
        let target = if continuation {
            self.last_target.clone().ok_or_else(|| ZoneCodecError::Syntax {
                line: self.line_number,
                message: "record with blank owner but no previous owner".to_string(),
            })?
        } else {
            let t = self.relativize(&parts[idx]);
            idx += 1;
            t
        };
        self.last_target = Some(target.clone());

        // TTL and class may appear in either order; both are optional.
        let mut ttl: Option<u32> = None;
        let mut saw_class = false;
        while idx < parts.len() {
            let token = &parts[idx];
            if !saw_class && token.eq_ignore_ascii_case("in") {
                saw_class = true;
                idx += 1;
            } else if ttl.is_none() && token.chars().all(|c| c.is_ascii_digit()) {
                ttl = Some(self.parse_ttl(token)?);
                idx += 1;
            } else {
                break;
            }
        }

        if idx >= parts.len() {
            return Err(ZoneCodecError::Syntax {
                line: self.line_number,
                message: "missing record type".to_string(),
            });
        }

        let type_token = parts[idx].clone();
        idx += 1;
        let rtype = RecordType::from_str(&type_token).map_err(|_| {
            ZoneCodecError::UnknownRecordType {
                line: self.line_number,
                rtype: type_token,
            }
        })?;

        let ttl = ttl.unwrap_or_else(|| self.current_ttl.unwrap_or(self.default_ttl));
        let data = self.parse_record_data(rtype, &parts[idx..])?;

        records.push(ZoneRecord::new(target, ttl, data));
        Ok(())
    }

    fn parse_directive(&mut self, line: &str) -> Result<()> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts[0].to_ascii_uppercase().as_str() {
            "$ORIGIN" => {
                let value = parts.get(1).ok_or_else(|| ZoneCodecError::Syntax {
                    line: self.line_number,
                    message: "$ORIGIN requires a domain".to_string(),
                })?;
                self.origin = if value.ends_with('.') {
                    value.to_string()
                } else {
                    format!("{}.", value)
                };
                Ok(())
            }
            "$TTL" => {
                let value = parts.get(1).ok_or_else(|| ZoneCodecError::Syntax {
                    line: self.line_number,
                    message: "$TTL requires a value".to_string(),
                })?;
                self.current_ttl = Some(self.parse_ttl(value)?);
                Ok(())
            }
            other => Err(ZoneCodecError::UnknownDirective {
                line: self.line_number,
                directive: other.to_string(),
            }),
        }
    }

    fn parse_ttl(&self, token: &str) -> Result<u32> {
        token.parse::<u32>().map_err(|_| ZoneCodecError::Syntax {
            line: self.line_number,
            message: format!("invalid TTL value: {}", token),
        })
    }

    /// Store a name relative to the origin when possible, `@` when equal
    /// to it.
    fn relativize(&self, name: &str) -> String {
        if name == "@" || name == self.origin {
            return "@".to_string();
        }
        if let Some(stripped) = name.strip_suffix(&format!(".{}", self.origin)) {
            return stripped.to_string();
        }
        name.to_string()
    }

    /// Qualify a host argument against the origin when it is relative.
    fn qualify(&self, name: &str) -> String {
        if name == "@" {
            self.origin.clone()
        } else if name.ends_with('.') {
            name.to_string()
        } else {
            format!("{}.{}", name, self.origin)
        }
    }

    fn expect_args(&self, rtype: RecordType, parts: &[String], n: usize) -> Result<()> {
        if parts.len() != n {
            return Err(ZoneCodecError::Syntax {
                line: self.line_number,
                message: format!(
                    "{} record takes {} argument(s), found {}",
                    rtype.as_str(),
                    n,
                    parts.len()
                ),
            });
        }
        Ok(())
    }

    fn parse_u32(&self, token: &str, what: &str) -> Result<u32> {
        token.parse::<u32>().map_err(|_| ZoneCodecError::Syntax {
            line: self.line_number,
            message: format!("invalid {}: {}", what, token),
        })
    }

    fn parse_u16(&self, token: &str, what: &str) -> Result<u16> {
        token.parse::<u16>().map_err(|_| ZoneCodecError::Syntax {
            line: self.line_number,
            message: format!("invalid {}: {}", what, token),
        })
    }

    fn parse_record_data(&self, rtype: RecordType, parts: &[String]) -> Result<RecordData> {
        match rtype {
            RecordType::Soa => {
                self.expect_args(rtype, parts, 7)?;
                Ok(RecordData::Soa {
                    name_server: self.qualify(&parts[0]),
                    admin_email: self.qualify(&parts[1]),
                    serial_number: self.parse_u32(&parts[2], "SOA serial")?,
                    refresh_seconds: self.parse_u32(&parts[3], "SOA refresh")?,
                    retry_seconds: self.parse_u32(&parts[4], "SOA retry")?,
                    expiry_seconds: self.parse_u32(&parts[5], "SOA expiry")?,
                    minimum_seconds: self.parse_u32(&parts[6], "SOA minimum")?,
                })
            }
            RecordType::Ns => {
                self.expect_args(rtype, parts, 1)?;
                Ok(RecordData::Ns {
                    name_server: self.qualify(&parts[0]),
                })
            }
            RecordType::A => {
                self.expect_args(rtype, parts, 1)?;
                let addr =
                    Ipv4Addr::from_str(&parts[0]).map_err(|_| ZoneCodecError::Syntax {
                        line: self.line_number,
                        message: format!("invalid IPv4 address: {}", parts[0]),
                    })?;
                Ok(RecordData::A { assignment_ip: addr })
            }
            RecordType::Aaaa => {
                self.expect_args(rtype, parts, 1)?;
                let canonical =
                    canonicalize_ipv6(&parts[0]).map_err(|_| ZoneCodecError::Syntax {
                        line: self.line_number,
                        message: format!("invalid IPv6 address: {}", parts[0]),
                    })?;
                Ok(RecordData::Aaaa {
                    assignment_ip: canonical,
                })
            }
            RecordType::Cname => {
                self.expect_args(rtype, parts, 1)?;
                Ok(RecordData::Cname {
                    assignment_host: self.qualify(&parts[0]),
                })
            }
            RecordType::Ptr => {
                self.expect_args(rtype, parts, 1)?;
                Ok(RecordData::Ptr {
                    assignment_host: self.qualify(&parts[0]),
                })
            }
            RecordType::Mx => {
                self.expect_args(rtype, parts, 2)?;
                Ok(RecordData::Mx {
                    priority: self.parse_u16(&parts[0], "MX priority")?,
                    mail_server: self.qualify(&parts[1]),
                })
            }
            RecordType::Txt => {
                if parts.is_empty() {
                    return Err(ZoneCodecError::Syntax {
                        line: self.line_number,
                        message: "txt record requires text".to_string(),
                    });
                }
                let joined = parts.join(" ");
                let quoted = if joined.starts_with('"') && joined.ends_with('"') && joined.len() >= 2
                {
                    joined
                } else {
                    format!("\"{}\"", joined)
                };
                Ok(RecordData::Txt { quoted_text: quoted })
            }
            RecordType::Hinfo => {
                self.expect_args(rtype, parts, 2)?;
                Ok(RecordData::Hinfo {
                    hardware: parts[0].clone(),
                    os: parts[1].clone(),
                })
            }
            RecordType::Srv => {
                self.expect_args(rtype, parts, 4)?;
                Ok(RecordData::Srv {
                    priority: self.parse_u16(&parts[0], "SRV priority")?,
                    weight: self.parse_u16(&parts[1], "SRV weight")?,
                    port: self.parse_u16(&parts[2], "SRV port")?,
                    assignment_host: self.qualify(&parts[3]),
                })
            }
        }
    }
}

/// Fail on the first pair of records that compare equal after stripping
/// TTL and normalizing `@` against the origin.
pub fn check_duplicates(origin: &str, records: &[ZoneRecord]) -> Result<()> {
    let mut seen = HashSet::new();
    for record in records {
        let key = record.dedup_key(origin);
        if !seen.insert(key) {
            return Err(ZoneCodecError::DuplicateRecord {
                target: record.target.clone(),
                rtype: record.data.rtype().as_str().to_string(),
            });
        }
    }
    Ok(())
}

/// Emit a zone file for `origin` with the fixed deterministic ordering:
/// header, SOA, NS (by name server), MX (by priority then mail server),
/// TXT in first-seen order, then everything else sorted by target, type
/// and argument tuple.
pub fn emit_zone_file(origin: &str, records: &[ZoneRecord]) -> Result<String> {
    check_duplicates(origin, records)?;

    let mut soa = Vec::new();
    let mut ns = Vec::new();
    let mut mx = Vec::new();
    let mut txt = Vec::new();
    let mut rest = Vec::new();

    for record in records {
        match record.data.rtype() {
            RecordType::Soa => soa.push(record.clone()),
            RecordType::Ns => ns.push(record.clone()),
            RecordType::Mx => mx.push(record.clone()),
            RecordType::Txt => txt.push(record.clone()),
            _ => rest.push(record.clone()),
        }
    }

    if soa.is_empty() {
        return Err(ZoneCodecError::MissingSoa {
            origin: origin.to_string(),
        });
    }
    if soa.len() > 1 {
        return Err(ZoneCodecError::MultipleSoa {
            origin: origin.to_string(),
        });
    }

    ns.sort_by_key(|r| match &r.data {
        RecordData::Ns { name_server } => name_server.clone(),
        _ => String::new(),
    });
    mx.sort_by_key(|r| match &r.data {
        RecordData::Mx { priority, mail_server } => (*priority, mail_server.clone()),
        _ => (0, String::new()),
    });
    rest.sort_by_key(|r| {
        (
            r.target.clone(),
            r.data.rtype().as_str(),
            r.data.argument_values(),
        )
    });

    let mut out = String::new();
    out.push_str(GENERATED_HEADER);
    out.push('\n');
    out.push_str(&format!("$ORIGIN {}\n", origin));

    for record in soa.iter().chain(&ns).chain(&mx).chain(&txt).chain(&rest) {
        out.push_str(&format_record_line(record));
        out.push('\n');
    }

    Ok(out)
}

fn format_record_line(record: &ZoneRecord) -> String {
    format!(
        "{} {} in {} {}",
        record.target,
        record.ttl,
        record.data.rtype().as_str(),
        record.data.argument_values().join(" ")
    )
}

/// Strip a `;` comment, honoring quoted strings.
fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Split a record line into whitespace-separated tokens, keeping quoted
/// strings intact.
fn tokenize(line: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in line.chars() {
        if c == '"' {
            in_quotes = !in_quotes;
            current.push(c);
        } else if c.is_whitespace() && !in_quotes {
            if !current.is_empty() {
                parts.push(current.clone());
                current.clear();
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_ZONE: &str = r#"
$ORIGIN example.com.
$TTL 3600
@ in soa ns1.example.com. admin.example.com. 1 30 30 30 30
@ in ns ns1.example.com.
www 600 in a 10.0.0.1
"#;

    #[test]
    fn test_parse_simple_zone() {
        let mut parser = ZoneFileParser::new("example.com.", 3600);
        let records = parser.parse(SIMPLE_ZONE).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].target, "@");
        assert_eq!(records[0].data.rtype(), RecordType::Soa);
        assert_eq!(records[2].target, "www");
        assert_eq!(records[2].ttl, 600);
    }

    #[test]
    fn test_parse_multiline_soa_with_comments() {
        let content = r#"
$ORIGIN example.com.
@ 3600 in soa ns1 admin (
    1     ; SERIAL
    30    ; REFRESH
    30    ; RETRY
    30    ; EXPIRE
    30 )  ; MINIMUM
"#;
        let mut parser = ZoneFileParser::new("example.com.", 3600);
        let records = parser.parse(content).unwrap();
        assert_eq!(records.len(), 1);
        match &records[0].data {
            RecordData::Soa {
                name_server,
                serial_number,
                ..
            } => {
                assert_eq!(name_server, "ns1.example.com.");
                assert_eq!(*serial_number, 1);
            }
            other => panic!("expected SOA, got {:?}", other),
        }
    }

    #[test]
    fn test_blank_owner_uses_previous_owner() {
        let content = "www 600 in a 10.0.0.1\n    600 in a 10.0.0.2\n";
        let mut parser = ZoneFileParser::new("example.com.", 3600);
        let records = parser.parse(content).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].target, "www");
    }

    #[test]
    fn test_absolute_owner_relativized() {
        let content = "www.example.com. 600 in a 10.0.0.1\nexample.com. 600 in ns ns1.example.com.\n";
        let mut parser = ZoneFileParser::new("example.com.", 3600);
        let records = parser.parse(content).unwrap();
        assert_eq!(records[0].target, "www");
        assert_eq!(records[1].target, "@");
    }

    #[test]
    fn test_unknown_directive_fails() {
        let mut parser = ZoneFileParser::new("example.com.", 3600);
        let err = parser.parse("$INCLUDE other.db\n").unwrap_err();
        assert!(matches!(err, ZoneCodecError::UnknownDirective { .. }));
    }

    #[test]
    fn test_unknown_record_type_fails() {
        let mut parser = ZoneFileParser::new("example.com.", 3600);
        let err = parser.parse("www 600 in naptr foo\n").unwrap_err();
        assert!(matches!(err, ZoneCodecError::UnknownRecordType { .. }));
    }

    #[test]
    fn test_txt_keeps_semicolons_inside_quotes() {
        let content = "spf 600 in txt \"v=spf1 a; -all\"\n";
        let mut parser = ZoneFileParser::new("example.com.", 3600);
        let records = parser.parse(content).unwrap();
        match &records[0].data {
            RecordData::Txt { quoted_text } => assert_eq!(quoted_text, "\"v=spf1 a; -all\""),
            other => panic!("expected TXT, got {:?}", other),
        }
    }

    fn soa() -> ZoneRecord {
        ZoneRecord::new(
            "@",
            30,
            RecordData::Soa {
                name_server: "ns1.example.com.".to_string(),
                admin_email: "admin.example.com.".to_string(),
                serial_number: 1,
                refresh_seconds: 30,
                retry_seconds: 30,
                expiry_seconds: 30,
                minimum_seconds: 30,
            },
        )
    }

    #[test]
    fn test_emit_ordering_is_fixed() {
        let records = vec![
            ZoneRecord::new("www", 60, RecordData::A { assignment_ip: "10.0.0.2".parse().unwrap() }),
            ZoneRecord::new(
                "@",
                60,
                RecordData::Mx {
                    priority: 20,
                    mail_server: "mx2.example.com.".to_string(),
                },
            ),
            soa(),
            ZoneRecord::new(
                "@",
                60,
                RecordData::Mx {
                    priority: 10,
                    mail_server: "mx1.example.com.".to_string(),
                },
            ),
            ZoneRecord::new(
                "@",
                60,
                RecordData::Ns {
                    name_server: "ns2.example.com.".to_string(),
                },
            ),
            ZoneRecord::new(
                "@",
                60,
                RecordData::Ns {
                    name_server: "ns1.example.com.".to_string(),
                },
            ),
            ZoneRecord::new("abc", 60, RecordData::A { assignment_ip: "10.0.0.1".parse().unwrap() }),
        ];
        let text = emit_zone_file("example.com.", &records).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], GENERATED_HEADER);
        assert_eq!(lines[1], "$ORIGIN example.com.");
        assert!(lines[2].contains(" in soa "));
        assert_eq!(lines[3], "@ 60 in ns ns1.example.com.");
        assert_eq!(lines[4], "@ 60 in ns ns2.example.com.");
        assert_eq!(lines[5], "@ 60 in mx 10 mx1.example.com.");
        assert_eq!(lines[6], "@ 60 in mx 20 mx2.example.com.");
        assert_eq!(lines[7], "abc 60 in a 10.0.0.1");
        assert_eq!(lines[8], "www 60 in a 10.0.0.2");
    }

    #[test]
    fn test_emit_is_deterministic() {
        let records = vec![
            soa(),
            ZoneRecord::new("b", 60, RecordData::A { assignment_ip: "10.0.0.2".parse().unwrap() }),
            ZoneRecord::new("a", 60, RecordData::A { assignment_ip: "10.0.0.1".parse().unwrap() }),
        ];
        let first = emit_zone_file("example.com.", &records).unwrap();
        let second = emit_zone_file("example.com.", &records).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_duplicate_detection_ignores_ttl() {
        let records = vec![
            soa(),
            ZoneRecord::new("www", 60, RecordData::A { assignment_ip: "10.0.0.1".parse().unwrap() }),
            ZoneRecord::new("www", 999, RecordData::A { assignment_ip: "10.0.0.1".parse().unwrap() }),
        ];
        let err = emit_zone_file("example.com.", &records).unwrap_err();
        match err {
            ZoneCodecError::DuplicateRecord { target, rtype } => {
                assert_eq!(target, "www");
                assert_eq!(rtype, "a");
            }
            other => panic!("expected duplicate error, got {:?}", other),
        }
    }

    #[test]
    fn test_reverse_zone_ptr_line() {
        let records = vec![
            ZoneRecord::new(
                "@",
                30,
                RecordData::Soa {
                    name_server: "ns1.example.com.".to_string(),
                    admin_email: "admin.example.com.".to_string(),
                    serial_number: 1,
                    refresh_seconds: 30,
                    retry_seconds: 30,
                    expiry_seconds: 30,
                    minimum_seconds: 30,
                },
            ),
            ZoneRecord::new(
                "5",
                86400,
                RecordData::Ptr {
                    assignment_host: "host3.example.com.".to_string(),
                },
            ),
        ];
        let text = emit_zone_file("0.168.192.in-addr.arpa.", &records).unwrap();
        assert!(text.contains("5 86400 in ptr host3.example.com."));
    }

    #[test]
    fn test_round_trip_stability() {
        let records = vec![
            soa(),
            ZoneRecord::new(
                "@",
                60,
                RecordData::Ns {
                    name_server: "ns1.example.com.".to_string(),
                },
            ),
            ZoneRecord::new("www", 60, RecordData::A { assignment_ip: "10.0.0.1".parse().unwrap() }),
            ZoneRecord::new(
                "ipv6",
                60,
                RecordData::Aaaa {
                    assignment_ip: canonicalize_ipv6("3ffe::1").unwrap(),
                },
            ),
        ];
        let emitted = emit_zone_file("example.com.", &records).unwrap();
        let mut parser = ZoneFileParser::new("example.com.", 3600);
        let reparsed = parser.parse(&emitted).unwrap();
        let re_emitted = emit_zone_file("example.com.", &reparsed).unwrap();
        assert_eq!(emitted, re_emitted);
    }
}
