//! BIND named.conf codec.
//!
//! Parses the nested-brace configuration syntax into an order-preserving
//! tree and emits the same shape back as single-line text. The grammar is
//! small: a *block* `key { children };`, an *assignment* `key value;` and
//! a *flag* `key;`. Keys may span several words (`view "external"`); a `}`
//! not followed by `;` behaves as if the semicolon were present.

use std::collections::BTreeMap;
use std::fmt;

/// One entry in a configuration tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfEntry {
    Block { key: String, children: Vec<ConfEntry> },
    Assign { key: String, value: String },
    Flag { key: String },
}

impl ConfEntry {
    pub fn block(key: impl Into<String>, children: Vec<ConfEntry>) -> ConfEntry {
        ConfEntry::Block {
            key: key.into(),
            children,
        }
    }

    pub fn assign(key: impl Into<String>, value: impl Into<String>) -> ConfEntry {
        ConfEntry::Assign {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn flag(key: impl Into<String>) -> ConfEntry {
        ConfEntry::Flag { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            ConfEntry::Block { key, .. }
            | ConfEntry::Assign { key, .. }
            | ConfEntry::Flag { key } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamedConfError {
    UnterminatedString,
    UnterminatedBlock { key: String },
    UnexpectedClose,
    BlockWithoutKey,
}

impl fmt::Display for NamedConfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamedConfError::UnterminatedString => write!(f, "Unterminated quoted string"),
            NamedConfError::UnterminatedBlock { key } => {
                write!(f, "Unterminated block: {}", key)
            }
            NamedConfError::UnexpectedClose => write!(f, "Unexpected '}}'"),
            NamedConfError::BlockWithoutKey => write!(f, "Block with no key"),
        }
    }
}

impl std::error::Error for NamedConfError {}

type Result<T> = std::result::Result<T, NamedConfError>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    Semi,
    Word(String),
}

/// Strip `#` and `//` comments and split into tokens. Quoted strings stay
/// single tokens, quotes included.
fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    let mut word = String::new();

    macro_rules! flush {
        () => {
            if !word.is_empty() {
                tokens.push(Token::Word(word.clone()));
                word.clear();
            }
        };
    }

    while let Some(c) = chars.next() {
        match c {
            '#' => {
                flush!();
                while let Some(&n) = chars.peek() {
                    if n == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '/' if chars.peek() == Some(&'/') => {
                flush!();
                while let Some(&n) = chars.peek() {
                    if n == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '"' => {
                word.push('"');
                let mut terminated = false;
                for n in chars.by_ref() {
                    word.push(n);
                    if n == '"' {
                        terminated = true;
                        break;
                    }
                }
                if !terminated {
                    return Err(NamedConfError::UnterminatedString);
                }
            }
            '{' => {
                flush!();
                tokens.push(Token::Open);
            }
            '}' => {
                flush!();
                tokens.push(Token::Close);
            }
            ';' => {
                flush!();
                tokens.push(Token::Semi);
            }
            c if c.is_whitespace() => flush!(),
            c => word.push(c),
        }
    }
    flush!();
    Ok(tokens)
}

/// Parse named.conf text into an entry tree.
pub fn parse(input: &str) -> Result<Vec<ConfEntry>> {
    let tokens = tokenize(input)?;
    let mut pos = 0;
    parse_entries(&tokens, &mut pos, false)
}

fn parse_entries(tokens: &[Token], pos: &mut usize, nested: bool) -> Result<Vec<ConfEntry>> {
    let mut entries = Vec::new();
    let mut words: Vec<String> = Vec::new();

    while *pos < tokens.len() {
        match &tokens[*pos] {
            Token::Word(w) => {
                words.push(w.clone());
                *pos += 1;
            }
            Token::Open => {
                *pos += 1;
                if words.is_empty() {
                    return Err(NamedConfError::BlockWithoutKey);
                }
                let key = words.join(" ");
                words.clear();
                let children = parse_entries(tokens, pos, true)?;
                // The recursive call stops on the matching close.
                if *pos >= tokens.len() || tokens[*pos] != Token::Close {
                    return Err(NamedConfError::UnterminatedBlock { key });
                }
                *pos += 1;
                // Implicit semicolon after a closing brace.
                if *pos < tokens.len() && tokens[*pos] == Token::Semi {
                    *pos += 1;
                }
                entries.push(ConfEntry::Block { key, children });
            }
            Token::Close => {
                if !nested {
                    return Err(NamedConfError::UnexpectedClose);
                }
                return Ok(entries);
            }
            Token::Semi => {
                *pos += 1;
                match words.len() {
                    0 => {} // stray semicolon, tolerated
                    1 => entries.push(ConfEntry::Flag {
                        key: words.pop().unwrap_or_default(),
                    }),
                    _ => {
                        let key = words.remove(0);
                        let value = words.join(" ");
                        words.clear();
                        entries.push(ConfEntry::Assign { key, value });
                    }
                }
            }
        }
    }

    if nested {
        return Err(NamedConfError::UnterminatedBlock {
            key: "<unknown>".to_string(),
        });
    }
    if !words.is_empty() {
        // Trailing words without a terminator; treat like an implicit
        // final semicolon the way lenient BIND tooling does.
        if words.len() == 1 {
            entries.push(ConfEntry::Flag {
                key: words.pop().unwrap_or_default(),
            });
        } else {
            let key = words.remove(0);
            entries.push(ConfEntry::Assign {
                key,
                value: words.join(" "),
            });
        }
    }
    Ok(entries)
}

/// Emit an entry tree as single-line, no-indent named.conf text.
pub fn emit(entries: &[ConfEntry]) -> String {
    entries
        .iter()
        .map(emit_entry)
        .collect::<Vec<String>>()
        .join(" ")
}

fn emit_entry(entry: &ConfEntry) -> String {
    match entry {
        ConfEntry::Block { key, children } => {
            if children.is_empty() {
                format!("{} {{ }};", key)
            } else {
                format!("{} {{ {} }};", key, emit(children))
            }
        }
        ConfEntry::Assign { key, value } => format!("{} {};", key, value),
        ConfEntry::Flag { key } => format!("{};", key),
    }
}

/// A zone stanza inside a view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamedConfZone {
    pub zone_type: Option<String>,
    pub file: Option<String>,
    pub options: Vec<ConfEntry>,
}

/// A view stanza: its zones plus any other view-level options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamedConfView {
    pub zones: BTreeMap<String, NamedConfZone>,
    pub options: Vec<ConfEntry>,
}

/// Domain projection of a parsed named.conf: acls, views and everything
/// else preserved verbatim as global options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamedConf {
    pub acls: BTreeMap<String, Vec<String>>,
    pub views: BTreeMap<String, NamedConfView>,
    pub options: Vec<ConfEntry>,
}

/// Build the domain projection from an entry tree.
pub fn project(entries: &[ConfEntry]) -> NamedConf {
    let mut conf = NamedConf::default();

    for entry in entries {
        match entry {
            ConfEntry::Block { key, children } if key.starts_with("acl ") => {
                let name = unquote(key.trim_start_matches("acl ").trim());
                let ranges = children
                    .iter()
                    .map(|c| c.key().to_string())
                    .collect::<Vec<String>>();
                conf.acls.insert(name, ranges);
            }
            ConfEntry::Block { key, children } if key.starts_with("view ") => {
                let name = unquote(key.trim_start_matches("view ").trim());
                conf.views.insert(name, project_view(children));
            }
            other => conf.options.push(other.clone()),
        }
    }

    conf
}

fn project_view(children: &[ConfEntry]) -> NamedConfView {
    let mut view = NamedConfView::default();
    for child in children {
        match child {
            ConfEntry::Block { key, children } if key.starts_with("zone ") => {
                let name = unquote(key.trim_start_matches("zone ").trim());
                let mut zone = NamedConfZone::default();
                for entry in children {
                    match entry {
                        ConfEntry::Assign { key, value } if key == "type" => {
                            zone.zone_type = Some(value.clone());
                        }
                        ConfEntry::Assign { key, value } if key == "file" => {
                            zone.file = Some(unquote(value));
                        }
                        other => zone.options.push(other.clone()),
                    }
                }
                view.zones.insert(name, zone);
            }
            other => view.options.push(other.clone()),
        }
    }
    view
}

/// Remove one layer of surrounding double quotes, if present.
pub fn unquote(s: &str) -> String {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Wrap a name in double quotes for emission.
pub fn quoted(s: &str) -> String {
    format!("\"{}\"", s)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOLDEN: &str = r#"
# Autogenerated by the management plane
options {
    directory "/var/named";  // working directory
    recursion no;
};
acl "internal" { 10.0.0.0/8; 192.168.0.0/16; };
view "external" {
    match-clients { any; };
    zone "example.com" {
        type master;
        file "named/external/example.com.db";
    };
}
"#;

    #[test]
    fn test_parse_golden_structure() {
        let entries = parse(GOLDEN).unwrap();
        assert_eq!(entries.len(), 3);
        match &entries[0] {
            ConfEntry::Block { key, children } => {
                assert_eq!(key, "options");
                assert_eq!(children.len(), 2);
                assert_eq!(
                    children[0],
                    ConfEntry::assign("directory", "\"/var/named\"")
                );
                assert_eq!(children[1], ConfEntry::assign("recursion", "no"));
            }
            other => panic!("expected options block, got {:?}", other),
        }
    }

    #[test]
    fn test_implicit_semicolon_after_close() {
        // The view block above ends with `}` and no `;`.
        let entries = parse(GOLDEN).unwrap();
        assert!(matches!(&entries[2], ConfEntry::Block { key, .. } if key == "view \"external\""));
    }

    #[test]
    fn test_flag_only_block() {
        let entries = parse("zone \"x\" { notify; };").unwrap();
        match &entries[0] {
            ConfEntry::Block { children, .. } => {
                assert_eq!(children[0], ConfEntry::flag("notify"));
            }
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_block_fails() {
        let err = parse("options { recursion no;").unwrap_err();
        assert!(matches!(err, NamedConfError::UnterminatedBlock { .. }));
    }

    #[test]
    fn test_stray_close_fails() {
        let err = parse("};").unwrap_err();
        assert_eq!(err, NamedConfError::UnexpectedClose);
    }

    #[test]
    fn test_round_trip_preserves_structure() {
        let entries = parse(GOLDEN).unwrap();
        let emitted = emit(&entries);
        let reparsed = parse(&emitted).unwrap();
        assert_eq!(entries, reparsed);
    }

    #[test]
    fn test_projection() {
        let entries = parse(GOLDEN).unwrap();
        let conf = project(&entries);

        assert_eq!(
            conf.acls.get("internal"),
            Some(&vec!["10.0.0.0/8".to_string(), "192.168.0.0/16".to_string()])
        );

        let view = conf.views.get("external").expect("external view");
        let zone = view.zones.get("example.com").expect("example.com zone");
        assert_eq!(zone.zone_type.as_deref(), Some("master"));
        assert_eq!(zone.file.as_deref(), Some("named/external/example.com.db"));
        assert_eq!(view.options.len(), 1); // match-clients

        // Top-level options stanza survives verbatim.
        assert_eq!(conf.options.len(), 1);
        assert_eq!(conf.options[0].key(), "options");
    }

    #[test]
    fn test_emit_single_line_form() {
        let entries = vec![ConfEntry::block(
            "view \"v\"",
            vec![
                ConfEntry::block("match-clients", vec![ConfEntry::flag("any")]),
                ConfEntry::assign("recursion", "no"),
            ],
        )];
        assert_eq!(
            emit(&entries),
            "view \"v\" { match-clients { any; }; recursion no; };"
        );
    }

    #[test]
    fn test_comments_stripped() {
        let entries = parse("# header\nkey value; // trailing\n").unwrap();
        assert_eq!(entries, vec![ConfEntry::assign("key", "value")]);
    }
}
