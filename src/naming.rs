//! Snapshot naming schemas.
//!
//! A naming schema is a date-format template (`auto-%Y-%m-%d_%H-%M`) used
//! both to generate snapshot names and to recover a comparable timestamp
//! from them.
//!
//! # Directives
//!
//! | Directive | Width | Required |
//! |-----------|-------|----------|
//! | `%Y` | 4 | yes |
//! | `%m` `%d` `%H` `%M` | 2 | yes |
//! | `%S` | 2 | no |
//! | `%z` | 5 | no |
//! | `%%` | literal `%` | - |
//!
//! Snapshot names may not contain `+`, so `%z` writes the positive sign as
//! `:` (`+0300` becomes `:0300`). Parsing inverts the substitution, which is
//! why a schema using `%z` may not contain a literal colon.
//!
//! # Ordering
//!
//! [`ParsedSnapshotName`] sorts by local datetime; at equal datetimes names
//! without an offset come first, then larger UTC offsets (earlier in absolute
//! time), then the raw name.

use crate::error::{ReplicationError, Result};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use regex::Regex;
use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Offset,
}

impl Directive {
    fn width(self) -> usize {
        match self {
            Directive::Year => 4,
            Directive::Offset => 5,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Directive(Directive),
}

/// A validated date-format template.
#[derive(Clone)]
pub struct NamingSchema {
    template: String,
    tokens: Vec<Token>,
}

impl NamingSchema {
    /// Parse and validate a template.
    ///
    /// Rejects unknown directives, missing required directives, `%z`
    /// combined with a literal `:`, and templates that fail to round-trip
    /// two probe instants (one east, one west of UTC).
    pub fn new(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        let tokens = tokenize(&template)?;
        let schema = Self { template, tokens };
        schema.validate()?;
        Ok(schema)
    }

    /// The raw template string.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// `true` if the schema encodes a UTC offset.
    pub fn has_offset(&self) -> bool {
        self.has(Directive::Offset)
    }

    /// `true` if the schema encodes seconds.
    pub fn has_seconds(&self) -> bool {
        self.has(Directive::Second)
    }

    fn has(&self, directive: Directive) -> bool {
        self.tokens.iter().any(|t| *t == Token::Directive(directive))
    }

    fn invalid(&self, reason: impl Into<String>) -> ReplicationError {
        ReplicationError::InvalidNamingSchema {
            schema: self.template.clone(),
            reason: reason.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        for (directive, text) in [
            (Directive::Year, "%Y"),
            (Directive::Month, "%m"),
            (Directive::Day, "%d"),
            (Directive::Hour, "%H"),
            (Directive::Minute, "%M"),
        ] {
            if !self.has(directive) {
                return Err(self.invalid(format!("missing required directive {text}")));
            }
        }

        if self.has_offset()
            && self.tokens.iter().any(|t| matches!(t, Token::Literal(l) if l.contains(':')))
        {
            return Err(self.invalid("can not use %z together with ':' character"));
        }

        let probes = [
            (ymd_hms(2021, 6, 23, 14, 37, 29), 3 * 3600 + 1800),
            (ymd_hms(1999, 12, 31, 3, 4, 5), -5 * 3600),
        ];
        for (naive, offset_secs) in probes {
            let offset = FixedOffset::east_opt(offset_secs).ok_or_else(|| self.invalid("invalid probe offset"))?;
            let instant = offset
                .from_local_datetime(&naive)
                .single()
                .ok_or_else(|| self.invalid("invalid probe instant"))?;
            let name = self.format(&instant);
            let parsed = self
                .parse(&name)
                .ok_or_else(|| self.invalid(format!("generated name '{name}' can not be parsed back")))?;

            let expected = if self.has_seconds() {
                naive
            } else {
                naive.with_second(0).unwrap_or(naive)
            };
            if parsed.datetime != Some(expected) {
                return Err(self.invalid(format!("generated name '{name}' is parsed as a different time")));
            }
            if self.has_offset() && parsed.offset != Some(offset) {
                return Err(self.invalid(format!("generated name '{name}' is parsed with a different offset")));
            }
        }

        Ok(())
    }

    /// Render a snapshot name for `instant` (its local time and offset).
    pub fn format(&self, instant: &DateTime<FixedOffset>) -> String {
        let mut out = String::with_capacity(self.template.len() + 8);
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Directive(Directive::Year) => out.push_str(&format!("{:04}", instant.year())),
                Token::Directive(Directive::Month) => out.push_str(&format!("{:02}", instant.month())),
                Token::Directive(Directive::Day) => out.push_str(&format!("{:02}", instant.day())),
                Token::Directive(Directive::Hour) => out.push_str(&format!("{:02}", instant.hour())),
                Token::Directive(Directive::Minute) => out.push_str(&format!("{:02}", instant.minute())),
                Token::Directive(Directive::Second) => out.push_str(&format!("{:02}", instant.second())),
                Token::Directive(Directive::Offset) => {
                    let secs = instant.offset().local_minus_utc();
                    let sign = if secs < 0 { '-' } else { ':' };
                    let abs = secs.abs();
                    out.push(sign);
                    out.push_str(&format!("{:02}{:02}", abs / 3600, (abs % 3600) / 60));
                }
            }
        }
        out
    }

    /// Parse `name` against this schema. `None` if it does not match.
    pub fn parse(&self, name: &str) -> Option<ParsedSnapshotName> {
        let bytes = name.as_bytes();
        let mut pos = 0usize;
        let (mut year, mut month, mut day) = (0i32, 0u32, 0u32);
        let (mut hour, mut minute, mut second) = (0u32, 0u32, 0u32);
        let mut offset = None;

        for token in &self.tokens {
            match token {
                Token::Literal(text) => {
                    if !name[pos..].starts_with(text.as_str()) {
                        return None;
                    }
                    pos += text.len();
                }
                Token::Directive(Directive::Offset) => {
                    let field = bytes.get(pos..pos + Directive::Offset.width())?;
                    let sign = match field[0] {
                        b':' => 1,
                        b'-' => -1,
                        _ => return None,
                    };
                    let hh = digits(&field[1..3])? as i32;
                    let mm = digits(&field[3..5])? as i32;
                    if mm >= 60 {
                        return None;
                    }
                    offset = Some(FixedOffset::east_opt(sign * (hh * 3600 + mm * 60))?);
                    pos += Directive::Offset.width();
                }
                Token::Directive(directive) => {
                    let width = directive.width();
                    let value = digits(bytes.get(pos..pos + width)?)?;
                    match directive {
                        Directive::Year => year = value as i32,
                        Directive::Month => month = value,
                        Directive::Day => day = value,
                        Directive::Hour => hour = value,
                        Directive::Minute => minute = value,
                        Directive::Second => second = value,
                        Directive::Offset => unreachable!("handled above"),
                    }
                    pos += width;
                }
            }
        }

        if pos != bytes.len() {
            return None;
        }

        let datetime = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;
        Some(ParsedSnapshotName {
            naming_schema: Some(self.clone()),
            name: name.to_string(),
            datetime: Some(datetime),
            offset,
        })
    }
}

fn ymd_hms(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .and_then(|date| date.and_hms_opt(hh, mm, ss))
        .unwrap_or_default()
}

fn digits(field: &[u8]) -> Option<u32> {
    let mut value = 0u32;
    for b in field {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value * 10 + u32::from(b - b'0');
    }
    Some(value)
}

fn tokenize(template: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }
        let directive = match chars.next() {
            Some('Y') => Directive::Year,
            Some('m') => Directive::Month,
            Some('d') => Directive::Day,
            Some('H') => Directive::Hour,
            Some('M') => Directive::Minute,
            Some('S') => Directive::Second,
            Some('z') => Directive::Offset,
            Some('%') => {
                literal.push('%');
                continue;
            }
            other => {
                return Err(ReplicationError::InvalidNamingSchema {
                    schema: template.to_string(),
                    reason: match other {
                        Some(c) => format!("unsupported directive %{c}"),
                        None => "dangling %".to_string(),
                    },
                })
            }
        };
        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut literal)));
        }
        tokens.push(Token::Directive(directive));
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

impl fmt::Debug for NamingSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NamingSchema").field(&self.template).finish()
    }
}

impl fmt::Display for NamingSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

impl PartialEq for NamingSchema {
    fn eq(&self, other: &Self) -> bool {
        self.template == other.template
    }
}

impl Eq for NamingSchema {}

impl Hash for NamingSchema {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.template.hash(state);
    }
}

impl PartialOrd for NamingSchema {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NamingSchema {
    fn cmp(&self, other: &Self) -> Ordering {
        self.template.cmp(&other.template)
    }
}

/// A raw snapshot name together with what a schema made of it.
///
/// `naming_schema` is `None` for names accepted without datetime semantics
/// (removal-date bookkeeping and name-pattern matching); `datetime` is then
/// `None` as well. Equality and hashing use `(schema, name)` only.
#[derive(Debug, Clone)]
pub struct ParsedSnapshotName {
    pub naming_schema: Option<NamingSchema>,
    pub name: String,
    pub datetime: Option<NaiveDateTime>,
    pub offset: Option<FixedOffset>,
}

impl ParsedSnapshotName {
    /// Accept a name without parsing it.
    pub fn unparsed(name: impl Into<String>) -> Self {
        Self {
            naming_schema: None,
            name: name.into(),
            datetime: None,
            offset: None,
        }
    }

    /// Offset-aware instant, when the schema encodes an offset.
    pub fn parsed_datetime(&self) -> Option<DateTime<FixedOffset>> {
        let offset = self.offset?;
        offset.from_local_datetime(&self.datetime?).single()
    }

    /// Local datetime with seconds, sub-seconds and offset stripped.
    pub fn idealized_datetime(&self) -> Option<NaiveDateTime> {
        self.datetime
            .and_then(|dt| dt.with_second(0))
            .and_then(|dt| dt.with_nanosecond(0))
    }

    fn sort_key(&self) -> (Option<NaiveDateTime>, bool, Reverse<i32>, &str, Option<&str>) {
        (
            self.datetime,
            self.offset.is_some(),
            Reverse(self.offset.map(|o| o.local_minus_utc()).unwrap_or(0)),
            &self.name,
            self.naming_schema.as_ref().map(NamingSchema::template),
        )
    }
}

impl PartialEq for ParsedSnapshotName {
    fn eq(&self, other: &Self) -> bool {
        self.naming_schema == other.naming_schema && self.name == other.name
    }
}

impl Eq for ParsedSnapshotName {}

impl Hash for ParsedSnapshotName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.naming_schema.hash(state);
        self.name.hash(state);
    }
}

impl PartialOrd for ParsedSnapshotName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ParsedSnapshotName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Parse `names` under one schema (or accept all of them under `None`).
/// Names that do not match are dropped silently.
pub fn parse_snapshot_names<S: AsRef<str>>(names: &[S], schema: Option<&NamingSchema>) -> Vec<ParsedSnapshotName> {
    names
        .iter()
        .filter_map(|name| match schema {
            Some(schema) => schema.parse(name.as_ref()),
            None => Some(ParsedSnapshotName::unparsed(name.as_ref())),
        })
        .collect()
}

/// Parse `names` under several schemas, one parse per raw name.
///
/// Dated schemas are tried in the order given and the first successful parse
/// wins; a later schema parsing the same name into a different datetime
/// fails the whole batch. The `None` schema is applied last and only picks up
/// names no dated schema claimed.
pub fn parse_snapshot_names_with_multiple_schemas<S: AsRef<str>>(
    names: &[S],
    schemas: &[Option<NamingSchema>],
) -> Result<Vec<ParsedSnapshotName>> {
    let mut dated: Vec<&NamingSchema> = Vec::new();
    for schema in schemas.iter().flatten() {
        if !dated.contains(&schema) {
            dated.push(schema);
        }
    }
    let accept_unparsed = schemas.iter().any(Option::is_none);

    let mut result: Vec<ParsedSnapshotName> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    for schema in dated {
        for parsed in parse_snapshot_names(names, Some(schema)) {
            match by_name.get(&parsed.name) {
                Some(&idx) => {
                    let existing = &result[idx];
                    if existing.datetime != parsed.datetime || existing.offset != parsed.offset {
                        return Err(ReplicationError::AmbiguousSnapshotName {
                            name: parsed.name.clone(),
                            schema: schema.template().to_string(),
                            first: existing.datetime.unwrap_or_default(),
                            second: parsed.datetime.unwrap_or_default(),
                        });
                    }
                }
                None => {
                    by_name.insert(parsed.name.clone(), result.len());
                    result.push(parsed);
                }
            }
        }
    }

    if accept_unparsed {
        for name in names {
            let name = name.as_ref();
            if !by_name.contains_key(name) {
                by_name.insert(name.to_string(), result.len());
                result.push(ParsedSnapshotName::unparsed(name));
            }
        }
    }

    Ok(result)
}

/// How a replication task recognises its snapshots.
#[derive(Debug, Clone)]
pub enum SnapshotNaming {
    /// Union of naming schemas; names order by their parsed datetime.
    Schemas(Vec<NamingSchema>),
    /// Full-match regular expression; names keep their listing order.
    Pattern(Regex),
}

impl SnapshotNaming {
    /// Compile a name pattern, anchored at both ends.
    pub fn pattern(pattern: &str) -> Result<Self> {
        Regex::new(&format!("^(?:{pattern})$"))
            .map(Self::Pattern)
            .map_err(|e| ReplicationError::Config(format!("invalid name pattern '{pattern}': {e}")))
    }

    /// Schemas to hand to retention parsing.
    pub fn schemas(&self) -> Vec<Option<NamingSchema>> {
        match self {
            Self::Schemas(schemas) => schemas.iter().cloned().map(Some).collect(),
            Self::Pattern(_) => vec![None],
        }
    }

    /// `true` if names are compared by datetime.
    pub fn is_dated(&self) -> bool {
        matches!(self, Self::Schemas(_))
    }

    /// `true` if `parsed` is one of ours.
    pub fn matches(&self, parsed: &ParsedSnapshotName) -> bool {
        match self {
            Self::Schemas(schemas) => parsed
                .naming_schema
                .as_ref()
                .is_some_and(|s| schemas.contains(s)),
            Self::Pattern(regex) => regex.is_match(&parsed.name),
        }
    }

    /// Recognise `names` (in listing order) and return them oldest first.
    pub fn parse_ordered<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<ParsedSnapshotName>> {
        match self {
            Self::Schemas(schemas) => {
                let schemas: Vec<Option<NamingSchema>> = schemas.iter().cloned().map(Some).collect();
                let mut parsed = parse_snapshot_names_with_multiple_schemas(names, &schemas)?;
                parsed.sort();
                Ok(parsed)
            }
            Self::Pattern(regex) => Ok(names
                .iter()
                .map(AsRef::as_ref)
                .filter(|name| regex.is_match(name))
                .map(ParsedSnapshotName::unparsed)
                .collect()),
        }
    }
}
