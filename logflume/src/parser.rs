//! Line and timestamp parsing for input plugins.
//!
//! A [`Parser`] turns one raw line into a [`Record`]; a [`TimeParser`] turns
//! a record field into a UTC timestamp. [`get`] is the factory input plugins
//! call with the user's configured `format` / `time_format` / `timezone`
//! triple.
//!
//! Built-in formats:
//!
//! - `""`, `"none"`, `"raw"` — the whole line under the `message` key
//! - `"json"` — the line is a JSON object
//! - `"ltsv"` — labeled tab-separated values (`key:value` pairs)
//! - `"/.../"` — a regular expression; named captures become record fields

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::message::Record;

/// The record key the raw parser stores the line under.
pub const RAW_MESSAGE_KEY: &str = "message";

/// Parsing errors.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The configured format name is not recognized.
    #[error("unknown parser format: {0}")]
    UnknownFormat(String),

    /// A regex format failed to compile.
    #[error("invalid regex format: {0}")]
    Regex(#[from] regex::Error),

    /// A JSON line failed to parse.
    #[error("invalid JSON line: {0}")]
    Json(#[from] serde_json::Error),

    /// A JSON line parsed but was not an object.
    #[error("JSON line is not an object")]
    NotAnObject,

    /// The line did not match the configured pattern.
    #[error("line does not match pattern")]
    NoMatch,

    /// An LTSV field was missing its `key:value` separator.
    #[error("malformed LTSV field: {0}")]
    MalformedLtsv(String),

    /// A timestamp value could not be interpreted.
    #[error("unparseable time value: {0}")]
    Time(String),

    /// The configured timezone string could not be interpreted.
    #[error("invalid timezone: {0}")]
    Timezone(String),
}

/// Turns one raw line into a record.
pub trait Parser: Send + Sync {
    /// Parse a line. The terminator has already been stripped.
    fn parse(&self, line: &str) -> Result<Record, ParseError>;
}

/// Fallback parser: the whole line under [`RAW_MESSAGE_KEY`]. Never fails.
#[derive(Debug, Default)]
pub struct RawParser;

impl Parser for RawParser {
    fn parse(&self, line: &str) -> Result<Record, ParseError> {
        let mut record = Record::new();
        record.insert(RAW_MESSAGE_KEY.into(), Value::String(line.to_string()));
        Ok(record)
    }
}

/// Each line is a JSON object.
#[derive(Debug, Default)]
pub struct JsonParser;

impl Parser for JsonParser {
    fn parse(&self, line: &str) -> Result<Record, ParseError> {
        match serde_json::from_str::<Value>(line)? {
            Value::Object(record) => Ok(record),
            _ => Err(ParseError::NotAnObject),
        }
    }
}

/// Labeled tab-separated values: `key:value` fields joined by tabs.
#[derive(Debug, Default)]
pub struct LtsvParser;

impl Parser for LtsvParser {
    fn parse(&self, line: &str) -> Result<Record, ParseError> {
        let mut record = Record::new();
        for field in line.split('\t').filter(|f| !f.is_empty()) {
            let (key, value) = field
                .split_once(':')
                .ok_or_else(|| ParseError::MalformedLtsv(field.to_string()))?;
            record.insert(key.to_string(), Value::String(value.to_string()));
        }
        Ok(record)
    }
}

/// A regular expression whose named captures become record fields.
#[derive(Debug)]
pub struct RegexParser {
    pattern: Regex,
}

impl RegexParser {
    /// Compile a parser from a pattern (without the surrounding slashes).
    pub fn new(pattern: &str) -> Result<Self, ParseError> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }
}

impl Parser for RegexParser {
    fn parse(&self, line: &str) -> Result<Record, ParseError> {
        let captures = self.pattern.captures(line).ok_or(ParseError::NoMatch)?;
        let mut record = Record::new();
        for name in self.pattern.capture_names().flatten() {
            if let Some(m) = captures.name(name) {
                record.insert(name.to_string(), Value::String(m.as_str().to_string()));
            }
        }
        Ok(record)
    }
}

/// Turns a record field into a UTC timestamp.
///
/// With an explicit `time_format` the value must be a string in that format;
/// a `%z` in the format wins over the configured timezone offset. Without a
/// format, RFC 3339 strings and numeric epoch values are accepted.
#[derive(Debug, Clone)]
pub struct TimeParser {
    format: Option<String>,
    offset: Option<FixedOffset>,
}

impl TimeParser {
    /// Build a time parser from the configured format and timezone strings.
    pub fn new(time_format: &str, timezone: &str) -> Result<Self, ParseError> {
        Ok(Self {
            format: (!time_format.is_empty()).then(|| time_format.to_string()),
            offset: parse_timezone(timezone)?,
        })
    }

    /// Interpret a record value as a timestamp.
    pub fn parse(&self, value: &Value) -> Result<DateTime<Utc>, ParseError> {
        match value {
            Value::String(s) => self.parse_str(s),
            Value::Number(n) => {
                if let Some(secs) = n.as_i64() {
                    Utc.timestamp_opt(secs, 0)
                        .single()
                        .ok_or_else(|| ParseError::Time(n.to_string()))
                } else if let Some(secs) = n.as_f64() {
                    let whole = secs.trunc() as i64;
                    let nanos = (secs.fract() * 1e9) as u32;
                    Utc.timestamp_opt(whole, nanos)
                        .single()
                        .ok_or_else(|| ParseError::Time(n.to_string()))
                } else {
                    Err(ParseError::Time(n.to_string()))
                }
            }
            other => Err(ParseError::Time(other.to_string())),
        }
    }

    fn parse_str(&self, s: &str) -> Result<DateTime<Utc>, ParseError> {
        if let Some(format) = &self.format {
            // Formats carrying their own offset parse directly to an instant.
            if let Ok(dt) = DateTime::parse_from_str(s, format) {
                return Ok(dt.with_timezone(&Utc));
            }
            let naive = NaiveDateTime::parse_from_str(s, format)
                .map_err(|e| ParseError::Time(format!("{s}: {e}")))?;
            let offset = self.offset.unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
            return offset
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| ParseError::Time(s.to_string()));
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.with_timezone(&Utc));
        }
        if let Ok(secs) = s.parse::<i64>() {
            return Utc
                .timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| ParseError::Time(s.to_string()));
        }
        Err(ParseError::Time(s.to_string()))
    }
}

/// Interpret a timezone string as a fixed UTC offset.
///
/// Accepts `""` (none configured), `UTC`/`Z`, and `±HH:MM` / `±HHMM`.
fn parse_timezone(tz: &str) -> Result<Option<FixedOffset>, ParseError> {
    if tz.is_empty() {
        return Ok(None);
    }
    if tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return Ok(FixedOffset::east_opt(0));
    }
    let (sign, rest) = if let Some(rest) = tz.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = tz.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(ParseError::Timezone(tz.to_string()));
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ParseError::Timezone(tz.to_string()));
    }
    let hours: i32 = digits[..2].parse().unwrap();
    let minutes: i32 = digits[2..].parse().unwrap();
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .map(Some)
        .ok_or_else(|| ParseError::Timezone(tz.to_string()))
}

/// Resolve the configured `(format, time_format, timezone)` triple into a
/// line parser and a time parser.
pub fn get(
    format: &str,
    time_format: &str,
    timezone: &str,
) -> Result<(Arc<dyn Parser>, TimeParser), ParseError> {
    let parser: Arc<dyn Parser> = match format {
        "" | "none" | "raw" => Arc::new(RawParser),
        "json" => Arc::new(JsonParser),
        "ltsv" => Arc::new(LtsvParser),
        f if f.len() >= 2 && f.starts_with('/') && f.ends_with('/') => {
            Arc::new(RegexParser::new(&f[1..f.len() - 1])?)
        }
        other => return Err(ParseError::UnknownFormat(other.to_string())),
    };
    Ok((parser, TimeParser::new(time_format, timezone)?))
}
