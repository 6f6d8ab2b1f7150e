//! Roster parsing.
//!
//! A roster upload is either a JSON array of email strings or a CSV file with
//! a header row containing exactly one `email` column. Detection is a plain
//! two-way decision made by [`sniff`]: anything that decodes as JSON is treated
//! as JSON, everything else is handed to the CSV reader.
//!
//! The output is deduplicated while keeping first-seen order.

use std::collections::HashSet;

use serde_json::Value;
use thiserror::Error;

/// Longest email accepted in a roster (RFC 5321 path limit).
pub const MAX_EMAIL_LEN: usize = 320;

/// Name of the CSV column holding student emails (matched case-insensitively).
pub const EMAIL_COLUMN: &str = "email";

/// Roster format errors.
///
/// Every variant is a format error: the upload cannot be turned into a roster
/// and the caller should see the message verbatim.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RosterError {
    #[error("roster is not valid UTF-8")]
    NotUtf8,

    #[error("roster JSON must be an array of email strings, found {found}")]
    NotAnArray { found: &'static str },

    #[error("roster entry {index} is not a string")]
    NonStringEntry { index: usize },

    #[error("invalid CSV roster: {0}")]
    Csv(String),

    #[error("CSV roster must have exactly one 'email' column, found {found}")]
    EmailColumn { found: usize },

    #[error("roster entry {index} is not a valid email: {value:?}")]
    InvalidEmail { index: usize, value: String },
}

/// Outcome of format detection.
#[derive(Debug, Clone, PartialEq)]
pub enum RosterSource<'a> {
    /// The buffer decoded as a JSON document.
    Json(Value),
    /// The buffer is not JSON; treat it as CSV text with a header row.
    Csv(&'a str),
}

/// Decide which decoder applies to `buffer`.
pub fn sniff(buffer: &[u8]) -> Result<RosterSource<'_>, RosterError> {
    let text = std::str::from_utf8(buffer).map_err(|_| RosterError::NotUtf8)?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    match serde_json::from_str::<Value>(text) {
        Ok(value) => Ok(RosterSource::Json(value)),
        Err(_) => Ok(RosterSource::Csv(text)),
    }
}

/// Parse an uploaded roster file.
pub fn parse(buffer: &[u8]) -> Result<Roster, RosterError> {
    let raw = match sniff(buffer)? {
        RosterSource::Json(value) => json_entries(value)?,
        RosterSource::Csv(text) => csv_entries(text)?,
    };
    Roster::from_entries(raw)
}

fn json_entries(value: Value) -> Result<Vec<String>, RosterError> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(RosterError::NotAnArray {
                found: json_kind(&other),
            })
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::String(s) => Ok(s),
            _ => Err(RosterError::NonStringEntry { index }),
        })
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn csv_entries(text: &str) -> Result<Vec<String>, RosterError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| RosterError::Csv(e.to_string()))?
        .clone();

    let email_columns: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, name)| name.eq_ignore_ascii_case(EMAIL_COLUMN))
        .map(|(i, _)| i)
        .collect();

    let [column] = email_columns[..] else {
        return Err(RosterError::EmailColumn {
            found: email_columns.len(),
        });
    };

    let mut entries = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| RosterError::Csv(e.to_string()))?;
        match record.get(column) {
            Some(value) if !value.is_empty() => entries.push(value.to_string()),
            // Blank cells are treated like blank lines.
            _ => {}
        }
    }

    Ok(entries)
}

/// Syntactic email check. Deliberately loose: one `@`, non-empty local part,
/// a dotted domain, no whitespace or control characters.
pub fn is_valid_email(value: &str) -> bool {
    if value.is_empty() || value.len() > MAX_EMAIL_LEN {
        return false;
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }

    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };

    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

/// A deduplicated, ordered list of student emails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster(Vec<String>);

impl Roster {
    /// Validate and deduplicate raw entries, keeping first-seen order.
    pub fn from_entries<I, S>(entries: I) -> Result<Self, RosterError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut emails = Vec::new();

        for (index, entry) in entries.into_iter().enumerate() {
            let entry: String = entry.into();
            let email = entry.trim();
            if !is_valid_email(email) {
                return Err(RosterError::InvalidEmail {
                    index,
                    value: entry.clone(),
                });
            }
            if seen.insert(email.to_string()) {
                emails.push(email.to_string());
            }
        }

        Ok(Self(emails))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl<'a> IntoIterator for &'a Roster {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_json_dedup_preserves_order() {
        let roster = parse(br#"["a@x.com","b@x.com","a@x.com"]"#).unwrap();
        assert_eq!(roster.as_slice(), ["a@x.com", "b@x.com"]);
    }

    #[test]
    fn test_csv_with_email_header() {
        let roster = parse(b"email\nalice@school.edu\nbob@school.edu\n").unwrap();
        assert_eq!(roster.as_slice(), ["alice@school.edu", "bob@school.edu"]);
    }

    #[test]
    fn test_csv_extra_columns_and_padding() {
        let csv = "name, Email \nAlice , alice@school.edu\nBob,  bob@school.edu \nAlice again,alice@school.edu\n";
        let roster = parse(csv.as_bytes()).unwrap();
        assert_eq!(roster.as_slice(), ["alice@school.edu", "bob@school.edu"]);
    }

    #[test]
    fn test_csv_skips_blank_cells() {
        let roster = parse(b"name,email\nAlice,alice@school.edu\nNobody,\n").unwrap();
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_csv_utf8_bom() {
        let mut buf = vec![0xEF, 0xBB, 0xBF];
        buf.extend_from_slice(b"email\nalice@school.edu\n");
        let roster = parse(&buf).unwrap();
        assert_eq!(roster.as_slice(), ["alice@school.edu"]);
    }

    #[test]
    fn test_sniff_is_two_way() {
        assert!(matches!(sniff(b"[]").unwrap(), RosterSource::Json(_)));
        assert!(matches!(sniff(b"email\n").unwrap(), RosterSource::Csv("email\n")));
    }

    #[test]
    fn test_empty_json_array_is_empty_roster() {
        let roster = parse(b"[]").unwrap();
        assert!(roster.is_empty());
    }

    #[rstest]
    #[case::object(br#"{"email":"a@x.com"}"#.as_slice(), RosterError::NotAnArray { found: "an object" })]
    #[case::number(b"42".as_slice(), RosterError::NotAnArray { found: "a number" })]
    #[case::non_string(br#"["a@x.com", 7]"#.as_slice(), RosterError::NonStringEntry { index: 1 })]
    #[case::no_email_column(b"name\nAlice\n".as_slice(), RosterError::EmailColumn { found: 0 })]
    #[case::two_email_columns(b"email,EMAIL\na@x.com,b@x.com\n".as_slice(), RosterError::EmailColumn { found: 2 })]
    #[case::not_utf8(b"\xff\xfe\xfd".as_slice(), RosterError::NotUtf8)]
    fn test_format_errors(#[case] input: &[u8], #[case] expected: RosterError) {
        assert_eq!(parse(input).unwrap_err(), expected);
    }

    #[test]
    fn test_ragged_csv_is_format_error() {
        let err = parse(b"email,name\na@x.com,Alice,extra\n").unwrap_err();
        assert!(matches!(err, RosterError::Csv(_)));
    }

    #[test]
    fn test_invalid_email_reports_entry() {
        let err = parse(br#"["a@x.com","not-an-email"]"#).unwrap_err();
        assert_eq!(
            err,
            RosterError::InvalidEmail {
                index: 1,
                value: "not-an-email".to_string()
            }
        );
    }

    #[rstest]
    #[case("alice@school.edu", true)]
    #[case("first.last+tag@sub.school.edu", true)]
    #[case("", false)]
    #[case("@school.edu", false)]
    #[case("alice@", false)]
    #[case("alice@localhost", false)]
    #[case("alice@@school.edu", false)]
    #[case("al ice@school.edu", false)]
    #[case("alice@school.edu.", false)]
    fn test_is_valid_email(#[case] input: &str, #[case] valid: bool) {
        assert_eq!(is_valid_email(input), valid);
    }
}
