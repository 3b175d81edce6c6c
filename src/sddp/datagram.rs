/*!
The SDDP datagram: a statement line, case-insensitive headers kept in both
raw (wire string) and decoded (JSON-typed) form, and an opaque body.

Parsing accepts both CRLF and bare LF line endings and any of the four
blank-line variants between headers and body; serialization always emits
CRLF and sorts headers by name, matching the canonical form a datagram is
compared against for round-trip equality.
*/

use crate::error::{self, DatagramFormatError};
use std::collections::HashMap;
use std::fmt;

use super::constants::SDDP_PORT;

// ------------------------------------------------------------------------------------------------
// Header value
// ------------------------------------------------------------------------------------------------

/// A decoded header value: the result of JSON-parsing a raw header string.
#[derive(Clone, Debug, PartialEq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Float(f64),
}

impl HeaderValue {
    /// The raw (JSON-encoded) wire representation of this value.
    pub fn to_raw_string(&self) -> String {
        match self {
            HeaderValue::String(s) => {
                serde_json::to_string(s).unwrap_or_else(|_| s.clone())
            }
            HeaderValue::Int(i) => i.to_string(),
            // `f64::to_string()` omits the fractional part for whole
            // numbers (`60.0` -> `"60"`), which would decode back as an
            // `Int`, not a `Float`. Go through serde_json so the encoding
            // always round-trips to the same variant.
            HeaderValue::Float(f) => {
                serde_json::to_string(f).unwrap_or_else(|_| f.to_string())
            }
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::String(s) => write!(f, "{}", s),
            HeaderValue::Int(i) => write!(f, "{}", i),
            HeaderValue::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::String(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::String(s)
    }
}

impl From<i64> for HeaderValue {
    fn from(i: i64) -> Self {
        HeaderValue::Int(i)
    }
}

fn decode_value(raw: &str) -> Option<HeaderValue> {
    let parsed: serde_json::Value = serde_json::from_str(raw).ok()?;
    match parsed {
        serde_json::Value::String(s) => Some(HeaderValue::String(s)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(HeaderValue::Int(i))
            } else {
                n.as_f64().map(HeaderValue::Float)
            }
        }
        _ => None,
    }
}

// ------------------------------------------------------------------------------------------------
// Case-insensitive map, preserving the casing of the most recent write
// ------------------------------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
struct CaseMap<V> {
    entries: HashMap<String, (String, V)>,
}

impl<V> CaseMap<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn get(&self, name: &str) -> Option<&V> {
        self.entries.get(&name.to_ascii_lowercase()).map(|(_, v)| v)
    }

    fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    fn insert(&mut self, name: &str, value: V) {
        self.entries
            .insert(name.to_ascii_lowercase(), (name.to_string(), value));
    }

    fn remove(&mut self, name: &str) -> Option<V> {
        self.entries
            .remove(&name.to_ascii_lowercase())
            .map(|(_, v)| v)
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.values().map(|(name, v)| (name.as_str(), v))
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|(name, _)| name.as_str())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<V: PartialEq> PartialEq for CaseMap<V> {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().all(|(k, (_, v))| {
                other.entries.get(k).map_or(false, |(_, ov)| ov == v)
            })
    }
}

// ------------------------------------------------------------------------------------------------
// Datagram
// ------------------------------------------------------------------------------------------------

/// An SDDP datagram: a statement line, a set of case-insensitive headers
/// (kept in both raw and JSON-decoded form), and an optional body.
#[derive(Clone, Debug)]
pub struct Datagram {
    statement_line: String,
    raw_headers: CaseMap<String>,
    headers: CaseMap<HeaderValue>,
    body: Vec<u8>,
}

impl PartialEq for Datagram {
    fn eq(&self, other: &Self) -> bool {
        self.statement_line == other.statement_line
            && self.raw_headers == other.raw_headers
            && self.body == other.body
    }
}

impl Eq for Datagram {}

impl Datagram {
    /// Construct a new datagram with no headers and an empty body.
    pub fn new(statement_line: impl Into<String>) -> Self {
        Self {
            statement_line: statement_line.into(),
            raw_headers: CaseMap::new(),
            headers: CaseMap::new(),
            body: Vec::new(),
        }
    }

    /// Construct a datagram from a statement line and a set of decoded
    /// headers. Each header is JSON-encoded into the raw map as it is set.
    pub fn with_headers<I, K>(statement_line: impl Into<String>, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, HeaderValue)>,
        K: AsRef<str>,
    {
        let mut datagram = Self::new(statement_line);
        for (name, value) in headers {
            datagram.set_header(name.as_ref(), Some(value));
        }
        datagram
    }

    /// Parse a datagram from its wire representation.
    pub fn parse(data: &[u8]) -> Result<Self, DatagramFormatError> {
        let (statement_bytes, remainder) = split_at_first_line(data);
        let statement_line = String::from_utf8_lossy(statement_bytes).into_owned();
        let (header_bytes, body) = split_headers_and_body(remainder);
        let raw_headers = parse_header_lines(header_bytes)?;
        let headers = decode_all(&raw_headers);
        Ok(Self {
            statement_line,
            raw_headers,
            headers,
            body: body.to_vec(),
        })
    }

    /// Serialize this datagram to its canonical wire representation:
    /// statement line, CRLF, headers sorted by name each followed by CRLF,
    /// then a blank line and the body iff the body is non-empty.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if !self.statement_line.is_empty() {
            out.extend_from_slice(self.statement_line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        let mut names: Vec<&str> = self.raw_headers.names().collect();
        names.sort_unstable();
        for name in names {
            if let Some(value) = self.raw_headers.get(name) {
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
        if !self.body.is_empty() {
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&self.body);
        }
        out
    }

    pub fn statement_line(&self) -> &str {
        &self.statement_line
    }

    pub fn set_statement_line(&mut self, line: impl Into<String>) {
        self.statement_line = line.into();
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn is_empty_body(&self) -> bool {
        self.body.is_empty()
    }

    /// The raw (wire-string) value of a header, looked up case-insensitively.
    pub fn raw_header(&self, name: &str) -> Option<&str> {
        self.raw_headers.get(name).map(|s| s.as_str())
    }

    /// The JSON-decoded value of a header, looked up case-insensitively.
    /// Absent if the header is unset, or its raw value is not valid JSON.
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn contains_header(&self, name: &str) -> bool {
        self.raw_headers.contains(name)
    }

    pub fn header_count(&self) -> usize {
        self.raw_headers.len()
    }

    pub fn raw_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.raw_headers.iter().map(|(n, v)| (n, v.as_str()))
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.headers.iter()
    }

    /// Set (or, if `value` is `None`, delete) a header's raw string value.
    /// The decoded map is kept in sync: a non-JSON raw value simply has no
    /// decoded counterpart.
    pub fn set_raw_header(&mut self, name: &str, value: Option<impl Into<String>>) {
        match value {
            None => {
                self.raw_headers.remove(name);
                self.headers.remove(name);
            }
            Some(v) => {
                let v = v.into();
                match decode_value(&v) {
                    Some(decoded) => {
                        self.headers.insert(name, decoded);
                    }
                    None => {
                        self.headers.remove(name);
                    }
                }
                self.raw_headers.insert(name, v);
            }
        }
    }

    /// Set (or, if `value` is `None`, delete) a header's decoded value. The
    /// raw map always receives the JSON encoding of the written value.
    pub fn set_header(&mut self, name: &str, value: Option<HeaderValue>) {
        match value {
            None => {
                self.raw_headers.remove(name);
                self.headers.remove(name);
            }
            Some(v) => {
                self.raw_headers.insert(name, v.to_raw_string());
                self.headers.insert(name, v);
            }
        }
    }

    pub fn del_header(&mut self, name: &str) {
        self.raw_headers.remove(name);
        self.headers.remove(name);
    }

    /// Remove every header, raw and decoded alike.
    pub fn clear_headers(&mut self) {
        self.raw_headers.clear();
        self.headers.clear();
    }

    /// Re-derive the decoded map from the raw map, discarding any decoded
    /// entry whose raw value does not (or no longer) parse as JSON.
    pub fn clear_decoded_headers(&mut self) {
        self.headers = decode_all(&self.raw_headers);
    }

    /// An independent clone of this datagram.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    // -- typed accessors, matching the well-known SDDP headers --------------------------------
    //
    // These read the *decoded* value: on the wire a string header is
    // JSON-encoded (quoted), so "Host: h:1902" travels as `"h:1902"`.

    pub fn host(&self) -> Option<(String, u16)> {
        self.decoded_str("Host").and_then(parse_host_port)
    }

    pub fn from_addr(&self) -> Option<(String, u16)> {
        self.decoded_str("From").and_then(parse_host_port)
    }

    pub fn max_age(&self) -> Option<i64> {
        self.header("Max-Age").and_then(HeaderValue::as_i64)
    }

    pub fn sddp_type(&self) -> Option<&str> {
        self.decoded_str("Type")
    }

    pub fn primary_proxy(&self) -> Option<&str> {
        self.decoded_str("Primary-Proxy")
    }

    pub fn proxies(&self) -> Option<Vec<String>> {
        self.decoded_str("Proxies").map(|v| {
            if v.is_empty() {
                Vec::new()
            } else {
                v.split(',').map(|s| s.trim().to_string()).collect()
            }
        })
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.decoded_str("Manufacturer")
    }

    pub fn model(&self) -> Option<&str> {
        self.decoded_str("Model")
    }

    pub fn driver(&self) -> Option<&str> {
        self.decoded_str("Driver")
    }

    fn decoded_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(HeaderValue::as_str)
    }
}

fn parse_host_port(value: &str) -> Option<(String, u16)> {
    match value.rsplit_once(':') {
        Some((host, port)) => port.parse::<u16>().ok().map(|p| (host.to_string(), p)),
        None => Some((value.to_string(), SDDP_PORT)),
    }
}

fn decode_all(raw: &CaseMap<String>) -> CaseMap<HeaderValue> {
    let mut out = CaseMap::new();
    for (name, value) in raw.iter() {
        if let Some(decoded) = decode_value(value) {
            out.insert(name, decoded);
        }
    }
    out
}

/// Split off the first line (the statement line), accepting CRLF or bare
/// LF, and return `(line, remainder)` with the delimiter removed.
fn split_at_first_line(data: &[u8]) -> (&[u8], &[u8]) {
    match data.iter().position(|&b| b == b'\n') {
        Some(pos) => {
            let mut end = pos;
            if end > 0 && data[end - 1] == b'\r' {
                end -= 1;
            }
            (&data[..end], &data[pos + 1..])
        }
        None => (data, &[]),
    }
}

/// Split header bytes from an optional body, accepting `\r\n\r\n`,
/// `\n\n`, `\r\n\n`, and `\n\r\n` as the separating blank line. If no
/// separator is found, everything is headers and the body is empty.
fn split_headers_and_body(data: &[u8]) -> (&[u8], &[u8]) {
    let delims: [&[u8]; 2] = [b"\n\r\n", b"\n\n"];
    let mut best: Option<(usize, usize)> = None;
    for delim in delims.iter() {
        if let Some(pos) = find_subslice(data, delim) {
            best = match best {
                Some((bp, _)) if bp <= pos => best,
                _ => Some((pos, delim.len())),
            };
        }
    }
    match best {
        None => (data, &[]),
        Some((pos, dlen)) => {
            let mut headers = &data[..pos];
            let body = &data[pos + dlen..];
            if headers.last() == Some(&b'\r') {
                headers = &headers[..headers.len() - 1];
            }
            (headers, body)
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parse `Name: Value` header lines, accepting CRLF or bare LF between
/// lines and RFC 2822-style folded continuation lines (leading whitespace).
fn parse_header_lines(data: &[u8]) -> Result<CaseMap<String>, DatagramFormatError> {
    let text = String::from_utf8_lossy(data).replace("\r\n", "\n");
    let mut raw = CaseMap::new();
    let mut last_name: Option<String> = None;
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        if (line.starts_with(' ') || line.starts_with('\t')) && last_name.is_some() {
            let name = last_name.clone().unwrap_or_default();
            let folded = format!(
                "{} {}",
                raw.get(&name).cloned().unwrap_or_default(),
                line.trim()
            );
            raw.insert(&name, folded);
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| error::invalid_header_line(line))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(error::invalid_header_line(line));
        }
        raw.insert(name, value.trim().to_string());
        last_name = Some(name.to_string());
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trip_canonical_form() {
        let datagram = Datagram::with_headers(
            "SDDP/1.0 200 OK",
            vec![
                ("Max-Age", HeaderValue::Int(1800)),
                ("Host", HeaderValue::String("h:1902".to_string())),
                ("Type", HeaderValue::String("x".to_string())),
            ],
        );
        let bytes = datagram.to_bytes();
        let parsed = Datagram::parse(&bytes).expect("parse");
        assert_eq!(datagram, parsed);
        let bytes_again = parsed.to_bytes();
        assert_eq!(bytes, bytes_again);
    }

    #[test]
    fn empty_body_no_trailing_newline() {
        let data = b"SDDP/1.0 200 OK\r\nHost: \"h:1902\"";
        let datagram = Datagram::parse(data).expect("parse");
        assert!(datagram.is_empty_body());
        assert_eq!(datagram.raw_header("Host"), Some("\"h:1902\""));
        let bytes = datagram.to_bytes();
        assert!(bytes.ends_with(b"\r\n"));
        assert!(!bytes.ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn string_vs_int_header_value() {
        let mut datagram = Datagram::new("NOTIFY ALIVE SDDP/1.0");
        datagram.set_raw_header("A", Some("\"123\""));
        datagram.set_raw_header("B", Some("123"));
        assert_eq!(
            datagram.header("A"),
            Some(&HeaderValue::String("123".to_string()))
        );
        assert_eq!(datagram.header("B"), Some(&HeaderValue::Int(123)));
    }

    #[test]
    fn case_insensitive_header_lookup() {
        let mut datagram = Datagram::new("NOTIFY ALIVE SDDP/1.0");
        datagram.set_header("Type", Some(HeaderValue::String("acme:X".to_string())));
        assert_eq!(datagram.raw_header("type"), datagram.raw_header("TYPE"));
        assert_eq!(datagram.raw_header("TYPE"), Some("\"acme:X\""));
    }

    #[test]
    fn decode_failure_keeps_raw_only() {
        let mut datagram = Datagram::new("NOTIFY ALIVE SDDP/1.0");
        datagram.set_raw_header("Foo", Some("not json"));
        assert_eq!(datagram.raw_header("Foo"), Some("not json"));
        assert!(datagram.header("Foo").is_none());
    }

    #[test]
    fn null_value_deletes_header() {
        let mut datagram = Datagram::new("NOTIFY ALIVE SDDP/1.0");
        datagram.set_header("Type", Some(HeaderValue::String("x".to_string())));
        datagram.set_header("Type", None);
        assert!(!datagram.contains_header("Type"));
    }

    #[test]
    fn max_age_and_proxies_accessors() {
        let datagram = Datagram::with_headers(
            "NOTIFY ALIVE SDDP/1.0",
            vec![
                ("Max-Age", HeaderValue::Int(1800)),
                ("Proxies", HeaderValue::String("a,b, c".to_string())),
            ],
        );
        assert_eq!(datagram.max_age(), Some(1800));
        assert_eq!(
            datagram.proxies(),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn host_defaults_port_when_absent() {
        let datagram =
            Datagram::with_headers("NOTIFY ALIVE SDDP/1.0", vec![("Host", HeaderValue::from("1.2.3.4"))]);
        assert_eq!(datagram.host(), Some(("1.2.3.4".to_string(), SDDP_PORT)));
    }

    #[test]
    fn whole_number_float_header_round_trips_as_float() {
        let mut datagram = Datagram::new("NOTIFY ALIVE SDDP/1.0");
        datagram.set_header("Uptime", Some(HeaderValue::Float(60.0)));
        assert_eq!(datagram.raw_header("Uptime"), Some("60.0"));
        assert_eq!(datagram.header("Uptime"), Some(&HeaderValue::Float(60.0)));
    }
}
