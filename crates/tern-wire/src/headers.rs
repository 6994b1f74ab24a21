// Header block grammar shared by HMSG (inbound) and HPUB (outbound).
//
// A block is `NATS/1.0[ <status>]\r\n` followed by `Name: value\r\n` lines
// and a closing blank line. The grammar here is deliberately conservative:
// anything that does not match is a hard error rather than a silent drop.
use bytes::BytesMut;

use crate::{Error, Result};

pub const HEADER_VERSION: &str = "NATS/1.0";
const CRLF: &[u8] = b"\r\n";

/// Insertion-ordered multimap of message headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
    status: Option<String>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header entry. Repeated names are kept in order.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Inline status token from the version line (e.g. `503` on a
    /// no-responders message), if the server sent one.
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a complete header block, including the trailing blank line.
    pub fn parse(block: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(block)
            .map_err(|_| Error::BadHeaders("header block is not UTF-8".to_string()))?;
        let body = text
            .strip_suffix("\r\n\r\n")
            .ok_or_else(|| Error::BadHeaders("missing blank-line terminator".to_string()))?;
        let mut lines = body.split("\r\n");
        let version_line = lines
            .next()
            .ok_or_else(|| Error::BadHeaders("empty header block".to_string()))?;
        let status = match version_line.strip_prefix(HEADER_VERSION) {
            Some("") => None,
            Some(rest) if rest.starts_with(' ') => Some(rest.trim().to_string()),
            _ => {
                return Err(Error::BadHeaders(format!(
                    "unexpected version line: {version_line}"
                )));
            }
        };
        let mut map = Self {
            entries: Vec::new(),
            status,
        };
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::BadHeaders(format!("missing colon in line: {line}")))?;
            if name.is_empty() || name.contains(' ') || name.contains('\t') {
                return Err(Error::BadHeaders(format!("invalid header name: {name}")));
            }
            map.entries
                .push((name.to_string(), value.trim_start().to_string()));
        }
        Ok(map)
    }

    /// Exact encoded size, used for the HPUB length fields.
    pub fn encoded_len(&self) -> usize {
        let mut len = HEADER_VERSION.len() + CRLF.len();
        if let Some(status) = &self.status {
            len += 1 + status.len();
        }
        for (name, value) in &self.entries {
            len += name.len() + 2 + value.len() + CRLF.len();
        }
        len + CRLF.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(HEADER_VERSION.as_bytes());
        if let Some(status) = &self.status {
            buf.extend_from_slice(b" ");
            buf.extend_from_slice(status.as_bytes());
        }
        buf.extend_from_slice(CRLF);
        for (name, value) in &self.entries {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(CRLF);
        }
        buf.extend_from_slice(CRLF);
    }
}
