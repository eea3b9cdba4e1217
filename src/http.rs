//! HTTP/1.x request head parsing.

use std::collections::HashMap;

use crate::util::find;

/// To prevent a malformed request from eating up too much memory, give up once the header block
/// exceeds this many bytes.
pub const MAX_HEADER_LENGTH: usize = 16 << 10;

/// Locate the end of the header block. Returns `(header_len, body_start)`.
pub fn find_header_end(data: &[u8]) -> Option<(usize, usize)> {
    let crlf = find(b"\r\n\r\n", data).map(|pos| (pos, pos + 4));
    let lf = find(b"\n\n", data).map(|pos| (pos, pos + 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Request line and headers. Header names are stored lower-cased.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    headers: HashMap<String, String>,
}

impl RequestHead {
    /// Parse a header block (without the terminating blank line). Returns None if the request
    /// line is malformed.
    pub fn parse(block: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(block);
        let mut lines = text.split('\n').map(|line| line.trim_end_matches('\r'));

        let mut request_line = lines.next()?.split(' ').filter(|part| !part.is_empty());
        let method = request_line.next()?.to_uppercase();
        let target = request_line.next()?.to_string();
        let version = request_line.next()?.to_string();
        if request_line.next().is_some() || !version.to_uppercase().starts_with("HTTP/") {
            return None;
        }

        let mut headers = HashMap::new();
        for line in lines {
            // Lines without a colon are ignored rather than rejected.
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        Some(Self {
            method,
            target,
            version,
            headers,
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Declared body length. `Some(Err(()))` for an unparseable value.
    pub fn content_length(&self) -> Option<Result<u64, ()>> {
        self.header("content-length")
            .map(|value| value.parse::<u64>().map_err(|_| ()))
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map_or(false, |value| value.to_ascii_lowercase().contains("chunked"))
    }
}

/// Parse a `Range: bytes=start-end` or `bytes=start-` value against a file size. Only the first
/// range of a list is considered. Returns the inclusive `(start, end)` or None if the range is
/// unusable, in which case the whole file should be sent.
pub fn parse_range(value: &str, file_len: u64) -> Option<(u64, u64)> {
    let ranges = value.trim().strip_prefix("bytes=")?;
    let first = ranges.split(',').next()?.trim();
    let (start, end) = first.split_once('-')?;
    let start: u64 = parse_offset(start)?;
    let end: u64 = if end.trim().is_empty() {
        file_len.checked_sub(1)?
    } else {
        parse_offset(end)?
    };
    if start > end || end >= file_len {
        return None;
    }
    Some((start, end))
}

fn parse_offset(digits: &str) -> Option<u64> {
    let digits = digits.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Reason phrase for the status codes this server emits.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        206 => "Partial Content",
        302 => "Found",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Request Entity Too Large",
        500 => "Internal Server Error",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
