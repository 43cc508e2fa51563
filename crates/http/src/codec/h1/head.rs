//! Start line and header line grammar, scanned by hand.
//!
//! | line           | grammar                                      |
//! |----------------|----------------------------------------------|
//! | request line   | `[A-Z]+\s+[^\s]+\s+HTTP/\d\.\d`              |
//! | status line    | `HTTP/1\.\d\s+\d+(\s+[^\r\n]*)?`             |
//! | header line    | `[^\s:]+:\s*[^\r\n]*`                        |
//!
//! Lines are passed without their terminating CRLF.

use crate::utils::{CRLF, index_of};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLine<'a> {
    pub method: &'a str,
    pub target: &'a str,
    pub version: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusLine<'a> {
    pub version: &'a str,
    pub status: u16,
    pub reason: &'a str,
}

#[inline]
fn is_space(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\r' | b'\n' | 0x0b | 0x0c)
}

fn skip_spaces(line: &[u8], from: usize) -> usize {
    line[from..].iter().position(|b| !is_space(*b)).map_or(line.len(), |offset| from + offset)
}

fn take_while(line: &[u8], from: usize, predicate: impl Fn(u8) -> bool) -> usize {
    line[from..].iter().position(|b| !predicate(*b)).map_or(line.len(), |offset| from + offset)
}

/// Matches `HTTP/\d\.\d`.
fn is_version(version: &[u8]) -> bool {
    version.len() == 8
        && version.starts_with(b"HTTP/")
        && version[5].is_ascii_digit()
        && version[6] == b'.'
        && version[7].is_ascii_digit()
}

pub fn is_http1_version(version: &str) -> bool {
    version.starts_with("HTTP/1.")
}

pub fn parse_request_line(line: &[u8]) -> Option<RequestLine<'_>> {
    let method_end = take_while(line, 0, |b| b.is_ascii_uppercase());
    if method_end == 0 || method_end == line.len() || !is_space(line[method_end]) {
        return None;
    }

    let target_start = skip_spaces(line, method_end);
    let target_end = take_while(line, target_start, |b| !is_space(b));
    if target_end == target_start || target_end == line.len() {
        return None;
    }

    let version_start = skip_spaces(line, target_end);
    let version = &line[version_start..];
    if !is_version(version) {
        return None;
    }

    Some(RequestLine {
        method: std::str::from_utf8(&line[..method_end]).ok()?,
        target: std::str::from_utf8(&line[target_start..target_end]).ok()?,
        version: std::str::from_utf8(version).ok()?,
    })
}

pub fn parse_status_line(line: &[u8]) -> Option<StatusLine<'_>> {
    if line.len() < 8 || !line.starts_with(b"HTTP/1.") || !line[7].is_ascii_digit() {
        return None;
    }

    let status_start = skip_spaces(line, 8);
    if status_start == 8 {
        return None;
    }

    let status_end = take_while(line, status_start, |b| b.is_ascii_digit());
    if status_end == status_start || (status_end < line.len() && !is_space(line[status_end])) {
        return None;
    }

    let reason_start = skip_spaces(line, status_end);
    let status = std::str::from_utf8(&line[status_start..status_end]).ok()?.parse().ok()?;

    Some(StatusLine {
        version: std::str::from_utf8(&line[..8]).ok()?,
        status,
        reason: std::str::from_utf8(&line[reason_start..]).ok()?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLine<'a> {
    Field { name: &'a str, value: &'a str },
    /// Starts with whitespace, a continuation of the previous line.
    Folded,
    Invalid,
}

pub fn parse_header_line(line: &[u8]) -> HeaderLine<'_> {
    if line.first().is_some_and(|b| *b == b' ' || *b == b'\t') {
        return HeaderLine::Folded;
    }

    let name_end = take_while(line, 0, |b| !is_space(b) && b != b':');
    if name_end == 0 || name_end == line.len() || line[name_end] != b':' {
        return HeaderLine::Invalid;
    }

    let value_start = skip_spaces(line, name_end + 1);
    let mut value_end = line.len();
    while value_end > value_start && is_space(line[value_end - 1]) {
        value_end -= 1;
    }

    match (std::str::from_utf8(&line[..name_end]), std::str::from_utf8(&line[value_start..value_end])) {
        (Ok(name), Ok(value)) => HeaderLine::Field { name, value },
        _ => HeaderLine::Invalid,
    }
}

/// Iterates the CRLF terminated lines of a head, stopping at the blank line.
///
/// Each item is `(line_start, line)` where `line_start` is the offset of the
/// line in the head.
pub struct Lines<'a> {
    head: &'a [u8],
    offset: usize,
}

impl<'a> Lines<'a> {
    pub fn new(head: &'a [u8], offset: usize) -> Self {
        Self { head, offset }
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = (usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.head.get(self.offset..)?;
        let end = index_of(rest, CRLF)?;
        if end == 0 {
            return None;
        }

        let start = self.offset;
        self.offset += end + CRLF.len();
        Some((start, &rest[..end]))
    }
}
