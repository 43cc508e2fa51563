//! HTTP/1.1 head and chunk serialization.
//!
//! Pseudo headers drive the start line and are never written as fields.
//! Field names are written as `Initial-Caps`.

use bytes::BufMut;

use crate::codec::h1::decoder::BodyMode;
use crate::protocol::{HeaderList, status};
use crate::utils::write_initial_caps;

/// Framing chosen for an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Content(u64),
    Chunked,
    /// Body runs until the connection closes.
    Close,
}

impl Framing {
    /// Reads the framing declared by `headers`, `None` when neither
    /// `content-length` nor `transfer-encoding: chunked` is present.
    pub fn declared(headers: &HeaderList) -> Option<Framing> {
        if headers.get("transfer-encoding").is_some_and(|value| value.eq_ignore_ascii_case("chunked")) {
            return Some(Framing::Chunked);
        }

        headers
            .get("content-length")
            .and_then(|length| length.trim().parse::<u64>().ok())
            .map(|length| if length == 0 { Framing::Empty } else { Framing::Content(length) })
    }

    pub fn is_chunked(self) -> bool {
        self == Framing::Chunked
    }
}

impl From<Framing> for BodyMode {
    fn from(framing: Framing) -> Self {
        match framing {
            Framing::Empty => BodyMode::Empty,
            Framing::Content(length) => BodyMode::Content(length),
            Framing::Chunked => BodyMode::Chunked,
            Framing::Close => BodyMode::Upgraded,
        }
    }
}

/// Largest chunk framing around a payload: hex length, two CRLFs.
pub const CHUNK_PADDING: u32 = 16 + 4;

pub const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

fn write_fields(dst: &mut Vec<u8>, headers: &HeaderList, skip: &[&str]) {
    for (name, value) in headers.iter() {
        if name.starts_with(':') || skip.contains(&name) {
            continue;
        }
        write_initial_caps(dst, name);
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
}

/// Writes `HTTP/1.1 <status> <reason>` and the fields, `200` when `:status` is absent.
pub fn encode_response_head(dst: &mut Vec<u8>, headers: &HeaderList) {
    let status = headers.status().unwrap_or(200);
    dst.put_slice(b"HTTP/1.1 ");
    dst.put_slice(status.to_string().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(status::reason(status).as_bytes());
    dst.put_slice(b"\r\n");
    write_fields(dst, headers, &[]);
    dst.extend_from_slice(b"\r\n");
}

/// Writes `<METHOD> <path> HTTP/1.1`, `Host` from `:authority` and the fields.
pub fn encode_request_head(dst: &mut Vec<u8>, headers: &HeaderList) {
    let method = headers.get(":method").unwrap_or("GET");
    let path = headers.get(":path").unwrap_or("/");
    dst.put_slice(method.as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(path.as_bytes());
    dst.put_slice(b" HTTP/1.1\r\n");

    if let Some(authority) = headers.get(":authority")
        && !headers.contains("host")
    {
        dst.put_slice(b"Host: ");
        dst.put_slice(authority.as_bytes());
        dst.put_slice(b"\r\n");
    }
    write_fields(dst, headers, &[]);
    dst.extend_from_slice(b"\r\n");
}

pub fn encode_chunk(dst: &mut Vec<u8>, payload: &[u8]) {
    if payload.is_empty() {
        return;
    }
    dst.put_slice(format!("{:x}\r\n", payload.len()).as_bytes());
    dst.extend_from_slice(payload);
    dst.extend_from_slice(b"\r\n");
}

/// Writes the last chunk, followed by trailers when present.
pub fn encode_last_chunk(dst: &mut Vec<u8>, trailers: &HeaderList) {
    dst.extend_from_slice(b"0\r\n");
    write_fields(dst, trailers, &[]);
    dst.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_response_head() {
        let headers: HeaderList =
            [(":status", "404"), ("content-type", "text/plain"), ("content-length", "0")].into_iter().collect();

        let mut dst = Vec::new();
        encode_response_head(&mut dst, &headers);

        let expected = indoc! {"
            HTTP/1.1 404 Not Found\r
            Content-Type: text/plain\r
            Content-Length: 0\r
            \r
        "};
        assert_eq!(String::from_utf8(dst).unwrap(), expected);
    }

    #[test]
    fn test_default_status() {
        let mut dst = Vec::new();
        encode_response_head(&mut dst, &HeaderList::new());
        assert_eq!(dst, b"HTTP/1.1 200 OK\r\n\r\n");

        dst.clear();
        encode_response_head(&mut dst, &[(":status", "799")].into_iter().collect());
        assert_eq!(dst, b"HTTP/1.1 799 Unrecognized Status\r\n\r\n");
    }

    #[test]
    fn test_request_head() {
        let headers: HeaderList = [
            (":method", "POST"),
            (":scheme", "http"),
            (":authority", "example.com:8080"),
            (":path", "/items?id=1"),
            ("transfer-encoding", "chunked"),
        ]
        .into_iter()
        .collect();

        let mut dst = Vec::new();
        encode_request_head(&mut dst, &headers);

        let expected = indoc! {"
            POST /items?id=1 HTTP/1.1\r
            Host: example.com:8080\r
            Transfer-Encoding: chunked\r
            \r
        "};
        assert_eq!(String::from_utf8(dst).unwrap(), expected);
        assert_eq!(Framing::declared(&headers), Some(Framing::Chunked));
    }

    #[test]
    fn test_chunks() {
        let mut dst = Vec::new();
        encode_chunk(&mut dst, b"Wikipedia in chunks");
        encode_chunk(&mut dst, b"");
        encode_last_chunk(&mut dst, &HeaderList::new());
        assert_eq!(dst, b"13\r\nWikipedia in chunks\r\n0\r\n\r\n");

        dst.clear();
        encode_chunk(&mut dst, &[b'x'; 300]);
        assert!(dst.starts_with(b"12c\r\nxxx"));
        assert!(dst.ends_with(b"x\r\n"));

        dst.clear();
        encode_last_chunk(&mut dst, &[("grpc-status", "0")].into_iter().collect());
        assert_eq!(dst, b"0\r\nGrpc-Status: 0\r\n\r\n");
    }

    #[test]
    fn test_declared_framing() {
        let length: HeaderList = [("content-length", "12")].into_iter().collect();
        assert_eq!(Framing::declared(&length), Some(Framing::Content(12)));

        let empty: HeaderList = [("content-length", "0")].into_iter().collect();
        assert_eq!(Framing::declared(&empty), Some(Framing::Empty));

        assert_eq!(Framing::declared(&HeaderList::new()), None);
    }
}
