//! HPACK header block compression (RFC 7541).
//!
//! Both tables live for the whole connection, so one encoder and one decoder
//! belong to each HTTP/2 connection and every header block passes through
//! them in wire order.

use std::fmt;

use crate::protocol::{HeaderList, HpackError};

pub struct HpackDecoder {
    inner: fluke_hpack::Decoder<'static>,
}

impl HpackDecoder {
    pub fn new() -> Self {
        Self { inner: fluke_hpack::Decoder::new() }
    }

    /// Decodes a complete header block.
    ///
    /// Field bytes that are not UTF-8 are replaced rather than rejected.
    pub fn decode(&mut self, block: &[u8]) -> Result<HeaderList, HpackError> {
        let fields = self.inner.decode(block).map_err(|e| HpackError::new(format!("{e:?}")))?;

        let mut headers = HeaderList::with_capacity(fields.len());
        for (name, value) in fields {
            headers.push(String::from_utf8_lossy(&name).into_owned(), String::from_utf8_lossy(&value).into_owned());
        }
        Ok(headers)
    }
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HpackDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HpackDecoder").finish_non_exhaustive()
    }
}

pub struct HpackEncoder {
    inner: fluke_hpack::Encoder<'static>,
}

impl HpackEncoder {
    pub fn new() -> Self {
        Self { inner: fluke_hpack::Encoder::new() }
    }

    /// Encodes `headers` in order, names are lowercased on the way out.
    pub fn encode(&mut self, headers: &HeaderList) -> Vec<u8> {
        let names: Vec<String> = headers.iter().map(|(name, _)| name.to_ascii_lowercase()).collect();
        let fields: Vec<(&[u8], &[u8])> =
            names.iter().zip(headers.iter()).map(|(name, (_, value))| (name.as_bytes(), value.as_bytes())).collect();
        self.inner.encode(fields)
    }
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HpackEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HpackEncoder").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_static_entries() {
        let mut decoder = HpackDecoder::new();
        let headers = decoder.decode(&[0x82, 0x86, 0x84]).unwrap();

        assert_eq!(headers.get(":method"), Some("GET"));
        assert_eq!(headers.get(":scheme"), Some("http"));
        assert_eq!(headers.get(":path"), Some("/"));
    }

    #[test]
    fn test_tables_follow_each_other() {
        let mut encoder = HpackEncoder::new();
        let mut decoder = HpackDecoder::new();

        let headers: HeaderList =
            [(":status", "200"), ("Content-Type", "text/plain"), ("x-request", "one")].into_iter().collect();

        for _ in 0..3 {
            let block = encoder.encode(&headers);
            let decoded = decoder.decode(&block).unwrap();
            assert_eq!(decoded.get("content-type"), Some("text/plain"));
            assert_eq!(decoded.get("x-request"), Some("one"));
            assert_eq!(decoded.len(), 3);
        }
    }

    #[test]
    fn test_invalid_index() {
        let mut decoder = HpackDecoder::new();
        assert!(decoder.decode(&[0xff, 0x7f]).is_err());
    }
}
