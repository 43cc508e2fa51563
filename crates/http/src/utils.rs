//! Byte scanning helpers shared by the HTTP/1.1 codecs.

/// Early return with an error when the predicate does not hold.
///
/// ```ignore
/// ensure!(line.len() < max, Http1Error::UriTooLong);
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;

pub(crate) const CRLF: &[u8] = b"\r\n";
pub(crate) const CRLFCRLF: &[u8] = b"\r\n\r\n";

/// Position of the first occurrence of `needle` in `haystack`.
pub(crate) fn index_of(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }

    let first = needle[0];
    let last_start = haystack.len() - needle.len();
    let mut start = 0;
    while start <= last_start {
        let offset = index_of_byte(&haystack[start..=last_start], first)?;
        let candidate = start + offset;
        if &haystack[candidate..candidate + needle.len()] == needle {
            return Some(candidate);
        }
        start = candidate + 1;
    }

    None
}

/// Position just past the first occurrence of `needle`.
pub(crate) fn limit_of(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    index_of(haystack, needle).map(|index| index + needle.len())
}

#[inline]
pub(crate) fn index_of_byte(haystack: &[u8], byte: u8) -> Option<usize> {
    haystack.iter().position(|b| *b == byte)
}

/// Writes a lowercase header name as `Initial-Caps`.
pub(crate) fn write_initial_caps(dst: &mut Vec<u8>, name: &str) {
    let mut upper = true;
    for byte in name.bytes() {
        if upper {
            dst.push(byte.to_ascii_uppercase());
        } else {
            dst.push(byte);
        }
        upper = byte == b'-';
    }
}

/// Matches `close` as one token of a comma separated `connection` value.
pub(crate) fn is_connection_close(value: &str) -> bool {
    value.split(',').any(|token| token.trim().eq_ignore_ascii_case("close"))
}
