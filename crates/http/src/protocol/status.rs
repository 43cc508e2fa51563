//! Process wide lookup tables.

use std::collections::HashMap;

use http::StatusCode;
use once_cell::sync::Lazy;

pub const UNRECOGNIZED_STATUS: &str = "Unrecognized Status";

/// Default ports used when an authority carries none.
pub static SCHEME_PORTS: Lazy<HashMap<&'static str, u16>> = Lazy::new(|| HashMap::from([("http", 80), ("https", 443)]));

/// Methods accepted by the HTTP/1.1 server, anything else is answered with 501.
pub static SUPPORTED_METHODS: Lazy<Vec<&'static [u8]>> = Lazy::new(|| {
    vec![b"GET".as_slice(), b"HEAD", b"POST", b"PUT", b"DELETE", b"CONNECT", b"OPTIONS", b"TRACE"]
});

/// Length of the longest supported method.
pub static MAXIMUM_METHOD_LENGTH: Lazy<usize> =
    Lazy::new(|| SUPPORTED_METHODS.iter().map(|method| method.len()).max().unwrap_or(0));

pub fn reason(status: u16) -> &'static str {
    StatusCode::from_u16(status).ok().and_then(|status| status.canonical_reason()).unwrap_or(UNRECOGNIZED_STATUS)
}

pub fn default_port(scheme: &str) -> Option<u16> {
    SCHEME_PORTS.get(scheme).copied()
}

/// Appends the scheme port to an authority without one.
pub fn authority_with_port(authority: &str, scheme: &str) -> String {
    let has_port = match authority.rfind(':') {
        // an IPv6 literal ends with `]` when no port follows
        Some(index) => !authority[index..].contains(']'),
        None => false,
    };

    match default_port(scheme) {
        Some(port) if !has_port => format!("{authority}:{port}"),
        _ => authority.to_string(),
    }
}

pub fn is_supported_method(method: &[u8]) -> bool {
    SUPPORTED_METHODS.iter().any(|supported| *supported == method)
}

/// Statuses whose responses never carry content.
pub fn is_bodiless(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}
