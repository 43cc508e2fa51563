use std::io;

use micro_fabric::FabricError;
use thiserror::Error;

/// Top level error of the tokio driver and configuration loading.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("http/1.1 error: {source}")]
    Http1 {
        #[from]
        source: Http1Error,
    },

    #[error("http/2 error: {source}")]
    Http2 {
        #[from]
        source: Http2Error,
    },

    #[error("fabric error: {source}")]
    Fabric {
        #[from]
        source: FabricError,
    },

    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },

    #[error("application channel closed")]
    ChannelClosed,
}

impl HttpError {
    pub fn invalid_config<S: ToString>(str: S) -> Self {
        Self::InvalidConfig { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// HTTP/1.1 decode failures, each answered with a fixed response.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Http1Error {
    #[error("bad request")]
    BadRequest,

    #[error("obsolete line folding")]
    ObsoleteLineFolding,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("no route")]
    NotFound,

    #[error("request target too long")]
    UriTooLong,

    #[error("request headers too large")]
    HeadersTooLarge,

    #[error("method not implemented")]
    MethodNotImplemented,

    #[error("unsupported transfer-encoding")]
    UnsupportedTransferEncoding,

    #[error("http version not supported")]
    VersionNotSupported,

    #[error("response headers exceed the encode limit")]
    InsufficientStorage,
}

impl Http1Error {
    pub fn status(self) -> u16 {
        match self {
            Http1Error::BadRequest | Http1Error::ObsoleteLineFolding => 400,
            Http1Error::Unauthorized => 401,
            Http1Error::Forbidden => 403,
            Http1Error::NotFound => 404,
            Http1Error::UriTooLong => 414,
            Http1Error::HeadersTooLarge => 431,
            Http1Error::MethodNotImplemented | Http1Error::UnsupportedTransferEncoding => 501,
            Http1Error::VersionNotSupported => 505,
            Http1Error::InsufficientStorage => 507,
        }
    }

    /// The literal response written before the connection closes.
    pub fn response(self) -> &'static [u8] {
        match self {
            Http1Error::BadRequest => b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n",
            Http1Error::ObsoleteLineFolding => {
                b"HTTP/1.1 400 Bad Request - obsolete line folding not supported\r\nConnection: close\r\n\r\n"
            }
            Http1Error::Unauthorized => b"HTTP/1.1 401 Unauthorized\r\nConnection: close\r\n\r\n",
            Http1Error::Forbidden => b"HTTP/1.1 403 Forbidden\r\nConnection: close\r\n\r\n",
            Http1Error::NotFound => b"HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n",
            Http1Error::UriTooLong => b"HTTP/1.1 414 Request URI Too Long\r\nConnection: close\r\n\r\n",
            Http1Error::HeadersTooLarge => b"HTTP/1.1 431 Request Header Fields Too Large\r\nConnection: close\r\n\r\n",
            Http1Error::MethodNotImplemented => b"HTTP/1.1 501 Not Implemented\r\nConnection: close\r\n\r\n",
            Http1Error::UnsupportedTransferEncoding => {
                b"HTTP/1.1 501 Unsupported Transfer-Encoding\r\nConnection: close\r\n\r\n"
            }
            Http1Error::VersionNotSupported => b"HTTP/1.1 505 HTTP Version Not Supported\r\nConnection: close\r\n\r\n",
            Http1Error::InsufficientStorage => b"HTTP/1.1 507 Insufficient Storage\r\nConnection: close\r\n\r\n",
        }
    }
}

/// RFC 9113 error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Http2ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
}

impl Http2ErrorCode {
    pub fn as_u32(self) -> u32 {
        match self {
            Http2ErrorCode::NoError => 0x0,
            Http2ErrorCode::ProtocolError => 0x1,
            Http2ErrorCode::InternalError => 0x2,
            Http2ErrorCode::FlowControlError => 0x3,
            Http2ErrorCode::SettingsTimeout => 0x4,
            Http2ErrorCode::StreamClosed => 0x5,
            Http2ErrorCode::FrameSizeError => 0x6,
            Http2ErrorCode::RefusedStream => 0x7,
            Http2ErrorCode::Cancel => 0x8,
            Http2ErrorCode::CompressionError => 0x9,
            Http2ErrorCode::ConnectError => 0xa,
            Http2ErrorCode::EnhanceYourCalm => 0xb,
            Http2ErrorCode::InadequateSecurity => 0xc,
            Http2ErrorCode::Http11Required => 0xd,
        }
    }

    /// Unknown codes are treated as `INTERNAL_ERROR`.
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => Http2ErrorCode::NoError,
            0x1 => Http2ErrorCode::ProtocolError,
            0x3 => Http2ErrorCode::FlowControlError,
            0x4 => Http2ErrorCode::SettingsTimeout,
            0x5 => Http2ErrorCode::StreamClosed,
            0x6 => Http2ErrorCode::FrameSizeError,
            0x7 => Http2ErrorCode::RefusedStream,
            0x8 => Http2ErrorCode::Cancel,
            0x9 => Http2ErrorCode::CompressionError,
            0xa => Http2ErrorCode::ConnectError,
            0xb => Http2ErrorCode::EnhanceYourCalm,
            0xc => Http2ErrorCode::InadequateSecurity,
            0xd => Http2ErrorCode::Http11Required,
            _ => Http2ErrorCode::InternalError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Stream(u32),
    Connection,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("{code:?} ({scope:?})")]
pub struct Http2Error {
    pub code: Http2ErrorCode,
    pub scope: ErrorScope,
}

impl Http2Error {
    pub fn connection(code: Http2ErrorCode) -> Self {
        Self { code, scope: ErrorScope::Connection }
    }

    pub fn stream(stream_id: u32, code: Http2ErrorCode) -> Self {
        Self { code, scope: ErrorScope::Stream(stream_id) }
    }

    pub fn protocol() -> Self {
        Self::connection(Http2ErrorCode::ProtocolError)
    }

    pub fn frame_size() -> Self {
        Self::connection(Http2ErrorCode::FrameSizeError)
    }

    pub fn flow_control() -> Self {
        Self::connection(Http2ErrorCode::FlowControlError)
    }
}

/// A header block the HPACK decoder rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("hpack decode failed: {reason}")]
pub struct HpackError {
    pub reason: String,
}

impl HpackError {
    pub fn new<S: ToString>(str: S) -> Self {
        Self { reason: str.to_string() }
    }
}

impl From<HpackError> for Http2Error {
    fn from(_: HpackError) -> Self {
        Http2Error::connection(Http2ErrorCode::CompressionError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_matches_status() {
        let errors = [
            Http1Error::BadRequest,
            Http1Error::ObsoleteLineFolding,
            Http1Error::Unauthorized,
            Http1Error::Forbidden,
            Http1Error::NotFound,
            Http1Error::UriTooLong,
            Http1Error::HeadersTooLarge,
            Http1Error::MethodNotImplemented,
            Http1Error::UnsupportedTransferEncoding,
            Http1Error::VersionNotSupported,
            Http1Error::InsufficientStorage,
        ];

        for error in errors {
            let prefix = format!("HTTP/1.1 {} ", error.status());
            assert!(error.response().starts_with(prefix.as_bytes()), "{error:?}");
            assert!(error.response().ends_with(b"\r\n\r\n"), "{error:?}");
        }
    }

    #[test]
    fn test_error_code_round_trip() {
        for code in 0..=0xd {
            assert_eq!(Http2ErrorCode::from_u32(code).as_u32(), code);
        }
        assert_eq!(Http2ErrorCode::from_u32(0xff), Http2ErrorCode::InternalError);
    }
}
