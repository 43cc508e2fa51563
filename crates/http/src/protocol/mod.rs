//! Protocol vocabulary shared by the codecs and the connections.
//!
//! - [`HeaderList`]: ordered, lowercase header list used for both versions
//! - [`HttpExtension`]: the fabric extension carrying headers, trailers and promises
//! - [`status`]: reason phrases, scheme ports and supported methods
//! - [`error`]: HTTP/1.1 literal errors, HTTP/2 error codes and the driver error

mod error;
pub use error::ErrorScope;
pub use error::HpackError;
pub use error::Http1Error;
pub use error::Http2Error;
pub use error::Http2ErrorCode;
pub use error::HttpError;

mod extension;
pub use extension::HttpExtension;

mod headers;
pub use headers::HeaderList;

pub mod status;
