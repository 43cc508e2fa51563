//! Wire codecs shared by the server and client connections.
//!
//! Every decoder here is sans-IO: it is handed a byte slice, reports what it
//! recognised to a sink and returns the number of bytes consumed. Leftover
//! bytes stay with the caller, usually in a pooled slot, until more arrive.
//!
//! - [`h1`]: HTTP/1.1 heads, content-length and chunked bodies, trailers
//! - [`h2`]: HTTP/2 frames, settings, the frame decoder and a `tokio_util` codec
//! - [`hpack`]: header block compression for [`h2`]

pub mod h1;
pub mod h2;
pub mod hpack;
