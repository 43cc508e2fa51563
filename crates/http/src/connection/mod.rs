//! Connection plumbing shared by the HTTP servers and clients.
//!
//! # Components
//!
//! - [`NetworkStream`]: the network side of a connection, with its windows and
//!   the decode and encode slots parking partial input and output
//! - [`h2`]: HTTP/2 connection state shared by server and client (settings,
//!   HPACK, connection budgets and the prioritized frame queue)
//! - [`NetworkDriver`]: runs a sans-IO [`HttpServer`](crate::server::HttpServer)
//!   over a tokio `AsyncRead + AsyncWrite`
//!
//! Nothing in here performs IO except the driver. Every other type consumes
//! frames and pushes its answers into outboxes drained by the owner.

mod driver;
pub mod h2;
mod network;

pub use driver::NetworkDriver;
pub use network::NetworkStream;

/// Application streams a connection opened or finished during one call.
///
/// The owner uses them to route application frames back to the connection.
#[derive(Debug, Default)]
pub struct StreamEvents {
    pub opened: Vec<u64>,
    pub closed: Vec<u64>,
}

impl StreamEvents {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty()
    }

    pub fn take(&mut self) -> StreamEvents {
        std::mem::take(self)
    }
}
