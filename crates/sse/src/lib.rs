//! Server sent events gateways over the micro fabric streaming protocol
//!
//! Both gateways are sans-IO state machines stacked on the HTTP gateways of
//! [`micro_http_gateway`]. They translate between HTTP exchanges carrying a
//! `text/event-stream` body and fabric streams whose `Data` frames are single
//! events described by an [`SseExtension`].
//!
//! - [`SseServer`] takes requests from an HTTP server gateway and opens one
//!   application stream per `GET`. Application events are encoded into the
//!   response body.
//! - [`SseClient`] takes application streams and issues `GET` requests
//!   through an HTTP client gateway. The response body is decoded back into
//!   events.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use micro_fabric::{BeginFrame, BufferPool, Context, Frame, HeaderLookup, Route, Signals, StreamHeader};
//! use micro_http_gateway::protocol::{HeaderList, HttpExtension};
//! use micro_sse_gateway::{SseBinding, SseConfig, SseServer};
//!
//! fn route(_authorization: u64, _headers: &dyn HeaderLookup) -> Option<Route> {
//!     Some(Route::new(1))
//! }
//!
//! let context = Context::new(1, BufferPool::new(4096, 8), Signals::manual());
//! let mut server = SseServer::new(SseBinding::new(Arc::new(route), SseConfig::default()), context);
//!
//! let headers: HeaderList = [(":method", "GET"), (":path", "/prices")].into_iter().collect();
//! server.on_http(Frame::Begin(BeginFrame {
//!     header: StreamHeader { stream_id: 1, ..Default::default() },
//!     affinity: 0,
//!     extension: HttpExtension::Headers(headers),
//! }));
//!
//! let opened = server.application.take();
//! assert_eq!(opened[0].name(), "BEGIN");
//! ```
//!
//! # Flow Control
//!
//! The server grants the application the HTTP response window widened by
//! [`codec::MAXIMUM_HEADER_SIZE`] of padding per event, the field overhead an
//! event may add to its data. The client acknowledges HTTP response bytes
//! only after the events they hold were delivered to the application.

pub mod binding;
pub mod client;
pub mod codec;
pub mod config;
mod error;
pub mod extension;
pub mod server;

mod utils;

pub use binding::SseBinding;
pub use client::SseClient;
pub use config::SseConfig;
pub use error::SseError;
pub use extension::{SseBegin, SseData, SseExtension};
pub use server::SseServer;
