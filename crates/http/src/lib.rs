//! HTTP/1.1 and HTTP/2 gateways over the micro fabric streaming protocol
//!
//! This crate translates between physical HTTP connections and the
//! credit based fabric streams an application speaks. It is sans-IO: every
//! connection is a state machine fed with fabric frames from the network side
//! and from the application side, answering through outboxes the owner
//! drains. The only component performing IO is
//! [`connection::NetworkDriver`], which runs a server over a tokio stream.
//!
//! # Features
//!
//! - HTTP/1.1 server and client with content-length, chunked and close delimited bodies
//! - Pipelined requests and keep-alive connections
//! - `Expect: 100-continue`, `Upgrade` and the `h2c` upgrade
//! - HTTP/2 server and prior knowledge client with HPACK, flow control,
//!   prioritized frame queues and server push
//! - Bounded memory: partial input and output wait in slots of a shared
//!   [`micro_fabric::BufferPool`]
//! - Per route client pools with a FIFO request queue
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use micro_fabric::{Context, Frame, HeaderLookup, Route, TransportInfo};
//! use micro_http_gateway::binding::HttpBinding;
//! use micro_http_gateway::config::HttpConfig;
//! use micro_http_gateway::connection::NetworkDriver;
//! use micro_http_gateway::protocol::HttpExtension;
//! use micro_http_gateway::server::HttpServer;
//! use tokio::net::TcpListener;
//! use tokio::sync::mpsc;
//!
//! fn route(_authorization: u64, _headers: &dyn HeaderLookup) -> Option<Route> {
//!     Some(Route::new(1))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!     let (tcp_stream, _remote_addr) = listener.accept().await?;
//!     let (reader, writer) = tcp_stream.into_split();
//!
//!     let binding = HttpBinding::new(Arc::new(route), HttpConfig::default());
//!     let mut server = HttpServer::new(binding, Context::from_config(1, &Default::default()));
//!
//!     let (requests, mut application) = mpsc::channel::<Frame<HttpExtension>>(64);
//!     let (_replies, replies_rx) = mpsc::channel(64);
//!     tokio::spawn(async move {
//!         while let Some(frame) = application.recv().await {
//!             println!("{}", frame.name());
//!         }
//!     });
//!
//!     let transport = TransportInfo { secure: false, alpn: None };
//!     NetworkDriver::new(reader, writer, transport).process(&mut server, requests, replies_rx).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`binding`]: route resolution, collaborators and configuration of one binding
//! - [`config`]: gateway tuning loaded from JSON
//! - [`codec`]: HTTP/1.1, HTTP/2 frame and HPACK codecs
//! - [`connection`]: the network stream, HTTP/2 connection core and the tokio driver
//! - [`exchange`]: request and response stream pairs and guard sessions
//! - [`server`]: accepted connections, one application exchange per request
//! - [`client`]: application requests, pooled network connections per route
//! - [`protocol`]: headers, the fabric extension and error types
//!
//! # Flow Control
//!
//! Both sides are windowed with the fabric `sequence` / `acknowledge` /
//! `maximum` triple. A gateway never forwards more than the receiving side
//! granted. Bytes it accepted but could not forward yet stay in a pooled slot
//! and are acknowledged once they leave it.
//!
//! # Error Handling
//!
//! - [`protocol::Http1Error`]: malformed HTTP/1.1, answered with a literal status response
//! - [`protocol::Http2Error`]: an [`protocol::Http2ErrorCode`] scoped to a stream or the connection
//! - [`protocol::HttpError`]: configuration and driver errors

pub mod binding;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod exchange;
pub mod protocol;
pub mod server;

mod utils;

pub use binding::HttpBinding;
pub use client::HttpClient;
pub use config::{HttpConfig, HttpVersion};
pub use server::HttpServer;
