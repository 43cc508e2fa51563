//! Server gateway: network streams in, application exchanges out.
//!
//! [`HttpServer`] owns every accepted connection of one binding. A connection
//! starts as HTTP/1.1 unless ALPN negotiated `h2`, and an HTTP/1.1 connection
//! that receives the prior knowledge preface is handed over to HTTP/2 with its
//! buffered input.
//!
//! Frames are routed by stream id: network frames by the connection's inbound
//! id, application frames by the request id of their exchange.

mod http1;
mod http2;

use std::collections::HashMap;

use micro_fabric::{BeginFrame, Context, FiredSignal, Frame, NetworkExtension, Outbox, StreamIds};
use tracing::{debug, trace};

pub use http1::Http1Server;
pub use http2::Http2Server;

use crate::binding::HttpBinding;
use crate::config::HttpVersion;
use crate::connection::{NetworkStream, StreamEvents};
use crate::exchange::CLEANUP_SIGNAL;
use crate::protocol::HttpExtension;

#[derive(Debug)]
enum Connection {
    Http1(Box<Http1Server>),
    Http2(Box<Http2Server>),
}

#[derive(Debug)]
pub struct HttpServer {
    binding: HttpBinding,
    context: Context,
    connections: HashMap<u64, Connection>,
    /// Application request id to the inbound id of its connection.
    streams: HashMap<u64, u64>,
    pub network: Outbox<NetworkExtension>,
    pub application: Outbox<HttpExtension>,
}

impl HttpServer {
    pub fn new(binding: HttpBinding, context: Context) -> Self {
        Self {
            binding,
            context,
            connections: HashMap::new(),
            streams: HashMap::new(),
            network: Outbox::new(),
            application: Outbox::new(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn connections(&self) -> usize {
        self.connections.len()
    }

    pub fn exchanges(&self) -> usize {
        self.streams.len()
    }

    pub fn on_network(&mut self, frame: Frame<NetworkExtension>) {
        let stream_id = frame.stream_id();
        let key = if StreamIds::is_initial(stream_id) { stream_id } else { stream_id ^ 1 };

        if let Frame::Begin(begin) = &frame {
            if !self.connections.contains_key(&key) && StreamIds::is_initial(stream_id) {
                self.accept(key, begin);
            }
            self.collect(key);
            return;
        }

        match self.connections.get_mut(&key) {
            Some(Connection::Http1(server)) => server.on_network(frame),
            Some(Connection::Http2(server)) => server.on_network(frame),
            None => {
                trace!(stream_id, frame = frame.name(), "network frame for unknown connection");
                return;
            }
        }
        self.collect(key);
    }

    fn accept(&mut self, key: u64, begin: &BeginFrame<NetworkExtension>) {
        let network = NetworkStream::accept(begin, self.context.pool.clone());
        let h2 = network.transport.alpn.as_deref() == Some("h2") && self.binding.config().supports(HttpVersion::Http2);
        debug!(stream_id = key, h2, "network stream accepted");

        let binding = self.binding.clone();
        let context = self.context.clone();
        let connection = if h2 {
            Connection::Http2(Box::new(Http2Server::new(binding, context, network)))
        } else {
            Connection::Http1(Box::new(Http1Server::new(binding, context, network)))
        };
        self.connections.insert(key, connection);
    }

    pub fn on_application(&mut self, frame: Frame<HttpExtension>) {
        let stream_id = frame.stream_id();
        let request_id = if StreamIds::is_initial(stream_id) { stream_id } else { stream_id ^ 1 };
        let Some(&key) = self.streams.get(&request_id) else {
            trace!(stream_id, frame = frame.name(), "application frame for unknown exchange");
            return;
        };

        match self.connections.get_mut(&key) {
            Some(Connection::Http1(server)) => server.on_application(frame),
            Some(Connection::Http2(server)) => server.on_application(frame),
            None => return,
        }
        self.collect(key);
    }

    pub fn on_signal(&mut self, fired: FiredSignal) {
        let key = if fired.signal == CLEANUP_SIGNAL && self.connections.contains_key(&fired.stream_id) {
            fired.stream_id
        } else {
            match self.streams.get(&fired.stream_id) {
                Some(&key) => key,
                None => return,
            }
        };

        match self.connections.get_mut(&key) {
            Some(Connection::Http1(server)) => server.on_signal(fired.stream_id, fired.signal),
            Some(Connection::Http2(server)) => server.on_signal(fired.stream_id, fired.signal),
            None => return,
        }
        self.collect(key);
    }

    /// Delivers every signal due by now.
    pub fn poll_signals(&mut self) {
        let now = self.context.signals.now();
        for fired in self.context.signals.poll_due(now) {
            self.on_signal(fired);
        }
    }

    /// Moves the frames and stream events of connection `key` into the server outboxes.
    fn collect(&mut self, key: u64) {
        let delegated = match self.connections.get_mut(&key) {
            Some(Connection::Http1(server)) => {
                self.network.extend(server.network.out.drain());
                self.application.extend(server.app.drain());
                register(&mut self.streams, key, server.events.take());
                server.is_delegated()
            }
            Some(Connection::Http2(server)) => {
                self.network.extend(server.core.network.out.drain());
                self.application.extend(server.app.drain());
                register(&mut self.streams, key, server.events.take());
                false
            }
            None => return,
        };

        if delegated {
            if let Some(Connection::Http1(server)) = self.connections.remove(&key) {
                debug!(stream_id = key, "connection upgraded to http/2");
                let (binding, context, network) = server.into_parts();
                let server = Http2Server::delegated(binding, context, network);
                self.connections.insert(key, Connection::Http2(Box::new(server)));
                self.collect(key);
            }
            return;
        }

        let closed = match self.connections.get(&key) {
            Some(Connection::Http1(server)) => server.is_closed(),
            Some(Connection::Http2(server)) => server.is_closed(),
            None => false,
        };
        if closed {
            debug!(stream_id = key, "connection closed");
            self.connections.remove(&key);
            self.streams.retain(|_, connection| *connection != key);
        }
    }
}

fn register(streams: &mut HashMap<u64, u64>, key: u64, events: StreamEvents) {
    for request_id in events.opened {
        streams.insert(request_id, key);
    }
    for request_id in events.closed {
        streams.remove(&request_id);
    }
}
