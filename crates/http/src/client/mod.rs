//! Client gateway: application exchanges in, network streams out.
//!
//! [`HttpClient`] resolves each new request to a route and keeps a
//! [`ClientPool`] per route. A request is written on an available connection
//! of its pool, on a new connection while the pool has room, or it waits in
//! the pool queue. Waiting requests leave the queue in arrival order as soon
//! as a connection connects or becomes idle.
//!
//! Requests the gateway cannot take are answered locally: `404` without a
//! route, `431` when the request does not fit a queue entry and `503` with
//! `retry-after: 0` when the queue is full.

mod http1;
mod http2;
mod pool;
mod queue;

use std::collections::HashMap;

use http::StatusCode;
use micro_fabric::{BeginFrame, Context, Frame, NetworkExtension, Outbox, StreamIds, TransportInfo};
use tracing::{debug, trace};

pub use http1::Http1Client;
pub use http2::Http2Client;
pub use pool::ClientPool;
pub use queue::{QueueError, QueuedRequest, RequestQueue};

use crate::binding::HttpBinding;
use crate::config::HttpVersion;
use crate::connection::{NetworkStream, StreamEvents};
use crate::exchange::Exchange;
use crate::protocol::{HeaderList, HttpExtension};

#[derive(Debug)]
enum ClientConnection {
    Http1(Box<Http1Client>),
    Http2(Box<Http2Client>),
}

impl ClientConnection {
    fn route_id(&self) -> u64 {
        match self {
            ClientConnection::Http1(client) => client.route_id,
            ClientConnection::Http2(client) => client.route_id,
        }
    }

    fn is_idle(&self) -> bool {
        match self {
            ClientConnection::Http1(client) => client.is_idle(),
            ClientConnection::Http2(client) => client.is_idle(),
        }
    }

    fn is_available(&self) -> bool {
        match self {
            ClientConnection::Http1(client) => client.is_available(),
            ClientConnection::Http2(client) => client.is_available(),
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            ClientConnection::Http1(client) => client.is_closed(),
            ClientConnection::Http2(client) => client.is_closed(),
        }
    }

    fn start(&mut self, request: QueuedRequest) {
        match self {
            ClientConnection::Http1(client) => client.start(request),
            ClientConnection::Http2(client) => client.start(request),
        }
    }
}

/// Where an application request currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Waiting in the queue of a route pool.
    Queued(u64),
    /// Carried by the connection with this outbound network id.
    Attached(u64),
}

#[derive(Debug)]
pub struct HttpClient {
    binding: HttpBinding,
    context: Context,
    /// Keyed by the outbound network stream id.
    connections: HashMap<u64, ClientConnection>,
    pools: HashMap<u64, ClientPool>,
    streams: HashMap<u64, Placement>,
    pub network: Outbox<NetworkExtension>,
    pub application: Outbox<HttpExtension>,
}

impl HttpClient {
    pub fn new(binding: HttpBinding, context: Context) -> Self {
        Self {
            binding,
            context,
            connections: HashMap::new(),
            pools: HashMap::new(),
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

    /// Requests waiting for a connection on route `route_id`.
    pub fn queued(&self, route_id: u64) -> usize {
        self.pools.get(&route_id).map_or(0, ClientPool::queued)
    }

    pub fn on_application(&mut self, frame: Frame<HttpExtension>) {
        let stream_id = frame.stream_id();
        let request_id = if StreamIds::is_initial(stream_id) { stream_id } else { stream_id ^ 1 };

        if let Frame::Begin(begin) = frame {
            if StreamIds::is_initial(stream_id) && !self.streams.contains_key(&request_id) {
                self.on_request(begin);
            }
            return;
        }

        match self.streams.get(&request_id).copied() {
            Some(Placement::Attached(key)) => {
                match self.connections.get_mut(&key) {
                    Some(ClientConnection::Http1(client)) => client.on_application(frame),
                    Some(ClientConnection::Http2(client)) => client.on_application(frame),
                    None => return,
                }
                self.collect(key);
            }
            Some(Placement::Queued(route_id)) => self.on_queued(route_id, frame),
            None => trace!(stream_id, frame = frame.name(), "application frame for unknown exchange"),
        }
    }

    fn on_request(&mut self, begin: BeginFrame<HttpExtension>) {
        let header = begin.header;
        let mut request = QueuedRequest {
            request_id: header.stream_id,
            trace_id: header.trace_id,
            authorization: header.authorization,
            affinity: begin.affinity,
            ended: false,
            headers: begin.extension.into_headers(),
        };

        let Some(route) = self.binding.resolve(header.authorization, &request.headers) else {
            debug!(stream_id = header.stream_id, "client request has no route");
            self.reject(&request, StatusCode::NOT_FOUND.as_u16());
            return;
        };
        for (name, value) in &route.overrides {
            request.headers.set(name, value.as_str());
        }

        let config = self.binding.config();
        let pool = self
            .pools
            .entry(route.id)
            .or_insert_with(|| ClientPool::new(&route, config, self.context.pool.clone()));

        if pool.queued() == 0 {
            let available = pool
                .connections()
                .iter()
                .copied()
                .find(|key| self.connections.get(key).is_some_and(ClientConnection::is_available));
            if let Some(key) = available {
                self.dispatch(key, request);
                return;
            }
            if pool.has_capacity() {
                let key = self.connect(route.id, &request);
                self.dispatch(key, request);
                return;
            }
        }

        match pool.enqueue(&request) {
            Ok(()) => {
                debug!(stream_id = request.request_id, route_id = route.id, queued = pool.queued(), "client request queued");
                self.streams.insert(request.request_id, Placement::Queued(route.id));
            }
            Err(error) => {
                debug!(stream_id = request.request_id, route_id = route.id, %error, "client request rejected");
                self.reject(&request, error.status());
            }
        }
    }

    /// Frames for a request that has not reached a connection yet.
    fn on_queued(&mut self, route_id: u64, frame: Frame<HttpExtension>) {
        let stream_id = frame.stream_id();
        let request_id = if StreamIds::is_initial(stream_id) { stream_id } else { stream_id ^ 1 };
        let Some(pool) = self.pools.get_mut(&route_id) else {
            return;
        };

        match frame {
            Frame::End(_) if stream_id == request_id => {
                pool.mark_ended(request_id);
            }
            Frame::Abort(_) | Frame::Reset(_) => {
                debug!(stream_id = request_id, route_id, "queued client request cancelled");
                pool.cancel(request_id);
                self.streams.remove(&request_id);
                self.release_pool(route_id);
            }
            frame => trace!(stream_id, frame = frame.name(), "queued client request frame ignored"),
        }
    }

    pub fn on_network(&mut self, frame: Frame<NetworkExtension>) {
        let stream_id = frame.stream_id();
        let key = if StreamIds::is_initial(stream_id) { stream_id } else { stream_id ^ 1 };

        match self.connections.get_mut(&key) {
            Some(ClientConnection::Http1(client)) => client.on_network(frame),
            Some(ClientConnection::Http2(client)) => client.on_network(frame),
            None => {
                trace!(stream_id, frame = frame.name(), "network frame for unknown connection");
                return;
            }
        }
        self.collect(key);
    }

    /// Opens a network stream for route `route_id`, negotiating its pool version.
    fn connect(&mut self, route_id: u64, request: &QueuedRequest) -> u64 {
        let key = self.context.ids.supply_initial_id();
        let version = self.pools.get(&route_id).map_or(HttpVersion::Http11, |pool| pool.version);
        let transport = TransportInfo {
            secure: request.headers.get(":scheme") == Some("https"),
            alpn: Some(version.as_str().to_string()),
        };
        let network = NetworkStream::connect(
            key,
            request.affinity,
            request.authorization,
            transport,
            self.context.pool.clone(),
            request.trace_id,
        );
        debug!(stream_id = key, route_id, version = version.as_str(), "client connection opened");

        let binding = self.binding.clone();
        let connection = match version {
            HttpVersion::Http2 => {
                ClientConnection::Http2(Box::new(Http2Client::new(binding, self.context.clone(), network, route_id)))
            }
            HttpVersion::Http11 => ClientConnection::Http1(Box::new(Http1Client::new(binding, network, route_id))),
        };
        self.connections.insert(key, connection);
        if let Some(pool) = self.pools.get_mut(&route_id) {
            pool.add(key);
        }
        key
    }

    fn dispatch(&mut self, key: u64, request: QueuedRequest) {
        self.streams.remove(&request.request_id);
        if let Some(connection) = self.connections.get_mut(&key) {
            connection.start(request);
        }
        self.collect(key);
    }

    /// Dispatches queued requests of route `route_id` in arrival order.
    fn flush_next(&mut self, route_id: u64) {
        loop {
            let Some(pool) = self.pools.get(&route_id) else {
                return;
            };
            if pool.queued() == 0 {
                return;
            }

            let idle = pool
                .connections()
                .iter()
                .copied()
                .find(|key| self.connections.get(key).is_some_and(ClientConnection::is_idle));
            if idle.is_none() && !pool.has_capacity() {
                return;
            }

            let Some(request) = self.pools.get_mut(&route_id).and_then(ClientPool::next) else {
                return;
            };
            let key = match idle {
                Some(key) => key,
                None => self.connect(route_id, &request),
            };
            trace!(stream_id = request.request_id, route_id, connection = key, "client request dequeued");
            self.streams.remove(&request.request_id);
            if let Some(connection) = self.connections.get_mut(&key) {
                connection.start(request);
            }
            self.drain(key);
        }
    }

    /// Moves the frames and stream events of connection `key` into the client outboxes.
    fn drain(&mut self, key: u64) {
        let events = match self.connections.get_mut(&key) {
            Some(ClientConnection::Http1(client)) => {
                self.network.extend(client.network.out.drain());
                self.application.extend(client.app.drain());
                client.events.take()
            }
            Some(ClientConnection::Http2(client)) => {
                self.network.extend(client.core.network.out.drain());
                self.application.extend(client.app.drain());
                client.events.take()
            }
            None => return,
        };
        register(&mut self.streams, key, events);
    }

    fn collect(&mut self, key: u64) {
        self.drain(key);
        let Some(connection) = self.connections.get(&key) else {
            return;
        };
        let route_id = connection.route_id();

        if connection.is_closed() {
            debug!(stream_id = key, route_id, "client connection closed");
            self.connections.remove(&key);
            self.streams.retain(|_, placement| *placement != Placement::Attached(key));
            if let Some(pool) = self.pools.get_mut(&route_id) {
                pool.remove(key);
            }
            self.flush_next(route_id);
            self.release_pool(route_id);
            return;
        }

        if connection.is_idle() {
            self.flush_next(route_id);
        }
    }

    /// Forgets the pool of `route_id` once it has neither connections nor waiting requests.
    fn release_pool(&mut self, route_id: u64) {
        if self.pools.get(&route_id).is_some_and(ClientPool::is_unused) {
            trace!(route_id, "client pool released");
            self.pools.remove(&route_id);
        }
    }

    /// Answers `request` locally with `status` and resets its request stream.
    fn reject(&mut self, request: &QueuedRequest, status: u16) {
        let exchange = Exchange::accept(request.request_id, request.authorization, request.trace_id);
        let mut headers = HeaderList::new();
        headers.push(":status", status.to_string());
        if status == StatusCode::SERVICE_UNAVAILABLE.as_u16() {
            headers.push("retry-after", "0");
        }

        self.application.begin(exchange.response_header(), request.affinity, HttpExtension::Headers(headers));
        self.application.end(exchange.response_header(), HttpExtension::Empty);
        if !request.ended {
            self.application.reset(exchange.request_header(), HttpExtension::Empty);
        }
    }
}

fn register(streams: &mut HashMap<u64, Placement>, key: u64, events: StreamEvents) {
    for request_id in events.opened {
        streams.insert(request_id, Placement::Attached(key));
    }
    for request_id in events.closed {
        streams.remove(&request_id);
    }
}
