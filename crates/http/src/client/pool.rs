use micro_fabric::{BufferPool, Route};
use tracing::debug;

use crate::client::queue::{QueueError, QueuedRequest, RequestQueue};
use crate::config::{HttpConfig, HttpVersion};

/// Connections and waiting requests of one resolved route.
#[derive(Debug)]
pub struct ClientPool {
    pub route_id: u64,
    pub version: HttpVersion,
    limit: usize,
    /// Outbound network ids of the pool's connections, oldest first.
    connections: Vec<u64>,
    queue: RequestQueue,
}

impl ClientPool {
    pub fn new(route: &Route, config: &HttpConfig, pool: BufferPool) -> Self {
        let version = select_version(route, config);
        let limit = match version {
            HttpVersion::Http2 => 1,
            HttpVersion::Http11 => config.maximum_connections_per_route,
        };
        debug!(route_id = route.id, version = version.as_str(), limit, "client pool created");

        Self {
            route_id: route.id,
            version,
            limit,
            connections: Vec::with_capacity(limit),
            queue: RequestQueue::new(route.id, config.maximum_request_queue_size, pool),
        }
    }

    pub fn connections(&self) -> &[u64] {
        &self.connections
    }

    /// Whether another connection may be opened.
    pub fn has_capacity(&self) -> bool {
        self.connections.len() < self.limit
    }

    pub fn add(&mut self, key: u64) {
        self.connections.push(key);
    }

    pub fn remove(&mut self, key: u64) {
        self.connections.retain(|connection| *connection != key);
    }

    pub fn enqueue(&mut self, request: &QueuedRequest) -> Result<(), QueueError> {
        self.queue.push(request)
    }

    pub fn next(&mut self) -> Option<QueuedRequest> {
        self.queue.pop()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_queued(&self, request_id: u64) -> bool {
        self.queue.contains(request_id)
    }

    pub fn cancel(&mut self, request_id: u64) -> bool {
        self.queue.remove(request_id)
    }

    pub fn mark_ended(&mut self, request_id: u64) -> bool {
        self.queue.mark_ended(request_id)
    }

    pub fn is_unused(&self) -> bool {
        self.connections.is_empty() && self.queue.is_empty()
    }
}

/// HTTP/2 only when the route allows nothing else, HTTP/1.1 otherwise.
fn select_version(route: &Route, config: &HttpConfig) -> HttpVersion {
    let h1 = config.supports(HttpVersion::Http11) && route.allows_version(HttpVersion::Http11.as_str());
    let h2 = config.supports(HttpVersion::Http2) && route.allows_version(HttpVersion::Http2.as_str());
    if h2 && !h1 { HttpVersion::Http2 } else { HttpVersion::Http11 }
}
