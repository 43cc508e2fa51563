use std::sync::atomic::{AtomicU64, Ordering};

use triomphe::Arc;

use crate::budget::BudgetCreditor;
use crate::buffer::BufferPool;
use crate::config::BufferPoolConfig;
use crate::signal::Signals;

/// Supplies stream, trace and budget ids.
///
/// Initial stream ids are odd, the paired reply id flips the lowest bit.
#[derive(Debug, Clone, Default)]
pub struct StreamIds {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    stream: AtomicU64,
    trace: AtomicU64,
}

impl StreamIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn supply_initial_id(&self) -> u64 {
        let next = self.inner.stream.fetch_add(1, Ordering::Relaxed) + 1;
        (next << 1) | 1
    }

    pub fn reply_id(initial_id: u64) -> u64 {
        initial_id ^ 1
    }

    pub fn is_initial(stream_id: u64) -> bool {
        stream_id & 1 == 1
    }

    pub fn supply_trace_id(&self) -> u64 {
        self.inner.trace.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Everything a gateway connection borrows from its engine.
#[derive(Debug, Clone)]
pub struct Context {
    pub binding_id: u64,
    pub pool: BufferPool,
    pub creditor: BudgetCreditor,
    pub signals: Signals,
    pub ids: StreamIds,
}

impl Context {
    pub fn new(binding_id: u64, pool: BufferPool, signals: Signals) -> Self {
        Self { binding_id, pool, creditor: BudgetCreditor::new(), signals, ids: StreamIds::new() }
    }

    pub fn from_config(binding_id: u64, config: &BufferPoolConfig) -> Self {
        Self::new(binding_id, BufferPool::new(config.slot_capacity, config.slot_count), Signals::system())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_ids_are_odd() {
        let ids = StreamIds::new();
        let first = ids.supply_initial_id();
        let second = ids.supply_initial_id();

        assert!(StreamIds::is_initial(first));
        assert!(StreamIds::is_initial(second));
        assert_ne!(first, second);

        let reply = StreamIds::reply_id(first);
        assert!(!StreamIds::is_initial(reply));
        assert_eq!(StreamIds::reply_id(reply), first);
    }

    #[test]
    fn test_clones_share_counters() {
        let ids = StreamIds::new();
        let other = ids.clone();

        assert_eq!(ids.supply_trace_id(), 1);
        assert_eq!(other.supply_trace_id(), 2);
    }
}
