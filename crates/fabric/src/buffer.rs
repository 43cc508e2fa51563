//! Fixed capacity slot pool for partial frame buffering.
//!
//! A [`BufferPool`] owns `slot_count` buffers of `slot_capacity` bytes. A
//! [`Slot`] is the only way to reach a buffer: it is handed out by
//! [`BufferPool::acquire`] and goes back to the pool when dropped, so a slot
//! can neither be released twice nor used after release.
//!
//! Exhaustion is reported as `None`. Callers treat it as fatal for the
//! connection that asked, dropping bytes mid-frame would corrupt the
//! protocol state.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use bytes::{Buf, BytesMut};
use tracing::{trace, warn};
use triomphe::Arc;

use crate::error::FabricError;

/// Shared pool of fixed size buffers.
///
/// Cloning is cheap, all clones draw from the same slots.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    slot_capacity: usize,
    slot_count: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    free: Vec<usize>,
    buffers: Vec<Option<BytesMut>>,
    owners: Vec<u64>,
}

impl BufferPool {
    pub fn new(slot_capacity: usize, slot_count: usize) -> Self {
        let state = PoolState {
            // pop from the back hands out the lowest handle first
            free: (0..slot_count).rev().collect(),
            buffers: (0..slot_count).map(|_| None).collect(),
            owners: vec![0; slot_count],
        };

        Self { inner: Arc::new(PoolInner { slot_capacity, slot_count, state: Mutex::new(state) }) }
    }

    pub fn slot_capacity(&self) -> usize {
        self.inner.slot_capacity
    }

    pub fn slot_count(&self) -> usize {
        self.inner.slot_count
    }

    /// Number of slots currently held by owners.
    pub fn acquired(&self) -> usize {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.slot_count - state.free.len()
    }

    /// Acquires a slot on behalf of `owner`, typically a stream id.
    ///
    /// Contents of a reused slot are cleared before it is handed out.
    pub fn acquire(&self, owner: u64) -> Option<Slot> {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(handle) = state.free.pop() else {
            warn!(owner, slot_count = self.inner.slot_count, "buffer pool exhausted");
            return None;
        };

        let mut buffer = state.buffers[handle].take().unwrap_or_else(|| BytesMut::with_capacity(self.inner.slot_capacity));
        buffer.clear();
        state.owners[handle] = owner;

        trace!(owner, handle, "acquired slot");
        Some(Slot { pool: self.clone(), handle, owner, buffer })
    }

    /// Acquires a slot or reports exhaustion as an error.
    pub fn try_acquire(&self, owner: u64) -> Result<Slot, FabricError> {
        self.acquire(owner).ok_or(FabricError::SlotExhausted { owner })
    }

    fn release(&self, handle: usize, buffer: BytesMut) {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(state.buffers[handle].is_none(), "slot {handle} released twice");

        state.buffers[handle] = Some(buffer);
        state.owners[handle] = 0;
        state.free.push(handle);
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("slot_capacity", &self.inner.slot_capacity)
            .field("slot_count", &self.inner.slot_count)
            .field("acquired", &self.acquired())
            .finish()
    }
}

/// Exclusive handle on one pool buffer.
///
/// Bytes are appended at the back and consumed from the front, the total
/// length never exceeds the pool's slot capacity.
pub struct Slot {
    pool: BufferPool,
    handle: usize,
    owner: u64,
    buffer: BytesMut,
}

impl Slot {
    pub fn handle(&self) -> usize {
        self.handle
    }

    pub fn owner(&self) -> u64 {
        self.owner
    }

    pub fn capacity(&self) -> usize {
        self.pool.slot_capacity()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes that can still be appended.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.buffer.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Appends `bytes`, refusing anything that would overflow the slot.
    pub fn try_put(&mut self, bytes: &[u8]) -> Result<(), FabricError> {
        let length = self.buffer.len() + bytes.len();
        crate::ensure!(length <= self.capacity(), FabricError::slot_overflow(length, self.capacity()));

        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Drops the first `count` bytes.
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.buffer.len());
        self.buffer.advance(count);
        if self.buffer.is_empty() {
            self.buffer.clear();
        }
    }

    /// Keeps only `bytes`, replacing everything buffered so far.
    pub fn reset_to(&mut self, bytes: &[u8]) -> Result<(), FabricError> {
        self.buffer.clear();
        self.try_put(bytes)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        trace!(owner = self.owner, handle = self.handle, "released slot");
        let buffer = std::mem::take(&mut self.buffer);
        self.pool.release(self.handle, buffer);
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("handle", &self.handle)
            .field("owner", &self.owner)
            .field("len", &self.buffer.len())
            .finish_non_exhaustive()
    }
}
