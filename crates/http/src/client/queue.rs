//! Requests waiting for a free connection, byte encoded in one pooled slot.
//!
//! Entry layout, integers big endian:
//!
//! ```text
//! u32 length | u64 request_id | u64 trace_id | u64 authorization | u64 affinity | u8 ended
//! u16 count  | (u16 name_length | name | u32 value_length | value) * count
//! ```
//!
//! `length` covers everything after itself. The slot is acquired with the
//! first entry and released when the queue drains.

use bytes::{Buf, BufMut};
use micro_fabric::{BufferPool, Slot};
use thiserror::Error;
use tracing::trace;

use crate::protocol::HeaderList;

const ENTRY_HEADER_LEN: usize = 8 * 4 + 1 + 2;

/// A request accepted from the application but not yet written to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRequest {
    pub request_id: u64,
    pub trace_id: u64,
    pub authorization: u64,
    pub affinity: u64,
    /// The application ended the request while it waited.
    pub ended: bool,
    pub headers: HeaderList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("request entry of {length} bytes exceeds the queue limit {limit}")]
    TooLarge { length: usize, limit: usize },

    #[error("request queue full")]
    Full,
}

impl QueueError {
    /// Status of the response synthesized for the rejected request.
    pub fn status(self) -> u16 {
        match self {
            QueueError::TooLarge { .. } => 431,
            QueueError::Full => 503,
        }
    }
}

#[derive(Debug)]
pub struct RequestQueue {
    owner: u64,
    limit: usize,
    pool: BufferPool,
    slot: Option<Slot>,
    count: usize,
}

impl RequestQueue {
    pub fn new(owner: u64, limit: usize, pool: BufferPool) -> Self {
        Self { owner, limit, pool, slot: None, count: 0 }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn push(&mut self, request: &QueuedRequest) -> Result<(), QueueError> {
        let mut entry = Vec::with_capacity(ENTRY_HEADER_LEN + 4 + request.headers.encoded_len());
        encode_entry(&mut entry, request);
        if entry.len() > self.limit {
            return Err(QueueError::TooLarge { length: entry.len(), limit: self.limit });
        }

        let slot = match &mut self.slot {
            Some(slot) => slot,
            slot => slot.insert(self.pool.acquire(self.owner).ok_or(QueueError::Full)?),
        };
        if slot.remaining() < entry.len() {
            if slot.is_empty() {
                self.slot = None;
            }
            return Err(QueueError::Full);
        }

        slot.try_put(&entry).map_err(|_| QueueError::Full)?;
        self.count += 1;
        trace!(owner = self.owner, request_id = request.request_id, queued = self.count, "request queued");
        Ok(())
    }

    /// Removes the oldest entry.
    pub fn pop(&mut self) -> Option<QueuedRequest> {
        let slot = self.slot.as_mut()?;
        let (request, length) = decode_entry(slot.as_slice())?;
        slot.consume(length);
        self.count -= 1;

        if slot.is_empty() {
            self.slot = None;
        }
        Some(request)
    }

    /// Drops the entry of `request_id`, keeping the order of the others.
    pub fn remove(&mut self, request_id: u64) -> bool {
        self.rewrite(|request| request.request_id != request_id)
    }

    /// Records that the application ended `request_id` while it waited.
    pub fn mark_ended(&mut self, request_id: u64) -> bool {
        let mut found = false;
        self.rewrite(|request| {
            if request.request_id == request_id {
                request.ended = true;
                found = true;
            }
            true
        });
        found
    }

    pub fn contains(&self, request_id: u64) -> bool {
        self.entries().any(|request| request.request_id == request_id)
    }

    fn entries(&self) -> impl Iterator<Item = QueuedRequest> + '_ {
        let mut buf = self.slot.as_ref().map_or(&[][..], Slot::as_slice);
        std::iter::from_fn(move || {
            let (request, length) = decode_entry(buf)?;
            buf = &buf[length..];
            Some(request)
        })
    }

    /// Re-encodes every entry, dropping those `keep` refuses.
    fn rewrite(&mut self, mut keep: impl FnMut(&mut QueuedRequest) -> bool) -> bool {
        let before = self.count;
        let mut encoded = Vec::new();
        let mut count = 0;
        for mut request in self.entries().collect::<Vec<_>>() {
            if keep(&mut request) {
                encode_entry(&mut encoded, &request);
                count += 1;
            }
        }

        let Some(slot) = &mut self.slot else {
            return false;
        };
        if slot.reset_to(&encoded).is_err() {
            return false;
        }
        self.count = count;
        if slot.is_empty() {
            self.slot = None;
        }
        count != before
    }
}

fn encode_entry(dst: &mut Vec<u8>, request: &QueuedRequest) {
    let start = dst.len();
    dst.put_u32(0);
    dst.put_u64(request.request_id);
    dst.put_u64(request.trace_id);
    dst.put_u64(request.authorization);
    dst.put_u64(request.affinity);
    dst.put_u8(u8::from(request.ended));
    dst.put_u16(request.headers.len() as u16);
    for (name, value) in request.headers.iter() {
        dst.put_u16(name.len() as u16);
        dst.put_slice(name.as_bytes());
        dst.put_u32(value.len() as u32);
        dst.put_slice(value.as_bytes());
    }

    let length = (dst.len() - start - 4) as u32;
    dst[start..start + 4].copy_from_slice(&length.to_be_bytes());
}

/// Decodes the entry at the front of `buf`, with the bytes it spans.
fn decode_entry(buf: &[u8]) -> Option<(QueuedRequest, usize)> {
    let mut src = buf;
    if src.remaining() < 4 {
        return None;
    }
    let length = src.get_u32() as usize;
    if src.remaining() < length || length < ENTRY_HEADER_LEN {
        return None;
    }

    let mut entry = &src[..length];
    let request_id = entry.get_u64();
    let trace_id = entry.get_u64();
    let authorization = entry.get_u64();
    let affinity = entry.get_u64();
    let ended = entry.get_u8() != 0;
    let count = entry.get_u16();

    let mut headers = HeaderList::with_capacity(usize::from(count));
    for _ in 0..count {
        let name = take_string(&mut entry, 2)?;
        let value = take_string(&mut entry, 4)?;
        headers.push(name, value);
    }

    let request = QueuedRequest { request_id, trace_id, authorization, affinity, ended, headers };
    Some((request, 4 + length))
}

fn take_string(src: &mut &[u8], prefix: usize) -> Option<String> {
    if src.remaining() < prefix {
        return None;
    }
    let length = if prefix == 2 { usize::from(src.get_u16()) } else { src.get_u32() as usize };
    if src.remaining() < length {
        return None;
    }
    let value = String::from_utf8(src[..length].to_vec()).ok()?;
    src.advance(length);
    Some(value)
}
