//! The network side of a connection: one inbound and one outbound byte stream.
//!
//! Inbound bytes the decoder could not consume yet are parked in a decode
//! slot, and the inbound window is only reopened as that slot drains. Outbound
//! bytes that do not fit the network window are parked in an encode slot and
//! written out as the network acknowledges earlier data.

use bytes::Bytes;
use micro_fabric::{
    BeginFrame, BufferPool, DataFrame, FabricError, NetworkExtension, Outbox, Slot, StreamHeader, TransportInfo,
    Window, WindowFrame, flags,
};
use tracing::{debug, trace};

#[derive(Debug)]
pub struct NetworkStream {
    pub inbound_id: u64,
    pub outbound_id: u64,
    pub affinity: u64,
    pub authorization: u64,
    pub transport: TransportInfo,
    pub inbound: Window,
    pub outbound: Window,
    outbound_budget_id: u64,
    inbound_opened: bool,
    inbound_closed: bool,
    outbound_closed: bool,
    end_when_flushed: bool,
    decode_slot: Option<Slot>,
    encode_slot: Option<Slot>,
    pool: BufferPool,
    pub out: Outbox<NetworkExtension>,
}

impl NetworkStream {
    /// A stream opened by the network, the reply is begun immediately.
    pub fn accept(begin: &BeginFrame<NetworkExtension>, pool: BufferPool) -> Self {
        let transport = match &begin.extension {
            NetworkExtension::Begin(transport) => transport.clone(),
            NetworkExtension::Empty => TransportInfo::default(),
        };

        let header = &begin.header;
        let mut network = Self::new(header.stream_id, header.stream_id ^ 1, pool, transport);
        network.affinity = begin.affinity;
        network.authorization = header.authorization;
        network.inbound = Window::new(header.sequence, header.acknowledge, 0);
        network.inbound_opened = true;

        let reply = StreamHeader::new(network.outbound_id, &network.outbound).traced(header.trace_id, header.authorization);
        network.out.begin(reply, network.affinity, NetworkExtension::Empty);
        network.grant_inbound(header.trace_id);
        network
    }

    /// A stream opened toward the network, usable once the reply begins.
    pub fn connect(
        outbound_id: u64,
        affinity: u64,
        authorization: u64,
        transport: TransportInfo,
        pool: BufferPool,
        trace_id: u64,
    ) -> Self {
        let mut network = Self::new(outbound_id ^ 1, outbound_id, pool, transport);
        network.affinity = affinity;
        network.authorization = authorization;

        let header = StreamHeader::new(outbound_id, &network.outbound).traced(trace_id, authorization);
        network.out.begin(header, affinity, NetworkExtension::Begin(network.transport.clone()));
        network
    }

    fn new(inbound_id: u64, outbound_id: u64, pool: BufferPool, transport: TransportInfo) -> Self {
        Self {
            inbound_id,
            outbound_id,
            affinity: 0,
            authorization: 0,
            transport,
            inbound: Window::default(),
            outbound: Window::default(),
            outbound_budget_id: 0,
            inbound_opened: false,
            inbound_closed: false,
            outbound_closed: false,
            end_when_flushed: false,
            decode_slot: None,
            encode_slot: None,
            pool,
            out: Outbox::new(),
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn is_inbound_open(&self) -> bool {
        self.inbound_opened && !self.inbound_closed
    }

    pub fn is_outbound_closed(&self) -> bool {
        self.outbound_closed
    }

    pub fn is_closed(&self) -> bool {
        self.inbound_closed && self.outbound_closed
    }

    fn header(&self, stream_id: u64, window: &Window, trace_id: u64) -> StreamHeader {
        StreamHeader::new(stream_id, window).traced(trace_id, self.authorization)
    }

    /// The reply of a stream opened with [`connect`](Self::connect) has begun.
    pub fn on_reply_begin(&mut self, begin: &BeginFrame<NetworkExtension>) {
        self.inbound = Window::new(begin.header.sequence, begin.header.acknowledge, 0);
        self.inbound_opened = true;
        self.grant_inbound(begin.header.trace_id);
    }

    /// Reopens the inbound window by what the decode slot no longer holds.
    pub fn grant_inbound(&mut self, trace_id: u64) {
        if !self.is_inbound_open() {
            return;
        }

        let buffered = self.buffered_input() as u64;
        let acknowledge = self.inbound.sequence - buffered;
        let maximum = u32::try_from(self.pool.slot_capacity()).unwrap_or(u32::MAX);

        if acknowledge > self.inbound.acknowledge || maximum > self.inbound.maximum {
            self.inbound.grant(acknowledge.max(self.inbound.acknowledge), maximum);
            let header = self.header(self.inbound_id, &self.inbound, trace_id);
            self.out.window(header, 0, 0);
        }
    }

    pub fn receive(&mut self, data: &DataFrame<NetworkExtension>) -> Result<(), FabricError> {
        self.inbound.receive(data.header.sequence, data.reserved)
    }

    pub fn on_end(&mut self) {
        self.inbound_closed = true;
        self.decode_slot = None;
    }

    pub fn on_window(&mut self, window: &WindowFrame) -> Result<(), FabricError> {
        let header = &window.header;
        self.outbound.observe(header.acknowledge, header.maximum, window.padding)?;
        self.outbound_budget_id = window.budget_id;
        Ok(())
    }

    /// Takes the decode slot for a decode pass, it must be handed back with
    /// [`restore_decode_slot`](Self::restore_decode_slot).
    pub fn take_decode_slot(&mut self) -> Option<Slot> {
        self.decode_slot.take()
    }

    pub fn restore_decode_slot(&mut self, slot: Slot) {
        if !slot.is_empty() && !self.inbound_closed {
            self.decode_slot = Some(slot);
        }
    }

    /// Parks bytes the decoder left behind.
    pub fn buffer_input(&mut self, remainder: &[u8]) -> Result<(), FabricError> {
        if remainder.is_empty() {
            return Ok(());
        }

        match &mut self.decode_slot {
            Some(slot) => slot.try_put(remainder),
            None => {
                let mut slot = self.pool.try_acquire(self.inbound_id)?;
                slot.try_put(remainder)?;
                self.decode_slot = Some(slot);
                Ok(())
            }
        }
    }

    pub fn buffered_input(&self) -> usize {
        self.decode_slot.as_ref().map_or(0, Slot::len)
    }

    pub fn buffered_output(&self) -> usize {
        self.encode_slot.as_ref().map_or(0, Slot::len)
    }

    /// Bytes that can go out right now without parking.
    pub fn writable(&self) -> usize {
        if self.outbound_closed || self.buffered_output() > 0 { 0 } else { self.outbound.writable() }
    }

    /// Writes `bytes` in order, parking what the window cannot take.
    pub fn write(&mut self, trace_id: u64, bytes: &[u8]) -> Result<(), FabricError> {
        if self.outbound_closed || bytes.is_empty() {
            return Ok(());
        }

        if let Some(slot) = &mut self.encode_slot {
            slot.try_put(bytes)?;
            self.flush(trace_id);
            return Ok(());
        }

        let length = self.outbound.writable().min(bytes.len());
        if length > 0 {
            self.emit(trace_id, Bytes::copy_from_slice(&bytes[..length]));
        }

        if length < bytes.len() {
            let mut slot = self.pool.try_acquire(self.outbound_id)?;
            slot.try_put(&bytes[length..])?;
            trace!(stream_id = self.outbound_id, parked = bytes.len() - length, "network write parked");
            self.encode_slot = Some(slot);
        }
        Ok(())
    }

    /// Sends one Data frame, the caller has checked [`writable`](Self::writable).
    pub fn emit(&mut self, trace_id: u64, payload: Bytes) {
        let reserved = payload.len() as u32 + self.outbound.padding;
        let header = self.header(self.outbound_id, &self.outbound, trace_id);
        self.out.data(header, flags::COMPLETE, self.outbound_budget_id, reserved, payload, NetworkExtension::Empty);
        self.outbound.advance(reserved);
    }

    /// Writes parked bytes as far as the window allows.
    pub fn flush(&mut self, trace_id: u64) {
        if let Some(mut slot) = self.encode_slot.take() {
            let length = self.outbound.writable().min(slot.len());
            if length > 0 {
                let payload = Bytes::copy_from_slice(&slot.as_slice()[..length]);
                self.emit(trace_id, payload);
                slot.consume(length);
            }
            if !slot.is_empty() {
                self.encode_slot = Some(slot);
            }
        }

        if self.end_when_flushed && self.encode_slot.is_none() {
            self.end(trace_id);
        }
    }

    /// Ends the outbound stream once parked bytes are written.
    pub fn end(&mut self, trace_id: u64) {
        if self.outbound_closed {
            return;
        }

        if self.encode_slot.is_some() {
            self.end_when_flushed = true;
            return;
        }

        let header = self.header(self.outbound_id, &self.outbound, trace_id);
        self.out.end(header, NetworkExtension::Empty);
        self.outbound_closed = true;
        debug!(stream_id = self.outbound_id, "network end");
    }

    pub fn is_ending(&self) -> bool {
        self.end_when_flushed || self.outbound_closed
    }

    /// Drops parked bytes and aborts the outbound stream.
    pub fn abort(&mut self, trace_id: u64) {
        self.encode_slot = None;
        if !self.outbound_closed {
            let header = self.header(self.outbound_id, &self.outbound, trace_id);
            self.out.abort(header);
            self.outbound_closed = true;
            debug!(stream_id = self.outbound_id, "network abort");
        }
    }

    /// Refuses further inbound bytes.
    pub fn reset(&mut self, trace_id: u64) {
        self.decode_slot = None;
        if !self.inbound_closed {
            let header = self.header(self.inbound_id, &self.inbound, trace_id);
            self.out.reset(header, NetworkExtension::Empty);
            self.inbound_closed = true;
        }
    }

    /// Tears down both directions.
    pub fn close(&mut self, trace_id: u64) {
        self.abort(trace_id);
        self.reset(trace_id);
    }
}
