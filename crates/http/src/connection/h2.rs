//! Connection level HTTP/2 state shared by the server and the client.
//!
//! [`Http2Core`] owns the network stream, HPACK tables, both settings, the
//! connection windows and the outgoing frame queue. Stream state lives in
//! [`Http2Stream`] and is driven by the server or client owning the core.
//!
//! Outgoing frames are queued per class and written in priority order:
//! control frames first, then header blocks, then data. A partially written
//! entry is always completed before anything else goes out, which keeps
//! HEADERS and their CONTINUATION frames contiguous.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use micro_fabric::{BudgetCreditor, BudgetDebitor, Context, CreditorIndex, Slot, Window};
use tracing::{debug, trace};

use crate::codec::h2::{
    FrameHeader, FrameType, Goaway, Http2Decoder, Http2Settings, MAX_WINDOW_SIZE, PREFACE, Priority, flags,
    headers_fragment, parse_goaway, push_promise_fragment, write,
};
use crate::codec::hpack::{HpackDecoder, HpackEncoder};
use crate::config::HttpConfig;
use crate::connection::network::NetworkStream;
use crate::exchange::{Exchange, GuardSession};
use crate::protocol::{HeaderList, Http2Error, Http2ErrorCode};

/// Connection window defined by RFC 9113, unaffected by SETTINGS.
const CONNECTION_WINDOW: i64 = 65_535;

/// Headers that are meaningless on an HTTP/2 connection.
pub const CONNECTION_HEADERS: [&str; 5] = ["connection", "keep-alive", "proxy-connection", "transfer-encoding", "upgrade"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Control = 0,
    Headers = 1,
    Data = 2,
}

/// Outgoing frames, queued per [`FrameClass`].
#[derive(Debug, Default)]
pub struct EncodeQueue {
    classes: [VecDeque<Bytes>; 3],
    lengths: [usize; 3],
    active: Option<usize>,
}

impl EncodeQueue {
    pub fn push(&mut self, class: FrameClass, frames: Bytes) {
        if frames.is_empty() {
            return;
        }
        let class = class as usize;
        self.lengths[class] += frames.len();
        self.classes[class].push_back(frames);
    }

    pub fn len(&self) -> usize {
        self.lengths.iter().sum()
    }

    pub fn class_len(&self, class: FrameClass) -> usize {
        self.lengths[class as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes up to `limit` bytes in priority order.
    pub fn take(&mut self, limit: usize) -> Option<Bytes> {
        let mut taken = BytesMut::new();

        while taken.len() < limit {
            let class = match self.active {
                Some(class) => class,
                None => match (0..self.classes.len()).find(|class| !self.classes[*class].is_empty()) {
                    Some(class) => class,
                    None => break,
                },
            };

            let Some(front) = self.classes[class].front_mut() else {
                self.active = None;
                continue;
            };

            let length = front.len().min(limit - taken.len());
            taken.extend_from_slice(&front.split_to(length));
            self.lengths[class] -= length;

            if front.is_empty() {
                self.classes[class].pop_front();
                self.active = None;
            } else {
                self.active = Some(class);
            }
        }

        (!taken.is_empty()).then(|| taken.freeze())
    }
}

/// A header block reassembled across CONTINUATION frames.
#[derive(Debug)]
pub struct DecodedHeaders {
    pub stream_id: u32,
    pub end_stream: bool,
    pub promised_id: Option<u32>,
    pub priority: Option<Priority>,
    pub headers: HeaderList,
}

#[derive(Debug)]
struct PendingBlock {
    stream_id: u32,
    end_stream: bool,
    promised_id: Option<u32>,
    priority: Option<Priority>,
    block: Slot,
}

/// Effect of a SETTINGS frame on the stream windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsChange {
    /// The peer acknowledged our settings, local stream budgets move by the delta.
    Acknowledged { initial_window_delta: i64 },
    /// The peer changed its settings, remote stream budgets move by the delta.
    Updated { initial_window_delta: i64 },
}

#[derive(Debug)]
pub struct Http2Core {
    pub network: NetworkStream,
    pub decoder: Http2Decoder,
    hpack_decoder: HpackDecoder,
    hpack_encoder: HpackEncoder,
    pub local: Http2Settings,
    pending_local: Option<Http2Settings>,
    pub remote: Http2Settings,
    /// Bytes the peer may still send on the connection.
    pub local_shared_budget: i64,
    /// Shared budget of the connection send window, claimed by every DATA frame.
    pub budget_id: u64,
    creditor: BudgetCreditor,
    debitor: BudgetDebitor,
    creditor_index: CreditorIndex,
    pub encoder: EncodeQueue,
    pending_block: Option<PendingBlock>,
    pub goaway_sent: bool,
    pub goaway_received: bool,
    encode_limit: usize,
    advertised: Http2Settings,
}

impl Http2Core {
    pub fn new(network: NetworkStream, decoder: Http2Decoder, config: &HttpConfig, context: &Context) -> Self {
        let budget_id = context.creditor.supply_budget_id();
        let creditor_index = context.creditor.acquire(budget_id);
        context.creditor.credit(0, creditor_index, CONNECTION_WINDOW);

        let encode_limit = network.pool().slot_capacity();
        Self {
            network,
            decoder,
            hpack_decoder: HpackDecoder::new(),
            hpack_encoder: HpackEncoder::new(),
            local: Http2Settings { max_concurrent_streams: config.max_concurrent_streams, ..Http2Settings::default() },
            pending_local: None,
            remote: Http2Settings::default(),
            local_shared_budget: CONNECTION_WINDOW,
            budget_id,
            creditor: context.creditor.clone(),
            debitor: context.creditor.debitor(),
            creditor_index,
            encoder: EncodeQueue::default(),
            pending_block: None,
            goaway_sent: false,
            goaway_received: false,
            encode_limit,
            advertised: Http2Settings::local(config),
        }
    }

    /// Queues the server SETTINGS, sent in reply to the client preface.
    pub fn start_server(&mut self) {
        let mut frames = BytesMut::new();
        write::settings(&mut frames, &self.advertised.server_entries());
        self.encoder.push(FrameClass::Control, frames.freeze());
        self.pending_local = Some(self.advertised);
    }

    /// Queues the client preface and SETTINGS.
    pub fn start_client(&mut self) {
        let mut frames = BytesMut::from(PREFACE);
        write::settings(&mut frames, &self.advertised.client_entries());
        self.encoder.push(FrameClass::Control, frames.freeze());
        self.pending_local = Some(self.advertised);
    }

    pub fn on_settings(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<Option<SettingsChange>, Http2Error> {
        if header.stream_id != 0 {
            return Err(Http2Error::protocol());
        }

        if header.has(flags::ACK) {
            if header.length != 0 {
                return Err(Http2Error::frame_size());
            }

            let Some(pending) = self.pending_local.take() else {
                return Ok(None);
            };
            let delta = i64::from(pending.initial_window_size) - i64::from(self.local.initial_window_size);
            self.local = pending;
            return Ok(Some(SettingsChange::Acknowledged { initial_window_delta: delta }));
        }

        let previous = self.remote.initial_window_size;
        self.remote.apply(payload)?;

        let mut ack = BytesMut::new();
        write::settings_ack(&mut ack);
        self.encoder.push(FrameClass::Control, ack.freeze());

        trace!(settings = ?self.remote, "remote settings");
        let delta = i64::from(self.remote.initial_window_size) - i64::from(previous);
        Ok(Some(SettingsChange::Updated { initial_window_delta: delta }))
    }

    pub fn on_ping(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if header.stream_id != 0 {
            return Err(Http2Error::protocol());
        }
        let Ok(opaque) = <[u8; 8]>::try_from(payload) else {
            return Err(Http2Error::frame_size());
        };

        if !header.has(flags::ACK) {
            let mut pong = BytesMut::new();
            write::ping(&mut pong, true, &opaque);
            self.encoder.push(FrameClass::Control, pong.freeze());
        }
        Ok(())
    }

    pub fn on_goaway(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<Goaway, Http2Error> {
        if header.stream_id != 0 {
            return Err(Http2Error::protocol());
        }
        let goaway = parse_goaway(payload).ok_or_else(Http2Error::frame_size)?;
        debug!(last_stream_id = goaway.last_stream_id, code = ?goaway.error_code, "http/2 goaway received");
        self.goaway_received = true;
        Ok(goaway)
    }

    /// A connection level WINDOW_UPDATE.
    pub fn on_connection_window(&mut self, increment: u32) -> Result<(), Http2Error> {
        if increment == 0 {
            return Err(Http2Error::protocol());
        }

        if self.remote_shared_budget() + i64::from(increment) > MAX_WINDOW_SIZE {
            return Err(Http2Error::flow_control());
        }

        self.creditor.credit(0, self.creditor_index, i64::from(increment));
        Ok(())
    }

    /// Bytes this side may still send on the connection.
    pub fn remote_shared_budget(&self) -> i64 {
        self.creditor.available(self.creditor_index)
    }

    /// Collects a HEADERS, PUSH_PROMISE or CONTINUATION fragment, decoding the
    /// block once END_HEADERS arrives.
    pub fn on_header_fragment(
        &mut self,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<Option<DecodedHeaders>, Http2Error> {
        if header.stream_id == 0 {
            return Err(Http2Error::protocol());
        }

        let (fragment, pending) = match header.frame_type {
            FrameType::Headers => {
                let (priority, fragment) = headers_fragment(header, payload)?;
                let pending = self.new_block(header.stream_id, header.is_end_stream(), None, priority)?;
                (fragment, pending)
            }
            FrameType::PushPromise => {
                let (promised_id, fragment) = push_promise_fragment(header, payload)?;
                let pending = self.new_block(header.stream_id, false, Some(promised_id), None)?;
                (fragment, pending)
            }
            _ => {
                let pending = self.pending_block.take().ok_or_else(Http2Error::protocol)?;
                (payload, pending)
            }
        };

        let mut pending = pending;
        if pending.block.try_put(fragment).is_err() {
            return Err(Http2Error::connection(Http2ErrorCode::EnhanceYourCalm));
        }

        if !header.is_end_headers() {
            self.pending_block = Some(pending);
            return Ok(None);
        }

        let headers = self.hpack_decoder.decode(pending.block.as_slice())?;
        Ok(Some(DecodedHeaders {
            stream_id: pending.stream_id,
            end_stream: pending.end_stream,
            promised_id: pending.promised_id,
            priority: pending.priority,
            headers,
        }))
    }

    fn new_block(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        promised_id: Option<u32>,
        priority: Option<Priority>,
    ) -> Result<PendingBlock, Http2Error> {
        let block = self
            .network
            .pool()
            .acquire(u64::from(stream_id))
            .ok_or_else(|| Http2Error::connection(Http2ErrorCode::InternalError))?;
        Ok(PendingBlock { stream_id, end_stream, promised_id, priority, block })
    }

    /// Debits the connection receive window for a DATA frame.
    pub fn debit_data(&mut self, header: &FrameHeader) -> Result<(), Http2Error> {
        self.local_shared_budget -= i64::from(header.length);
        if self.local_shared_budget < 0 {
            return Err(Http2Error::flow_control());
        }
        Ok(())
    }

    /// Returns `credit` bytes to the peer on the connection and, when given, the stream.
    pub fn credit_peer(&mut self, stream_id: Option<u32>, credit: u32) {
        if credit == 0 {
            return;
        }

        let mut frames = BytesMut::new();
        write::window_update(&mut frames, 0, credit);
        self.local_shared_budget += i64::from(credit);
        if let Some(stream_id) = stream_id {
            write::window_update(&mut frames, stream_id, credit);
        }
        self.encoder.push(FrameClass::Control, frames.freeze());
    }

    pub fn encode_headers(&mut self, stream_id: u32, headers: &HeaderList, end_stream: bool) {
        let block = self.hpack_encoder.encode(headers);
        let mut frames = BytesMut::new();
        write::headers(&mut frames, stream_id, &block, end_stream, self.remote.max_frame_size);
        self.encoder.push(FrameClass::Headers, frames.freeze());
    }

    /// Trailers follow the data of their stream, so they queue as data.
    pub fn encode_trailers(&mut self, stream_id: u32, trailers: &HeaderList) {
        let block = self.hpack_encoder.encode(trailers);
        let mut frames = BytesMut::new();
        write::headers(&mut frames, stream_id, &block, true, self.remote.max_frame_size);
        self.encoder.push(FrameClass::Data, frames.freeze());
    }

    pub fn encode_push_promise(&mut self, stream_id: u32, promised_id: u32, headers: &HeaderList) {
        let block = self.hpack_encoder.encode(headers);
        let mut frames = BytesMut::new();
        write::push_promise(&mut frames, stream_id, promised_id, &block, self.remote.max_frame_size);
        self.encoder.push(FrameClass::Headers, frames.freeze());
    }

    pub fn encode_data(&mut self, stream_id: u32, payload: &[u8], end_stream: bool) {
        let mut frames = BytesMut::with_capacity(payload.len() + 9);
        write::data(&mut frames, stream_id, payload, end_stream, self.remote.max_frame_size);
        self.encoder.push(FrameClass::Data, frames.freeze());
    }

    pub fn reset_stream(&mut self, stream_id: u32, code: Http2ErrorCode) {
        debug!(stream_id, ?code, "http/2 rst_stream");
        let mut frames = BytesMut::new();
        write::rst_stream(&mut frames, stream_id, code);
        self.encoder.push(FrameClass::Control, frames.freeze());
    }

    pub fn goaway(&mut self, last_stream_id: u32, code: Http2ErrorCode) {
        if self.goaway_sent {
            return;
        }
        debug!(last_stream_id, ?code, "http/2 goaway");
        let mut frames = BytesMut::new();
        write::goaway(&mut frames, last_stream_id, code);
        self.encoder.push(FrameClass::Control, frames.freeze());
        self.goaway_sent = true;
    }

    /// Room left for data frames in the outgoing queue.
    pub fn data_capacity(&self) -> usize {
        self.encode_limit.saturating_sub(self.encoder.class_len(FrameClass::Data))
    }

    pub fn encode_limit(&self) -> usize {
        self.encode_limit
    }

    /// Moves queued data frames for `stream` within the stream and connection windows.
    ///
    /// Returns `true` once END_STREAM has been queued.
    pub fn frame_outgoing(&mut self, stream: &mut Http2Stream) -> bool {
        if stream.outgoing_closed {
            return false;
        }

        while let Some(front) = stream.outgoing.front_mut() {
            let budget = stream
                .remote_budget
                .min(self.data_capacity() as i64)
                .min(i64::from(self.remote.max_frame_size))
                .min(front.len() as i64);
            if budget <= 0 {
                return false;
            }

            let claimed = self.debitor.claim(self.budget_id, 1, budget);
            if claimed <= 0 {
                return false;
            }

            let length = claimed as usize;
            let chunk = front.split_to(length);
            if front.is_empty() {
                stream.outgoing.pop_front();
            }

            stream.outgoing_len -= length;
            stream.remote_budget -= claimed;

            let end_stream = stream.outgoing.is_empty() && stream.outgoing_end.as_ref().is_some_and(HeaderList::is_empty);
            self.encode_data(stream.stream_id, &chunk, end_stream);
            if end_stream {
                stream.outgoing_end = None;
                stream.outgoing_closed = true;
                return true;
            }
        }

        match stream.outgoing_end.take() {
            Some(trailers) if trailers.is_empty() => self.encode_data(stream.stream_id, &[], true),
            Some(trailers) => self.encode_trailers(stream.stream_id, &trailers),
            None => return false,
        }
        stream.outgoing_closed = true;
        true
    }

    /// Writes queued frames within the network window.
    pub fn flush(&mut self, trace_id: u64) {
        self.network.flush(trace_id);

        loop {
            let writable = self.network.writable();
            if writable == 0 {
                break;
            }
            let Some(payload) = self.encoder.take(writable) else {
                break;
            };
            self.network.emit(trace_id, payload);
        }
    }
}

impl Drop for Http2Core {
    fn drop(&mut self) {
        self.creditor.release(self.creditor_index);
    }
}

/// One HTTP/2 stream and the exchange it carries.
///
/// *Incoming* is what the peer sends and the application receives,
/// *outgoing* is what the application sends and the peer receives.
#[derive(Debug)]
pub struct Http2Stream {
    pub stream_id: u32,
    pub exchange: Exchange,
    /// Bytes the peer may still send on this stream, negative after a SETTINGS decrease.
    pub local_budget: i64,
    /// Bytes this side may still send on this stream.
    pub remote_budget: i64,
    outgoing: VecDeque<Bytes>,
    outgoing_len: usize,
    outgoing_end: Option<HeaderList>,
    pub outgoing_closed: bool,
    pub incoming_closed: bool,
    pub content_length: Option<u64>,
    pub content_received: u64,
    /// Incoming end held back until the application opened its window.
    pub deferred_end: Option<HeaderList>,
    pub session: GuardSession,
    pub promised: bool,
    /// Appended to the response headers, from the access control policy.
    pub response_headers: Vec<(String, String)>,
}

impl Http2Stream {
    pub fn new(stream_id: u32, exchange: Exchange, local: &Http2Settings, remote: &Http2Settings) -> Self {
        Self {
            stream_id,
            exchange,
            local_budget: i64::from(local.initial_window_size),
            remote_budget: i64::from(remote.initial_window_size),
            outgoing: VecDeque::new(),
            outgoing_len: 0,
            outgoing_end: None,
            outgoing_closed: false,
            incoming_closed: false,
            content_length: None,
            content_received: 0,
            deferred_end: None,
            session: GuardSession::none(),
            promised: false,
            response_headers: Vec::new(),
        }
    }

    pub fn queue_outgoing(&mut self, payload: Bytes) {
        if !payload.is_empty() && !self.outgoing_closed {
            self.outgoing_len += payload.len();
            self.outgoing.push_back(payload);
        }
    }

    pub fn end_outgoing(&mut self, trailers: HeaderList) {
        if !self.outgoing_closed {
            self.outgoing_end = Some(trailers);
        }
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing_closed && (self.outgoing_len > 0 || self.outgoing_end.is_some())
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing_len
    }

    pub fn clear_outgoing(&mut self) {
        self.outgoing.clear();
        self.outgoing_len = 0;
        self.outgoing_end = None;
    }

    /// Checks observed content against `content-length` at END_STREAM.
    pub fn content_matches(&self) -> bool {
        self.content_length.is_none_or(|length| length == self.content_received)
    }
}

/// Sizes the application window for outgoing data from the peer's stream window.
///
/// The application may have `min(maximum, remote_budget - queued)` bytes in
/// flight. Returns `true` when the window changed.
pub fn grant_outgoing(window: &mut Window, remote_budget: i64, queued: usize, capacity: usize) -> bool {
    let capacity = u32::try_from(capacity).unwrap_or(u32::MAX);
    let offered = u32::try_from(remote_budget.clamp(0, i64::from(capacity))).unwrap_or(0);
    let maximum = window.maximum.max(offered);

    let credit = (remote_budget - queued as i64).clamp(0, i64::from(maximum)) as u64;
    let acknowledge = (window.sequence + credit).saturating_sub(u64::from(maximum)).min(window.sequence);
    let acknowledge = acknowledge.max(window.acknowledge);

    if acknowledge == window.acknowledge && maximum == window.maximum {
        return false;
    }
    window.grant(acknowledge, maximum);
    true
}

#[cfg(test)]
mod tests {
    use micro_fabric::{BeginFrame, BufferPool, NetworkExtension, Signals, StreamHeader};

    use super::*;
    use crate::codec::h2::FRAME_HEADER_LEN;

    fn core() -> Http2Core {
        let context = Context::new(1, BufferPool::new(65_536, 8), Signals::manual());
        let begin = BeginFrame { header: StreamHeader { stream_id: 1, ..Default::default() }, affinity: 0, extension: NetworkExtension::Empty };
        let network = NetworkStream::accept(&begin, context.pool.clone());
        Http2Core::new(network, Http2Decoder::server(16_384), &HttpConfig::default(), &context)
    }

    #[test]
    fn test_queue_priority() {
        let mut queue = EncodeQueue::default();
        queue.push(FrameClass::Data, Bytes::from_static(b"dddd"));
        queue.push(FrameClass::Headers, Bytes::from_static(b"hh"));
        queue.push(FrameClass::Control, Bytes::from_static(b"c"));

        assert_eq!(queue.take(2).unwrap(), "ch");
        queue.push(FrameClass::Control, Bytes::from_static(b"C"));
        assert_eq!(queue.take(2).unwrap(), "hC", "partial entry completes first");
        assert_eq!(queue.take(10).unwrap(), "dddd");
        assert!(queue.take(10).is_none());
    }

    #[test]
    fn test_settings_ack_with_payload() {
        let mut core = core();
        let header = FrameHeader::new(FrameType::Settings, flags::ACK, 0, 6);
        assert_eq!(core.on_settings(&header, &[0; 6]).unwrap_err(), Http2Error::frame_size());
    }

    #[test]
    fn test_settings_on_stream() {
        let mut core = core();
        let header = FrameHeader::new(FrameType::Settings, 0, 1, 0);
        assert_eq!(core.on_settings(&header, &[]).unwrap_err(), Http2Error::protocol());
    }

    #[test]
    fn test_settings_ack_applies_pending() {
        let mut core = core();
        core.advertised.initial_window_size = 1000;
        core.start_server();

        let header = FrameHeader::new(FrameType::Settings, flags::ACK, 0, 0);
        let change = core.on_settings(&header, &[]).unwrap();
        assert_eq!(change, Some(SettingsChange::Acknowledged { initial_window_delta: 1000 - 65_535 }));
        assert_eq!(core.local.initial_window_size, 1000);
    }

    #[test]
    fn test_continuation_reassembly() {
        let mut core = core();
        let mut frames = BytesMut::new();
        write::headers(&mut frames, 1, &[0x82, 0x86, 0x84], true, 2);

        let mut decoded = None;
        let mut offset = 0;
        while offset < frames.len() {
            let header = FrameHeader::parse(&frames[offset..]).unwrap();
            let payload = &frames[offset + FRAME_HEADER_LEN..offset + header.frame_len()];
            decoded = core.on_header_fragment(&header, payload).unwrap();
            offset += header.frame_len();
        }

        let decoded = decoded.unwrap();
        assert!(decoded.end_stream);
        assert_eq!(decoded.headers.get(":path"), Some("/"));
    }

    #[test]
    fn test_frame_outgoing_respects_budgets() {
        let mut core = core();
        let mut stream = Http2Stream::new(1, Exchange::accept(3, 0, 0), &core.local, &core.remote);
        stream.remote_budget = 5;

        stream.queue_outgoing(Bytes::from_static(b"hello world"));
        stream.end_outgoing(HeaderList::new());
        assert!(!core.frame_outgoing(&mut stream));
        assert_eq!(stream.outgoing_len(), 6);
        assert_eq!(core.encoder.class_len(FrameClass::Data), FRAME_HEADER_LEN + 5);

        stream.remote_budget += 100;
        assert!(core.frame_outgoing(&mut stream));
        assert!(stream.outgoing_closed);
        assert_eq!(core.remote_shared_budget(), CONNECTION_WINDOW - 11);
    }

    #[test]
    fn test_frame_outgoing_claims_shared_budget() {
        let context = Context::new(1, BufferPool::new(65_536, 8), Signals::manual());
        let begin = BeginFrame { header: StreamHeader { stream_id: 1, ..Default::default() }, affinity: 0, extension: NetworkExtension::Empty };
        let network = NetworkStream::accept(&begin, context.pool.clone());
        let mut core = Http2Core::new(network, Http2Decoder::server(16_384), &HttpConfig::default(), &context);
        core.on_connection_window(1000).unwrap();
        assert_eq!(context.creditor.available(core.budget_id), CONNECTION_WINDOW + 1000);

        let mut stream = Http2Stream::new(1, Exchange::accept(3, 0, 0), &core.local, &core.remote);
        stream.queue_outgoing(Bytes::from(vec![b'x'; 500]));
        assert!(!core.frame_outgoing(&mut stream));

        assert_eq!(context.creditor.available(core.budget_id), CONNECTION_WINDOW + 500);
        assert_eq!(core.encoder.class_len(FrameClass::Data), FRAME_HEADER_LEN + 500);
    }

    #[test]
    fn test_frame_outgoing_stops_at_shared_budget() {
        let context = Context::new(1, BufferPool::new(65_536, 8), Signals::manual());
        let begin = BeginFrame { header: StreamHeader { stream_id: 1, ..Default::default() }, affinity: 0, extension: NetworkExtension::Empty };
        let network = NetworkStream::accept(&begin, context.pool.clone());
        let mut core = Http2Core::new(network, Http2Decoder::server(16_384), &HttpConfig::default(), &context);
        assert_eq!(context.creditor.debitor().claim(core.budget_id, 1, CONNECTION_WINDOW - 4), CONNECTION_WINDOW - 4);

        let mut stream = Http2Stream::new(1, Exchange::accept(3, 0, 0), &core.local, &core.remote);
        stream.queue_outgoing(Bytes::from_static(b"hello"));
        assert!(!core.frame_outgoing(&mut stream));
        assert_eq!(stream.outgoing_len(), 1);
        assert_eq!(core.remote_shared_budget(), 0);

        core.on_connection_window(10).unwrap();
        assert!(!core.frame_outgoing(&mut stream));
        assert_eq!(stream.outgoing_len(), 0);
        assert_eq!(core.remote_shared_budget(), 9);
    }

    #[test]
    fn test_grant_outgoing_tracks_remote_budget() {
        let mut window = Window::default();
        assert!(grant_outgoing(&mut window, 100, 0, 1000));
        assert_eq!((window.acknowledge, window.maximum), (0, 100));

        window.sequence = 100;
        assert!(!grant_outgoing(&mut window, 100, 100, 1000));

        assert!(grant_outgoing(&mut window, 300, 0, 1000));
        assert_eq!(window.available(), 300);
        assert!(window.is_valid());
    }

    #[test]
    fn test_negative_stream_budget_is_kept() {
        let core = core();
        let mut stream = Http2Stream::new(1, Exchange::accept(3, 0, 0), &core.local, &core.remote);
        stream.remote_budget -= 70_000;
        assert!(stream.remote_budget < 0);

        let mut window = Window::default();
        grant_outgoing(&mut window, stream.remote_budget, 0, 1000);
        assert_eq!(window.available(), 0);
    }
}
