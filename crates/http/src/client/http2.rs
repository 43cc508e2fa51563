//! HTTP/2 client connection, started with prior knowledge.
//!
//! Requests become odd numbered streams on one [`Http2Core`], sharing its
//! codec, HPACK tables and flow control with the server side. Outgoing
//! request bodies are framed within the peer's windows. Incoming response
//! DATA is debited when a frame starts and credited back as the application
//! acknowledges it.
//!
//! Pushed responses are kept until a request for the same method, authority
//! and path claims them. Their body is buffered in a pooled slot meanwhile.

use std::collections::HashMap;

use bytes::Bytes;
use micro_fabric::{Context, DataFrame, Frame, NetworkExtension, Outbox, Slot, StreamIds, WindowFrame, flags};
use tracing::{debug, trace, warn};

use crate::binding::HttpBinding;
use crate::client::queue::QueuedRequest;
use crate::codec::h2::{
    DEFAULT_MAX_FRAME_SIZE, FrameHeader, FrameType, Http2Decoder, Http2Sink, MAX_WINDOW_SIZE, parse_rst_stream,
    parse_window_update,
};
use crate::connection::h2::{CONNECTION_HEADERS, DecodedHeaders, Http2Core, Http2Stream, SettingsChange, grant_outgoing};
use crate::connection::{NetworkStream, StreamEvents};
use crate::exchange::{Exchange, ExchangeState};
use crate::protocol::{HeaderList, Http2Error, Http2ErrorCode, HttpExtension};

const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// A response the server pushed ahead of any request for it.
#[derive(Debug)]
struct PushPromise {
    request: HeaderList,
    response: Option<HeaderList>,
    body: Option<Slot>,
    ended: bool,
}

impl PushPromise {
    fn matches(&self, headers: &HeaderList) -> bool {
        [":method", ":authority", ":path"].iter().all(|name| self.request.get(name) == headers.get(name))
    }
}

#[derive(Debug)]
struct ClientStream {
    stream: Http2Stream,
    /// Response bytes of a claimed push, delivered before anything else.
    buffered: Option<Slot>,
    response_begun: bool,
}

#[derive(Debug)]
pub struct Http2Client {
    binding: HttpBinding,
    context: Context,
    pub(crate) core: Http2Core,
    streams: HashMap<u32, ClientStream>,
    /// Application request id to HTTP/2 stream id.
    requests: HashMap<u64, u32>,
    promises: HashMap<u32, PushPromise>,
    pub(crate) app: Outbox<HttpExtension>,
    pub(crate) events: StreamEvents,
    pub route_id: u64,
    connected: bool,
    next_stream_id: u32,
    max_promised_id: u32,
    data_delivered: u32,
    trace_id: u64,
    closing: bool,
}

impl Http2Client {
    pub fn new(binding: HttpBinding, context: Context, network: NetworkStream, route_id: u64) -> Self {
        let decoder = Http2Decoder::client(DEFAULT_MAX_FRAME_SIZE);
        let mut core = Http2Core::new(network, decoder, binding.config(), &context);
        core.start_client();
        Self {
            binding,
            context,
            core,
            streams: HashMap::new(),
            requests: HashMap::new(),
            promises: HashMap::new(),
            app: Outbox::new(),
            events: StreamEvents::default(),
            route_id,
            connected: false,
            next_stream_id: 1,
            max_promised_id: 0,
            data_delivered: 0,
            trace_id: 0,
            closing: false,
        }
    }

    /// Ready for another request right now.
    pub fn is_idle(&self) -> bool {
        self.connected && self.is_available()
    }

    /// Accepts another stream, possibly before the network replied.
    pub fn is_available(&self) -> bool {
        !self.closing
            && !self.core.goaway_received
            && self.next_stream_id <= MAX_STREAM_ID
            && self.streams.len() < self.core.remote.max_concurrent_streams as usize
    }

    pub fn is_closed(&self) -> bool {
        self.streams.is_empty() && (self.core.network.is_closed() || (self.closing && self.core.network.is_outbound_closed()))
    }

    pub fn on_network(&mut self, frame: Frame<NetworkExtension>) {
        self.trace_id = frame.header().trace_id;
        match frame {
            Frame::Begin(begin) => {
                self.core.network.on_reply_begin(&begin);
                self.connected = true;
                debug!(stream_id = self.core.network.outbound_id, route_id = self.route_id, "http/2 client connected");
            }
            Frame::Data(data) => {
                if let Err(error) = self.core.network.receive(&data) {
                    warn!(%error, "http/2 client network window violated");
                    self.abandon();
                } else {
                    self.decode(&data.payload);
                }
            }
            Frame::Window(window) => {
                if let Err(error) = self.core.network.on_window(&window) {
                    warn!(%error, "http/2 client network window regressed");
                    self.abandon();
                }
            }
            Frame::End(_) => {
                self.core.network.on_end();
                self.closing = true;
                self.drop_all();
            }
            Frame::Abort(_) | Frame::Reset(_) => self.abandon(),
            frame => trace!(frame = frame.name(), "http/2 client network frame ignored"),
        }
        self.pump_all();
        self.flush();
    }

    /// Opens a stream for `request`, or hands it a matching pushed response.
    pub fn start(&mut self, request: QueuedRequest) {
        self.trace_id = request.trace_id;
        let claimed = self.promises.iter().find(|(_, promise)| promise.matches(&request.headers)).map(|(id, _)| *id);
        match claimed {
            Some(promised_id) => self.claim(promised_id, request),
            None => self.open(request),
        }
        self.flush();
    }

    fn open(&mut self, request: QueuedRequest) {
        let QueuedRequest { request_id, trace_id, authorization, ended, headers, .. } = request;
        let mut exchange = Exchange::accept(request_id, authorization, trace_id);
        exchange.request_state = ExchangeState::Open;

        let headers = request_headers(&headers);
        if headers.encoded_len() > self.core.remote.max_header_list_size as usize {
            debug!(stream_id = request_id, "http/2 client request headers exceed the peer limit");
            let response: HeaderList = [(":status", "431")].into_iter().collect();
            self.app.begin(exchange.response_header(), 0, HttpExtension::Headers(response));
            self.app.end(exchange.response_header(), HttpExtension::Empty);
            if !ended {
                self.app.reset(exchange.request_header(), HttpExtension::Empty);
            }
            return;
        }

        let id = self.next_stream_id;
        self.next_stream_id += 2;
        debug!(stream_id = id, request_id, "http/2 client request");
        self.core.encode_headers(id, &headers, ended);

        let mut stream = Http2Stream::new(id, exchange, &self.core.local, &self.core.remote);
        if ended {
            stream.outgoing_closed = true;
            stream.exchange.close_request();
        }
        self.events.opened.push(request_id);
        self.requests.insert(request_id, id);
        self.streams.insert(id, ClientStream { stream, buffered: None, response_begun: false });
        self.pump(id);
    }

    fn claim(&mut self, promised_id: u32, request: QueuedRequest) {
        let Some(promise) = self.promises.remove(&promised_id) else {
            return;
        };
        let mut exchange = Exchange::accept(request.request_id, request.authorization, request.trace_id);
        debug!(stream_id = promised_id, request_id = request.request_id, "http/2 client push claimed");

        if !request.ended {
            self.app.reset(exchange.request_header(), HttpExtension::Empty);
        }
        exchange.close_request();

        let mut stream = Http2Stream::new(promised_id, exchange, &self.core.local, &self.core.remote);
        stream.outgoing_closed = true;
        if promise.ended {
            stream.incoming_closed = true;
            stream.deferred_end = Some(HeaderList::new());
        }

        let response_begun = promise.response.is_some();
        if let Some(response) = promise.response {
            self.app.begin(stream.exchange.response_header(), self.core.network.affinity, HttpExtension::Headers(response));
        }
        self.events.opened.push(request.request_id);
        self.requests.insert(request.request_id, promised_id);
        self.streams.insert(promised_id, ClientStream { stream, buffered: promise.body, response_begun });
    }

    pub fn on_application(&mut self, frame: Frame<HttpExtension>) {
        self.trace_id = frame.header().trace_id;

        let app_id = frame.stream_id();
        let request_id = if StreamIds::is_initial(app_id) { app_id } else { app_id ^ 1 };
        let Some(&id) = self.requests.get(&request_id) else {
            debug!(stream_id = app_id, frame = frame.name(), "http/2 client no such exchange");
            return;
        };

        if frame.is_throttle() == (app_id == request_id) {
            trace!(stream_id = app_id, frame = frame.name(), "http/2 client application frame ignored");
            return;
        }

        match frame {
            Frame::Data(data) => self.on_request_data(id, data),
            Frame::End(end) => {
                if let Some(entry) = self.streams.get_mut(&id) {
                    entry.stream.end_outgoing(end.extension.into_headers());
                    self.pump(id);
                }
            }
            Frame::Abort(_) => {
                self.core.reset_stream(id, Http2ErrorCode::Cancel);
                self.drop_stream(id);
            }
            Frame::Window(window) => self.on_response_window(id, &window),
            Frame::Reset(_) => {
                self.core.reset_stream(id, Http2ErrorCode::Cancel);
                self.drop_stream(id);
            }
            frame => trace!(stream_id = app_id, frame = frame.name(), "http/2 client application frame ignored"),
        }
        self.flush();
    }

    fn on_request_data(&mut self, id: u32, data: DataFrame<HttpExtension>) {
        let Some(entry) = self.streams.get_mut(&id) else {
            return;
        };
        if entry.stream.exchange.request.receive(data.header.sequence, data.reserved).is_err() {
            warn!(stream_id = id, "http/2 client request window violated");
            self.core.reset_stream(id, Http2ErrorCode::InternalError);
            self.drop_stream(id);
            return;
        }
        entry.stream.queue_outgoing(data.payload);
        self.pump(id);
    }

    fn on_response_window(&mut self, id: u32, window: &WindowFrame) {
        let Some(entry) = self.streams.get_mut(&id) else {
            return;
        };
        let stream = &mut entry.stream;

        let acknowledged = stream.exchange.response.acknowledge;
        let header = &window.header;
        if stream.exchange.response.observe(header.acknowledge, header.maximum, window.padding).is_err() {
            warn!(stream_id = id, "http/2 client response window regressed");
            self.core.reset_stream(id, Http2ErrorCode::InternalError);
            self.drop_stream(id);
            return;
        }
        if stream.exchange.response_state == ExchangeState::Pending {
            stream.exchange.response_state = ExchangeState::Open;
        }

        let credit = u32::try_from(stream.exchange.response.acknowledge - acknowledged).unwrap_or(u32::MAX);
        if credit > 0 && entry.buffered.is_none() {
            stream.local_budget += i64::from(credit);
            let stream_id = (!stream.incoming_closed).then_some(id);
            self.core.credit_peer(stream_id, credit);
        }

        self.deliver_buffered(id);
        self.decode_buffered();
    }

    /// Hands buffered push bytes to the application, then a held back end.
    fn deliver_buffered(&mut self, id: u32) {
        let Some(entry) = self.streams.get_mut(&id) else {
            return;
        };
        if entry.stream.exchange.response_state != ExchangeState::Open {
            return;
        }

        if let Some(slot) = &mut entry.buffered {
            let window = &mut entry.stream.exchange.response;
            let length = window.writable().min(slot.len());
            if length > 0 {
                let reserved = length as u32 + window.padding;
                let header = entry.stream.exchange.response_header();
                let payload = Bytes::copy_from_slice(&slot.as_slice()[..length]);
                self.app.data(header, flags::COMPLETE, 0, reserved, payload, HttpExtension::Empty);
                entry.stream.exchange.response.advance(reserved);
                slot.consume(length);
            }
            if slot.is_empty() {
                entry.buffered = None;
            }
        }

        if entry.buffered.is_none() {
            if let Some(trailers) = entry.stream.deferred_end.take() {
                self.end_response(id, trailers);
            }
        }
    }

    fn decode(&mut self, payload: &[u8]) {
        let mut decoder = self.core.decoder;
        match self.core.network.take_decode_slot() {
            Some(mut slot) => {
                if slot.try_put(payload).is_err() {
                    warn!(stream_id = self.core.network.inbound_id, "http/2 client decode slot overflow");
                    self.core.decoder = decoder;
                    self.fail(Http2ErrorCode::EnhanceYourCalm);
                    return;
                }
                let consumed = decoder.decode(self, slot.as_slice());
                slot.consume(consumed);
                self.core.network.restore_decode_slot(slot);
            }
            None => {
                let consumed = decoder.decode(self, payload);
                if let Err(error) = self.core.network.buffer_input(&payload[consumed..]) {
                    warn!(%error, "http/2 client decode slot unavailable");
                    self.core.decoder = decoder;
                    self.fail(Http2ErrorCode::InternalError);
                    return;
                }
            }
        }
        self.core.decoder = decoder;
        if self.closing && self.core.goaway_sent {
            self.core.decoder.ignore_all();
        }
        self.core.network.grant_inbound(self.trace_id);
    }

    fn decode_buffered(&mut self) {
        if self.core.network.buffered_input() > 0 {
            self.decode(&[]);
        }
    }

    fn flush(&mut self) {
        self.core.flush(self.trace_id);
        if self.closing
            && self.streams.is_empty()
            && self.core.encoder.is_empty()
            && self.core.network.buffered_output() == 0
        {
            self.core.network.end(self.trace_id);
        }
    }

    fn is_idle_stream(&self, stream_id: u32) -> bool {
        if stream_id % 2 == 1 { stream_id >= self.next_stream_id } else { stream_id > self.max_promised_id }
    }

    fn on_settings(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        match self.core.on_settings(header, payload)? {
            Some(SettingsChange::Acknowledged { initial_window_delta }) => {
                for entry in self.streams.values_mut() {
                    entry.stream.local_budget += initial_window_delta;
                }
            }
            Some(SettingsChange::Updated { initial_window_delta }) => {
                for entry in self.streams.values_mut() {
                    entry.stream.remote_budget += initial_window_delta;
                    if entry.stream.remote_budget > MAX_WINDOW_SIZE {
                        return Err(Http2Error::flow_control());
                    }
                }
                self.pump_all();
            }
            None => {}
        }
        Ok(())
    }

    fn on_goaway(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        let goaway = self.core.on_goaway(header, payload)?;
        self.closing = true;

        let refused: Vec<u32> =
            self.streams.keys().copied().filter(|id| id % 2 == 1 && *id > goaway.last_stream_id).collect();
        for id in refused {
            self.drop_stream(id);
        }
        Ok(())
    }

    fn on_window_update(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        let increment = parse_window_update(payload).ok_or_else(Http2Error::frame_size)?;
        let id = header.stream_id;
        if id == 0 {
            self.core.on_connection_window(increment)?;
            self.pump_all();
            return Ok(());
        }

        if increment == 0 {
            return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
        }
        let Some(entry) = self.streams.get_mut(&id) else {
            return if self.is_idle_stream(id) { Err(Http2Error::protocol()) } else { Ok(()) };
        };

        entry.stream.remote_budget += i64::from(increment);
        if entry.stream.remote_budget > MAX_WINDOW_SIZE {
            return Err(Http2Error::stream(id, Http2ErrorCode::FlowControlError));
        }
        self.pump(id);
        Ok(())
    }

    fn on_rst_stream(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        let id = header.stream_id;
        if id == 0 {
            return Err(Http2Error::protocol());
        }
        let code = parse_rst_stream(payload).ok_or_else(Http2Error::frame_size)?;
        if self.is_idle_stream(id) {
            return Err(Http2Error::protocol());
        }

        debug!(stream_id = id, ?code, "http/2 client stream reset by peer");
        self.promises.remove(&id);
        if let Some(entry) = self.streams.get_mut(&id) {
            entry.stream.incoming_closed = true;
            entry.stream.outgoing_closed = true;
            entry.stream.clear_outgoing();
        }
        self.drop_stream(id);
        Ok(())
    }

    fn on_headers(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if header.frame_type == FrameType::PushPromise && !self.binding.config().enable_push {
            return Err(Http2Error::protocol());
        }
        match self.core.on_header_fragment(header, payload)? {
            Some(decoded) if decoded.promised_id.is_some() => self.on_push_promise(decoded),
            Some(decoded) => self.on_response_headers(decoded),
            None => Ok(()),
        }
    }

    fn on_push_promise(&mut self, decoded: DecodedHeaders) -> Result<(), Http2Error> {
        let parent = decoded.stream_id;
        let promised_id = decoded.promised_id.unwrap_or_default();
        if !self.streams.get(&parent).is_some_and(|entry| !entry.stream.incoming_closed) {
            return Err(Http2Error::protocol());
        }
        if promised_id % 2 != 0 || promised_id <= self.max_promised_id {
            return Err(Http2Error::protocol());
        }
        self.max_promised_id = promised_id;

        let request = decoded.headers;
        if request.get(":method").is_none() || request.get(":path").is_none() {
            return Err(Http2Error::stream(promised_id, Http2ErrorCode::ProtocolError));
        }
        if self.promises.len() >= self.binding.config().max_push_promise_list_size {
            return Err(Http2Error::stream(promised_id, Http2ErrorCode::RefusedStream));
        }

        debug!(stream_id = parent, promised_id, path = request.get(":path"), "http/2 client push promise");
        self.promises.insert(promised_id, PushPromise { request, response: None, body: None, ended: false });
        Ok(())
    }

    fn on_response_headers(&mut self, decoded: DecodedHeaders) -> Result<(), Http2Error> {
        let id = decoded.stream_id;
        if let Some(promise) = self.promises.get_mut(&id) {
            if promise.response.is_some() {
                promise.ended = decoded.end_stream;
                return Ok(());
            }
            if decoded.headers.status().is_none() {
                return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
            }
            promise.response = Some(decoded.headers);
            promise.ended = decoded.end_stream;
            return Ok(());
        }

        let Some(entry) = self.streams.get_mut(&id) else {
            return if self.is_idle_stream(id) {
                Err(Http2Error::protocol())
            } else {
                Err(Http2Error::stream(id, Http2ErrorCode::StreamClosed))
            };
        };
        if entry.stream.incoming_closed {
            return Err(Http2Error::stream(id, Http2ErrorCode::StreamClosed));
        }

        let headers = decoded.headers;
        if entry.response_begun {
            if !decoded.end_stream || headers.iter().any(|(name, _)| name.starts_with(':')) {
                return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
            }
            if !entry.stream.content_matches() {
                return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
            }
            self.end_response(id, headers);
            return Ok(());
        }

        let Some(status) = headers.status() else {
            return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
        };
        if (100..200).contains(&status) {
            if decoded.end_stream {
                return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
            }
            trace!(stream_id = id, status, "http/2 client interim response skipped");
            return Ok(());
        }

        entry.stream.content_length = match headers.get("content-length") {
            Some(value) => {
                Some(value.parse::<u64>().map_err(|_| Http2Error::stream(id, Http2ErrorCode::ProtocolError))?)
            }
            None => None,
        };

        debug!(stream_id = id, status, "http/2 client response");
        entry.response_begun = true;
        let header = entry.stream.exchange.response_header();
        self.app.begin(header, self.core.network.affinity, HttpExtension::Headers(headers));
        if decoded.end_stream {
            self.end_response(id, HeaderList::new());
        }
        Ok(())
    }

    /// Ends the response toward the application, or holds it until the window opens and buffered bytes drain.
    fn end_response(&mut self, id: u32, trailers: HeaderList) {
        let Some(entry) = self.streams.get_mut(&id) else {
            return;
        };
        entry.stream.incoming_closed = true;
        if entry.stream.exchange.response_state != ExchangeState::Open || entry.buffered.is_some() {
            entry.stream.deferred_end = Some(trailers);
            return;
        }

        let extension = if trailers.is_empty() { HttpExtension::Empty } else { HttpExtension::Headers(trailers) };
        self.app.end(entry.stream.exchange.response_header(), extension);
        entry.stream.exchange.close_response();
        self.finish(id);
    }

    /// Frames queued request data and re-offers the application a window.
    fn pump(&mut self, id: u32) {
        let capacity = self.core.encode_limit();
        let Some(entry) = self.streams.get_mut(&id) else {
            return;
        };
        let stream = &mut entry.stream;
        if stream.exchange.is_request_closed() {
            return;
        }

        let ended = self.core.frame_outgoing(stream);
        if ended {
            stream.exchange.close_request();
            self.finish(id);
            return;
        }

        let queued = stream.outgoing_len();
        if grant_outgoing(&mut stream.exchange.request, stream.remote_budget, queued, capacity) {
            self.app.window(stream.exchange.request_header(), self.core.budget_id, 0);
        }
    }

    fn pump_all(&mut self) {
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            self.pump(id);
        }
    }

    fn finish(&mut self, id: u32) {
        if self.streams.get(&id).is_some_and(|entry| entry.stream.exchange.is_finished()) {
            if let Some(entry) = self.streams.remove(&id) {
                debug!(stream_id = id, "http/2 client exchange finished");
                self.release(entry.stream);
            }
        }
    }

    /// Removes stream `id`, closing whatever the application still has open.
    fn drop_stream(&mut self, id: u32) {
        let Some(entry) = self.streams.remove(&id) else {
            return;
        };
        let exchange = &entry.stream.exchange;
        if !exchange.is_request_closed() {
            self.app.reset(exchange.request_header(), HttpExtension::Empty);
        }
        if !exchange.is_response_closed() {
            self.app.abort(exchange.response_header());
        }
        self.release(entry.stream);
    }

    fn release(&mut self, stream: Http2Stream) {
        let unacknowledged = stream.exchange.response.pending();
        if unacknowledged > 0 && !self.closing {
            self.core.credit_peer(None, u32::try_from(unacknowledged).unwrap_or(u32::MAX));
        }
        self.requests.remove(&stream.exchange.request_id);
        self.events.closed.push(stream.exchange.request_id);
    }

    fn drop_all(&mut self) {
        self.promises.clear();
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            self.drop_stream(id);
        }
    }

    /// Sends GOAWAY and tears down every stream.
    fn fail(&mut self, code: Http2ErrorCode) {
        self.core.goaway(self.max_promised_id, code);
        self.closing = true;
        self.core.decoder.ignore_all();
        self.drop_all();
    }

    /// The network is gone, nothing more can be written.
    fn abandon(&mut self) {
        self.closing = true;
        self.core.decoder.ignore_all();
        self.drop_all();
        self.core.network.close(self.trace_id);
    }

    /// Buffers DATA of an unclaimed push, refusing it once the slot is full.
    fn buffer_promise(&mut self, id: u32, payload: &[u8]) {
        let pool = self.context.pool.clone();
        let Some(promise) = self.promises.get_mut(&id) else {
            return;
        };
        let stored = match &mut promise.body {
            Some(slot) => slot.try_put(payload).is_ok(),
            None => match pool.acquire(u64::from(id)) {
                Some(mut slot) => {
                    let stored = slot.try_put(payload).is_ok();
                    promise.body = Some(slot);
                    stored
                }
                None => false,
            },
        };
        if !stored {
            debug!(stream_id = id, "http/2 client pushed response too large");
            self.promises.remove(&id);
            self.core.reset_stream(id, Http2ErrorCode::Cancel);
        }
    }
}

impl Http2Sink for Http2Client {
    fn on_frame(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        match header.frame_type {
            FrameType::Settings => self.on_settings(header, payload),
            FrameType::Ping => self.core.on_ping(header, payload),
            FrameType::Goaway => self.on_goaway(header, payload),
            FrameType::WindowUpdate => self.on_window_update(header, payload),
            FrameType::Headers | FrameType::Continuation | FrameType::PushPromise => self.on_headers(header, payload),
            FrameType::RstStream => self.on_rst_stream(header, payload),
            FrameType::Priority | FrameType::Data | FrameType::Unknown(_) => Ok(()),
        }
    }

    fn on_data_begin(&mut self, header: &FrameHeader) -> Result<bool, Http2Error> {
        let id = header.stream_id;
        self.core.debit_data(header)?;
        self.data_delivered = 0;

        if self.promises.contains_key(&id) {
            return Ok(true);
        }

        let Some(entry) = self.streams.get_mut(&id).filter(|entry| !entry.stream.incoming_closed) else {
            self.core.credit_peer(None, header.length);
            if self.is_idle_stream(id) {
                return Err(Http2Error::protocol());
            }
            return Err(Http2Error::stream(id, Http2ErrorCode::StreamClosed));
        };
        if !entry.response_begun {
            self.core.credit_peer(None, header.length);
            return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
        }

        entry.stream.local_budget -= i64::from(header.length);
        if entry.stream.local_budget < 0 {
            self.core.credit_peer(None, header.length);
            return Err(Http2Error::stream(id, Http2ErrorCode::FlowControlError));
        }
        Ok(true)
    }

    fn on_data(&mut self, stream_id: u32, payload: &[u8]) -> usize {
        if self.promises.contains_key(&stream_id) {
            self.buffer_promise(stream_id, payload);
            return payload.len();
        }

        if self.streams.get(&stream_id).is_some_and(|entry| entry.buffered.is_some()) {
            self.deliver_buffered(stream_id);
        }
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            return payload.len();
        };
        if entry.stream.exchange.is_response_closed() {
            return payload.len();
        }
        if entry.buffered.is_some() {
            return 0;
        }

        let window = &mut entry.stream.exchange.response;
        let length = window.writable().min(payload.len());
        if length == 0 {
            return 0;
        }

        let reserved = length as u32 + window.padding;
        let header = entry.stream.exchange.response_header();
        self.app.data(header, flags::COMPLETE, 0, reserved, Bytes::copy_from_slice(&payload[..length]), HttpExtension::Empty);
        entry.stream.exchange.response.advance(reserved);
        entry.stream.content_received += length as u64;
        self.data_delivered += length as u32;
        length
    }

    fn on_data_end(&mut self, header: &FrameHeader) -> Result<(), Http2Error> {
        let id = header.stream_id;
        let undelivered = header.length.saturating_sub(self.data_delivered);
        self.data_delivered = 0;
        let end_stream = header.is_end_stream();

        if let Some(promise) = self.promises.get_mut(&id) {
            promise.ended = end_stream;
            self.core.credit_peer((!end_stream).then_some(id), undelivered);
            return Ok(());
        }

        let Some(entry) = self.streams.get_mut(&id) else {
            self.core.credit_peer(None, undelivered);
            return Ok(());
        };

        entry.stream.local_budget += i64::from(undelivered);
        self.core.credit_peer((!end_stream).then_some(id), undelivered);

        if entry.stream.content_length.is_some_and(|length| entry.stream.content_received > length) {
            return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
        }
        if end_stream {
            if !entry.stream.content_matches() {
                return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
            }
            self.end_response(id, HeaderList::new());
        }
        Ok(())
    }

    fn on_stream_error(&mut self, stream_id: u32, code: Http2ErrorCode) {
        self.promises.remove(&stream_id);
        if let Some(entry) = self.streams.get_mut(&stream_id) {
            entry.stream.clear_outgoing();
            entry.stream.outgoing_closed = true;
        }
        self.core.reset_stream(stream_id, code);
        self.drop_stream(stream_id);
    }

    fn on_connection_error(&mut self, code: Http2ErrorCode) {
        self.fail(code);
    }
}

/// Orders pseudo-headers first and drops fields HTTP/2 does not carry.
fn request_headers(source: &HeaderList) -> HeaderList {
    let mut headers = HeaderList::with_capacity(source.len() + 1);
    for name in [":method", ":scheme", ":authority", ":path"] {
        if let Some(value) = source.get(name) {
            headers.push(name, value);
        } else if name == ":authority" {
            if let Some(host) = source.get("host") {
                headers.push(name, host);
            }
        }
    }

    for (name, value) in source.iter() {
        let dropped = name.starts_with(':')
            || name == "host"
            || CONNECTION_HEADERS.contains(&name)
            || (name == "te" && value != "trailers");
        if !dropped {
            headers.push(name, value);
        }
    }
    headers
}
