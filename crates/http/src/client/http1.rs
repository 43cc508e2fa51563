//! HTTP/1.1 client connection.
//!
//! A connection carries one exchange at a time. Requests are written as soon
//! as they are attached, parked in the encode slot until the network window
//! opens. The response is decoded with the same decoder the server uses,
//! this side supplying the status line grammar.

use bytes::Bytes;
use micro_fabric::{DataFrame, Frame, NetworkExtension, Outbox, WindowFrame, flags};
use tracing::{debug, trace, warn};

use crate::binding::HttpBinding;
use crate::client::queue::QueuedRequest;
use crate::codec::h1::head::{HeaderLine, Lines, parse_header_line, parse_status_line};
use crate::codec::h1::{
    BodyMode, CHUNK_PADDING, Framing, HeadOutcome, Http1Decoder, Http1Sink, encode_chunk, encode_last_chunk,
    encode_request_head,
};
use crate::connection::{NetworkStream, StreamEvents};
use crate::exchange::{Exchange, ExchangeState};
use crate::protocol::{HeaderList, Http1Error, HttpExtension, status};
use crate::utils::{CRLF, ensure, index_of, is_connection_close};

const STATUS_PREFIX: &[u8] = b"HTTP/1.";

#[derive(Debug)]
struct ClientExchange {
    exchange: Exchange,
    framing: Framing,
    head_request: bool,
    upgrade: bool,
    response_mode: Option<BodyMode>,
    /// An interim `1xx` head was decoded, its empty body is not the response.
    interim: bool,
    deferred_end: Option<HeaderList>,
}

#[derive(Debug)]
pub struct Http1Client {
    binding: HttpBinding,
    pub(crate) network: NetworkStream,
    decoder: Http1Decoder,
    active: Option<Box<ClientExchange>>,
    pub(crate) app: Outbox<HttpExtension>,
    pub(crate) events: StreamEvents,
    pub route_id: u64,
    connected: bool,
    trace_id: u64,
    closing: bool,
}

impl Http1Client {
    pub fn new(binding: HttpBinding, network: NetworkStream, route_id: u64) -> Self {
        let decoder = Http1Decoder::new(binding.config().head_limit(network.pool().slot_capacity()));
        Self {
            binding,
            network,
            decoder,
            active: None,
            app: Outbox::new(),
            events: StreamEvents::default(),
            route_id,
            connected: false,
            trace_id: 0,
            closing: false,
        }
    }

    /// Ready for the next request.
    pub fn is_idle(&self) -> bool {
        self.connected && self.active.is_none() && !self.closing && !self.network.is_ending()
    }

    /// Accepts a request before the network replied, it is written once the window opens.
    pub fn is_available(&self) -> bool {
        self.active.is_none() && !self.closing && !self.network.is_ending()
    }

    pub fn is_closed(&self) -> bool {
        self.active.is_none() && (self.network.is_closed() || (self.closing && self.network.is_outbound_closed()))
    }

    pub fn on_network(&mut self, frame: Frame<NetworkExtension>) {
        self.trace_id = frame.header().trace_id;
        match frame {
            Frame::Begin(begin) => {
                self.network.on_reply_begin(&begin);
                self.connected = true;
                debug!(stream_id = self.network.outbound_id, route_id = self.route_id, "http/1.1 client connected");
            }
            Frame::Data(data) => {
                if let Err(error) = self.network.receive(&data) {
                    warn!(%error, "http/1.1 client network window violated");
                    self.cleanup();
                    return;
                }
                self.decode(&data.payload);
            }
            Frame::Window(window) => {
                if let Err(error) = self.network.on_window(&window) {
                    warn!(%error, "http/1.1 client network window regressed");
                    self.cleanup();
                    return;
                }
                self.network.flush(self.trace_id);
                self.grant_request();
            }
            Frame::End(_) => self.on_network_end(),
            Frame::Abort(_) | Frame::Reset(_) => {
                self.abort_exchange();
                self.cleanup();
            }
            frame => trace!(frame = frame.name(), "http/1.1 client network frame ignored"),
        }
    }

    fn on_network_end(&mut self) {
        self.network.on_end();
        self.closing = true;

        let until_close = matches!(&self.active, Some(active) if active.response_mode == Some(BodyMode::Upgraded));
        if until_close {
            self.end_response(HeaderList::new());
        }
        if self.active.is_some() {
            self.abort_exchange();
        }
        self.network.end(self.trace_id);
    }

    fn decode(&mut self, payload: &[u8]) {
        let mut decoder = self.decoder;
        match self.network.take_decode_slot() {
            Some(mut slot) => {
                if slot.try_put(payload).is_err() {
                    warn!(stream_id = self.network.inbound_id, "http/1.1 client decode slot overflow");
                    self.decoder = decoder;
                    self.abort_exchange();
                    self.cleanup();
                    return;
                }
                let consumed = decoder.decode(self, slot.as_slice());
                slot.consume(consumed);
                self.network.restore_decode_slot(slot);
            }
            None => {
                let consumed = decoder.decode(self, payload);
                if let Err(error) = self.network.buffer_input(&payload[consumed..]) {
                    warn!(%error, "http/1.1 client decode slot unavailable");
                    self.decoder = decoder;
                    self.abort_exchange();
                    self.cleanup();
                    return;
                }
            }
        }
        self.decoder = decoder;
        if self.closing && self.active.is_none() {
            self.decoder.ignore();
        }
        self.network.grant_inbound(self.trace_id);
    }

    fn decode_buffered(&mut self) {
        if self.network.buffered_input() > 0 {
            self.decode(&[]);
        }
    }

    /// Writes the head of `request` and opens its body window.
    pub fn start(&mut self, request: QueuedRequest) {
        let QueuedRequest { request_id, trace_id, authorization, ended, mut headers, .. } = request;
        self.trace_id = trace_id;

        let upgrade = headers.contains("upgrade");
        if upgrade || headers.get("connection").is_some_and(is_connection_close) {
            self.closing = true;
        }

        let framing = match Framing::declared(&headers) {
            Some(framing) => framing,
            None if ended => Framing::Empty,
            None if upgrade => Framing::Close,
            None => {
                headers.set("transfer-encoding", "chunked");
                Framing::Chunked
            }
        };

        let mut exchange = Exchange::accept(request_id, authorization, trace_id);
        exchange.request_state = ExchangeState::Open;
        self.events.opened.push(request_id);

        let mut head = Vec::with_capacity(256);
        encode_request_head(&mut head, &headers);
        debug!(stream_id = request_id, framing = ?framing, "http/1.1 client request");

        self.active = Some(Box::new(ClientExchange {
            exchange,
            framing,
            head_request: headers.get(":method") == Some("HEAD"),
            upgrade,
            response_mode: None,
            interim: false,
            deferred_end: None,
        }));

        if head.len() > self.binding.config().maximum_headers_size {
            warn!(len = head.len(), "http/1.1 client request headers exceed the encode limit");
            self.reject(431);
            return;
        }

        self.write(&head);
        if ended {
            self.end_request(HeaderList::new());
        } else {
            self.grant_request();
        }
    }

    pub fn on_application(&mut self, frame: Frame<HttpExtension>) {
        self.trace_id = frame.header().trace_id;

        let Some(active) = &self.active else {
            debug!(stream_id = frame.stream_id(), frame = frame.name(), "http/1.1 client no active exchange");
            return;
        };
        let request_id = active.exchange.request_id;
        let response_id = active.exchange.response_id;

        match frame {
            Frame::Data(data) if data.header.stream_id == request_id => self.on_request_data(&data),
            Frame::End(end) if end.header.stream_id == request_id => self.end_request(end.extension.into_headers()),
            Frame::Abort(_) => {
                self.abort_exchange();
                self.cleanup();
            }
            Frame::Window(window) if window.header.stream_id == response_id => self.on_response_window(&window),
            Frame::Reset(_) => {
                if let Some(active) = &mut self.active {
                    active.exchange.close_response();
                }
                self.abort_exchange();
                self.cleanup();
            }
            frame => trace!(stream_id = frame.stream_id(), frame = frame.name(), "http/1.1 client application frame ignored"),
        }
    }

    fn on_request_data(&mut self, data: &DataFrame<HttpExtension>) {
        let Some(active) = &mut self.active else {
            return;
        };

        if active.exchange.request.receive(data.header.sequence, data.reserved).is_err() {
            warn!(stream_id = data.header.stream_id, "http/1.1 client request window violated");
            self.abort_exchange();
            self.cleanup();
            return;
        }

        match active.framing {
            Framing::Chunked => {
                let mut chunk = Vec::with_capacity(data.payload.len() + CHUNK_PADDING as usize);
                encode_chunk(&mut chunk, &data.payload);
                self.write(&chunk);
            }
            Framing::Empty => {}
            Framing::Content(_) | Framing::Close => self.write(&data.payload),
        }
        self.grant_request();
    }

    fn end_request(&mut self, trailers: HeaderList) {
        let Some(active) = &mut self.active else {
            return;
        };
        if active.exchange.is_request_closed() {
            return;
        }

        let framing = active.framing;
        active.exchange.close_request();
        if framing.is_chunked() {
            let mut last = Vec::new();
            encode_last_chunk(&mut last, &trailers);
            self.write(&last);
        }
        self.finish();
    }

    fn on_response_window(&mut self, window: &WindowFrame) {
        let Some(active) = &mut self.active else {
            return;
        };

        let header = &window.header;
        if active.exchange.response.observe(header.acknowledge, header.maximum, window.padding).is_err() {
            warn!(stream_id = header.stream_id, "http/1.1 client response window regressed");
            self.abort_exchange();
            self.cleanup();
            return;
        }

        if active.exchange.response_state == ExchangeState::Pending {
            active.exchange.response_state = ExchangeState::Open;
            if let Some(trailers) = active.deferred_end.take() {
                self.end_response(trailers);
            }
        }
        self.decode_buffered();
    }

    /// Offers the application a request window sized to what the network can still absorb.
    fn grant_request(&mut self) {
        let capacity = self.network.pool().slot_capacity();
        let unacknowledged = self.network.outbound.pending() as usize + self.network.buffered_output();

        let Some(active) = &mut self.active else {
            return;
        };
        if active.exchange.request_state != ExchangeState::Open {
            return;
        }

        let window = &mut active.exchange.request;
        let maximum = u32::try_from(capacity).unwrap_or(u32::MAX);
        let credit = capacity.saturating_sub(unacknowledged) as u64;
        let acknowledge = (window.sequence + credit).saturating_sub(u64::from(maximum)).min(window.sequence);
        let acknowledge = acknowledge.max(window.acknowledge);
        let padding = if active.framing.is_chunked() { CHUNK_PADDING } else { 0 };

        if acknowledge > window.acknowledge || maximum > window.maximum || padding != window.padding {
            window.grant(acknowledge, maximum);
            window.padding = padding;
            let header = active.exchange.request_header();
            self.app.window(header, 0, padding);
        }
    }

    fn end_response(&mut self, trailers: HeaderList) {
        let Some(active) = &mut self.active else {
            return;
        };
        if active.exchange.is_response_closed() {
            return;
        }

        let header = active.exchange.response_header();
        let extension = if trailers.is_empty() { HttpExtension::Empty } else { HttpExtension::Headers(trailers) };
        self.app.end(header, extension);
        active.exchange.close_response();
        self.finish();
    }

    /// Drops the active exchange once both sides are closed.
    fn finish(&mut self) {
        if !self.active.as_ref().is_some_and(|active| active.exchange.is_finished()) {
            return;
        }

        if let Some(active) = self.active.take() {
            self.events.closed.push(active.exchange.request_id);
            debug!(stream_id = active.exchange.request_id, "http/1.1 client exchange finished");
        }
        if self.closing {
            self.network.end(self.trace_id);
        }
    }

    /// Answers the application without a network round trip and gives up the connection.
    fn reject(&mut self, status: u16) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        let headers: HeaderList = [(":status", status.to_string())].into_iter().collect();
        self.app.begin(active.exchange.response_header(), 0, HttpExtension::Headers(headers));
        self.app.end(active.exchange.response_header(), HttpExtension::Empty);
        if !active.exchange.is_request_closed() {
            self.app.reset(active.exchange.request_header(), HttpExtension::Empty);
        }
        active.exchange.close_request();
        active.exchange.close_response();
        self.events.closed.push(active.exchange.request_id);
        self.cleanup();
    }

    /// Tears down the application side of the active exchange.
    fn abort_exchange(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        if !active.exchange.is_response_closed() {
            self.app.abort(active.exchange.response_header());
        }
        if !active.exchange.is_request_closed() {
            self.app.reset(active.exchange.request_header(), HttpExtension::Empty);
        }
        self.events.closed.push(active.exchange.request_id);
    }

    fn write(&mut self, bytes: &[u8]) {
        if let Err(error) = self.network.write(self.trace_id, bytes) {
            warn!(%error, "http/1.1 client encode slot overflow");
            self.abort_exchange();
            self.cleanup();
        }
    }

    fn cleanup(&mut self) {
        self.closing = true;
        self.decoder.ignore();
        self.network.close(self.trace_id);
    }

    fn response_headers(head: &[u8], line_end: usize, status: u16) -> Result<(HeaderList, Response), Http1Error> {
        let mut headers = HeaderList::with_capacity(16);
        headers.push(":status", status.to_string());

        let mut response = Response::default();
        for (_, line) in Lines::new(head, line_end + CRLF.len()) {
            let (name, value) = match parse_header_line(line) {
                HeaderLine::Field { name, value } => (name.to_ascii_lowercase(), value),
                HeaderLine::Folded => return Err(Http1Error::ObsoleteLineFolding),
                HeaderLine::Invalid => return Err(Http1Error::BadRequest),
            };

            match name.as_str() {
                "content-length" => {
                    ensure!(response.framing.is_none(), Http1Error::BadRequest);
                    let length = value.parse::<u64>().map_err(|_| Http1Error::BadRequest)?;
                    response.framing = Some(BodyMode::Content(length));
                }
                "transfer-encoding" => {
                    ensure!(value.eq_ignore_ascii_case("chunked"), Http1Error::UnsupportedTransferEncoding);
                    response.framing = Some(BodyMode::Chunked);
                }
                "connection" if is_connection_close(value) => response.close = true,
                "upgrade" => response.upgrade = true,
                _ => {}
            }
            headers.push(name, value);
        }
        Ok((headers, response))
    }
}

#[derive(Debug, Default)]
struct Response {
    framing: Option<BodyMode>,
    close: bool,
    upgrade: bool,
}

impl Http1Sink for Http1Client {
    fn is_ready(&self) -> bool {
        self.active.as_ref().is_some_and(|active| active.response_mode.is_none())
    }

    fn on_partial_head(&mut self, head: &[u8]) -> Result<(), Http1Error> {
        let prefix = head.len().min(STATUS_PREFIX.len());
        ensure!(head[..prefix] == STATUS_PREFIX[..prefix], Http1Error::BadRequest);
        Ok(())
    }

    fn on_head(&mut self, head: &[u8]) -> Result<HeadOutcome, Http1Error> {
        let line_end = index_of(head, CRLF).ok_or(Http1Error::BadRequest)?;
        let line = parse_status_line(&head[..line_end]).ok_or(Http1Error::BadRequest)?;
        let status = line.status;
        let (headers, response) = Self::response_headers(head, line_end, status)?;

        let Some(active) = &mut self.active else {
            return Err(Http1Error::BadRequest);
        };

        if (100..200).contains(&status) && status != 101 {
            trace!(status, "http/1.1 client interim response skipped");
            active.interim = true;
            return Ok(HeadOutcome::Message(BodyMode::Empty));
        }

        let mode = if status == 101 && active.upgrade && response.upgrade {
            active.framing = Framing::Close;
            BodyMode::Upgraded
        } else if active.head_request || status::is_bodiless(status) {
            BodyMode::Empty
        } else {
            match response.framing {
                Some(framing) => framing,
                None => {
                    self.closing = true;
                    BodyMode::Upgraded
                }
            }
        };
        if response.close {
            self.closing = true;
        }

        debug!(status, mode = ?mode, "http/1.1 client response");
        active.response_mode = Some(mode);
        let header = active.exchange.response_header();
        self.app.begin(header, self.network.affinity, HttpExtension::Headers(headers));
        Ok(HeadOutcome::Message(mode))
    }

    fn on_body(&mut self, body: &[u8]) -> usize {
        let Some(active) = &mut self.active else {
            return body.len();
        };
        if active.exchange.is_response_closed() {
            return body.len();
        }

        let window = &mut active.exchange.response;
        let length = window.writable().min(body.len());
        if length == 0 {
            return 0;
        }

        let reserved = length as u32 + window.padding;
        let header = active.exchange.response_header();
        self.app.data(header, flags::COMPLETE, 0, reserved, Bytes::copy_from_slice(&body[..length]), HttpExtension::Empty);
        active.exchange.response.advance(reserved);
        length
    }

    fn on_end(&mut self, trailers: HeaderList) {
        let Some(active) = &mut self.active else {
            return;
        };
        if active.interim {
            active.interim = false;
            return;
        }

        if active.exchange.response_state == ExchangeState::Pending {
            active.deferred_end = Some(trailers);
        } else {
            self.end_response(trailers);
        }
    }

    fn on_error(&mut self, error: Http1Error) {
        debug!(%error, "http/1.1 client response rejected");
        self.abort_exchange();
        self.cleanup();
    }
}
