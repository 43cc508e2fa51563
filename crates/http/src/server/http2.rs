//! HTTP/2 server connection.
//!
//! Streams are multiplexed over one [`Http2Core`]. Each client stream carries
//! one exchange toward the application, pushed streams carry an exchange the
//! server initiated on behalf of a response `Promise`.
//!
//! Incoming DATA is flow controlled twice: the peer is debited against the
//! stream and connection windows when a frame starts, and credited back with
//! WINDOW_UPDATE as the application acknowledges what it was handed.

use std::collections::HashMap;

use bytes::Bytes;
use http::uri::PathAndQuery;
use micro_fabric::{
    BeginFrame, Context, DataFrame, EndFrame, Frame, NetworkExtension, Outbox, StreamIds, WindowFrame, flags,
};
use tracing::{debug, trace, warn};

use crate::binding::HttpBinding;
use crate::codec::h2::{
    DEFAULT_MAX_FRAME_SIZE, FrameHeader, FrameType, Http2Decoder, Http2Sink, MAX_WINDOW_SIZE, Priority,
    parse_rst_stream, parse_window_update,
};
use crate::connection::h2::{CONNECTION_HEADERS, DecodedHeaders, Http2Core, Http2Stream, SettingsChange, grant_outgoing};
use crate::connection::{NetworkStream, StreamEvents};
use crate::exchange::{
    CHALLENGE_SIGNAL, CLEANUP_SIGNAL, EXPIRED_SIGNAL, Exchange, ExchangeState, GuardSession, ResetOutcome, authorize,
    challenge_request,
};
use crate::protocol::{HeaderList, Http2Error, Http2ErrorCode, HttpExtension, status};

#[derive(Debug)]
pub struct Http2Server {
    binding: HttpBinding,
    context: Context,
    pub(crate) core: Http2Core,
    streams: HashMap<u32, Http2Stream>,
    /// Application request id to HTTP/2 stream id.
    requests: HashMap<u64, u32>,
    pub(crate) app: Outbox<HttpExtension>,
    pub(crate) events: StreamEvents,
    max_client_stream_id: u32,
    next_promise_id: u32,
    /// Payload of the DATA frame being decoded that reached the application.
    data_delivered: u32,
    trace_id: u64,
    closing: bool,
    cleanup_scheduled: bool,
}

impl Http2Server {
    pub fn new(binding: HttpBinding, context: Context, network: NetworkStream) -> Self {
        let decoder = Http2Decoder::server(DEFAULT_MAX_FRAME_SIZE);
        let core = Http2Core::new(network, decoder, binding.config(), &context);
        Self {
            binding,
            context,
            core,
            streams: HashMap::new(),
            requests: HashMap::new(),
            app: Outbox::new(),
            events: StreamEvents::default(),
            max_client_stream_id: 0,
            next_promise_id: 2,
            data_delivered: 0,
            trace_id: 0,
            closing: false,
            cleanup_scheduled: false,
        }
    }

    /// Takes over a connection whose HTTP/1.1 decoder saw the prior knowledge preface.
    pub fn delegated(binding: HttpBinding, context: Context, network: NetworkStream) -> Self {
        let mut server = Self::new(binding, context, network);
        server.decode_buffered();
        server.flush();
        server
    }

    pub fn is_closed(&self) -> bool {
        self.core.network.is_closed() && self.streams.is_empty()
    }

    pub fn on_network(&mut self, frame: Frame<NetworkExtension>) {
        self.trace_id = frame.header().trace_id;
        match frame {
            Frame::Data(data) => {
                if let Err(error) = self.core.network.receive(&data) {
                    warn!(%error, "http/2 network window violated");
                    self.abandon();
                } else {
                    self.decode(&data.payload);
                }
            }
            Frame::Window(window) => {
                if let Err(error) = self.core.network.on_window(&window) {
                    warn!(%error, "http/2 network window regressed");
                    self.abandon();
                }
            }
            Frame::End(_) => {
                self.core.network.on_end();
                self.closing = true;
                self.cleanup_streams();
            }
            Frame::Abort(_) | Frame::Reset(_) => self.abandon(),
            frame => trace!(frame = frame.name(), "http/2 network frame ignored"),
        }
        self.pump_all();
        self.flush();
    }

    pub fn on_application(&mut self, frame: Frame<HttpExtension>) {
        self.trace_id = frame.header().trace_id;

        let app_id = frame.stream_id();
        let request_id = if StreamIds::is_initial(app_id) { app_id } else { app_id ^ 1 };
        let Some(&stream_id) = self.requests.get(&request_id) else {
            debug!(stream_id = app_id, frame = frame.name(), "http/2 no such exchange");
            return;
        };

        let throttle = frame.is_throttle();
        if throttle != (app_id == request_id) {
            trace!(stream_id = app_id, frame = frame.name(), "http/2 application frame ignored");
            return;
        }

        match frame {
            Frame::Begin(begin) => self.on_response_begin(stream_id, begin),
            Frame::Data(data) => self.on_response_data(stream_id, data),
            Frame::End(end) => self.on_response_end(stream_id, end),
            Frame::Abort(_) => self.on_response_abort(stream_id),
            Frame::Window(window) => self.on_request_window(stream_id, &window),
            Frame::Reset(reset) => self.on_request_reset(stream_id, &reset.extension),
            frame => trace!(stream_id = app_id, frame = frame.name(), "http/2 application frame ignored"),
        }
        self.flush();
    }

    pub fn on_signal(&mut self, stream_id: u64, signal: u32) {
        if signal == CLEANUP_SIGNAL && stream_id == self.core.network.inbound_id {
            self.cleanup_scheduled = false;
            self.cleanup_streams();
            self.flush();
            return;
        }

        let Some(&id) = self.requests.get(&stream_id) else {
            return;
        };
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };

        stream.session.on_signal(signal);
        match signal {
            CHALLENGE_SIGNAL => {
                if let Some(guard) = &self.binding.collaborators.guard {
                    let challenged = guard.challenge(stream.session.session_id, self.context.signals.now());
                    debug!(stream_id = id, challenged, "http/2 guard challenge");
                    if challenged && stream.exchange.response_state == ExchangeState::Open {
                        let extension = HttpExtension::Headers(challenge_request());
                        self.app.challenge(stream.exchange.response_header(), extension);
                    }
                }
            }
            EXPIRED_SIGNAL => {
                debug!(stream_id = id, "http/2 guard session expired");
                if stream.exchange.response_state == ExchangeState::Pending {
                    let request_ended = stream.incoming_closed;
                    self.respond(id, 401, Vec::new(), request_ended);
                } else {
                    self.core.reset_stream(id, Http2ErrorCode::Cancel);
                }
                self.drop_stream(id);
            }
            _ => {}
        }
        self.flush();
    }

    fn decode(&mut self, payload: &[u8]) {
        let mut decoder = self.core.decoder;
        match self.core.network.take_decode_slot() {
            Some(mut slot) => {
                if slot.try_put(payload).is_err() {
                    warn!(stream_id = self.core.network.inbound_id, "http/2 decode slot overflow");
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
                    warn!(%error, "http/2 decode slot unavailable");
                    self.core.decoder = decoder;
                    self.fail(Http2ErrorCode::InternalError);
                    return;
                }
            }
        }
        self.core.decoder = decoder;
        if self.closing {
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
        if self.closing && self.core.encoder.is_empty() && self.core.network.buffered_output() == 0 {
            self.core.network.end(self.trace_id);
        }
    }

    fn is_idle(&self, stream_id: u32) -> bool {
        if stream_id % 2 == 1 { stream_id > self.max_client_stream_id } else { stream_id >= self.next_promise_id }
    }

    fn active_requests(&self) -> usize {
        self.streams.values().filter(|stream| !stream.promised).count()
    }

    fn on_settings(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        match self.core.on_settings(header, payload)? {
            Some(SettingsChange::Acknowledged { initial_window_delta }) => {
                for stream in self.streams.values_mut() {
                    stream.local_budget += initial_window_delta;
                }
            }
            Some(SettingsChange::Updated { initial_window_delta }) => {
                for stream in self.streams.values_mut() {
                    stream.remote_budget += initial_window_delta;
                    if stream.remote_budget > MAX_WINDOW_SIZE {
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
        self.core.remote.enable_push = false;

        let abandoned: Vec<u32> =
            self.streams.keys().copied().filter(|id| id % 2 == 0 && *id > goaway.last_stream_id).collect();
        for id in abandoned {
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
        let Some(stream) = self.streams.get_mut(&id) else {
            return if self.is_idle(id) { Err(Http2Error::protocol()) } else { Ok(()) };
        };

        stream.remote_budget += i64::from(increment);
        if stream.remote_budget > MAX_WINDOW_SIZE {
            return Err(Http2Error::stream(id, Http2ErrorCode::FlowControlError));
        }
        self.pump(id);
        Ok(())
    }

    fn on_priority(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        let id = header.stream_id;
        if id == 0 {
            return Err(Http2Error::protocol());
        }
        let priority = Priority::parse(payload)
            .filter(|_| payload.len() == 5)
            .ok_or(Http2Error::stream(id, Http2ErrorCode::FrameSizeError))?;
        if priority.parent_stream == id {
            return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
        }
        Ok(())
    }

    fn on_rst_stream(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        let id = header.stream_id;
        if id == 0 {
            return Err(Http2Error::protocol());
        }
        let code = parse_rst_stream(payload).ok_or_else(Http2Error::frame_size)?;
        if self.is_idle(id) {
            return Err(Http2Error::protocol());
        }

        debug!(stream_id = id, ?code, "http/2 stream reset by peer");
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.incoming_closed = true;
            stream.outgoing_closed = true;
            stream.clear_outgoing();
        }
        self.drop_stream(id);
        Ok(())
    }

    fn on_headers(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if header.frame_type == FrameType::Headers && header.stream_id % 2 == 0 {
            return Err(Http2Error::protocol());
        }
        match self.core.on_header_fragment(header, payload)? {
            Some(decoded) => self.on_header_block(decoded),
            None => Ok(()),
        }
    }

    fn on_header_block(&mut self, decoded: DecodedHeaders) -> Result<(), Http2Error> {
        let id = decoded.stream_id;
        if decoded.priority.is_some_and(|priority| priority.parent_stream == id) {
            return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
        }

        if let Some(stream) = self.streams.get_mut(&id) {
            if stream.incoming_closed {
                return Err(Http2Error::stream(id, Http2ErrorCode::StreamClosed));
            }
            if !decoded.end_stream || decoded.headers.iter().any(|(name, _)| name.starts_with(':')) {
                return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
            }
            if !stream.content_matches() {
                return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
            }
            self.end_request(id, decoded.headers);
            return Ok(());
        }

        if id <= self.max_client_stream_id {
            return Err(Http2Error::protocol());
        }
        self.max_client_stream_id = id;

        if self.core.goaway_sent {
            return Ok(());
        }
        let config = self.binding.config();
        if self.active_requests() >= config.max_concurrent_streams as usize {
            return Err(Http2Error::stream(id, Http2ErrorCode::RefusedStream));
        }

        let mut headers = decoded.headers;
        if !is_valid_request(&headers) {
            return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
        }
        let content_length = match headers.get("content-length") {
            Some(value) => {
                Some(value.parse::<u64>().map_err(|_| Http2Error::stream(id, Http2ErrorCode::ProtocolError))?)
            }
            None => None,
        };
        if decoded.end_stream && content_length.is_some_and(|length| length != 0) {
            return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
        }

        let request_ended = decoded.end_stream;
        if headers.encoded_len() > config.max_header_list_size as usize {
            self.respond(id, 431, Vec::new(), request_ended);
            return Ok(());
        }
        if !headers.get(":path").is_none_or(is_valid_path) {
            self.respond(id, 400, Vec::new(), request_ended);
            return Ok(());
        }
        headers = with_authority(headers);

        let mut response_headers = Vec::new();
        if let Some(access_control) = self.binding.collaborators.access_control.clone() {
            if access_control.is_preflight(&headers) {
                match access_control.preflight_headers(&headers) {
                    Some(policy) => self.respond(id, 204, policy, request_ended),
                    None => self.respond(id, 403, Vec::new(), request_ended),
                }
                return Ok(());
            }
            if !access_control.allow_request(&headers) {
                self.respond(id, 403, Vec::new(), request_ended);
                return Ok(());
            }
            response_headers = access_control.response_headers(&headers);
        }

        let guard = self.binding.collaborators.guard.clone();
        let request_id = self.context.ids.supply_initial_id();
        let authorized = authorize(
            guard.as_ref(),
            &headers,
            self.context.binding_id,
            request_id,
            self.trace_id,
            self.core.network.authorization,
        );

        let Some(route) = self.binding.resolve(authorized.authorization, &headers) else {
            let status = if authorized.guarded && authorized.authorization == 0 { 401 } else { 404 };
            self.respond(id, status, Vec::new(), request_ended);
            return Ok(());
        };
        for (name, value) in &route.overrides {
            headers.set(name, value.clone());
        }

        let session = match &guard {
            Some(guard) if authorized.authorization != 0 => {
                GuardSession::schedule(guard, &self.context.signals, authorized.authorization, request_id)
            }
            _ => GuardSession::none(),
        };

        let exchange = Exchange::accept(request_id, authorized.authorization, self.trace_id);
        debug!(stream_id = id, request_id, route_id = route.id, "http/2 request");
        self.app.begin(exchange.request_header(), self.core.network.affinity, HttpExtension::Headers(headers));
        self.events.opened.push(request_id);

        let mut stream = Http2Stream::new(id, exchange, &self.core.local, &self.core.remote);
        stream.session = session;
        stream.content_length = content_length;
        stream.response_headers = response_headers;
        if request_ended {
            stream.incoming_closed = true;
            stream.deferred_end = Some(HeaderList::new());
        }
        self.requests.insert(request_id, id);
        self.streams.insert(id, stream);
        Ok(())
    }

    /// Answers a stream without involving the application.
    fn respond(&mut self, id: u32, status: u16, extra: Vec<(String, String)>, request_ended: bool) {
        debug!(stream_id = id, status, "http/2 direct response");
        let mut headers: HeaderList = [(":status", status.to_string())].into_iter().collect();
        headers.extend(extra);
        if let Some(server) = &self.binding.config().server_header {
            headers.set("server", server.clone());
        }
        self.core.encode_headers(id, &headers, true);
        if !request_ended {
            self.core.reset_stream(id, Http2ErrorCode::NoError);
        }
    }

    /// Ends the request toward the application, or holds it until the request window opens.
    fn end_request(&mut self, id: u32, trailers: HeaderList) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        stream.incoming_closed = true;
        match stream.exchange.request_state {
            ExchangeState::Pending => stream.deferred_end = Some(trailers),
            ExchangeState::Open => {
                let extension = if trailers.is_empty() { HttpExtension::Empty } else { HttpExtension::Headers(trailers) };
                self.app.end(stream.exchange.request_header(), extension);
                stream.exchange.close_request();
                self.finish(id);
            }
            ExchangeState::Closed => {}
        }
    }

    fn on_response_begin(&mut self, id: u32, begin: BeginFrame<HttpExtension>) {
        let server_header = self.binding.config().server_header.clone();
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        if stream.exchange.response_state != ExchangeState::Pending {
            return;
        }
        stream.exchange.response = begin.header.window();
        stream.exchange.response_state = ExchangeState::Open;

        let source = begin.extension.into_headers();
        let status = source.status().unwrap_or(200);
        let mut headers = HeaderList::with_capacity(source.len() + 2);
        headers.push(":status", status.to_string());
        for (name, value) in source.iter() {
            if !name.starts_with(':') && !CONNECTION_HEADERS.contains(&name) {
                headers.push(name, value);
            }
        }
        if let Some(server) = server_header {
            headers.set("server", server);
        }
        headers.extend(stream.response_headers.drain(..));

        debug!(stream_id = id, status, "http/2 response");
        self.core.encode_headers(id, &headers, false);
        self.pump(id);
    }

    fn on_response_data(&mut self, id: u32, data: DataFrame<HttpExtension>) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        if stream.exchange.response.receive(data.header.sequence, data.reserved).is_err() {
            warn!(stream_id = id, "http/2 response window violated");
            self.core.reset_stream(id, Http2ErrorCode::InternalError);
            self.drop_stream(id);
            return;
        }
        stream.queue_outgoing(data.payload);

        if let Some(promise) = data.extension.promise() {
            self.promise(id, promise.clone());
        }
        self.pump(id);
    }

    fn on_response_end(&mut self, id: u32, end: EndFrame<HttpExtension>) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        stream.end_outgoing(end.extension.into_headers());
        self.pump(id);
    }

    fn on_response_abort(&mut self, id: u32) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        stream.exchange.close_response();
        stream.clear_outgoing();
        self.core.reset_stream(id, Http2ErrorCode::InternalError);
        self.drop_stream(id);
    }

    fn on_request_window(&mut self, id: u32, window: &WindowFrame) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };

        let acknowledged = stream.exchange.request.acknowledge;
        let header = &window.header;
        if stream.exchange.request.observe(header.acknowledge, header.maximum, window.padding).is_err() {
            warn!(stream_id = id, "http/2 request window regressed");
            self.core.reset_stream(id, Http2ErrorCode::InternalError);
            self.drop_stream(id);
            return;
        }

        let credit = u32::try_from(stream.exchange.request.acknowledge - acknowledged).unwrap_or(u32::MAX);
        let deferred = if stream.exchange.request_state == ExchangeState::Pending {
            stream.exchange.request_state = ExchangeState::Open;
            stream.deferred_end.take()
        } else {
            None
        };

        if credit > 0 {
            stream.local_budget += i64::from(credit);
            let stream_id = (!stream.incoming_closed).then_some(id);
            self.core.credit_peer(stream_id, credit);
        }
        if let Some(trailers) = deferred {
            self.end_request(id, trailers);
        }
        self.decode_buffered();
    }

    fn on_request_reset(&mut self, id: u32, extension: &HttpExtension) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        stream.exchange.close_request();
        let request_ended = stream.incoming_closed;

        match stream.exchange.on_reset(extension) {
            ResetOutcome::Respond(reset) => {
                let status = reset.status().unwrap_or(404);
                let extra = reset.into_vec().into_iter().filter(|(name, _)| !name.starts_with(':')).collect();
                self.respond(id, status, extra, request_ended);
            }
            ResetOutcome::Abort => {
                stream.clear_outgoing();
                self.core.reset_stream(id, Http2ErrorCode::Cancel);
            }
            ResetOutcome::Ignore if !request_ended => self.core.reset_stream(id, Http2ErrorCode::NoError),
            ResetOutcome::Ignore => {}
        }
        self.drop_stream(id);
    }

    /// Pushes `headers` as a promised request associated with stream `id`.
    fn promise(&mut self, id: u32, headers: HeaderList) {
        let pushed = self.streams.values().filter(|stream| stream.promised).count();
        let config = self.binding.config();
        if !config.enable_push
            || !self.core.remote.enable_push
            || self.core.goaway_received
            || pushed >= config.max_push_promise_list_size
            || pushed >= self.core.remote.max_concurrent_streams as usize
        {
            trace!(stream_id = id, "http/2 push promise dropped");
            return;
        }
        let Some(authorization) = self.streams.get(&id).map(|stream| stream.exchange.authorization) else {
            return;
        };

        let promised_id = self.next_promise_id;
        self.next_promise_id += 2;
        self.core.encode_push_promise(id, promised_id, &headers);

        let request_id = self.context.ids.supply_initial_id();
        let exchange = Exchange::accept(request_id, authorization, self.trace_id);
        debug!(stream_id = id, promised_id, request_id, "http/2 push promise");
        self.app.begin(exchange.request_header(), self.core.network.affinity, HttpExtension::Headers(headers));
        self.events.opened.push(request_id);

        let mut stream = Http2Stream::new(promised_id, exchange, &self.core.local, &self.core.remote);
        stream.promised = true;
        stream.incoming_closed = true;
        stream.deferred_end = Some(HeaderList::new());
        self.requests.insert(request_id, promised_id);
        self.streams.insert(promised_id, stream);
    }

    /// Frames queued response data and re-offers the application a window.
    fn pump(&mut self, id: u32) {
        let capacity = self.core.encode_limit();
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        if stream.exchange.response_state == ExchangeState::Pending {
            return;
        }

        let ended = self.core.frame_outgoing(stream);
        if ended {
            stream.exchange.close_response();
        } else if stream.exchange.response_state == ExchangeState::Open {
            let queued = stream.outgoing_len();
            if grant_outgoing(&mut stream.exchange.response, stream.remote_budget, queued, capacity) {
                self.app.window(stream.exchange.response_header(), self.core.budget_id, 0);
            }
        }
        if ended {
            self.finish(id);
        }
    }

    fn pump_all(&mut self) {
        let ids: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.exchange.response_state == ExchangeState::Open)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.pump(id);
        }
    }

    fn finish(&mut self, id: u32) {
        if self.streams.get(&id).is_some_and(|stream| stream.exchange.is_finished()) {
            if let Some(stream) = self.streams.remove(&id) {
                debug!(stream_id = id, "http/2 exchange finished");
                self.release(stream);
            }
        }
    }

    /// Removes stream `id`, closing whatever the application still has open.
    fn drop_stream(&mut self, id: u32) {
        let Some(stream) = self.streams.remove(&id) else {
            return;
        };
        if !stream.exchange.is_request_closed() {
            self.app.abort(stream.exchange.request_header());
        }
        if !stream.exchange.is_response_closed() {
            self.app.reset(stream.exchange.response_header(), HttpExtension::Empty);
        }
        self.release(stream);
    }

    fn release(&mut self, mut stream: Http2Stream) {
        let unacknowledged = stream.exchange.request.pending();
        if unacknowledged > 0 && !self.closing {
            self.core.credit_peer(None, u32::try_from(unacknowledged).unwrap_or(u32::MAX));
        }
        stream.session.cancel(&self.context.signals);
        self.requests.remove(&stream.exchange.request_id);
        self.events.closed.push(stream.exchange.request_id);
    }

    /// Sends GOAWAY and starts tearing down the streams.
    fn fail(&mut self, code: Http2ErrorCode) {
        self.core.goaway(self.max_client_stream_id, code);
        self.closing = true;
        self.core.decoder.ignore_all();
        self.cleanup_streams();
    }

    /// The network is gone, nothing more can be written.
    fn abandon(&mut self) {
        self.closing = true;
        self.core.decoder.ignore_all();
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            self.drop_stream(id);
        }
        self.core.network.close(self.trace_id);
    }

    /// Drops streams in batches, re-arming a signal until none are left.
    fn cleanup_streams(&mut self) {
        let config = self.binding.config();
        let batch = config.max_concurrent_streams_cleanup.max(1);
        let delay = config.streams_cleanup_delay_ms;

        let ids: Vec<u32> = self.streams.keys().copied().take(batch).collect();
        for id in ids {
            self.drop_stream(id);
        }

        if !self.streams.is_empty() && !self.cleanup_scheduled {
            let deadline = self.context.signals.now() + delay;
            self.context.signals.signal_at(deadline, self.core.network.inbound_id, CLEANUP_SIGNAL);
            self.cleanup_scheduled = true;
        }
    }

    /// A validator refused request content on stream `id`.
    fn reject_content(&mut self, id: u32) {
        let Some(stream) = self.streams.get(&id) else {
            return;
        };
        debug!(stream_id = id, "http/2 request content rejected");
        if stream.exchange.response_state == ExchangeState::Pending {
            let request_ended = stream.incoming_closed;
            self.respond(id, 400, Vec::new(), request_ended);
        } else {
            self.core.reset_stream(id, Http2ErrorCode::Cancel);
        }
        self.drop_stream(id);
    }
}

impl Http2Sink for Http2Server {
    fn on_preface(&mut self) {
        debug!(stream_id = self.core.network.inbound_id, "http/2 preface");
        self.core.start_server();
    }

    fn on_frame(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        match header.frame_type {
            FrameType::Settings => self.on_settings(header, payload),
            FrameType::Ping => self.core.on_ping(header, payload),
            FrameType::Goaway => self.on_goaway(header, payload),
            FrameType::WindowUpdate => self.on_window_update(header, payload),
            FrameType::Headers | FrameType::Continuation => self.on_headers(header, payload),
            FrameType::PushPromise => Err(Http2Error::protocol()),
            FrameType::Priority => self.on_priority(header, payload),
            FrameType::RstStream => self.on_rst_stream(header, payload),
            FrameType::Data | FrameType::Unknown(_) => Ok(()),
        }
    }

    fn on_data_begin(&mut self, header: &FrameHeader) -> Result<bool, Http2Error> {
        let id = header.stream_id;
        self.core.debit_data(header)?;
        self.data_delivered = 0;

        let open = self.streams.get(&id).is_some_and(|stream| !stream.incoming_closed);
        if !open {
            self.core.credit_peer(None, header.length);
            if self.is_idle(id) {
                return Err(Http2Error::protocol());
            }
            return Err(Http2Error::stream(id, Http2ErrorCode::StreamClosed));
        }

        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(false);
        };
        stream.local_budget -= i64::from(header.length);
        if stream.local_budget < 0 {
            self.core.credit_peer(None, header.length);
            return Err(Http2Error::stream(id, Http2ErrorCode::FlowControlError));
        }
        Ok(true)
    }

    fn on_data(&mut self, stream_id: u32, payload: &[u8]) -> usize {
        let validator = self.binding.collaborators.validator.clone();
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return payload.len();
        };
        if stream.exchange.is_request_closed() {
            return payload.len();
        }

        let window = &mut stream.exchange.request;
        let length = window.writable().min(payload.len());
        if length == 0 {
            return 0;
        }

        let chunk = &payload[..length];
        if validator.is_some_and(|validator| !validator.validate(chunk)) {
            self.reject_content(stream_id);
            return payload.len();
        }

        let reserved = length as u32 + window.padding;
        let header = stream.exchange.request_header();
        self.app.data(header, flags::COMPLETE, 0, reserved, Bytes::copy_from_slice(chunk), HttpExtension::Empty);
        stream.exchange.request.advance(reserved);
        stream.content_received += length as u64;
        self.data_delivered += length as u32;
        length
    }

    fn on_data_end(&mut self, header: &FrameHeader) -> Result<(), Http2Error> {
        let id = header.stream_id;
        let undelivered = header.length.saturating_sub(self.data_delivered);
        self.data_delivered = 0;

        let Some(stream) = self.streams.get_mut(&id) else {
            self.core.credit_peer(None, undelivered);
            return Ok(());
        };

        stream.local_budget += i64::from(undelivered);
        let end_stream = header.is_end_stream();
        self.core.credit_peer((!end_stream).then_some(id), undelivered);

        if stream.content_length.is_some_and(|length| stream.content_received > length) {
            return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
        }
        if end_stream {
            if !stream.content_matches() {
                return Err(Http2Error::stream(id, Http2ErrorCode::ProtocolError));
            }
            self.end_request(id, HeaderList::new());
        }
        Ok(())
    }

    fn on_stream_error(&mut self, stream_id: u32, code: Http2ErrorCode) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.clear_outgoing();
            stream.outgoing_closed = true;
        }
        self.core.reset_stream(stream_id, code);
        self.drop_stream(stream_id);
    }

    fn on_connection_error(&mut self, code: Http2ErrorCode) {
        self.fail(code);
    }
}

/// Checks pseudo-header presence and order, lowercase names and connection-specific fields.
fn is_valid_request(headers: &HeaderList) -> bool {
    let mut regular = false;
    let mut connect = false;
    let (mut method, mut scheme, mut path, mut authority) = (0, 0, 0, 0);

    for (name, value) in headers.iter() {
        if name.bytes().any(|b| b.is_ascii_uppercase()) {
            return false;
        }
        match name.strip_prefix(':') {
            Some(pseudo) => {
                if regular {
                    return false;
                }
                match pseudo {
                    "method" => {
                        method += 1;
                        connect = value == "CONNECT";
                    }
                    "scheme" => scheme += 1,
                    "path" => path += 1,
                    "authority" => authority += 1,
                    _ => return false,
                }
            }
            None => {
                regular = true;
                if CONNECTION_HEADERS.contains(&name) || (name == "te" && value != "trailers") {
                    return false;
                }
            }
        }
    }

    if connect {
        method == 1 && authority == 1 && scheme == 0 && path == 0
    } else {
        method == 1 && scheme == 1 && path == 1 && authority <= 1
    }
}

fn is_valid_path(path: &str) -> bool {
    path == "*" || (path.starts_with('/') && path.parse::<PathAndQuery>().is_ok())
}

/// Moves `host` into `:authority` when absent, and adds the default port of the scheme.
fn with_authority(headers: HeaderList) -> HeaderList {
    let scheme = headers.get(":scheme").unwrap_or("https").to_string();
    let authority = match headers.get(":authority").or_else(|| headers.get("host")) {
        Some(authority) => status::authority_with_port(authority, &scheme),
        None => return headers,
    };

    let mut result = HeaderList::with_capacity(headers.len() + 1);
    let mut placed = false;
    for (name, value) in headers.into_vec() {
        match name.as_str() {
            ":authority" | "host" => continue,
            _ if !placed && !name.starts_with(':') => {
                result.push(":authority", authority.clone());
                placed = true;
            }
            _ => {}
        }
        result.push(name, value);
    }
    if !placed {
        result.push(":authority", authority);
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::BytesMut;
    use micro_fabric::{BufferPool, HeaderLookup, Route, Signals, StreamHeader, TransportInfo};

    use super::*;
    use crate::codec::h2::{FRAME_HEADER_LEN, PREFACE, flags as frame_flags, write};
    use crate::codec::hpack::HpackEncoder;
    use crate::config::HttpConfig;

    fn any_route(_: u64, _: &dyn HeaderLookup) -> Option<Route> {
        Some(Route::new(1))
    }

    fn server_with(config: HttpConfig) -> Http2Server {
        let context = Context::new(1, BufferPool::new(65_536, 16), Signals::manual());
        let binding = HttpBinding::new(Arc::new(any_route), config);
        let begin = BeginFrame {
            header: StreamHeader { stream_id: 3, ..Default::default() },
            affinity: 0,
            extension: NetworkExtension::Begin(TransportInfo { secure: true, alpn: Some("h2".into()) }),
        };
        let mut network = NetworkStream::accept(&begin, context.pool.clone());
        network.out.take();
        network
            .on_window(&WindowFrame {
                header: StreamHeader { stream_id: 2, maximum: 65_536, ..Default::default() },
                budget_id: 0,
                padding: 0,
            })
            .unwrap();

        let mut server = Http2Server::new(binding, context, network);
        let mut preface = BytesMut::from(PREFACE);
        write::settings(&mut preface, &[]);
        server.decode(&preface);
        server.flush();
        server.core.network.out.take();
        server
    }

    fn server() -> Http2Server {
        server_with(HttpConfig::default())
    }

    fn written(server: &mut Http2Server) -> Vec<(FrameHeader, Vec<u8>)> {
        server.flush();
        let bytes: Vec<u8> = server
            .core
            .network
            .out
            .take()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Data(data) => Some(data.payload.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();

        let mut frames = Vec::new();
        let mut offset = 0;
        while let Some(header) = FrameHeader::parse(&bytes[offset..]) {
            frames.push((header, bytes[offset + FRAME_HEADER_LEN..offset + header.frame_len()].to_vec()));
            offset += header.frame_len();
        }
        frames
    }

    fn request(stream_id: u32, headers: &[(&str, &str)], end_stream: bool) -> BytesMut {
        let headers: HeaderList = headers.iter().copied().collect();
        let block = HpackEncoder::new().encode(&headers);
        let mut frames = BytesMut::new();
        write::headers(&mut frames, stream_id, &block, end_stream, 16_384);
        frames
    }

    fn get(stream_id: u32) -> BytesMut {
        request(stream_id, &[(":method", "GET"), (":scheme", "https"), (":authority", "example.com"), (":path", "/")], true)
    }

    #[test]
    fn test_preface_answers_settings() {
        let context = Context::new(1, BufferPool::new(65_536, 4), Signals::manual());
        let binding = HttpBinding::new(Arc::new(any_route), HttpConfig::default());
        let begin = BeginFrame { header: StreamHeader { stream_id: 3, ..Default::default() }, affinity: 0, extension: NetworkExtension::Empty };
        let mut network = NetworkStream::accept(&begin, context.pool.clone());
        network
            .on_window(&WindowFrame { header: StreamHeader { stream_id: 2, maximum: 65_536, ..Default::default() }, budget_id: 0, padding: 0 })
            .unwrap();
        let mut server = Http2Server::new(binding, context, network);

        let mut preface = BytesMut::from(PREFACE);
        write::settings(&mut preface, &[]);
        server.decode(&preface);

        let frames = written(&mut server);
        let types: Vec<(FrameType, bool)> = frames.iter().map(|(h, _)| (h.frame_type, h.has(frame_flags::ACK))).collect();
        assert_eq!(types, [(FrameType::Settings, false), (FrameType::Settings, true)]);
    }

    #[test]
    fn test_get_begins_exchange() {
        let mut server = server();
        server.decode(&get(1));

        let frames = server.app.take();
        let Frame::Begin(begin) = &frames[0] else { panic!("expected begin, got {frames:?}") };
        let headers = begin.extension.headers().unwrap();
        assert_eq!(headers.get(":authority"), Some("example.com:443"));
        assert_eq!(headers.get(":path"), Some("/"));

        let request_id = begin.header.stream_id;
        server.on_application(Frame::Window(WindowFrame {
            header: StreamHeader { stream_id: request_id, maximum: 8192, ..Default::default() },
            budget_id: 0,
            padding: 0,
        }));
        assert!(matches!(server.app.take().as_slice(), [Frame::End(_)]));
    }

    #[test]
    fn test_even_stream_headers() {
        let mut server = server();
        server.decode(&get(2));

        let frames = written(&mut server);
        let (header, payload) = &frames[0];
        assert_eq!(header.frame_type, FrameType::Goaway);
        assert_eq!(crate::codec::h2::parse_goaway(payload).unwrap().error_code, Http2ErrorCode::ProtocolError);
        assert!(server.app.is_empty());
    }

    #[test]
    fn test_zero_window_update_on_stream() {
        let mut server = server();
        server.decode(&request(1, &[(":method", "POST"), (":scheme", "https"), (":authority", "a"), (":path", "/")], false));
        server.app.take();

        let mut frame = BytesMut::new();
        write::window_update(&mut frame, 1, 0);
        server.decode(&frame);

        let frames = written(&mut server);
        let (header, payload) = &frames[0];
        assert_eq!((header.frame_type, header.stream_id), (FrameType::RstStream, 1));
        assert_eq!(parse_rst_stream(payload), Some(Http2ErrorCode::ProtocolError));
        assert!(matches!(server.app.take().as_slice(), [Frame::Abort(_), Frame::Reset(_)]));
    }

    #[test]
    fn test_window_update_on_idle_stream() {
        let mut server = server();
        let mut frame = BytesMut::new();
        write::window_update(&mut frame, 5, 10);
        server.decode(&frame);

        let frames = written(&mut server);
        assert_eq!(frames[0].0.frame_type, FrameType::Goaway);
    }

    #[test]
    fn test_settings_ack_with_payload() {
        let mut server = server();
        let frame = write::frame(FrameHeader::new(FrameType::Settings, frame_flags::ACK, 0, 6), &[0; 6]);
        server.decode(&frame);

        let frames = written(&mut server);
        let goaway = crate::codec::h2::parse_goaway(&frames[0].1).unwrap();
        assert_eq!(goaway.error_code, Http2ErrorCode::FrameSizeError);
    }

    #[test]
    fn test_refused_stream_over_limit() {
        let mut server = server_with(HttpConfig { max_concurrent_streams: 1, ..HttpConfig::default() });
        server.decode(&get(1));
        server.decode(&get(3));

        assert_eq!(server.app.take().len(), 1);
        let frames = written(&mut server);
        let (header, payload) = &frames[0];
        assert_eq!((header.frame_type, header.stream_id), (FrameType::RstStream, 3));
        assert_eq!(parse_rst_stream(payload), Some(Http2ErrorCode::RefusedStream));
    }

    #[test]
    fn test_response_frames() {
        let mut server = server();
        server.decode(&get(1));
        let request_id = server.app.take()[0].stream_id();
        let response_id = request_id ^ 1;

        let response: HeaderList = [(":status", "200"), ("connection", "close")].into_iter().collect();
        server.on_application(Frame::Begin(BeginFrame {
            header: StreamHeader { stream_id: response_id, ..Default::default() },
            affinity: 0,
            extension: HttpExtension::Headers(response),
        }));
        let Some(Frame::Window(window)) = server.app.take().pop() else { panic!("expected response window") };
        assert_eq!(window.header.maximum, 65_535);

        server.on_application(Frame::Data(DataFrame {
            header: StreamHeader { stream_id: response_id, ..Default::default() },
            flags: flags::COMPLETE,
            budget_id: 0,
            reserved: 5,
            payload: Bytes::from_static(b"hello"),
            extension: HttpExtension::Empty,
        }));
        server.on_application(Frame::End(EndFrame {
            header: StreamHeader { stream_id: response_id, sequence: 5, ..Default::default() },
            extension: HttpExtension::Empty,
        }));

        let frames = written(&mut server);
        let kinds: Vec<FrameType> = frames.iter().map(|(header, _)| header.frame_type).collect();
        assert_eq!(kinds, [FrameType::Headers, FrameType::Data, FrameType::Data]);
        assert_eq!(frames[1].1, b"hello");
        assert!(frames[2].0.is_end_stream());
    }

    #[test]
    fn test_response_data_claims_connection_budget() {
        let mut server = server();
        server.decode(&get(1));
        let request_id = server.app.take()[0].stream_id();
        let response_id = request_id ^ 1;

        let mut update = BytesMut::new();
        write::window_update(&mut update, 0, 1000);
        server.decode(&update);
        let budget_id = server.core.budget_id;
        assert_eq!(server.context.creditor.available(budget_id), 66_535);

        server.on_application(Frame::Begin(BeginFrame {
            header: StreamHeader { stream_id: response_id, ..Default::default() },
            affinity: 0,
            extension: HttpExtension::Headers([(":status", "200")].into_iter().collect()),
        }));
        let Some(Frame::Window(window)) = server.app.take().pop() else { panic!("expected response window") };
        assert_eq!(window.budget_id, budget_id);

        server.on_application(Frame::Data(DataFrame {
            header: StreamHeader { stream_id: response_id, ..Default::default() },
            flags: flags::COMPLETE,
            budget_id,
            reserved: 500,
            payload: Bytes::from(vec![b'x'; 500]),
            extension: HttpExtension::Empty,
        }));

        let frames = written(&mut server);
        let sent: usize = frames.iter().filter(|(header, _)| header.frame_type == FrameType::Data).map(|(_, payload)| payload.len()).sum();
        assert_eq!(sent, 500);
        assert_eq!(server.context.creditor.available(budget_id), 66_035);
        assert_eq!(server.core.remote_shared_budget(), 66_035);
    }

    #[test]
    fn test_request_validation() {
        let valid: HeaderList =
            [(":method", "GET"), (":scheme", "https"), (":path", "/"), ("accept", "*/*")].into_iter().collect();
        assert!(is_valid_request(&valid));

        let late_pseudo: HeaderList =
            [(":method", "GET"), ("accept", "*/*"), (":scheme", "https"), (":path", "/")].into_iter().collect();
        assert!(!is_valid_request(&late_pseudo));

        let connection: HeaderList =
            [(":method", "GET"), (":scheme", "https"), (":path", "/"), ("connection", "close")].into_iter().collect();
        assert!(!is_valid_request(&connection));

        let connect: HeaderList = [(":method", "CONNECT"), (":authority", "a:443")].into_iter().collect();
        assert!(is_valid_request(&connect));
    }

    #[test]
    fn test_host_becomes_authority() {
        let headers: HeaderList =
            [(":method", "GET"), (":scheme", "http"), (":path", "/"), ("host", "example.com"), ("accept", "*/*")]
                .into_iter()
                .collect();
        let headers = with_authority(headers);
        let names: Vec<&str> = headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names, [":method", ":scheme", ":path", ":authority", "accept"]);
        assert_eq!(headers.get(":authority"), Some("example.com:80"));
    }
}
