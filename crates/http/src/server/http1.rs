//! HTTP/1.1 server connection.
//!
//! One exchange is active at a time. Pipelined requests stay in the decode
//! slot until the active exchange is finished, then decoding resumes.
//!
//! ```text
//! network Data -> Http1Decoder -> Http1Server (sink) -> application Begin/Data/End
//! application Begin/Data/End -> encoder -> NetworkStream::write -> network Data
//! ```

use bytes::Bytes;
use http::Uri;
use micro_fabric::{BeginFrame, Context, DataFrame, EndFrame, Frame, NetworkExtension, Outbox, WindowFrame, flags};
use tracing::{debug, trace, warn};

use crate::binding::HttpBinding;
use crate::codec::h1::head::{HeaderLine, Lines, is_http1_version, parse_header_line, parse_request_line};
use crate::codec::h1::{
    BodyMode, CHUNK_PADDING, CONTINUE_RESPONSE, Framing, HeadOutcome, Http1Decoder, Http1Sink, encode_chunk,
    encode_last_chunk, encode_response_head,
};
use crate::codec::h2::PREFACE_LINE;
use crate::config::HttpVersion;
use crate::connection::{NetworkStream, StreamEvents};
use crate::exchange::{
    CHALLENGE_SIGNAL, EXPIRED_SIGNAL, Exchange, ExchangeState, GuardSession, ResetOutcome, authorize, challenge_request,
};
use crate::protocol::{HeaderList, Http1Error, HttpExtension, status};
use crate::utils::{CRLF, ensure, index_of, is_connection_close};

/// Answer to a rejected body, the connection stays open.
const INVALID_CONTENT_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";

#[derive(Debug)]
enum Active {
    Exchange(Box<Http1Exchange>),
    /// The response was written directly, the request body is dropped.
    Discard,
}

#[derive(Debug)]
struct Http1Exchange {
    exchange: Exchange,
    session: GuardSession,
    head_request: bool,
    upgrade: bool,
    expect_continue: bool,
    has_body: bool,
    request_ended: bool,
    deferred_end: Option<HeaderList>,
    response_headers: Vec<(String, String)>,
    framing: Framing,
}

#[derive(Debug)]
pub struct Http1Server {
    binding: HttpBinding,
    context: Context,
    pub(crate) network: NetworkStream,
    decoder: Http1Decoder,
    active: Option<Active>,
    pub(crate) app: Outbox<HttpExtension>,
    pub(crate) events: StreamEvents,
    trace_id: u64,
    closing: bool,
    ignore_input: bool,
}

impl Http1Server {
    pub fn new(binding: HttpBinding, context: Context, network: NetworkStream) -> Self {
        let decoder = Http1Decoder::new(binding.config().head_limit(network.pool().slot_capacity()));
        Self {
            binding,
            context,
            network,
            decoder,
            active: None,
            app: Outbox::new(),
            events: StreamEvents::default(),
            trace_id: 0,
            closing: false,
            ignore_input: false,
        }
    }

    /// The connection preface was seen, the network now belongs to an HTTP/2 server.
    pub fn is_delegated(&self) -> bool {
        self.decoder.state() == crate::codec::h1::DecodeState::Delegated
    }

    pub fn into_parts(self) -> (HttpBinding, Context, NetworkStream) {
        (self.binding, self.context, self.network)
    }

    pub fn is_closed(&self) -> bool {
        self.network.is_closed() && self.active.is_none()
    }

    pub fn on_network(&mut self, frame: Frame<NetworkExtension>) {
        self.trace_id = frame.header().trace_id;
        match frame {
            Frame::Data(data) => self.on_network_data(&data),
            Frame::End(_) => self.on_network_end(),
            Frame::Abort(_) => self.on_network_abort(),
            Frame::Window(window) => self.on_network_window(&window),
            Frame::Reset(_) => self.on_network_reset(),
            frame => trace!(frame = frame.name(), "http/1.1 network frame ignored"),
        }
    }

    fn on_network_data(&mut self, data: &DataFrame<NetworkExtension>) {
        if let Err(error) = self.network.receive(data) {
            warn!(%error, "http/1.1 network window violated");
            self.cleanup();
            return;
        }
        self.decode(&data.payload);
    }

    fn on_network_end(&mut self) {
        self.network.on_end();

        let upgraded = match &mut self.active {
            Some(Active::Exchange(active)) if active.upgrade && !active.request_ended => {
                active.request_ended = true;
                true
            }
            _ => false,
        };

        if upgraded {
            self.end_request(HeaderList::new());
        } else if let Some(Active::Exchange(active)) = &self.active {
            if !active.request_ended {
                self.abort_exchange();
            }
        }

        if self.active.is_none() {
            self.network.end(self.trace_id);
        }
    }

    fn on_network_abort(&mut self) {
        self.network.on_end();
        self.abort_exchange();
        self.network.abort(self.trace_id);
    }

    fn on_network_reset(&mut self) {
        self.abort_exchange();
        self.network.abort(self.trace_id);
        self.network.reset(self.trace_id);
    }

    fn on_network_window(&mut self, window: &WindowFrame) {
        if let Err(error) = self.network.on_window(window) {
            warn!(%error, "http/1.1 network window regressed");
            self.cleanup();
            return;
        }
        self.network.flush(self.trace_id);
        self.grant_response();
    }

    /// Decodes `payload` after whatever the decode slot already holds.
    fn decode(&mut self, payload: &[u8]) {
        let mut decoder = self.decoder;
        match self.network.take_decode_slot() {
            Some(mut slot) => {
                if slot.try_put(payload).is_err() {
                    warn!(stream_id = self.network.inbound_id, "http/1.1 decode slot overflow");
                    self.decoder = decoder;
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
                    warn!(%error, "http/1.1 decode slot unavailable");
                    self.decoder = decoder;
                    self.cleanup();
                    return;
                }
            }
        }
        self.decoder = decoder;
        if self.ignore_input {
            self.decoder.ignore();
        }
        self.network.grant_inbound(self.trace_id);
    }

    /// Resumes decoding of buffered input after the sink became ready again.
    fn decode_buffered(&mut self) {
        if self.network.buffered_input() > 0 && !self.is_delegated() {
            self.decode(&[]);
        }
    }

    pub fn on_application(&mut self, frame: Frame<HttpExtension>) {
        self.trace_id = frame.header().trace_id;

        let Some(Active::Exchange(active)) = &self.active else {
            debug!(stream_id = frame.stream_id(), frame = frame.name(), "http/1.1 no active exchange");
            return;
        };
        let request_id = active.exchange.request_id;
        let response_id = active.exchange.response_id;

        match frame {
            Frame::Begin(begin) if begin.header.stream_id == response_id => self.on_response_begin(begin),
            Frame::Data(data) if data.header.stream_id == response_id => self.on_response_data(&data),
            Frame::End(end) if end.header.stream_id == response_id => self.on_response_end(end),
            Frame::Abort(abort) if abort.header.stream_id == response_id => self.on_response_abort(),
            Frame::Window(window) if window.header.stream_id == request_id => self.on_request_window(&window),
            Frame::Reset(reset) if reset.header.stream_id == request_id => self.on_request_reset(&reset.extension),
            frame => trace!(stream_id = frame.stream_id(), frame = frame.name(), "http/1.1 application frame ignored"),
        }
    }

    pub fn on_signal(&mut self, stream_id: u64, signal: u32) {
        let Some(Active::Exchange(active)) = &mut self.active else {
            return;
        };
        if active.exchange.request_id != stream_id {
            return;
        }

        active.session.on_signal(signal);
        match signal {
            CHALLENGE_SIGNAL => {
                if let Some(guard) = &self.binding.collaborators.guard {
                    let challenged = guard.challenge(active.session.session_id, self.context.signals.now());
                    debug!(stream_id, challenged, "http/1.1 guard challenge");
                    if challenged && active.exchange.response_state == ExchangeState::Open {
                        let extension = HttpExtension::Headers(challenge_request());
                        self.app.challenge(active.exchange.response_header(), extension);
                    }
                }
            }
            EXPIRED_SIGNAL => {
                debug!(stream_id, "http/1.1 guard session expired");
                if active.exchange.response_state == ExchangeState::Pending {
                    self.abort_exchange();
                    self.fail(Http1Error::Unauthorized);
                } else {
                    self.abort_exchange();
                    self.cleanup();
                }
            }
            _ => {}
        }
    }

    fn on_request_window(&mut self, window: &WindowFrame) {
        let Some(Active::Exchange(active)) = &mut self.active else {
            return;
        };

        let header = &window.header;
        if active.exchange.request.observe(header.acknowledge, header.maximum, window.padding).is_err() {
            warn!(stream_id = header.stream_id, "http/1.1 request window regressed");
            self.abort_exchange();
            self.cleanup();
            return;
        }

        if active.exchange.request_state == ExchangeState::Pending {
            active.exchange.request_state = ExchangeState::Open;
            if active.expect_continue && active.has_body {
                if let Err(error) = self.network.write(self.trace_id, CONTINUE_RESPONSE) {
                    warn!(%error, "http/1.1 continue response dropped");
                }
            }
            if let Some(trailers) = active.deferred_end.take() {
                self.end_request(trailers);
            }
        }

        self.decode_buffered();
    }

    fn on_request_reset(&mut self, extension: &HttpExtension) {
        let closing = self.closing;
        let Some(Active::Exchange(active)) = &mut self.active else {
            return;
        };

        active.exchange.close_request();
        match active.exchange.on_reset(extension) {
            ResetOutcome::Respond(mut headers) => {
                headers.set("content-length", "0");
                if closing {
                    headers.set("connection", "close");
                }
                active.exchange.close_response();
                let request_ended = active.request_ended;
                self.app.reset(active.exchange.response_header(), HttpExtension::Empty);

                let mut head = Vec::new();
                encode_response_head(&mut head, &headers);
                self.write(&head);
                self.finish(!request_ended);
            }
            ResetOutcome::Abort => {
                self.abort_exchange();
                self.cleanup();
            }
            ResetOutcome::Ignore => {}
        }
    }

    fn on_response_begin(&mut self, begin: BeginFrame<HttpExtension>) {
        let closing = self.closing;
        let server_header = self.binding.config().server_header.clone();
        let maximum_headers_size = self.binding.config().maximum_headers_size;

        let Some(Active::Exchange(active)) = &mut self.active else {
            return;
        };
        active.exchange.response = begin.header.window();
        active.exchange.response_state = ExchangeState::Open;

        let mut headers = begin.extension.into_headers();
        let status = headers.status().unwrap_or(200);

        active.framing = if active.upgrade && status == 101 {
            Framing::Close
        } else if active.head_request || status::is_bodiless(status) {
            Framing::Empty
        } else {
            match Framing::declared(&headers) {
                Some(framing) => framing,
                None => {
                    headers.set("transfer-encoding", "chunked");
                    Framing::Chunked
                }
            }
        };

        if let Some(server) = server_header {
            headers.set("server", server);
        }
        headers.extend(active.response_headers.drain(..));
        if closing {
            headers.set("connection", "close");
        }

        let mut head = Vec::with_capacity(256);
        encode_response_head(&mut head, &headers);
        if head.len() > maximum_headers_size {
            warn!(len = head.len(), "http/1.1 response headers exceed the encode limit");
            let response_header = active.exchange.response_header();
            self.app.reset(response_header, HttpExtension::Empty);
            active.exchange.close_response();
            self.abort_request();
            self.fail(Http1Error::InsufficientStorage);
            return;
        }

        debug!(status, framing = ?active.framing, "http/1.1 response");
        self.write(&head);
        self.grant_response();
    }

    fn on_response_data(&mut self, data: &DataFrame<HttpExtension>) {
        let Some(Active::Exchange(active)) = &mut self.active else {
            return;
        };

        if active.exchange.response.receive(data.header.sequence, data.reserved).is_err() {
            warn!(stream_id = data.header.stream_id, "http/1.1 response window violated");
            self.abort_exchange();
            self.cleanup();
            return;
        }

        let framing = active.framing;
        match framing {
            Framing::Chunked => {
                let mut chunk = Vec::with_capacity(data.payload.len() + CHUNK_PADDING as usize);
                encode_chunk(&mut chunk, &data.payload);
                self.write(&chunk);
            }
            Framing::Empty => {}
            Framing::Content(_) | Framing::Close => self.write(&data.payload),
        }
        self.grant_response();
    }

    fn on_response_end(&mut self, end: EndFrame<HttpExtension>) {
        let Some(Active::Exchange(active)) = &mut self.active else {
            return;
        };

        let framing = active.framing;
        let request_ended = active.request_ended;
        active.exchange.close_response();

        if framing.is_chunked() {
            let mut last = Vec::new();
            encode_last_chunk(&mut last, &end.extension.into_headers());
            self.write(&last);
        }
        if framing == Framing::Close {
            self.closing = true;
        }
        self.finish(!request_ended);
    }

    fn on_response_abort(&mut self) {
        let Some(Active::Exchange(active)) = &mut self.active else {
            return;
        };
        active.exchange.close_response();
        self.abort_request();
        self.cleanup();
    }

    /// Offers the application a response window sized to what the network can still absorb.
    fn grant_response(&mut self) {
        let capacity = self.network.pool().slot_capacity();
        let unacknowledged = self.network.outbound.pending() as usize + self.network.buffered_output();

        let Some(Active::Exchange(active)) = &mut self.active else {
            return;
        };
        if active.exchange.response_state != ExchangeState::Open {
            return;
        }

        let window = &mut active.exchange.response;
        let maximum = u32::try_from(capacity).unwrap_or(u32::MAX);
        let credit = capacity.saturating_sub(unacknowledged) as u64;
        let acknowledge = (window.sequence + credit).saturating_sub(u64::from(maximum)).min(window.sequence);
        let acknowledge = acknowledge.max(window.acknowledge);
        let padding = if active.framing.is_chunked() { CHUNK_PADDING } else { 0 };

        if acknowledge > window.acknowledge || maximum > window.maximum || padding != window.padding {
            window.grant(acknowledge, maximum);
            window.padding = padding;
            let header = active.exchange.response_header();
            self.app.window(header, 0, padding);
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        if let Err(error) = self.network.write(self.trace_id, bytes) {
            warn!(%error, "http/1.1 encode slot overflow");
            self.abort_exchange();
            self.cleanup();
        }
    }

    fn end_request(&mut self, trailers: HeaderList) {
        let Some(Active::Exchange(active)) = &mut self.active else {
            return;
        };
        if active.exchange.is_request_closed() {
            return;
        }

        let header = active.exchange.request_header();
        let extension = if trailers.is_empty() { HttpExtension::Empty } else { HttpExtension::Headers(trailers) };
        self.app.end(header, extension);
        active.exchange.close_request();
        self.finish(false);
    }

    /// Drops the active exchange once both sides are closed.
    ///
    /// With `discard` the response is complete but request body bytes are
    /// still to come, they are consumed and dropped.
    fn finish(&mut self, discard: bool) {
        let finished = matches!(&self.active, Some(Active::Exchange(active)) if active.exchange.is_response_closed()
            && (active.exchange.is_request_closed() || discard));
        if !finished {
            return;
        }

        if let Some(Active::Exchange(mut active)) = self.active.take() {
            active.session.cancel(&self.context.signals);
            self.events.closed.push(active.exchange.request_id);
            debug!(stream_id = active.exchange.request_id, "http/1.1 exchange finished");

            if discard {
                if !active.exchange.is_request_closed() {
                    self.app.abort(active.exchange.request_header());
                }
                self.active = Some(Active::Discard);
            }
        }

        if self.closing {
            self.network.end(self.trace_id);
        } else {
            // a pipelined request may already wait in the decode slot
            self.decode_buffered();
        }
    }

    fn abort_request(&mut self) {
        if let Some(Active::Exchange(active)) = &mut self.active {
            if !active.exchange.is_request_closed() {
                self.app.abort(active.exchange.request_header());
                active.exchange.close_request();
            }
        }
    }

    /// Tears down the application side of the active exchange.
    fn abort_exchange(&mut self) {
        let Some(Active::Exchange(mut active)) = self.active.take() else {
            self.active = None;
            return;
        };

        if !active.exchange.is_request_closed() {
            self.app.abort(active.exchange.request_header());
        }
        if !active.exchange.is_response_closed() {
            self.app.reset(active.exchange.response_header(), HttpExtension::Empty);
        }
        active.session.cancel(&self.context.signals);
        self.events.closed.push(active.exchange.request_id);
    }

    /// Writes the literal error response and closes once it is flushed.
    fn fail(&mut self, error: Http1Error) {
        debug!(status = error.status(), %error, "http/1.1 request rejected");
        self.closing = true;
        self.ignore_input = true;
        self.decoder.ignore();
        if let Err(error) = self.network.write(self.trace_id, error.response()) {
            warn!(%error, "http/1.1 error response dropped");
            self.network.abort(self.trace_id);
        }
        self.network.end(self.trace_id);
    }

    fn cleanup(&mut self) {
        self.closing = true;
        self.ignore_input = true;
        self.decoder.ignore();
        self.network.close(self.trace_id);
    }

    /// Answers a CORS preflight without involving the application.
    fn respond_preflight(&mut self, policy: Vec<(String, String)>) {
        let mut headers: HeaderList = [(":status", "204")].into_iter().collect();
        headers.extend(policy);
        if let Some(server) = &self.binding.config().server_header {
            headers.set("server", server.clone());
        }
        let mut head = Vec::new();
        encode_response_head(&mut head, &headers);
        self.write(&head);
    }

    fn request_headers(&self, head: &[u8], line_end: usize, method: &str, target: &str) -> Result<Request, Http1Error> {
        let uri: Uri = target.parse().map_err(|_| Http1Error::BadRequest)?;
        let scheme = if self.network.transport.secure { "https" } else { "http" };

        let mut request = Request::default();
        let mut fields = HeaderList::with_capacity(16);
        let mut host = None;
        let mut framing = None;

        for (_, line) in Lines::new(head, line_end + CRLF.len()) {
            let (name, value) = match parse_header_line(line) {
                HeaderLine::Field { name, value } => (name.to_ascii_lowercase(), value),
                HeaderLine::Folded => return Err(Http1Error::ObsoleteLineFolding),
                HeaderLine::Invalid => return Err(Http1Error::BadRequest),
            };

            match name.as_str() {
                "host" => {
                    ensure!(host.is_none(), Http1Error::BadRequest);
                    host = Some(value.to_string());
                    continue;
                }
                "content-length" => {
                    ensure!(framing.is_none(), Http1Error::BadRequest);
                    let length = value.parse::<u64>().map_err(|_| Http1Error::BadRequest)?;
                    framing = Some(BodyMode::Content(length));
                }
                "transfer-encoding" => {
                    ensure!(framing.is_none(), Http1Error::BadRequest);
                    ensure!(value.eq_ignore_ascii_case("chunked"), Http1Error::UnsupportedTransferEncoding);
                    framing = Some(BodyMode::Chunked);
                }
                "connection" if is_connection_close(value) => request.close = true,
                "upgrade" => request.upgrade = true,
                "expect" if value.eq_ignore_ascii_case("100-continue") => request.expect_continue = true,
                _ => {}
            }
            fields.push(name, value);
        }

        let authority = match uri.authority() {
            Some(authority) => authority.as_str().to_string(),
            None => status::authority_with_port(&host.ok_or(Http1Error::BadRequest)?, scheme),
        };
        ensure!(!authority.contains('@'), Http1Error::BadRequest);

        let path = match uri.path_and_query() {
            Some(path) => path.as_str(),
            None if method == "CONNECT" => target,
            None => "/",
        };

        let mut headers = HeaderList::with_capacity(fields.len() + 4);
        headers.push(":method", method);
        headers.push(":scheme", scheme);
        headers.push(":authority", authority);
        headers.push(":path", path);
        headers.extend(fields.into_vec());

        request.mode = if request.upgrade { BodyMode::Upgraded } else { framing.unwrap_or(BodyMode::Empty) };
        request.headers = headers;
        Ok(request)
    }
}

#[derive(Debug, Default)]
struct Request {
    headers: HeaderList,
    mode: BodyMode,
    close: bool,
    upgrade: bool,
    expect_continue: bool,
}

impl Http1Sink for Http1Server {
    fn is_ready(&self) -> bool {
        self.active.is_none() && !self.closing
    }

    fn on_partial_head(&mut self, head: &[u8]) -> Result<(), Http1Error> {
        if PREFACE_LINE.starts_with(head) || head.starts_with(PREFACE_LINE) {
            return Ok(());
        }

        let maximum_method_length = *status::MAXIMUM_METHOD_LENGTH;
        match head.iter().position(|b| *b == b' ') {
            Some(end) => ensure!(status::is_supported_method(&head[..end]), Http1Error::MethodNotImplemented),
            None if head.len() > maximum_method_length => return Err(Http1Error::BadRequest),
            None => ensure!(
                status::SUPPORTED_METHODS.iter().any(|method| method.starts_with(head)),
                Http1Error::MethodNotImplemented
            ),
        }

        let head_limit = self.binding.config().head_limit(self.network.pool().slot_capacity());
        ensure!(index_of(head, CRLF).is_some() || head.len() < head_limit, Http1Error::UriTooLong);
        Ok(())
    }

    fn on_head(&mut self, head: &[u8]) -> Result<HeadOutcome, Http1Error> {
        let line_end = index_of(head, CRLF).ok_or(Http1Error::BadRequest)?;
        let line = parse_request_line(&head[..line_end]).ok_or(Http1Error::BadRequest)?;

        if line.method == "PRI" && line.target == "*" && line.version == "HTTP/2.0" {
            ensure!(self.binding.config().supports(HttpVersion::Http2), Http1Error::VersionNotSupported);
            debug!(stream_id = self.network.inbound_id, "http/1.1 delegating to http/2");
            return Ok(HeadOutcome::Delegate);
        }

        ensure!(is_http1_version(line.version), Http1Error::VersionNotSupported);
        ensure!(self.binding.config().supports(HttpVersion::Http11), Http1Error::VersionNotSupported);
        ensure!(status::is_supported_method(line.method.as_bytes()), Http1Error::MethodNotImplemented);

        let request = self.request_headers(head, line_end, line.method, line.target)?;
        let mode = request.mode;
        let mut headers = request.headers;
        if request.close {
            self.closing = true;
        }

        let mut response_headers = Vec::new();
        if let Some(access_control) = self.binding.collaborators.access_control.clone() {
            if access_control.is_preflight(&headers) {
                let policy = access_control.preflight_headers(&headers).ok_or(Http1Error::Forbidden)?;
                self.respond_preflight(policy);
                self.active = Some(Active::Discard);
                return Ok(HeadOutcome::Message(mode));
            }
            ensure!(access_control.allow_request(&headers), Http1Error::Forbidden);
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
            self.network.authorization,
        );

        let Some(route) = self.binding.resolve(authorized.authorization, &headers) else {
            return Err(if authorized.guarded && authorized.authorization == 0 {
                Http1Error::Unauthorized
            } else {
                Http1Error::NotFound
            });
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

        let head_request = headers.get(":method") == Some("HEAD");
        let exchange = Exchange::accept(request_id, authorized.authorization, self.trace_id);
        debug!(stream_id = request_id, route_id = route.id, mode = ?mode, "http/1.1 request");

        self.app.begin(exchange.request_header(), self.network.affinity, HttpExtension::Headers(headers));
        self.events.opened.push(request_id);

        self.active = Some(Active::Exchange(Box::new(Http1Exchange {
            exchange,
            session,
            head_request,
            upgrade: mode == BodyMode::Upgraded,
            expect_continue: request.expect_continue,
            has_body: !matches!(mode, BodyMode::Empty | BodyMode::Content(0)),
            request_ended: false,
            deferred_end: None,
            response_headers,
            framing: Framing::Empty,
        })));

        Ok(HeadOutcome::Message(mode))
    }

    fn on_body(&mut self, body: &[u8]) -> usize {
        let validator = self.binding.collaborators.validator.clone();
        let active = match &mut self.active {
            Some(Active::Exchange(active)) if !active.exchange.is_request_closed() => active,
            _ => return body.len(),
        };

        let window = &mut active.exchange.request;
        let length = window.writable().min(body.len());
        if length == 0 {
            return 0;
        }

        let payload = &body[..length];
        if validator.is_some_and(|validator| !validator.validate(payload)) {
            self.reject_content();
            return body.len();
        }

        let reserved = length as u32 + window.padding;
        let header = active.exchange.request_header();
        self.app.data(header, flags::COMPLETE, 0, reserved, Bytes::copy_from_slice(payload), HttpExtension::Empty);
        active.exchange.request.advance(reserved);
        length
    }

    fn on_end(&mut self, trailers: HeaderList) {
        match &mut self.active {
            Some(Active::Discard) => {
                self.active = None;
                if self.closing {
                    self.network.end(self.trace_id);
                }
            }
            Some(Active::Exchange(active)) => {
                active.request_ended = true;
                if active.exchange.request_state == ExchangeState::Pending {
                    active.deferred_end = Some(trailers);
                } else {
                    self.end_request(trailers);
                }
            }
            None => {}
        }
    }

    fn on_error(&mut self, error: Http1Error) {
        let response_open = matches!(&self.active, Some(Active::Exchange(active))
            if active.exchange.response_state != ExchangeState::Pending);

        self.abort_exchange();
        if response_open {
            self.cleanup();
        } else {
            self.fail(error);
        }
    }
}

impl Http1Server {
    /// The validator refused request content: the request is aborted and,
    /// unless the response already started, answered with 400.
    fn reject_content(&mut self) {
        let Some(Active::Exchange(active)) = &self.active else {
            return;
        };
        let response_pending = active.exchange.response_state == ExchangeState::Pending;
        let request_ended = active.request_ended;
        debug!(stream_id = active.exchange.request_id, "http/1.1 request content rejected");

        self.abort_exchange();
        if response_pending {
            self.write(INVALID_CONTENT_RESPONSE);
            self.active = (!request_ended).then_some(Active::Discard);
        } else {
            self.cleanup();
        }
    }
}
