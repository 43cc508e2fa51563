//! SSE client: application streams out, decoded events back.
//!
//! Each application stream opened with an [`SseExtension::Begin`] becomes a
//! `GET` request toward an HTTP client gateway. A `200` response is decoded
//! event by event into application `Data` frames. Anything else refuses the
//! application stream.
//!
//! The HTTP response window never exceeds one slot. Bytes the application
//! has no window for stay undecoded in that slot and are acknowledged only
//! once their events are delivered.

use std::collections::HashMap;

use bytes::Bytes;
use micro_fabric::{BeginFrame, BufferPool, Context, DataFrame, Frame, Outbox, Slot, StreamIds, WindowFrame, flags};
use micro_http_gateway::exchange::{Exchange, ExchangeState};
use micro_http_gateway::protocol::{HeaderList, HttpExtension};
use tracing::{debug, trace, warn};

use crate::binding::SseBinding;
use crate::codec::{SseDecoder, SseEvent, SseSink};
use crate::error::SseError;
use crate::extension::{SseData, SseExtension};

#[derive(Debug)]
struct ClientStream {
    app: Exchange,
    http: Exchange,
    decoder: SseDecoder,
    /// Response bytes not decoded yet.
    pending: Option<Slot>,
    /// Id of an id only event, reported with the next event or the end of the stream.
    last_id: Option<String>,
    deferred_end: bool,
}

impl ClientStream {
    fn buffered(&self) -> usize {
        self.pending.as_ref().map_or(0, Slot::len)
    }

    fn buffer(&mut self, pool: &BufferPool, bytes: &[u8]) -> Result<(), SseError> {
        let slot = match &mut self.pending {
            Some(slot) => slot,
            None => self.pending.insert(pool.try_acquire(self.app.response_id)?),
        };
        slot.try_put(bytes)?;
        Ok(())
    }
}

/// Delivers decoded events as application `Data` frames within the application window.
struct EventSink<'a> {
    app: &'a mut Exchange,
    outbox: &'a mut Outbox<SseExtension>,
    last_id: &'a mut Option<String>,
    blocked: bool,
    error: Option<SseError>,
}

impl EventSink<'_> {
    fn reserved(&self, payload: usize) -> u32 {
        u32::try_from(payload).unwrap_or(u32::MAX).saturating_add(self.app.response.padding)
    }

    fn deliver(&mut self, reserved: u32, payload: Bytes, event: SseData) {
        trace!(stream_id = self.app.response_id, id = event.id, event_type = event.event_type, "sse event");
        self.outbox.data(self.app.response_header(), flags::COMPLETE, 0, reserved, payload, SseExtension::Data(event));
        self.app.response.advance(reserved);
    }
}

impl SseSink for EventSink<'_> {
    fn on_event(&mut self, event: SseEvent) -> bool {
        let SseEvent { id, event_type, data, retry } = event;
        if data.is_none() && event_type.is_none() {
            if let Some(id) = id {
                *self.last_id = Some(id);
            } else {
                trace!(stream_id = self.app.response_id, retry, "sse event without data ignored");
            }
            return true;
        }

        let payload = data.map(Bytes::from).unwrap_or_default();
        let reserved = self.reserved(payload.len());
        let held = self.last_id.is_some() && id.is_none();
        let required = i64::from(reserved) + if held { i64::from(self.reserved(0)) } else { 0 };
        if self.app.response.available() < required {
            self.blocked = true;
            return false;
        }

        if held {
            let reserved = self.reserved(0);
            let last_id = self.last_id.take();
            self.deliver(reserved, Bytes::new(), SseData { id: last_id, ..SseData::default() });
        } else if id.is_some() {
            *self.last_id = None;
        }
        self.deliver(reserved, payload, SseData { id, event_type, timestamp: 0 });
        true
    }

    fn on_error(&mut self, error: SseError) {
        self.error = Some(error);
    }
}

#[derive(Debug)]
pub struct SseClient {
    binding: SseBinding,
    context: Context,
    /// Keyed by the application request stream id.
    streams: HashMap<u64, ClientStream>,
    /// HTTP request stream id to application request stream id.
    routes: HashMap<u64, u64>,
    pub http: Outbox<HttpExtension>,
    pub application: Outbox<SseExtension>,
}

impl SseClient {
    pub fn new(binding: SseBinding, context: Context) -> Self {
        Self {
            binding,
            context,
            streams: HashMap::new(),
            routes: HashMap::new(),
            http: Outbox::new(),
            application: Outbox::new(),
        }
    }

    pub fn streams(&self) -> usize {
        self.streams.len()
    }

    /// Frames from the application.
    pub fn on_application(&mut self, frame: Frame<SseExtension>) {
        let stream_id = frame.stream_id();
        let app_id = if StreamIds::is_initial(stream_id) { stream_id } else { stream_id ^ 1 };

        if let Frame::Begin(begin) = frame {
            if StreamIds::is_initial(stream_id) && !self.streams.contains_key(&app_id) {
                self.on_open(begin);
            }
            return;
        }

        let Some(stream) = self.streams.get_mut(&app_id) else {
            trace!(stream_id, frame = frame.name(), "application frame for unknown sse stream");
            return;
        };

        match frame {
            Frame::Window(window) if stream_id == stream.app.response_id => self.on_app_window(app_id, &window),
            Frame::End(_) | Frame::Data(_) if stream_id == app_id => {
                trace!(stream_id, "sse request stream closed");
                stream.app.close_request();
            }
            Frame::Abort(_) if stream_id == app_id => {
                debug!(stream_id, "sse stream aborted by application");
                stream.app.close_request();
                self.abort(app_id);
            }
            Frame::Reset(_) if stream_id == stream.app.response_id => {
                debug!(stream_id, "sse stream reset by application");
                stream.app.close_response();
                self.abort(app_id);
            }
            frame => trace!(stream_id, frame = frame.name(), "sse application frame ignored"),
        }
        self.release(app_id);
    }

    fn on_open(&mut self, begin: BeginFrame<SseExtension>) {
        let header = begin.header;
        let mut app = Exchange::accept(header.stream_id, header.authorization, header.trace_id);
        let target = begin.extension.begin().cloned().unwrap_or_default();

        let mut headers: HeaderList = [
            (":method", "GET"),
            (":scheme", target.scheme.as_deref().unwrap_or("http")),
            (":authority", target.authority.as_deref().unwrap_or_default()),
            (":path", if target.path.is_empty() { "/" } else { target.path.as_str() }),
            ("accept", mime::TEXT_EVENT_STREAM.as_ref()),
        ]
        .into_iter()
        .collect();
        if let Some(id) = &target.last_event_id {
            headers.push("last-event-id", id.as_str());
        }

        let Some(route) = self.binding.resolve(header.authorization, &headers) else {
            debug!(stream_id = header.stream_id, path = target.path, "sse stream has no route");
            self.application.reset(app.request_header(), SseExtension::Empty);
            return;
        };
        for (name, value) in &route.overrides {
            headers.set(name, value.as_str());
        }

        self.application.window(app.request_header(), 0, 0);
        app.request_state = ExchangeState::Open;

        let mut http = Exchange::initiate(&self.context.ids, header.authorization, header.trace_id);
        debug!(stream_id = header.stream_id, http_stream_id = http.request_id, route_id = route.id, "sse request");
        self.http.begin(http.request_header(), begin.affinity, HttpExtension::Headers(headers));
        self.http.end(http.request_header(), HttpExtension::Empty);
        http.close_request();

        self.routes.insert(http.request_id, app.request_id);
        self.streams.insert(
            app.request_id,
            ClientStream {
                app,
                http,
                decoder: SseDecoder::new(self.context.pool.slot_capacity()),
                pending: None,
                last_id: None,
                deferred_end: false,
            },
        );
    }

    /// Frames from the HTTP client gateway.
    pub fn on_http(&mut self, frame: Frame<HttpExtension>) {
        let stream_id = frame.stream_id();
        let request_id = if StreamIds::is_initial(stream_id) { stream_id } else { stream_id ^ 1 };
        let Some(&app_id) = self.routes.get(&request_id) else {
            trace!(stream_id, frame = frame.name(), "http frame for unknown sse stream");
            return;
        };
        let Some(stream) = self.streams.get_mut(&app_id) else {
            return;
        };
        let response_id = stream.http.response_id;

        match frame {
            Frame::Begin(begin) if stream_id == response_id => {
                let status = begin.extension.headers().and_then(HeaderList::status);
                if status != Some(200) {
                    debug!(stream_id, status, "sse response refused");
                    stream.http.response_state = ExchangeState::Open;
                    self.abort(app_id);
                } else {
                    stream.http.response_state = ExchangeState::Open;
                    stream.app.response_state = ExchangeState::Open;
                    self.application.begin(stream.app.response_header(), begin.affinity, SseExtension::Empty);
                    self.acknowledge(app_id);
                }
            }
            Frame::Data(data) if stream_id == response_id => self.on_http_data(app_id, &data),
            Frame::End(_) if stream_id == response_id => {
                stream.http.close_response();
                stream.deferred_end = true;
                self.decode(app_id);
            }
            Frame::Abort(_) if stream_id == response_id => {
                debug!(stream_id, "sse response aborted");
                stream.http.close_response();
                self.abort(app_id);
            }
            Frame::Reset(_) if stream_id == request_id => {
                debug!(stream_id, "sse request reset");
                stream.http.close_response();
                self.abort(app_id);
            }
            frame => trace!(stream_id, frame = frame.name(), "sse http frame ignored"),
        }
        self.release(app_id);
    }

    fn on_http_data(&mut self, app_id: u64, data: &DataFrame<HttpExtension>) {
        let Some(stream) = self.streams.get_mut(&app_id) else {
            return;
        };

        if stream.http.response.receive(data.header.sequence, data.reserved).is_err() {
            warn!(stream_id = data.header.stream_id, "sse response window violated");
            self.abort(app_id);
            return;
        }

        if let Err(error) = stream.buffer(&self.context.pool, &data.payload) {
            warn!(stream_id = data.header.stream_id, %error, "sse response dropped");
            self.abort(app_id);
            return;
        }
        self.decode(app_id);
    }

    fn on_app_window(&mut self, app_id: u64, window: &WindowFrame) {
        let Some(stream) = self.streams.get_mut(&app_id) else {
            return;
        };

        let header = &window.header;
        if stream.app.response.observe(header.acknowledge, header.maximum, window.padding).is_err() {
            warn!(stream_id = header.stream_id, "sse application window regressed");
            self.abort(app_id);
            return;
        }
        self.decode(app_id);
    }

    /// Delivers buffered events the application has room for, then acknowledges or ends.
    fn decode(&mut self, app_id: u64) {
        let Some(stream) = self.streams.get_mut(&app_id) else {
            return;
        };
        if stream.app.response_state != ExchangeState::Open {
            return;
        }

        let mut blocked = false;
        if let Some(slot) = &mut stream.pending {
            let mut sink =
                EventSink { app: &mut stream.app, outbox: &mut self.application, last_id: &mut stream.last_id, blocked: false, error: None };
            let consumed = stream.decoder.decode(&mut sink, slot.as_slice());
            slot.consume(consumed);
            blocked = sink.blocked;

            if let Some(error) = sink.error {
                warn!(stream_id = app_id, %error, "sse response undecodable");
                self.abort(app_id);
                return;
            }
        }
        if stream.pending.as_ref().is_some_and(Slot::is_empty) {
            stream.pending = None;
        }

        if stream.deferred_end && !blocked {
            if stream.pending.take().is_some() {
                debug!(stream_id = app_id, "sse response ended inside an event");
            }
            let last_id = stream.last_id.take();
            trace!(stream_id = app_id, last_id, "sse stream end");
            self.application.end(stream.app.response_header(), SseExtension::End(last_id));
            stream.app.close_response();
            stream.deferred_end = false;
            return;
        }
        self.acknowledge(app_id);
    }

    /// Grants the HTTP response window up to one slot of undecoded bytes.
    fn acknowledge(&mut self, app_id: u64) {
        let Some(stream) = self.streams.get_mut(&app_id) else {
            return;
        };
        if stream.http.is_response_closed() {
            return;
        }

        let buffered = stream.buffered() as u64;
        let maximum = u32::try_from(self.context.pool.slot_capacity()).unwrap_or(u32::MAX);
        let window = &mut stream.http.response;
        let acknowledge = window.sequence.saturating_sub(buffered).max(window.acknowledge);

        if acknowledge > window.acknowledge || maximum != window.maximum {
            window.grant(acknowledge, maximum);
            self.http.window(stream.http.response_header(), 0, 0);
        }
    }

    /// Tears both sides down after a failure on either.
    fn abort(&mut self, app_id: u64) {
        let Some(stream) = self.streams.get_mut(&app_id) else {
            return;
        };

        match stream.app.response_state {
            ExchangeState::Pending => self.application.reset(stream.app.request_header(), SseExtension::Empty),
            ExchangeState::Open => self.application.abort(stream.app.response_header()),
            ExchangeState::Closed => {}
        }
        stream.app.close_response();
        stream.app.close_request();

        if !stream.http.is_response_closed() {
            self.http.reset(stream.http.response_header(), HttpExtension::Empty);
            stream.http.close_response();
        }
        stream.pending = None;
    }

    /// Drops a stream once both responses are closed.
    fn release(&mut self, app_id: u64) {
        let Some(stream) = self.streams.get(&app_id) else {
            return;
        };
        if !stream.app.is_response_closed() || !stream.http.is_response_closed() {
            return;
        }

        let request_id = stream.http.request_id;
        trace!(stream_id = app_id, "sse stream released");
        self.streams.remove(&app_id);
        self.routes.remove(&request_id);
    }
}
