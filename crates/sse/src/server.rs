//! SSE server: HTTP requests in, event streams toward the application.
//!
//! [`SseServer`] sits on the application side of an HTTP gateway. Each `GET`
//! request becomes an application stream opened with an
//! [`SseExtension::Begin`]. The application answers on the reply stream and
//! every `Data` frame is encoded as one event, or one event fragment, into
//! the HTTP response body.
//!
//! Encoded bytes wait in a pooled slot until the HTTP response window admits
//! them. The application is granted the HTTP response window widened by the
//! event field overhead, so a well behaved application never outruns the
//! slot.

use std::collections::HashMap;

use bytes::Bytes;
use micro_fabric::{BeginFrame, BufferPool, ChallengeFrame, Context, DataFrame, Frame, Outbox, Slot, StreamIds, WindowFrame, flags};
use micro_http_gateway::exchange::{Exchange, ExchangeState};
use micro_http_gateway::protocol::{HeaderList, HttpExtension};
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

use crate::binding::SseBinding;
use crate::codec::{EventFields, MAXIMUM_HEADER_SIZE, encode_event};
use crate::config::SseConfig;
use crate::error::SseError;
use crate::extension::{SseBegin, SseExtension};

const EVENT_STREAM_TIMESTAMP: &str = "text/event-stream;ext=timestamp";

#[derive(Debug)]
struct ServerStream {
    http: Exchange,
    app: Exchange,
    affinity: u64,
    timestamps: bool,
    /// Encoded bytes waiting for the HTTP response window.
    pending: Option<Slot>,
    deferred_end: bool,
}

impl ServerStream {
    fn buffered(&self) -> usize {
        self.pending.as_ref().map_or(0, Slot::len)
    }

    fn buffer(&mut self, pool: &BufferPool, bytes: &[u8]) -> Result<(), SseError> {
        let slot = match &mut self.pending {
            Some(slot) => slot,
            None => self.pending.insert(pool.try_acquire(self.http.response_id)?),
        };
        slot.try_put(bytes)?;
        Ok(())
    }
}

/// The path and last event id of an event stream request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamRequest {
    path: String,
    last_event_id: Option<String>,
}

impl StreamRequest {
    /// The `last-event-id` header wins over the `lastEventId` query parameter,
    /// which is removed from the path either way.
    fn parse(headers: &HeaderList, config: &SseConfig) -> Result<Self, SseError> {
        let (path, query_id) = split_last_event_id(headers.get(":path").unwrap_or("/"));
        let last_event_id = headers.get("last-event-id").map(str::to_string).or(query_id);

        if let Some(id) = &last_event_id
            && id.len() > config.maximum_last_event_id_size
        {
            return Err(SseError::LastEventIdTooLong { length: id.len(), maximum: config.maximum_last_event_id_size });
        }
        Ok(Self { path, last_event_id })
    }
}

fn split_last_event_id(target: &str) -> (String, Option<String>) {
    let Some((path, query)) = target.split_once('?') else {
        return (target.to_string(), None);
    };

    let mut last_event_id = None;
    let kept: Vec<&str> = query
        .split('&')
        .filter(|param| {
            if !param.starts_with("lastEventId=") {
                return true;
            }
            if last_event_id.is_none() {
                last_event_id = serde_urlencoded::from_str::<Vec<(String, String)>>(param)
                    .ok()
                    .and_then(|pairs| pairs.into_iter().next())
                    .map(|(_, value)| value);
            }
            false
        })
        .collect();

    if kept.is_empty() { (path.to_string(), last_event_id) } else { (format!("{path}?{}", kept.join("&")), last_event_id) }
}

/// `{"method": .., "headers": {..}}` of a challenge, pseudo headers other than `:method` are left out.
fn challenge_json(headers: &HeaderList) -> String {
    let mut properties = Map::new();
    let mut object = Map::new();
    for (name, value) in headers.iter() {
        if name == ":method" {
            object.insert("method".to_string(), Value::from(value));
        } else if !name.starts_with(':') {
            properties.insert(name.to_string(), Value::from(value));
        }
    }
    object.insert("headers".to_string(), Value::Object(properties));
    Value::Object(object).to_string()
}

#[derive(Debug)]
pub struct SseServer {
    binding: SseBinding,
    context: Context,
    /// Keyed by the HTTP request stream id.
    streams: HashMap<u64, ServerStream>,
    /// Application request stream id to HTTP request stream id.
    routes: HashMap<u64, u64>,
    pub http: Outbox<HttpExtension>,
    pub application: Outbox<SseExtension>,
}

impl SseServer {
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

    /// Frames from the HTTP gateway.
    pub fn on_http(&mut self, frame: Frame<HttpExtension>) {
        let stream_id = frame.stream_id();
        let request_id = if StreamIds::is_initial(stream_id) { stream_id } else { stream_id ^ 1 };

        if let Frame::Begin(begin) = frame {
            if StreamIds::is_initial(stream_id) && !self.streams.contains_key(&request_id) {
                self.on_request(begin);
            }
            return;
        }

        let Some(stream) = self.streams.get_mut(&request_id) else {
            trace!(stream_id, frame = frame.name(), "http frame for unknown sse stream");
            return;
        };

        match frame {
            Frame::Data(_) => {
                debug!(stream_id, "sse request body rejected");
                self.http.reset(stream.http.request_header(), HttpExtension::Empty);
                stream.http.close_request();
                if !stream.app.is_request_closed() {
                    self.application.abort(stream.app.request_header());
                    stream.app.close_request();
                }
            }
            Frame::End(_) => {
                stream.http.close_request();
                if !stream.app.is_request_closed() {
                    self.application.end(stream.app.request_header(), SseExtension::Empty);
                    stream.app.close_request();
                }
            }
            Frame::Abort(_) => {
                stream.http.close_request();
                if !stream.app.is_request_closed() {
                    self.application.abort(stream.app.request_header());
                    stream.app.close_request();
                }
            }
            Frame::Window(window) => self.on_response_window(request_id, &window),
            Frame::Reset(_) => {
                debug!(stream_id, "sse response reset");
                stream.http.close_response();
                stream.http.close_request();
                if !stream.app.is_response_closed() {
                    self.application.reset(stream.app.response_header(), SseExtension::Empty);
                    stream.app.close_response();
                }
            }
            Frame::Challenge(challenge) => self.on_challenge(request_id, &challenge),
            frame => trace!(stream_id, frame = frame.name(), "sse http frame ignored"),
        }
        self.release(request_id);
    }

    fn on_request(&mut self, begin: BeginFrame<HttpExtension>) {
        let header = begin.header;
        let headers = begin.extension.into_headers();
        let http = Exchange::accept(header.stream_id, header.authorization, header.trace_id);
        self.http.window(http.request_header(), 0, 0);

        if headers.get(":method") != Some("GET") {
            debug!(stream_id = header.stream_id, method = headers.get(":method"), "sse request method not allowed");
            self.respond(&http, begin.affinity, 405);
            return;
        }

        let request = match StreamRequest::parse(&headers, self.binding.config()) {
            Ok(request) => request,
            Err(error) => {
                debug!(stream_id = header.stream_id, %error, "sse request rejected");
                self.respond(&http, begin.affinity, 400);
                return;
            }
        };

        let mut lookup = headers.clone();
        lookup.set(":path", request.path.as_str());
        let Some(route) = self.binding.resolve(header.authorization, &lookup) else {
            debug!(stream_id = header.stream_id, path = request.path, "sse request has no route");
            self.respond(&http, begin.affinity, 404);
            return;
        };

        let app = Exchange::initiate(&self.context.ids, header.authorization, header.trace_id);
        debug!(
            stream_id = header.stream_id,
            app_stream_id = app.request_id,
            route_id = route.id,
            path = request.path,
            last_event_id = request.last_event_id,
            "sse stream opened"
        );

        let extension = SseExtension::Begin(SseBegin {
            scheme: headers.get(":scheme").map(str::to_string),
            authority: headers.get(":authority").map(str::to_string),
            path: request.path,
            last_event_id: request.last_event_id,
        });
        self.application.begin(app.request_header(), begin.affinity, extension);

        let timestamps = headers.get("accept").is_some_and(|accept| accept.contains("ext=timestamp"));
        self.routes.insert(app.request_id, http.request_id);
        self.streams.insert(
            http.request_id,
            ServerStream { http, app, affinity: begin.affinity, timestamps, pending: None, deferred_end: false },
        );
    }

    /// Answers a request locally with an empty `status` response.
    fn respond(&mut self, http: &Exchange, affinity: u64, status: u16) {
        let headers: HeaderList = [(":status", status.to_string()), ("content-length", "0".to_string())].into_iter().collect();
        self.http.begin(http.response_header(), affinity, HttpExtension::Headers(headers));
        self.http.end(http.response_header(), HttpExtension::Empty);
    }

    /// Frames from the application.
    pub fn on_application(&mut self, frame: Frame<SseExtension>) {
        let stream_id = frame.stream_id();
        let app_request_id = if StreamIds::is_initial(stream_id) { stream_id } else { stream_id ^ 1 };
        let Some(&request_id) = self.routes.get(&app_request_id) else {
            trace!(stream_id, frame = frame.name(), "application frame for unknown sse stream");
            return;
        };
        let Some(stream) = self.streams.get_mut(&request_id) else {
            return;
        };
        let response_id = stream.app.response_id;

        match frame {
            Frame::Begin(_) if stream_id == response_id => self.on_app_begin(request_id),
            Frame::Data(data) if stream_id == response_id => self.on_app_data(request_id, &data),
            Frame::End(end) if stream_id == response_id => self.on_app_end(request_id, end.extension.end_id()),
            Frame::Abort(_) if stream_id == response_id => {
                stream.app.close_response();
                self.abort(request_id);
            }
            Frame::Reset(_) if stream_id == app_request_id => {
                debug!(stream_id, "sse stream refused by application");
                stream.app.close_request();
                stream.app.close_response();
                if stream.http.response_state == ExchangeState::Pending {
                    self.http.reset(stream.http.request_header(), HttpExtension::Empty);
                    stream.http.close_request();
                    stream.http.close_response();
                } else {
                    self.abort(request_id);
                }
            }
            frame => trace!(stream_id, frame = frame.name(), "sse application frame ignored"),
        }
        self.release(request_id);
    }

    fn on_app_begin(&mut self, request_id: u64) {
        let Some(stream) = self.streams.get_mut(&request_id) else {
            return;
        };
        stream.app.response_state = ExchangeState::Open;
        stream.http.response_state = ExchangeState::Open;

        let content_type = if stream.timestamps { EVENT_STREAM_TIMESTAMP.to_string() } else { mime::TEXT_EVENT_STREAM.to_string() };
        let headers: HeaderList = [(":status", "200"), ("content-type", content_type.as_str())].into_iter().collect();
        self.http.begin(stream.http.response_header(), stream.affinity, HttpExtension::Headers(headers));

        let config = self.binding.config();
        if config.initial_comment.is_some() || config.retry.is_some() {
            let fields = EventFields { comment: config.initial_comment.as_deref(), retry: config.retry, ..Default::default() };
            let mut prelude = Vec::new();
            encode_event(&mut prelude, flags::COMPLETE, &fields, None);
            if let Err(error) = stream.buffer(&self.context.pool, &prelude) {
                warn!(stream_id = request_id, %error, "sse initial comment dropped");
            }
        }
        self.flush(request_id);
    }

    fn on_app_data(&mut self, request_id: u64, data: &DataFrame<SseExtension>) {
        let Some(stream) = self.streams.get_mut(&request_id) else {
            return;
        };

        if stream.app.response.receive(data.header.sequence, data.reserved).is_err() {
            warn!(stream_id = data.header.stream_id, "sse application window violated");
            self.application.reset(stream.app.response_header(), SseExtension::Empty);
            stream.app.close_response();
            self.abort(request_id);
            return;
        }

        let event = data.extension.data();
        let fields = EventFields {
            id: event.and_then(|event| event.id.as_deref()),
            event_type: event.and_then(|event| event.event_type.as_deref()),
            timestamp: if stream.timestamps { event.map_or(0, |event| event.timestamp) } else { 0 },
            ..Default::default()
        };
        let mut encoded = Vec::with_capacity(data.payload.len() + MAXIMUM_HEADER_SIZE as usize);
        encode_event(&mut encoded, data.flags, &fields, Some(&data.payload));

        if let Err(error) = stream.buffer(&self.context.pool, &encoded) {
            warn!(stream_id = data.header.stream_id, %error, "sse event dropped");
            self.application.reset(stream.app.response_header(), SseExtension::Empty);
            stream.app.close_response();
            self.abort(request_id);
            return;
        }
        self.flush(request_id);
    }

    fn on_app_end(&mut self, request_id: u64, last_id: Option<&str>) {
        let Some(stream) = self.streams.get_mut(&request_id) else {
            return;
        };
        stream.app.close_response();
        stream.deferred_end = true;

        if let Some(id) = last_id {
            let mut encoded = Vec::new();
            encode_event(&mut encoded, flags::COMPLETE, &EventFields { id: Some(id), ..Default::default() }, None);
            if let Err(error) = stream.buffer(&self.context.pool, &encoded) {
                warn!(stream_id = request_id, %error, "sse end id dropped");
                self.abort(request_id);
                return;
            }
        }
        self.flush(request_id);
    }

    fn on_response_window(&mut self, request_id: u64, window: &WindowFrame) {
        let Some(stream) = self.streams.get_mut(&request_id) else {
            return;
        };

        let header = &window.header;
        if stream.http.response.observe(header.acknowledge, header.maximum, window.padding).is_err() {
            warn!(stream_id = header.stream_id, "sse response window regressed");
            self.abort(request_id);
            return;
        }
        self.flush(request_id);
    }

    fn on_challenge(&mut self, request_id: u64, challenge: &ChallengeFrame<HttpExtension>) {
        let Some(stream) = self.streams.get_mut(&request_id) else {
            return;
        };
        let Some(headers) = challenge.extension.headers() else {
            return;
        };
        if stream.http.response_state != ExchangeState::Open {
            trace!(stream_id = challenge.header.stream_id, "sse challenge before response ignored");
            return;
        }

        let header = &challenge.header;
        let padding = stream.http.response.padding;
        if stream.http.response.observe(header.acknowledge, header.maximum, padding).is_err() {
            warn!(stream_id = header.stream_id, "sse challenge window regressed");
            self.abort(request_id);
            return;
        }

        let config = self.binding.config();
        let json = challenge_json(headers);
        let fields = EventFields { event_type: Some(config.challenge_event_type.as_str()), ..Default::default() };
        let mut encoded = Vec::new();
        encode_event(&mut encoded, flags::COMPLETE, &fields, Some(json.as_bytes()));
        debug!(stream_id = header.stream_id, "sse challenge event");

        if let Err(error) = stream.buffer(&self.context.pool, &encoded) {
            warn!(stream_id = header.stream_id, %error, "sse challenge dropped");
            self.abort(request_id);
            return;
        }
        self.flush(request_id);
    }

    /// Writes buffered events within the HTTP response window, then ends or re-grants the application.
    fn flush(&mut self, request_id: u64) {
        let Some(stream) = self.streams.get_mut(&request_id) else {
            return;
        };
        if stream.http.response_state != ExchangeState::Open {
            return;
        }

        if let Some(slot) = &mut stream.pending {
            while !slot.is_empty() {
                let writable = stream.http.response.writable();
                if writable == 0 {
                    break;
                }

                let length = writable.min(slot.len());
                let payload = Bytes::copy_from_slice(&slot.as_slice()[..length]);
                let reserved = u32::try_from(length).unwrap_or(u32::MAX) + stream.http.response.padding;
                self.http.data(stream.http.response_header(), flags::COMPLETE, 0, reserved, payload, HttpExtension::Empty);
                stream.http.response.advance(reserved);
                slot.consume(length);
            }
        }
        if stream.pending.as_ref().is_some_and(Slot::is_empty) {
            stream.pending = None;
        }

        if stream.deferred_end && stream.pending.is_none() {
            trace!(stream_id = stream.http.response_id, "sse response end");
            self.http.end(stream.http.response_header(), HttpExtension::Empty);
            stream.http.close_response();
            stream.deferred_end = false;
            return;
        }

        if stream.app.response_state != ExchangeState::Open {
            return;
        }
        let http = stream.http.response;
        let unacknowledged = http.pending() + stream.buffered() as u64;
        let window = &mut stream.app.response;
        let acknowledge = window.sequence.saturating_sub(unacknowledged).max(window.acknowledge);
        let padding = http.padding + MAXIMUM_HEADER_SIZE;

        if acknowledge > window.acknowledge || http.maximum > window.maximum || padding != window.padding {
            window.grant(acknowledge, http.maximum);
            window.padding = padding;
            self.application.window(stream.app.response_header(), 0, padding);
        }
    }

    /// Tears the response down after a failure on either side.
    fn abort(&mut self, request_id: u64) {
        let Some(stream) = self.streams.get_mut(&request_id) else {
            return;
        };

        if stream.http.response_state == ExchangeState::Open {
            self.http.abort(stream.http.response_header());
        } else if stream.http.response_state == ExchangeState::Pending {
            self.http.reset(stream.http.request_header(), HttpExtension::Empty);
        }
        stream.http.close_response();
        stream.http.close_request();
        stream.pending = None;

        if !stream.app.is_response_closed() {
            self.application.reset(stream.app.response_header(), SseExtension::Empty);
            stream.app.close_response();
        }
    }

    /// Drops a stream once both responses are closed.
    fn release(&mut self, request_id: u64) {
        let Some(stream) = self.streams.get_mut(&request_id) else {
            return;
        };
        if !stream.http.is_response_closed() || !stream.app.is_response_closed() {
            return;
        }

        if !stream.app.is_request_closed() {
            self.application.end(stream.app.request_header(), SseExtension::Empty);
            stream.app.close_request();
        }
        let app_request_id = stream.app.request_id;
        trace!(stream_id = request_id, "sse stream released");
        self.streams.remove(&request_id);
        self.routes.remove(&app_request_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use micro_fabric::{EndFrame, HeaderLookup, ResetFrame, Route, Signals, StreamHeader};
    use micro_http_gateway::exchange::challenge_request;

    use super::*;
    use crate::extension::SseData;

    fn events_route(_: u64, headers: &dyn HeaderLookup) -> Option<Route> {
        headers.header(":path").filter(|path| path.starts_with("/events")).map(|_| Route::new(7))
    }

    fn server_with(config: SseConfig) -> SseServer {
        let context = Context::new(1, BufferPool::new(1024, 8), Signals::manual());
        SseServer::new(SseBinding::new(Arc::new(events_route), config), context)
    }

    fn server() -> SseServer {
        server_with(SseConfig::default())
    }

    fn request(method: &str, path: &str, extra: &[(&str, &str)]) -> Frame<HttpExtension> {
        let mut headers: HeaderList =
            [(":method", method), (":scheme", "http"), (":authority", "example.com"), (":path", path)].into_iter().collect();
        headers.extend(extra.iter().copied());
        Frame::Begin(BeginFrame {
            header: StreamHeader { stream_id: 1, ..Default::default() },
            affinity: 0,
            extension: HttpExtension::Headers(headers),
        })
    }

    fn header(stream_id: u64) -> StreamHeader {
        StreamHeader { stream_id, ..Default::default() }
    }

    fn app_begin() -> Frame<SseExtension> {
        Frame::Begin(BeginFrame { header: header(2), affinity: 0, extension: SseExtension::Empty })
    }

    fn app_data(sequence: u64, payload: &str, event: SseData) -> Frame<SseExtension> {
        Frame::Data(DataFrame {
            header: StreamHeader { stream_id: 2, sequence, ..Default::default() },
            flags: flags::COMPLETE,
            budget_id: 0,
            reserved: payload.len() as u32 + MAXIMUM_HEADER_SIZE,
            payload: Bytes::copy_from_slice(payload.as_bytes()),
            extension: SseExtension::Data(event),
        })
    }

    fn http_window(maximum: u32) -> Frame<HttpExtension> {
        Frame::Window(WindowFrame { header: StreamHeader { stream_id: 0, maximum, ..Default::default() }, budget_id: 0, padding: 0 })
    }

    /// A server streaming the response of request 1 to application stream 3, with a 1024 byte response window.
    fn streaming(server: &mut SseServer) {
        server.on_http(request("GET", "/events", &[]));
        server.on_application(app_begin());
        server.on_http(http_window(1024));
        server.http.take();
        server.application.take();
    }

    fn body(server: &mut SseServer) -> String {
        server
            .http
            .take()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Data(data) => Some(String::from_utf8(data.payload.to_vec()).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn status_of(frame: &Frame<HttpExtension>) -> Option<u16> {
        match frame {
            Frame::Begin(begin) => begin.extension.headers().and_then(HeaderList::status),
            _ => None,
        }
    }

    #[test]
    fn test_stream_opened_with_query_last_event_id() {
        let mut server = server();
        server.on_http(request("GET", "/events?lastEventId=a%20b&x=1", &[]));

        let http = server.http.take();
        assert!(matches!(&http[..], [Frame::Window(window)] if window.header.stream_id == 1));

        let app = server.application.take();
        let [Frame::Begin(begin)] = &app[..] else { panic!("{app:?}") };
        assert_eq!(begin.header.stream_id, 3);
        assert_eq!(
            begin.extension.begin(),
            Some(&SseBegin {
                scheme: Some("http".to_string()),
                authority: Some("example.com".to_string()),
                path: "/events?x=1".to_string(),
                last_event_id: Some("a b".to_string()),
            })
        );
        assert_eq!(server.streams(), 1);
    }

    #[test]
    fn test_last_event_id_header_preferred() {
        let mut server = server();
        server.on_http(request("GET", "/events?lastEventId=old", &[("last-event-id", "new")]));

        let app = server.application.take();
        let [Frame::Begin(begin)] = &app[..] else { panic!("{app:?}") };
        let begin = begin.extension.begin().unwrap();
        assert_eq!(begin.path, "/events");
        assert_eq!(begin.last_event_id.as_deref(), Some("new"));
    }

    #[test]
    fn test_rejected_requests() {
        let long_id = "x".repeat(255);
        let cases = [
            (request("POST", "/events", &[]), 405),
            (request("GET", "/events", &[("last-event-id", long_id.as_str())]), 400),
            (request("GET", "/missing", &[]), 404),
        ];

        for (frame, status) in cases {
            let mut server = server();
            server.on_http(frame);

            let http = server.http.take();
            assert_eq!(http.len(), 3, "{http:?}");
            assert_eq!(status_of(&http[1]), Some(status));
            assert!(matches!(&http[2], Frame::End(end) if end.header.stream_id == 0));
            assert!(server.application.is_empty());
            assert_eq!(server.streams(), 0);
        }
    }

    #[test]
    fn test_response_begins_event_stream() {
        let mut server = server();
        server.on_http(request("GET", "/events", &[]));
        server.http.take();
        server.on_application(app_begin());

        let http = server.http.take();
        let [Frame::Begin(begin)] = &http[..] else { panic!("{http:?}") };
        let headers = begin.extension.headers().unwrap();
        assert_eq!(headers.status(), Some(200));
        assert_eq!(headers.get("content-type"), Some("text/event-stream"));
    }

    #[test]
    fn test_application_window_follows_response_window() {
        let mut server = server();
        server.on_http(request("GET", "/events", &[]));
        server.on_application(app_begin());
        server.application.take();
        server.on_http(http_window(1024));

        let app = server.application.take();
        let [Frame::Window(window)] = &app[..] else { panic!("{app:?}") };
        assert_eq!(window.header.stream_id, 2);
        assert_eq!(window.header.maximum, 1024);
        assert_eq!(window.padding, MAXIMUM_HEADER_SIZE);
    }

    #[test]
    fn test_events_encoded() {
        let mut server = server();
        streaming(&mut server);

        let event = SseData { id: Some("1".to_string()), event_type: Some("tick".to_string()), timestamp: 0 };
        server.on_application(app_data(0, "hello\nworld", event));
        assert_eq!(body(&mut server), "id:1\nevent:tick\ndata:hello\ndata:world\n\n");

        let app = server.application.take();
        let [Frame::Window(window)] = &app[..] else { panic!("{app:?}") };
        assert!(window.header.acknowledge > 0);
    }

    #[test]
    fn test_end_with_last_id() {
        let mut server = server();
        streaming(&mut server);

        server.on_application(Frame::End(EndFrame { header: header(2), extension: SseExtension::End(Some("9".to_string())) }));

        let http = server.http.take();
        assert_eq!(http.len(), 2, "{http:?}");
        assert!(matches!(&http[0], Frame::Data(data) if data.payload.as_ref() == b"id:9\n\n"));
        assert!(matches!(&http[1], Frame::End(end) if end.header.stream_id == 0));

        let app = server.application.take();
        assert!(matches!(&app[..], [Frame::End(end)] if end.header.stream_id == 3));
        assert_eq!(server.streams(), 0);
    }

    #[test]
    fn test_end_deferred_until_window() {
        let mut server = server();
        server.on_http(request("GET", "/events", &[]));
        server.on_application(app_begin());
        server.http.take();

        server.on_application(Frame::End(EndFrame { header: header(2), extension: SseExtension::End(Some("9".to_string())) }));
        assert!(server.http.is_empty());

        server.on_http(http_window(64));
        let http = server.http.take();
        assert!(matches!(&http[..], [Frame::Data(_), Frame::End(_)]), "{http:?}");
    }

    #[test]
    fn test_initial_comment_and_retry() {
        let mut server = server_with(SseConfig { initial_comment: Some("hi".to_string()), retry: Some(1000), ..SseConfig::default() });
        server.on_http(request("GET", "/events", &[]));
        server.on_application(app_begin());
        server.http.take();
        server.on_http(http_window(1024));

        assert_eq!(body(&mut server), ":hi\nretry:1000\n\n");
    }

    #[test]
    fn test_timestamps_negotiated() {
        let mut server = server();
        server.on_http(request("GET", "/events", &[("accept", "text/event-stream;ext=timestamp")]));
        server.on_application(app_begin());

        let http = server.http.take();
        let begin = http.iter().find_map(|frame| match frame {
            Frame::Begin(begin) => begin.extension.headers(),
            _ => None,
        });
        assert_eq!(begin.and_then(|headers| headers.get("content-type")), Some("text/event-stream;ext=timestamp"));

        server.on_http(http_window(1024));
        server.on_application(app_data(0, "x", SseData { timestamp: 0x10, ..SseData::default() }));
        assert_eq!(body(&mut server), "timestamp:0x10\ndata:x\n\n");
    }

    #[test]
    fn test_challenge_event() {
        let mut server = server();
        streaming(&mut server);

        server.on_http(Frame::Challenge(ChallengeFrame {
            header: StreamHeader { stream_id: 0, maximum: 1024, ..Default::default() },
            extension: HttpExtension::Headers(challenge_request()),
        }));

        let body = body(&mut server);
        let json = body.strip_prefix("event:challenge\ndata:").and_then(|rest| rest.strip_suffix("\n\n")).unwrap();
        let value: Value = serde_json::from_str(json).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"method": "POST", "headers": {"content-type": "application/x-challenge-response"}})
        );
    }

    #[test]
    fn test_response_reset_by_client() {
        let mut server = server();
        streaming(&mut server);

        server.on_http(Frame::Reset(ResetFrame { header: header(0), extension: HttpExtension::Empty }));

        let app = server.application.take();
        assert!(matches!(&app[0], Frame::Reset(reset) if reset.header.stream_id == 2));
        assert!(matches!(&app[1], Frame::End(end) if end.header.stream_id == 3));
        assert_eq!(server.streams(), 0);
    }

    #[test]
    fn test_application_refuses_stream() {
        let mut server = server();
        server.on_http(request("GET", "/events", &[]));
        server.http.take();

        server.on_application(Frame::Reset(ResetFrame { header: header(3), extension: SseExtension::Empty }));

        let http = server.http.take();
        assert!(matches!(&http[..], [Frame::Reset(reset)] if reset.header.stream_id == 1));
        assert_eq!(server.streams(), 0);
    }

    #[test]
    fn test_window_violation_aborts() {
        let mut server = server();
        server.on_http(request("GET", "/events", &[]));
        server.on_application(app_begin());
        server.http.take();

        server.on_application(app_data(0, "too early", SseData::default()));

        let http = server.http.take();
        assert!(matches!(&http[..], [Frame::Abort(abort)] if abort.header.stream_id == 0));
        let app = server.application.take();
        assert!(app.iter().any(|frame| matches!(frame, Frame::Reset(reset) if reset.header.stream_id == 2)));
        assert_eq!(server.streams(), 0);
    }

    #[test]
    fn test_split_last_event_id() {
        assert_eq!(split_last_event_id("/e"), ("/e".to_string(), None));
        assert_eq!(split_last_event_id("/e?lastEventId=1"), ("/e".to_string(), Some("1".to_string())));
        assert_eq!(split_last_event_id("/e?a=1&lastEventId=2&b=3"), ("/e?a=1&b=3".to_string(), Some("2".to_string())));
    }
}
