use std::sync::Arc;

use bytes::Bytes;
use micro_fabric::{
    BeginFrame, BufferPool, Context, DataFrame, EndFrame, Frame, HeaderLookup, NetworkExtension, Route, Signals,
    StreamHeader, TransportInfo, WindowFrame, flags,
};
use micro_http_gateway::{HttpBinding, HttpConfig, HttpServer};
use micro_sse_gateway::{SseBegin, SseBinding, SseClient, SseConfig, SseData, SseExtension, SseServer};

fn any_route(_: u64, _: &dyn HeaderLookup) -> Option<Route> {
    Some(Route::new(1))
}

fn sse_server() -> SseServer {
    let context = Context::new(1, BufferPool::new(4096, 8), Signals::manual());
    SseServer::new(SseBinding::new(Arc::new(any_route), SseConfig::default()), context)
}

fn sse_client() -> SseClient {
    let context = Context::new(2, BufferPool::new(4096, 8), Signals::manual());
    SseClient::new(SseBinding::new(Arc::new(any_route), SseConfig::default()), context)
}

fn header(stream_id: u64) -> StreamHeader {
    StreamHeader { stream_id, ..Default::default() }
}

fn window(stream_id: u64, maximum: u32) -> Frame<SseExtension> {
    Frame::Window(WindowFrame { header: StreamHeader { stream_id, maximum, ..Default::default() }, budget_id: 0, padding: 0 })
}

/// Padding of the last window granted to the application.
fn granted_padding(frames: &[Frame<SseExtension>]) -> u32 {
    frames
        .iter()
        .rev()
        .find_map(|frame| match frame {
            Frame::Window(window) => Some(window.padding),
            _ => None,
        })
        .expect("application window")
}

fn event(sequence: u64, padding: u32, id: &str, payload: &'static str) -> Frame<SseExtension> {
    Frame::Data(DataFrame {
        header: StreamHeader { stream_id: 2, sequence, ..Default::default() },
        flags: flags::COMPLETE,
        budget_id: 0,
        reserved: payload.len() as u32 + padding,
        payload: Bytes::from_static(payload.as_bytes()),
        extension: SseExtension::Data(SseData { id: Some(id.to_string()), ..SseData::default() }),
    })
}

/// Carries HTTP frames between the gateways until neither has anything left to say.
fn exchange(client: &mut SseClient, server: &mut SseServer) {
    loop {
        let requests = client.http.take();
        let responses = server.http.take();
        if requests.is_empty() && responses.is_empty() {
            break;
        }
        requests.into_iter().for_each(|frame| server.on_http(frame));
        responses.into_iter().for_each(|frame| client.on_http(frame));
    }
}

#[test]
fn test_events_from_server_to_client() {
    let mut client = sse_client();
    let mut server = sse_server();

    client.on_application(Frame::Begin(BeginFrame {
        header: header(1),
        affinity: 0,
        extension: SseExtension::Begin(SseBegin {
            scheme: Some("http".to_string()),
            authority: Some("example.com".to_string()),
            path: "/prices".to_string(),
            last_event_id: Some("5".to_string()),
        }),
    }));
    client.on_application(window(0, 4096));
    exchange(&mut client, &mut server);

    let opened = server.application.take();
    let begin = opened.iter().find_map(|frame| match frame {
        Frame::Begin(begin) => begin.extension.begin().cloned(),
        _ => None,
    });
    let begin = begin.expect("server application begin");
    assert_eq!(begin.path, "/prices");
    assert_eq!(begin.last_event_id.as_deref(), Some("5"));

    server.on_application(Frame::Begin(BeginFrame { header: header(2), affinity: 0, extension: SseExtension::Empty }));
    exchange(&mut client, &mut server);
    let padding = granted_padding(&server.application.take());

    server.on_application(event(0, padding, "6", "a\nb"));
    server.on_application(Frame::End(EndFrame {
        header: StreamHeader { stream_id: 2, sequence: 3 + u64::from(padding), ..Default::default() },
        extension: SseExtension::End(Some("7".to_string())),
    }));
    exchange(&mut client, &mut server);

    let delivered = client.application.take();
    let data: Vec<_> = delivered
        .iter()
        .filter_map(|frame| match frame {
            Frame::Data(data) => Some((data.extension.data().and_then(|event| event.id.clone()), data.payload.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(data, [(Some("6".to_string()), Bytes::from_static(b"a\nb"))]);

    let end = delivered.iter().find_map(|frame| match frame {
        Frame::End(end) => Some(end.extension.end_id().map(str::to_string)),
        _ => None,
    });
    assert_eq!(end, Some(Some("7".to_string())));
    assert_eq!(client.streams(), 0);
    assert_eq!(server.streams(), 0);
}

fn http_server() -> HttpServer {
    let context = Context::new(3, BufferPool::new(4096, 32), Signals::manual());
    let mut server = HttpServer::new(HttpBinding::new(Arc::new(any_route), HttpConfig::default()), context);
    server.on_network(Frame::Begin(BeginFrame {
        header: header(3),
        affinity: 0,
        extension: NetworkExtension::Begin(TransportInfo::default()),
    }));
    server.on_network(Frame::Window(WindowFrame {
        header: StreamHeader { stream_id: 2, maximum: 4096, ..Default::default() },
        budget_id: 0,
        padding: 0,
    }));
    server.network.take();
    server
}

/// Carries application frames of the HTTP server to the SSE server and back.
fn relay(http: &mut HttpServer, sse: &mut SseServer) {
    loop {
        let requests = http.application.take();
        let responses = sse.http.take();
        if requests.is_empty() && responses.is_empty() {
            break;
        }
        requests.into_iter().for_each(|frame| sse.on_http(frame));
        responses.into_iter().for_each(|frame| http.on_application(frame));
    }
}

fn written(http: &mut HttpServer) -> String {
    let bytes: Vec<u8> = http
        .network
        .take()
        .into_iter()
        .filter_map(|frame| match frame {
            Frame::Data(data) => Some(data.payload.to_vec()),
            _ => None,
        })
        .flatten()
        .collect();
    String::from_utf8(bytes).unwrap()
}

#[test]
fn test_event_stream_over_http1() {
    let mut http = http_server();
    let mut sse = sse_server();

    let request = b"GET /prices?lastEventId=4 HTTP/1.1\r\nHost: example.com\r\nAccept: text/event-stream\r\n\r\n";
    http.on_network(Frame::Data(DataFrame {
        header: header(3),
        flags: flags::COMPLETE,
        budget_id: 0,
        reserved: request.len() as u32,
        payload: Bytes::from_static(request),
        extension: NetworkExtension::Empty,
    }));
    relay(&mut http, &mut sse);

    let opened = sse.application.take();
    let begin = opened.iter().find_map(|frame| match frame {
        Frame::Begin(begin) => begin.extension.begin().cloned(),
        _ => None,
    });
    let begin = begin.expect("application begin");
    assert_eq!(begin.path, "/prices");
    assert_eq!(begin.last_event_id.as_deref(), Some("4"));

    sse.on_application(Frame::Begin(BeginFrame { header: header(2), affinity: 0, extension: SseExtension::Empty }));
    relay(&mut http, &mut sse);
    let padding = granted_padding(&sse.application.take());

    sse.on_application(event(0, padding, "5", "hello"));
    relay(&mut http, &mut sse);

    let response = written(&mut http);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.to_ascii_lowercase().contains("content-type: text/event-stream\r\n"), "{response}");
    assert!(response.contains("id:5\ndata:hello\n\n"), "{response}");
}
