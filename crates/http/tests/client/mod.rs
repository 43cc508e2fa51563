use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use indoc::indoc;
use micro_fabric::{
    BeginFrame, BufferPool, Context, DataFrame, EndFrame, Frame, HeaderLookup, NetworkExtension, Route, Signals,
    StreamHeader, WindowFrame, flags,
};
use micro_http_gateway::codec::h2::{FrameHeader, FrameType, PREFACE, write};
use micro_http_gateway::codec::hpack::HpackEncoder;
use micro_http_gateway::protocol::{HeaderList, HttpExtension};
use micro_http_gateway::{HttpBinding, HttpClient, HttpConfig};

fn resolve(_: u64, headers: &dyn HeaderLookup) -> Option<Route> {
    match headers.header(":authority") {
        Some("h2.example.com") => Some(Route::new(2).with_versions(["h2"])),
        Some(_) => Some(Route::new(1)),
        None => None,
    }
}

fn client() -> HttpClient {
    let context = Context::new(1, BufferPool::new(8192, 16), Signals::manual());
    let config = HttpConfig { maximum_connections_per_route: 1, ..HttpConfig::default() };
    HttpClient::new(HttpBinding::new(Arc::new(resolve), config), context)
}

fn begin(stream_id: u64, headers: &[(&str, &str)]) -> Frame<HttpExtension> {
    Frame::Begin(BeginFrame {
        header: StreamHeader { stream_id, ..Default::default() },
        affinity: 0,
        extension: HttpExtension::Headers(headers.iter().copied().collect()),
    })
}

fn window<X>(stream_id: u64, maximum: u32) -> Frame<X> {
    Frame::Window(WindowFrame { header: StreamHeader { stream_id, maximum, ..Default::default() }, budget_id: 0, padding: 0 })
}

/// Completes the network connection the client opened and returns its outbound id.
fn connect(client: &mut HttpClient) -> u64 {
    let key = client
        .network
        .take()
        .into_iter()
        .find_map(|frame| match frame {
            Frame::Begin(begin) => Some(begin.header.stream_id),
            _ => None,
        })
        .expect("network begin");

    client.on_network(Frame::Begin(BeginFrame {
        header: StreamHeader { stream_id: key ^ 1, ..Default::default() },
        affinity: 0,
        extension: NetworkExtension::Empty,
    }));
    client.on_network(window(key, 8192));
    key
}

fn reply(client: &mut HttpClient, key: u64, sequence: u64, payload: &[u8]) {
    client.on_network(Frame::Data(DataFrame {
        header: StreamHeader { stream_id: key ^ 1, sequence, ..Default::default() },
        flags: flags::COMPLETE,
        budget_id: 0,
        reserved: payload.len() as u32,
        payload: Bytes::copy_from_slice(payload),
        extension: NetworkExtension::Empty,
    }));
}

fn written(client: &mut HttpClient) -> Vec<u8> {
    client
        .network
        .take()
        .into_iter()
        .filter_map(|frame| match frame {
            Frame::Data(data) => Some(data.payload.to_vec()),
            _ => None,
        })
        .flatten()
        .collect()
}

#[test]
fn test_http1_request_with_body() {
    let mut client = client();
    client.on_application(begin(
        3,
        &[(":method", "POST"), (":scheme", "http"), (":authority", "example.com"), (":path", "/submit"), ("content-length", "5")],
    ));
    let key = connect(&mut client);

    let grants = client.application.take();
    assert!(grants.iter().any(|frame| matches!(frame, Frame::Window(window) if window.header.stream_id == 3)));

    client.on_application(Frame::Data(DataFrame {
        header: StreamHeader { stream_id: 3, ..Default::default() },
        flags: flags::COMPLETE,
        budget_id: 0,
        reserved: 5,
        payload: Bytes::from_static(b"hello"),
        extension: HttpExtension::Empty,
    }));
    client.on_application(Frame::End(EndFrame {
        header: StreamHeader { stream_id: 3, sequence: 5, ..Default::default() },
        extension: HttpExtension::Empty,
    }));

    assert_eq!(
        String::from_utf8(written(&mut client)).unwrap(),
        indoc! {"
            POST /submit HTTP/1.1\r
            Host: example.com\r
            Content-Length: 5\r
            \r
            hello"}
    );

    reply(&mut client, key, 0, b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok");
    let frames = client.application.take();
    let Some(Frame::Begin(response)) = frames.first() else { panic!("expected response begin, got {frames:?}") };
    assert_eq!(response.header.stream_id, 2);
    assert_eq!(response.extension.headers().and_then(HeaderList::status), Some(201));

    client.on_application(window(2, 1024));
    let frames = client.application.take();
    assert!(matches!(frames.as_slice(), [Frame::Data(data), Frame::End(_)] if data.payload.as_ref() == b"ok"));
    assert_eq!(client.exchanges(), 0);
    assert_eq!(client.connections(), 1);
}

#[test]
fn test_http1_connection_reused_for_next_request() {
    let mut client = client();
    client.on_application(begin(3, &[(":method", "GET"), (":authority", "example.com"), (":path", "/one")]));
    client.on_application(Frame::End(EndFrame {
        header: StreamHeader { stream_id: 3, ..Default::default() },
        extension: HttpExtension::Empty,
    }));
    let key = connect(&mut client);
    client.on_application(window(2, 1024));
    written(&mut client);

    reply(&mut client, key, 0, b"HTTP/1.1 204 No Content\r\n\r\n");
    client.application.take();
    assert_eq!(client.exchanges(), 0);

    client.on_application(begin(5, &[(":method", "GET"), (":authority", "example.com"), (":path", "/two")]));
    assert!(client.network.iter().all(|frame| !matches!(frame, Frame::Begin(_))), "no second connection");
    assert!(String::from_utf8(written(&mut client)).unwrap().starts_with("GET /two HTTP/1.1\r\n"));
    assert_eq!(client.connections(), 1);
}

#[test]
fn test_http2_exchange() {
    let mut client = client();
    client.on_application(begin(
        3,
        &[(":method", "GET"), (":scheme", "https"), (":authority", "h2.example.com"), (":path", "/h2")],
    ));
    client.on_application(Frame::End(EndFrame {
        header: StreamHeader { stream_id: 3, ..Default::default() },
        extension: HttpExtension::Empty,
    }));
    let key = connect(&mut client);

    let bytes = written(&mut client);
    assert!(bytes.starts_with(PREFACE));
    let mut offset = PREFACE.len();
    let mut seen = Vec::new();
    while let Some(header) = FrameHeader::parse(&bytes[offset..]) {
        seen.push((header.frame_type, header.stream_id));
        offset += header.frame_len();
    }
    assert_eq!(seen.first(), Some(&(FrameType::Settings, 0)));
    assert!(seen.contains(&(FrameType::Headers, 1)));

    let response: HeaderList = [(":status", "200")].into_iter().collect();
    let mut frames = BytesMut::new();
    write::settings(&mut frames, &[]);
    write::headers(&mut frames, 1, &HpackEncoder::new().encode(&response), true, 16_384);
    reply(&mut client, key, 0, &frames);

    let frames = client.application.take();
    let Some(Frame::Begin(begin)) = frames.iter().find(|frame| matches!(frame, Frame::Begin(_))) else {
        panic!("expected response begin, got {frames:?}")
    };
    assert_eq!(begin.header.stream_id, 2);
    assert_eq!(begin.extension.headers().and_then(HeaderList::status), Some(200));

    client.on_application(window(2, 1024));
    assert!(client.application.take().iter().any(|frame| matches!(frame, Frame::End(end) if end.header.stream_id == 2)));
    assert_eq!(client.exchanges(), 0);
}
