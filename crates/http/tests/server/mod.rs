use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use indoc::indoc;
use micro_fabric::{
    BeginFrame, BufferPool, Context, DataFrame, EndFrame, Frame, HeaderLookup, NetworkExtension, Route, Signals,
    StreamHeader, TransportInfo, WindowFrame, flags,
};
use micro_http_gateway::codec::h2::{FRAME_HEADER_LEN, FrameHeader, FrameType, PREFACE, write};
use micro_http_gateway::codec::hpack::{HpackDecoder, HpackEncoder};
use micro_http_gateway::connection::NetworkDriver;
use micro_http_gateway::protocol::{HeaderList, HttpExtension};
use micro_http_gateway::{HttpBinding, HttpConfig, HttpServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

fn any_route(_: u64, _: &dyn HeaderLookup) -> Option<Route> {
    Some(Route::new(1))
}

fn server() -> HttpServer {
    let context = Context::new(1, BufferPool::new(4096, 32), Signals::manual());
    HttpServer::new(HttpBinding::new(Arc::new(any_route), HttpConfig::default()), context)
}

/// A server with one accepted connection on network stream 3 whose replies may use 4096 bytes.
fn connected() -> HttpServer {
    let mut server = server();
    server.on_network(Frame::Begin(BeginFrame {
        header: StreamHeader { stream_id: 3, ..Default::default() },
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

fn receive(server: &mut HttpServer, sequence: u64, payload: &[u8]) {
    server.on_network(Frame::Data(DataFrame {
        header: StreamHeader { stream_id: 3, sequence, ..Default::default() },
        flags: flags::COMPLETE,
        budget_id: 0,
        reserved: payload.len() as u32,
        payload: Bytes::copy_from_slice(payload),
        extension: NetworkExtension::Empty,
    }));
}

fn written(server: &mut HttpServer) -> Vec<u8> {
    server
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

fn request_headers(frames: &[Frame<HttpExtension>]) -> Option<(u64, HeaderList)> {
    frames.iter().find_map(|frame| match frame {
        Frame::Begin(begin) => begin.extension.headers().map(|headers| (begin.header.stream_id, headers.clone())),
        _ => None,
    })
}

fn window(stream_id: u64, maximum: u32) -> Frame<HttpExtension> {
    Frame::Window(WindowFrame { header: StreamHeader { stream_id, maximum, ..Default::default() }, budget_id: 0, padding: 0 })
}

/// Answers `request_id` with `body` and a matching content-length.
fn respond(server: &mut HttpServer, request_id: u64, body: &'static [u8]) {
    let response_id = request_id ^ 1;
    server.on_application(window(request_id, 1024));

    let headers: HeaderList = [(":status", "200"), ("content-length", body.len().to_string().as_str())].into_iter().collect();
    server.on_application(Frame::Begin(BeginFrame {
        header: StreamHeader { stream_id: response_id, ..Default::default() },
        affinity: 0,
        extension: HttpExtension::Headers(headers),
    }));
    server.on_application(Frame::Data(DataFrame {
        header: StreamHeader { stream_id: response_id, ..Default::default() },
        flags: flags::COMPLETE,
        budget_id: 0,
        reserved: body.len() as u32,
        payload: Bytes::from_static(body),
        extension: HttpExtension::Empty,
    }));
    server.on_application(Frame::End(EndFrame {
        header: StreamHeader { stream_id: response_id, sequence: body.len() as u64, ..Default::default() },
        extension: HttpExtension::Empty,
    }));
}

#[test]
fn test_http1_exchange() {
    let mut server = connected();
    receive(&mut server, 0, b"GET /hello HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n");

    let (request_id, headers) = request_headers(&server.application.take()).expect("request begin");
    assert_eq!(headers.get(":path"), Some("/hello"));
    assert_eq!(headers.get("accept"), Some("*/*"));

    respond(&mut server, request_id, b"hello");
    assert_eq!(
        String::from_utf8(written(&mut server)).unwrap(),
        indoc! {"
            HTTP/1.1 200 OK\r
            Content-Length: 5\r
            \r
            hello"}
    );
    assert_eq!(server.exchanges(), 0);
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_http1_pipelined_requests_in_order() {
    let mut server = connected();
    receive(&mut server, 0, b"GET /a HTTP/1.1\r\nHost: a\r\n\r\nGET /b HTTP/1.1\r\nHost: a\r\n\r\n");

    let (first, headers) = request_headers(&server.application.take()).expect("first request");
    assert_eq!(headers.get(":path"), Some("/a"));
    assert_eq!(server.exchanges(), 1);

    respond(&mut server, first, b"a");
    let (second, headers) = request_headers(&server.application.take()).expect("second request");
    assert_eq!(headers.get(":path"), Some("/b"));
    assert_ne!(first, second);

    respond(&mut server, second, b"b");
    let responses = String::from_utf8(written(&mut server)).unwrap();
    assert_eq!(responses.matches("HTTP/1.1 200 OK").count(), 2);
    assert!(responses.ends_with("\r\n\r\nb"));
}

#[test]
fn test_http1_connection_close() {
    let mut server = connected();
    receive(&mut server, 0, b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n");

    let (request_id, _) = request_headers(&server.application.take()).expect("request begin");
    respond(&mut server, request_id, b"bye");

    let frames = server.network.take();
    assert!(frames.iter().any(|frame| matches!(frame, Frame::End(_))), "{frames:?}");
}

#[test]
fn test_prior_knowledge_http2_request() {
    let mut server = connected();

    let mut encoder = HpackEncoder::new();
    let headers: HeaderList =
        [(":method", "GET"), (":scheme", "http"), (":authority", "example.com"), (":path", "/h2")].into_iter().collect();
    let mut frames = BytesMut::from(PREFACE);
    write::settings(&mut frames, &[]);
    write::headers(&mut frames, 1, &encoder.encode(&headers), true, 16_384);
    receive(&mut server, 0, &frames);

    let (request_id, request) = request_headers(&server.application.take()).expect("request begin");
    assert_eq!(request.get(":path"), Some("/h2"));

    let bytes = written(&mut server);
    let settings = FrameHeader::parse(&bytes).expect("server settings");
    assert_eq!((settings.frame_type, settings.stream_id), (FrameType::Settings, 0));

    respond(&mut server, request_id, b"ok");
    let bytes = written(&mut server);
    let mut offset = 0;
    let mut seen = Vec::new();
    while let Some(header) = FrameHeader::parse(&bytes[offset..]) {
        if header.frame_type == FrameType::Headers {
            let block = &bytes[offset + FRAME_HEADER_LEN..offset + header.frame_len()];
            let response = HpackDecoder::new().decode(block).unwrap();
            assert_eq!(response.status(), Some(200));
        }
        seen.push((header.frame_type, header.stream_id));
        offset += header.frame_len();
    }
    assert!(seen.contains(&(FrameType::Headers, 1)));
    assert!(seen.contains(&(FrameType::Data, 1)));
}

/// Plays an application answering every request with `ok`.
async fn answer_ok(mut requests: mpsc::Receiver<Frame<HttpExtension>>, replies: mpsc::Sender<Frame<HttpExtension>>) {
    while let Some(frame) = requests.recv().await {
        let stream_id = frame.stream_id();
        let reply = match frame {
            Frame::Begin(_) => {
                let headers: HeaderList = [(":status", "200"), ("content-length", "2")].into_iter().collect();
                vec![
                    window(stream_id, 1024),
                    Frame::Begin(BeginFrame {
                        header: StreamHeader { stream_id: stream_id ^ 1, ..Default::default() },
                        affinity: 0,
                        extension: HttpExtension::Headers(headers),
                    }),
                ]
            }
            Frame::Window(window) if window.header.sequence == 0 && window.header.maximum >= 2 => vec![
                Frame::Data(DataFrame {
                    header: StreamHeader { stream_id, ..Default::default() },
                    flags: flags::COMPLETE,
                    budget_id: 0,
                    reserved: 2,
                    payload: Bytes::from_static(b"ok"),
                    extension: HttpExtension::Empty,
                }),
                Frame::End(EndFrame {
                    header: StreamHeader { stream_id, sequence: 2, ..Default::default() },
                    extension: HttpExtension::Empty,
                }),
            ],
            _ => Vec::new(),
        };
        for frame in reply {
            if replies.send(frame).await.is_err() {
                return;
            }
        }
    }
}

#[tokio::test]
async fn test_driver_over_duplex() {
    let (mut client, socket) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(socket);

    let (requests, application) = mpsc::channel(16);
    let (replies, replies_rx) = mpsc::channel(16);
    tokio::spawn(answer_ok(application, replies));

    let driver = tokio::spawn(async move {
        let mut server = server();
        NetworkDriver::new(reader, writer, TransportInfo::default()).process(&mut server, requests, replies_rx).await
    });

    client.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response)).await.unwrap().unwrap();
    assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok");

    drop(client);
    tokio::time::timeout(Duration::from_secs(5), driver).await.unwrap().unwrap().unwrap();
}
