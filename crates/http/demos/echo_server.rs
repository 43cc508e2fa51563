//! Answers every request with its own body.
//!
//! ```text
//! cargo run -p micro-http-gateway --example echo_server
//! curl -d 'hello' http://127.0.0.1:8080/echo
//! curl --http2-prior-knowledge -d 'hello' http://127.0.0.1:8080/echo
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use micro_fabric::{Context, Frame, HeaderLookup, Outbox, Route, StreamHeader, TransportInfo, Window, flags};
use micro_http_gateway::connection::NetworkDriver;
use micro_http_gateway::protocol::{HeaderList, HttpExtension};
use micro_http_gateway::{HttpBinding, HttpConfig, HttpServer};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

const REQUEST_WINDOW: u32 = 8192;

fn route(_authorization: u64, _headers: &dyn HeaderLookup) -> Option<Route> {
    Some(Route::new(1))
}

#[derive(Debug)]
struct Echo {
    request: Window,
    response: Window,
    pending: BytesMut,
    ended: bool,
}

/// The application side: one [`Echo`] per request stream.
#[derive(Debug, Default)]
struct EchoApp {
    exchanges: HashMap<u64, Echo>,
    out: Outbox<HttpExtension>,
}

impl EchoApp {
    fn on_frame(&mut self, frame: Frame<HttpExtension>) {
        let stream_id = frame.stream_id();
        let request_id = stream_id | 1;

        match frame {
            Frame::Begin(begin) => {
                let content_type = begin
                    .extension
                    .headers()
                    .and_then(|headers| headers.get("content-type"))
                    .unwrap_or("application/octet-stream")
                    .to_string();
                info!(stream_id, path = begin.extension.headers().and_then(|h| h.get(":path")), "echo request");

                let mut echo =
                    Echo { request: Window::default(), response: Window::default(), pending: BytesMut::new(), ended: false };
                echo.request.grant(0, REQUEST_WINDOW);
                self.out.window(StreamHeader::new(request_id, &echo.request), 0, 0);

                let headers: HeaderList = [(":status", "200"), ("content-type", content_type.as_str())].into_iter().collect();
                self.out.begin(StreamHeader::new(request_id ^ 1, &echo.response), begin.affinity, HttpExtension::Headers(headers));
                self.exchanges.insert(request_id, echo);
            }
            Frame::Data(data) => {
                let Some(echo) = self.exchanges.get_mut(&request_id) else { return };
                if echo.request.receive(data.header.sequence, data.reserved).is_err() {
                    warn!(stream_id, "request window exceeded");
                    self.cancel(request_id);
                    return;
                }
                echo.pending.extend_from_slice(&data.payload);
                self.flush(request_id);
            }
            Frame::End(_) => {
                if let Some(echo) = self.exchanges.get_mut(&request_id) {
                    echo.ended = true;
                }
                self.flush(request_id);
            }
            Frame::Window(window) => {
                let Some(echo) = self.exchanges.get_mut(&request_id) else { return };
                let header = &window.header;
                if echo.response.observe(header.acknowledge, header.maximum, window.padding).is_err() {
                    self.cancel(request_id);
                    return;
                }
                self.flush(request_id);
            }
            Frame::Abort(_) | Frame::Reset(_) => self.cancel(request_id),
            _ => {}
        }
    }

    /// Writes buffered bytes within the response window and reopens the request window.
    fn flush(&mut self, request_id: u64) {
        let Some(echo) = self.exchanges.get_mut(&request_id) else { return };

        while !echo.pending.is_empty() && echo.response.writable() > 0 {
            let payload = echo.pending.split_to(echo.response.writable().min(echo.pending.len())).freeze();
            let reserved = payload.len() as u32 + echo.response.padding;
            let header = StreamHeader::new(request_id ^ 1, &echo.response);
            self.out.data(header, flags::COMPLETE, 0, reserved, payload, HttpExtension::Empty);
            echo.response.advance(reserved);
        }

        let acknowledge = echo.request.sequence - echo.pending.len() as u64;
        if !echo.ended && acknowledge > echo.request.acknowledge {
            echo.request.grant(acknowledge, REQUEST_WINDOW);
            self.out.window(StreamHeader::new(request_id, &echo.request), 0, 0);
        }

        if echo.ended && echo.pending.is_empty() {
            self.out.end(StreamHeader::new(request_id ^ 1, &echo.response), HttpExtension::Empty);
            self.exchanges.remove(&request_id);
        }
    }

    fn cancel(&mut self, request_id: u64) {
        if let Some(echo) = self.exchanges.remove(&request_id) {
            self.out.abort(StreamHeader::new(request_id ^ 1, &echo.response));
            self.out.reset(StreamHeader::new(request_id, &echo.request), HttpExtension::Empty);
        }
    }
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!(port = 8080, "start listening");
    let tcp_listener = match TcpListener::bind("127.0.0.1:8080").await {
        Ok(tcp_listener) => tcp_listener,
        Err(e) => {
            error!(cause = %e, "bind server error");
            return;
        }
    };

    let binding = HttpBinding::new(Arc::new(route), HttpConfig::default());
    let mut binding_id = 0;

    loop {
        let (tcp_stream, _remote_addr) = match tcp_listener.accept().await {
            Ok(stream_and_addr) => stream_and_addr,
            Err(e) => {
                warn!(cause = %e, "failed to accept");
                continue;
            }
        };

        binding_id += 1;
        let mut server = HttpServer::new(binding.clone(), Context::from_config(binding_id, &Default::default()));

        tokio::spawn(async move {
            let (reader, writer) = tcp_stream.into_split();
            let (requests, mut application) = mpsc::channel(64);
            let (replies, replies_rx) = mpsc::channel(64);

            tokio::spawn(async move {
                let mut app = EchoApp::default();
                while let Some(frame) = application.recv().await {
                    app.on_frame(frame);
                    for reply in app.out.drain().collect::<Vec<_>>() {
                        if replies.send(reply).await.is_err() {
                            return;
                        }
                    }
                }
            });

            let driver = NetworkDriver::new(reader, writer, TransportInfo::default());
            match driver.process(&mut server, requests, replies_rx).await {
                Ok(()) => info!("finished process, connection shutdown"),
                Err(e) => error!("service has error, cause {}, connection shutdown", e),
            }
        });
    }
}
