use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use micro_fabric::{
    BeginFrame, DataFrame, EndFrame, Frame, NetworkExtension, StreamHeader, TransportInfo, Window, WindowFrame, flags,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tracing::{debug, info, trace};

use crate::protocol::{HttpError, HttpExtension};
use crate::server::HttpServer;

/// Runs one accepted connection of an [`HttpServer`] over a tokio reader and writer.
///
/// The driver plays the network side of the fabric: socket bytes become
/// network `Data` frames within the window the server grants, and server
/// `Data` frames are written out and acknowledged once flushed. Application
/// frames travel over the two channels given to [`process`](Self::process).
///
/// # Type Parameters
///
/// * `R`: The async readable stream type
/// * `W`: The async writable stream type
#[derive(Debug)]
pub struct NetworkDriver<R, W> {
    framed_read: FramedRead<R, BytesCodec>,
    framed_write: FramedWrite<W, BytesCodec>,
    transport: TransportInfo,
}

impl<R, W> NetworkDriver<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, transport: TransportInfo) -> Self {
        Self {
            framed_read: FramedRead::with_capacity(reader, BytesCodec::new(), 8 * 1024),
            framed_write: FramedWrite::new(writer, BytesCodec::new()),
            transport,
        }
    }

    /// Drives the connection until both directions are closed.
    ///
    /// Frames for the application are sent to `application`, its replies are
    /// read from `replies`.
    pub async fn process(
        mut self,
        server: &mut HttpServer,
        application: mpsc::Sender<Frame<HttpExtension>>,
        mut replies: mpsc::Receiver<Frame<HttpExtension>>,
    ) -> Result<(), HttpError> {
        let inbound_id = server.context().ids.supply_initial_id();
        let outbound_id = inbound_id ^ 1;
        let capacity = u32::try_from(server.context().pool.slot_capacity()).unwrap_or(u32::MAX);

        let mut inbound = Window::default();
        let mut pending = BytesMut::new();
        let mut read_closed = false;
        let mut write_closed = false;

        server.on_network(Frame::Begin(BeginFrame {
            header: StreamHeader::new(inbound_id, &inbound),
            affinity: 0,
            extension: NetworkExtension::Begin(self.transport.clone()),
        }));

        loop {
            while !pending.is_empty() && inbound.writable() > 0 {
                let payload = pending.split_to(inbound.writable().min(pending.len())).freeze();
                let reserved = payload.len() as u32 + inbound.padding;
                let header = StreamHeader::new(inbound_id, &inbound);
                inbound.advance(reserved);
                server.on_network(Frame::Data(DataFrame {
                    header,
                    flags: flags::COMPLETE,
                    budget_id: 0,
                    reserved,
                    payload,
                    extension: NetworkExtension::Empty,
                }));
            }

            while let Some(frame) = server.network.pop() {
                match frame {
                    Frame::Begin(begin) if begin.header.stream_id == outbound_id => {
                        let sequence = begin.header.sequence;
                        server.on_network(open_window(outbound_id, sequence, capacity));
                    }
                    Frame::Window(window) if window.header.stream_id == inbound_id => {
                        let header = &window.header;
                        inbound.observe(header.acknowledge, header.maximum, window.padding)?;
                    }
                    Frame::Data(data) if data.header.stream_id == outbound_id => {
                        self.framed_write.send(data.payload).await?;
                        let acknowledge = data.header.sequence + u64::from(data.reserved);
                        server.on_network(open_window(outbound_id, acknowledge, capacity));
                    }
                    Frame::End(_) | Frame::Abort(_) if !write_closed => {
                        self.framed_write.get_mut().shutdown().await?;
                        write_closed = true;
                        debug!(stream_id = outbound_id, "network write closed");
                    }
                    Frame::Reset(_) => read_closed = true,
                    frame => trace!(stream_id = frame.stream_id(), frame = frame.name(), "network frame dropped"),
                }
            }

            for frame in server.application.drain().collect::<Vec<_>>() {
                application.send(frame).await.map_err(|_e| HttpError::ChannelClosed)?;
            }

            if server.connections() == 0 || (read_closed && write_closed) {
                info!(stream_id = inbound_id, "connection finished");
                return Ok(());
            }

            let now = server.context().signals.now();
            let deadline = server.context().signals.next_deadline();
            let delay = deadline.map_or(Duration::ZERO, |deadline| Duration::from_millis(deadline.saturating_sub(now)));

            select! {
                read = self.framed_read.next(), if !read_closed && pending.is_empty() => match read {
                    Some(Ok(bytes)) => pending = bytes,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        read_closed = true;
                        let header = StreamHeader::new(inbound_id, &inbound);
                        server.on_network(Frame::End(EndFrame { header, extension: NetworkExtension::Empty }));
                    }
                },
                reply = replies.recv() => match reply {
                    Some(frame) => server.on_application(frame),
                    None => return Err(HttpError::ChannelClosed),
                },
                () = tokio::time::sleep(delay), if deadline.is_some() => server.poll_signals(),
            }
        }
    }
}

/// Acknowledges everything up to `acknowledge` and offers `capacity` more bytes.
fn open_window(stream_id: u64, acknowledge: u64, capacity: u32) -> Frame<NetworkExtension> {
    let window = Window::new(acknowledge, acknowledge, capacity);
    Frame::Window(WindowFrame { header: StreamHeader::new(stream_id, &window), budget_id: 0, padding: 0 })
}
