//! Resumable HTTP/2 frame decoder.
//!
//! Frames other than DATA are handed to the sink once fully buffered. DATA
//! payload is streamed, so a slow application stalls the connection rather
//! than forcing the whole frame into memory. Connection level violations
//! move the decoder to `IgnoreAll`.

use tracing::{debug, trace};

use crate::codec::h2::frame::{FRAME_HEADER_LEN, FrameHeader, FrameType, PREFACE, flags};
use crate::protocol::{ErrorScope, Http2Error, Http2ErrorCode};

pub trait Http2Sink {
    /// The client preface has been received.
    fn on_preface(&mut self) {}

    /// A complete frame other than DATA.
    fn on_frame(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), Http2Error>;

    /// Start of a DATA frame, `Ok(false)` discards its payload.
    fn on_data_begin(&mut self, header: &FrameHeader) -> Result<bool, Http2Error>;

    /// Payload of the current DATA frame, returns how much was accepted.
    fn on_data(&mut self, stream_id: u32, payload: &[u8]) -> usize;

    fn on_data_end(&mut self, header: &FrameHeader) -> Result<(), Http2Error>;

    fn on_stream_error(&mut self, stream_id: u32, code: Http2ErrorCode);

    fn on_connection_error(&mut self, code: Http2ErrorCode);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Preface,
    FrameType,
    Data { header: FrameHeader, remaining: u32, padding: u32, deliver: bool },
    IgnoreAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2Decoder {
    state: DecodeState,
    max_frame_size: u32,
    continuation_stream_id: Option<u32>,
}

impl Http2Decoder {
    /// Server side decoder, expects the client preface first.
    pub fn server(max_frame_size: u32) -> Self {
        Self { state: DecodeState::Preface, max_frame_size, continuation_stream_id: None }
    }

    pub fn client(max_frame_size: u32) -> Self {
        Self { state: DecodeState::FrameType, max_frame_size, continuation_stream_id: None }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn ignore_all(&mut self) {
        self.state = DecodeState::IgnoreAll;
    }

    pub fn is_ignoring(&self) -> bool {
        self.state == DecodeState::IgnoreAll
    }

    pub fn decode<S: Http2Sink>(&mut self, sink: &mut S, buf: &[u8]) -> usize {
        let mut progress = 0;
        loop {
            let previous = self.state;
            let consumed = self.step(sink, &buf[progress..]);
            progress += consumed;

            if consumed == 0 && self.state == previous {
                break;
            }
        }
        progress
    }

    fn step<S: Http2Sink>(&mut self, sink: &mut S, buf: &[u8]) -> usize {
        match self.state {
            DecodeState::Preface => self.decode_preface(sink, buf),
            DecodeState::FrameType => self.decode_frame_type(sink, buf),
            DecodeState::Data { header, remaining, padding, deliver } => {
                self.decode_data(sink, buf, header, remaining, padding, deliver)
            }
            DecodeState::IgnoreAll => buf.len(),
        }
    }

    fn fail<S: Http2Sink>(&mut self, sink: &mut S, error: Http2Error, buf: &[u8]) -> usize {
        debug!(code = ?error.code, "http/2 connection error");
        sink.on_connection_error(error.code);
        self.state = DecodeState::IgnoreAll;
        buf.len()
    }

    fn decode_preface<S: Http2Sink>(&mut self, sink: &mut S, buf: &[u8]) -> usize {
        if buf.len() < PREFACE.len() {
            if PREFACE.starts_with(buf) {
                return 0;
            }
            return self.fail(sink, Http2Error::protocol(), buf);
        }

        if &buf[..PREFACE.len()] != PREFACE {
            return self.fail(sink, Http2Error::protocol(), buf);
        }

        sink.on_preface();
        self.state = DecodeState::FrameType;
        PREFACE.len()
    }

    fn decode_frame_type<S: Http2Sink>(&mut self, sink: &mut S, buf: &[u8]) -> usize {
        let Some(header) = FrameHeader::parse(buf) else {
            return 0;
        };

        if header.length > self.max_frame_size {
            return self.fail(sink, Http2Error::frame_size(), buf);
        }

        match (self.continuation_stream_id, header.frame_type) {
            (Some(stream_id), FrameType::Continuation) if stream_id == header.stream_id => {}
            (Some(_), _) | (None, FrameType::Continuation) => return self.fail(sink, Http2Error::protocol(), buf),
            _ => {}
        }

        if header.frame_type == FrameType::Data {
            return self.decode_data_header(sink, buf, header);
        }

        if buf.len() < header.frame_len() {
            return 0;
        }

        match header.frame_type {
            FrameType::Headers | FrameType::PushPromise if !header.is_end_headers() => {
                self.continuation_stream_id = Some(header.stream_id);
            }
            FrameType::Continuation if header.is_end_headers() => self.continuation_stream_id = None,
            _ => {}
        }

        trace!(frame_type = ?header.frame_type, stream_id = header.stream_id, len = header.length, "http/2 frame");
        let payload = &buf[FRAME_HEADER_LEN..header.frame_len()];
        if let Err(error) = sink.on_frame(&header, payload) {
            match error.scope {
                ErrorScope::Stream(stream_id) => sink.on_stream_error(stream_id, error.code),
                ErrorScope::Connection => return self.fail(sink, error, buf),
            }
        }

        header.frame_len()
    }

    fn decode_data_header<S: Http2Sink>(&mut self, sink: &mut S, buf: &[u8], header: FrameHeader) -> usize {
        if header.stream_id == 0 {
            return self.fail(sink, Http2Error::protocol(), buf);
        }

        let padded = header.has(flags::PADDED);
        let prefix = FRAME_HEADER_LEN + usize::from(padded);
        if padded && header.length == 0 {
            return self.fail(sink, Http2Error::frame_size(), buf);
        }
        if buf.len() < prefix {
            return 0;
        }

        let padding = if padded { u32::from(buf[FRAME_HEADER_LEN]) } else { 0 };
        let Some(remaining) = header.length.checked_sub(padding + u32::from(padded)) else {
            return self.fail(sink, Http2Error::protocol(), buf);
        };

        let deliver = match sink.on_data_begin(&header) {
            Ok(deliver) => deliver,
            Err(Http2Error { scope: ErrorScope::Stream(stream_id), code }) => {
                sink.on_stream_error(stream_id, code);
                false
            }
            Err(error) => return self.fail(sink, error, buf),
        };

        self.state = DecodeState::Data { header, remaining, padding, deliver };
        prefix
    }

    fn decode_data<S: Http2Sink>(
        &mut self,
        sink: &mut S,
        buf: &[u8],
        header: FrameHeader,
        remaining: u32,
        padding: u32,
        deliver: bool,
    ) -> usize {
        if remaining > 0 {
            let length = buf.len().min(remaining as usize);
            if length == 0 {
                return 0;
            }

            let consumed = if deliver { sink.on_data(header.stream_id, &buf[..length]) } else { length };
            self.state = DecodeState::Data { header, remaining: remaining - consumed as u32, padding, deliver };
            return consumed;
        }

        if padding > 0 {
            let skipped = buf.len().min(padding as usize);
            self.state = DecodeState::Data { header, remaining, padding: padding - skipped as u32, deliver };
            return skipped;
        }

        self.state = DecodeState::FrameType;
        if deliver {
            if let Err(error) = sink.on_data_end(&header) {
                match error.scope {
                    ErrorScope::Stream(stream_id) => sink.on_stream_error(stream_id, error.code),
                    ErrorScope::Connection => return self.fail(sink, error, buf),
                }
            }
        }
        0
    }
}
