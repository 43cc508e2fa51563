//! HTTP/2 frame layout (RFC 9113 §4, §6).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::{Http2Error, Http2ErrorCode};

pub const FRAME_HEADER_LEN: usize = 9;
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// First line of the preface, as seen by an HTTP/1.1 decoder.
pub const PREFACE_LINE: &[u8] = b"PRI * HTTP/2.0\r\n";

pub const MAX_WINDOW_SIZE: i64 = 0x7fff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    Goaway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl FrameType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x0 => FrameType::Data,
            0x1 => FrameType::Headers,
            0x2 => FrameType::Priority,
            0x3 => FrameType::RstStream,
            0x4 => FrameType::Settings,
            0x5 => FrameType::PushPromise,
            0x6 => FrameType::Ping,
            0x7 => FrameType::Goaway,
            0x8 => FrameType::WindowUpdate,
            0x9 => FrameType::Continuation,
            other => FrameType::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::Goaway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(other) => other,
        }
    }
}

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, flags: u8, stream_id: u32, length: u32) -> Self {
        Self { length, frame_type, flags, stream_id }
    }

    /// Reads the 9 byte frame header, `None` when fewer bytes are available.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return None;
        }

        let mut buf = &buf[..FRAME_HEADER_LEN];
        let length = (u32::from(buf.get_u16()) << 8) | u32::from(buf.get_u8());
        let frame_type = FrameType::from_u8(buf.get_u8());
        let flags = buf.get_u8();
        let stream_id = buf.get_u32() & 0x7fff_ffff;
        Some(Self { length, frame_type, flags, stream_id })
    }

    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u8((self.length >> 16) as u8);
        dst.put_u16(self.length as u16);
        dst.put_u8(self.frame_type.as_u8());
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & 0x7fff_ffff);
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.has(flags::END_STREAM)
    }

    pub fn is_end_headers(&self) -> bool {
        self.has(flags::END_HEADERS)
    }

    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_LEN + self.length as usize
    }
}

/// Conservative frame overhead estimate for `length` payload bytes.
pub fn frame_padding(length: i64, max_frame_size: u32) -> u32 {
    if length <= 0 {
        return 0;
    }
    let frames = (length + i64::from(max_frame_size) - 1) / i64::from(max_frame_size);
    u32::try_from(frames * FRAME_HEADER_LEN as i64).unwrap_or(u32::MAX)
}

/// Strips the pad length byte and trailing padding of a PADDED frame.
pub fn unpad(header: &FrameHeader, payload: &[u8]) -> Result<(usize, usize), Http2Error> {
    if !header.has(flags::PADDED) {
        return Ok((0, payload.len()));
    }

    let Some(&pad_length) = payload.first() else {
        return Err(Http2Error::frame_size());
    };

    let pad_length = usize::from(pad_length);
    if pad_length >= payload.len() {
        return Err(Http2Error::protocol());
    }
    Ok((1, payload.len() - pad_length))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub parent_stream: u32,
    pub weight: u8,
}

impl Priority {
    pub fn parse(mut payload: &[u8]) -> Option<Self> {
        if payload.len() < 5 {
            return None;
        }
        let dependency = payload.get_u32();
        Some(Self { exclusive: dependency & 0x8000_0000 != 0, parent_stream: dependency & 0x7fff_ffff, weight: payload.get_u8() })
    }
}

/// The header block fragment and priority of a HEADERS payload.
pub fn headers_fragment<'a>(header: &FrameHeader, payload: &'a [u8]) -> Result<(Option<Priority>, &'a [u8]), Http2Error> {
    let (start, end) = unpad(header, payload)?;
    let payload = &payload[start..end];

    if header.has(flags::PRIORITY) {
        let priority = Priority::parse(payload).ok_or_else(Http2Error::frame_size)?;
        Ok((Some(priority), &payload[5..]))
    } else {
        Ok((None, payload))
    }
}

/// The promised stream id and header block fragment of a PUSH_PROMISE payload.
pub fn push_promise_fragment<'a>(header: &FrameHeader, payload: &'a [u8]) -> Result<(u32, &'a [u8]), Http2Error> {
    let (start, end) = unpad(header, payload)?;
    let mut payload = &payload[start..end];
    if payload.len() < 4 {
        return Err(Http2Error::frame_size());
    }
    let promised = payload.get_u32() & 0x7fff_ffff;
    Ok((promised, payload))
}

pub fn parse_rst_stream(mut payload: &[u8]) -> Option<Http2ErrorCode> {
    (payload.len() == 4).then(|| Http2ErrorCode::from_u32(payload.get_u32()))
}

pub fn parse_window_update(mut payload: &[u8]) -> Option<u32> {
    (payload.len() == 4).then(|| payload.get_u32() & 0x7fff_ffff)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Goaway {
    pub last_stream_id: u32,
    pub error_code: Http2ErrorCode,
}

pub fn parse_goaway(mut payload: &[u8]) -> Option<Goaway> {
    if payload.len() < 8 {
        return None;
    }
    let last_stream_id = payload.get_u32() & 0x7fff_ffff;
    Some(Goaway { last_stream_id, error_code: Http2ErrorCode::from_u32(payload.get_u32()) })
}

/// Frame builders. Each appends one or more complete frames to `dst`.
pub mod write {
    use super::*;

    pub fn settings(dst: &mut BytesMut, settings: &[(u16, u32)]) {
        FrameHeader::new(FrameType::Settings, 0, 0, (settings.len() * 6) as u32).write(dst);
        for (id, value) in settings {
            dst.put_u16(*id);
            dst.put_u32(*value);
        }
    }

    pub fn settings_ack(dst: &mut BytesMut) {
        FrameHeader::new(FrameType::Settings, flags::ACK, 0, 0).write(dst);
    }

    pub fn ping(dst: &mut BytesMut, ack: bool, payload: &[u8; 8]) {
        FrameHeader::new(FrameType::Ping, if ack { flags::ACK } else { 0 }, 0, 8).write(dst);
        dst.put_slice(payload);
    }

    pub fn goaway(dst: &mut BytesMut, last_stream_id: u32, error: Http2ErrorCode) {
        FrameHeader::new(FrameType::Goaway, 0, 0, 8).write(dst);
        dst.put_u32(last_stream_id & 0x7fff_ffff);
        dst.put_u32(error.as_u32());
    }

    pub fn rst_stream(dst: &mut BytesMut, stream_id: u32, error: Http2ErrorCode) {
        FrameHeader::new(FrameType::RstStream, 0, stream_id, 4).write(dst);
        dst.put_u32(error.as_u32());
    }

    pub fn window_update(dst: &mut BytesMut, stream_id: u32, size: u32) {
        FrameHeader::new(FrameType::WindowUpdate, 0, stream_id, 4).write(dst);
        dst.put_u32(size & 0x7fff_ffff);
    }

    pub fn priority(dst: &mut BytesMut, stream_id: u32, priority: Priority) {
        FrameHeader::new(FrameType::Priority, 0, stream_id, 5).write(dst);
        let exclusive = if priority.exclusive { 0x8000_0000 } else { 0 };
        dst.put_u32(exclusive | priority.parent_stream);
        dst.put_u8(priority.weight);
    }

    /// DATA frames of at most `max_frame_size` bytes, END_STREAM on the last one.
    pub fn data(dst: &mut BytesMut, stream_id: u32, payload: &[u8], end_stream: bool, max_frame_size: u32) {
        let flags = if end_stream { flags::END_STREAM } else { 0 };
        if payload.is_empty() {
            FrameHeader::new(FrameType::Data, flags, stream_id, 0).write(dst);
            return;
        }

        let mut chunks = payload.chunks(max_frame_size as usize).peekable();
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            FrameHeader::new(FrameType::Data, if last { flags } else { 0 }, stream_id, chunk.len() as u32).write(dst);
            dst.put_slice(chunk);
        }
    }

    /// HEADERS followed by CONTINUATION frames when the block exceeds `max_frame_size`.
    pub fn headers(dst: &mut BytesMut, stream_id: u32, block: &[u8], end_stream: bool, max_frame_size: u32) {
        let end_stream = if end_stream { flags::END_STREAM } else { 0 };
        header_block(dst, FrameType::Headers, end_stream, stream_id, &[], block, max_frame_size);
    }

    pub fn push_promise(dst: &mut BytesMut, stream_id: u32, promised_id: u32, block: &[u8], max_frame_size: u32) {
        let promised = (promised_id & 0x7fff_ffff).to_be_bytes();
        header_block(dst, FrameType::PushPromise, 0, stream_id, &promised, block, max_frame_size);
    }

    fn header_block(
        dst: &mut BytesMut,
        frame_type: FrameType,
        flags: u8,
        stream_id: u32,
        prefix: &[u8],
        block: &[u8],
        max_frame_size: u32,
    ) {
        let max = max_frame_size as usize;
        let first = block.len().min(max - prefix.len());
        let end_headers = if first == block.len() { flags::END_HEADERS } else { 0 };

        FrameHeader::new(frame_type, flags | end_headers, stream_id, (prefix.len() + first) as u32).write(dst);
        dst.put_slice(prefix);
        dst.put_slice(&block[..first]);

        let mut chunks = block[first..].chunks(max).peekable();
        while let Some(chunk) = chunks.next() {
            let end_headers = if chunks.peek().is_none() { flags::END_HEADERS } else { 0 };
            FrameHeader::new(FrameType::Continuation, end_headers, stream_id, chunk.len() as u32).write(dst);
            dst.put_slice(chunk);
        }
    }

    pub fn frame(header: FrameHeader, payload: &[u8]) -> Bytes {
        let mut dst = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        header.write(&mut dst);
        dst.put_slice(payload);
        dst.freeze()
    }
}
