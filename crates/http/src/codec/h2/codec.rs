//! A `tokio_util` codec yielding whole HTTP/2 frames.
//!
//! The connection managers use the sans-IO [`Http2Decoder`](super::Http2Decoder)
//! instead. This codec is for tools that want `(FrameHeader, Bytes)` pairs
//! off a byte stream, such as tests speaking to a gateway and the benches.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use micro_http_gateway::codec::h2::{FrameCodec, FrameType, write};
//! use tokio_util::codec::Decoder;
//!
//! let mut buffer = BytesMut::new();
//! write::ping(&mut buffer, false, &[1; 8]);
//!
//! let mut codec = FrameCodec::new(16_384);
//! let (header, payload) = codec.decode(&mut buffer).unwrap().unwrap();
//! assert_eq!(header.frame_type, FrameType::Ping);
//! assert_eq!(&payload[..], &[1; 8]);
//! ```

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::h2::frame::{FRAME_HEADER_LEN, FrameHeader, PREFACE};
use crate::protocol::{Http2Error, HttpError};

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: u32,
    expect_preface: bool,
}

impl FrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size, expect_preface: false }
    }

    /// A codec that first strips the client connection preface.
    pub fn server(max_frame_size: u32) -> Self {
        Self { max_frame_size, expect_preface: true }
    }
}

impl Decoder for FrameCodec {
    type Item = (FrameHeader, Bytes);
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.expect_preface {
            if src.len() < PREFACE.len() {
                return Ok(None);
            }
            if &src[..PREFACE.len()] != PREFACE {
                return Err(Http2Error::protocol().into());
            }
            let _ = src.split_to(PREFACE.len());
            self.expect_preface = false;
        }

        let Some(header) = FrameHeader::parse(src) else {
            return Ok(None);
        };

        if header.length > self.max_frame_size {
            return Err(Http2Error::frame_size().into());
        }

        if src.len() < header.frame_len() {
            src.reserve(header.frame_len() - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(header.frame_len());
        Ok(Some((header, frame.split_off(FRAME_HEADER_LEN).freeze())))
    }
}

impl Encoder<(FrameHeader, Bytes)> for FrameCodec {
    type Error = HttpError;

    fn encode(&mut self, (header, payload): (FrameHeader, Bytes), dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(FRAME_HEADER_LEN + payload.len());
        FrameHeader { length: payload.len() as u32, ..header }.write(dst);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
