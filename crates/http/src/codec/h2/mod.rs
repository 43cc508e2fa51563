//! HTTP/2 wire codec: frame layout, settings and the resumable decoder.

mod codec;
mod decoder;
mod frame;
mod settings;

pub use codec::FrameCodec;
pub use decoder::{DecodeState, Http2Decoder, Http2Sink};
pub use frame::{
    FRAME_HEADER_LEN, FrameHeader, FrameType, Goaway, MAX_WINDOW_SIZE, PREFACE, PREFACE_LINE, Priority, flags,
    frame_padding, headers_fragment, parse_goaway, parse_rst_stream, parse_window_update, push_promise_fragment,
    unpad, write,
};
pub use settings::{DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, Http2Settings};

pub mod setting_ids {
    pub use super::settings::{
        ENABLE_PUSH, HEADER_TABLE_SIZE, INITIAL_WINDOW_SIZE, MAX_CONCURRENT_STREAMS, MAX_FRAME_SIZE,
        MAX_HEADER_LIST_SIZE,
    };
}
