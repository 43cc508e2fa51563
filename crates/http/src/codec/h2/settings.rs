use bytes::Buf;

use crate::codec::h2::frame::MAX_WINDOW_SIZE;
use crate::config::HttpConfig;
use crate::protocol::{Http2Error, Http2ErrorCode};

pub const HEADER_TABLE_SIZE: u16 = 0x1;
pub const ENABLE_PUSH: u16 = 0x2;
pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const MAX_FRAME_SIZE: u16 = 0x5;
pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;

pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// One side's SETTINGS, RFC defaults until told otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: u32::MAX,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: u32::MAX,
        }
    }
}

impl Http2Settings {
    /// The settings this side advertises.
    pub fn local(config: &HttpConfig) -> Self {
        Self {
            header_table_size: config.header_table_size,
            enable_push: config.enable_push,
            max_concurrent_streams: config.max_concurrent_streams,
            initial_window_size: config.initial_window_size,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: config.max_header_list_size,
        }
    }

    /// Settings sent by a server in its first SETTINGS frame.
    pub fn server_entries(&self) -> Vec<(u16, u32)> {
        vec![
            (MAX_CONCURRENT_STREAMS, self.max_concurrent_streams),
            (INITIAL_WINDOW_SIZE, self.initial_window_size),
            (MAX_HEADER_LIST_SIZE, self.max_header_list_size),
        ]
    }

    /// Settings sent by a client after its preface.
    pub fn client_entries(&self) -> Vec<(u16, u32)> {
        vec![
            (ENABLE_PUSH, u32::from(self.enable_push)),
            (MAX_CONCURRENT_STREAMS, self.max_concurrent_streams),
            (INITIAL_WINDOW_SIZE, self.initial_window_size),
            (MAX_HEADER_LIST_SIZE, self.max_header_list_size),
        ]
    }

    /// Applies a SETTINGS payload, rejecting invalid values.
    ///
    /// Unknown identifiers are ignored.
    pub fn apply(&mut self, mut payload: &[u8]) -> Result<(), Http2Error> {
        if payload.len() % 6 != 0 {
            return Err(Http2Error::frame_size());
        }

        while payload.has_remaining() {
            let id = payload.get_u16();
            let value = payload.get_u32();
            match id {
                HEADER_TABLE_SIZE => self.header_table_size = value,
                ENABLE_PUSH => {
                    self.enable_push = match value {
                        0 => false,
                        1 => true,
                        _ => return Err(Http2Error::protocol()),
                    };
                }
                MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = value,
                INITIAL_WINDOW_SIZE => {
                    if i64::from(value) > MAX_WINDOW_SIZE {
                        return Err(Http2Error::connection(Http2ErrorCode::FlowControlError));
                    }
                    self.initial_window_size = value;
                }
                MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=0x00ff_ffff).contains(&value) {
                        return Err(Http2Error::protocol());
                    }
                    self.max_frame_size = value;
                }
                MAX_HEADER_LIST_SIZE => self.max_header_list_size = value,
                _ => {}
            }
        }

        Ok(())
    }
}
