mod decoder;
mod encoder;

pub use decoder::{BOM, DecodeState, SseDecoder, SseEvent, SseSink};
pub use encoder::{EventFields, MAXIMUM_HEADER_SIZE, encode_event};
