//! HTTP/1.1 wire codec.

mod decoder;
mod encoder;
pub mod head;

pub use decoder::{BodyMode, DecodeState, HeadOutcome, Http1Decoder, Http1Sink};
pub use encoder::{
    CHUNK_PADDING, CONTINUE_RESPONSE, Framing, encode_chunk, encode_last_chunk, encode_request_head, encode_response_head,
};
