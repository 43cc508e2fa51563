//! Resumable HTTP/1.1 message decoder.
//!
//! The decoder never owns bytes. Each call examines the bytes it is given,
//! reports complete syntactic units to an [`Http1Sink`] and returns how many
//! bytes it consumed. Whatever is left is the caller's to buffer and present
//! again, prefixed to the next read.
//!
//! ```text
//! EmptyLines -> Headers -> HeadersOnly ------------------------> EmptyLines
//!                       -> Content ----------------------------> HeadersOnly
//!                       -> ChunkHeader -> ChunkBody -> ChunkEnd -> ChunkHeader
//!                                      -> Trailers ------------> EmptyLines
//!                       -> Upgraded
//!                       -> Delegated
//! any error -> Ignore
//! ```

use httparse::Status;
use tracing::trace;

use crate::codec::h1::head::{HeaderLine, Lines, parse_header_line};
use crate::protocol::{HeaderList, Http1Error};
use crate::utils::{CRLF, CRLFCRLF, index_of, limit_of};

/// How the body of a decoded head is framed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BodyMode {
    #[default]
    Empty,
    Content(u64),
    Chunked,
    /// Every following byte is body, until the connection ends.
    Upgraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadOutcome {
    Message(BodyMode),
    /// Leave the head unconsumed and stop, another decoder takes over.
    Delegate,
}

/// Receives the decoded units of a message.
pub trait Http1Sink {
    /// Whether a new message head may be decoded now.
    fn is_ready(&self) -> bool {
        true
    }

    /// Inspects an incomplete head, rejecting it early when it cannot become valid.
    fn on_partial_head(&mut self, head: &[u8]) -> Result<(), Http1Error>;

    /// A complete head, including the blank line.
    fn on_head(&mut self, head: &[u8]) -> Result<HeadOutcome, Http1Error>;

    /// Body bytes, returns how many were accepted.
    fn on_body(&mut self, body: &[u8]) -> usize;

    fn on_end(&mut self, trailers: HeaderList);

    fn on_error(&mut self, error: Http1Error);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeState {
    #[default]
    EmptyLines,
    Headers,
    HeadersOnly,
    Content,
    ChunkHeader,
    ChunkBody,
    ChunkEnd,
    Trailers,
    Upgraded,
    Ignore,
    Delegated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http1Decoder {
    state: DecodeState,
    maximum_headers_size: usize,
    content_remaining: u64,
    chunk_remaining: u64,
}

impl Http1Decoder {
    pub fn new(maximum_headers_size: usize) -> Self {
        Self { state: DecodeState::EmptyLines, maximum_headers_size, content_remaining: 0, chunk_remaining: 0 }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Moves to the terminal sink, further bytes are consumed and dropped.
    pub fn ignore(&mut self) {
        self.state = DecodeState::Ignore;
    }

    /// Whether the decoder is between messages.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::EmptyLines | DecodeState::Headers)
    }

    /// Decodes as much of `buf` as possible, returns the consumed length.
    pub fn decode<S: Http1Sink>(&mut self, sink: &mut S, buf: &[u8]) -> usize {
        let mut progress = 0;
        loop {
            let previous = self.state;
            let consumed = self.step(sink, &buf[progress..]);
            progress += consumed;

            if self.state != previous {
                trace!(from = ?previous, to = ?self.state, "http/1.1 decoder transition");
            } else if consumed == 0 {
                break;
            }
        }

        progress
    }

    fn step<S: Http1Sink>(&mut self, sink: &mut S, buf: &[u8]) -> usize {
        match self.state {
            DecodeState::EmptyLines => self.decode_empty_lines(buf),
            DecodeState::Headers => self.decode_headers(sink, buf),
            DecodeState::HeadersOnly => self.decode_headers_only(sink),
            DecodeState::Content => self.decode_content(sink, buf),
            DecodeState::ChunkHeader => self.decode_chunk_header(sink, buf),
            DecodeState::ChunkBody => self.decode_chunk_body(sink, buf),
            DecodeState::ChunkEnd => self.decode_chunk_end(sink, buf),
            DecodeState::Trailers => self.decode_trailers(sink, buf),
            DecodeState::Upgraded => sink.on_body(buf),
            DecodeState::Ignore => buf.len(),
            DecodeState::Delegated => 0,
        }
    }

    fn fail<S: Http1Sink>(&mut self, sink: &mut S, error: Http1Error, buf: &[u8]) -> usize {
        sink.on_error(error);
        self.state = DecodeState::Ignore;
        buf.len()
    }

    fn decode_empty_lines(&mut self, buf: &[u8]) -> usize {
        if buf.len() < CRLF.len() {
            return 0;
        }

        if buf.starts_with(CRLF) {
            CRLF.len()
        } else {
            self.state = DecodeState::Headers;
            0
        }
    }

    fn decode_headers<S: Http1Sink>(&mut self, sink: &mut S, buf: &[u8]) -> usize {
        if buf.is_empty() || !sink.is_ready() {
            return 0;
        }

        let Some(limit) = limit_of(buf, CRLFCRLF) else {
            if let Err(error) = sink.on_partial_head(buf) {
                return self.fail(sink, error, buf);
            }
            if buf.len() >= self.maximum_headers_size {
                return self.fail(sink, Http1Error::HeadersTooLarge, buf);
            }
            return 0;
        };

        match sink.on_head(&buf[..limit]) {
            Ok(HeadOutcome::Message(mode)) => {
                self.state = match mode {
                    BodyMode::Empty | BodyMode::Content(0) => DecodeState::HeadersOnly,
                    BodyMode::Content(length) => {
                        self.content_remaining = length;
                        DecodeState::Content
                    }
                    BodyMode::Chunked => DecodeState::ChunkHeader,
                    BodyMode::Upgraded => DecodeState::Upgraded,
                };
                limit
            }
            Ok(HeadOutcome::Delegate) => {
                self.state = DecodeState::Delegated;
                0
            }
            Err(error) => self.fail(sink, error, buf),
        }
    }

    fn decode_headers_only<S: Http1Sink>(&mut self, sink: &mut S) -> usize {
        sink.on_end(HeaderList::new());
        self.state = DecodeState::EmptyLines;
        0
    }

    fn decode_content<S: Http1Sink>(&mut self, sink: &mut S, buf: &[u8]) -> usize {
        let length = usize::try_from(self.content_remaining).unwrap_or(usize::MAX).min(buf.len());
        let consumed = if length > 0 { sink.on_body(&buf[..length]) } else { 0 };

        self.content_remaining -= consumed as u64;
        if self.content_remaining == 0 {
            self.state = DecodeState::HeadersOnly;
        }
        consumed
    }

    fn decode_chunk_header<S: Http1Sink>(&mut self, sink: &mut S, buf: &[u8]) -> usize {
        let Some(limit) = limit_of(buf, CRLF) else {
            if buf.len() >= self.maximum_headers_size {
                return self.fail(sink, Http1Error::BadRequest, buf);
            }
            return 0;
        };

        match httparse::parse_chunk_size(&buf[..limit]) {
            Ok(Status::Complete((consumed, 0))) => {
                self.state = DecodeState::Trailers;
                consumed
            }
            Ok(Status::Complete((consumed, size))) => {
                self.chunk_remaining = size;
                self.state = DecodeState::ChunkBody;
                consumed
            }
            Ok(Status::Partial) => 0,
            Err(_) => self.fail(sink, Http1Error::BadRequest, buf),
        }
    }

    fn decode_chunk_body<S: Http1Sink>(&mut self, sink: &mut S, buf: &[u8]) -> usize {
        let length = usize::try_from(self.chunk_remaining).unwrap_or(usize::MAX).min(buf.len());
        let consumed = if length > 0 { sink.on_body(&buf[..length]) } else { 0 };

        self.chunk_remaining -= consumed as u64;
        if self.chunk_remaining == 0 {
            self.state = DecodeState::ChunkEnd;
        }
        consumed
    }

    fn decode_chunk_end<S: Http1Sink>(&mut self, sink: &mut S, buf: &[u8]) -> usize {
        if buf.len() < CRLF.len() {
            return 0;
        }

        if !buf.starts_with(CRLF) {
            return self.fail(sink, Http1Error::BadRequest, buf);
        }

        self.state = DecodeState::ChunkHeader;
        CRLF.len()
    }

    fn decode_trailers<S: Http1Sink>(&mut self, sink: &mut S, buf: &[u8]) -> usize {
        if buf.len() < CRLF.len() {
            return 0;
        }

        if buf.starts_with(CRLF) {
            sink.on_end(HeaderList::new());
            self.state = DecodeState::EmptyLines;
            return CRLF.len();
        }

        let Some(end) = index_of(buf, CRLFCRLF) else {
            if buf.len() >= self.maximum_headers_size {
                return self.fail(sink, Http1Error::HeadersTooLarge, buf);
            }
            return 0;
        };

        let limit = end + CRLFCRLF.len();
        let mut trailers = HeaderList::new();
        for (_, line) in Lines::new(&buf[..limit], 0) {
            match parse_header_line(line) {
                HeaderLine::Field { name, value } => trailers.push(name.to_ascii_lowercase(), value),
                HeaderLine::Folded => return self.fail(sink, Http1Error::ObsoleteLineFolding, buf),
                HeaderLine::Invalid => return self.fail(sink, Http1Error::BadRequest, buf),
            }
        }

        sink.on_end(trailers);
        self.state = DecodeState::EmptyLines;
        limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h1::head::parse_request_line;

    /// Collects everything the decoder reports.
    #[derive(Debug, Default)]
    struct Recorder {
        heads: Vec<Vec<u8>>,
        body: Vec<u8>,
        ends: Vec<HeaderList>,
        errors: Vec<Http1Error>,
        body_limit: Option<usize>,
    }

    impl Http1Sink for Recorder {
        fn on_partial_head(&mut self, _head: &[u8]) -> Result<(), Http1Error> {
            Ok(())
        }

        fn on_head(&mut self, head: &[u8]) -> Result<HeadOutcome, Http1Error> {
            self.heads.push(head.to_vec());
            let line_end = index_of(head, CRLF).unwrap_or(head.len());
            parse_request_line(&head[..line_end]).ok_or(Http1Error::BadRequest)?;

            let mut mode = BodyMode::Empty;
            for (_, line) in Lines::new(head, line_end + 2) {
                if let HeaderLine::Field { name, value } = parse_header_line(line) {
                    if name.eq_ignore_ascii_case("content-length") {
                        mode = BodyMode::Content(value.parse().map_err(|_| Http1Error::BadRequest)?);
                    } else if name.eq_ignore_ascii_case("transfer-encoding") {
                        mode = BodyMode::Chunked;
                    }
                }
            }
            Ok(HeadOutcome::Message(mode))
        }

        fn on_body(&mut self, body: &[u8]) -> usize {
            let length = self.body_limit.map_or(body.len(), |limit| limit.min(body.len()));
            self.body.extend_from_slice(&body[..length]);
            if let Some(limit) = &mut self.body_limit {
                *limit -= length;
            }
            length
        }

        fn on_end(&mut self, trailers: HeaderList) {
            self.ends.push(trailers);
        }

        fn on_error(&mut self, error: Http1Error) {
            self.errors.push(error);
        }
    }

    /// Feeds `input` in pieces, buffering what the decoder leaves behind.
    fn decode_in_pieces(input: &[u8], piece: usize) -> Recorder {
        let mut decoder = Http1Decoder::new(8192);
        let mut recorder = Recorder::default();
        let mut pending = Vec::new();

        for bytes in input.chunks(piece) {
            pending.extend_from_slice(bytes);
            let consumed = decoder.decode(&mut recorder, &pending);
            pending.drain(..consumed);
        }

        assert!(pending.is_empty(), "left {pending:?} with piece {piece}");
        recorder
    }

    #[test]
    fn test_get_without_body() {
        let mut decoder = Http1Decoder::new(8192);
        let mut recorder = Recorder::default();

        let input = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(decoder.decode(&mut recorder, input), input.len());

        assert_eq!(recorder.heads, [input.to_vec()]);
        assert_eq!(recorder.ends, [HeaderList::new()]);
        assert!(recorder.body.is_empty());
        assert_eq!(decoder.state(), DecodeState::EmptyLines);
    }

    #[test]
    fn test_chunked_body() {
        let mut decoder = Http1Decoder::new(8192);
        let mut recorder = Recorder::default();

        let input = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        assert_eq!(decoder.decode(&mut recorder, input), input.len());

        assert_eq!(recorder.body, b"Wikipedia");
        assert_eq!(recorder.ends, [HeaderList::new()]);
        assert!(recorder.errors.is_empty());
    }

    #[test]
    fn test_chunked_trailers() {
        let mut decoder = Http1Decoder::new(8192);
        let mut recorder = Recorder::default();

        let input = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3;ext=1\r\nabc\r\n0\r\nGrpc-Status: 0\r\n\r\n";
        assert_eq!(decoder.decode(&mut recorder, input), input.len());

        assert_eq!(recorder.body, b"abc");
        assert_eq!(recorder.ends.len(), 1);
        assert_eq!(recorder.ends[0].get("grpc-status"), Some("0"));
    }

    #[test]
    fn test_split_at_every_boundary() {
        let input = b"POST /a HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello\
                      POST /b HTTP/1.1\r\nHost: b\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n\
                      GET /c HTTP/1.1\r\nHost: c\r\n\r\n";

        let whole = decode_in_pieces(input, input.len());
        assert_eq!(whole.heads.len(), 3);
        assert_eq!(whole.body, b"helloWikipedia");
        assert_eq!(whole.ends.len(), 3);

        for piece in 1..input.len() {
            let pieces = decode_in_pieces(input, piece);
            assert_eq!(pieces.heads, whole.heads, "piece {piece}");
            assert_eq!(pieces.body, whole.body, "piece {piece}");
            assert_eq!(pieces.ends, whole.ends, "piece {piece}");
            assert!(pieces.errors.is_empty(), "piece {piece}");
        }
    }

    #[test]
    fn test_leading_empty_lines_skipped() {
        let mut decoder = Http1Decoder::new(8192);
        let mut recorder = Recorder::default();

        let input = b"\r\n\r\nGET / HTTP/1.1\r\n\r\n";
        assert_eq!(decoder.decode(&mut recorder, input), input.len());
        assert_eq!(recorder.heads.len(), 1);
    }

    #[test]
    fn test_body_backpressure() {
        let mut decoder = Http1Decoder::new(8192);
        let mut recorder = Recorder { body_limit: Some(2), ..Default::default() };

        let input = b"PUT / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let consumed = decoder.decode(&mut recorder, input);
        assert_eq!(consumed, input.len() - 3);
        assert_eq!(decoder.state(), DecodeState::Content);
        assert!(recorder.ends.is_empty());

        recorder.body_limit = None;
        assert_eq!(decoder.decode(&mut recorder, &input[consumed..]), 3);
        assert_eq!(recorder.body, b"hello");
        assert_eq!(recorder.ends.len(), 1);
    }

    #[test]
    fn test_bad_chunk_size() {
        let mut decoder = Http1Decoder::new(8192);
        let mut recorder = Recorder::default();

        let input = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        assert_eq!(decoder.decode(&mut recorder, input), input.len());
        assert_eq!(recorder.errors, [Http1Error::BadRequest]);
        assert_eq!(decoder.state(), DecodeState::Ignore);

        assert_eq!(decoder.decode(&mut recorder, b"anything"), 8);
        assert_eq!(recorder.errors.len(), 1);
    }

    #[test]
    fn test_oversized_head() {
        let mut decoder = Http1Decoder::new(32);
        let mut recorder = Recorder::default();

        let input = b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaa";
        assert_eq!(decoder.decode(&mut recorder, input), input.len());
        assert_eq!(recorder.errors, [Http1Error::HeadersTooLarge]);
    }
}
