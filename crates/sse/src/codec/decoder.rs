//! Resumable `text/event-stream` decoder.
//!
//! Like the HTTP/1.1 decoder it never owns bytes: each call reports the
//! complete events found in the given bytes and returns how many it
//! consumed. An event is only decoded once its terminating blank line has
//! arrived, partial events are left for the caller to present again.
//!
//! ```text
//! Bom -> Event -> Event
//! event too long -> Ignore
//! ```

use tracing::trace;

use crate::error::SseError;

pub const BOM: &[u8] = b"\xEF\xBB\xBF";

/// One dispatched event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event_type: Option<String>,
    /// `data` lines joined with `\n`, `None` when the event had none.
    pub data: Option<Vec<u8>>,
    pub retry: Option<u64>,
}

impl SseEvent {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.event_type.is_none() && self.data.is_none() && self.retry.is_none()
    }
}

pub trait SseSink {
    /// Offers a complete event, `false` leaves it undecoded until the next call.
    fn on_event(&mut self, event: SseEvent) -> bool;

    fn on_error(&mut self, error: SseError);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeState {
    #[default]
    Bom,
    Event,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SseDecoder {
    state: DecodeState,
    maximum_event_size: usize,
}

impl SseDecoder {
    pub fn new(maximum_event_size: usize) -> Self {
        Self { state: DecodeState::Bom, maximum_event_size }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Decodes as many complete events of `buf` as the sink accepts, returns the consumed length.
    pub fn decode<S: SseSink>(&mut self, sink: &mut S, buf: &[u8]) -> usize {
        let mut progress = 0;
        loop {
            let previous = self.state;
            let consumed = self.step(sink, &buf[progress..]);
            progress += consumed;

            if self.state != previous {
                trace!(from = ?previous, to = ?self.state, "sse decoder transition");
            } else if consumed == 0 {
                break;
            }
        }

        progress
    }

    fn step<S: SseSink>(&mut self, sink: &mut S, buf: &[u8]) -> usize {
        match self.state {
            DecodeState::Bom => self.decode_bom(buf),
            DecodeState::Event => self.decode_event(sink, buf),
            DecodeState::Ignore => buf.len(),
        }
    }

    fn decode_bom(&mut self, buf: &[u8]) -> usize {
        if buf.len() < BOM.len() && BOM.starts_with(buf) {
            return 0;
        }

        self.state = DecodeState::Event;
        if buf.starts_with(BOM) { BOM.len() } else { 0 }
    }

    fn decode_event<S: SseSink>(&mut self, sink: &mut S, buf: &[u8]) -> usize {
        let Some(limit) = limit_of_event(buf) else {
            if buf.len() >= self.maximum_event_size {
                sink.on_error(SseError::event_too_long(buf.len(), self.maximum_event_size));
                self.state = DecodeState::Ignore;
                return buf.len();
            }
            return 0;
        };

        let event = parse_event(&buf[..limit]);
        if event.is_empty() || sink.on_event(event) { limit } else { 0 }
    }
}

/// Locates the end of the line starting at `from`.
///
/// Returns the index of the terminator and the start of the next line. A
/// trailing `\r` is incomplete, a `\n` may still follow it.
fn line_end(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let index = from + buf[from..].iter().position(|&b| b == b'\r' || b == b'\n')?;
    if buf[index] == b'\n' {
        return Some((index, index + 1));
    }

    match buf.get(index + 1) {
        Some(b'\n') => Some((index, index + 2)),
        Some(_) => Some((index, index + 1)),
        None => None,
    }
}

/// Length of the first complete event in `buf`, including its blank line.
fn limit_of_event(buf: &[u8]) -> Option<usize> {
    let mut progress = 0;
    loop {
        let (end, next) = line_end(buf, progress)?;
        if end == progress {
            return Some(next);
        }
        progress = next;
    }
}

fn parse_event(block: &[u8]) -> SseEvent {
    let mut event = SseEvent::default();
    let mut progress = 0;

    while let Some((end, next)) = line_end(block, progress) {
        let line = &block[progress..end];
        progress = next;
        if line.is_empty() {
            break;
        }
        if line[0] == b':' {
            continue;
        }

        let (name, value) = match line.iter().position(|&b| b == b':') {
            Some(colon) => {
                let value = &line[colon + 1..];
                (&line[..colon], value.strip_prefix(b" ").unwrap_or(value))
            }
            None => (line, &b""[..]),
        };

        match name {
            b"data" => match &mut event.data {
                Some(data) => {
                    data.push(b'\n');
                    data.extend_from_slice(value);
                }
                None => event.data = Some(value.to_vec()),
            },
            b"id" if !value.contains(&0) => event.id = Some(String::from_utf8_lossy(value).into_owned()),
            b"event" => event.event_type = Some(String::from_utf8_lossy(value).into_owned()),
            b"retry" if !value.is_empty() && value.iter().all(u8::is_ascii_digit) => {
                event.retry = std::str::from_utf8(value).ok().and_then(|retry| retry.parse().ok());
            }
            name => trace!(field = %String::from_utf8_lossy(name), "sse field ignored"),
        }
    }

    event
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<SseEvent>,
        errors: Vec<SseError>,
        capacity: Option<usize>,
    }

    impl SseSink for Recorder {
        fn on_event(&mut self, event: SseEvent) -> bool {
            if self.capacity.is_some_and(|capacity| self.events.len() >= capacity) {
                return false;
            }
            self.events.push(event);
            true
        }

        fn on_error(&mut self, error: SseError) {
            self.errors.push(error);
        }
    }

    fn decode_all(input: &[u8]) -> (Recorder, usize) {
        let mut decoder = SseDecoder::new(1024);
        let mut recorder = Recorder::default();
        let consumed = decoder.decode(&mut recorder, input);
        (recorder, consumed)
    }

    fn data(event: &SseEvent) -> Option<&str> {
        event.data.as_deref().and_then(|data| std::str::from_utf8(data).ok())
    }

    #[test]
    fn test_fields() {
        let input = indoc! {"
            id: 42
            event: update
            data: {\"price\": 10}

        "};
        let (recorder, consumed) = decode_all(input.as_bytes());

        assert_eq!(consumed, input.len());
        assert_eq!(recorder.events.len(), 1);
        let event = &recorder.events[0];
        assert_eq!(event.id.as_deref(), Some("42"));
        assert_eq!(event.event_type.as_deref(), Some("update"));
        assert_eq!(data(event), Some("{\"price\": 10}"));
    }

    #[test]
    fn test_data_lines_joined() {
        let (recorder, _) = decode_all(b"data: first\ndata:second\ndata\n\n");
        assert_eq!(data(&recorder.events[0]), Some("first\nsecond\n"));
    }

    #[test]
    fn test_line_endings() {
        let input = b"data: a\r\n\r\ndata: b\r\rdata: c\n\n";
        let (recorder, consumed) = decode_all(input);
        assert_eq!(consumed, input.len());
        let decoded: Vec<_> = recorder.events.iter().filter_map(data).collect();
        assert_eq!(decoded, ["a", "b", "c"]);
    }

    #[test]
    fn test_comments_and_unknown_fields_ignored() {
        let input = b": keep-alive\n\nfoo: bar\ndata: x\n\n";
        let (recorder, consumed) = decode_all(input);
        assert_eq!(consumed, input.len());
        assert_eq!(recorder.events.len(), 1);
        assert_eq!(data(&recorder.events[0]), Some("x"));
    }

    #[test]
    fn test_bom_skipped_once() {
        let mut input = BOM.to_vec();
        input.extend_from_slice(b"data: a\n\n");
        let (recorder, consumed) = decode_all(&input);
        assert_eq!(consumed, input.len());
        assert_eq!(data(&recorder.events[0]), Some("a"));
    }

    #[test]
    fn test_retry() {
        let (recorder, _) = decode_all(b"retry: 3000\n\nretry: soon\ndata: x\n\n");
        assert_eq!(recorder.events[0].retry, Some(3000));
        assert_eq!(recorder.events[1].retry, None);
    }

    #[test]
    fn test_incomplete_event_left_unconsumed() {
        let mut decoder = SseDecoder::new(1024);
        let mut recorder = Recorder::default();

        assert_eq!(decoder.decode(&mut recorder, b"data: a\n"), 0);
        assert_eq!(decoder.decode(&mut recorder, b"data: a\r"), 0);
        assert!(recorder.events.is_empty());
        assert_eq!(decoder.decode(&mut recorder, b"data: a\n\n"), 9);
        assert_eq!(recorder.events.len(), 1);
    }

    #[test]
    fn test_split_at_every_boundary() {
        let input = b"\xEF\xBB\xBFid: 1\r\ndata: one\r\n\r\n: comment\n\nevent: two\ndata: 2\rdata: 2\r\r\n";
        for piece in 1..input.len() {
            let mut decoder = SseDecoder::new(1024);
            let mut recorder = Recorder::default();
            let mut pending = Vec::new();

            for bytes in input.chunks(piece) {
                pending.extend_from_slice(bytes);
                let consumed = decoder.decode(&mut recorder, &pending);
                pending.drain(..consumed);
            }

            assert!(pending.is_empty(), "left {pending:?} with piece {piece}");

            let decoded: Vec<_> = recorder.events.iter().filter_map(data).collect();
            assert_eq!(decoded, ["one", "2\n2"], "piece {piece}");
            assert_eq!(recorder.events[0].id.as_deref(), Some("1"), "piece {piece}");
            assert_eq!(recorder.events[1].event_type.as_deref(), Some("two"), "piece {piece}");
        }
    }

    #[test]
    fn test_refused_event_retried() {
        let mut decoder = SseDecoder::new(1024);
        let mut recorder = Recorder { capacity: Some(1), ..Recorder::default() };

        let input = b"data: a\n\ndata: b\n\n";
        let consumed = decoder.decode(&mut recorder, input);
        assert_eq!(consumed, 9);

        recorder.capacity = None;
        assert_eq!(decoder.decode(&mut recorder, &input[consumed..]), 9);
        assert_eq!(recorder.events.len(), 2);
    }

    #[test]
    fn test_event_too_long() {
        let mut decoder = SseDecoder::new(16);
        let mut recorder = Recorder::default();

        let input = b"data: aaaaaaaaaaaaaaaaaaaa";
        assert_eq!(decoder.decode(&mut recorder, input), input.len());
        assert_eq!(recorder.errors, [SseError::event_too_long(input.len(), 16)]);
        assert_eq!(decoder.state(), DecodeState::Ignore);
    }
}
