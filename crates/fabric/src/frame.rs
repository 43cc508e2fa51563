//! The fabric message set.
//!
//! Streams come in pairs: the *initial* stream flows from the side that
//! opened it and the *reply* stream flows back. `Begin`, `Data`, `End`,
//! `Abort` and `Flush` travel with a stream, `Window`, `Reset` and
//! `Challenge` travel against it. `Signal` is delivered to a stream by the
//! [`Signals`](crate::Signals) scheduler.
//!
//! The extension type `X` carries protocol specific metadata, for example
//! HTTP headers on `Begin` or SSE event ids on `Data`.

use std::collections::VecDeque;
use std::collections::vec_deque;

use bytes::Bytes;

use crate::window::Window;

/// Data frame flags.
pub mod flags {
    /// Last fragment of a message.
    pub const FIN: u8 = 0x01;
    /// First fragment of a message.
    pub const INIT: u8 = 0x02;
    /// A message in a single fragment.
    pub const COMPLETE: u8 = FIN | INIT;
}

/// Fields shared by every frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub stream_id: u64,
    pub sequence: u64,
    pub acknowledge: u64,
    pub maximum: u32,
    pub trace_id: u64,
    pub authorization: u64,
}

impl StreamHeader {
    pub fn new(stream_id: u64, window: &Window) -> Self {
        Self {
            stream_id,
            sequence: window.sequence,
            acknowledge: window.acknowledge,
            maximum: window.maximum,
            trace_id: 0,
            authorization: 0,
        }
    }

    #[must_use]
    pub fn traced(mut self, trace_id: u64, authorization: u64) -> Self {
        self.trace_id = trace_id;
        self.authorization = authorization;
        self
    }

    pub fn window(&self) -> Window {
        Window { sequence: self.sequence, acknowledge: self.acknowledge, maximum: self.maximum, padding: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginFrame<X> {
    pub header: StreamHeader,
    pub affinity: u64,
    pub extension: X,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame<X> {
    pub header: StreamHeader,
    pub flags: u8,
    pub budget_id: u64,
    /// Credit consumed by this frame, payload length plus padding.
    pub reserved: u32,
    pub payload: Bytes,
    pub extension: X,
}

impl<X> DataFrame<X> {
    pub fn is_init(&self) -> bool {
        self.flags & flags::INIT != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & flags::FIN != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndFrame<X> {
    pub header: StreamHeader,
    pub extension: X,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortFrame {
    pub header: StreamHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushFrame {
    pub header: StreamHeader,
    pub budget_id: u64,
    pub reserved: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowFrame {
    pub header: StreamHeader,
    pub budget_id: u64,
    pub padding: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetFrame<X> {
    pub header: StreamHeader,
    pub extension: X,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeFrame<X> {
    pub header: StreamHeader,
    pub extension: X,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalFrame {
    pub header: StreamHeader,
    pub signal: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<X> {
    Begin(BeginFrame<X>),
    Data(DataFrame<X>),
    End(EndFrame<X>),
    Abort(AbortFrame),
    Flush(FlushFrame),
    Window(WindowFrame),
    Reset(ResetFrame<X>),
    Challenge(ChallengeFrame<X>),
    Signal(SignalFrame),
}

impl<X> Frame<X> {
    pub fn header(&self) -> &StreamHeader {
        match self {
            Frame::Begin(frame) => &frame.header,
            Frame::Data(frame) => &frame.header,
            Frame::End(frame) => &frame.header,
            Frame::Abort(frame) => &frame.header,
            Frame::Flush(frame) => &frame.header,
            Frame::Window(frame) => &frame.header,
            Frame::Reset(frame) => &frame.header,
            Frame::Challenge(frame) => &frame.header,
            Frame::Signal(frame) => &frame.header,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.header().stream_id
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::Begin(_) => "BEGIN",
            Frame::Data(_) => "DATA",
            Frame::End(_) => "END",
            Frame::Abort(_) => "ABORT",
            Frame::Flush(_) => "FLUSH",
            Frame::Window(_) => "WINDOW",
            Frame::Reset(_) => "RESET",
            Frame::Challenge(_) => "CHALLENGE",
            Frame::Signal(_) => "SIGNAL",
        }
    }

    /// Whether the frame travels against its stream.
    pub fn is_throttle(&self) -> bool {
        matches!(self, Frame::Window(_) | Frame::Reset(_) | Frame::Challenge(_))
    }
}

/// Transport metadata presented on a network `Begin`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportInfo {
    pub secure: bool,
    pub alpn: Option<String>,
}

/// Extension carried by raw network byte streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NetworkExtension {
    #[default]
    Empty,
    Begin(TransportInfo),
}

/// Ordered queue of outgoing frames.
///
/// State machines push into an outbox, the owner drains it after each call.
#[derive(Debug)]
pub struct Outbox<X> {
    frames: VecDeque<Frame<X>>,
}

impl<X> Default for Outbox<X> {
    fn default() -> Self {
        Self { frames: VecDeque::new() }
    }
}

impl<X> Extend<Frame<X>> for Outbox<X> {
    fn extend<T: IntoIterator<Item = Frame<X>>>(&mut self, iter: T) {
        self.frames.extend(iter);
    }
}

impl<X> Outbox<X> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame<X>) {
        self.frames.push_back(frame);
    }

    pub fn pop(&mut self) -> Option<Frame<X>> {
        self.frames.pop_front()
    }

    pub fn drain(&mut self) -> vec_deque::Drain<'_, Frame<X>> {
        self.frames.drain(..)
    }

    pub fn take(&mut self) -> Vec<Frame<X>> {
        self.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> vec_deque::Iter<'_, Frame<X>> {
        self.frames.iter()
    }

    pub fn begin(&mut self, header: StreamHeader, affinity: u64, extension: X) {
        self.push(Frame::Begin(BeginFrame { header, affinity, extension }));
    }

    pub fn data(&mut self, header: StreamHeader, flags: u8, budget_id: u64, reserved: u32, payload: Bytes, extension: X) {
        self.push(Frame::Data(DataFrame { header, flags, budget_id, reserved, payload, extension }));
    }

    pub fn end(&mut self, header: StreamHeader, extension: X) {
        self.push(Frame::End(EndFrame { header, extension }));
    }

    pub fn abort(&mut self, header: StreamHeader) {
        self.push(Frame::Abort(AbortFrame { header }));
    }

    pub fn flush(&mut self, header: StreamHeader, budget_id: u64, reserved: u32) {
        self.push(Frame::Flush(FlushFrame { header, budget_id, reserved }));
    }

    pub fn window(&mut self, header: StreamHeader, budget_id: u64, padding: u32) {
        self.push(Frame::Window(WindowFrame { header, budget_id, padding }));
    }

    pub fn reset(&mut self, header: StreamHeader, extension: X) {
        self.push(Frame::Reset(ResetFrame { header, extension }));
    }

    pub fn challenge(&mut self, header: StreamHeader, extension: X) {
        self.push(Frame::Challenge(ChallengeFrame { header, extension }));
    }
}

impl<X> IntoIterator for Outbox<X> {
    type Item = Frame<X>;
    type IntoIter = vec_deque::IntoIter<Frame<X>>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.into_iter()
    }
}
