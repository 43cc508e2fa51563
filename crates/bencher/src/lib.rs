//! Shared fixtures of the gateway benchmarks.

/// A named input loaded from `resources/`.
#[derive(Debug, Copy, Clone)]
pub struct Fixture {
    name: &'static str,
    content: &'static [u8],
}

impl Fixture {
    pub const fn new(name: &'static str, content: &'static [u8]) -> Self {
        Self { name, content }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn content(&self) -> &'static [u8] {
        self.content
    }

    /// Throughput of one pass over the fixture.
    pub fn len(&self) -> u64 {
        self.content.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

pub static SMALL_REQUEST: Fixture = Fixture::new("get_small", include_bytes!("../resources/request/get_small.txt"));
pub static LARGE_REQUEST: Fixture = Fixture::new("get_large", include_bytes!("../resources/request/get_large.txt"));
pub static QUOTES: Fixture = Fixture::new("quotes", include_bytes!("../resources/events/quotes.txt"));
