/// Opening metadata of an event stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseBegin {
    pub scheme: Option<String>,
    pub authority: Option<String>,
    /// Request path, with any `lastEventId` query parameter removed.
    pub path: String,
    pub last_event_id: Option<String>,
}

/// Fields of one event, its data is the frame payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseData {
    pub id: Option<String>,
    pub event_type: Option<String>,
    /// Milliseconds since the epoch, `0` when absent.
    pub timestamp: u64,
}

/// SSE metadata carried on fabric frames exchanged with the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SseExtension {
    #[default]
    Empty,
    Begin(SseBegin),
    Data(SseData),
    /// The id of the last event, reported when the stream ends.
    End(Option<String>),
}

impl SseExtension {
    pub fn begin(&self) -> Option<&SseBegin> {
        match self {
            SseExtension::Begin(begin) => Some(begin),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&SseData> {
        match self {
            SseExtension::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn end_id(&self) -> Option<&str> {
        match self {
            SseExtension::End(id) => id.as_deref(),
            _ => None,
        }
    }
}
