use crate::protocol::HeaderList;

/// HTTP metadata carried on fabric frames exchanged with the application.
///
/// `Begin` carries request or response headers, `End` carries trailers,
/// `Reset` may carry the status of a synthesized response and `Challenge`
/// carries the challenge request headers. A response `Data` frame may carry
/// a `Promise` asking the gateway to push a related resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HttpExtension {
    #[default]
    Empty,
    Headers(HeaderList),
    Promise(HeaderList),
}

impl HttpExtension {
    pub fn headers(&self) -> Option<&HeaderList> {
        match self {
            HttpExtension::Headers(headers) => Some(headers),
            _ => None,
        }
    }

    pub fn promise(&self) -> Option<&HeaderList> {
        match self {
            HttpExtension::Promise(headers) => Some(headers),
            _ => None,
        }
    }

    pub fn into_headers(self) -> HeaderList {
        match self {
            HttpExtension::Headers(headers) => headers,
            _ => HeaderList::new(),
        }
    }
}

impl From<HeaderList> for HttpExtension {
    fn from(headers: HeaderList) -> Self {
        HttpExtension::Headers(headers)
    }
}
