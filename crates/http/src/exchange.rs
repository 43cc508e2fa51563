//! Request/response pairs and their lifecycle toward the application.
//!
//! Each direction moves `Pending -> Open -> Closed` on its own. An exchange
//! is finished, and dropped by its connection, once both are closed.

use std::sync::Arc;

use micro_fabric::{Guard, SignalId, Signals, StreamHeader, StreamIds, Window};
use tracing::debug;

use crate::protocol::{HeaderList, HttpExtension};

/// Signal re-entering an exchange when its guard session is about to expire.
pub const CHALLENGE_SIGNAL: u32 = 1;
/// Signal re-entering an exchange when its guard session has expired.
pub const EXPIRED_SIGNAL: u32 = 2;
/// Signal re-entering a connection to continue a batched cleanup.
pub const CLEANUP_SIGNAL: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeState {
    #[default]
    Pending,
    Open,
    Closed,
}

/// What a reset of the request side turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    /// No response was sent yet, answer with this status and headers.
    Respond(HeaderList),
    /// Response bytes are already out, the network side must be torn down.
    Abort,
    Ignore,
}

#[derive(Debug)]
pub struct Exchange {
    pub request_id: u64,
    pub response_id: u64,
    pub request: Window,
    pub response: Window,
    pub request_state: ExchangeState,
    pub response_state: ExchangeState,
    pub authorization: u64,
    pub trace_id: u64,
}

impl Exchange {
    /// An exchange whose request stream this side opens.
    pub fn initiate(ids: &StreamIds, authorization: u64, trace_id: u64) -> Self {
        Self::accept(ids.supply_initial_id(), authorization, trace_id)
    }

    /// An exchange whose request stream was opened with `request_id`.
    pub fn accept(request_id: u64, authorization: u64, trace_id: u64) -> Self {
        Self {
            request_id,
            response_id: StreamIds::reply_id(request_id),
            request: Window::default(),
            response: Window::default(),
            request_state: ExchangeState::Pending,
            response_state: ExchangeState::Pending,
            authorization,
            trace_id,
        }
    }

    pub fn request_header(&self) -> StreamHeader {
        StreamHeader::new(self.request_id, &self.request).traced(self.trace_id, self.authorization)
    }

    pub fn response_header(&self) -> StreamHeader {
        StreamHeader::new(self.response_id, &self.response).traced(self.trace_id, self.authorization)
    }

    pub fn close_request(&mut self) {
        self.request_state = ExchangeState::Closed;
    }

    pub fn close_response(&mut self) {
        self.response_state = ExchangeState::Closed;
    }

    pub fn is_request_closed(&self) -> bool {
        self.request_state == ExchangeState::Closed
    }

    pub fn is_response_closed(&self) -> bool {
        self.response_state == ExchangeState::Closed
    }

    pub fn is_finished(&self) -> bool {
        self.is_request_closed() && self.is_response_closed()
    }

    /// Decides how a reset carrying `extension` propagates.
    pub fn on_reset(&self, extension: &HttpExtension) -> ResetOutcome {
        match self.response_state {
            ExchangeState::Pending => ResetOutcome::Respond(reset_response(extension)),
            ExchangeState::Open => ResetOutcome::Abort,
            ExchangeState::Closed => ResetOutcome::Ignore,
        }
    }
}

/// The response synthesized for a reset, `404` unless the reset names a status.
pub fn reset_response(extension: &HttpExtension) -> HeaderList {
    let mut headers = HeaderList::new();
    match extension.headers() {
        Some(reset) if reset.status().is_some() => {
            headers.extend(reset.iter());
        }
        _ => headers.push(":status", "404"),
    }
    headers
}

/// Headers of the challenge asking the application to have a session reauthorized.
pub fn challenge_request() -> HeaderList {
    [(":method", "POST"), ("content-type", "application/x-challenge-response")].into_iter().collect()
}

/// Reads guard credentials from the `authorization` header or the `access_token` query parameter.
pub fn credentials(headers: &HeaderList) -> Option<String> {
    if let Some(authorization) = headers.get("authorization") {
        let token = authorization.strip_prefix("Bearer ").unwrap_or(authorization);
        return Some(token.trim().to_string());
    }

    let path = headers.get(":path")?;
    let (_, query) = path.split_once('?')?;
    let params: Vec<(String, String)> = serde_urlencoded::from_str(query).ok()?;
    params.into_iter().find_map(|(name, value)| (name == "access_token").then_some(value))
}

/// A guard session tied to one exchange, with its pending expiry signals.
#[derive(Debug, Default)]
pub struct GuardSession {
    pub session_id: u64,
    expiring: Option<SignalId>,
    expired: Option<SignalId>,
}

impl GuardSession {
    pub fn none() -> Self {
        Self::default()
    }

    /// Schedules the challenge and expiry signals for `stream_id`.
    pub fn schedule(guard: &Arc<dyn Guard>, signals: &Signals, session_id: u64, stream_id: u64) -> Self {
        let mut session = Self { session_id, ..Self::default() };
        if session_id == 0 {
            return session;
        }

        if let Some(expiring_at) = guard.expiring_at(session_id) {
            session.expiring = Some(signals.signal_at(expiring_at, stream_id, CHALLENGE_SIGNAL));
        }
        if let Some(expires_at) = guard.expires_at(session_id) {
            session.expired = Some(signals.signal_at(expires_at, stream_id, EXPIRED_SIGNAL));
        }
        session
    }

    pub fn on_signal(&mut self, signal: u32) {
        match signal {
            CHALLENGE_SIGNAL => self.expiring = None,
            EXPIRED_SIGNAL => self.expired = None,
            _ => {}
        }
    }

    pub fn cancel(&mut self, signals: &Signals) {
        for id in [self.expiring.take(), self.expired.take()].into_iter().flatten() {
            signals.cancel(id);
        }
    }
}

/// Guard outcome for a request, before the route is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authorized {
    pub authorization: u64,
    pub guarded: bool,
}

/// Reauthorizes with the request credentials when a guard is configured.
pub fn authorize(
    guard: Option<&Arc<dyn Guard>>,
    headers: &HeaderList,
    binding_id: u64,
    request_id: u64,
    trace_id: u64,
    authorization: u64,
) -> Authorized {
    let Some(guard) = guard else {
        return Authorized { authorization, guarded: false };
    };

    let authorization = match credentials(headers) {
        Some(credentials) => guard.reauthorize(trace_id, binding_id, request_id, &credentials),
        None => authorization,
    };
    debug!(request_id, authorization, "guard reauthorized");
    Authorized { authorization, guarded: true }
}

#[cfg(test)]
mod tests {
    use micro_fabric::Guard;

    use super::*;

    mockall::mock! {
        pub TestGuard {}

        impl Guard for TestGuard {
            fn reauthorize(&self, trace_id: u64, route_id: u64, stream_id: u64, credentials: &str) -> u64;
            fn challenge(&self, session_id: u64, now: u64) -> bool;
            fn expires_at(&self, session_id: u64) -> Option<u64>;
            fn expiring_at(&self, session_id: u64) -> Option<u64>;
            fn deauthorize(&self, session_id: u64);
        }
    }

    #[test]
    fn test_reset_propagation() {
        let mut exchange = Exchange::accept(5, 0, 0);
        assert_eq!(exchange.response_id, 4);

        let status: HeaderList = [(":status", "403")].into_iter().collect();
        assert_eq!(exchange.on_reset(&HttpExtension::Headers(status.clone())), ResetOutcome::Respond(status));
        assert_eq!(
            exchange.on_reset(&HttpExtension::Empty),
            ResetOutcome::Respond([(":status", "404")].into_iter().collect())
        );

        exchange.response_state = ExchangeState::Open;
        assert_eq!(exchange.on_reset(&HttpExtension::Empty), ResetOutcome::Abort);

        exchange.close_response();
        exchange.close_request();
        assert_eq!(exchange.on_reset(&HttpExtension::Empty), ResetOutcome::Ignore);
        assert!(exchange.is_finished());
    }

    #[test]
    fn test_credentials() {
        let bearer: HeaderList = [("authorization", "Bearer abc.def")].into_iter().collect();
        assert_eq!(credentials(&bearer).as_deref(), Some("abc.def"));

        let query: HeaderList = [(":path", "/events?x=1&access_token=xyz")].into_iter().collect();
        assert_eq!(credentials(&query).as_deref(), Some("xyz"));

        let encoded: HeaderList = [(":path", "/events?access_token=a%2Bb%3D&x=1")].into_iter().collect();
        assert_eq!(credentials(&encoded).as_deref(), Some("a+b="));

        assert_eq!(credentials(&HeaderList::new()), None);
    }

    #[test]
    fn test_authorize_with_guard() {
        let mut guard = MockTestGuard::new();
        guard.expect_reauthorize().withf(|_, _, stream_id, credentials| *stream_id == 3 && credentials == "token").return_const(42u64);
        let guard: Arc<dyn Guard> = Arc::new(guard);

        let headers: HeaderList = [("authorization", "Bearer token")].into_iter().collect();
        let authorized = authorize(Some(&guard), &headers, 1, 3, 9, 0);
        assert_eq!(authorized, Authorized { authorization: 42, guarded: true });

        let unguarded = authorize(None, &headers, 1, 3, 9, 7);
        assert_eq!(unguarded, Authorized { authorization: 7, guarded: false });
    }

    #[test]
    fn test_session_signals() {
        let mut guard = MockTestGuard::new();
        guard.expect_expiring_at().return_const(Some(50u64));
        guard.expect_expires_at().return_const(Some(100u64));
        let guard: Arc<dyn Guard> = Arc::new(guard);

        let signals = Signals::manual();
        let mut session = GuardSession::schedule(&guard, &signals, 42, 3);
        assert_eq!(signals.pending(), 2);

        let fired = signals.poll_due(60);
        assert_eq!(fired.len(), 1);
        assert_eq!((fired[0].stream_id, fired[0].signal), (3, CHALLENGE_SIGNAL));
        session.on_signal(CHALLENGE_SIGNAL);

        session.cancel(&signals);
        assert_eq!(signals.pending(), 0);
    }
}
