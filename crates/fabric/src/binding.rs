//! Collaborators the gateways consult but do not implement.
//!
//! Route resolution, guards, access control and content validation are
//! supplied by the embedding application. The gateways only depend on the
//! traits below.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Case sensitive header lookup used during route resolution.
///
/// Names are looked up in their lowercase form.
pub trait HeaderLookup {
    fn header(&self, name: &str) -> Option<&str>;
}

impl HeaderLookup for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

impl HeaderLookup for Vec<(String, String)> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }
}

/// A resolved route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    pub id: u64,
    /// Header values replaced before the request is forwarded.
    pub overrides: Vec<(String, String)>,
    /// Protocol versions allowed on this route, empty allows all.
    pub versions: Vec<String>,
}

impl Route {
    pub fn new(id: u64) -> Self {
        Self { id, ..Default::default() }
    }

    #[must_use]
    pub fn with_override(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_versions<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.versions = versions.into_iter().map(Into::into).collect();
        self
    }

    pub fn allows_version(&self, version: &str) -> bool {
        self.versions.is_empty() || self.versions.iter().any(|v| v == version)
    }
}

pub trait RouteResolver: Send + Sync {
    fn resolve(&self, authorization: u64, headers: &dyn HeaderLookup) -> Option<Route>;
}

impl<F> RouteResolver for F
where
    F: Fn(u64, &dyn HeaderLookup) -> Option<Route> + Send + Sync,
{
    fn resolve(&self, authorization: u64, headers: &dyn HeaderLookup) -> Option<Route> {
        self(authorization, headers)
    }
}

/// Session based authorization.
///
/// A session id of `0` means the credentials were not accepted. Timestamps
/// are milliseconds on the [`Signals`](crate::Signals) clock, `None` means
/// the session never expires.
pub trait Guard: Send + Sync {
    fn reauthorize(&self, trace_id: u64, route_id: u64, stream_id: u64, credentials: &str) -> u64;

    /// Returns `true` when the session should be asked to reauthorize now.
    fn challenge(&self, session_id: u64, now: u64) -> bool;

    fn expires_at(&self, session_id: u64) -> Option<u64>;

    fn expiring_at(&self, session_id: u64) -> Option<u64>;

    fn deauthorize(&self, session_id: u64);
}

/// Cross origin policy.
pub trait AccessControl: Send + Sync {
    /// Whether the request is a preflight that should be answered directly.
    fn is_preflight(&self, headers: &dyn HeaderLookup) -> bool {
        headers.header(":method") == Some("OPTIONS")
            && headers.header("origin").is_some()
            && headers.header("access-control-request-method").is_some()
    }

    /// Headers of the preflight response, `None` rejects the preflight.
    fn preflight_headers(&self, headers: &dyn HeaderLookup) -> Option<Vec<(String, String)>>;

    fn allow_request(&self, headers: &dyn HeaderLookup) -> bool;

    /// Headers appended to responses of allowed requests.
    fn response_headers(&self, headers: &dyn HeaderLookup) -> Vec<(String, String)>;
}

/// Request body validation.
pub trait Validator: Send + Sync {
    fn validate(&self, payload: &[u8]) -> bool;
}

impl<F> Validator for F
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    fn validate(&self, payload: &[u8]) -> bool {
        self(payload)
    }
}

/// Optional collaborators of a gateway binding.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub guard: Option<Arc<dyn Guard>>,
    pub access_control: Option<Arc<dyn AccessControl>>,
    pub validator: Option<Arc<dyn Validator>>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("guard", &self.guard.is_some())
            .field("access_control", &self.access_control.is_some())
            .field("validator", &self.validator.is_some())
            .finish()
    }
}
