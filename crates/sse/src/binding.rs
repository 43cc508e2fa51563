use std::fmt;
use std::sync::Arc;

use micro_fabric::{HeaderLookup, Route, RouteResolver};

use crate::config::SseConfig;

/// Route resolution and configuration of one SSE binding.
///
/// Routes are resolved against the request headers, `:path` already stripped
/// of the `lastEventId` query parameter.
#[derive(Clone)]
pub struct SseBinding {
    pub resolver: Arc<dyn RouteResolver>,
    pub config: triomphe::Arc<SseConfig>,
}

impl SseBinding {
    pub fn new(resolver: Arc<dyn RouteResolver>, config: SseConfig) -> Self {
        Self { resolver, config: triomphe::Arc::new(config) }
    }

    pub fn resolve(&self, authorization: u64, headers: &dyn HeaderLookup) -> Option<Route> {
        self.resolver.resolve(authorization, headers)
    }

    pub fn config(&self) -> &SseConfig {
        &self.config
    }
}

impl fmt::Debug for SseBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseBinding").field("config", &self.config).finish_non_exhaustive()
    }
}
