use std::fmt;
use std::sync::Arc;

use micro_fabric::{Collaborators, HeaderLookup, Route, RouteResolver};

use crate::config::HttpConfig;

/// Everything a gateway consults while turning messages into streams.
#[derive(Clone)]
pub struct HttpBinding {
    pub resolver: Arc<dyn RouteResolver>,
    pub collaborators: Collaborators,
    pub config: triomphe::Arc<HttpConfig>,
}

impl HttpBinding {
    pub fn new(resolver: Arc<dyn RouteResolver>, config: HttpConfig) -> Self {
        Self { resolver, collaborators: Collaborators::default(), config: triomphe::Arc::new(config) }
    }

    #[must_use]
    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn resolve(&self, authorization: u64, headers: &dyn HeaderLookup) -> Option<Route> {
        self.resolver.resolve(authorization, headers)
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }
}

impl fmt::Debug for HttpBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBinding")
            .field("collaborators", &self.collaborators)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
