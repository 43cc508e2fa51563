use micro_fabric::BufferPoolConfig;
use serde::Deserialize;

use crate::protocol::HttpError;
use crate::utils::ensure;

/// Protocol versions a binding accepts or a route allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum HttpVersion {
    #[serde(rename = "http/1.1")]
    Http11,
    #[serde(rename = "h2")]
    Http2,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http11 => "http/1.1",
            HttpVersion::Http2 => "h2",
        }
    }
}

/// Gateway tuning, loaded from JSON with defaults for every missing field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub maximum_headers_size: usize,
    pub maximum_connections_per_route: usize,
    pub maximum_request_queue_size: usize,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    pub header_table_size: u32,
    pub max_concurrent_application_headers: usize,
    pub max_concurrent_streams_cleanup: usize,
    pub streams_cleanup_delay_ms: u64,
    pub max_push_promise_list_size: usize,
    pub enable_push: bool,
    pub server_header: Option<String>,
    pub versions: Vec<HttpVersion>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            maximum_headers_size: 8192,
            maximum_connections_per_route: 2,
            maximum_request_queue_size: 65536,
            max_concurrent_streams: 100,
            initial_window_size: 65535,
            max_frame_size: 16384,
            max_header_list_size: 8192,
            header_table_size: 4096,
            max_concurrent_application_headers: 10000,
            max_concurrent_streams_cleanup: 1000,
            streams_cleanup_delay_ms: 100,
            max_push_promise_list_size: 100,
            enable_push: true,
            server_header: None,
            versions: vec![HttpVersion::Http11, HttpVersion::Http2],
        }
    }
}

impl HttpConfig {
    pub fn from_json(json: &str) -> Result<Self, HttpError> {
        let config: Self = serde_json::from_str(json).map_err(HttpError::invalid_config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HttpError> {
        ensure!(self.maximum_headers_size > 0, HttpError::invalid_config("maximum_headers_size must be positive"));
        ensure!(
            self.maximum_connections_per_route > 0,
            HttpError::invalid_config("maximum_connections_per_route must be positive")
        );
        ensure!(
            (16_384..=16_777_215).contains(&self.max_frame_size),
            HttpError::invalid_config(format!("max_frame_size {} outside 16384..=16777215", self.max_frame_size))
        );
        ensure!(
            self.initial_window_size <= 0x7fff_ffff,
            HttpError::invalid_config(format!("initial_window_size {} exceeds 2^31-1", self.initial_window_size))
        );
        ensure!(
            self.max_concurrent_streams_cleanup > 0,
            HttpError::invalid_config("max_concurrent_streams_cleanup must be positive")
        );
        ensure!(!self.versions.is_empty(), HttpError::invalid_config("at least one version is required"));
        Ok(())
    }

    /// Checks the limits that depend on the buffer pool the gateway runs on.
    pub fn validate_pool(&self, pool: &BufferPoolConfig) -> Result<(), HttpError> {
        ensure!(
            self.maximum_headers_size <= pool.slot_capacity,
            HttpError::invalid_config(format!(
                "maximum_headers_size {} exceeds slot_capacity {}",
                self.maximum_headers_size, pool.slot_capacity
            ))
        );
        Ok(())
    }

    /// Longest head a decoder can hold in one slot of `slot_capacity` bytes.
    pub fn head_limit(&self, slot_capacity: usize) -> usize {
        self.maximum_headers_size.min(slot_capacity)
    }

    pub fn supports(&self, version: HttpVersion) -> bool {
        self.versions.contains(&version)
    }
}
