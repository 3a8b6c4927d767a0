use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::EndpointError;

/// Default number of endpoint slots (and token entries).
pub const DEFAULT_MAX_ENDPOINTS: u32 = 1024;

/// Default data capacity of each endpoint queue, in bytes.
pub const DEFAULT_QUEUE_CAPACITY: u32 = 64 * 1024;

/// Default upper bound on any single blocking wait before liveness is
/// re-checked.
pub const DEFAULT_WAIT_TICK: Duration = Duration::from_millis(100);

/// Longest segment directory path the registry header can carry.
pub const MAX_SEGMENT_DIR_LEN: usize = 255;

/// Configuration for creating a registry.
///
/// Persisted into the registry header on create; `EndpointRegistry::open`
/// reads it back from there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Endpoint slots in the shared table. Also sizes the token table.
    pub max_endpoints: u32,
    /// Queue capacity per endpoint (power of 2).
    pub queue_capacity: u32,
    /// Tick for every blocking wait.
    pub wait_tick: Duration,
    /// Directory holding queue segment files.
    pub segment_dir: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_endpoints: DEFAULT_MAX_ENDPOINTS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            wait_tick: DEFAULT_WAIT_TICK,
            segment_dir: default_segment_dir(),
        }
    }
}

impl RegistryConfig {
    /// Defaults overlaid with `RETRIEVE_MAX_ENDPOINTS`,
    /// `RETRIEVE_QUEUE_CAPACITY`, `RETRIEVE_WAIT_TICK_MS` and
    /// `RETRIEVE_SEGMENT_DIR`. Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_number("RETRIEVE_MAX_ENDPOINTS") {
            config.max_endpoints = v;
        }
        if let Some(v) = env_number("RETRIEVE_QUEUE_CAPACITY") {
            config.queue_capacity = v;
        }
        if let Some(v) = env_number("RETRIEVE_WAIT_TICK_MS") {
            config.wait_tick = Duration::from_millis(v.into());
        }
        if let Some(dir) = std::env::var_os("RETRIEVE_SEGMENT_DIR") {
            config.segment_dir = dir.into();
        }
        config
    }

    pub fn with_max_endpoints(mut self, max_endpoints: u32) -> Self {
        self.max_endpoints = max_endpoints;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: u32) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_wait_tick(mut self, wait_tick: Duration) -> Self {
        self.wait_tick = wait_tick;
        self
    }

    pub fn with_segment_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.segment_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn validate(&self) -> Result<(), EndpointError> {
        if self.max_endpoints == 0 {
            return Err(EndpointError::InvalidConfig("max_endpoints must be non-zero"));
        }
        if self.max_endpoints > 1 << 20 {
            return Err(EndpointError::InvalidConfig("max_endpoints is too large"));
        }
        if !self.queue_capacity.is_power_of_two() || self.queue_capacity < 64 {
            return Err(EndpointError::InvalidConfig(
                "queue_capacity must be a power of 2 of at least 64",
            ));
        }
        if self.wait_tick.is_zero() || self.wait_tick.as_millis() > u32::MAX as u128 {
            return Err(EndpointError::InvalidConfig(
                "wait_tick must be between 1ms and u32::MAX ms",
            ));
        }
        if self.segment_dir.as_os_str().len() > MAX_SEGMENT_DIR_LEN {
            return Err(EndpointError::InvalidConfig("segment_dir path is too long"));
        }
        Ok(())
    }
}

/// `/dev/shm` when available, the temp dir otherwise.
pub fn default_segment_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

fn env_number(key: &str) -> Option<u32> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
