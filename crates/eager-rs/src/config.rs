//! Runtime configuration.

use serde::{Deserialize, Serialize};

use crate::env;

pub const ENV_ASYNC_BUILD: &str = "EAGER_ASYNC_BUILD";
pub const ENV_CACHE_CAPACITY: &str = "EAGER_CACHE_CAPACITY";
pub const ENV_READY_SPIN: &str = "EAGER_READY_SPIN";
pub const ENV_RELEASE_FORWARD: &str = "EAGER_RELEASE_FORWARD";
pub const ENV_EVICT_DYNAMIC: &str = "EAGER_EVICT_DYNAMIC";

/// Default number of yields `wait_ready` performs before blocking on the condition variable.
pub const DEFAULT_READY_SPIN_LIMIT: usize = 1024;

/// Knobs for [`crate::runtime::EagerRuntime`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Create kernels on the background builder thread instead of the compiling thread.
    pub async_kernel_build: bool,
    /// Maximum number of cached units; `None` keeps every unit until it is evicted explicitly.
    pub cache_capacity: Option<usize>,
    pub ready_spin_limit: usize,
    /// Clear forward-pass outputs once their last backward consumer has run.
    pub release_forward_outputs: bool,
    /// Evict units compiled on the dynamic-shape path right after they execute.
    pub evict_dynamic_units: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            async_kernel_build: true,
            cache_capacity: None,
            ready_spin_limit: DEFAULT_READY_SPIN_LIMIT,
            release_forward_outputs: true,
            evict_dynamic_units: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Defaults overlaid with `EAGER_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(value) = env::bool_var(ENV_ASYNC_BUILD) {
            self.async_kernel_build = value;
        }
        if let Some(value) = env::usize_var(ENV_CACHE_CAPACITY) {
            self.cache_capacity = (value > 0).then_some(value);
        }
        if let Some(value) = env::usize_var(ENV_READY_SPIN) {
            self.ready_spin_limit = value;
        }
        if let Some(value) = env::bool_var(ENV_RELEASE_FORWARD) {
            self.release_forward_outputs = value;
        }
        if let Some(value) = env::bool_var(ENV_EVICT_DYNAMIC) {
            self.evict_dynamic_units = value;
        }
        self
    }

    pub fn with_async_kernel_build(mut self, enabled: bool) -> Self {
        self.async_kernel_build = enabled;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: Option<usize>) -> Self {
        self.cache_capacity = capacity;
        self
    }
}
