use crate::utils::errors::CarbonError;
use crate::utils::psutils::resolve_home_dir;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const STATE_DIR_ENV: &str = "CARBONRUN_HOME";
pub const DEFAULT_NODE_FACTOR: f64 = 1.17;
pub const DEFAULT_SEARCH_ENDPOINT: &str = "https://api.duckduckgo.com/";

const STATE_DIR_NAME: &str = ".carbonrun";
const CPU_LOG_FILE: &str = "log.csv";
const GPU_LOG_FILE: &str = "log-gpu.csv";
const TDP_CACHE_FILE: &str = "tdp-cache.csv";

/// Runtime settings shared by the run, tdp and report commands.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the logs and the TDP cache
    pub state_dir: PathBuf,
    /// GPU power sampling period
    pub poll_interval: Duration,
    /// Time a signalled child gets before it is killed
    pub kill_grace: Duration,
    /// Whole-node overhead multiplier applied to CPU energy
    pub node_factor: f64,
    /// Search redirector used to locate vendor spec pages
    pub search_endpoint: String,
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .or_else(resolve_home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            state_dir: home.join(STATE_DIR_NAME),
            poll_interval: Duration::from_secs(1),
            kill_grace: Duration::from_secs(5),
            node_factor: DEFAULT_NODE_FACTOR,
            search_endpoint: DEFAULT_SEARCH_ENDPOINT.to_string(),
        }
    }
}

impl Config {
    /// Defaults, with the state directory overridable through `CARBONRUN_HOME`.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var_os(STATE_DIR_ENV) {
            Some(dir) if !dir.is_empty() => config.with_state_dir(dir),
            _ => config,
        }
    }

    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_node_factor(mut self, node_factor: f64) -> Self {
        self.node_factor = node_factor;
        self
    }

    pub fn with_search_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.search_endpoint = endpoint.into();
        self
    }

    pub fn cpu_log_path(&self) -> PathBuf {
        self.state_dir.join(CPU_LOG_FILE)
    }

    pub fn gpu_log_path(&self) -> PathBuf {
        self.state_dir.join(GPU_LOG_FILE)
    }

    pub fn tdp_cache_path(&self) -> PathBuf {
        self.state_dir.join(TDP_CACHE_FILE)
    }

    /// Creates the state directory if it does not exist yet.
    pub fn ensure_state_dir(&self) -> Result<&Path, CarbonError> {
        std::fs::create_dir_all(&self.state_dir)
            .map_err(|e| CarbonError::io(&self.state_dir, e))?;
        Ok(&self.state_dir)
    }
}
