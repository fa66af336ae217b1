//! Client configuration resolution.
//!
//! Values follow a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from the process environment or a `.env` file
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_CONNECT_TIMEOUT` | 30s | Connection timeout in seconds |
//! | `SSH_POLL_INTERVAL_MS` | 100ms | Completion polling interval for buffered exec |
//! | `SSH_PIPE_BUFFER_SIZE` | 10240 | Bounded pipe size for streaming output |
//! | `SSH_COMPRESSION` | true | Enable zlib compression |
//! | `SSH_KNOWN_HOSTS` | (russh default) | Known-hosts file path |
//! | `SSH_USE_SYSTEM_AGENT` | true | Fall back to the system ssh-agent during auth |
//! | `SSH_SCP_BUFFER_SIZE` | 16384 | Chunk size for SCP transfers |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default SSH connection timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default interval between connected-state checks while waiting for a channel
pub(crate) const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default bounded pipe size used for streaming output
pub(crate) const DEFAULT_PIPE_BUFFER_SIZE: usize = 10 * 1024;

/// Default SCP read/write chunk size
pub(crate) const DEFAULT_SCP_BUFFER_SIZE: usize = 16 * 1024;

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";
pub(crate) const POLL_INTERVAL_ENV_VAR: &str = "SSH_POLL_INTERVAL_MS";
pub(crate) const PIPE_BUFFER_SIZE_ENV_VAR: &str = "SSH_PIPE_BUFFER_SIZE";
pub(crate) const COMPRESSION_ENV_VAR: &str = "SSH_COMPRESSION";
pub(crate) const KNOWN_HOSTS_ENV_VAR: &str = "SSH_KNOWN_HOSTS";
pub(crate) const USE_SYSTEM_AGENT_ENV_VAR: &str = "SSH_USE_SYSTEM_AGENT";
pub(crate) const SCP_BUFFER_SIZE_ENV_VAR: &str = "SSH_SCP_BUFFER_SIZE";

/// Resolved client-wide settings shared by every session of a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub pipe_buffer_size: usize,
    pub compression: bool,
    pub known_hosts: Option<PathBuf>,
    pub use_system_agent: bool,
    pub scp_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            pipe_buffer_size: DEFAULT_PIPE_BUFFER_SIZE,
            compression: true,
            known_hosts: None,
            use_system_agent: true,
            scp_buffer_size: DEFAULT_SCP_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    /// Build a configuration from the environment, loading `.env` first.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            connect_timeout: Duration::from_secs(resolve_connect_timeout(None)),
            poll_interval: Duration::from_millis(resolve_poll_interval_ms(None)),
            pipe_buffer_size: resolve_pipe_buffer_size(None),
            compression: resolve_compression(None),
            known_hosts: resolve_known_hosts(None),
            use_system_agent: resolve_use_system_agent(None),
            scp_buffer_size: resolve_scp_buffer_size(None),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_pipe_buffer_size(mut self, size: usize) -> Self {
        self.pipe_buffer_size = size.max(1);
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = Some(path.into());
        self
    }

    pub fn with_system_agent(mut self, enabled: bool) -> Self {
        self.use_system_agent = enabled;
        self
    }

    pub fn with_scp_buffer_size(mut self, size: usize) -> Self {
        self.scp_buffer_size = size.max(1);
        self
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1" || v.eq_ignore_ascii_case("yes"))
}

/// Resolve the connection timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> u64 {
    timeout_param
        .or_else(|| parse_env(CONNECT_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS)
}

/// Resolve the completion polling interval with priority: parameter -> env var -> default
pub(crate) fn resolve_poll_interval_ms(interval_param: Option<u64>) -> u64 {
    interval_param
        .or_else(|| parse_env(POLL_INTERVAL_ENV_VAR))
        .filter(|ms| *ms > 0)
        .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
}

/// Resolve the streaming pipe size with priority: parameter -> env var -> default
pub(crate) fn resolve_pipe_buffer_size(size_param: Option<usize>) -> usize {
    size_param
        .or_else(|| parse_env(PIPE_BUFFER_SIZE_ENV_VAR))
        .filter(|size| *size > 0)
        .unwrap_or(DEFAULT_PIPE_BUFFER_SIZE)
}

/// Resolve the compression setting with priority: parameter -> env var -> default (true)
pub(crate) fn resolve_compression(compress_param: Option<bool>) -> bool {
    compress_param
        .or_else(|| parse_env_bool(COMPRESSION_ENV_VAR))
        .unwrap_or(true)
}

/// Resolve the known-hosts path with priority: parameter -> env var -> russh default (None)
pub(crate) fn resolve_known_hosts(path_param: Option<PathBuf>) -> Option<PathBuf> {
    path_param.or_else(|| {
        env::var(KNOWN_HOSTS_ENV_VAR)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
    })
}

/// Resolve whether the system agent is consulted with priority: parameter -> env var -> default (true)
pub(crate) fn resolve_use_system_agent(agent_param: Option<bool>) -> bool {
    agent_param
        .or_else(|| parse_env_bool(USE_SYSTEM_AGENT_ENV_VAR))
        .unwrap_or(true)
}

/// Resolve the SCP chunk size with priority: parameter -> env var -> default
pub(crate) fn resolve_scp_buffer_size(size_param: Option<usize>) -> usize {
    size_param
        .or_else(|| parse_env(SCP_BUFFER_SIZE_ENV_VAR))
        .filter(|size| *size > 0)
        .unwrap_or(DEFAULT_SCP_BUFFER_SIZE)
}
