//! Bridge configuration.
//!
//! Only the engine path and the listen address come from the outside; the
//! rest is internal policy with fixed defaults, adjustable through the
//! `with_*` builders.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::error::{BridgeError, BridgeResult};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8000;

/// Default maximum engine output line length: 4 MiB.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

/// Default per-client event queue capacity.
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 256;

/// Default engine input queue capacity.
pub const DEFAULT_ROUTER_QUEUE_CAPACITY: usize = 64;

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Default SSE keep-alive interval.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Configuration for a bridge instance.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Engine executable.
    pub engine_path: PathBuf,
    /// Arguments passed to the engine.
    pub engine_args: Vec<String>,
    /// Address the HTTP server binds to.
    pub bind_addr: SocketAddr,
    /// Longest engine output line accepted, in bytes.
    pub max_line_length: usize,
    /// Events buffered per streaming client before it is evicted.
    pub client_queue_capacity: usize,
    /// Envelopes buffered for the engine before submissions are rejected.
    pub router_queue_capacity: usize,
    /// Restart backoff.
    pub backoff: BackoffPolicy,
    /// Time the engine gets to exit after SIGTERM.
    pub shutdown_grace: Duration,
    /// Interval of SSE keep-alive comments.
    pub keep_alive_interval: Duration,
}

impl BridgeConfig {
    /// Create a configuration for `engine_path` listening on `bind_addr`.
    #[must_use]
    pub fn new(engine_path: impl Into<PathBuf>, bind_addr: SocketAddr) -> Self {
        Self {
            engine_path: engine_path.into(),
            engine_args: Vec::new(),
            bind_addr,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
            router_queue_capacity: DEFAULT_ROUTER_QUEUE_CAPACITY,
            backoff: BackoffPolicy::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
        }
    }

    /// Listen port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.bind_addr.port()
    }

    /// Set the engine arguments.
    #[must_use]
    pub fn with_engine_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.engine_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the maximum line length.
    #[must_use]
    pub const fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }

    /// Set the per-client queue capacity.
    #[must_use]
    pub const fn with_client_queue_capacity(mut self, capacity: usize) -> Self {
        self.client_queue_capacity = capacity;
        self
    }

    /// Set the engine input queue capacity.
    #[must_use]
    pub const fn with_router_queue_capacity(mut self, capacity: usize) -> Self {
        self.router_queue_capacity = capacity;
        self
    }

    /// Set the restart backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the SSE keep-alive interval.
    #[must_use]
    pub const fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Check the configuration and resolve the engine executable.
    pub fn validate(&self) -> BridgeResult<PathBuf> {
        if self.max_line_length == 0 {
            return Err(BridgeError::Config("max line length must be positive".into()));
        }
        if self.client_queue_capacity == 0 || self.router_queue_capacity == 0 {
            return Err(BridgeError::Config("queue capacities must be positive".into()));
        }
        resolve_engine_path(&self.engine_path)
    }
}

/// Locate the engine executable.
///
/// A path with a directory component must name an existing file; a bare name
/// is looked up on `PATH`.
pub fn resolve_engine_path(path: &Path) -> BridgeResult<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(BridgeError::Config("engine path is empty".into()));
    }

    if path.components().count() > 1 || path.is_absolute() {
        if is_executable(path) {
            return Ok(path.to_path_buf());
        }
        return Err(BridgeError::Config(format!(
            "engine path {} is not an executable file",
            path.display()
        )));
    }

    std::env::var_os("PATH")
        .iter()
        .flat_map(std::env::split_paths)
        .map(|dir| dir.join(path))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| {
            BridgeError::Config(format!("engine {} not found on PATH", path.display()))
        })
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::new("engine", addr());

        assert_eq!(config.port(), 9000);
        assert!(config.engine_args.is_empty());
        assert_eq!(config.max_line_length, DEFAULT_MAX_LINE_LENGTH);
        assert_eq!(config.client_queue_capacity, 256);
        assert_eq!(config.router_queue_capacity, 64);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.backoff, BackoffPolicy::default());
    }

    #[test]
    fn test_config_builder() {
        let config = BridgeConfig::new("/bin/engine", addr())
            .with_engine_args(["--stdio", "-v"])
            .with_max_line_length(128)
            .with_client_queue_capacity(4)
            .with_router_queue_capacity(2)
            .with_backoff(BackoffPolicy::new(
                Duration::from_millis(10),
                Duration::from_millis(100),
            ))
            .with_shutdown_grace(Duration::from_secs(1))
            .with_keep_alive_interval(Duration::from_secs(3));

        assert_eq!(config.engine_args, vec!["--stdio".to_string(), "-v".to_string()]);
        assert_eq!(config.max_line_length, 128);
        assert_eq!(config.client_queue_capacity, 4);
        assert_eq!(config.router_queue_capacity, 2);
        assert_eq!(config.backoff.initial_delay, Duration::from_millis(10));
        assert_eq!(config.shutdown_grace, Duration::from_secs(1));
        assert_eq!(config.keep_alive_interval, Duration::from_secs(3));
    }

    #[test]
    fn test_empty_engine_path_rejected() {
        let err = resolve_engine_path(Path::new("")).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_missing_engine_path_rejected() {
        let err = resolve_engine_path(Path::new("/definitely/not/here/engine")).unwrap_err();
        assert!(err.to_string().contains("not an executable"));
    }

    #[test]
    fn test_unknown_bare_name_rejected() {
        let err = resolve_engine_path(Path::new("no-such-engine-binary-3f9c")).unwrap_err();
        assert!(err.to_string().contains("not found on PATH"));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_from_path() {
        let resolved = resolve_engine_path(Path::new("sh")).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("sh"));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_absolute() {
        let resolved = resolve_engine_path(Path::new("/bin/sh")).unwrap();
        assert_eq!(resolved, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = BridgeConfig::new("/bin/sh", addr()).with_client_queue_capacity(0);
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }
}
