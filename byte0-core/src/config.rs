//! Engine configuration.
//!
//! Nothing here is read from disk; front ends build an [`EngineConfig`] from
//! their own flags and environment.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Path to the zero-fill executable (`dd`).
    pub tool_path: PathBuf,
    /// Block size passed to the tool as `bs=`.
    pub block_size: String,
    /// Fixed wait after unlocking so the OS can release file handles.
    pub unlock_settle: Duration,
    /// Upper bound for the unlock utility (diskpart) to finish.
    pub unlock_timeout: Duration,
    /// Time between the polite termination signal and a forced kill.
    pub kill_grace: Duration,
    /// How often the worker checks the cancel flag while waiting for output.
    pub poll_interval: Duration,
    /// Number of trailing log lines kept for `last_error`.
    pub log_tail_lines: usize,
    /// Optional hard limit for the whole zero-fill run.
    pub wipe_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tool_path: default_tool_path(),
            block_size: default_block_size().to_string(),
            unlock_settle: Duration::from_secs(3),
            unlock_timeout: Duration::from_secs(60),
            kill_grace: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            log_tail_lines: 10,
            wipe_timeout: None,
        }
    }
}

impl EngineConfig {
    pub fn with_tool_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tool_path = path.into();
        self
    }

    pub fn with_block_size(mut self, block_size: impl Into<String>) -> Self {
        self.block_size = block_size.into();
        self
    }

    pub fn with_unlock_settle(mut self, settle: Duration) -> Self {
        self.unlock_settle = settle;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_log_tail_lines(mut self, lines: usize) -> Self {
        self.log_tail_lines = lines.max(1);
        self
    }

    pub fn with_wipe_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wipe_timeout = timeout;
        self
    }
}

#[cfg(windows)]
fn default_tool_path() -> PathBuf {
    PathBuf::from(r"C:\Tools\dd\dd.exe")
}

#[cfg(not(windows))]
fn default_tool_path() -> PathBuf {
    PathBuf::from("dd")
}

#[cfg(windows)]
fn default_block_size() -> &'static str {
    "1M"
}

#[cfg(not(windows))]
fn default_block_size() -> &'static str {
    "4M"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = EngineConfig::default()
            .with_tool_path("/opt/dd")
            .with_block_size("1M")
            .with_log_tail_lines(0)
            .with_wipe_timeout(Some(Duration::from_secs(5)));
        assert_eq!(cfg.tool_path, PathBuf::from("/opt/dd"));
        assert_eq!(cfg.block_size, "1M");
        assert_eq!(cfg.log_tail_lines, 1);
        assert_eq!(cfg.wipe_timeout, Some(Duration::from_secs(5)));
        assert_eq!(cfg.unlock_settle, Duration::from_secs(3));
    }
}
