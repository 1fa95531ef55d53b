//! Pool configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Realistic desktop user agent, shared by admin and chatter launches to
/// keep the fingerprint consistent across roles.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Session pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Root directory for browser profiles and session snapshots.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Chat URL every session navigates to.
    #[serde(default = "default_chat_url")]
    pub chat_url: String,

    /// URL substrings that identify the platform's login/auth pages.
    #[serde(default = "default_login_markers")]
    pub login_url_markers: Vec<String>,

    /// User agent applied when no per-account override is stored.
    #[serde(default = "default_user_agent")]
    pub default_user_agent: String,

    /// Maximum concurrent chatter sessions per account. Headroom above this
    /// is reserved for admin and monitor activity.
    #[serde(default = "default_max_chatters")]
    pub max_chatters_per_account: usize,

    /// Global bound on simultaneous session creations, independent of the
    /// per-account limits.
    #[serde(default = "default_max_creations")]
    pub max_concurrent_creations: usize,

    /// Seconds a queued request may wait before being rejected.
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_secs: u64,

    /// Seconds of inactivity after which a session is reclaimed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Primary cleanup sweep interval in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Slow defense-in-depth sweep interval in seconds.
    #[serde(default = "default_slow_sweep_interval")]
    pub slow_sweep_interval_secs: u64,

    /// Milliseconds to wait after force-closing an account's sessions so the
    /// OS can release file handles.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Grace period in seconds before escalating a close to a hard kill.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,

    /// Hard ceiling in seconds on the whole shutdown sequence.
    #[serde(default = "default_shutdown_ceiling")]
    pub shutdown_ceiling_secs: u64,

    /// Milliseconds to wait for a launched browser's debugging endpoint.
    #[serde(default = "default_ready_timeout")]
    pub browser_ready_timeout_ms: u64,

    /// Milliseconds to let a fresh navigation settle before URL inspection.
    #[serde(default = "default_navigation_settle")]
    pub navigation_settle_ms: u64,

    /// Milliseconds to let a recovery reload settle before re-inspection.
    #[serde(default = "default_reload_settle")]
    pub reload_settle_ms: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".user_data")
}

fn default_chat_url() -> String {
    "https://privacy.com.br/Chat".to_string()
}

fn default_login_markers() -> Vec<String> {
    vec![
        "sign-in".to_string(),
        "auth".to_string(),
        "login".to_string(),
    ]
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_max_chatters() -> usize {
    8
}

fn default_max_creations() -> usize {
    10
}

fn default_queue_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    2 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    5 * 60
}

fn default_slow_sweep_interval() -> u64 {
    30 * 60
}

fn default_settle_delay() -> u64 {
    500
}

fn default_kill_grace() -> u64 {
    2
}

fn default_shutdown_ceiling() -> u64 {
    10
}

fn default_ready_timeout() -> u64 {
    6000
}

fn default_navigation_settle() -> u64 {
    2000
}

fn default_reload_settle() -> u64 {
    3000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            chat_url: default_chat_url(),
            login_url_markers: default_login_markers(),
            default_user_agent: default_user_agent(),
            max_chatters_per_account: default_max_chatters(),
            max_concurrent_creations: default_max_creations(),
            queue_timeout_secs: default_queue_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            slow_sweep_interval_secs: default_slow_sweep_interval(),
            settle_delay_ms: default_settle_delay(),
            kill_grace_secs: default_kill_grace(),
            shutdown_ceiling_secs: default_shutdown_ceiling(),
            browser_ready_timeout_ms: default_ready_timeout(),
            navigation_settle_ms: default_navigation_settle(),
            reload_settle_ms: default_reload_settle(),
        }
    }
}

impl PoolConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn slow_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.slow_sweep_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn shutdown_ceiling(&self) -> Duration {
        Duration::from_secs(self.shutdown_ceiling_secs)
    }

    pub fn browser_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.browser_ready_timeout_ms)
    }

    pub fn navigation_settle(&self) -> Duration {
        Duration::from_millis(self.navigation_settle_ms)
    }

    pub fn reload_settle(&self) -> Duration {
        Duration::from_millis(self.reload_settle_ms)
    }

    /// True when `url` is one of the platform's login pages.
    pub fn is_login_url(&self, url: &str) -> bool {
        self.login_url_markers.iter().any(|m| url.contains(m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_chatters_per_account, 8);
        assert_eq!(config.max_concurrent_creations, 10);
        assert_eq!(config.queue_timeout(), Duration::from_secs(30));
        assert_eq!(config.idle_timeout(), Duration::from_secs(7200));
        assert_eq!(config.data_dir, PathBuf::from(".user_data"));
    }

    #[test]
    fn test_login_url_detection() {
        let config = PoolConfig::default();
        assert!(config.is_login_url("https://example.com/sign-in?next=/Chat"));
        assert!(config.is_login_url("https://example.com/auth/callback"));
        assert!(config.is_login_url("https://example.com/login"));
        assert!(!config.is_login_url("https://example.com/Chat"));
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"max_chatters_per_account": 4}"#).unwrap();
        assert_eq!(config.max_chatters_per_account, 4);
        assert_eq!(config.queue_timeout_secs, 30);
        assert_eq!(config.login_url_markers.len(), 3);
    }
}
