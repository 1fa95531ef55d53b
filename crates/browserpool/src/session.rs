//! Session records, keys and handles.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::launcher::BrowserContext;

/// Role a session was opened under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    /// Validation/login session. At most one per account.
    Admin,
    /// Headless operator session. Bounded pool per account.
    Chatter,
    /// Read-only observer on the master profile.
    Monitor,
}

impl SessionRole {
    /// True for roles that count against the admin exclusivity slot.
    pub fn is_admin(&self) -> bool {
        matches!(self, SessionRole::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionRole::Admin => "admin",
            SessionRole::Chatter => "chatter",
            SessionRole::Monitor => "monitor",
        }
    }
}

/// Composite session key. Unique within the live-session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionKey {
    pub account_id: i64,
    pub user_id: i64,
    pub role: SessionRole,
}

impl SessionKey {
    pub fn admin(account_id: i64, user_id: i64) -> Self {
        Self {
            account_id,
            user_id,
            role: SessionRole::Admin,
        }
    }

    pub fn chatter(account_id: i64, user_id: i64) -> Self {
        Self {
            account_id,
            user_id,
            role: SessionRole::Chatter,
        }
    }

    pub fn monitor(account_id: i64, user_id: i64) -> Self {
        Self {
            account_id,
            user_id,
            role: SessionRole::Monitor,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.account_id,
            self.user_id,
            self.role.as_str()
        )
    }
}

/// Handle to the underlying browser, exhaustive over the two launch modes.
///
/// A session holds exactly one of these: a detached native process (admin
/// validation, monitoring) or a CDP-driven automation context (chatters).
pub enum SessionHandle {
    /// Detached native browser process, tracked by PID. The process itself
    /// is reaped by a watcher task owned by the lifecycle controller; `None`
    /// means the PID was never known (the close becomes a no-op).
    Native { pid: Option<i32> },
    /// Programmatic automation context.
    Context(Arc<BrowserContext>),
}

impl SessionHandle {
    /// Close the underlying browser, escalating to a hard kill after
    /// `grace`. Failures are logged and swallowed: a close must never stop
    /// table maintenance.
    pub async fn close(&self, grace: Duration) {
        match self {
            SessionHandle::Native { pid } => {
                if let Some(pid) = *pid {
                    terminate_pid(pid);
                    if !grace.is_zero() {
                        tokio::time::sleep(grace).await;
                    }
                    kill_pid(pid);
                }
            }
            SessionHandle::Context(ctx) => ctx.close(grace).await,
        }
    }

    /// Immediate hard kill, no grace.
    pub fn force_kill(&self) {
        match self {
            SessionHandle::Native { pid } => {
                if let Some(pid) = *pid {
                    kill_pid(pid);
                }
            }
            SessionHandle::Context(ctx) => ctx.force_kill(),
        }
    }

    /// Automation context, if this is a context-backed session.
    pub fn context(&self) -> Option<Arc<BrowserContext>> {
        match self {
            SessionHandle::Context(ctx) => Some(ctx.clone()),
            SessionHandle::Native { .. } => None,
        }
    }
}

#[cfg(unix)]
fn terminate_pid(pid: i32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!("SIGTERM to pid {} failed: {}", pid, e);
    }
}

#[cfg(unix)]
fn kill_pid(pid: i32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!("SIGKILL to pid {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn terminate_pid(pid: i32) {
    debug!("No signal support on this platform for pid {}", pid);
}

#[cfg(not(unix))]
fn kill_pid(pid: i32) {
    debug!("No signal support on this platform for pid {}", pid);
}

/// One live browser session.
pub struct SessionRecord {
    pub key: SessionKey,
    pub handle: SessionHandle,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Denormalized display fields for observability and audit.
    pub user_name: Option<String>,
    pub account_name: Option<String>,
    pub chat_group: Option<String>,
}

impl SessionRecord {
    pub fn new(key: SessionKey, handle: SessionHandle) -> Self {
        let now = Utc::now();
        Self {
            key,
            handle,
            started_at: now,
            last_activity: now,
            user_name: None,
            account_name: None,
            chat_group: None,
        }
    }

    pub fn with_names(
        mut self,
        user_name: Option<String>,
        account_name: Option<String>,
        chat_group: Option<String>,
    ) -> Self {
        self.user_name = user_name;
        self.account_name = account_name;
        self.chat_group = chat_group;
        self
    }

    /// Test/stub record with no live process behind it.
    pub fn detached(key: SessionKey) -> Self {
        Self::new(key, SessionHandle::Native { pid: None })
    }
}

/// Outcome status of a public session operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Success,
    Failed,
}

/// Result contract returned across the pool boundary. Never a raw error.
#[derive(Debug, Clone, Serialize)]
pub struct StartResult {
    pub status: SessionStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl StartResult {
    pub fn success(message: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            status: SessionStatus::Success,
            message: message.into(),
            session_id,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Failed,
            message: message.into(),
            session_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SessionStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        assert_eq!(SessionKey::chatter(42, 7).to_string(), "42_7_chatter");
        assert_eq!(SessionKey::admin(3, 0).to_string(), "3_0_admin");
        assert_eq!(SessionKey::monitor(5, 9).to_string(), "5_9_monitor");
    }

    #[test]
    fn test_key_equality_includes_role() {
        assert_ne!(SessionKey::chatter(1, 1), SessionKey::monitor(1, 1));
        assert_eq!(SessionKey::chatter(1, 1), SessionKey::chatter(1, 1));
    }

    #[tokio::test]
    async fn test_detached_handle_close_is_noop() {
        let record = SessionRecord::detached(SessionKey::chatter(1, 2));
        // No PID behind it: close must return without side effects.
        record.handle.close(Duration::ZERO).await;
        record.handle.force_kill();
    }

    #[test]
    fn test_start_result_serialization() {
        let ok = StartResult::success("Conectado", Some("42_7_chatter".to_string()));
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["sessionId"].as_str(), None); // field is snake_case
        assert_eq!(value["session_id"], "42_7_chatter");

        let failed = StartResult::failed("Sessão expirada");
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["status"], "failed");
        assert!(value.get("session_id").is_none());
    }
}
