//! Profile synchronization: getting a worker profile into a logged-in
//! state before the chatter navigates.
//!
//! Two strategies, chosen by whether a cookie snapshot exists:
//!
//! - **Injection**: state is replayed over the wire (stealth script,
//!   localStorage seed, user agent, sanitized cookies) before the first
//!   navigation. Heavy on-disk auth stores are skipped during the copy.
//! - **FilesystemCopy**: no snapshot, so the master profile's auth stores
//!   are copied file by file, tolerating files the browser holds locked.

use std::path::{Path, PathBuf};

use browserpool_cdp::PageHandle;
use serde_json::Map;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::profile::{is_lock_error, sanitize_cookies, ProfileStore, SessionArtifacts};

/// How a worker profile gets its logged-in state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    Injection,
    FilesystemCopy,
}

/// Profile subtrees and files that carry authentication state.
const SYNC_DIRS: &[&str] = &[
    "Default/Local Storage",
    "Default/Session Storage",
    "Default/IndexedDB",
    "Default/Service Worker",
    "Default/Network",
];

const SYNC_FILES: &[&str] = &[
    "Default/Cookies",
    "Default/Cookies-journal",
    "Default/Network/Cookies",
    "Default/Preferences",
    "Default/Web Data",
];

/// Entries that duplicate what injection already provides. Copying them
/// while the master browser is open mostly fails on locks anyway.
const HEAVY_ENTRIES: &[&str] = &[
    "Default/Cookies",
    "Default/Cookies-journal",
    "Default/Network/Cookies",
    "Default/Web Data",
    "Default/Local Storage",
    "Default/Session Storage",
];

/// Outcome of a filesystem sync. Partial copies are normal when the master
/// browser is running, so errors are collected instead of aborting.
#[derive(Debug, Default, Clone)]
pub struct CopyResult {
    pub copied: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl CopyResult {
    fn merge(&mut self, other: CopyResult) {
        self.copied += other.copied;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }
}

/// Synchronizes worker profiles and injects auth state into live pages.
pub struct ProfileSync {
    store: ProfileStore,
    config: std::sync::Arc<PoolConfig>,
}

impl ProfileSync {
    pub fn new(store: ProfileStore, config: std::sync::Arc<PoolConfig>) -> Self {
        Self { store, config }
    }

    /// Snapshot present: inject. Otherwise fall back to copying the master.
    pub fn choose_strategy(&self, account_id: i64) -> SyncStrategy {
        if self.store.has_cookie_snapshot(account_id) {
            SyncStrategy::Injection
        } else {
            SyncStrategy::FilesystemCopy
        }
    }

    /// Bring a worker profile up to date from the master.
    pub async fn sync_profile(
        &self,
        account_id: i64,
        worker_dir: &Path,
        strategy: SyncStrategy,
    ) -> Result<CopyResult, PoolError> {
        let master = self.store.master_dir(account_id);
        tokio::fs::create_dir_all(worker_dir.join("Default")).await?;

        if !master.is_dir() {
            debug!("No master profile for account {}, fresh worker", account_id);
            return Ok(CopyResult::default());
        }

        let skip_heavy = strategy == SyncStrategy::Injection;
        let mut result = CopyResult::default();

        for rel in SYNC_DIRS {
            if skip_heavy && HEAVY_ENTRIES.contains(rel) {
                result.skipped += 1;
                continue;
            }
            let src = master.join(rel);
            if src.is_dir() {
                result.merge(copy_tree(&src, &worker_dir.join(rel)).await);
            }
        }
        for rel in SYNC_FILES {
            if skip_heavy && HEAVY_ENTRIES.contains(rel) {
                result.skipped += 1;
                continue;
            }
            let src = master.join(rel);
            if src.is_file() {
                if let Some(parent) = worker_dir.join(rel).parent().map(Path::to_path_buf) {
                    tokio::fs::create_dir_all(&parent).await?;
                }
                copy_file_robust(&src, &worker_dir.join(rel), &mut result).await;
            }
        }

        info!(
            "Synced profile for account {}: {} copied, {} skipped, {} errors",
            account_id,
            result.copied,
            result.skipped,
            result.errors.len()
        );
        Ok(result)
    }

    /// Replay persisted auth state into a page. Must run before the first
    /// navigation so init scripts land on the login-relevant document.
    pub async fn inject_auth_state(
        &self,
        page: &PageHandle,
        account_id: i64,
    ) -> Result<(), PoolError> {
        let artifacts = self.store.read_artifacts(account_id).await?;
        self.inject_artifacts(page, &artifacts).await
    }

    pub async fn inject_artifacts(
        &self,
        page: &PageHandle,
        artifacts: &SessionArtifacts,
    ) -> Result<(), PoolError> {
        page.add_init_script(STEALTH_SCRIPT).await?;
        if let Some(storage) = &artifacts.local_storage {
            page.add_init_script(&local_storage_script(storage)).await?;
        }
        let ua = artifacts
            .user_agent
            .as_deref()
            .unwrap_or(&self.config.default_user_agent);
        page.set_user_agent(ua).await?;
        if !artifacts.cookies.is_empty() {
            page.set_cookies(&sanitize_cookies(&artifacts.cookies)).await?;
        }
        debug!(
            "Injected auth state: {} cookies, localStorage: {}",
            artifacts.cookies.len(),
            artifacts.local_storage.is_some()
        );
        Ok(())
    }

    /// What a landing URL means for the session, given whether a
    /// localStorage snapshot is available to drive a recovery attempt.
    pub(crate) fn landing_verdict(&self, url: &str, storage_available: bool) -> LoginVerdict {
        if !self.config.is_login_url(url) {
            LoginVerdict::LoggedIn
        } else if storage_available {
            LoginVerdict::Recoverable
        } else {
            LoginVerdict::Expired
        }
    }

    /// Check the page landed logged in. On a login redirect, retry once by
    /// re-seeding localStorage directly and reloading; init scripts only
    /// fire on navigation, so the direct write covers pages that read
    /// storage after load.
    pub async fn verify_logged_in(
        &self,
        page: &PageHandle,
        account_id: i64,
    ) -> Result<bool, PoolError> {
        let url = page.current_url().await?;
        if self.landing_verdict(&url, false) == LoginVerdict::LoggedIn {
            return Ok(true);
        }
        warn!("Landed on login page ({}), attempting storage recovery", url);

        let artifacts = self.store.read_artifacts(account_id).await?;
        match self.landing_verdict(&url, artifacts.local_storage.is_some()) {
            LoginVerdict::LoggedIn => Ok(true),
            LoginVerdict::Expired => Ok(false),
            LoginVerdict::Recoverable => {
                if let Some(storage) = &artifacts.local_storage {
                    page.evaluate(&local_storage_script(storage)).await?;
                }
                page.reload().await?;
                tokio::time::sleep(self.config.reload_settle()).await;

                // The post-reload inspection is final: no snapshot left to
                // try, so storage availability no longer matters.
                let url = page.current_url().await?;
                Ok(self.landing_verdict(&url, false) == LoginVerdict::LoggedIn)
            }
        }
    }
}

/// Outcome of one landing-URL inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoginVerdict {
    LoggedIn,
    Recoverable,
    Expired,
}

/// Copy a directory tree without recursing (async recursion needs boxing;
/// a worklist is simpler). Locked files are retried via read+write, then
/// recorded and skipped.
async fn copy_tree(src_root: &Path, dst_root: &Path) -> CopyResult {
    let mut result = CopyResult::default();
    let mut stack: Vec<(PathBuf, PathBuf)> = vec![(src_root.to_path_buf(), dst_root.to_path_buf())];

    while let Some((src, dst)) = stack.pop() {
        if let Err(e) = tokio::fs::create_dir_all(&dst).await {
            result.errors.push(format!("{}: {}", dst.display(), e));
            continue;
        }
        let mut entries = match tokio::fs::read_dir(&src).await {
            Ok(entries) => entries,
            Err(e) => {
                result.errors.push(format!("{}: {}", src.display(), e));
                continue;
            }
        };
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let src_path = entry.path();
                    let dst_path = dst.join(entry.file_name());
                    match entry.file_type().await {
                        Ok(ft) if ft.is_dir() => stack.push((src_path, dst_path)),
                        Ok(ft) if ft.is_file() => {
                            copy_file_robust(&src_path, &dst_path, &mut result).await;
                        }
                        // Symlinks (SingletonLock and friends) are not state.
                        Ok(_) => result.skipped += 1,
                        Err(e) => result.errors.push(format!("{}: {}", src_path.display(), e)),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    result.errors.push(format!("{}: {}", src.display(), e));
                    break;
                }
            }
        }
    }
    result
}

/// `fs::copy`, falling back to read-then-write when the source is held
/// open by a running browser. Still-failing files are skipped.
async fn copy_file_robust(src: &Path, dst: &Path, result: &mut CopyResult) {
    match tokio::fs::copy(src, dst).await {
        Ok(_) => result.copied += 1,
        Err(e) if is_lock_error(&e) => match tokio::fs::read(src).await {
            Ok(data) => match tokio::fs::write(dst, data).await {
                Ok(()) => result.copied += 1,
                Err(e) => {
                    result.skipped += 1;
                    result.errors.push(format!("{}: {}", dst.display(), e));
                }
            },
            Err(e) => {
                result.skipped += 1;
                result.errors.push(format!("{}: {}", src.display(), e));
            }
        },
        Err(e) => {
            result.skipped += 1;
            result.errors.push(format!("{}: {}", src.display(), e));
        }
    }
}

/// Strips the obvious automation tells before any page script runs.
pub const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
if (window.chrome === undefined) { window.chrome = { runtime: {} }; }
const originalQuery = window.navigator.permissions.query;
window.navigator.permissions.query = (parameters) =>
  parameters.name === 'notifications'
    ? Promise.resolve({ state: Notification.permission })
    : originalQuery(parameters);
"#;

/// Build a script that seeds every persisted localStorage key.
pub fn local_storage_script(storage: &Map<String, serde_json::Value>) -> String {
    let mut script = String::from("try {\n");
    for (key, value) in storage {
        let value_str = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        script.push_str(&format!(
            "  localStorage.setItem({}, {});\n",
            serde_json::Value::String(key.clone()),
            serde_json::Value::String(value_str),
        ));
    }
    script.push_str("} catch (e) {}\n");
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sync_for(dir: &Path) -> ProfileSync {
        let mut config = PoolConfig::default();
        config.data_dir = dir.to_path_buf();
        ProfileSync::new(ProfileStore::new(dir), Arc::new(config))
    }

    #[tokio::test]
    async fn test_strategy_selection() {
        let tmp = TempDir::new().unwrap();
        let sync = sync_for(tmp.path());
        assert_eq!(sync.choose_strategy(1), SyncStrategy::FilesystemCopy);

        tokio::fs::create_dir_all(tmp.path()).await.unwrap();
        tokio::fs::write(tmp.path().join("cookies_model_1.json"), "[]")
            .await
            .unwrap();
        assert_eq!(sync.choose_strategy(1), SyncStrategy::Injection);
        assert_eq!(sync.choose_strategy(2), SyncStrategy::FilesystemCopy);
    }

    #[tokio::test]
    async fn test_full_copy_includes_auth_stores() {
        let tmp = TempDir::new().unwrap();
        let sync = sync_for(tmp.path());
        let store = ProfileStore::new(tmp.path());
        let master = store.master_dir(1);
        tokio::fs::create_dir_all(master.join("Default/Local Storage/leveldb"))
            .await
            .unwrap();
        tokio::fs::write(
            master.join("Default/Local Storage/leveldb/000001.log"),
            b"data",
        )
        .await
        .unwrap();
        tokio::fs::write(master.join("Default/Cookies"), b"sqlite")
            .await
            .unwrap();
        tokio::fs::write(master.join("Default/Preferences"), b"{}")
            .await
            .unwrap();

        let worker = store.worker_dir(1, 5);
        let result = sync
            .sync_profile(1, &worker, SyncStrategy::FilesystemCopy)
            .await
            .unwrap();
        assert_eq!(result.copied, 3);
        assert!(result.errors.is_empty());
        assert!(worker.join("Default/Cookies").is_file());
        assert!(worker
            .join("Default/Local Storage/leveldb/000001.log")
            .is_file());
    }

    #[tokio::test]
    async fn test_injection_copy_skips_heavy_entries() {
        let tmp = TempDir::new().unwrap();
        let sync = sync_for(tmp.path());
        let store = ProfileStore::new(tmp.path());
        let master = store.master_dir(2);
        tokio::fs::create_dir_all(master.join("Default/Local Storage"))
            .await
            .unwrap();
        tokio::fs::create_dir_all(master.join("Default/IndexedDB"))
            .await
            .unwrap();
        tokio::fs::write(master.join("Default/Cookies"), b"sqlite")
            .await
            .unwrap();
        tokio::fs::write(master.join("Default/IndexedDB/db"), b"x")
            .await
            .unwrap();
        tokio::fs::write(master.join("Default/Preferences"), b"{}")
            .await
            .unwrap();

        let worker = store.worker_dir(2, 5);
        let result = sync
            .sync_profile(2, &worker, SyncStrategy::Injection)
            .await
            .unwrap();
        // Cookies and Local Storage skipped, IndexedDB and Preferences copied.
        assert!(!worker.join("Default/Cookies").exists());
        assert!(!worker.join("Default/Local Storage").exists());
        assert!(worker.join("Default/IndexedDB/db").is_file());
        assert!(worker.join("Default/Preferences").is_file());
        assert_eq!(result.copied, 2);
        assert!(result.skipped >= 2);
    }

    #[tokio::test]
    async fn test_sync_without_master_creates_fresh_worker() {
        let tmp = TempDir::new().unwrap();
        let sync = sync_for(tmp.path());
        let worker = tmp.path().join("model_9_worker_1");
        let result = sync
            .sync_profile(9, &worker, SyncStrategy::FilesystemCopy)
            .await
            .unwrap();
        assert_eq!(result.copied, 0);
        assert!(worker.join("Default").is_dir());
    }

    #[test]
    fn test_landing_verdict_drives_two_phase_recovery() {
        let tmp = TempDir::new().unwrap();
        let sync = sync_for(tmp.path());

        // Clean landing: logged in, nothing to recover.
        assert_eq!(
            sync.landing_verdict("https://privacy.com.br/Chat", true),
            LoginVerdict::LoggedIn
        );
        // Login redirect with a snapshot: one storage replay + reload.
        assert_eq!(
            sync.landing_verdict("https://privacy.com.br/sign-in?next=/Chat", true),
            LoginVerdict::Recoverable
        );
        assert_eq!(
            sync.landing_verdict("https://privacy.com.br/auth/callback", true),
            LoginVerdict::Recoverable
        );
        // No snapshot to replay: expired without a retry.
        assert_eq!(
            sync.landing_verdict("https://privacy.com.br/login", false),
            LoginVerdict::Expired
        );
        // Post-reload inspection: still on a login page means expired,
        // anywhere else means the recovery took.
        assert_eq!(
            sync.landing_verdict("https://privacy.com.br/sign-in", false),
            LoginVerdict::Expired
        );
        assert_eq!(
            sync.landing_verdict("https://privacy.com.br/Chat", false),
            LoginVerdict::LoggedIn
        );
    }

    #[test]
    fn test_local_storage_script_escapes() {
        let mut storage = Map::new();
        storage.insert("auth'key".into(), serde_json::json!("va\"lue"));
        storage.insert("obj".into(), serde_json::json!({"a": 1}));
        let script = local_storage_script(&storage);
        assert!(script.contains(r#"localStorage.setItem("auth'key", "va\"lue")"#));
        assert!(script.contains(r#"localStorage.setItem("obj", "{\"a\":1}")"#));
        assert!(script.starts_with("try {"));
    }
}
