//! On-disk profile layout and session artifact persistence.
//!
//! Everything under one data directory:
//!
//! ```text
//! .user_data/
//!   model_<id>_master/            master profile (validated by an admin)
//!   model_<id>_worker_<user>/     per-chatter clone of the master
//!   cookies_model_<id>.json       cookie snapshot
//!   localstorage_model_<id>.json  localStorage snapshot
//!   useragent_model_<id>.json     user-agent pin
//! ```

use std::path::{Path, PathBuf};

use browserpool_cdp::CookieParam;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tracing::{debug, warn};

use crate::error::PoolError;

/// Paths and snapshot I/O for one data directory.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    data_dir: PathBuf,
}

impl ProfileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn master_dir(&self, account_id: i64) -> PathBuf {
        self.data_dir.join(format!("model_{account_id}_master"))
    }

    pub fn worker_dir(&self, account_id: i64, user_id: i64) -> PathBuf {
        self.data_dir
            .join(format!("model_{account_id}_worker_{user_id}"))
    }

    pub fn cookies_path(&self, account_id: i64) -> PathBuf {
        self.data_dir.join(format!("cookies_model_{account_id}.json"))
    }

    pub fn localstorage_path(&self, account_id: i64) -> PathBuf {
        self.data_dir
            .join(format!("localstorage_model_{account_id}.json"))
    }

    pub fn useragent_path(&self, account_id: i64) -> PathBuf {
        self.data_dir
            .join(format!("useragent_model_{account_id}.json"))
    }

    /// A cookie snapshot is the marker that decides the sync strategy.
    pub fn has_cookie_snapshot(&self, account_id: i64) -> bool {
        self.cookies_path(account_id).is_file()
    }

    pub fn has_master(&self, account_id: i64) -> bool {
        self.master_dir(account_id).is_dir()
    }

    /// Persist the artifacts captured from a validated admin session.
    pub async fn write_artifacts(
        &self,
        account_id: i64,
        artifacts: &SessionArtifacts,
    ) -> Result<(), PoolError> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let cookies = serde_json::to_vec_pretty(&artifacts.cookies)?;
        tokio::fs::write(self.cookies_path(account_id), cookies).await?;
        if let Some(storage) = &artifacts.local_storage {
            let data = serde_json::to_vec_pretty(storage)?;
            tokio::fs::write(self.localstorage_path(account_id), data).await?;
        }
        if let Some(ua) = &artifacts.user_agent {
            let data = serde_json::to_vec_pretty(&UserAgentFile {
                user_agent: ua.clone(),
            })?;
            tokio::fs::write(self.useragent_path(account_id), data).await?;
        }
        debug!("Saved session artifacts for account {}", account_id);
        Ok(())
    }

    /// Load whatever artifacts exist. Missing files are simply absent
    /// fields, a corrupt file is an error.
    pub async fn read_artifacts(&self, account_id: i64) -> Result<SessionArtifacts, PoolError> {
        let cookies = match tokio::fs::read(self.cookies_path(account_id)).await {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let local_storage = match tokio::fs::read(self.localstorage_path(account_id)).await {
            Ok(data) => Some(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let user_agent = match tokio::fs::read(self.useragent_path(account_id)).await {
            Ok(data) => {
                let parsed: UserAgentFile = serde_json::from_slice(&data)?;
                Some(parsed.user_agent)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(SessionArtifacts {
            cookies,
            local_storage,
            user_agent,
        })
    }

    /// Rename a directory out of the way when deletion keeps failing, then
    /// reap it in the background. Returns the trash path on success.
    pub async fn trash_dir(&self, dir: &Path) -> Result<PathBuf, PoolError> {
        let millis = chrono::Utc::now().timestamp_millis();
        let trash = dir.with_file_name(format!(
            "{}_trash_{millis}",
            dir.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "profile".to_string())
        ));
        tokio::fs::rename(dir, &trash).await?;
        let reap = trash.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::fs::remove_dir_all(&reap).await {
                warn!("Background removal of {} failed: {}", reap.display(), e);
            }
        });
        Ok(trash)
    }

    /// Remove every worker directory belonging to an account.
    pub async fn remove_worker_dirs(&self, account_id: i64) -> Result<usize, PoolError> {
        let prefix = format!("model_{account_id}_worker");
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && entry.path().is_dir() {
                match tokio::fs::remove_dir_all(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        warn!("Failed to remove worker dir {}: {}", name, e);
                        if self.trash_dir(&entry.path()).await.is_ok() {
                            removed += 1;
                        }
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// Cookie shape as captured from a live browser profile. Chromium exports
/// `expirationDate` as a float and uses `no_restriction` for cross-site
/// cookies; both need remapping before re-injection over the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
    pub expiration_date: Option<f64>,
    pub host_only: bool,
    pub session: bool,
}

/// Convert exported cookies to injectable parameters.
///
/// `expirationDate` becomes `expires`; `same_site: "no_restriction"`
/// becomes `None` with `secure` forced on, which the setter requires.
pub fn sanitize_cookies(raw: &[RawCookie]) -> Vec<CookieParam> {
    raw.iter()
        .map(|c| {
            let mut secure = Some(c.secure);
            let same_site = c.same_site.as_deref().map(|s| {
                if s.eq_ignore_ascii_case("no_restriction") {
                    secure = Some(true);
                    "None".to_string()
                } else {
                    let mut chars = s.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                        None => s.to_string(),
                    }
                }
            });
            CookieParam {
                name: c.name.clone(),
                value: c.value.clone(),
                domain: Some(c.domain.clone()),
                path: Some(c.path.clone()),
                secure,
                http_only: Some(c.http_only),
                same_site,
                expires: c.expiration_date,
                ..Default::default()
            }
        })
        .collect()
}

/// Everything extracted from a validated session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionArtifacts {
    pub cookies: Vec<RawCookie>,
    pub local_storage: Option<Map<String, serde_json::Value>>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserAgentFile {
    user_agent: String,
}

/// True when an I/O error indicates the file is held open by the browser.
pub(crate) fn is_lock_error(e: &std::io::Error) -> bool {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        return true;
    }
    match e.raw_os_error() {
        // EBUSY / ETXTBSY on unix, sharing violations on windows.
        Some(16) | Some(26) => true,
        Some(32) | Some(33) if cfg!(windows) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_profile_paths() {
        let store = ProfileStore::new(".user_data");
        assert_eq!(
            store.master_dir(7),
            PathBuf::from(".user_data/model_7_master")
        );
        assert_eq!(
            store.worker_dir(7, 12),
            PathBuf::from(".user_data/model_7_worker_12")
        );
        assert_eq!(
            store.cookies_path(7),
            PathBuf::from(".user_data/cookies_model_7.json")
        );
    }

    #[test]
    fn test_sanitize_cookie_mapping() {
        let raw = RawCookie {
            name: "sid".into(),
            value: "abc".into(),
            domain: ".example.com".into(),
            path: "/".into(),
            secure: false,
            same_site: Some("no_restriction".into()),
            expiration_date: Some(1_900_000_000.5),
            ..Default::default()
        };
        let cookies = sanitize_cookies(&[raw]);
        assert_eq!(cookies.len(), 1);
        let c = &cookies[0];
        assert_eq!(c.same_site.as_deref(), Some("None"));
        assert_eq!(c.secure, Some(true));
        assert_eq!(c.expires, Some(1_900_000_000.5));
    }

    #[test]
    fn test_sanitize_preserves_lax() {
        let raw = RawCookie {
            name: "a".into(),
            value: "b".into(),
            same_site: Some("lax".into()),
            ..Default::default()
        };
        let cookies = sanitize_cookies(&[raw]);
        assert_eq!(cookies[0].same_site.as_deref(), Some("Lax"));
        assert_eq!(cookies[0].secure, Some(false));
    }

    #[tokio::test]
    async fn test_artifact_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::new(tmp.path());
        let mut storage = Map::new();
        storage.insert("token".into(), serde_json::json!("xyz"));
        let artifacts = SessionArtifacts {
            cookies: vec![RawCookie {
                name: "sid".into(),
                value: "1".into(),
                ..Default::default()
            }],
            local_storage: Some(storage),
            user_agent: Some("UA/1.0".into()),
        };
        store.write_artifacts(9, &artifacts).await.unwrap();
        assert!(store.has_cookie_snapshot(9));

        let loaded = store.read_artifacts(9).await.unwrap();
        assert_eq!(loaded.cookies.len(), 1);
        assert_eq!(loaded.cookies[0].name, "sid");
        assert_eq!(loaded.user_agent.as_deref(), Some("UA/1.0"));
        assert_eq!(
            loaded.local_storage.unwrap().get("token"),
            Some(&serde_json::json!("xyz"))
        );
    }

    #[tokio::test]
    async fn test_read_artifacts_missing_files() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::new(tmp.path());
        let loaded = store.read_artifacts(1).await.unwrap();
        assert!(loaded.cookies.is_empty());
        assert!(loaded.local_storage.is_none());
        assert!(loaded.user_agent.is_none());
    }

    #[tokio::test]
    async fn test_remove_worker_dirs() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::new(tmp.path());
        tokio::fs::create_dir_all(store.worker_dir(3, 1)).await.unwrap();
        tokio::fs::create_dir_all(store.worker_dir(3, 2)).await.unwrap();
        tokio::fs::create_dir_all(store.master_dir(3)).await.unwrap();
        tokio::fs::create_dir_all(store.worker_dir(4, 1)).await.unwrap();

        let removed = store.remove_worker_dirs(3).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.has_master(3));
        assert!(store.worker_dir(4, 1).is_dir());
    }

    #[tokio::test]
    async fn test_trash_dir_renames() {
        let tmp = TempDir::new().unwrap();
        let store = ProfileStore::new(tmp.path());
        let dir = store.master_dir(5);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let trash = store.trash_dir(&dir).await.unwrap();
        assert!(!dir.exists());
        assert!(trash
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("model_5_master_trash_"));
    }
}
