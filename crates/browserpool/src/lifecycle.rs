//! Session lifecycle: the public operations callers actually invoke.
//!
//! Every path funnels through the resource manager for admission, so the
//! per-account limits hold no matter which operation races which.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::account::AccountStore;
use crate::audit::{self, AuditEntry, AuditSink};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::launcher::{release_profile_lock, LaunchOptions, Launcher};
use crate::manager::ResourceManager;
use crate::profile::{ProfileStore, SessionArtifacts};
use crate::session::{SessionHandle, SessionKey, SessionRecord, SessionRole, StartResult};
use crate::sync::{ProfileSync, SyncStrategy};

pub struct SessionController {
    config: Arc<PoolConfig>,
    manager: Arc<ResourceManager>,
    store: ProfileStore,
    sync: Arc<ProfileSync>,
    launcher: Arc<Launcher>,
    accounts: Arc<dyn AccountStore>,
    audit: Arc<dyn AuditSink>,
}

impl SessionController {
    pub fn new(
        config: Arc<PoolConfig>,
        accounts: Arc<dyn AccountStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Arc<Self> {
        let manager = Arc::new(ResourceManager::new(config.clone(), audit.clone()));
        let store = ProfileStore::new(config.data_dir.clone());
        let sync = Arc::new(ProfileSync::new(store.clone(), config.clone()));
        let launcher = Arc::new(Launcher::new(config.clone()));
        Arc::new(Self {
            config,
            manager,
            store,
            sync,
            launcher,
            accounts,
            audit,
        })
    }

    pub fn manager(&self) -> &Arc<ResourceManager> {
        &self.manager
    }

    pub fn profile_store(&self) -> &ProfileStore {
        &self.store
    }

    /// Open a session. Admins get a visible validation browser; everyone
    /// else gets (or reuses) a headless chatter session. Errors surface as
    /// a failed `StartResult` with a user-facing message, never as `Err`.
    pub async fn start_session(
        self: &Arc<Self>,
        account_id: i64,
        user_id: i64,
        is_admin: bool,
    ) -> StartResult {
        if is_admin {
            return self.open_validation(account_id, user_id).await;
        }

        // Reuse a live session when its browser still answers.
        let key = SessionKey::chatter(account_id, user_id);
        if let Some(ctx) = self.manager.session_context(account_id, user_id) {
            if ctx.page_count().await > 0 {
                self.manager.update_activity(&key);
                info!("Reusing live session {}", key);
                return StartResult::success("Sessão recuperada", Some(key.to_string()));
            }
            // Browser is gone; clear the stale record before relaunching.
            if let Some(stale) = self.manager.remove_session(&key) {
                stale.handle.close(Duration::ZERO).await;
            }
        }

        let account = match self.accounts.account(account_id).await {
            Some(account) => account,
            None => return StartResult::failed(PoolError::MissingCredentials.user_message()),
        };
        if account.platform_email.is_none() || account.platform_password.is_none() {
            return StartResult::failed(PoolError::MissingCredentials.user_message());
        }
        let user = self.accounts.user(user_id).await;

        let controller = self.clone();
        let account_name = account.name.clone();
        let chat_group = account.chat_group.clone();
        let proxy_url = account.proxy_url.clone();
        let user_name = user.as_ref().map(|u| u.name.clone());
        let outcome = self
            .manager
            .queue_session(
                account_id,
                user_id,
                false,
                Box::new(move || {
                    Box::pin(async move {
                        controller
                            .create_chatter_session(
                                account_id,
                                user_id,
                                account_name,
                                chat_group,
                                proxy_url,
                                user_name,
                            )
                            .await
                    })
                }),
            )
            .await;
        match outcome {
            Ok(result) => result,
            Err(e) => StartResult::failed(e.user_message()),
        }
    }

    async fn create_chatter_session(
        self: Arc<Self>,
        account_id: i64,
        user_id: i64,
        account_name: String,
        chat_group: Option<String>,
        proxy_url: Option<String>,
        user_name: Option<String>,
    ) -> Result<StartResult, PoolError> {
        let key = SessionKey::chatter(account_id, user_id);
        let worker_dir = self.store.worker_dir(account_id, user_id);
        let strategy = self.sync.choose_strategy(account_id);

        if strategy == SyncStrategy::Injection {
            // Stale on-disk state can shadow injected state; start clean.
            if worker_dir.is_dir() {
                if let Err(e) = tokio::fs::remove_dir_all(&worker_dir).await {
                    warn!("Could not wipe worker dir {}: {}", worker_dir.display(), e);
                }
            }
        } else if !self.manager.admin_slot_held(account_id) {
            // Copying reads the master directly; break its lock only when
            // no validation window could be using it.
            release_profile_lock(&self.store.master_dir(account_id)).await;
        }

        self.sync
            .sync_profile(account_id, &worker_dir, strategy)
            .await?;

        let artifacts = self.store.read_artifacts(account_id).await?;
        let ctx = self
            .launcher
            .launch(&LaunchOptions {
                profile_dir: worker_dir,
                headless: true,
                admin: false,
                proxy_url,
                user_agent: artifacts.user_agent.clone(),
            })
            .await?;
        let ctx = Arc::new(ctx);

        let page = match ctx.first_page().await {
            Ok(page) => page,
            Err(e) => {
                ctx.close(Duration::ZERO).await;
                return Err(e);
            }
        };

        // State must be in place before the first navigation so init
        // scripts and cookies apply to the chat origin.
        if strategy == SyncStrategy::Injection {
            if let Err(e) = self.sync.inject_artifacts(&page, &artifacts).await {
                ctx.close(Duration::ZERO).await;
                return Err(e);
            }
        }

        let record = SessionRecord::new(key, SessionHandle::Context(ctx.clone())).with_names(
            user_name.clone(),
            Some(account_name.clone()),
            chat_group,
        );
        self.manager.add_session(record);

        let navigated = async {
            page.navigate(&self.config.chat_url).await?;
            tokio::time::sleep(self.config.navigation_settle()).await;
            self.sync.verify_logged_in(&page, account_id).await
        }
        .await;

        match navigated {
            Ok(true) => {
                if let Some(user) = &user_name {
                    audit::emit(
                        self.audit.clone(),
                        AuditEntry {
                            actor: user.clone(),
                            role: "chatter".to_string(),
                            message: format!("entrou no chat de {account_name}"),
                        },
                    );
                }
                info!("Session {} connected", key);
                Ok(StartResult::success(
                    "Conectado à conta da modelo com sucesso!",
                    Some(key.to_string()),
                ))
            }
            Ok(false) => {
                warn!("Session {} landed logged out", key);
                self.manager.remove_session(&key);
                ctx.close(self.config.kill_grace()).await;
                Ok(StartResult::failed(PoolError::SessionExpired.user_message()))
            }
            Err(e) => {
                error!("Session {} failed after launch: {}", key, e);
                self.manager.remove_session(&key);
                ctx.close(Duration::ZERO).await;
                Err(e)
            }
        }
    }

    /// Open a visible validation browser on the master profile. Queued as
    /// an admin request, so it waits out any live sessions on the account.
    pub async fn open_validation(self: &Arc<Self>, account_id: i64, user_id: i64) -> StartResult {
        let account = match self.accounts.account(account_id).await {
            Some(account) => account,
            None => return StartResult::failed(PoolError::AccountNotFound(account_id).user_message()),
        };

        // A new validation replaces any previous one on the account.
        let previous_admin = self
            .manager
            .active_sessions()
            .into_iter()
            .find(|s| s.account_id == account_id && s.role == SessionRole::Admin);
        if let Some(info) = previous_admin {
            let key = SessionKey::admin(info.account_id, info.user_id);
            info!("Replacing previous validation session {}", key);
            if let Some(old) = self.manager.remove_session(&key) {
                old.handle.close(self.config.kill_grace()).await;
            }
        }

        let controller = self.clone();
        let proxy_url = account.proxy_url.clone();
        let account_name = account.name.clone();
        let outcome = self
            .manager
            .queue_session(
                account_id,
                user_id,
                true,
                Box::new(move || {
                    Box::pin(async move {
                        controller
                            .spawn_native_session(
                                SessionKey::admin(account_id, user_id),
                                account_name,
                                proxy_url,
                                "Navegador de validação aberto. Faça login manualmente.",
                            )
                            .await
                    })
                }),
            )
            .await;
        match outcome {
            Ok(result) => result,
            Err(e) => StartResult::failed(e.user_message()),
        }
    }

    /// Open a visible read-only browser on the master profile. Counts as a
    /// regular (non-admin) slot, so it cannot displace a validation.
    pub async fn open_monitor(self: &Arc<Self>, account_id: i64, user_id: i64) -> StartResult {
        let account = match self.accounts.account(account_id).await {
            Some(account) => account,
            None => return StartResult::failed(PoolError::AccountNotFound(account_id).user_message()),
        };

        let controller = self.clone();
        let proxy_url = account.proxy_url.clone();
        let account_name = account.name.clone();
        let outcome = self
            .manager
            .queue_session(
                account_id,
                user_id,
                false,
                Box::new(move || {
                    Box::pin(async move {
                        controller
                            .spawn_native_session(
                                SessionKey::monitor(account_id, user_id),
                                account_name,
                                proxy_url,
                                "Navegador de monitoramento aberto.",
                            )
                            .await
                    })
                }),
            )
            .await;
        match outcome {
            Ok(result) => result,
            Err(e) => StartResult::failed(e.user_message()),
        }
    }

    /// A monitor must leave the master lock alone while a validation is
    /// live *or still launching* (admin slot reserved, process not yet in
    /// the table). An admin only defers to a live admin; its own
    /// reservation is always held at this point and must not suppress the
    /// release.
    fn can_release_master_lock(&self, key: &SessionKey) -> bool {
        if key.role == SessionRole::Monitor {
            !self.manager.admin_slot_held(key.account_id)
        } else {
            !self.manager.has_active_admin_session(key.account_id)
        }
    }

    /// Spawn a detached native window on the master profile and register
    /// it. A watcher task reaps the process and retires the record when
    /// the user closes the window.
    async fn spawn_native_session(
        self: Arc<Self>,
        key: SessionKey,
        account_name: String,
        proxy_url: Option<String>,
        message: &'static str,
    ) -> Result<StartResult, PoolError> {
        let master = self.store.master_dir(key.account_id);
        tokio::fs::create_dir_all(&master).await?;
        if self.can_release_master_lock(&key) {
            release_profile_lock(&master).await;
        }

        let (mut child, pid) =
            self.launcher
                .spawn_native(&master, &self.config.chat_url, proxy_url.as_deref())?;

        let record = SessionRecord::new(key, SessionHandle::Native { pid }).with_names(
            Some(if key.role == SessionRole::Monitor {
                "Monitor".to_string()
            } else {
                "Admin".to_string()
            }),
            Some(account_name),
            None,
        );
        self.manager.add_session(record);

        let manager = self.manager.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("Native browser for {} exited with {}", key, status),
                Err(e) => warn!("Waiting on native browser for {} failed: {}", key, e),
            }
            manager.remove_session(&key);
        });

        Ok(StartResult::success(message, Some(key.to_string())))
    }

    /// Persist the artifacts captured from a validated session.
    pub async fn save_artifacts(
        &self,
        account_id: i64,
        artifacts: &SessionArtifacts,
    ) -> Result<(), PoolError> {
        self.store.write_artifacts(account_id, artifacts).await
    }

    /// Read back whatever artifacts are on disk for an account.
    pub async fn load_artifacts(&self, account_id: i64) -> Result<SessionArtifacts, PoolError> {
        self.store.read_artifacts(account_id).await
    }

    /// Pool occupancy snapshot.
    pub fn stats(&self) -> crate::manager::PoolStats {
        self.manager.stats()
    }

    pub fn active_sessions(&self) -> Vec<crate::manager::SessionInfo> {
        self.manager.active_sessions()
    }

    /// Tear down every trace of an account: sessions, master profile,
    /// workers and snapshots. Returns false when the master directory
    /// survived every removal attempt.
    pub async fn invalidate(self: &Arc<Self>, account_id: i64) -> bool {
        let closed = self.manager.force_close_sessions_for_account(account_id).await;
        if closed > 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        for path in [
            self.store.cookies_path(account_id),
            self.store.localstorage_path(account_id),
            self.store.useragent_path(account_id),
        ] {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove {}: {}", path.display(), e);
                }
            }
        }
        if let Err(e) = self.store.remove_worker_dirs(account_id).await {
            warn!("Worker cleanup for account {} failed: {}", account_id, e);
        }

        let master = self.store.master_dir(account_id);
        if !master.is_dir() {
            return true;
        }
        for attempt in 1..=5 {
            match tokio::fs::remove_dir_all(&master).await {
                Ok(()) => {
                    info!("Removed master profile for account {}", account_id);
                    return true;
                }
                Err(e) => {
                    warn!(
                        "Removing master for account {} failed (attempt {}): {}",
                        account_id, attempt, e
                    );
                    if attempt < 5 {
                        release_profile_lock(&master).await;
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
        match self.store.trash_dir(&master).await {
            Ok(trash) => {
                info!(
                    "Master for account {} moved aside to {}",
                    account_id,
                    trash.display()
                );
                true
            }
            Err(e) => {
                error!("Could not move master for account {} aside: {}", account_id, e);
                false
            }
        }
    }

    /// Background sweeps for idle sessions. Two cadences: a frequent one
    /// and a slow safety net for sessions the first one raced.
    pub fn spawn_maintenance(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for interval in [self.config.sweep_interval(), self.config.slow_sweep_interval()] {
            let manager = self.manager.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await; // first tick fires immediately
                loop {
                    ticker.tick().await;
                    let closed = manager.cleanup_inactive_sessions().await;
                    if closed > 0 {
                        info!("Idle sweep closed {} session(s)", closed);
                    }
                }
            }));
        }
        handles
    }

    /// Close everything, bounded by the shutdown ceiling.
    pub async fn shutdown(&self) {
        let ceiling = self.config.shutdown_ceiling();
        if tokio::time::timeout(ceiling, self.manager.kill_all_sessions())
            .await
            .is_err()
        {
            error!("Shutdown did not finish within {:?}", ceiling);
        }
    }
}
