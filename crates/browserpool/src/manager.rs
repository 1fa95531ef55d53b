//! Admission control and the live-session table.
//!
//! Limits enforced here:
//! - at most one admin session per account
//! - a bounded non-admin pool per account (chatters and monitors)
//! - a global cap on concurrent browser creations
//!
//! Over-limit requests wait in a per-account FIFO queue with a timeout.
//! Admission is decided under one lock using live sessions *plus* reserved
//! slots, so two concurrent requests can never both pass the same check.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{self, AuditEntry, AuditSink};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::launcher::BrowserContext;
use crate::session::{SessionKey, SessionRecord, SessionRole, StartResult};

/// Deferred session creation, run once a slot opens.
pub type SessionFactory =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<StartResult, PoolError>> + Send>;

struct QueuedRequest {
    id: Uuid,
    user_id: i64,
    is_admin: bool,
    create: SessionFactory,
    queued_at: DateTime<Utc>,
    tx: oneshot::Sender<Result<StartResult, PoolError>>,
}

#[derive(Default)]
struct PoolState {
    sessions: HashMap<SessionKey, SessionRecord>,
    queues: HashMap<i64, VecDeque<QueuedRequest>>,
    reserved_admin: HashMap<i64, usize>,
    reserved_chatter: HashMap<i64, usize>,
}

impl PoolState {
    fn live_admin(&self, account_id: i64) -> bool {
        self.sessions
            .keys()
            .any(|k| k.account_id == account_id && k.role == SessionRole::Admin)
    }

    fn live_non_admin(&self, account_id: i64) -> usize {
        self.sessions
            .keys()
            .filter(|k| k.account_id == account_id && k.role != SessionRole::Admin)
            .count()
    }

    fn reserved(&self, account_id: i64) -> (usize, usize) {
        (
            self.reserved_admin.get(&account_id).copied().unwrap_or(0),
            self.reserved_chatter.get(&account_id).copied().unwrap_or(0),
        )
    }

    /// Admission check over live sessions plus reservations. The two roles
    /// are bounded independently: one admin, and a chatter/monitor pool.
    fn can_start(&self, account_id: i64, is_admin: bool, max_chatters: usize) -> bool {
        let (res_admin, res_chatter) = self.reserved(account_id);
        if is_admin {
            !self.live_admin(account_id) && res_admin == 0
        } else {
            self.live_non_admin(account_id) + res_chatter < max_chatters
        }
    }
}

/// A slot held from admission check until the session lands in the table
/// (or the attempt fails). Dropping it always releases the count; the
/// brief overlap after `add_session` only over-counts, never under.
pub struct SlotReservation {
    state: Arc<Mutex<PoolState>>,
    account_id: i64,
    is_admin: bool,
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let map = if self.is_admin {
            &mut state.reserved_admin
        } else {
            &mut state.reserved_chatter
        };
        if let Some(count) = map.get_mut(&self.account_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(&self.account_id);
            }
        }
    }
}

/// Per-account occupancy snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountStats {
    pub admin: bool,
    pub chatters: usize,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_active: usize,
    pub by_account: HashMap<i64, AccountStats>,
    pub queues: HashMap<i64, usize>,
}

/// Listing row for observability endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub account_id: i64,
    pub user_id: i64,
    pub role: SessionRole,
    pub user_name: Option<String>,
    pub account_name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

pub struct ResourceManager {
    config: Arc<PoolConfig>,
    audit: Arc<dyn AuditSink>,
    state: Arc<Mutex<PoolState>>,
    creation_limit: Arc<Semaphore>,
}

impl ResourceManager {
    pub fn new(config: Arc<PoolConfig>, audit: Arc<dyn AuditSink>) -> Self {
        let creation_limit = Arc::new(Semaphore::new(config.max_concurrent_creations));
        Self {
            config,
            audit,
            state: Arc::new(Mutex::new(PoolState::default())),
            creation_limit,
        }
    }

    pub fn config(&self) -> &Arc<PoolConfig> {
        &self.config
    }

    /// Would a request for this account pass admission right now?
    pub fn can_start_session(&self, account_id: i64, is_admin: bool) -> bool {
        self.state
            .lock()
            .can_start(account_id, is_admin, self.config.max_chatters_per_account)
    }

    /// A live admin session exists for the account.
    pub fn has_active_admin_session(&self, account_id: i64) -> bool {
        self.state.lock().live_admin(account_id)
    }

    /// An admin slot is live *or* reserved. Monitors consult this so they
    /// never race a validation that is still launching.
    pub fn admin_slot_held(&self, account_id: i64) -> bool {
        let state = self.state.lock();
        state.live_admin(account_id) || state.reserved(account_id).0 > 0
    }

    pub(crate) fn try_reserve(&self, account_id: i64, is_admin: bool) -> Option<SlotReservation> {
        let mut state = self.state.lock();
        if !state.can_start(account_id, is_admin, self.config.max_chatters_per_account) {
            return None;
        }
        let map = if is_admin {
            &mut state.reserved_admin
        } else {
            &mut state.reserved_chatter
        };
        *map.entry(account_id).or_insert(0) += 1;
        Some(SlotReservation {
            state: self.state.clone(),
            account_id,
            is_admin,
        })
    }

    /// Insert a session, replacing any record under the same key. The
    /// replaced browser is closed in the background.
    pub fn add_session(&self, record: SessionRecord) {
        let key = record.key;
        let replaced = {
            let mut state = self.state.lock();
            state.sessions.insert(key, record)
        };
        if let Some(old) = replaced {
            warn!("Replacing existing session {}", key);
            let grace = self.config.kill_grace();
            tokio::spawn(async move {
                old.handle.close(grace).await;
            });
        }
        debug!("Session {} registered", key);
    }

    /// Remove a session from the table without closing it. Emits a leave
    /// audit record for named chatter sessions and lets the account's
    /// queue advance into the freed slot.
    pub fn remove_session(self: &Arc<Self>, key: &SessionKey) -> Option<SessionRecord> {
        let removed = self.state.lock().sessions.remove(key);
        if let Some(record) = &removed {
            debug!("Session {} removed", key);
            if record.key.role != SessionRole::Admin {
                if let (Some(user), Some(account)) = (&record.user_name, &record.account_name) {
                    audit::emit(
                        self.audit.clone(),
                        AuditEntry {
                            actor: user.clone(),
                            role: record.key.role.as_str().to_string(),
                            message: format!("saiu do chat de {account}"),
                        },
                    );
                }
            }
            let manager = self.clone();
            let account_id = key.account_id;
            tokio::spawn(async move {
                manager.drain_queue(account_id).await;
            });
        }
        removed
    }

    pub fn update_activity(&self, key: &SessionKey) {
        if let Some(record) = self.state.lock().sessions.get_mut(key) {
            record.last_activity = Utc::now();
        }
    }

    /// Automation context of a chatter session, if one is live.
    pub fn session_context(&self, account_id: i64, user_id: i64) -> Option<Arc<BrowserContext>> {
        self.state
            .lock()
            .sessions
            .get(&SessionKey::chatter(account_id, user_id))
            .and_then(|r| r.handle.context())
    }

    /// Sweep sessions idle past the configured timeout.
    pub async fn cleanup_inactive_sessions(self: &Arc<Self>) -> usize {
        let cutoff = Utc::now() - self.config.idle_timeout();
        let expired: Vec<SessionKey> = {
            let state = self.state.lock();
            state
                .sessions
                .values()
                .filter(|r| r.last_activity < cutoff)
                .map(|r| r.key)
                .collect()
        };
        let grace = self.config.kill_grace();
        let mut closed = 0;
        for key in expired {
            if let Some(record) = self.remove_session(&key) {
                info!("Closing idle session {}", key);
                record.handle.close(grace).await;
                closed += 1;
            }
        }
        closed
    }

    /// Close every session of one account, then wait for file handles to
    /// settle before the caller touches the profile directories.
    pub async fn force_close_sessions_for_account(self: &Arc<Self>, account_id: i64) -> usize {
        let keys: Vec<SessionKey> = {
            let state = self.state.lock();
            state
                .sessions
                .keys()
                .filter(|k| k.account_id == account_id)
                .copied()
                .collect()
        };
        let grace = self.config.kill_grace();
        let mut closed = 0;
        for key in &keys {
            if let Some(record) = self.remove_session(key) {
                record.handle.close(grace).await;
                closed += 1;
            }
        }
        if closed > 0 {
            tokio::time::sleep(self.config.settle_delay()).await;
        }
        closed
    }

    /// Drain the whole table. Close failures are logged; every session is
    /// force-killed on the way out regardless.
    pub async fn kill_all_sessions(&self) {
        let records: Vec<SessionRecord> = {
            let mut state = self.state.lock();
            state.queues.clear();
            state.sessions.drain().map(|(_, v)| v).collect()
        };
        if records.is_empty() {
            return;
        }
        info!("Shutting down {} session(s)", records.len());
        let grace = self.config.kill_grace();
        let closes = records.iter().map(|r| r.handle.close(grace));
        join_all(closes).await;
        for record in &records {
            record.handle.force_kill();
        }
    }

    /// Admit-or-queue entry point. Runs `create` immediately when a slot is
    /// free, otherwise parks the request in the account's FIFO queue until
    /// a slot opens or the queue timeout fires.
    pub async fn queue_session(
        self: &Arc<Self>,
        account_id: i64,
        user_id: i64,
        is_admin: bool,
        create: SessionFactory,
    ) -> Result<StartResult, PoolError> {
        if let Some(reservation) = self.try_reserve(account_id, is_admin) {
            return self.run_creation(account_id, reservation, create).await;
        }

        let id = Uuid::new_v4();
        let (tx, mut rx) = oneshot::channel();
        // Admission may have opened up between the failed reserve and this
        // lock. Recheck, reserve and park all inside one critical section;
        // the guard must not live across an await, so the creation itself
        // runs after the scope ends.
        let admitted = {
            let mut state = self.state.lock();
            if state.can_start(account_id, is_admin, self.config.max_chatters_per_account) {
                let map = if is_admin {
                    &mut state.reserved_admin
                } else {
                    &mut state.reserved_chatter
                };
                *map.entry(account_id).or_insert(0) += 1;
                Some((
                    SlotReservation {
                        state: self.state.clone(),
                        account_id,
                        is_admin,
                    },
                    create,
                ))
            } else {
                let queue = state.queues.entry(account_id).or_default();
                queue.push_back(QueuedRequest {
                    id,
                    user_id,
                    is_admin,
                    create,
                    queued_at: Utc::now(),
                    tx,
                });
                info!(
                    "Queued request for account {} user {} (position {})",
                    account_id,
                    user_id,
                    queue.len()
                );
                None
            }
        };
        if let Some((reservation, create)) = admitted {
            return self.run_creation(account_id, reservation, create).await;
        }

        match tokio::time::timeout(self.config.queue_timeout(), &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::QueueTimeout),
            Err(_) => {
                // Timed out. If the request is still parked, reject it; if
                // it was already picked up, its result is in flight and we
                // wait for it instead of abandoning a live browser.
                let still_queued = {
                    let mut state = self.state.lock();
                    match state.queues.get_mut(&account_id) {
                        Some(queue) => {
                            let before = queue.len();
                            queue.retain(|r| r.id != id);
                            queue.len() != before
                        }
                        None => false,
                    }
                };
                if still_queued {
                    warn!(
                        "Queue timeout for account {} user {} after {:?}",
                        account_id,
                        user_id,
                        self.config.queue_timeout()
                    );
                    Err(PoolError::QueueTimeout)
                } else {
                    match rx.await {
                        Ok(result) => result,
                        Err(_) => Err(PoolError::QueueTimeout),
                    }
                }
            }
        }
    }

    /// Run one creation under the global concurrency cap, release the slot
    /// reservation, then give the queue a chance to advance.
    async fn run_creation(
        self: &Arc<Self>,
        account_id: i64,
        reservation: SlotReservation,
        create: SessionFactory,
    ) -> Result<StartResult, PoolError> {
        // Closing the semaphore is not part of the pool lifecycle.
        let _permit = self
            .creation_limit
            .acquire()
            .await
            .map_err(|_| PoolError::QueueTimeout)?;
        let result = create().await;
        drop(reservation);
        let manager = self.clone();
        tokio::spawn(async move {
            manager.drain_queue(account_id).await;
        });
        result
    }

    /// Serve queued requests for an account while slots are available.
    async fn drain_queue(self: Arc<Self>, account_id: i64) {
        loop {
            let next = {
                let mut state = self.state.lock();
                let front_is_admin = state
                    .queues
                    .get(&account_id)
                    .and_then(|q| q.front())
                    .map(|r| r.is_admin);
                let Some(front_is_admin) = front_is_admin else {
                    state.queues.remove(&account_id);
                    return;
                };
                if !state.can_start(
                    account_id,
                    front_is_admin,
                    self.config.max_chatters_per_account,
                ) {
                    return;
                }
                let request = state
                    .queues
                    .get_mut(&account_id)
                    .and_then(VecDeque::pop_front);
                let Some(request) = request else { return };
                let map = if request.is_admin {
                    &mut state.reserved_admin
                } else {
                    &mut state.reserved_chatter
                };
                *map.entry(account_id).or_insert(0) += 1;
                request
            };
            let reservation = SlotReservation {
                state: self.state.clone(),
                account_id,
                is_admin: next.is_admin,
            };
            let waited = Utc::now() - next.queued_at;
            debug!(
                "Serving queued request for account {} user {} after {}ms",
                account_id,
                next.user_id,
                waited.num_milliseconds()
            );

            let _permit = match self.creation_limit.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let result = (next.create)().await;
            drop(reservation);
            // Receiver gone means the requester timed out after pickup; the
            // session (if created) stays in the table for reuse.
            let _ = next.tx.send(result);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut by_account: HashMap<i64, AccountStats> = HashMap::new();
        for key in state.sessions.keys() {
            let entry = by_account.entry(key.account_id).or_default();
            match key.role {
                SessionRole::Admin => entry.admin = true,
                SessionRole::Chatter | SessionRole::Monitor => entry.chatters += 1,
            }
        }
        PoolStats {
            total_active: state.sessions.len(),
            by_account,
            queues: state
                .queues
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(k, q)| (*k, q.len()))
                .collect(),
        }
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let state = self.state.lock();
        state
            .sessions
            .values()
            .map(|r| SessionInfo {
                account_id: r.key.account_id,
                user_id: r.key.user_id,
                role: r.key.role,
                user_name: r.user_name.clone(),
                account_name: r.account_name.clone(),
                started_at: r.started_at,
                last_activity: r.last_activity,
            })
            .collect()
    }
}
