//! End-to-end pool behavior without a real browser: sessions are
//! registered as detached records, so admission, queueing and sweeping
//! run exactly as in production minus the launch itself.

use std::sync::Arc;
use std::time::Duration;

use browserpool::{
    NoopAudit, PoolConfig, PoolError, ResourceManager, SessionKey, SessionRecord, StartResult,
};
use parking_lot::Mutex;

fn manager_with(config: PoolConfig) -> Arc<ResourceManager> {
    Arc::new(ResourceManager::new(Arc::new(config), Arc::new(NoopAudit)))
}

fn fast_config() -> PoolConfig {
    let mut config = PoolConfig::default();
    config.queue_timeout_secs = 1;
    config.kill_grace_secs = 0;
    config.settle_delay_ms = 0;
    config
}

fn occupy_chatters(manager: &Arc<ResourceManager>, account_id: i64, count: i64) {
    for user in 0..count {
        manager.add_session(SessionRecord::detached(SessionKey::chatter(account_id, user)));
    }
}

#[tokio::test]
async fn admin_is_exclusive_per_account() {
    let manager = manager_with(fast_config());
    manager.add_session(SessionRecord::detached(SessionKey::admin(1, 100)));

    // Only one admin per account; the chatter pool is bounded separately.
    assert!(!manager.can_start_session(1, true));
    assert!(manager.can_start_session(1, false));
    // Other accounts are unaffected.
    assert!(manager.can_start_session(2, false));
    assert!(manager.can_start_session(2, true));
}

#[tokio::test]
async fn ninth_chatter_queues_and_times_out() {
    let manager = manager_with(fast_config());
    occupy_chatters(&manager, 1, 8);

    let started = std::time::Instant::now();
    let err = manager
        .queue_session(
            1,
            99,
            false,
            Box::new(|| Box::pin(async { Ok(StartResult::success("ok", None)) })),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::QueueTimeout));
    assert!(err.to_string().contains("expirada") || err.to_string().contains("fila"));
    assert!(started.elapsed() >= Duration::from_secs(1));
    // The timed-out request must not linger in the queue.
    assert!(manager.stats().queues.is_empty());
}

#[tokio::test]
async fn queued_request_runs_when_slot_frees() {
    let manager = manager_with(PoolConfig::default());
    occupy_chatters(&manager, 1, 8);

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .queue_session(
                    1,
                    99,
                    false,
                    Box::new(|| Box::pin(async { Ok(StartResult::success("served", None)) })),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.stats().queues.get(&1), Some(&1));

    manager.remove_session(&SessionKey::chatter(1, 2));
    let result = waiter.await.unwrap().unwrap();
    assert_eq!(result.message, "served");
}

#[tokio::test]
async fn queue_is_fifo_per_account() {
    let manager = manager_with(PoolConfig::default());
    occupy_chatters(&manager, 1, 8);

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for user in [20_i64, 21, 22] {
        let manager = manager.clone();
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            manager
                .queue_session(
                    1,
                    user,
                    false,
                    Box::new(move || {
                        Box::pin(async move {
                            order.lock().push(user);
                            Ok(StartResult::success("ok", None))
                        })
                    }),
                )
                .await
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    manager.remove_session(&SessionKey::chatter(1, 0));
    for waiter in waiters {
        assert!(waiter.await.unwrap().unwrap().is_success());
    }
    assert_eq!(*order.lock(), vec![20, 21, 22]);
}

#[tokio::test]
async fn accounts_queue_independently() {
    let manager = manager_with(PoolConfig::default());
    occupy_chatters(&manager, 1, 8);

    // Account 2 is unaffected by account 1 being full.
    let result = manager
        .queue_session(
            2,
            1,
            false,
            Box::new(|| Box::pin(async { Ok(StartResult::success("ok", None)) })),
        )
        .await
        .unwrap();
    assert!(result.is_success());
}

#[tokio::test]
async fn failed_creation_releases_the_slot() {
    let manager = manager_with(fast_config());
    occupy_chatters(&manager, 1, 7);

    let err = manager
        .queue_session(
            1,
            50,
            false,
            Box::new(|| {
                Box::pin(async { Err(PoolError::Launch("browser exploded".to_string())) })
            }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Launch(_)));

    // The failed attempt must not leave its reservation behind.
    assert!(manager.can_start_session(1, false));
    let result = manager
        .queue_session(
            1,
            51,
            false,
            Box::new(|| Box::pin(async { Ok(StartResult::success("ok", None)) })),
        )
        .await
        .unwrap();
    assert!(result.is_success());
}

#[tokio::test]
async fn replacement_keeps_table_consistent() {
    let manager = manager_with(fast_config());
    let key = SessionKey::chatter(1, 5);
    manager.add_session(SessionRecord::detached(key));
    manager.add_session(SessionRecord::detached(key));

    let stats = manager.stats();
    assert_eq!(stats.total_active, 1);
    assert_eq!(stats.by_account[&1].chatters, 1);
}

#[tokio::test]
async fn idle_sweep_closes_expired_sessions_only() {
    let mut config = fast_config();
    config.idle_timeout_secs = 0;
    let manager = manager_with(config);
    manager.add_session(SessionRecord::detached(SessionKey::chatter(1, 1)));
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A fresh session added after the cutoff survives.
    let fresh = SessionKey::chatter(2, 1);
    let closed = manager.cleanup_inactive_sessions().await;
    assert_eq!(closed, 1);
    manager.add_session(SessionRecord::detached(fresh));
    assert_eq!(manager.stats().total_active, 1);
}

#[tokio::test]
async fn activity_refresh_defers_the_sweep() {
    let mut config = fast_config();
    config.idle_timeout_secs = 1;
    let manager = manager_with(config);
    let key = SessionKey::chatter(1, 1);
    manager.add_session(SessionRecord::detached(key));

    tokio::time::sleep(Duration::from_millis(600)).await;
    manager.update_activity(&key);
    tokio::time::sleep(Duration::from_millis(600)).await;

    // Total age exceeds the timeout, but activity was refreshed.
    assert_eq!(manager.cleanup_inactive_sessions().await, 0);
    assert_eq!(manager.stats().total_active, 1);
}

#[tokio::test]
async fn kill_all_drains_table_and_queues() {
    let manager = manager_with(fast_config());
    occupy_chatters(&manager, 1, 3);
    manager.add_session(SessionRecord::detached(SessionKey::admin(2, 1)));

    manager.kill_all_sessions().await;
    let stats = manager.stats();
    assert_eq!(stats.total_active, 0);
    assert!(stats.queues.is_empty());
}

#[tokio::test]
async fn stats_reflect_roles_and_queues() {
    let manager = manager_with(PoolConfig::default());
    manager.add_session(SessionRecord::detached(SessionKey::admin(1, 1)));
    manager.add_session(SessionRecord::detached(SessionKey::chatter(2, 1)));
    manager.add_session(SessionRecord::detached(SessionKey::monitor(2, 2)));

    let stats = manager.stats();
    assert_eq!(stats.total_active, 3);
    assert!(stats.by_account[&1].admin);
    assert_eq!(stats.by_account[&2].chatters, 2);

    let listing = manager.active_sessions();
    assert_eq!(listing.len(), 3);
    assert!(listing.iter().any(|s| s.account_id == 1 && s.user_id == 1));
}
