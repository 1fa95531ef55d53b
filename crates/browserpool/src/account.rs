//! Account and user lookup seam.
//!
//! The surrounding application owns account persistence; the pool only needs
//! read access to a handful of fields. [`MemoryAccountStore`] serves
//! embedding and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// External platform account ("model") as the pool sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub platform_email: Option<String>,
    pub platform_password: Option<String>,
    pub proxy_url: Option<String>,
    pub chat_group: Option<String>,
    pub is_validated: bool,
    pub active: bool,
}

/// Requesting user, for display/audit fields only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: i64,
    pub name: String,
}

/// Read-only account/user lookup.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn account(&self, id: i64) -> Option<Account>;
    async fn user(&self, id: i64) -> Option<UserInfo>;
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: RwLock<HashMap<i64, Account>>,
    users: RwLock<HashMap<i64, UserInfo>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_account(&self, account: Account) {
        self.accounts.write().await.insert(account.id, account);
    }

    pub async fn insert_user(&self, user: UserInfo) {
        self.users.write().await.insert(user.id, user);
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn account(&self, id: i64) -> Option<Account> {
        self.accounts.read().await.get(&id).cloned()
    }

    async fn user(&self, id: i64) -> Option<UserInfo> {
        self.users.read().await.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryAccountStore::new();
        store
            .insert_account(Account {
                id: 3,
                name: "Luna".to_string(),
                platform_email: Some("luna@example.com".to_string()),
                platform_password: Some("secret".to_string()),
                proxy_url: None,
                chat_group: Some("night".to_string()),
                is_validated: true,
                active: true,
            })
            .await;

        let account = store.account(3).await.unwrap();
        assert_eq!(account.name, "Luna");
        assert!(store.account(4).await.is_none());
        assert!(store.user(1).await.is_none());
    }
}
