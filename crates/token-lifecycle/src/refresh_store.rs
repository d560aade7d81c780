//! Refresh token store
//!
//! Process-lifetime mapping from identity to refresh token. Presence of an
//! entry is what makes an identity "authorized". Entries are only written by
//! `TokenLifecycleManager`; readers outside the crate get read-only access.

use std::collections::HashMap;

use common::Secret;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::debug;

#[derive(Debug, Default)]
pub struct RefreshTokenStore {
    tokens: RwLock<HashMap<String, Secret<String>>>,
}

impl RefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a refresh token, replacing any previous one for the identity.
    #[cfg(test)]
    pub(crate) async fn put(&self, identity: &str, token: Secret<String>) {
        self.lock().await.insert(identity.to_owned(), token);
        debug!(identity, "stored refresh token");
    }

    /// Exclusive access for writes that must land together with a cache
    /// update.
    pub(crate) async fn lock(&self) -> RwLockWriteGuard<'_, HashMap<String, Secret<String>>> {
        self.tokens.write().await
    }

    pub async fn get(&self, identity: &str) -> Option<Secret<String>> {
        self.tokens.read().await.get(identity).cloned()
    }

    pub async fn contains(&self, identity: &str) -> bool {
        self.tokens.read().await.contains_key(identity)
    }

    /// Remove the entry only if it still holds `expected`. A newer token
    /// written by a concurrent code exchange is left alone.
    ///
    /// Returns whether an entry was removed.
    pub(crate) async fn remove_if(&self, identity: &str, expected: &Secret<String>) -> bool {
        let mut tokens = self.tokens.write().await;
        if tokens.get(identity) == Some(expected) {
            tokens.remove(identity);
            debug!(identity, "removed refresh token");
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) async fn remove(&self, identity: &str) -> Option<Secret<String>> {
        self.tokens.write().await.remove(identity)
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_replaces_previous_value() {
        let store = RefreshTokenStore::new();
        assert!(store.get("u1").await.is_none());

        store.put("u1", Secret::from("RT1")).await;
        store.put("u1", Secret::from("RT2")).await;

        assert_eq!(store.get("u1").await.unwrap().expose(), "RT2");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn identities_are_independent() {
        let store = RefreshTokenStore::new();
        store.put("u1", Secret::from("RT-a")).await;
        store.put("u2", Secret::from("RT-b")).await;

        assert!(store.contains("u1").await);
        assert!(store.contains("u2").await);
        assert!(!store.contains("u3").await);
        assert_eq!(store.remove("u1").await.unwrap().expose(), "RT-a");
        assert!(!store.contains("u1").await);
        assert_eq!(store.get("u2").await.unwrap().expose(), "RT-b");
    }

    #[tokio::test]
    async fn remove_if_only_matches_expected_token() {
        let store = RefreshTokenStore::new();
        store.put("u1", Secret::from("RT2")).await;

        assert!(!store.remove_if("u1", &Secret::from("RT1")).await);
        assert!(store.contains("u1").await);

        assert!(store.remove_if("u1", &Secret::from("RT2")).await);
        assert!(store.is_empty().await);
        assert!(!store.remove_if("u1", &Secret::from("RT2")).await);
    }
}
