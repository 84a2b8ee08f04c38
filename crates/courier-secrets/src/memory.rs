//! In-memory secret store for tests and ephemeral sessions.

use std::collections::HashMap;
use std::sync::Mutex;

use courier_core::{CourierError, CourierResult};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::SecretStore;

/// Thread-safe map of secrets. Values are zeroized when replaced or removed.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored secrets.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> CourierResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| CourierError::Secrets("memory store lock poisoned".into()))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.len())
            .finish()
    }
}

impl SecretStore for MemoryStore {
    async fn get(&self, name: &str) -> CourierResult<Option<SecretString>> {
        let map = self.lock()?;
        Ok(map.get(name).map(|v| SecretString::from(v.clone())))
    }

    async fn set(&self, name: &str, secret: &SecretString) -> CourierResult<()> {
        let mut map = self.lock()?;
        if let Some(mut old) = map.insert(name.to_string(), secret.expose_secret().to_string()) {
            old.zeroize();
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> CourierResult<()> {
        let mut map = self.lock()?;
        if let Some(mut old) = map.remove(name) {
            old.zeroize();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        store.set("k", &SecretString::from("v1")).await.unwrap();
        let got = store.get("k").await.unwrap().unwrap();
        assert_eq!(got.expose_secret(), "v1");

        store.set("k", &SecretString::from("v2")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().expose_secret(), "v2");
        assert_eq!(store.len(), 1);

        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = MemoryStore::new();
        store.delete("nothing-here").await.unwrap();
    }

    #[tokio::test]
    async fn test_arc_store_shares_state() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let other = store.clone();
        store.set("shared", &SecretString::from("x")).await.unwrap();
        assert!(other.get("shared").await.unwrap().is_some());
    }
}
