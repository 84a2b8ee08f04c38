//! Device key store: one master key per installation, held in secure storage.
//!
//! Lifecycle:
//!   1. `initialize_keys` loads the stored master key or, only if none
//!      exists, generates and persists one. Readiness is signalled here.
//!   2. Crypto operations fetch `get_my_derived_key` (cached after first use).
//!   3. `clear_keys` on logout removes the key and empties the cache.
//!
//! Readiness is a `watch` channel rather than a polling loop: callers that
//! start before initialization completes `wait_ready` with a timeout.
//!
//! Every operation that writes the stored key holds the lifecycle lock from
//! its first read to its last write, so overlapping `initialize_keys` calls
//! cannot both generate a key.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use courier_core::{CourierError, CourierResult};
use courier_secrets::SecretStore;

use crate::backup::{create_key_backup, restore_master_key, KeyBackup};
use crate::cache::{KeyCache, KeyPurpose};
use crate::keys::{DerivedKey, KeyMaterial, MasterKey};

pub struct KeyStore<S> {
    store: S,
    entry: String,
    cache: Arc<KeyCache>,
    ready: watch::Sender<bool>,
    lifecycle: Mutex<()>,
}

impl<S: SecretStore> KeyStore<S> {
    /// `entry` is the fixed secure-storage name of the master key.
    pub fn new(store: S, entry: impl Into<String>, cache: Arc<KeyCache>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            store,
            entry: entry.into(),
            cache,
            ready,
            lifecycle: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    /// Return this device's key material, generating it on first run.
    ///
    /// Never replaces an existing master key: doing so would make every
    /// earlier ciphertext for this device undecryptable.
    pub async fn initialize_keys(&self) -> CourierResult<KeyMaterial> {
        let _guard = self.lifecycle.lock().await;
        let material = match self.load_material().await? {
            Some(existing) => {
                MasterKey::from_material(&existing)?;
                debug!(entry = %self.entry, "loaded existing master key");
                existing
            }
            None => {
                let material = MasterKey::generate().to_material();
                self.persist(&material).await?;
                info!(entry = %self.entry, "generated new device master key");
                material
            }
        };
        self.cache.insert_derived(KeyPurpose::Own, material.derive());
        self.ready.send_replace(true);
        Ok(material)
    }

    /// This device's published key material.
    pub async fn own_material(&self) -> CourierResult<KeyMaterial> {
        self.load_material()
            .await?
            .ok_or(CourierError::KeyNotInitialized)
    }

    /// The cached own derived key, loading and deriving it on a miss.
    pub async fn get_my_derived_key(&self) -> CourierResult<DerivedKey> {
        if let Some(key) = self.cache.get_derived(&KeyPurpose::Own) {
            return Ok(key);
        }
        let material = self.own_material().await?;
        let key = material.derive();
        self.cache.insert_derived(KeyPurpose::Own, key.clone());
        Ok(key)
    }

    /// Pure derivation from a peer's published material. No I/O.
    pub fn derive_from_peer_material(material: &KeyMaterial) -> DerivedKey {
        material.derive()
    }

    /// Delete the master key and drop every cached key. Used on logout.
    pub async fn clear_keys(&self) -> CourierResult<()> {
        let _guard = self.lifecycle.lock().await;
        self.store.delete(&self.entry).await?;
        self.cache.clear();
        self.ready.send_replace(false);
        info!(entry = %self.entry, "cleared device keys");
        Ok(())
    }

    /// Replace the master key with a fresh one. The only path that may
    /// overwrite an existing key; callers must republish the new material.
    pub async fn rotate_keys(&self) -> CourierResult<KeyMaterial> {
        let _guard = self.lifecycle.lock().await;
        let material = MasterKey::generate().to_material();
        self.persist(&material).await?;
        self.cache.clear();
        self.cache.insert_derived(KeyPurpose::Own, material.derive());
        self.ready.send_replace(true);
        warn!(entry = %self.entry, "rotated device master key; earlier ciphertexts need the old key");
        Ok(material)
    }

    /// Back up the current master key under a password.
    ///
    /// PBKDF2 runs on the blocking pool.
    pub async fn create_key_backup(
        &self,
        password: &SecretString,
        iterations: u32,
    ) -> CourierResult<KeyBackup> {
        let master = MasterKey::from_material(&self.own_material().await?)?;
        let password = SecretString::from(password.expose_secret());
        tokio::task::spawn_blocking(move || create_key_backup(&master, &password, iterations))
            .await
            .map_err(|e| CourierError::Other(anyhow::anyhow!("key backup task failed: {e}")))?
    }

    /// Reinstate a master key from a backup. On failure stored state is untouched.
    pub async fn restore_from_backup(
        &self,
        backup: &KeyBackup,
        password: &SecretString,
    ) -> CourierResult<KeyMaterial> {
        let sealed = backup.clone();
        let password = SecretString::from(password.expose_secret());
        let master = tokio::task::spawn_blocking(move || restore_master_key(&sealed, &password))
            .await
            .map_err(|e| CourierError::Other(anyhow::anyhow!("key restore task failed: {e}")))??;
        let material = master.to_material();

        let _guard = self.lifecycle.lock().await;
        self.persist(&material).await?;
        self.cache.clear();
        self.cache.insert_derived(KeyPurpose::Own, material.derive());
        self.ready.send_replace(true);
        info!(entry = %self.entry, "restored device master key from backup");
        Ok(material)
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until keys are initialized, or fail with `KeysNotReady`.
    pub async fn wait_ready(&self, timeout: Duration) -> CourierResult<()> {
        let mut rx = self.ready.subscribe();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await;
        match outcome {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(CourierError::KeysNotReady),
        }
    }

    async fn load_material(&self) -> CourierResult<Option<KeyMaterial>> {
        Ok(self
            .store
            .get(&self.entry)
            .await?
            .map(|secret| KeyMaterial::new(secret.expose_secret())))
    }

    async fn persist(&self, material: &KeyMaterial) -> CourierResult<()> {
        self.store
            .set(&self.entry, &SecretString::from(material.as_str()))
            .await
    }
}
