//! Platform keychain backend.
//!
//! Uses the `keyring` crate for cross-platform access:
//! - macOS / iOS: Keychain Services
//! - Linux: Secret Service (D-Bus)
//! - Windows: Credential Manager
//!
//! `keyring` calls block, so each operation runs on the blocking pool.

use courier_core::{CourierError, CourierResult};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::SecretStore;

/// Secret store backed by the platform keychain under one service name.
#[derive(Debug, Clone)]
pub struct KeychainStore {
    service: String,
}

impl KeychainStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Check if the platform keychain is available.
    pub fn is_available(&self) -> bool {
        keyring::Entry::new(&self.service, "__courier_availability__").is_ok()
    }

    async fn run_blocking<T, F>(&self, op: F) -> CourierResult<T>
    where
        T: Send + 'static,
        F: FnOnce(String) -> CourierResult<T> + Send + 'static,
    {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || op(service))
            .await
            .map_err(|e| CourierError::Secrets(format!("keychain task failed: {e}")))?
    }
}

fn entry(service: &str, key_name: &str) -> CourierResult<keyring::Entry> {
    keyring::Entry::new(service, key_name)
        .map_err(|e| CourierError::Secrets(format!("keychain entry creation: {e}")))
}

impl SecretStore for KeychainStore {
    async fn get(&self, name: &str) -> CourierResult<Option<SecretString>> {
        let key_name = name.to_string();
        self.run_blocking(move |service| match entry(&service, &key_name)?.get_password() {
            Ok(mut password) => {
                let secret = SecretString::from(password.clone());
                password.zeroize();
                Ok(Some(secret))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CourierError::Secrets(format!(
                "keychain get for '{key_name}': {e}"
            ))),
        })
        .await
    }

    async fn set(&self, name: &str, secret: &SecretString) -> CourierResult<()> {
        let key_name = name.to_string();
        let mut value = secret.expose_secret().to_string();
        self.run_blocking(move |service| {
            let result = entry(&service, &key_name)?
                .set_password(&value)
                .map_err(|e| CourierError::Secrets(format!("keychain store for '{key_name}': {e}")));
            value.zeroize();
            result?;
            tracing::debug!(key = %key_name, "stored secret in platform keychain");
            Ok(())
        })
        .await
    }

    async fn delete(&self, name: &str) -> CourierResult<()> {
        let key_name = name.to_string();
        self.run_blocking(move |service| match entry(&service, &key_name)?.delete_credential() {
            Ok(()) => {
                tracing::debug!(key = %key_name, "deleted secret from platform keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()), // already deleted
            Err(e) => Err(CourierError::Secrets(format!(
                "keychain delete for '{key_name}': {e}"
            ))),
        })
        .await
    }
}
