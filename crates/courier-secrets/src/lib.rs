//! courier-secrets: secure storage for device key material
//!
//! The E2EE pipeline persists exactly one secret per device (the base64
//! master key). Storage is abstracted behind [`SecretStore`] so the crypto
//! layer can run against the platform keychain in production and an
//! in-memory map in tests.

pub mod keychain;
pub mod memory;

pub use keychain::KeychainStore;
pub use memory::MemoryStore;

use std::future::Future;

use courier_core::CourierResult;
use secrecy::SecretString;

/// Named secret storage with get/set/delete semantics.
///
/// Every call is a suspension point; backends that block (platform
/// keychains) must move the work off the async executor.
pub trait SecretStore: Send + Sync {
    /// Fetch a secret. `Ok(None)` when no entry exists.
    fn get(&self, name: &str) -> impl Future<Output = CourierResult<Option<SecretString>>> + Send;

    /// Create or overwrite a secret.
    fn set(&self, name: &str, secret: &SecretString) -> impl Future<Output = CourierResult<()>> + Send;

    /// Remove a secret. Deleting a missing entry is not an error.
    fn delete(&self, name: &str) -> impl Future<Output = CourierResult<()>> + Send;
}

impl<S: SecretStore> SecretStore for std::sync::Arc<S> {
    fn get(&self, name: &str) -> impl Future<Output = CourierResult<Option<SecretString>>> + Send {
        (**self).get(name)
    }

    fn set(&self, name: &str, secret: &SecretString) -> impl Future<Output = CourierResult<()>> + Send {
        (**self).set(name, secret)
    }

    fn delete(&self, name: &str) -> impl Future<Output = CourierResult<()>> + Send {
        (**self).delete(name)
    }
}
