//! In-process cache of derived keys and peer key material.
//!
//! One `KeyCache` lives per signed-in session. It is shared by `Arc` between
//! the key store (own key) and key exchange (peer keys), and cleared on
//! logout or key rotation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use courier_core::UserId;

use crate::keys::{DerivedKey, KeyMaterial};

/// What a cached derived key is for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    /// This device's own derived key
    Own,
    /// A peer's derived key, from their published material
    Peer(UserId),
}

#[derive(Default)]
pub struct KeyCache {
    derived: Mutex<HashMap<KeyPurpose, DerivedKey>>,
    material: Mutex<HashMap<UserId, KeyMaterial>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock cannot leave a map half-written.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_derived(&self, purpose: &KeyPurpose) -> Option<DerivedKey> {
        lock(&self.derived).get(purpose).cloned()
    }

    pub fn insert_derived(&self, purpose: KeyPurpose, key: DerivedKey) {
        lock(&self.derived).insert(purpose, key);
    }

    pub fn get_material(&self, user_id: &UserId) -> Option<KeyMaterial> {
        lock(&self.material).get(user_id).cloned()
    }

    /// Cache a peer's material together with its derived key.
    pub fn insert_material(&self, user_id: UserId, material: KeyMaterial) {
        let derived = material.derive();
        lock(&self.derived).insert(KeyPurpose::Peer(user_id.clone()), derived);
        lock(&self.material).insert(user_id, material);
    }

    /// Forget a peer, e.g. after their key rotated. The next use re-fetches.
    pub fn invalidate_peer(&self, user_id: &UserId) {
        lock(&self.derived).remove(&KeyPurpose::Peer(user_id.clone()));
        lock(&self.material).remove(user_id);
    }

    pub fn invalidate_own(&self) {
        lock(&self.derived).remove(&KeyPurpose::Own);
    }

    pub fn clear(&self) {
        lock(&self.derived).clear();
        lock(&self.material).clear();
    }

    /// Number of cached peers
    pub fn peer_count(&self) -> usize {
        lock(&self.material).len()
    }
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("derived", &lock(&self.derived).len())
            .field("peers", &self.peer_count())
            .finish()
    }
}
