use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::backend::ChatBackend;
use crate::state::Profile;

/// Session-scoped user id -> profile memo. Clones share the same map, so forwarding tasks
/// and the actor see each other's fetches.
#[derive(Clone, Default)]
pub(crate) struct ProfileCache {
    inner: Arc<RwLock<HashMap<String, Profile>>>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Profile>> {
        match self.inner.read() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Profile>> {
        match self.inner.write() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    pub fn peek(&self, user_id: &str) -> Option<Profile> {
        self.read().get(user_id).cloned()
    }

    pub fn insert(&self, profile: Profile) {
        self.write().insert(profile.id.clone(), profile);
    }

    pub fn extend(&self, profiles: impl IntoIterator<Item = Profile>) {
        let mut map = self.write();
        for p in profiles {
            map.insert(p.id.clone(), p);
        }
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Cached profile, or one backend lookup. Failures yield the "Unknown User" stand-in and
    /// are not cached, so the next call retries.
    pub async fn get(&self, backend: &dyn ChatBackend, user_id: &str) -> Profile {
        if let Some(p) = self.peek(user_id) {
            return p;
        }
        match backend.get_user_profile(user_id).await {
            Ok(profile) => {
                self.insert(profile.clone());
                profile
            }
            Err(e) => {
                tracing::warn!(%e, user_id, "profile lookup failed");
                Profile::unknown(user_id)
            }
        }
    }
}
