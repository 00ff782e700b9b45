//! In-memory cache of the unlocked master password.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, trace};

struct Cached {
    password: SecretString,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl Cached {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

/// Holds the master password for `ttl` after a successful unlock so that
/// back-to-back lookups do not re-unseal. Expired entries are dropped (and
/// therefore wiped) on the next read.
pub struct SessionCache {
    ttl: Duration,
    slot: Mutex<Option<Cached>>,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn cache(&self, password: &SecretString) {
        let entry = Cached {
            password: SecretString::from(password.expose_secret().to_owned()),
            expires_at: Instant::now().checked_add(self.ttl),
        };
        match self.slot.lock() {
            Ok(mut slot) => {
                *slot = Some(entry);
                debug!(ttl_secs = self.ttl.as_secs(), "session cached");
            }
            Err(_) => debug!("session cache lock poisoned; not caching"),
        }
    }

    /// The cached password, if one is present and not yet expired.
    pub fn get(&self) -> Option<SecretString> {
        let mut slot = self.slot.lock().ok()?;
        match slot.as_ref() {
            Some(cached) if cached.is_live() => Some(SecretString::from(
                cached.password.expose_secret().to_owned(),
            )),
            Some(_) => {
                trace!("session expired");
                *slot = None;
                None
            }
            None => None,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }

    pub fn is_active(&self) -> bool {
        self.get().is_some()
    }
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("ttl", &self.ttl)
            .field("active", &self.is_active())
            .finish()
    }
}
