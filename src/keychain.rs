//! Platform credential store adapter.
//!
//! A thin store/retrieve/delete/exists layer over the OS secret store
//! (macOS Keychain, Windows Credential Manager, Linux Secret Service backed
//! by keyutils, all via `keyring`). It is both the lowest-priority sealing backend and the place
//! where the secure-element backend parks its ciphertext.
//!
//! Service names are scoped as `remote-juggler.<domain>.<identity>` so PIN
//! entries never collide with token entries for the same identity.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use keyring::credential::{CredentialBuilderApi, CredentialPersistence};
use secrecy::ExposeSecret;
use tracing::{debug, trace, warn};

use crate::config::PRODUCT;
use crate::memory::SecretBuffer;

/// Build a scoped service name, e.g. `remote-juggler.hsm.pin.work`.
pub fn service_name(domain: &str, identity: &str) -> String {
    format!("{PRODUCT}.{domain}.{identity}")
}

/// Native outcome of a credential store call, before it is mapped into the
/// shared HSM taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeychainStatus {
    /// No native secure store on this platform.
    NotAvailable,
    /// `errSecItemNotFound` and equivalents.
    ItemNotFound,
    /// The store refused access (locked keychain, denied prompt).
    AuthFailed,
    /// Stored bytes could not be decoded.
    BadEncoding,
    /// Anything else the platform reported.
    Failure(String),
}

impl KeychainStatus {
    /// macOS `OSStatus` value for the status, used in logs so failures line
    /// up with `security` CLI output.
    pub fn os_status(&self) -> i32 {
        match self {
            KeychainStatus::NotAvailable => -4, // errSecUnimplemented
            KeychainStatus::ItemNotFound => -25300,
            KeychainStatus::AuthFailed => -25293,
            KeychainStatus::BadEncoding => -26275, // errSecDecode
            KeychainStatus::Failure(_) => -2070,  // errSecInternalComponent
        }
    }
}

impl fmt::Display for KeychainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeychainStatus::NotAvailable => f.write_str("credential store not available"),
            KeychainStatus::ItemNotFound => f.write_str("item not found"),
            KeychainStatus::AuthFailed => f.write_str("access denied"),
            KeychainStatus::BadEncoding => f.write_str("stored item is not decodable"),
            KeychainStatus::Failure(msg) => write!(f, "platform failure: {msg}"),
        }
    }
}

pub trait PlatformStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether a usable native store exists. Must be idempotent.
    fn is_available(&self) -> bool;

    /// Store `secret`, replacing any existing item for the pair.
    fn store(&self, service: &str, account: &str, secret: &[u8]) -> Result<(), KeychainStatus>;

    fn retrieve(&self, service: &str, account: &str) -> Result<SecretBuffer, KeychainStatus>;

    fn delete(&self, service: &str, account: &str) -> Result<(), KeychainStatus>;

    fn exists(&self, service: &str, account: &str) -> bool;
}

/// The operating system's credential store.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeychain;

const CHECK_SERVICE: &str = "remote-juggler.availability";
const CHECK_ACCOUNT: &str = "availability";

/// Only stores that keep items until they are deleted can hold a sealed
/// secret; anything cleared by a reboot or process exit would lose it.
pub fn is_durable(persistence: &CredentialPersistence) -> bool {
    matches!(persistence, CredentialPersistence::UntilDelete)
}

impl OsKeychain {
    /// Lifetime of items in the platform's default `keyring` store.
    pub fn persistence() -> CredentialPersistence {
        keyring::default::default_credential_builder().persistence()
    }

    fn entry(service: &str, account: &str) -> Result<keyring::Entry, KeychainStatus> {
        keyring::Entry::new(service, account).map_err(map_keyring_error)
    }
}

fn map_keyring_error(e: keyring::Error) -> KeychainStatus {
    match e {
        keyring::Error::NoEntry => KeychainStatus::ItemNotFound,
        keyring::Error::NoStorageAccess(inner) => {
            debug!(error = %inner, "credential store refused access");
            KeychainStatus::AuthFailed
        }
        keyring::Error::BadEncoding(_) => KeychainStatus::BadEncoding,
        keyring::Error::PlatformFailure(inner) => KeychainStatus::Failure(inner.to_string()),
        other => KeychainStatus::Failure(other.to_string()),
    }
}

impl PlatformStore for OsKeychain {
    fn name(&self) -> &'static str {
        "Keychain"
    }

    fn is_available(&self) -> bool {
        if !is_durable(&Self::persistence()) {
            warn!("platform credential store does not persist; not using it");
            return false;
        }
        let entry = match Self::entry(CHECK_SERVICE, CHECK_ACCOUNT) {
            Ok(entry) => entry,
            Err(status) => {
                debug!(%status, "credential store entry construction failed");
                return false;
            }
        };
        match entry.get_secret() {
            Ok(mut bytes) => {
                zeroize::Zeroize::zeroize(&mut bytes);
                true
            }
            Err(keyring::Error::NoEntry) => true,
            Err(e) => {
                debug!(error = %e, "credential store availability check failed");
                false
            }
        }
    }

    fn store(&self, service: &str, account: &str, secret: &[u8]) -> Result<(), KeychainStatus> {
        trace!(service, account, "storing credential");
        Self::entry(service, account)?
            .set_secret(secret)
            .map_err(map_keyring_error)
    }

    fn retrieve(&self, service: &str, account: &str) -> Result<SecretBuffer, KeychainStatus> {
        trace!(service, account, "retrieving credential");
        Self::entry(service, account)?
            .get_secret()
            .map(SecretBuffer::new)
            .map_err(map_keyring_error)
    }

    fn delete(&self, service: &str, account: &str) -> Result<(), KeychainStatus> {
        Self::entry(service, account)?
            .delete_credential()
            .map_err(map_keyring_error)
    }

    fn exists(&self, service: &str, account: &str) -> bool {
        match self.retrieve(service, account) {
            Ok(_) => true,
            Err(KeychainStatus::ItemNotFound) => false,
            Err(status) => {
                warn!(%status, service, "credential existence check failed");
                false
            }
        }
    }
}

/// Stand-in for platforms without a native store: every call reports
/// [`KeychainStatus::NotAvailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKeychain;

impl PlatformStore for NoKeychain {
    fn name(&self) -> &'static str {
        "None"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn store(&self, _: &str, _: &str, _: &[u8]) -> Result<(), KeychainStatus> {
        Err(KeychainStatus::NotAvailable)
    }

    fn retrieve(&self, _: &str, _: &str) -> Result<SecretBuffer, KeychainStatus> {
        Err(KeychainStatus::NotAvailable)
    }

    fn delete(&self, _: &str, _: &str) -> Result<(), KeychainStatus> {
        Err(KeychainStatus::NotAvailable)
    }

    fn exists(&self, _: &str, _: &str) -> bool {
        false
    }
}

/// Process-local store. Used by embedders that manage persistence themselves
/// and by tests.
#[derive(Default)]
pub struct MemoryKeychain {
    items: Mutex<HashMap<(String, String), SecretBuffer>>,
    denied: Mutex<bool>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent read fail with [`KeychainStatus::AuthFailed`],
    /// as a locked keychain would.
    pub fn set_denied(&self, denied: bool) {
        if let Ok(mut flag) = self.denied.lock() {
            *flag = denied;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_denied(&self) -> bool {
        self.denied.lock().map(|flag| *flag).unwrap_or(true)
    }

    fn poisoned<T>(_: T) -> KeychainStatus {
        KeychainStatus::Failure("memory keychain lock poisoned".into())
    }
}

impl fmt::Debug for MemoryKeychain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryKeychain")
            .field("items", &self.len())
            .finish()
    }
}

impl PlatformStore for MemoryKeychain {
    fn name(&self) -> &'static str {
        "Memory"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn store(&self, service: &str, account: &str, secret: &[u8]) -> Result<(), KeychainStatus> {
        let value = SecretBuffer::copy_from(secret)
            .map_err(|e| KeychainStatus::Failure(e.to_string()))?;
        self.items
            .lock()
            .map_err(Self::poisoned)?
            .insert((service.to_owned(), account.to_owned()), value);
        Ok(())
    }

    fn retrieve(&self, service: &str, account: &str) -> Result<SecretBuffer, KeychainStatus> {
        if self.is_denied() {
            return Err(KeychainStatus::AuthFailed);
        }
        let items = self.items.lock().map_err(Self::poisoned)?;
        let value = items
            .get(&(service.to_owned(), account.to_owned()))
            .ok_or(KeychainStatus::ItemNotFound)?;
        SecretBuffer::copy_from(value.expose_secret())
            .map_err(|e| KeychainStatus::Failure(e.to_string()))
    }

    fn delete(&self, service: &str, account: &str) -> Result<(), KeychainStatus> {
        self.items
            .lock()
            .map_err(Self::poisoned)?
            .remove(&(service.to_owned(), account.to_owned()))
            .map(drop)
            .ok_or(KeychainStatus::ItemNotFound)
    }

    fn exists(&self, service: &str, account: &str) -> bool {
        self.items
            .lock()
            .map(|items| items.contains_key(&(service.to_owned(), account.to_owned())))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_until_delete_stores_are_durable() {
        assert!(is_durable(&CredentialPersistence::UntilDelete));
        for lifetime in [
            CredentialPersistence::EntryOnly,
            CredentialPersistence::ProcessOnly,
            CredentialPersistence::UntilReboot,
        ] {
            assert!(!is_durable(&lifetime));
        }
    }

    #[test]
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    fn default_store_survives_reboot() {
        assert!(is_durable(&OsKeychain::persistence()));
    }

    #[test]
    fn volatile_store_is_never_offered() {
        if !is_durable(&OsKeychain::persistence()) {
            assert!(!OsKeychain.is_available());
        }
    }

    #[test]
    fn service_names_are_scoped() {
        assert_eq!(service_name("hsm.pin", "work"), "remote-juggler.hsm.pin.work");
        assert_ne!(
            service_name("hsm.pin", "work"),
            service_name("gitlab", "work")
        );
    }

    #[test]
    fn memory_store_updates_in_place() {
        let kc = MemoryKeychain::new();
        kc.store("svc", "acct", b"one").unwrap();
        kc.store("svc", "acct", b"two").unwrap();
        assert_eq!(kc.len(), 1);
        assert_eq!(kc.retrieve("svc", "acct").unwrap().expose_secret(), b"two");
    }

    #[test]
    fn memory_store_lifecycle() {
        let kc = MemoryKeychain::new();
        assert!(!kc.exists("svc", "acct"));
        assert_eq!(
            kc.retrieve("svc", "acct").unwrap_err(),
            KeychainStatus::ItemNotFound
        );
        kc.store("svc", "acct", b"secret").unwrap();
        assert!(kc.exists("svc", "acct"));
        kc.delete("svc", "acct").unwrap();
        assert_eq!(kc.delete("svc", "acct"), Err(KeychainStatus::ItemNotFound));
    }

    #[test]
    fn memory_store_denial() {
        let kc = MemoryKeychain::new();
        kc.store("svc", "acct", b"secret").unwrap();
        kc.set_denied(true);
        assert_eq!(
            kc.retrieve("svc", "acct").unwrap_err(),
            KeychainStatus::AuthFailed
        );
        kc.set_denied(false);
        assert!(kc.retrieve("svc", "acct").is_ok());
    }

    #[test]
    fn unavailable_store_is_a_steady_state() {
        let kc = NoKeychain;
        assert!(!kc.is_available());
        assert!(!kc.exists("svc", "acct"));
        assert_eq!(kc.store("svc", "acct", b"x"), Err(KeychainStatus::NotAvailable));
        assert_eq!(
            kc.retrieve("svc", "acct").unwrap_err(),
            KeychainStatus::NotAvailable
        );
        assert_eq!(kc.delete("svc", "acct"), Err(KeychainStatus::NotAvailable));
    }

    #[test]
    fn os_status_values() {
        assert_eq!(KeychainStatus::ItemNotFound.os_status(), -25300);
        assert_eq!(KeychainStatus::AuthFailed.os_status(), -25293);
    }
}
