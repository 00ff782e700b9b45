//! Secure Enclave style backend.
//!
//! Each identity gets a non-extractable P-256 key tagged
//! `com.remotejuggler.hsm.<identity>`. The PIN is encrypted to that key
//! (ECIES) and the ciphertext parked in the credential store under service
//! `remote-juggler.hsm.pin`, account `<identity>`. Decryption requires the
//! key's access control to be satisfied, which prompts for user presence.

use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::{debug, info, instrument, warn};

use super::{BackendKind, KeychainOp, SealingBackend, map_keychain_status};
use crate::error::{HsmError, HsmResult};
use crate::identity::Identity;
use crate::keychain::{KeychainStatus, PlatformStore};
use crate::memory::SecretBuffer;

pub const KEY_TAG_PREFIX: &str = "com.remotejuggler.hsm.";
pub const SE_KEYCHAIN_SERVICE: &str = "remote-juggler.hsm.pin";

/// Key operations of a hardware element holding non-extractable keys.
///
/// `decrypt` may block on a user-presence prompt; a cancelled or failed
/// prompt must be reported as [`HsmError::AuthFailed`].
pub trait SecureElement: Send + Sync {
    fn is_present(&self) -> bool;

    fn has_key(&self, tag: &str) -> bool;

    fn create_key(&self, tag: &str, require_biometry: bool) -> HsmResult<()>;

    fn encrypt(&self, tag: &str, plaintext: &[u8]) -> HsmResult<Vec<u8>>;

    /// `reason` is the text shown in the presence prompt.
    fn decrypt(&self, tag: &str, ciphertext: &[u8], reason: &str) -> HsmResult<SecretBuffer>;

    /// [`HsmError::KeyNotFound`] if no key carries `tag`.
    fn delete_key(&self, tag: &str) -> HsmResult<()>;
}

/// Element for machines without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedElement;

impl SecureElement for UnsupportedElement {
    fn is_present(&self) -> bool {
        false
    }

    fn has_key(&self, _: &str) -> bool {
        false
    }

    fn create_key(&self, _: &str, _: bool) -> HsmResult<()> {
        Err(HsmError::NotAvailable)
    }

    fn encrypt(&self, _: &str, _: &[u8]) -> HsmResult<Vec<u8>> {
        Err(HsmError::NotAvailable)
    }

    fn decrypt(&self, _: &str, _: &[u8], _: &str) -> HsmResult<SecretBuffer> {
        Err(HsmError::NotAvailable)
    }

    fn delete_key(&self, _: &str) -> HsmResult<()> {
        Err(HsmError::NotAvailable)
    }
}

#[cfg(target_os = "macos")]
pub(super) fn default_element() -> Box<dyn SecureElement> {
    Box::new(super::apple::EnclaveElement)
}

#[cfg(not(target_os = "macos"))]
pub(super) fn default_element() -> Box<dyn SecureElement> {
    Box::new(UnsupportedElement)
}

pub fn key_tag(identity: &Identity) -> String {
    format!("{KEY_TAG_PREFIX}{identity}")
}

pub struct SecureElementBackend {
    element: Box<dyn SecureElement>,
    keychain: Arc<dyn PlatformStore>,
    reason: String,
    require_biometry: bool,
}

impl SecureElementBackend {
    pub fn new(
        element: Box<dyn SecureElement>,
        keychain: Arc<dyn PlatformStore>,
        reason: String,
        require_biometry: bool,
    ) -> Self {
        Self {
            element,
            keychain,
            reason,
            require_biometry,
        }
    }

    /// Idempotent: an existing key for `identity` is kept.
    pub fn ensure_key(&self, identity: &Identity) -> HsmResult<()> {
        let tag = key_tag(identity);
        if self.element.has_key(&tag) {
            return Ok(());
        }
        self.element.create_key(&tag, self.require_biometry)?;
        info!(%identity, "secure element key created");
        Ok(())
    }
}

impl SealingBackend for SecureElementBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SecureElement
    }

    fn is_available(&self) -> bool {
        self.element.is_present() && self.keychain.is_available()
    }

    #[instrument(level = "debug", skip(self, secret))]
    fn store(&self, identity: &Identity, secret: &[u8]) -> HsmResult<()> {
        self.ensure_key(identity)?;
        let ciphertext = self.element.encrypt(&key_tag(identity), secret)?;
        self.keychain
            .store(SE_KEYCHAIN_SERVICE, identity.as_str(), &ciphertext)
            .map_err(|status| {
                warn!(%status, "failed to store enclave ciphertext");
                map_keychain_status(KeychainOp::Store, &status)
            })
    }

    #[instrument(level = "debug", skip(self))]
    fn retrieve(&self, identity: &Identity) -> HsmResult<SecretBuffer> {
        let ciphertext = self
            .keychain
            .retrieve(SE_KEYCHAIN_SERVICE, identity.as_str())
            .map_err(|status| map_keychain_status(KeychainOp::Retrieve, &status))?;
        let tag = key_tag(identity);
        if !self.element.has_key(&tag) {
            warn!(%identity, "ciphertext present but enclave key is gone");
            return Err(HsmError::KeyNotFound);
        }
        self.element
            .decrypt(&tag, ciphertext.expose_secret(), &self.reason)
    }

    fn clear(&self, identity: &Identity) -> HsmResult<()> {
        let key = self.element.delete_key(&key_tag(identity));
        let blob = self
            .keychain
            .delete(SE_KEYCHAIN_SERVICE, identity.as_str());
        match (key, blob) {
            (Err(HsmError::KeyNotFound), Err(KeychainStatus::ItemNotFound)) => {
                Err(HsmError::KeyNotFound)
            }
            (Ok(()) | Err(HsmError::KeyNotFound), Ok(()) | Err(KeychainStatus::ItemNotFound)) => {
                debug!(%identity, "enclave key and ciphertext removed");
                Ok(())
            }
            (Err(e), _) => Err(e),
            (_, Err(status)) => Err(map_keychain_status(KeychainOp::Delete, &status)),
        }
    }

    fn exists(&self, identity: &Identity) -> bool {
        self.keychain
            .exists(SE_KEYCHAIN_SERVICE, identity.as_str())
    }

    fn diagnostics(&self) -> Option<String> {
        Some(format!(
            "enclave present: {}, biometry required: {}",
            self.element.is_present(),
            self.require_biometry
        ))
    }
}
