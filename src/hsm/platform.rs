use std::sync::Arc;

use tracing::debug;

use super::{BackendKind, SealingBackend};
use crate::error::{HsmError, HsmResult};
use crate::identity::Identity;
use crate::keychain::{KeychainStatus, PlatformStore, service_name};
use crate::memory::SecretBuffer;

/// Keychain domain for PINs: services are `remote-juggler.hsm.pin.<identity>`.
pub const PIN_DOMAIN: &str = "hsm.pin";

/// Which PIN operation a keychain status came from; the same native status
/// means different things for a write and a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeychainOp {
    Store,
    Retrieve,
    Delete,
}

/// Translate a native credential store status into the shared taxonomy.
pub fn map_keychain_status(op: KeychainOp, status: &KeychainStatus) -> HsmError {
    match (op, status) {
        (_, KeychainStatus::NotAvailable) => HsmError::NotAvailable,
        (_, KeychainStatus::AuthFailed) => HsmError::AuthFailed,
        (KeychainOp::Retrieve | KeychainOp::Delete, KeychainStatus::ItemNotFound) => {
            HsmError::KeyNotFound
        }
        (KeychainOp::Store, _) => HsmError::SealFailed,
        (KeychainOp::Retrieve, _) => HsmError::UnsealFailed,
        (KeychainOp::Delete, _) => HsmError::IoError,
    }
}

/// Software fallback: the PIN sits in the OS credential store, protected by
/// the login session only.
pub struct PlatformStoreBackend {
    store: Arc<dyn PlatformStore>,
}

impl PlatformStoreBackend {
    pub fn new(store: Arc<dyn PlatformStore>) -> Self {
        Self { store }
    }

    fn service(identity: &Identity) -> String {
        service_name(PIN_DOMAIN, identity.as_str())
    }
}

impl SealingBackend for PlatformStoreBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::PlatformStore
    }

    fn is_available(&self) -> bool {
        self.store.is_available()
    }

    fn store(&self, identity: &Identity, secret: &[u8]) -> HsmResult<()> {
        self.store
            .store(&Self::service(identity), identity.as_str(), secret)
            .map_err(|status| {
                debug!(%status, code = status.os_status(), "keychain store failed");
                map_keychain_status(KeychainOp::Store, &status)
            })
    }

    fn retrieve(&self, identity: &Identity) -> HsmResult<SecretBuffer> {
        self.store
            .retrieve(&Self::service(identity), identity.as_str())
            .map_err(|status| map_keychain_status(KeychainOp::Retrieve, &status))
    }

    fn clear(&self, identity: &Identity) -> HsmResult<()> {
        self.store
            .delete(&Self::service(identity), identity.as_str())
            .map_err(|status| map_keychain_status(KeychainOp::Delete, &status))
    }

    fn exists(&self, identity: &Identity) -> bool {
        self.store.exists(&Self::service(identity), identity.as_str())
    }

    fn diagnostics(&self) -> Option<String> {
        Some(format!("credential store: {}", self.store.name()))
    }
}
