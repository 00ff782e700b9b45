//! Hardware security module abstraction for identity-scoped PIN storage.
//!
//! Each identity (`personal`, `work`) has at most one sealed PIN. The PIN is
//! sealed with the best primitive the machine offers, in priority order:
//!
//! 1. [`TrustedBoot`](BackendKind::TrustedBoot): TPM 2.0 sealing bound to a
//!    boot measurement register (PCR 7 by default).
//! 2. [`SecureElement`](BackendKind::SecureElement): a non-extractable key
//!    in the Secure Enclave, decryption gated on user presence.
//! 3. [`PlatformStore`](BackendKind::PlatformStore): the OS credential
//!    store, protected only by the login session.
//!
//! [`BackendSelector`] holds the candidates and remembers which one was
//! usable; [`Hsm`] validates arguments and routes every call to it.

mod platform;
mod secure_element;
mod trusted_boot;

#[cfg(target_os = "macos")]
mod apple;

use std::fmt;
use std::sync::{Arc, OnceLock};

use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::{HsmError, HsmResult};
use crate::identity::Identity;
use crate::keychain::{OsKeychain, PlatformStore};
use crate::memory::SecretBuffer;

pub use platform::{KeychainOp, PIN_DOMAIN, PlatformStoreBackend, map_keychain_status};
pub use secure_element::{
    KEY_TAG_PREFIX, SE_KEYCHAIN_SERVICE, SecureElement, SecureElementBackend, UnsupportedElement,
};
pub use trusted_boot::{NoTpm, PcrSealer, SEALED_EXT, SealedPin, TrustedBootBackend};

#[cfg(target_os = "macos")]
pub use apple::EnclaveElement;

/// Longest secret accepted for sealing; the TPM sensitive-data buffer is
/// 128 bytes.
pub const MAX_SECRET_LEN: usize = 128;

/// Which primitive protects sealed PINs on this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    None,
    TrustedBoot,
    SecureElement,
    PlatformStore,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::None => "None",
            BackendKind::TrustedBoot => "TPM 2.0",
            BackendKind::SecureElement => "Secure Enclave",
            BackendKind::PlatformStore => "Keychain",
        }
    }

    /// Hardware-rooted backends, as opposed to the software fallback.
    pub fn is_hardware(self) -> bool {
        matches!(self, BackendKind::TrustedBoot | BackendKind::SecureElement)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A primitive that can seal one secret per identity.
///
/// Implementations map every native failure into [`HsmError`] and leave no
/// partial state behind when `store` fails.
pub trait SealingBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether the backend can be used on this machine. Called once by the
    /// selector; must not prompt the user.
    fn is_available(&self) -> bool;

    /// Seal `secret`, atomically replacing any previous one for `identity`.
    fn store(&self, identity: &Identity, secret: &[u8]) -> HsmResult<()>;

    /// Recover the sealed secret. May block on a user-presence prompt.
    fn retrieve(&self, identity: &Identity) -> HsmResult<SecretBuffer>;

    /// Remove the sealed secret and its key material.
    /// [`HsmError::KeyNotFound`] if nothing was stored.
    fn clear(&self, identity: &Identity) -> HsmResult<()>;

    /// Existence check only; never unseals.
    fn exists(&self, identity: &Identity) -> bool;

    /// Backend-specific troubleshooting detail for status reports.
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// Reports [`HsmError::NotAvailable`] for everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unavailable;

impl SealingBackend for Unavailable {
    fn kind(&self) -> BackendKind {
        BackendKind::None
    }

    fn is_available(&self) -> bool {
        false
    }

    fn store(&self, _: &Identity, _: &[u8]) -> HsmResult<()> {
        Err(HsmError::NotAvailable)
    }

    fn retrieve(&self, _: &Identity) -> HsmResult<SecretBuffer> {
        Err(HsmError::NotAvailable)
    }

    fn clear(&self, _: &Identity) -> HsmResult<()> {
        Err(HsmError::NotAvailable)
    }

    fn exists(&self, _: &Identity) -> bool {
        false
    }
}

static UNAVAILABLE: Unavailable = Unavailable;

/// Candidate backends in priority order plus the cached detection result.
///
/// Detection runs once, on first use; availability is a machine-level
/// property, so a new selector (or a restart) is needed to re-detect. The
/// selector performs no locking of its own beyond the one-time
/// initialisation: hosts that call into it from several threads should
/// serialise access, since hardware sessions are not reentrant.
pub struct BackendSelector {
    backends: Vec<Box<dyn SealingBackend>>,
    chosen: OnceLock<Option<usize>>,
}

impl BackendSelector {
    /// `backends` must be ordered from most to least preferred.
    pub fn new(backends: Vec<Box<dyn SealingBackend>>) -> Self {
        Self {
            backends,
            chosen: OnceLock::new(),
        }
    }

    /// The real backends for this machine:
    /// TPM → Secure Enclave → OS credential store.
    pub fn platform_default(config: &Config) -> Self {
        let keychain: Arc<dyn PlatformStore> = Arc::new(OsKeychain);
        Self::new(vec![
            Box::new(TrustedBootBackend::new(
                trusted_boot::default_sealer(config),
                config.sealed_dir.clone(),
            )),
            Box::new(SecureElementBackend::new(
                secure_element::default_element(),
                Arc::clone(&keychain),
                config.auth_reason.clone(),
                config.require_biometry,
            )),
            Box::new(PlatformStoreBackend::new(keychain)),
        ])
    }

    /// Selector that never finds hardware.
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    /// First available backend, detected once and cached.
    pub fn detect(&self) -> BackendKind {
        self.active().kind()
    }

    /// The backend every call is routed to.
    pub fn active(&self) -> &dyn SealingBackend {
        let chosen = self.chosen.get_or_init(|| {
            for (index, backend) in self.backends.iter().enumerate() {
                if backend.is_available() {
                    info!(backend = %backend.kind(), "hsm backend selected");
                    return Some(index);
                }
                debug!(backend = %backend.kind(), "hsm backend unavailable");
            }
            warn!("no hsm backend available");
            None
        });
        match chosen {
            Some(index) => self.backends[*index].as_ref(),
            None => &UNAVAILABLE,
        }
    }

    /// Whether detection has already run.
    pub fn is_detected(&self) -> bool {
        self.chosen.get().is_some()
    }
}

impl fmt::Debug for BackendSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<BackendKind> = self.backends.iter().map(|b| b.kind()).collect();
        f.debug_struct("BackendSelector")
            .field("backends", &kinds)
            .field("chosen", &self.chosen.get())
            .finish()
    }
}

/// Summary for `status` style diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsmStatusReport {
    pub backend: BackendKind,
    pub available: bool,
    pub description: String,
    /// Backend detail, e.g. the current boot measurement in hex.
    pub diagnostics: Option<String>,
    pub tpm_support: bool,
    pub secure_enclave_support: bool,
}

/// Dispatcher for the identity PIN lifecycle.
#[derive(Debug, Clone)]
pub struct Hsm {
    selector: Arc<BackendSelector>,
}

impl Hsm {
    pub fn new(selector: Arc<BackendSelector>) -> Self {
        Self { selector }
    }

    pub fn platform_default(config: &Config) -> Self {
        Self::new(Arc::new(BackendSelector::platform_default(config)))
    }

    pub fn selector(&self) -> &BackendSelector {
        &self.selector
    }

    pub fn detected_backend(&self) -> BackendKind {
        self.selector.detect()
    }

    pub fn is_available(&self) -> bool {
        self.detected_backend() != BackendKind::None
    }

    /// Seal `pin` for `identity`, replacing any existing PIN.
    #[instrument(level = "debug", skip(self, pin))]
    pub fn store_pin(&self, identity: &str, pin: &[u8]) -> HsmResult<()> {
        let identity = Identity::parse(identity)?;
        if pin.is_empty() || pin.len() > MAX_SECRET_LEN {
            return Err(HsmError::InvalidParam);
        }
        let backend = self.selector.active();
        backend.store(&identity, pin).inspect_err(|e| {
            warn!(backend = %backend.kind(), %identity, error = %e, "store pin failed");
        })
    }

    /// Convenience for text PINs and passwords.
    pub fn store_secret(&self, identity: &str, secret: &secrecy::SecretString) -> HsmResult<()> {
        self.store_pin(identity, secret.expose_secret().as_bytes())
    }

    /// Unseal the PIN for `identity`. The caller owns the returned buffer,
    /// which is wiped when dropped.
    #[instrument(level = "debug", skip(self))]
    pub fn retrieve_pin(&self, identity: &str) -> HsmResult<SecretBuffer> {
        let identity = Identity::parse(identity)?;
        let backend = self.selector.active();
        backend.retrieve(&identity).inspect_err(|e| {
            if e.is_recoverable() {
                info!(backend = %backend.kind(), %identity, error = %e, "pin needs user action");
            } else {
                debug!(backend = %backend.kind(), %identity, error = %e, "retrieve pin failed");
            }
        })
    }

    /// Remove the PIN for `identity`. A second clear reports
    /// [`HsmError::KeyNotFound`].
    #[instrument(level = "debug", skip(self))]
    pub fn clear_pin(&self, identity: &str) -> HsmResult<()> {
        let identity = Identity::parse(identity)?;
        self.selector.active().clear(&identity)
    }

    /// Invalid identities and unavailable backends both report `false`.
    pub fn has_pin(&self, identity: &str) -> bool {
        match Identity::parse(identity) {
            Ok(identity) => self.selector.active().exists(&identity),
            Err(_) => false,
        }
    }

    pub fn status(&self) -> HsmStatusReport {
        let backend = self.selector.active();
        let kind = backend.kind();
        let description = match kind {
            BackendKind::None => "no hardware security available".to_owned(),
            BackendKind::TrustedBoot => "TPM 2.0, PIN sealed to boot measurement".to_owned(),
            BackendKind::SecureElement => {
                "Secure Enclave, PIN encrypted to a non-extractable key".to_owned()
            }
            BackendKind::PlatformStore => "OS credential store (software fallback)".to_owned(),
        };
        HsmStatusReport {
            backend: kind,
            available: kind != BackendKind::None,
            description,
            diagnostics: backend.diagnostics(),
            tpm_support: Self::has_tpm_support(),
            secure_enclave_support: Self::has_secure_enclave_support(),
        }
    }

    /// Whether the TPM binding was compiled in.
    pub const fn has_tpm_support() -> bool {
        cfg!(feature = "tpm")
    }

    /// Whether the Secure Enclave binding was compiled in.
    pub const fn has_secure_enclave_support() -> bool {
        cfg!(target_os = "macos")
    }
}
