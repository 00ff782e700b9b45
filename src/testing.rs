//! Software stand-ins for hardware, shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::crypt::KdfParams;
use crate::error::{HsmError, HsmResult};
use crate::hsm::{
    BackendKind, BackendSelector, Hsm, PcrSealer, SealedPin, SealingBackend, SecureElement,
};
use crate::identity::Identity;
use crate::memory::SecretBuffer;
use crate::vault::Vault;

/// A backend with fixed availability that keeps PINs in memory and counts
/// how often it is checked and called.
pub struct ScriptedBackend {
    kind: BackendKind,
    available: bool,
    checks: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
    pins: Mutex<HashMap<String, SecretBuffer>>,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind, available: bool) -> Self {
        Self {
            kind,
            available,
            checks: Arc::default(),
            calls: Arc::default(),
            pins: Mutex::default(),
        }
    }

    pub fn check_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.checks)
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl SealingBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.available
    }

    fn store(&self, identity: &Identity, secret: &[u8]) -> HsmResult<()> {
        self.touch();
        self.pins
            .lock()
            .unwrap()
            .insert(identity.to_string(), SecretBuffer::copy_from(secret)?);
        Ok(())
    }

    fn retrieve(&self, identity: &Identity) -> HsmResult<SecretBuffer> {
        self.touch();
        let pins = self.pins.lock().unwrap();
        let pin = pins.get(identity.as_str()).ok_or(HsmError::KeyNotFound)?;
        SecretBuffer::copy_from(pin.expose_secret())
    }

    fn clear(&self, identity: &Identity) -> HsmResult<()> {
        self.touch();
        self.pins
            .lock()
            .unwrap()
            .remove(identity.as_str())
            .map(drop)
            .ok_or(HsmError::KeyNotFound)
    }

    fn exists(&self, identity: &Identity) -> bool {
        self.touch();
        self.pins.lock().unwrap().contains_key(identity.as_str())
    }
}

#[derive(Default)]
struct SealerState {
    measurement: Mutex<Vec<u8>>,
    unavailable: AtomicBool,
}

/// Software PCR sealer. "Sealing" masks the secret with a pad derived from
/// the current measurement, so unsealing after the measurement changes
/// fails just as it would on a device.
#[derive(Clone)]
pub struct FakeSealer {
    pcr_index: u8,
    state: Arc<SealerState>,
}

impl FakeSealer {
    pub fn new(pcr_index: u8) -> Self {
        let sealer = Self {
            pcr_index,
            state: Arc::default(),
        };
        sealer.set_measurement(vec![0x5A; 32]);
        sealer
    }

    /// Simulate a boot chain change.
    pub fn set_measurement(&self, measurement: Vec<u8>) {
        *self.state.measurement.lock().unwrap() = measurement;
    }

    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
    }

    fn pad(measurement: &[u8]) -> Vec<u8> {
        Sha256::new()
            .chain_update(b"fake-sealer")
            .chain_update(measurement)
            .finalize()
            .to_vec()
    }

    fn mask(pad: &[u8], data: &[u8]) -> Vec<u8> {
        data.iter()
            .zip(pad.iter().cycle())
            .map(|(d, p)| d ^ p)
            .collect()
    }
}

impl PcrSealer for FakeSealer {
    fn is_available(&self) -> bool {
        !self.state.unavailable.load(Ordering::SeqCst)
    }

    fn pcr_index(&self) -> u8 {
        self.pcr_index
    }

    fn read_measurement(&self) -> HsmResult<Vec<u8>> {
        Ok(self.state.measurement.lock().unwrap().clone())
    }

    fn seal(&self, secret: &[u8]) -> HsmResult<SealedPin> {
        let measurement = self.read_measurement()?;
        let pad = Self::pad(&measurement);
        let policy = Sha256::digest(&pad).to_vec();
        Ok(SealedPin::new(
            self.pcr_index,
            measurement,
            policy,
            Self::mask(&pad, secret),
        ))
    }

    fn unseal(&self, sealed: &SealedPin) -> HsmResult<SecretBuffer> {
        let pad = Self::pad(&self.read_measurement()?);
        if Sha256::digest(&pad).as_slice() != sealed.public.as_slice() {
            return Err(HsmError::UnsealFailed);
        }
        Ok(SecretBuffer::new(Self::mask(&pad, &sealed.private)))
    }
}

#[derive(Default)]
struct ElementState {
    absent: AtomicBool,
    cancel: AtomicBool,
    created: AtomicUsize,
    keys: Mutex<HashMap<String, [u8; 32]>>,
    last_reason: Mutex<Option<String>>,
}

/// Software secure element holding random XOR keys per tag.
#[derive(Clone, Default)]
pub struct SoftElement {
    state: Arc<ElementState>,
}

impl SoftElement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_present(&self, present: bool) {
        self.state.absent.store(!present, Ordering::SeqCst);
    }

    /// Make every decrypt behave as if the user dismissed the prompt.
    pub fn cancel_prompts(&self, cancel: bool) {
        self.state.cancel.store(cancel, Ordering::SeqCst);
    }

    pub fn keys_created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn last_reason(&self) -> Option<String> {
        self.state.last_reason.lock().unwrap().clone()
    }

    fn key(&self, tag: &str) -> HsmResult<[u8; 32]> {
        self.state
            .keys
            .lock()
            .unwrap()
            .get(tag)
            .copied()
            .ok_or(HsmError::KeyNotFound)
    }
}

impl SecureElement for SoftElement {
    fn is_present(&self) -> bool {
        !self.state.absent.load(Ordering::SeqCst)
    }

    fn has_key(&self, tag: &str) -> bool {
        self.state.keys.lock().unwrap().contains_key(tag)
    }

    fn create_key(&self, tag: &str, _require_biometry: bool) -> HsmResult<()> {
        self.state.created.fetch_add(1, Ordering::SeqCst);
        self.state
            .keys
            .lock()
            .unwrap()
            .insert(tag.to_owned(), rand::random());
        Ok(())
    }

    fn encrypt(&self, tag: &str, plaintext: &[u8]) -> HsmResult<Vec<u8>> {
        let key = self.key(tag)?;
        Ok(FakeSealer::mask(&key, plaintext))
    }

    fn decrypt(&self, tag: &str, ciphertext: &[u8], reason: &str) -> HsmResult<SecretBuffer> {
        *self.state.last_reason.lock().unwrap() = Some(reason.to_owned());
        if self.state.cancel.load(Ordering::SeqCst) {
            return Err(HsmError::AuthFailed);
        }
        let key = self.key(tag)?;
        Ok(SecretBuffer::new(FakeSealer::mask(&key, ciphertext)))
    }

    fn delete_key(&self, tag: &str) -> HsmResult<()> {
        self.state
            .keys
            .lock()
            .unwrap()
            .remove(tag)
            .map(drop)
            .ok_or(HsmError::KeyNotFound)
    }
}

/// A bootstrapped, unsealed credential store under `dir` with the cheapest
/// KDF settings, plus its master password.
pub fn scratch_vault(dir: &tempfile::TempDir) -> (Vault, SecretString) {
    let mut config = Config::with_config_dir(dir.path());
    config.kdf = KdfParams::minimal();
    let vault = Vault::open(config, Hsm::new(Arc::new(BackendSelector::none()))).unwrap();
    vault.bootstrap(false).unwrap();
    let password = vault.session().get().unwrap();
    (vault, password)
}
