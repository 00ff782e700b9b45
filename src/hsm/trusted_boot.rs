//! PIN sealing bound to a TPM boot measurement register.
//!
//! The sealed object lives in `<sealed_dir>/<identity>.sealed`, a bincode
//! [`SealedPin`] holding the TPM public/private blobs and the measurement
//! captured at seal time. The directory is created owner-only (0700) on
//! first use.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use bincode::{Decode, Encode};
use tracing::{debug, error, info, instrument, warn};

use super::{BackendKind, SealingBackend};
use crate::config::Config;
use crate::error::{HsmError, HsmResult};
use crate::identity::Identity;
use crate::memory::{SecretBuffer, secure_zero};

pub const SEALED_EXT: &str = "sealed";

const SEALED_FORMAT_VERSION: u8 = 1;

/// On-disk form of a sealed PIN.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct SealedPin {
    pub version: u8,
    /// Register the policy is bound to.
    pub pcr_index: u8,
    /// Register value at seal time (SHA-256 bank).
    pub measurement: Vec<u8>,
    /// Marshalled `TPM2B_PUBLIC` of the sealed data object.
    pub public: Vec<u8>,
    /// `TPM2B_PRIVATE` of the sealed data object, encrypted by the storage
    /// primary key.
    pub private: Vec<u8>,
}

impl SealedPin {
    pub fn new(pcr_index: u8, measurement: Vec<u8>, public: Vec<u8>, private: Vec<u8>) -> Self {
        Self {
            version: SEALED_FORMAT_VERSION,
            pcr_index,
            measurement,
            public,
            private,
        }
    }

    pub fn to_bytes(&self) -> HsmResult<Vec<u8>> {
        bincode::encode_to_vec(self, bincode::config::standard()).map_err(|e| {
            error!(error = %e, "failed to encode sealed pin");
            HsmError::InternalError
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> HsmResult<Self> {
        let (pin, _): (SealedPin, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard()).map_err(|e| {
                warn!(error = %e, "sealed pin file is corrupt");
                HsmError::UnsealFailed
            })?;
        if pin.version != SEALED_FORMAT_VERSION {
            warn!(version = pin.version, "unsupported sealed pin version");
            return Err(HsmError::UnsealFailed);
        }
        Ok(pin)
    }
}

/// Device-side sealing primitive.
///
/// `seal` must bind the object to the measurement register so the device
/// itself refuses to unseal once the register changes.
pub trait PcrSealer: Send + Sync {
    /// A device is reachable and its measurement register readable.
    fn is_available(&self) -> bool;

    fn pcr_index(&self) -> u8;

    /// Current value of the measurement register.
    fn read_measurement(&self) -> HsmResult<Vec<u8>>;

    fn seal(&self, secret: &[u8]) -> HsmResult<SealedPin>;

    fn unseal(&self, sealed: &SealedPin) -> HsmResult<SecretBuffer>;
}

/// Placeholder when the TPM binding is not compiled in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTpm;

impl PcrSealer for NoTpm {
    fn is_available(&self) -> bool {
        false
    }

    fn pcr_index(&self) -> u8 {
        0
    }

    fn read_measurement(&self) -> HsmResult<Vec<u8>> {
        Err(HsmError::DeviceUnavailable)
    }

    fn seal(&self, _: &[u8]) -> HsmResult<SealedPin> {
        Err(HsmError::NotAvailable)
    }

    fn unseal(&self, _: &SealedPin) -> HsmResult<SecretBuffer> {
        Err(HsmError::NotAvailable)
    }
}

#[cfg(feature = "tpm")]
pub(super) fn default_sealer(config: &Config) -> Box<dyn PcrSealer> {
    Box::new(crate::tpm::TssSealer::new(
        config.tcti.clone(),
        config.pcr_index,
    ))
}

#[cfg(not(feature = "tpm"))]
pub(super) fn default_sealer(_config: &Config) -> Box<dyn PcrSealer> {
    Box::new(NoTpm)
}

impl<T: PcrSealer + ?Sized> PcrSealer for Box<T> {
    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn pcr_index(&self) -> u8 {
        (**self).pcr_index()
    }

    fn read_measurement(&self) -> HsmResult<Vec<u8>> {
        (**self).read_measurement()
    }

    fn seal(&self, secret: &[u8]) -> HsmResult<SealedPin> {
        (**self).seal(secret)
    }

    fn unseal(&self, sealed: &SealedPin) -> HsmResult<SecretBuffer> {
        (**self).unseal(sealed)
    }
}

pub struct TrustedBootBackend<S> {
    sealer: S,
    dir: PathBuf,
    available: OnceLock<bool>,
}

impl<S: PcrSealer> TrustedBootBackend<S> {
    pub fn new(sealer: S, dir: PathBuf) -> Self {
        Self {
            sealer,
            dir,
            available: OnceLock::new(),
        }
    }

    pub fn sealed_path(&self, identity: &Identity) -> PathBuf {
        self.dir.join(format!("{identity}.{SEALED_EXT}"))
    }

    /// Current register value, for troubleshooting failed unseals.
    pub fn read_measurement(&self) -> HsmResult<Vec<u8>> {
        self.sealer.read_measurement()
    }

    pub fn measurement_hex(&self) -> HsmResult<String> {
        self.read_measurement().map(hex::encode)
    }

    fn write_atomically(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        ensure_private_dir(&self.dir)?;
        // NamedTempFile is created 0600 and renamed over the old blob, so a
        // reader sees either the previous PIN or the new one.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Create `dir` (and parents) and force it to owner-only access.
pub(crate) fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    #[cfg(not(unix))]
    fs::create_dir_all(dir)?;
    Ok(())
}

/// Overwrite a file's contents with zeros, flush, then unlink it.
pub(crate) fn shred_file(path: &Path) -> io::Result<()> {
    let len = fs::metadata(path)?.len();
    {
        let mut file: File = OpenOptions::new().write(true).open(path)?;
        let zeros = [0u8; 4096];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(zeros.len() as u64) as usize;
            file.write_all(&zeros[..n])?;
            remaining -= n as u64;
        }
        file.sync_all()?;
    }
    fs::remove_file(path)
}

impl<S: PcrSealer> SealingBackend for TrustedBootBackend<S> {
    fn kind(&self) -> BackendKind {
        BackendKind::TrustedBoot
    }

    fn is_available(&self) -> bool {
        *self.available.get_or_init(|| self.sealer.is_available())
    }

    #[instrument(level = "debug", skip(self, secret))]
    fn store(&self, identity: &Identity, secret: &[u8]) -> HsmResult<()> {
        let sealed = self.sealer.seal(secret)?;
        let bytes = sealed.to_bytes()?;
        let path = self.sealed_path(identity);
        self.write_atomically(&path, &bytes).map_err(|e| {
            error!(error = %e, path = %path.display(), "failed to write sealed pin");
            HsmError::IoError
        })?;
        info!(%identity, pcr = sealed.pcr_index, "pin sealed to boot measurement");
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    fn retrieve(&self, identity: &Identity) -> HsmResult<SecretBuffer> {
        let path = self.sealed_path(identity);
        let mut bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(HsmError::KeyNotFound),
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to read sealed pin");
                return Err(HsmError::IoError);
            }
        };
        let parsed = SealedPin::from_bytes(&bytes);
        secure_zero(&mut bytes);
        let sealed = parsed?;

        let current = self.sealer.read_measurement()?;
        if current != sealed.measurement {
            warn!(
                %identity,
                sealed = %hex::encode(&sealed.measurement),
                current = %hex::encode(&current),
                "boot measurement changed since pin was sealed"
            );
            return Err(HsmError::BootChainChanged);
        }

        match self.sealer.unseal(&sealed) {
            // The register can move between the comparison and the unseal.
            Err(HsmError::UnsealFailed)
                if self
                    .sealer
                    .read_measurement()
                    .is_ok_and(|now| now != sealed.measurement) =>
            {
                Err(HsmError::BootChainChanged)
            }
            other => other,
        }
    }

    fn clear(&self, identity: &Identity) -> HsmResult<()> {
        let path = self.sealed_path(identity);
        match shred_file(&path) {
            Ok(()) => {
                debug!(%identity, "sealed pin removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(HsmError::KeyNotFound),
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to remove sealed pin");
                Err(HsmError::IoError)
            }
        }
    }

    fn exists(&self, identity: &Identity) -> bool {
        self.sealed_path(identity).is_file()
    }

    fn diagnostics(&self) -> Option<String> {
        match self.measurement_hex() {
            Ok(hex) => Some(format!("PCR {}: {hex}", self.sealer.pcr_index())),
            Err(e) => Some(format!("PCR {} unreadable: {e}", self.sealer.pcr_index())),
        }
    }
}
