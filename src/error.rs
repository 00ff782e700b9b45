//! Error taxonomy shared by every sealing backend and the credential store.
//!
//! Backends translate their native failures (TSS response codes, keychain
//! `OSStatus` values, I/O errors) into [`HsmError`] at their boundary, so
//! callers only ever branch on this enum.

use thiserror::Error;

/// Outcome of an HSM operation. `Ok(())` is the `Success` status.
pub type HsmResult<T> = Result<T, HsmError>;

/// Closed set of failures surfaced by the HSM dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum HsmError {
    #[error("HSM not available on this platform")]
    NotAvailable,
    #[error("failed to seal/encrypt PIN")]
    SealFailed,
    #[error("failed to unseal/decrypt PIN (security state may have changed)")]
    UnsealFailed,
    #[error("no PIN stored for this identity")]
    KeyNotFound,
    #[error("authentication failed (wrong password, cancelled, or biometric mismatch)")]
    AuthFailed,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("memory allocation failed")]
    MemoryError,
    #[error("hardware security device not accessible")]
    DeviceUnavailable,
    #[error("boot measurement changed since the PIN was sealed")]
    BootChainChanged,
    #[error("I/O error during HSM operation")]
    IoError,
    #[error("internal error")]
    InternalError,
}

impl HsmError {
    /// Stable negative status code, as reported over the C-style interface.
    pub fn code(self) -> i32 {
        match self {
            HsmError::NotAvailable => -1,
            HsmError::SealFailed => -2,
            HsmError::UnsealFailed => -3,
            HsmError::KeyNotFound => -4,
            HsmError::AuthFailed => -5,
            HsmError::InvalidParam => -6,
            HsmError::MemoryError => -7,
            HsmError::DeviceUnavailable => -8,
            HsmError::BootChainChanged => -10,
            HsmError::IoError => -11,
            HsmError::InternalError => -12,
        }
    }

    /// Reverse of [`HsmError::code`]. `0` and unknown codes yield `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => HsmError::NotAvailable,
            -2 => HsmError::SealFailed,
            -3 => HsmError::UnsealFailed,
            -4 => HsmError::KeyNotFound,
            -5 => HsmError::AuthFailed,
            -6 => HsmError::InvalidParam,
            -7 => HsmError::MemoryError,
            -8 | -9 => HsmError::DeviceUnavailable,
            -10 => HsmError::BootChainChanged,
            -11 => HsmError::IoError,
            -12 => HsmError::InternalError,
            _ => return None,
        })
    }

    /// Expected conditions the caller should explain to the user (a reboot
    /// changed the boot chain, the user declined the presence prompt) rather
    /// than report as a fault.
    pub fn is_recoverable(self) -> bool {
        matches!(self, HsmError::AuthFailed | HsmError::BootChainChanged)
    }
}

/// Status code for a full operation result, `0` on success.
pub fn status_code<T>(result: &HsmResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

impl From<std::io::Error> for HsmError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => HsmError::KeyNotFound,
            std::io::ErrorKind::PermissionDenied => HsmError::DeviceUnavailable,
            std::io::ErrorKind::OutOfMemory => HsmError::MemoryError,
            _ => HsmError::IoError,
        }
    }
}

/// Errors raised by the encrypted credential store.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("hsm: {0}")]
    Hsm(#[from] HsmError),
    #[error("wrong master password")]
    WrongPassword,
    #[error("no credential database at {0}")]
    NotInitialized(String),
    #[error("credential database already exists at {0}")]
    AlreadyExists(String),
    #[error("no entry at {0}")]
    NotFound(String),
    #[error("invalid entry path {0:?}")]
    InvalidPath(String),
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    #[error("database: {0}")]
    Db(#[from] sled::Error),
    #[error("encoding: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("decoding: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("cryptographic failure")]
    Crypto,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sops: {0}")]
    Sops(String),
}

pub type VaultResult<T> = Result<T, VaultError>;
