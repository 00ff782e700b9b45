//! Secure erasure for buffers that held secret bytes.
//!
//! [`SecretBuffer`] owns PIN, password and credential bytes and zeroes its
//! allocation when dropped, on every exit path including unwinding. The free
//! functions exist for the few places that hold raw `Vec<u8>` scratch space
//! (TPM response buffers, file contents being parsed).

use std::fmt;

use secrecy::{ExposeSecret, SecretSlice, SecretString};
use zeroize::Zeroize;

use crate::error::{HsmError, HsmResult};

/// Overwrite `buf` with zeros using writes the optimizer cannot elide.
///
/// The length is unchanged; an empty slice is a no-op.
pub fn secure_zero(buf: &mut [u8]) {
    buf.zeroize();
}

/// Zero a buffer (including spare capacity) and release it.
///
/// Safe to call with an empty or never-allocated vector.
pub fn secure_free(mut buf: Vec<u8>) {
    if buf.capacity() == 0 {
        return;
    }
    buf.zeroize();
    drop(buf);
}

/// An owned byte sequence holding secret material.
///
/// The contents are zeroed before the memory is released. Ownership moves to
/// whoever receives the buffer, and with it the erasure obligation, which the
/// destructor discharges.
pub struct SecretBuffer {
    inner: SecretSlice<u8>,
}

impl SecretBuffer {
    /// Take ownership of `bytes`.
    ///
    /// If the vector carries spare capacity it is copied into an exact-size
    /// allocation and the original is wiped, so no unzeroed tail survives a
    /// reallocation.
    pub fn new(mut bytes: Vec<u8>) -> Self {
        if bytes.capacity() != bytes.len() {
            let exact: Box<[u8]> = bytes.as_slice().into();
            bytes.zeroize();
            return Self {
                inner: SecretSlice::new(exact),
            };
        }
        Self {
            inner: SecretSlice::new(bytes.into_boxed_slice()),
        }
    }

    /// Copy `bytes` into a fresh secret allocation.
    ///
    /// Allocation failure is reported as [`HsmError::MemoryError`] instead of
    /// aborting, mirroring the C interface.
    pub fn copy_from(bytes: &[u8]) -> HsmResult<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(bytes.len())
            .map_err(|_| HsmError::MemoryError)?;
        buf.extend_from_slice(bytes);
        Ok(Self::new(buf))
    }

    pub fn len(&self) -> usize {
        self.inner.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode as UTF-8 into a [`SecretString`]. The intermediate copy is wiped
    /// when decoding fails.
    pub fn to_secret_string(&self) -> HsmResult<SecretString> {
        let bytes = self.inner.expose_secret().to_vec();
        match String::from_utf8(bytes) {
            Ok(s) => Ok(SecretString::from(s)),
            Err(e) => {
                secure_free(e.into_bytes());
                Err(HsmError::InvalidParam)
            }
        }
    }
}

impl ExposeSecret<[u8]> for SecretBuffer {
    fn expose_secret(&self) -> &[u8] {
        self.inner.expose_secret()
    }
}

impl From<Vec<u8>> for SecretBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&SecretString> for SecretBuffer {
    fn from(s: &SecretString) -> Self {
        Self::new(s.expose_secret().as_bytes().to_vec())
    }
}

impl PartialEq for SecretBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.expose_secret() == other.expose_secret()
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBuffer([REDACTED; {} bytes])", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_zero_clears_every_length() {
        for len in [0usize, 1, 4096] {
            let mut buf: Vec<u8> = (0..len).map(|i| (i % 251) as u8 + 1).collect();
            secure_zero(&mut buf);
            assert_eq!(buf.len(), len);
            assert!(buf.iter().all(|b| *b == 0), "len {len} not zeroed");
        }
    }

    #[test]
    fn secure_free_accepts_empty() {
        secure_free(Vec::new());
        secure_free(Vec::with_capacity(16));
        secure_free(vec![0xAA; 32]);
    }

    #[test]
    fn buffer_exposes_original_bytes() {
        let mut spare = Vec::with_capacity(64);
        spare.extend_from_slice(b"123456");
        let buf = SecretBuffer::new(spare);
        assert_eq!(buf.expose_secret(), b"123456");
        assert_eq!(buf.len(), 6);
        assert!(!buf.is_empty());
    }

    #[test]
    fn copy_from_and_utf8() {
        let buf = SecretBuffer::copy_from(b"pin-42").unwrap();
        assert_eq!(buf.to_secret_string().unwrap().expose_secret(), "pin-42");

        let bad = SecretBuffer::copy_from(&[0xff, 0xfe]).unwrap();
        assert_eq!(bad.to_secret_string().unwrap_err(), HsmError::InvalidParam);
    }

    #[test]
    fn debug_is_redacted() {
        let buf = SecretBuffer::copy_from(b"hunter2").unwrap();
        let shown = format!("{buf:?}");
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("7 bytes"));
    }
}
