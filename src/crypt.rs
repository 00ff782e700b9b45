//! Key hierarchy for the credential store.
//!
//! ```text
//! master password ──Argon2id(kdf_salt)──► VaultKey
//!     VaultKey ──HKDF-SHA256(entry salt, info = path)──► EntryKey ──► AES-256-GCM
//! ```
//!
//! Every entry gets its own random salt and therefore its own key; the path
//! is bound both into the HKDF info and into the AEAD associated data, so a
//! record copied under another path does not decrypt.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use bincode::{Decode, Encode};
use hkdf::Hkdf;
use rand::{Rng, RngCore};
use secrecy::{ExposeSecret, SecretSlice, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{VaultError, VaultResult};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const SALT_LEN: usize = 16;

/// Password alphabet: 64 symbols, so each character carries 6 bits.
const PASSWORD_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Argon2id cost parameters, stored in the vault header so a vault keeps
/// opening after the defaults change.
#[derive(Encode, Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Cheapest parameters argon2 accepts. For tests only.
    pub const fn minimal() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Fill a fixed-size array from the OS-seeded thread RNG.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::rng().fill_bytes(&mut out);
    out
}

/// A fresh random password drawn from a 64-symbol alphabet.
pub fn generate_password(length: usize) -> SecretString {
    let mut rng = rand::rng();
    let mut password = String::with_capacity(length);
    for _ in 0..length {
        let index = rng.random_range(0..PASSWORD_ALPHABET.len());
        password.push(char::from(PASSWORD_ALPHABET[index]));
    }
    SecretString::from(password)
}

/// Root key of one vault, derived from the master password.
pub struct VaultKey {
    key: SecretSlice<u8>,
}

impl VaultKey {
    pub fn derive(password: &SecretString, salt: &[u8], params: KdfParams) -> VaultResult<Self> {
        let params = Params::new(
            params.memory_kib,
            params.iterations,
            params.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|_| VaultError::InvalidParam("kdf parameters"))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        argon
            .hash_password_into(password.expose_secret().as_bytes(), salt, key.as_mut())
            .map_err(|_| VaultError::Crypto)?;
        Ok(Self {
            key: SecretSlice::from(key.to_vec()),
        })
    }

    /// Derive the key for one entry.
    pub fn entry_key(&self, salt: &[u8], info: &str) -> VaultResult<EntryKey> {
        if salt.is_empty() {
            return Err(VaultError::InvalidParam("empty key derivation salt"));
        }
        let hkdf = Hkdf::<sha2::Sha256>::new(Some(salt), self.key.expose_secret());
        let mut key = [0u8; KEY_LEN];
        hkdf.expand(info.as_bytes(), &mut key)
            .map_err(|_| VaultError::Crypto)?;
        let entry_key = EntryKey {
            key: SecretSlice::from(key.to_vec()),
        };
        key.zeroize();
        Ok(entry_key)
    }
}

/// AES-256-GCM key for a single record.
pub struct EntryKey {
    key: SecretSlice<u8>,
}

impl EntryKey {
    fn cipher(&self) -> VaultResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.key.expose_secret()).map_err(|_| VaultError::Crypto)
    }

    /// Encrypt under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> VaultResult<([u8; NONCE_LEN], Vec<u8>)> {
        let nonce = random_array::<NONCE_LEN>();
        let ciphertext = self
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| VaultError::Crypto)?;
        Ok((nonce, ciphertext))
    }

    /// Decrypt and authenticate. Fails with [`VaultError::Crypto`] on a
    /// wrong key or tampered record.
    pub fn open(
        &self,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> VaultResult<Zeroizing<Vec<u8>>> {
        self.cipher()?
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| VaultError::Crypto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(password: &str, salt: &[u8]) -> VaultKey {
        VaultKey::derive(&SecretString::from(password), salt, KdfParams::minimal()).unwrap()
    }

    #[test]
    fn generated_passwords_are_unique_and_sized() {
        let a = generate_password(44);
        let b = generate_password(44);
        assert_eq!(a.expose_secret().len(), 44);
        assert_ne!(a.expose_secret(), b.expose_secret());
        assert!(
            a.expose_secret()
                .bytes()
                .all(|c| PASSWORD_ALPHABET.contains(&c))
        );
    }

    #[test]
    fn entry_keys_depend_on_salt_and_path() {
        let vault = key("pw", &[1; SALT_LEN]);
        let k1 = vault.entry_key(&[2; SALT_LEN], "a/b").unwrap();
        let (nonce, ct) = k1.seal(b"value", b"a/b").unwrap();

        let same = vault.entry_key(&[2; SALT_LEN], "a/b").unwrap();
        assert_eq!(&**same.open(&nonce, &ct, b"a/b").unwrap(), b"value");

        let other_salt = vault.entry_key(&[3; SALT_LEN], "a/b").unwrap();
        assert!(other_salt.open(&nonce, &ct, b"a/b").is_err());
        let other_path = vault.entry_key(&[2; SALT_LEN], "a/c").unwrap();
        assert!(other_path.open(&nonce, &ct, b"a/c").is_err());
    }

    #[test]
    fn wrong_password_cannot_open() {
        let salt = [9; SALT_LEN];
        let (nonce, ct) = key("right", &salt)
            .entry_key(&[1; SALT_LEN], "check")
            .unwrap()
            .seal(b"token", b"")
            .unwrap();
        let wrong = key("wrong", &salt).entry_key(&[1; SALT_LEN], "check").unwrap();
        assert!(matches!(
            wrong.open(&nonce, &ct, b""),
            Err(VaultError::Crypto)
        ));
    }

    #[test]
    fn empty_salt_is_rejected() {
        let vault = key("pw", &[1; SALT_LEN]);
        assert!(matches!(
            vault.entry_key(&[], "x"),
            Err(VaultError::InvalidParam(_))
        ));
    }

    #[test]
    fn nonces_are_fresh() {
        let k = key("pw", &[1; SALT_LEN]).entry_key(&[1; SALT_LEN], "x").unwrap();
        let (n1, c1) = k.seal(b"same", b"").unwrap();
        let (n2, c2) = k.seal(b"same", b"").unwrap();
        assert_ne!(n1, n2);
        assert_ne!(c1, c2);
    }
}
