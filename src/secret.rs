use bincode::{Decode, Encode};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::time::SystemTime;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypt::{NONCE_LEN, SALT_LEN, VaultKey, random_array};
use crate::error::{VaultError, VaultResult};

/// A credential as stored in the `entries` tree, AKA the actual K/V pair
/// itself. The sled key is the entry path; this record is the value.
#[derive(Encode, Decode, Debug, Clone)]
pub struct Secret {
    /// AES-256-GCM ciphertext of a bincode [`EntryPlaintext`].
    ciphertext: Vec<u8>,
    /// Nonce used for encryption
    iv: [u8; NONCE_LEN],
    /// Per-secret random salt, used with the vault key to derive the entry
    /// key via HKDF.
    salt: Vec<u8>,

    pub metadata: SecretMeta,
}

impl Secret {
    /// Encrypt `entry` for storage at `path`.
    pub fn seal(key: &VaultKey, path: &str, entry: &CredentialEntry) -> VaultResult<Self> {
        Self::seal_with_meta(key, path, entry, SecretMeta::new())
    }

    /// Re-encrypt under a fresh salt, keeping the original creation time.
    pub fn reseal(&self, key: &VaultKey, path: &str, entry: &CredentialEntry) -> VaultResult<Self> {
        let mut metadata = self.metadata.clone();
        metadata.update();
        Self::seal_with_meta(key, path, entry, metadata)
    }

    fn seal_with_meta(
        key: &VaultKey,
        path: &str,
        entry: &CredentialEntry,
        metadata: SecretMeta,
    ) -> VaultResult<Self> {
        let salt = random_array::<SALT_LEN>().to_vec();
        let entry_key = key.entry_key(&salt, path)?;
        let plaintext = EntryPlaintext::from(entry);
        let mut encoded = bincode::encode_to_vec(&plaintext, bincode::config::standard())?;
        let sealed = entry_key.seal(&encoded, path.as_bytes());
        encoded.zeroize();
        let (iv, ciphertext) = sealed?;
        Ok(Self {
            ciphertext,
            iv,
            salt,
            metadata,
        })
    }

    /// Decrypt the record stored at `path`.
    pub fn open(&self, key: &VaultKey, path: &str) -> VaultResult<CredentialEntry> {
        let entry_key = key.entry_key(&self.salt, path)?;
        let plaintext = entry_key.open(&self.iv, &self.ciphertext, path.as_bytes())?;
        let (decoded, _): (EntryPlaintext, usize) =
            bincode::decode_from_slice(&plaintext, bincode::config::standard())?;
        Ok(CredentialEntry::from(decoded))
    }

    pub fn to_bytes(&self) -> VaultResult<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn from_bytes(bytes: &[u8]) -> VaultResult<Self> {
        let (secret, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(secret)
    }

    /// Returns a reference to the ciphertext.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }
}

/// Timestamps kept next to the ciphertext.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretMeta {
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl SecretMeta {
    pub fn new() -> Self {
        let now = SystemTime::now();
        Self {
            created_at: now,
            updated_at: now,
        }
    }

    /// Simply update the metadata's updated_at field to the current time.
    pub fn update(&mut self) {
        self.updated_at = SystemTime::now();
    }
}

impl Default for SecretMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// A decrypted credential.
#[derive(Clone)]
pub struct CredentialEntry {
    /// Display name; searched alongside the path.
    pub title: String,
    pub value: SecretString,
    pub username: Option<String>,
    pub url: Option<String>,
    pub notes: Option<String>,
}

impl CredentialEntry {
    pub fn new(title: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            value: SecretString::from(value.into()),
            username: None,
            url: None,
            notes: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

impl fmt::Debug for CredentialEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialEntry")
            .field("title", &self.title)
            .field("value", &"[REDACTED]")
            .field("username", &self.username)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Serialized form of [`CredentialEntry`]; wiped when dropped.
#[derive(Encode, Decode, Zeroize, ZeroizeOnDrop)]
struct EntryPlaintext {
    title: String,
    value: String,
    username: Option<String>,
    url: Option<String>,
    notes: Option<String>,
}

impl From<&CredentialEntry> for EntryPlaintext {
    fn from(entry: &CredentialEntry) -> Self {
        Self {
            title: entry.title.clone(),
            value: entry.value.expose_secret().to_owned(),
            username: entry.username.clone(),
            url: entry.url.clone(),
            notes: entry.notes.clone(),
        }
    }
}

impl From<EntryPlaintext> for CredentialEntry {
    fn from(plain: EntryPlaintext) -> Self {
        Self {
            title: plain.title.clone(),
            value: SecretString::from(plain.value.clone()),
            username: plain.username.clone(),
            url: plain.url.clone(),
            notes: plain.notes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::KdfParams;

    fn vault_key() -> VaultKey {
        VaultKey::derive(&SecretString::from("pw"), &[4; SALT_LEN], KdfParams::minimal()).unwrap()
    }

    #[test]
    fn seal_and_open() {
        let key = vault_key();
        let entry = CredentialEntry::new("GitLab", "glpat-123").with_username("jess");
        let secret = Secret::seal(&key, "work/gitlab", &entry).unwrap();
        let bytes = secret.to_bytes().unwrap();
        assert!(!bytes.windows(9).any(|w| w == b"glpat-123"));

        let opened = Secret::from_bytes(&bytes)
            .unwrap()
            .open(&key, "work/gitlab")
            .unwrap();
        assert_eq!(opened.title, "GitLab");
        assert_eq!(opened.value.expose_secret(), "glpat-123");
        assert_eq!(opened.username.as_deref(), Some("jess"));
    }

    #[test]
    fn record_is_bound_to_its_path() {
        let key = vault_key();
        let secret = Secret::seal(&key, "a", &CredentialEntry::new("a", "1")).unwrap();
        assert!(matches!(secret.open(&key, "b"), Err(VaultError::Crypto)));
    }

    #[test]
    fn reseal_keeps_creation_time() {
        let key = vault_key();
        let first = Secret::seal(&key, "a", &CredentialEntry::new("a", "1")).unwrap();
        let second = first
            .reseal(&key, "a", &CredentialEntry::new("a", "2"))
            .unwrap();
        assert_eq!(first.metadata.created_at, second.metadata.created_at);
        assert!(second.metadata.updated_at >= first.metadata.updated_at);
        assert_ne!(first.ciphertext(), second.ciphertext());
    }

    #[test]
    fn debug_redacts_value() {
        let entry = CredentialEntry::new("t", "hunter2");
        assert!(!format!("{entry:?}").contains("hunter2"));
    }
}
