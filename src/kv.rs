//! Module for handling key-value store operations.
//!
//! This module manages the actual on-disk kv store using sled. Two trees are
//! used:
//!
//! - `meta`: the bincode [`VaultHeader`] under key `vault`
//! - `entries`: entry path → bincode [`Secret`]
//!
//! Entry paths are slash-delimited, e.g. `RemoteJuggler/API/TEST`.

use std::path::{Path, PathBuf};

use bincode::{Decode, Encode};
use secrecy::SecretString;
use sled::{Db, Tree};
use tracing::{debug, error};

use crate::crypt::{KdfParams, NONCE_LEN, SALT_LEN, VaultKey, random_array};
use crate::error::{VaultError, VaultResult};
use crate::secret::Secret;

const META_TREE: &str = "meta";
const ENTRIES_TREE: &str = "entries";
const HEADER_KEY: &str = "vault";

const HEADER_VERSION: u8 = 1;
const CHECK_TOKEN: &[u8] = b"juggler-vault:check";
const CHECK_INFO: &str = "\0check";

pub const MAX_PATH_LEN: usize = 512;

/// Reject paths that are empty, have empty or dot segments, or carry
/// control characters.
pub fn validate_path(path: &str) -> VaultResult<()> {
    let invalid = || VaultError::InvalidPath(path.to_owned());
    if path.is_empty() || path.len() > MAX_PATH_LEN {
        return Err(invalid());
    }
    if path.chars().any(char::is_control) {
        return Err(invalid());
    }
    for segment in path.split('/') {
        if segment.trim().is_empty() || segment == "." || segment == ".." {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Key-derivation parameters plus a known token sealed with the derived key,
/// so a wrong password is detected before any entry is touched.
#[derive(Encode, Decode, Debug, Clone)]
pub struct VaultHeader {
    version: u8,
    kdf_salt: [u8; SALT_LEN],
    kdf: KdfParams,
    check_salt: [u8; SALT_LEN],
    check_iv: [u8; NONCE_LEN],
    check: Vec<u8>,
}

impl VaultHeader {
    /// New header for `password`, returning the derived key alongside it.
    pub fn create(password: &SecretString, kdf: KdfParams) -> VaultResult<(Self, VaultKey)> {
        let kdf_salt = random_array::<SALT_LEN>();
        let key = VaultKey::derive(password, &kdf_salt, kdf)?;
        let check_salt = random_array::<SALT_LEN>();
        let (check_iv, check) = key
            .entry_key(&check_salt, CHECK_INFO)?
            .seal(CHECK_TOKEN, &[HEADER_VERSION])?;
        Ok((
            Self {
                version: HEADER_VERSION,
                kdf_salt,
                kdf,
                check_salt,
                check_iv,
                check,
            },
            key,
        ))
    }

    /// Derive the vault key, or [`VaultError::WrongPassword`].
    pub fn unlock(&self, password: &SecretString) -> VaultResult<VaultKey> {
        let key = VaultKey::derive(password, &self.kdf_salt, self.kdf)?;
        let token = key
            .entry_key(&self.check_salt, CHECK_INFO)?
            .open(&self.check_iv, &self.check, &[self.version])
            .map_err(|_| VaultError::WrongPassword)?;
        if token.as_slice() != CHECK_TOKEN {
            return Err(VaultError::WrongPassword);
        }
        Ok(key)
    }

    pub fn kdf(&self) -> KdfParams {
        self.kdf
    }
}

/// A struct representing the main key-value store.
/// A wrapper around sled's `Db` type.
#[derive(Clone)]
pub struct KvStore {
    path: PathBuf,
    db: Db,
    meta: Tree,
    entries: Tree,
}

impl KvStore {
    /// Opens (creating if needed) the store at `path`. sled lays the
    /// database out as a directory there.
    pub fn open(path: &Path) -> VaultResult<Self> {
        let db = sled::open(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "failed to open sled database");
            e
        })?;
        let meta = db.open_tree(META_TREE)?;
        let entries = db.open_tree(ENTRIES_TREE)?;
        Ok(Self {
            path: path.to_path_buf(),
            db,
            meta,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> VaultResult<Option<VaultHeader>> {
        match self.meta.get(HEADER_KEY)? {
            Some(bytes) => {
                let (header, _): (VaultHeader, usize) =
                    bincode::decode_from_slice(&bytes, bincode::config::standard())?;
                Ok(Some(header))
            }
            None => Ok(None),
        }
    }

    /// Write the header if none exists yet. Returns `false` if one did.
    pub fn init_header(&self, header: &VaultHeader) -> VaultResult<bool> {
        let encoded = bincode::encode_to_vec(header, bincode::config::standard())?;
        let swapped = self
            .meta
            .compare_and_swap(HEADER_KEY, None as Option<&[u8]>, Some(encoded))?;
        self.db.flush()?;
        Ok(swapped.is_ok())
    }

    pub fn get_secret(&self, path: &str) -> VaultResult<Option<Secret>> {
        self.entries
            .get(path)?
            .map(|bytes| Secret::from_bytes(&bytes))
            .transpose()
    }

    pub fn put_secret(&self, path: &str, secret: &Secret) -> VaultResult<()> {
        self.entries.insert(path, secret.to_bytes()?)?;
        self.entries.flush()?;
        debug!(path, "entry written");
        Ok(())
    }

    /// Returns whether an entry was removed.
    pub fn remove(&self, path: &str) -> VaultResult<bool> {
        let removed = self.entries.remove(path)?.is_some();
        self.entries.flush()?;
        Ok(removed)
    }

    /// Entry paths starting with `prefix`, in byte order.
    pub fn paths(&self, prefix: &str) -> VaultResult<Vec<String>> {
        self.entries
            .scan_prefix(prefix)
            .keys()
            .map(|key| Ok(String::from_utf8_lossy(&key?).into_owned()))
            .collect()
    }

    /// Every `(path, record)` pair.
    pub fn secrets(&self) -> VaultResult<Vec<(String, Secret)>> {
        self.entries
            .iter()
            .map(|item| {
                let (key, value) = item?;
                Ok((
                    String::from_utf8_lossy(&key).into_owned(),
                    Secret::from_bytes(&value)?,
                ))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::CredentialEntry;
    use tempfile::TempDir;

    fn pw(s: &str) -> SecretString {
        SecretString::from(s)
    }

    #[test]
    fn path_rules() {
        for ok in ["a", "RemoteJuggler/API/TEST", "work/gitlab.token", "x y/z"] {
            assert!(validate_path(ok).is_ok(), "{ok}");
        }
        for bad in ["", "/a", "a/", "a//b", "a/../b", ".", "a\nb", " / "] {
            assert!(
                matches!(validate_path(bad), Err(VaultError::InvalidPath(_))),
                "{bad:?}"
            );
        }
        assert!(validate_path(&"a".repeat(MAX_PATH_LEN + 1)).is_err());
    }

    #[test]
    fn header_detects_wrong_password() {
        let (header, _) = VaultHeader::create(&pw("right"), KdfParams::minimal()).unwrap();
        assert!(header.unlock(&pw("right")).is_ok());
        assert!(matches!(
            header.unlock(&pw("wrong")),
            Err(VaultError::WrongPassword)
        ));
    }

    #[test]
    fn header_is_written_once() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(&dir.path().join("keys.sled")).unwrap();
        assert!(store.header().unwrap().is_none());
        let (first, _) = VaultHeader::create(&pw("a"), KdfParams::minimal()).unwrap();
        let (second, _) = VaultHeader::create(&pw("b"), KdfParams::minimal()).unwrap();
        assert!(store.init_header(&first).unwrap());
        assert!(!store.init_header(&second).unwrap());
        let stored = store.header().unwrap().unwrap();
        assert!(stored.unlock(&pw("a")).is_ok());
    }

    #[test]
    fn database_path_is_a_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.sled");
        let store = KvStore::open(&path).unwrap();
        assert_eq!(store.path(), path);
        assert!(path.is_dir());
    }

    #[test]
    fn entries_round_trip_and_scan() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(&dir.path().join("keys.sled")).unwrap();
        let (_, key) = VaultHeader::create(&pw("a"), KdfParams::minimal()).unwrap();
        for path in ["ai/openai", "ai/perplexity", "work/gitlab"] {
            let secret = Secret::seal(&key, path, &CredentialEntry::new(path, "v")).unwrap();
            store.put_secret(path, &secret).unwrap();
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.paths("ai/").unwrap(), ["ai/openai", "ai/perplexity"]);
        assert!(store.get_secret("work/gitlab").unwrap().is_some());
        assert!(store.remove("work/gitlab").unwrap());
        assert!(!store.remove("work/gitlab").unwrap());
        assert!(store.get_secret("work/gitlab").unwrap().is_none());
        assert_eq!(store.secrets().unwrap().len(), 2);
    }
}
