//! The encrypted credential store: bootstrap, unlock and CRUD, plus fuzzy
//! lookup over entry titles and paths.
//!
//! Every operation that reads or writes entries takes the master password.
//! A successful unlock caches the password in the [`SessionCache`] so that
//! [`Vault::auto_unlock`] can hand it back without touching the HSM again.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, MIN_PASSWORD_LENGTH};
use crate::crypt::{VaultKey, generate_password};
use crate::error::{HsmError, VaultError, VaultResult};
use crate::hsm::{BackendKind, Hsm};
use crate::kv::{KvStore, VaultHeader, validate_path};
use crate::search::{SearchResult, rank};
use crate::secret::{CredentialEntry, Secret};
use crate::session::SessionCache;

/// Longest generated master password.
pub const MAX_PASSWORD_LENGTH: usize = 128;

/// Outcome of [`Vault::bootstrap`].
pub struct BootstrapReport {
    /// Whether the master password was sealed in the HSM.
    pub sealed: bool,
    pub backend: BackendKind,
    /// User-facing summary. Contains the plaintext password when, and only
    /// when, `sealed` is false.
    pub message: String,
}

impl fmt::Debug for BootstrapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("BootstrapReport");
        s.field("sealed", &self.sealed).field("backend", &self.backend);
        if self.sealed {
            s.field("message", &self.message);
        }
        s.finish_non_exhaustive()
    }
}

/// A search hit together with its decrypted entry.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub hit: SearchResult,
    pub entry: CredentialEntry,
}

pub struct Vault {
    config: Config,
    hsm: Hsm,
    store: KvStore,
    session: SessionCache,
}

impl Vault {
    /// Open the database at `config.database_path`, creating an empty one if
    /// nothing is there yet. Nothing is usable until [`Vault::bootstrap`].
    pub fn open(config: Config, hsm: Hsm) -> VaultResult<Self> {
        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = KvStore::open(&config.database_path)?;
        let session = SessionCache::new(config.session_ttl);
        Ok(Self {
            config,
            hsm,
            store,
            session,
        })
    }

    /// Default configuration with the platform's HSM backends.
    pub fn open_default() -> VaultResult<Self> {
        let config = Config::default();
        let hsm = Hsm::platform_default(&config);
        Self::open(config, hsm)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hsm(&self) -> &Hsm {
        &self.hsm
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.store.header(), Ok(Some(_)))
    }

    fn header(&self) -> VaultResult<VaultHeader> {
        self.store.header()?.ok_or_else(|| {
            VaultError::NotInitialized(self.config.database_path.display().to_string())
        })
    }

    /// Check `password` and remember it for the session.
    pub(crate) fn unlock_key(&self, password: &SecretString) -> VaultResult<VaultKey> {
        let key = self.header()?.unlock(password)?;
        debug!("master password verified");
        self.session.cache(password);
        Ok(key)
    }

    /// Create the database with a fresh random master password.
    ///
    /// With `seal_in_hsm` the password is sealed under the configured master
    /// identity and never shown. Otherwise, or if sealing fails, it is
    /// returned once in the report message for the caller to record.
    #[instrument(level = "debug", skip(self))]
    pub fn bootstrap(&self, seal_in_hsm: bool) -> VaultResult<BootstrapReport> {
        let length = self.config.password_length;
        if !(MIN_PASSWORD_LENGTH..=MAX_PASSWORD_LENGTH).contains(&length) {
            return Err(VaultError::InvalidParam("password length"));
        }
        let location = self.config.database_path.display().to_string();
        if self.is_initialized() {
            return Err(VaultError::AlreadyExists(location));
        }

        let password = generate_password(length);
        let (header, _) = VaultHeader::create(&password, self.config.kdf)?;
        if !self.store.init_header(&header)? {
            return Err(VaultError::AlreadyExists(location));
        }
        self.session.cache(&password);
        info!(path = %location, "credential database created");

        let backend = self.hsm.detected_backend();
        if seal_in_hsm {
            match self
                .hsm
                .store_secret(&self.config.master_identity, &password)
            {
                Ok(()) => {
                    return Ok(BootstrapReport {
                        sealed: true,
                        backend,
                        message: format!(
                            "Credential database created at {location}. \
                             Master password sealed with {backend}."
                        ),
                    });
                }
                Err(e) => warn!(error = %e, "could not seal master password"),
            }
        }

        Ok(BootstrapReport {
            sealed: false,
            backend,
            message: format!(
                "Credential database created at {location}. \
                 Master password (record it now, it will not be shown again): {}",
                password.expose_secret()
            ),
        })
    }

    /// Session cache first, then the HSM-sealed master password. Returns
    /// `None` instead of prompting when neither works.
    #[instrument(level = "debug", skip(self))]
    pub fn auto_unlock(&self) -> Option<SecretString> {
        if let Some(password) = self.session.get() {
            debug!("unlocked from session cache");
            return Some(password);
        }
        let identity = &self.config.master_identity;
        if !self.hsm.has_pin(identity) {
            return None;
        }
        let password = match self
            .hsm
            .retrieve_pin(identity)
            .and_then(|pin| pin.to_secret_string())
        {
            Ok(password) => password,
            Err(HsmError::BootChainChanged) => {
                warn!("boot chain changed; master password needs to be resealed");
                return None;
            }
            Err(e) => {
                debug!(error = %e, "hsm unlock failed");
                return None;
            }
        };
        match self.unlock_key(&password) {
            Ok(_) => {
                info!(backend = %self.hsm.detected_backend(), "unlocked via hsm");
                Some(password)
            }
            Err(e) => {
                warn!(error = %e, "sealed master password does not open the database");
                None
            }
        }
    }

    /// Verify `password` and start a session.
    pub fn unlock(&self, password: &SecretString) -> VaultResult<()> {
        self.unlock_key(password).map(drop)
    }

    /// Forget the cached session password.
    pub fn logout(&self) {
        self.session.clear();
        debug!("session cleared");
    }

    pub fn session(&self) -> &SessionCache {
        &self.session
    }

    #[instrument(level = "debug", skip(self, password))]
    pub fn get(&self, path: &str, password: &SecretString) -> VaultResult<CredentialEntry> {
        validate_path(path)?;
        let key = self.unlock_key(password)?;
        let secret = self
            .store
            .get_secret(path)?
            .ok_or_else(|| VaultError::NotFound(path.to_owned()))?;
        secret.open(&key, path)
    }

    /// Insert or overwrite the entry at `path`.
    #[instrument(level = "debug", skip(self, entry, password))]
    pub fn store(
        &self,
        path: &str,
        entry: &CredentialEntry,
        password: &SecretString,
    ) -> VaultResult<()> {
        validate_path(path)?;
        let key = self.unlock_key(password)?;
        self.store_with_key(&key, path, entry)
    }

    /// `store` with an already derived key, for bulk writes.
    pub(crate) fn store_with_key(
        &self,
        key: &VaultKey,
        path: &str,
        entry: &CredentialEntry,
    ) -> VaultResult<()> {
        validate_path(path)?;
        let secret = match self.store.get_secret(path)? {
            Some(existing) => existing.reseal(key, path, entry)?,
            None => Secret::seal(key, path, entry)?,
        };
        self.store.put_secret(path, &secret)
    }

    /// Store a bare value, titled after the last path segment.
    pub fn store_value(
        &self,
        path: &str,
        value: &str,
        password: &SecretString,
    ) -> VaultResult<()> {
        let title = path.rsplit('/').next().unwrap_or(path);
        self.store(path, &CredentialEntry::new(title, value), password)
    }

    #[instrument(level = "debug", skip(self, password))]
    pub fn delete(&self, path: &str, password: &SecretString) -> VaultResult<()> {
        validate_path(path)?;
        self.unlock_key(password)?;
        if self.store.remove(path)? {
            Ok(())
        } else {
            Err(VaultError::NotFound(path.to_owned()))
        }
    }

    /// Entry paths under `prefix` (all paths for an empty prefix).
    pub fn list(&self, prefix: &str, password: &SecretString) -> VaultResult<Vec<String>> {
        self.unlock_key(password)?;
        self.store.paths(prefix)
    }

    /// Rank every entry's title and path against `query`.
    #[instrument(level = "debug", skip(self, password))]
    pub fn search(&self, query: &str, password: &SecretString) -> VaultResult<Vec<SearchResult>> {
        let key = self.unlock_key(password)?;
        let mut titled = Vec::new();
        for (path, secret) in self.store.secrets()? {
            let entry = secret.open(&key, &path)?;
            titled.push((path, entry.title));
        }
        let results = rank(
            query,
            titled.iter().map(|(path, title)| (path.as_str(), title.as_str())),
        );
        debug!(hits = results.len(), "search finished");
        Ok(results)
    }

    /// `search` then `get` on the best hit.
    pub fn resolve(&self, query: &str, password: &SecretString) -> VaultResult<Option<Resolved>> {
        let Some(hit) = self.search(query, password)?.into_iter().next() else {
            return Ok(None);
        };
        let entry = self.get(&hit.path, password)?;
        Ok(Some(Resolved { hit, entry }))
    }
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("path", &self.store.path())
            .field("hsm", &self.hsm)
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::KdfParams;
    use crate::hsm::{BackendSelector, PlatformStoreBackend, SealingBackend};
    use crate::keychain::MemoryKeychain;
    use crate::testing::ScriptedBackend;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::with_config_dir(dir.path());
        config.kdf = KdfParams::minimal();
        config
    }

    fn hsm_with(backends: Vec<Box<dyn SealingBackend>>) -> Hsm {
        Hsm::new(Arc::new(BackendSelector::new(backends)))
    }

    fn vault_with(dir: &TempDir, backends: Vec<Box<dyn SealingBackend>>) -> Vault {
        Vault::open(config(dir), hsm_with(backends)).unwrap()
    }

    /// Bootstrap without sealing and pull the password out of the message.
    fn bootstrap_plain(vault: &Vault) -> SecretString {
        let report = vault.bootstrap(false).unwrap();
        assert!(!report.sealed);
        let password = report.message.rsplit(": ").next().unwrap().to_owned();
        SecretString::from(password)
    }

    #[test]
    fn crud_round_trip() {
        let dir = TempDir::new().unwrap();
        let vault = vault_with(&dir, Vec::new());
        let pw = bootstrap_plain(&vault);

        vault
            .store_value("RemoteJuggler/API/TEST", "value123", &pw)
            .unwrap();
        let entry = vault.get("RemoteJuggler/API/TEST", &pw).unwrap();
        assert_eq!(entry.value.expose_secret(), "value123");
        assert_eq!(entry.title, "TEST");

        vault.delete("RemoteJuggler/API/TEST", &pw).unwrap();
        assert!(matches!(
            vault.get("RemoteJuggler/API/TEST", &pw),
            Err(VaultError::NotFound(_))
        ));
        assert!(matches!(
            vault.delete("RemoteJuggler/API/TEST", &pw),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn store_overwrites() {
        let dir = TempDir::new().unwrap();
        let vault = vault_with(&dir, Vec::new());
        let pw = bootstrap_plain(&vault);
        vault.store_value("a/b", "one", &pw).unwrap();
        vault.store_value("a/b", "two", &pw).unwrap();
        assert_eq!(vault.get("a/b", &pw).unwrap().value.expose_secret(), "two");
        assert_eq!(vault.list("", &pw).unwrap(), ["a/b"]);
    }

    #[test]
    fn wrong_password_and_uninitialized() {
        let dir = TempDir::new().unwrap();
        let vault = vault_with(&dir, Vec::new());
        let pw = SecretString::from("anything");
        assert!(!vault.is_initialized());
        assert!(matches!(
            vault.get("a", &pw),
            Err(VaultError::NotInitialized(_))
        ));
        bootstrap_plain(&vault);
        assert!(vault.is_initialized());
        assert!(matches!(
            vault.get("a", &pw),
            Err(VaultError::WrongPassword)
        ));
        assert!(matches!(
            vault.bootstrap(false),
            Err(VaultError::AlreadyExists(_))
        ));
    }

    #[test]
    fn bootstrap_passwords_are_unique() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let pa = bootstrap_plain(&vault_with(&a, Vec::new()));
        let pb = bootstrap_plain(&vault_with(&b, Vec::new()));
        assert_eq!(pa.expose_secret().len(), 44);
        assert_ne!(pa.expose_secret(), pb.expose_secret());
    }

    #[test]
    fn bootstrap_rejects_short_passwords() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.password_length = 8;
        let vault = Vault::open(config, hsm_with(Vec::new())).unwrap();
        assert!(matches!(
            vault.bootstrap(false),
            Err(VaultError::InvalidParam(_))
        ));
    }

    #[test]
    #[traced_test]
    fn sealed_bootstrap_hides_password_and_auto_unlocks() {
        let dir = TempDir::new().unwrap();
        let keychain = Arc::new(MemoryKeychain::new());
        let vault = vault_with(
            &dir,
            vec![Box::new(PlatformStoreBackend::new(keychain.clone()))],
        );
        let report = vault.bootstrap(true).unwrap();
        assert!(report.sealed);
        assert_eq!(report.backend, BackendKind::PlatformStore);
        assert!(!report.message.contains(": "));
        assert_eq!(keychain.len(), 1);

        vault.logout();
        let pw = vault.auto_unlock().expect("hsm unlock");
        vault.store_value("ai/perplexity", "pplx-1", &pw).unwrap();
        assert!(logs_contain("unlocked via hsm"));

        assert!(vault.auto_unlock().is_some());
        assert!(logs_contain("unlocked from session cache"));
    }

    #[test]
    fn sealing_failure_falls_back_to_plaintext_report() {
        let dir = TempDir::new().unwrap();
        let vault = vault_with(&dir, Vec::new());
        let report = vault.bootstrap(true).unwrap();
        assert!(!report.sealed);
        assert_eq!(report.backend, BackendKind::None);
        assert!(report.message.contains("will not be shown again"));
        assert!(!format!("{report:?}").contains(&report.message));
    }

    #[test]
    fn auto_unlock_without_session_or_hsm_is_none() {
        let dir = TempDir::new().unwrap();
        let vault = vault_with(
            &dir,
            vec![Box::new(ScriptedBackend::new(BackendKind::TrustedBoot, true))],
        );
        bootstrap_plain(&vault);
        vault.logout();
        assert!(vault.auto_unlock().is_none());
    }

    #[test]
    fn expired_session_is_not_used() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.session_ttl = Duration::ZERO;
        let vault = Vault::open(config, hsm_with(Vec::new())).unwrap();
        bootstrap_plain(&vault);
        assert!(vault.auto_unlock().is_none());
    }

    #[test]
    fn search_and_resolve() {
        let dir = TempDir::new().unwrap();
        let vault = vault_with(&dir, Vec::new());
        let pw = bootstrap_plain(&vault);
        vault
            .store("ai/perplexity", &CredentialEntry::new("perplexity", "p1"), &pw)
            .unwrap();
        vault
            .store(
                "ai/PERPLEXITY_API_KEY",
                &CredentialEntry::new("PERPLEXITY_API_KEY", "p2"),
                &pw,
            )
            .unwrap();
        vault
            .store("work/gitlab_token", &CredentialEntry::new("gitlab_token", "g"), &pw)
            .unwrap();
        vault
            .store("misc/sitting", &CredentialEntry::new("sitting", "s"), &pw)
            .unwrap();

        let hits = vault.search("PERPLEXITY", &pw).unwrap();
        assert_eq!(hits[0].path, "ai/perplexity");
        assert_eq!(hits[0].score, 100);

        let hits = vault.search("perplx", &pw).unwrap();
        let api = hits
            .iter()
            .find(|h| h.path == "ai/PERPLEXITY_API_KEY")
            .unwrap();
        assert_eq!(api.score, 70);

        let hits = vault.search("gt", &pw).unwrap();
        assert_eq!(hits[0].path, "work/gitlab_token");

        let hits = vault.search("kitten", &pw).unwrap();
        let sitting = hits.iter().find(|h| h.path == "misc/sitting").unwrap();
        assert_eq!(sitting.distance, 3);

        assert!(
            vault
                .search("zzzzz", &pw)
                .unwrap()
                .iter()
                .all(|h| !h.path.contains("PERPLEXITY"))
        );

        let resolved = vault.resolve("gitlab", &pw).unwrap().unwrap();
        assert_eq!(resolved.hit.path, "work/gitlab_token");
        assert_eq!(resolved.entry.value.expose_secret(), "g");
        assert!(vault.resolve("qqqqqqqq", &pw).unwrap().is_none());
    }

    #[test]
    fn unbounded_session_ttl_unlocks() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.session_ttl = Duration::MAX;
        let vault = Vault::open(config, hsm_with(Vec::new())).unwrap();
        let pw = bootstrap_plain(&vault);
        vault.unlock(&pw).unwrap();
        assert!(vault.auto_unlock().is_some());
    }

    #[test]
    fn invalid_paths_are_rejected() {
        let dir = TempDir::new().unwrap();
        let vault = vault_with(&dir, Vec::new());
        let pw = bootstrap_plain(&vault);
        assert!(matches!(
            vault.store_value("a//b", "x", &pw),
            Err(VaultError::InvalidPath(_))
        ));
    }
}
