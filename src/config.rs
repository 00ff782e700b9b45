//! Runtime configuration: on-disk locations, session lifetime and hardware
//! parameters.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crypt::KdfParams;

/// Directory name under the user's config directory.
pub const APP_DIR: &str = "remote-juggler";
/// Prefix for every platform credential store service name.
pub const PRODUCT: &str = "remote-juggler";
pub const DEFAULT_AUTH_REASON: &str = "authenticate to access YubiKey PIN";
pub const DEFAULT_MASTER_IDENTITY: &str = "keystore-master";
pub const DEFAULT_PASSWORD_LENGTH: usize = 44;
pub const MIN_PASSWORD_LENGTH: usize = 16;
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(15 * 60);
/// PCR 7 records the Secure Boot policy and boot configuration.
pub const DEFAULT_PCR_INDEX: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for everything this crate writes.
    pub config_dir: PathBuf,
    /// Owner-only directory holding one sealed blob per identity.
    pub sealed_dir: PathBuf,
    /// Encrypted credential database. sled keeps a directory of files here,
    /// which must be backed up or moved as a whole.
    pub database_path: PathBuf,
    pub session_ttl: Duration,
    /// Length of generated master passwords.
    pub password_length: usize,
    /// Boot measurement register the PIN is sealed against.
    pub pcr_index: u8,
    /// TSS TCTI name (`device:/dev/tpmrm0`, `swtpm:port=2321`). `None` uses
    /// the first device node present.
    pub tcti: Option<String>,
    /// Shown in the secure-element presence prompt.
    pub auth_reason: String,
    /// Require biometry rather than biometry-or-passcode for new keys.
    pub require_biometry: bool,
    /// Identity under which the credential store's master password is sealed.
    pub master_identity: String,
    /// Argon2id cost for newly bootstrapped databases.
    pub kdf: KdfParams,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_config_dir(default_config_dir())
    }
}

impl Config {
    /// Configuration rooted at `dir`, every derived path placed beneath it.
    pub fn with_config_dir(dir: impl Into<PathBuf>) -> Self {
        let config_dir = dir.into();
        Self {
            sealed_dir: config_dir.join("hsm").join("tpm"),
            database_path: config_dir.join("keys.sled"),
            config_dir,
            session_ttl: DEFAULT_SESSION_TTL,
            password_length: DEFAULT_PASSWORD_LENGTH,
            pcr_index: DEFAULT_PCR_INDEX,
            tcti: None,
            auth_reason: DEFAULT_AUTH_REASON.to_owned(),
            require_biometry: false,
            master_identity: DEFAULT_MASTER_IDENTITY.to_owned(),
            kdf: KdfParams::default(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

/// `$XDG_CONFIG_HOME/remote-juggler`, else `$HOME/.config/remote-juggler`.
///
/// `HOME` is honoured through `dirs`, so tests and sandboxed callers can
/// redirect everything by overriding the profile variables.
pub fn default_config_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        let xdg = PathBuf::from(xdg);
        if xdg.is_absolute() {
            return xdg.join(APP_DIR);
        }
    }
    match dirs::home_dir() {
        Some(home) => home.join(".config").join(APP_DIR),
        None => {
            warn!("no home directory found; using relative config path");
            PathBuf::from(".config").join(APP_DIR)
        }
    }
}
