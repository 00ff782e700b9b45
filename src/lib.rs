//! Hardware-sealed PIN storage and an encrypted credential store.
//!
//! [`hsm::Hsm`] seals one PIN per identity with the strongest primitive the
//! machine has (TPM 2.0, Secure Enclave, or the OS credential store).
//! [`vault::Vault`] keeps credentials in a sled database encrypted under a
//! generated master password, which it can seal through the same HSM for
//! prompt-free unlocks.

pub mod config;
pub mod crypt;
pub mod error;
pub mod hsm;
pub mod identity;
pub mod ingest;
pub mod keychain;
pub mod kv;
pub mod memory;
pub mod search;
pub mod secret;
pub mod session;
#[cfg(feature = "tpm")]
pub mod tpm;
pub mod vault;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{HsmError, HsmResult, VaultError, VaultResult};
pub use hsm::{BackendKind, BackendSelector, Hsm, HsmStatusReport, SealingBackend};
pub use identity::Identity;
pub use memory::SecretBuffer;
pub use search::SearchResult;
pub use secret::CredentialEntry;
pub use vault::{BootstrapReport, Vault};
