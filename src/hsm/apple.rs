//! Secure Enclave binding through `security-framework`.

use core_foundation::base::{CFType, CFTypeRef, TCFType};
use core_foundation::error::CFError;
use core_foundation::string::CFString;
use objc2::msg_send;
use objc2::rc::Retained;
use objc2::runtime::{AnyClass, AnyObject};
use security_framework::access_control::{ProtectionMode, SecAccessControl};
use security_framework::item::{ItemClass, ItemSearchOptions, Reference, SearchResult};
use security_framework::key::{Algorithm, GenerateKeyOptions, KeyType, SecKey, Token};
use security_framework::passwords_options::AccessControlOptions;
use tracing::{debug, warn};

use super::SecureElement;
use crate::error::{HsmError, HsmResult};
use crate::memory::SecretBuffer;

const ECIES: Algorithm = Algorithm::ECIESEncryptionCofactorVariableIVX963SHA256AESGCM;

/// errSecUserCanceled
const USER_CANCELED: isize = -128;
/// errSecAuthFailed
const AUTH_FAILED: isize = -25293;
const ITEM_NOT_FOUND: i32 = -25300;
/// LAError.userCancel / systemCancel / authenticationFailed / appCancel
const LA_ERRORS: [isize; 4] = [-2, -4, -1, -9];

#[link(name = "LocalAuthentication", kind = "framework")]
unsafe extern "C" {}

/// A fresh `LAContext` whose presence prompt shows `reason`.
pub(super) fn authentication_context(reason: &str) -> Option<CFType> {
    let cls = AnyClass::get(c"LAContext")?;
    let text = CFString::new(reason);
    unsafe {
        let ctx: Option<Retained<AnyObject>> = msg_send![cls, new];
        let ctx = ctx?;
        // CFString is toll-free bridged to NSString.
        let text = text.as_concrete_TypeRef() as *const AnyObject;
        let _: () = msg_send![&*ctx, setLocalizedReason: text];
        // The +1 reference moves into the CF wrapper, which releases it.
        Some(CFType::wrap_under_create_rule(
            Retained::into_raw(ctx) as CFTypeRef
        ))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EnclaveElement;

impl EnclaveElement {
    fn find_key(tag: &str) -> Option<SecKey> {
        Self::find_key_with(tag, None)
    }

    /// Look up the key by label. With `context`, any prompt triggered by
    /// using the returned key is driven by that `LAContext`.
    fn find_key_with(tag: &str, context: Option<CFType>) -> Option<SecKey> {
        let mut options = ItemSearchOptions::new();
        options
            .class(ItemClass::key())
            .label(tag)
            .load_refs(true)
            .local_authentication_context(context);
        let results = options.search().ok()?;
        results.into_iter().find_map(|result| match result {
            SearchResult::Ref(Reference::Key(key)) => Some(key),
            _ => None,
        })
    }

    fn map_cf_error(e: &CFError, fallback: HsmError) -> HsmError {
        let code = e.code();
        if code == USER_CANCELED || code == AUTH_FAILED || LA_ERRORS.contains(&code) {
            HsmError::AuthFailed
        } else {
            warn!(code, error = %e.description(), "secure enclave operation failed");
            fallback
        }
    }
}

impl SecureElement for EnclaveElement {
    fn is_present(&self) -> bool {
        // Creating a throwaway non-permanent enclave key is the only check
        // that works on both Apple silicon and T2 machines.
        let mut options = GenerateKeyOptions::default();
        options
            .set_key_type(KeyType::ec())
            .set_size_in_bits(256)
            .set_token(Token::SecureEnclave);
        match SecKey::new(&options) {
            Ok(_) => true,
            Err(e) => {
                debug!(code = e.code(), "no secure enclave");
                false
            }
        }
    }

    fn has_key(&self, tag: &str) -> bool {
        Self::find_key(tag).is_some()
    }

    fn create_key(&self, tag: &str, require_biometry: bool) -> HsmResult<()> {
        let presence = if require_biometry {
            AccessControlOptions::BIOMETRY_ANY
        } else {
            AccessControlOptions::USER_PRESENCE
        };
        let flags = presence | AccessControlOptions::PRIVATE_KEY_USAGE;
        let access = SecAccessControl::create_with_protection(
            Some(ProtectionMode::AccessibleWhenUnlockedThisDeviceOnly),
            flags.bits(),
        )
        .map_err(|e| {
            warn!(error = %e, "failed to build access control");
            HsmError::SealFailed
        })?;

        let mut options = GenerateKeyOptions::default();
        options
            .set_key_type(KeyType::ec())
            .set_size_in_bits(256)
            .set_token(Token::SecureEnclave)
            .set_label(tag)
            .set_location(security_framework::key::Location::DataProtectionKeychain)
            .set_access_control(access);
        SecKey::new(&options)
            .map(drop)
            .map_err(|e| Self::map_cf_error(&e, HsmError::SealFailed))
    }

    fn encrypt(&self, tag: &str, plaintext: &[u8]) -> HsmResult<Vec<u8>> {
        let key = Self::find_key(tag).ok_or(HsmError::KeyNotFound)?;
        let public = key.public_key().ok_or(HsmError::SealFailed)?;
        public
            .encrypt_data(ECIES, plaintext)
            .map_err(|e| Self::map_cf_error(&e, HsmError::SealFailed))
    }

    fn decrypt(&self, tag: &str, ciphertext: &[u8], reason: &str) -> HsmResult<SecretBuffer> {
        let context = authentication_context(reason);
        if context.is_none() {
            warn!("LocalAuthentication unavailable; prompt will use the system text");
        }
        let key = Self::find_key_with(tag, context).ok_or(HsmError::KeyNotFound)?;
        debug!(reason, "requesting user presence for enclave key");
        key.decrypt_data(ECIES, ciphertext)
            .map(SecretBuffer::new)
            .map_err(|e| Self::map_cf_error(&e, HsmError::UnsealFailed))
    }

    fn delete_key(&self, tag: &str) -> HsmResult<()> {
        if Self::find_key(tag).is_none() {
            return Err(HsmError::KeyNotFound);
        }
        ItemSearchOptions::new()
            .class(ItemClass::key())
            .label(tag)
            .delete()
            .map_err(|e| {
                if e.code() == ITEM_NOT_FOUND {
                    HsmError::KeyNotFound
                } else {
                    warn!(code = e.code(), "failed to delete enclave key");
                    HsmError::IoError
                }
            })
    }
}
