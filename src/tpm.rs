//! TPM 2.0 sealing through `tss-esapi`.
//!
//! A PIN is stored as the sensitive part of a KeyedHash data object created
//! under an RSA-2048 storage primary in the owner hierarchy. The object's
//! auth policy is `PolicyPCR` over one SHA-256 register, so the TPM refuses
//! to unseal it once the boot chain measured into that register changes.
//!
//! A fresh [`Context`] is opened per operation; ESAPI contexts are not
//! thread-safe and hardware sessions are not reentrant.

use std::path::Path;
use std::str::FromStr;

use tracing::{debug, error, info, instrument, trace, warn};
use tss_esapi::attributes::{ObjectAttributesBuilder, SessionAttributesBuilder};
use tss_esapi::constants::SessionType;
use tss_esapi::handles::{KeyHandle, ObjectHandle, SessionHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::resource_handles::Hierarchy;
use tss_esapi::interface_types::session_handles::{AuthSession, PolicySession};
use tss_esapi::structures::{
    Digest, KeyedHashScheme, PcrSelectionList, PcrSelectionListBuilder, PcrSlot, Private, Public,
    PublicBuilder, PublicKeyRsa, PublicKeyedHashParameters, PublicRsaParametersBuilder,
    RsaExponent, SensitiveData, SymmetricDefinition, SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::DeviceConfig;
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::{Context, TctiNameConf};

use crate::error::{HsmError, HsmResult};
use crate::hsm::{MAX_SECRET_LEN, PcrSealer, SealedPin};
use crate::memory::SecretBuffer;

/// Resource-manager node first, then the raw device.
const DEVICE_NODES: [&str; 2] = ["/dev/tpmrm0", "/dev/tpm0"];

/// Highest register index in a standard PC client bank.
const MAX_PCR_INDEX: u8 = 23;

/// Pick a TCTI: explicit configuration, then the first device node present.
/// The environment is not consulted.
pub fn resolve_tcti(configured: Option<&str>) -> Option<TctiNameConf> {
    if let Some(name) = configured {
        return match TctiNameConf::from_str(name) {
            Ok(conf) => Some(conf),
            Err(e) => {
                warn!(tcti = name, error = %e, "invalid tcti configuration");
                None
            }
        };
    }
    DEVICE_NODES
        .iter()
        .find(|node| Path::new(node).exists())
        .and_then(|node| DeviceConfig::from_str(node).ok())
        .map(TctiNameConf::Device)
}

fn pcr_selection(index: u8) -> Result<PcrSelectionList, tss_esapi::Error> {
    if index > MAX_PCR_INDEX {
        return Err(tss_esapi::Error::WrapperError(
            tss_esapi::WrapperErrorKind::InvalidParam,
        ));
    }
    let slot = PcrSlot::try_from(1u32 << u32::from(index))?;
    PcrSelectionListBuilder::new()
        .with_selection(HashingAlgorithm::Sha256, &[slot])
        .build()
}

/// An open context with a storage primary loaded. The primary is flushed on
/// drop.
struct SealingContext {
    ctx: Context,
    primary: KeyHandle,
}

impl SealingContext {
    fn open(tcti: TctiNameConf) -> Result<Self, tss_esapi::Error> {
        let mut ctx = Context::new(tcti)?;
        let primary = create_rsa_primary(&mut ctx)?;
        Ok(Self { ctx, primary })
    }

    fn start_session(&mut self, kind: SessionType) -> Result<AuthSession, tss_esapi::Error> {
        let session = self
            .ctx
            .start_auth_session(
                None,
                None,
                None,
                kind,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )?
            .ok_or(tss_esapi::Error::WrapperError(
                tss_esapi::WrapperErrorKind::WrongValueFromTpm,
            ))?;
        let (attributes, mask) = SessionAttributesBuilder::new()
            .with_decrypt(true)
            .with_encrypt(true)
            .build();
        self.ctx.tr_sess_set_attributes(session, attributes, mask)?;
        Ok(session)
    }

    fn flush_session(&mut self, session: AuthSession) {
        if let Err(e) = self
            .ctx
            .flush_context(ObjectHandle::from(SessionHandle::from(session)))
        {
            debug!(error = %e, "failed to flush policy session");
        }
    }

    /// Run `PolicyPCR` on `session` against the registers' current values.
    fn bind_policy(
        &mut self,
        session: AuthSession,
        selection: PcrSelectionList,
    ) -> Result<PolicySession, tss_esapi::Error> {
        let policy = PolicySession::try_from(session)?;
        // An empty digest makes the TPM use the live register values.
        self.ctx
            .policy_pcr(policy, Digest::default(), selection)?;
        Ok(policy)
    }

    /// Policy digest a sealed object must carry to be bound to `selection`.
    fn pcr_policy_digest(&mut self, selection: PcrSelectionList) -> Result<Digest, tss_esapi::Error> {
        let trial = self.start_session(SessionType::Trial)?;
        let result = self
            .bind_policy(trial, selection)
            .and_then(|policy| self.ctx.policy_get_digest(policy));
        self.flush_session(trial);
        result
    }

    #[instrument(level = "debug", skip(self, secret))]
    fn seal(&mut self, index: u8, secret: &[u8]) -> Result<(Public, Private), tss_esapi::Error> {
        let policy_digest = self.pcr_policy_digest(pcr_selection(index)?)?;
        trace!(digest = %hex::encode(policy_digest.value()), "pcr policy digest");

        // No userWithAuth: the policy is the only way to authorise unseal.
        let attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_no_da(true)
            .build()?;
        let template = PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::KeyedHash)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(attributes)
            .with_auth_policy(policy_digest)
            .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
            .with_keyed_hash_unique_identifier(Digest::default())
            .build()?;

        let sensitive = SensitiveData::try_from(secret.to_vec())?;
        let primary = self.primary;
        let created = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.create(primary, template, None, Some(sensitive), None, None)
        })?;
        Ok((created.out_public, created.out_private))
    }

    #[instrument(level = "debug", skip_all)]
    fn unseal(
        &mut self,
        index: u8,
        public: Public,
        private: Private,
    ) -> Result<SecretBuffer, tss_esapi::Error> {
        let primary = self.primary;
        let object = self
            .ctx
            .execute_with_nullauth_session(|ctx| ctx.load(primary, private, public))?;

        let result = self.unseal_loaded(index, object);

        if let Err(e) = self.ctx.flush_context(object.into()) {
            debug!(error = %e, "failed to flush sealed object");
        }
        result
    }

    fn unseal_loaded(
        &mut self,
        index: u8,
        object: KeyHandle,
    ) -> Result<SecretBuffer, tss_esapi::Error> {
        let session = self.start_session(SessionType::Policy)?;
        let result = pcr_selection(index)
            .and_then(|selection| self.bind_policy(session, selection))
            .and_then(|_| {
                self.ctx
                    .execute_with_session(Some(session), |ctx| ctx.unseal(object.into()))
            });
        self.flush_session(session);
        let data = result?;
        Ok(SecretBuffer::new(data.value().to_vec()))
    }

    fn read_pcr(&mut self, index: u8) -> Result<Vec<u8>, tss_esapi::Error> {
        let (_, _, digests) = self.ctx.pcr_read(pcr_selection(index)?)?;
        digests
            .value()
            .first()
            .map(|digest| digest.value().to_vec())
            .ok_or(tss_esapi::Error::WrapperError(
                tss_esapi::WrapperErrorKind::WrongValueFromTpm,
            ))
    }
}

impl Drop for SealingContext {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.flush_context(self.primary.into()) {
            error!(error = %e, "failed to flush primary handle on drop");
        }
        self.ctx.clear_sessions();
    }
}

/// RSA-2048 restricted decryption key in the owner hierarchy, recreated
/// deterministically from the hierarchy seed.
fn create_rsa_primary(ctx: &mut Context) -> Result<KeyHandle, tss_esapi::Error> {
    let object_attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_restricted(true)
        .with_decrypt(true)
        .build()?;

    let rsa_params = PublicRsaParametersBuilder::new_restricted_decryption_key(
        SymmetricDefinitionObject::AES_128_CFB,
        RsaKeyBits::Rsa2048,
        RsaExponent::default(),
    )
    .build()?;

    let template = PublicBuilder::new()
        .with_object_attributes(object_attributes)
        .with_rsa_parameters(rsa_params)
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_rsa_unique_identifier(PublicKeyRsa::default())
        .build()?;

    let created = ctx.execute_with_nullauth_session(|ctx| {
        ctx.create_primary(Hierarchy::Owner, template, None, None, None, None)
    })?;
    Ok(created.key_handle)
}

/// [`PcrSealer`] backed by a real (or software) TPM.
#[derive(Debug, Clone)]
pub struct TssSealer {
    tcti: Option<String>,
    pcr_index: u8,
}

impl TssSealer {
    pub fn new(tcti: Option<String>, pcr_index: u8) -> Self {
        Self { tcti, pcr_index }
    }

    fn tcti(&self) -> HsmResult<TctiNameConf> {
        resolve_tcti(self.tcti.as_deref()).ok_or(HsmError::DeviceUnavailable)
    }

    fn open(&self) -> HsmResult<SealingContext> {
        if self.pcr_index > MAX_PCR_INDEX {
            return Err(HsmError::InvalidParam);
        }
        SealingContext::open(self.tcti()?).map_err(|e| {
            warn!(error = %e, "failed to open tpm context");
            HsmError::DeviceUnavailable
        })
    }
}

impl PcrSealer for TssSealer {
    fn is_available(&self) -> bool {
        let Ok(tcti) = self.tcti() else {
            debug!("no tpm device or tcti configured");
            return false;
        };
        let check = Context::new(tcti).and_then(|mut ctx| {
            let selection = pcr_selection(self.pcr_index)?;
            ctx.pcr_read(selection).map(drop)
        });
        match check {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "tpm availability check failed");
                false
            }
        }
    }

    fn pcr_index(&self) -> u8 {
        self.pcr_index
    }

    fn read_measurement(&self) -> HsmResult<Vec<u8>> {
        let tcti = self.tcti()?;
        let mut ctx = Context::new(tcti).map_err(|e| {
            warn!(error = %e, "failed to open tpm context");
            HsmError::DeviceUnavailable
        })?;
        let (_, _, digests) = pcr_selection(self.pcr_index)
            .and_then(|selection| ctx.pcr_read(selection))
            .map_err(|e| {
                error!(error = %e, pcr = self.pcr_index, "pcr read failed");
                HsmError::DeviceUnavailable
            })?;
        digests
            .value()
            .first()
            .map(|digest| digest.value().to_vec())
            .ok_or(HsmError::InternalError)
    }

    fn seal(&self, secret: &[u8]) -> HsmResult<SealedPin> {
        if secret.is_empty() || secret.len() > MAX_SECRET_LEN {
            return Err(HsmError::InvalidParam);
        }
        let mut session = self.open()?;
        let measurement = session.read_pcr(self.pcr_index).map_err(|e| {
            error!(error = %e, "pcr read failed");
            HsmError::DeviceUnavailable
        })?;
        let (public, private) = session.seal(self.pcr_index, secret).map_err(|e| {
            error!(error = %e, "tpm seal failed");
            HsmError::SealFailed
        })?;
        let public = public.marshall().map_err(|e| {
            error!(error = %e, "failed to marshall sealed public area");
            HsmError::SealFailed
        })?;
        info!(pcr = self.pcr_index, "secret sealed in tpm");
        Ok(SealedPin::new(
            self.pcr_index,
            measurement,
            public,
            private.value().to_vec(),
        ))
    }

    fn unseal(&self, sealed: &SealedPin) -> HsmResult<SecretBuffer> {
        let public = Public::unmarshall(&sealed.public).map_err(|e| {
            warn!(error = %e, "sealed public area is corrupt");
            HsmError::UnsealFailed
        })?;
        let private = Private::try_from(sealed.private.clone()).map_err(|e| {
            warn!(error = %e, "sealed private area is corrupt");
            HsmError::UnsealFailed
        })?;
        let mut session = self.open()?;
        session
            .unseal(sealed.pcr_index, public, private)
            .map_err(|e| {
                warn!(error = %e, "tpm unseal failed");
                HsmError::UnsealFailed
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use tracing_test::traced_test;

    fn sealer() -> TssSealer {
        TssSealer::new(std::env::var("TCTI").ok(), 16)
    }

    #[test]
    fn bad_tcti_string_is_rejected() {
        assert!(resolve_tcti(Some("nonsense-tcti:::")).is_none());
    }

    #[test]
    #[serial]
    fn environment_does_not_pick_the_tcti() {
        // SAFETY: serialised with every other environment-touching test.
        unsafe { std::env::set_var("TCTI", "swtpm:host=localhost,port=4321") };
        let resolved = resolve_tcti(None);
        unsafe { std::env::remove_var("TCTI") };
        assert!(matches!(resolved, None | Some(TctiNameConf::Device(_))));
    }

    #[test]
    fn selection_rejects_out_of_range_register() {
        assert!(pcr_selection(7).is_ok());
        assert!(pcr_selection(24).is_err());
        assert!(pcr_selection(200).is_err());
    }

    #[test]
    fn oversized_register_index_is_invalid() {
        let sealer = TssSealer::new(Some("device:/dev/null".into()), 40);
        assert_eq!(sealer.seal(b"1234").unwrap_err(), HsmError::InvalidParam);
    }

    #[test]
    fn empty_secret_is_invalid() {
        assert_eq!(sealer().seal(b"").unwrap_err(), HsmError::InvalidParam);
    }

    #[test]
    #[serial]
    #[traced_test]
    #[ignore = "needs a TPM or swtpm reachable through TCTI"]
    fn seal_unseal_round_trip() {
        let sealer = sealer();
        assert!(sealer.is_available());
        let sealed = sealer.seal(b"123456").unwrap();
        assert_eq!(sealed.measurement.len(), 32);
        let restored = sealer.unseal(&sealed).unwrap();
        assert_eq!(restored.expose_secret(), b"123456");
    }

    #[test]
    #[serial]
    #[ignore = "needs a TPM or swtpm reachable through TCTI"]
    fn extended_register_blocks_unseal() {
        use tss_esapi::handles::PcrHandle;
        use tss_esapi::structures::DigestValues;

        let sealer = sealer();
        let sealed = sealer.seal(b"654321").unwrap();

        let mut ctx = Context::new(resolve_tcti(std::env::var("TCTI").ok().as_deref()).unwrap())
            .unwrap();
        let mut values = DigestValues::new();
        values.set(
            HashingAlgorithm::Sha256,
            Digest::try_from(vec![0xAB; 32]).unwrap(),
        );
        ctx.execute_with_nullauth_session(|ctx| ctx.pcr_extend(PcrHandle::Pcr16, values))
            .unwrap();

        assert_ne!(sealer.read_measurement().unwrap(), sealed.measurement);
        assert_eq!(sealer.unseal(&sealed).unwrap_err(), HsmError::UnsealFailed);
    }
}
