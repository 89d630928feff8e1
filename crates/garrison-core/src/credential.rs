//! Identity credentials for MLS leaves.
//!
//! Garrison members are identified by a 32-byte public key carried as the
//! identity of an MLS basic credential. Nothing else goes into the
//! credential: display data lives in the group data extension, and
//! signature verification stays with OpenMLS.

use openmls::prelude::{BasicCredential, Credential, CredentialType, SignaturePublicKey};

use garrison_proto::Pubkey;

use crate::error::{Error, Result};

/// Wrap an identity as an MLS basic credential.
pub fn create_credential(identity: &Pubkey) -> Credential {
    BasicCredential::new(identity.as_bytes().to_vec()).into()
}

/// Extract the identity from a credential.
///
/// Fails for non-basic credentials and for identities that are not exactly
/// 32 bytes.
pub fn credential_identity(credential: &Credential) -> Result<Pubkey> {
    let basic = BasicCredential::try_from(credential.clone())
        .map_err(|e| Error::InvalidCredential(e.to_string()))?;
    let bytes: [u8; 32] = basic
        .identity()
        .try_into()
        .map_err(|_| Error::InvalidCredential(format!(
            "identity must be 32 bytes, got {}",
            basic.identity().len()
        )))?;
    Ok(Pubkey::from_bytes(bytes))
}

/// Leaf-credential authentication policy.
///
/// Accepts exactly the credentials this core produces: basic type with a
/// 32-byte identity. Signature checks against the supplied key are
/// delegated to OpenMLS, which runs them before this policy is consulted.
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialPolicy;

impl CredentialPolicy {
    pub fn validate_credential(
        &self,
        credential: &Credential,
        _signature_key: &SignaturePublicKey,
    ) -> bool {
        credential.credential_type() == CredentialType::Basic
            && credential_identity(credential).is_ok()
    }
}
