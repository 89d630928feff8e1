//! Group creation and persistent client state.
//!
//! A [`GroupState`] bundles everything one group needs: its own OpenMLS
//! provider, the loaded `MlsGroup`, the member's MLS signature key pair
//! and a short history of exporter secrets. Serialization snapshots the
//! provider storage behind a versioned header; the header names the group
//! id and signature public key so deserialization can reload both.

use std::collections::BTreeMap;

use openmls::prelude::*;
use openmls_basic_credential::SignatureKeyPair;

use garrison_proto::codec::{put_bytes, Reader};
use garrison_proto::{GroupData, Pubkey};

use crate::credential::{create_credential, credential_identity};
use crate::error::{Error, Result};
use crate::provider::GarrisonProvider;
use crate::{CIPHERSUITE, EXPORTER_CONTEXT, EXPORTER_LABEL, REQUIRED_CONTEXT_EXTENSION_TYPES, SUPPORTED_EXTENSION_TYPES};

/// Magic bytes of the serialized state header.
const STATE_MAGIC: &[u8; 4] = b"GRSN";

/// Serialized state version.
const STATE_VERSION: u16 = 1;

/// How many exporter secrets to keep for late-arriving messages.
const EXPORTER_HISTORY_LIMIT: usize = 8;

/// How many past epochs of message secrets OpenMLS keeps, so application
/// messages sent just before a commit still decrypt after it is applied.
pub(crate) const MAX_PAST_EPOCHS: usize = 5;

/// Full MLS state of one group.
pub struct GroupState {
    provider: GarrisonProvider,
    group: MlsGroup,
    signer: SignatureKeyPair,
    /// Exporter secrets by epoch, pruned to the most recent few.
    exporter_history: BTreeMap<u64, [u8; 32]>,
}

impl GroupState {
    /// Create a new group with the group data extension embedded first in
    /// the group context.
    ///
    /// The MLS group id is the 32-byte network group id carried by
    /// `group_data`.
    pub fn create(
        creator: &Pubkey,
        group_data: &GroupData,
        extra_extensions: Vec<Extension>,
    ) -> Result<Self> {
        let provider = GarrisonProvider::new();

        let signer = SignatureKeyPair::new(CIPHERSUITE.signature_algorithm())
            .map_err(|e| Error::KeyGeneration(e.to_string()))?;
        signer
            .store(provider.storage())
            .map_err(|e| Error::KeyGeneration(e.to_string()))?;

        let credential_with_key = CredentialWithKey {
            credential: create_credential(creator),
            signature_key: signer.to_public_vec().into(),
        };

        // Group data goes first, then the member support requirement,
        // then whatever the caller added.
        let mut extensions = vec![
            Extension::Unknown(
                garrison_proto::GROUP_DATA_EXTENSION_TYPE,
                UnknownExtension(group_data.encode()),
            ),
            Extension::RequiredCapabilities(RequiredCapabilitiesExtension::new(
                &REQUIRED_CONTEXT_EXTENSION_TYPES,
                &[],
                &[CredentialType::Basic],
            )),
        ];
        extensions.extend(extra_extensions);

        let capabilities = Capabilities::new(
            None,
            Some(&[CIPHERSUITE]),
            Some(&SUPPORTED_EXTENSION_TYPES),
            None,
            Some(&[CredentialType::Basic]),
        );

        let config = MlsGroupCreateConfig::builder()
            .ciphersuite(CIPHERSUITE)
            .use_ratchet_tree_extension(true)
            .max_past_epochs(MAX_PAST_EPOCHS)
            .capabilities(capabilities)
            .with_group_context_extensions(
                Extensions::from_vec(extensions)
                    .map_err(|e| Error::GroupCreation(e.to_string()))?,
            )
            .map_err(|e| Error::GroupCreation(e.to_string()))?
            .build();

        let group_id = GroupId::from_slice(&group_data.network_group_id);
        let group = MlsGroup::new_with_group_id(
            &provider,
            &signer,
            &config,
            group_id,
            credential_with_key,
        )
        .map_err(|e| Error::GroupCreation(e.to_string()))?;

        let mut state = Self {
            provider,
            group,
            signer,
            exporter_history: BTreeMap::new(),
        };
        state.refresh_exporter_secret()?;
        Ok(state)
    }

    /// Wrap an already-loaded group.
    pub(crate) fn from_parts(
        provider: GarrisonProvider,
        group: MlsGroup,
        signer: SignatureKeyPair,
    ) -> Result<Self> {
        let mut state = Self {
            provider,
            group,
            signer,
            exporter_history: BTreeMap::new(),
        };
        state.refresh_exporter_secret()?;
        Ok(state)
    }

    /// MLS group id bytes. Identical to the network group id.
    pub fn group_id(&self) -> Vec<u8> {
        self.group.group_id().as_slice().to_vec()
    }

    /// Hex network group id, as used in `h` tags and store keys.
    pub fn group_id_hex(&self) -> String {
        hex::encode(self.group.group_id().as_slice())
    }

    /// Current epoch.
    pub fn epoch(&self) -> u64 {
        self.group.epoch().as_u64()
    }

    /// Number of occupied leaves in the ratchet tree.
    pub fn member_count(&self) -> usize {
        self.group.members().count()
    }

    /// Identities of all members, by leaf order.
    pub fn member_identities(&self) -> Vec<Pubkey> {
        self.group
            .members()
            .filter_map(|member| credential_identity(&member.credential).ok())
            .collect()
    }

    /// Leaf indices belonging to an identity. An identity may occupy
    /// several leaves when it joined from more than one key package.
    pub fn leaves_for_identity(&self, identity: &Pubkey) -> Vec<LeafNodeIndex> {
        self.group
            .members()
            .filter(|member| {
                credential_identity(&member.credential)
                    .map(|id| id == *identity)
                    .unwrap_or(false)
            })
            .map(|member| member.index)
            .collect()
    }

    /// Decode the group data from the first matching context extension.
    ///
    /// Absence and decode failures both come back as `None`; failures are
    /// logged since they indicate a malformed group.
    pub fn group_data(&self) -> Option<GroupData> {
        let extension = self
            .group
            .extensions()
            .iter()
            .find_map(|ext| match ext {
                Extension::Unknown(ext_type, payload)
                    if *ext_type == garrison_proto::GROUP_DATA_EXTENSION_TYPE =>
                {
                    Some(payload)
                }
                _ => None,
            })?;
        match GroupData::decode(&extension.0) {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::warn!(group = %self.group_id_hex(), error = %e, "group data extension failed to decode");
                None
            }
        }
    }

    /// Current exporter secret, recording it into the epoch history.
    pub fn exporter_secret(&mut self) -> Result<[u8; 32]> {
        let epoch = self.epoch();
        if let Some(secret) = self.exporter_history.get(&epoch) {
            return Ok(*secret);
        }
        self.refresh_exporter_secret()
    }

    /// Exporter secret recorded for a past epoch, if still in history.
    pub fn exporter_secret_at(&self, epoch: u64) -> Option<[u8; 32]> {
        self.exporter_history.get(&epoch).copied()
    }

    /// Epochs with a recorded exporter secret, newest first.
    pub fn known_epochs(&self) -> Vec<u64> {
        self.exporter_history.keys().rev().copied().collect()
    }

    /// Derive and record the exporter secret for the current epoch.
    pub(crate) fn refresh_exporter_secret(&mut self) -> Result<[u8; 32]> {
        let secret = self
            .group
            .export_secret(&self.provider, EXPORTER_LABEL, EXPORTER_CONTEXT, 32)
            .map_err(|e| Error::Encryption(e.to_string()))?;
        let secret: [u8; 32] = secret
            .try_into()
            .map_err(|_| Error::Encryption("exporter returned wrong length".into()))?;

        self.exporter_history.insert(self.epoch(), secret);
        while self.exporter_history.len() > EXPORTER_HISTORY_LIMIT {
            let oldest = *self.exporter_history.keys().next().expect("non-empty");
            self.exporter_history.remove(&oldest);
        }
        Ok(secret)
    }

    pub(crate) fn provider(&self) -> &GarrisonProvider {
        &self.provider
    }

    pub(crate) fn group(&self) -> &MlsGroup {
        &self.group
    }

    pub(crate) fn group_mut(&mut self) -> &mut MlsGroup {
        &mut self.group
    }

    pub(crate) fn signer(&self) -> &SignatureKeyPair {
        &self.signer
    }

    /// Split borrow for operations that need the group mutable while
    /// reading the provider and signer.
    pub(crate) fn mls_parts(&mut self) -> (&mut MlsGroup, &GarrisonProvider, &SignatureKeyPair) {
        (&mut self.group, &self.provider, &self.signer)
    }

    /// Serialize the full state to opaque bytes.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(STATE_MAGIC);
        out.extend_from_slice(&STATE_VERSION.to_be_bytes());
        put_bytes(&mut out, self.group.group_id().as_slice());
        put_bytes(&mut out, &self.signer.to_public_vec());

        out.extend_from_slice(&(self.exporter_history.len() as u32).to_be_bytes());
        for (epoch, secret) in &self.exporter_history {
            out.extend_from_slice(&epoch.to_be_bytes());
            out.extend_from_slice(secret);
        }

        put_bytes(&mut out, &self.provider.snapshot());
        Ok(out)
    }

    /// Rebuild a state from serialized bytes.
    ///
    /// Any parse or reload failure is a corrupted-state error; this never
    /// panics on arbitrary input.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let corrupted = |msg: String| Error::CorruptedState(msg);

        if bytes.len() < STATE_MAGIC.len() + 2 || &bytes[..4] != STATE_MAGIC {
            return Err(corrupted("bad state magic".into()));
        }
        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != STATE_VERSION {
            return Err(corrupted(format!("unsupported state version {version}")));
        }

        let mut r = Reader::new(&bytes[6..]);
        let group_id = r
            .bytes()
            .map_err(|e| corrupted(e.to_string()))?
            .to_vec();
        let signature_pubkey = r
            .bytes()
            .map_err(|e| corrupted(e.to_string()))?
            .to_vec();

        let secret_count = r.u32().map_err(|e| corrupted(e.to_string()))?;
        let mut exporter_history = BTreeMap::new();
        for _ in 0..secret_count {
            let epoch_bytes: [u8; 8] = r
                .fixed(8)
                .map_err(|e| corrupted(e.to_string()))?
                .try_into()
                .expect("fixed read returns the requested length");
            let secret: [u8; 32] = r
                .fixed(32)
                .map_err(|e| corrupted(e.to_string()))?
                .try_into()
                .expect("fixed read returns the requested length");
            exporter_history.insert(u64::from_be_bytes(epoch_bytes), secret);
        }

        let snapshot = r.bytes().map_err(|e| corrupted(e.to_string()))?;
        if !r.is_empty() {
            return Err(corrupted(format!("{} trailing bytes", r.remaining())));
        }

        let provider =
            GarrisonProvider::restore(snapshot).map_err(|e| corrupted(e.to_string()))?;

        let group = MlsGroup::load(provider.storage(), &GroupId::from_slice(&group_id))
            .map_err(|e| corrupted(e.to_string()))?
            .ok_or_else(|| corrupted("group missing from restored storage".into()))?;

        let signer = SignatureKeyPair::read(
            provider.storage(),
            &signature_pubkey,
            CIPHERSUITE.signature_algorithm(),
        )
        .ok_or_else(|| corrupted("signature key missing from restored storage".into()))?;

        Ok(Self {
            provider,
            group,
            signer,
            exporter_history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(admins: Vec<Pubkey>) -> GroupData {
        GroupData::new("test", "test group", admins, vec!["wss://relay.example".into()])
    }

    fn creator() -> Pubkey {
        Pubkey::from_bytes([0xAA; 32])
    }

    #[test]
    fn test_create_embeds_group_data() {
        let data = sample_data(vec![creator()]);
        let state = GroupState::create(&creator(), &data, vec![]).unwrap();

        assert_eq!(state.group_id(), data.network_group_id.to_vec());
        assert_eq!(state.epoch(), 0);
        assert_eq!(state.member_count(), 1);

        let embedded = state.group_data().unwrap();
        assert_eq!(embedded, data);
        assert!(embedded.is_admin(&creator()));
    }

    #[test]
    fn test_member_identities() {
        let data = sample_data(vec![creator()]);
        let state = GroupState::create(&creator(), &data, vec![]).unwrap();
        assert_eq!(state.member_identities(), vec![creator()]);
        assert_eq!(state.leaves_for_identity(&creator()).len(), 1);
        assert!(state
            .leaves_for_identity(&Pubkey::from_bytes([1; 32]))
            .is_empty());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let data = sample_data(vec![creator()]);
        let mut state = GroupState::create(&creator(), &data, vec![]).unwrap();
        let secret = state.exporter_secret().unwrap();

        let bytes = state.serialize().unwrap();
        let restored = GroupState::deserialize(&bytes).unwrap();

        assert_eq!(restored.group_id(), state.group_id());
        assert_eq!(restored.epoch(), state.epoch());
        assert_eq!(restored.member_count(), state.member_count());
        assert_eq!(restored.group_data(), state.group_data());
        assert_eq!(restored.exporter_secret_at(0), Some(secret));
    }

    #[test]
    fn test_deserialize_random_bytes_is_corrupted_state() {
        let result = GroupState::deserialize(&[0xDE, 0xAD, 0xBE, 0xEF, 1, 2, 3]);
        assert!(matches!(result, Err(Error::CorruptedState(_))));
    }

    #[test]
    fn test_deserialize_wrong_version() {
        let data = sample_data(vec![creator()]);
        let state = GroupState::create(&creator(), &data, vec![]).unwrap();
        let mut bytes = state.serialize().unwrap();
        bytes[4] = 0xFF;
        assert!(matches!(
            GroupState::deserialize(&bytes),
            Err(Error::CorruptedState(_))
        ));
    }

    #[test]
    fn test_deserialize_truncated() {
        let data = sample_data(vec![creator()]);
        let state = GroupState::create(&creator(), &data, vec![]).unwrap();
        let bytes = state.serialize().unwrap();
        let result = GroupState::deserialize(&bytes[..bytes.len() / 2]);
        assert!(matches!(result, Err(Error::CorruptedState(_))));
    }

    #[test]
    fn test_exporter_secret_is_stable_within_epoch() {
        let data = sample_data(vec![creator()]);
        let mut state = GroupState::create(&creator(), &data, vec![]).unwrap();
        let a = state.exporter_secret().unwrap();
        let b = state.exporter_secret().unwrap();
        assert_eq!(a, b);
        assert_eq!(state.known_epochs(), vec![0]);
    }
}
