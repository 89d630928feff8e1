//! OpenMLS provider backed by an exportable in-memory store.
//!
//! Each group owns one [`GarrisonProvider`]: `RustCrypto` for the
//! cryptographic operations and [`EngineStorage`] for MLS state. The
//! storage has no I/O of its own — the group state serializer snapshots it
//! to bytes and restores it, so persistence policy stays with the caller.
//!
//! Entities are encoded with `serde_json` (the format OpenMLS's own memory
//! storage uses); storage keys combine a one-byte domain label with the
//! serialized entity key. Snapshots are framed with the garrison-proto
//! length-prefixed codec.

use std::collections::BTreeMap;
use std::sync::RwLock;

use openmls_rust_crypto::RustCrypto;
use openmls_traits::storage::{traits, StorageProvider, CURRENT_VERSION};
use openmls_traits::OpenMlsProvider;
use serde::de::DeserializeOwned;
use serde::Serialize;

use garrison_proto::codec::{put_bytes, Reader};

/// Errors from the MLS storage layer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineStorageError {
    #[error("entity encoding failed")]
    Encoding,
    #[error("entity not found")]
    NotFound,
    #[error("snapshot parse failed: {0}")]
    Snapshot(String),
}

/// Storage domains. The discriminant is the first byte of every cell key.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum Domain {
    KeyPackage = 1,
    Psk = 2,
    EncryptionKeyPair = 3,
    SignatureKeyPair = 4,
    EpochKeyPairs = 5,
    Tree = 6,
    GroupContext = 7,
    InterimTranscriptHash = 8,
    ConfirmationTag = 9,
    JoinConfig = 10,
    OwnLeafNodes = 11,
    GroupState = 12,
    QueuedProposal = 13,
    ProposalQueueRefs = 14,
    OwnLeafIndex = 15,
    EpochSecrets = 16,
    ResumptionPskStore = 17,
    MessageSecrets = 18,
}

type Cells = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory MLS storage implementing OpenMLS's `StorageProvider`.
///
/// The cell map is ordered so snapshots are byte-stable for identical
/// contents.
#[derive(Default)]
pub struct EngineStorage {
    cells: RwLock<Cells>,
}

impl EngineStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize every cell into a length-prefixed snapshot.
    pub fn snapshot(&self) -> Vec<u8> {
        let cells = self.cells.read().unwrap();
        let mut out = Vec::new();
        out.extend_from_slice(&(cells.len() as u32).to_be_bytes());
        for (key, value) in cells.iter() {
            put_bytes(&mut out, key);
            put_bytes(&mut out, value);
        }
        out
    }

    /// Rebuild storage from a snapshot produced by [`Self::snapshot`].
    pub fn restore(snapshot: &[u8]) -> Result<Self, EngineStorageError> {
        let mut r = Reader::new(snapshot);
        let count = r
            .u32()
            .map_err(|e| EngineStorageError::Snapshot(e.to_string()))?;
        let mut cells = Cells::new();
        for _ in 0..count {
            let key = r
                .bytes()
                .map_err(|e| EngineStorageError::Snapshot(e.to_string()))?;
            let value = r
                .bytes()
                .map_err(|e| EngineStorageError::Snapshot(e.to_string()))?;
            cells.insert(key.to_vec(), value.to_vec());
        }
        if !r.is_empty() {
            return Err(EngineStorageError::Snapshot(format!(
                "{} trailing bytes",
                r.remaining()
            )));
        }
        Ok(Self {
            cells: RwLock::new(cells),
        })
    }

    fn cell_key<K: Serialize + ?Sized>(
        domain: Domain,
        key: &K,
    ) -> Result<Vec<u8>, EngineStorageError> {
        let mut out = vec![domain as u8];
        out.extend_from_slice(&serde_json::to_vec(key).map_err(|_| EngineStorageError::Encoding)?);
        out
            .extend_from_slice(&(CURRENT_VERSION as u16).to_be_bytes());
        Ok(out)
    }

    fn put<K: Serialize + ?Sized, V: Serialize + ?Sized>(
        &self,
        domain: Domain,
        key: &K,
        value: &V,
    ) -> Result<(), EngineStorageError> {
        let cell = Self::cell_key(domain, key)?;
        let encoded = serde_json::to_vec(value).map_err(|_| EngineStorageError::Encoding)?;
        self.cells.write().unwrap().insert(cell, encoded);
        Ok(())
    }

    fn fetch<K: Serialize + ?Sized, V: DeserializeOwned>(
        &self,
        domain: Domain,
        key: &K,
    ) -> Result<Option<V>, EngineStorageError> {
        let cell = Self::cell_key(domain, key)?;
        match self.cells.read().unwrap().get(&cell) {
            Some(raw) => serde_json::from_slice(raw)
                .map(Some)
                .map_err(|_| EngineStorageError::Encoding),
            None => Ok(None),
        }
    }

    fn erase<K: Serialize + ?Sized>(
        &self,
        domain: Domain,
        key: &K,
    ) -> Result<(), EngineStorageError> {
        let cell = Self::cell_key(domain, key)?;
        self.cells.write().unwrap().remove(&cell);
        Ok(())
    }

    /// Append an encoded item to a list cell.
    fn push_item<K: Serialize + ?Sized, V: Serialize + ?Sized>(
        &self,
        domain: Domain,
        key: &K,
        item: &V,
    ) -> Result<(), EngineStorageError> {
        let cell = Self::cell_key(domain, key)?;
        let encoded = serde_json::to_vec(item).map_err(|_| EngineStorageError::Encoding)?;
        let mut cells = self.cells.write().unwrap();
        let raw = cells.entry(cell).or_insert_with(|| b"[]".to_vec());
        let mut list: Vec<Vec<u8>> =
            serde_json::from_slice(raw).map_err(|_| EngineStorageError::Encoding)?;
        list.push(encoded);
        *raw = serde_json::to_vec(&list).map_err(|_| EngineStorageError::Encoding)?;
        Ok(())
    }

    /// Remove one matching item from a list cell.
    fn drop_item<K: Serialize + ?Sized, V: Serialize + ?Sized>(
        &self,
        domain: Domain,
        key: &K,
        item: &V,
    ) -> Result<(), EngineStorageError> {
        let cell = Self::cell_key(domain, key)?;
        let encoded = serde_json::to_vec(item).map_err(|_| EngineStorageError::Encoding)?;
        let mut cells = self.cells.write().unwrap();
        if let Some(raw) = cells.get_mut(&cell) {
            let mut list: Vec<Vec<u8>> =
                serde_json::from_slice(raw).map_err(|_| EngineStorageError::Encoding)?;
            if let Some(pos) = list.iter().position(|stored| stored == &encoded) {
                list.remove(pos);
            }
            *raw = serde_json::to_vec(&list).map_err(|_| EngineStorageError::Encoding)?;
        }
        Ok(())
    }

    fn fetch_list<K: Serialize + ?Sized, V: DeserializeOwned>(
        &self,
        domain: Domain,
        key: &K,
    ) -> Result<Vec<V>, EngineStorageError> {
        let cell = Self::cell_key(domain, key)?;
        let cells = self.cells.read().unwrap();
        let list: Vec<Vec<u8>> = match cells.get(&cell) {
            Some(raw) => serde_json::from_slice(raw).map_err(|_| EngineStorageError::Encoding)?,
            None => return Ok(Vec::new()),
        };
        list.iter()
            .map(|raw| serde_json::from_slice(raw).map_err(|_| EngineStorageError::Encoding))
            .collect()
    }
}

/// Composite key for per-epoch encryption key pairs.
fn epoch_pairs_key<G: Serialize + ?Sized, E: Serialize + ?Sized>(
    group_id: &G,
    epoch: &E,
    leaf_index: u32,
) -> Result<Vec<u8>, EngineStorageError> {
    serde_json::to_vec(&(group_id, epoch, leaf_index)).map_err(|_| EngineStorageError::Encoding)
}

impl StorageProvider<CURRENT_VERSION> for EngineStorage {
    type Error = EngineStorageError;

    fn queue_proposal<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        ProposalRef: traits::ProposalRef<CURRENT_VERSION>,
        QueuedProposal: traits::QueuedProposal<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
        proposal_ref: &ProposalRef,
        proposal: &QueuedProposal,
    ) -> Result<(), Self::Error> {
        self.put(Domain::QueuedProposal, &(group_id, proposal_ref), proposal)?;
        self.push_item(Domain::ProposalQueueRefs, group_id, proposal_ref)
    }

    fn write_tree<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        TreeSync: traits::TreeSync<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
        tree: &TreeSync,
    ) -> Result<(), Self::Error> {
        self.put(Domain::Tree, group_id, tree)
    }

    fn write_interim_transcript_hash<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        InterimTranscriptHash: traits::InterimTranscriptHash<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
        interim_transcript_hash: &InterimTranscriptHash,
    ) -> Result<(), Self::Error> {
        self.put(Domain::InterimTranscriptHash, group_id, interim_transcript_hash)
    }

    fn write_context<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        GroupContext: traits::GroupContext<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
        group_context: &GroupContext,
    ) -> Result<(), Self::Error> {
        self.put(Domain::GroupContext, group_id, group_context)
    }

    fn write_confirmation_tag<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        ConfirmationTag: traits::ConfirmationTag<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
        confirmation_tag: &ConfirmationTag,
    ) -> Result<(), Self::Error> {
        self.put(Domain::ConfirmationTag, group_id, confirmation_tag)
    }

    fn write_signature_key_pair<
        SignaturePublicKey: traits::SignaturePublicKey<CURRENT_VERSION>,
        SignatureKeyPair: traits::SignatureKeyPair<CURRENT_VERSION>,
    >(
        &self,
        public_key: &SignaturePublicKey,
        signature_key_pair: &SignatureKeyPair,
    ) -> Result<(), Self::Error> {
        self.put(Domain::SignatureKeyPair, public_key, signature_key_pair)
    }

    fn queued_proposal_refs<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        ProposalRef: traits::ProposalRef<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<ProposalRef>, Self::Error> {
        self.fetch_list(Domain::ProposalQueueRefs, group_id)
    }

    fn queued_proposals<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        ProposalRef: traits::ProposalRef<CURRENT_VERSION>,
        QueuedProposal: traits::QueuedProposal<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<(ProposalRef, QueuedProposal)>, Self::Error> {
        let refs: Vec<ProposalRef> = self.fetch_list(Domain::ProposalQueueRefs, group_id)?;
        refs.into_iter()
            .map(|proposal_ref| {
                let proposal: QueuedProposal = self
                    .fetch(Domain::QueuedProposal, &(group_id, &proposal_ref))?
                    .ok_or(EngineStorageError::NotFound)?;
                Ok((proposal_ref, proposal))
            })
            .collect()
    }

    fn tree<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        TreeSync: traits::TreeSync<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
    ) -> Result<Option<TreeSync>, Self::Error> {
        self.fetch(Domain::Tree, group_id)
    }

    fn group_context<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        GroupContext: traits::GroupContext<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
    ) -> Result<Option<GroupContext>, Self::Error> {
        self.fetch(Domain::GroupContext, group_id)
    }

    fn interim_transcript_hash<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        InterimTranscriptHash: traits::InterimTranscriptHash<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
    ) -> Result<Option<InterimTranscriptHash>, Self::Error> {
        self.fetch(Domain::InterimTranscriptHash, group_id)
    }

    fn confirmation_tag<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        ConfirmationTag: traits::ConfirmationTag<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
    ) -> Result<Option<ConfirmationTag>, Self::Error> {
        self.fetch(Domain::ConfirmationTag, group_id)
    }

    fn signature_key_pair<
        SignaturePublicKey: traits::SignaturePublicKey<CURRENT_VERSION>,
        SignatureKeyPair: traits::SignatureKeyPair<CURRENT_VERSION>,
    >(
        &self,
        public_key: &SignaturePublicKey,
    ) -> Result<Option<SignatureKeyPair>, Self::Error> {
        self.fetch(Domain::SignatureKeyPair, public_key)
    }

    fn write_key_package<
        HashReference: traits::HashReference<CURRENT_VERSION>,
        KeyPackage: traits::KeyPackage<CURRENT_VERSION>,
    >(
        &self,
        hash_ref: &HashReference,
        key_package: &KeyPackage,
    ) -> Result<(), Self::Error> {
        self.put(Domain::KeyPackage, hash_ref, key_package)
    }

    fn write_psk<
        PskId: traits::PskId<CURRENT_VERSION>,
        PskBundle: traits::PskBundle<CURRENT_VERSION>,
    >(
        &self,
        psk_id: &PskId,
        psk: &PskBundle,
    ) -> Result<(), Self::Error> {
        self.put(Domain::Psk, psk_id, psk)
    }

    fn write_encryption_key_pair<
        EncryptionKey: traits::EncryptionKey<CURRENT_VERSION>,
        HpkeKeyPair: traits::HpkeKeyPair<CURRENT_VERSION>,
    >(
        &self,
        public_key: &EncryptionKey,
        key_pair: &HpkeKeyPair,
    ) -> Result<(), Self::Error> {
        self.put(Domain::EncryptionKeyPair, public_key, key_pair)
    }

    fn key_package<
        KeyPackageRef: traits::HashReference<CURRENT_VERSION>,
        KeyPackage: traits::KeyPackage<CURRENT_VERSION>,
    >(
        &self,
        hash_ref: &KeyPackageRef,
    ) -> Result<Option<KeyPackage>, Self::Error> {
        self.fetch(Domain::KeyPackage, hash_ref)
    }

    fn psk<PskBundle: traits::PskBundle<CURRENT_VERSION>, PskId: traits::PskId<CURRENT_VERSION>>(
        &self,
        psk_id: &PskId,
    ) -> Result<Option<PskBundle>, Self::Error> {
        self.fetch(Domain::Psk, psk_id)
    }

    fn encryption_key_pair<
        HpkeKeyPair: traits::HpkeKeyPair<CURRENT_VERSION>,
        EncryptionKey: traits::EncryptionKey<CURRENT_VERSION>,
    >(
        &self,
        public_key: &EncryptionKey,
    ) -> Result<Option<HpkeKeyPair>, Self::Error> {
        self.fetch(Domain::EncryptionKeyPair, public_key)
    }

    fn delete_signature_key_pair<
        SignaturePublicKey: traits::SignaturePublicKey<CURRENT_VERSION>,
    >(
        &self,
        public_key: &SignaturePublicKey,
    ) -> Result<(), Self::Error> {
        self.erase(Domain::SignatureKeyPair, public_key)
    }

    fn delete_encryption_key_pair<EncryptionKey: traits::EncryptionKey<CURRENT_VERSION>>(
        &self,
        public_key: &EncryptionKey,
    ) -> Result<(), Self::Error> {
        self.erase(Domain::EncryptionKeyPair, public_key)
    }

    fn delete_key_package<KeyPackageRef: traits::HashReference<CURRENT_VERSION>>(
        &self,
        hash_ref: &KeyPackageRef,
    ) -> Result<(), Self::Error> {
        self.erase(Domain::KeyPackage, hash_ref)
    }

    fn delete_psk<PskKey: traits::PskId<CURRENT_VERSION>>(
        &self,
        psk_id: &PskKey,
    ) -> Result<(), Self::Error> {
        self.erase(Domain::Psk, psk_id)
    }

    fn group_state<
        GroupState: traits::GroupState<CURRENT_VERSION>,
        GroupId: traits::GroupId<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
    ) -> Result<Option<GroupState>, Self::Error> {
        self.fetch(Domain::GroupState, group_id)
    }

    fn write_group_state<
        GroupState: traits::GroupState<CURRENT_VERSION>,
        GroupId: traits::GroupId<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
        group_state: &GroupState,
    ) -> Result<(), Self::Error> {
        self.put(Domain::GroupState, group_id, group_state)
    }

    fn delete_group_state<GroupId: traits::GroupId<CURRENT_VERSION>>(
        &self,
        group_id: &GroupId,
    ) -> Result<(), Self::Error> {
        self.erase(Domain::GroupState, group_id)
    }

    fn message_secrets<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        MessageSecrets: traits::MessageSecrets<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
    ) -> Result<Option<MessageSecrets>, Self::Error> {
        self.fetch(Domain::MessageSecrets, group_id)
    }

    fn write_message_secrets<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        MessageSecrets: traits::MessageSecrets<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
        message_secrets: &MessageSecrets,
    ) -> Result<(), Self::Error> {
        self.put(Domain::MessageSecrets, group_id, message_secrets)
    }

    fn delete_message_secrets<GroupId: traits::GroupId<CURRENT_VERSION>>(
        &self,
        group_id: &GroupId,
    ) -> Result<(), Self::Error> {
        self.erase(Domain::MessageSecrets, group_id)
    }

    fn resumption_psk_store<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        ResumptionPskStore: traits::ResumptionPskStore<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
    ) -> Result<Option<ResumptionPskStore>, Self::Error> {
        self.fetch(Domain::ResumptionPskStore, group_id)
    }

    fn write_resumption_psk_store<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        ResumptionPskStore: traits::ResumptionPskStore<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
        resumption_psk_store: &ResumptionPskStore,
    ) -> Result<(), Self::Error> {
        self.put(Domain::ResumptionPskStore, group_id, resumption_psk_store)
    }

    fn delete_all_resumption_psk_secrets<GroupId: traits::GroupId<CURRENT_VERSION>>(
        &self,
        group_id: &GroupId,
    ) -> Result<(), Self::Error> {
        self.erase(Domain::ResumptionPskStore, group_id)
    }

    fn own_leaf_index<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        LeafNodeIndex: traits::LeafNodeIndex<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
    ) -> Result<Option<LeafNodeIndex>, Self::Error> {
        self.fetch(Domain::OwnLeafIndex, group_id)
    }

    fn write_own_leaf_index<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        LeafNodeIndex: traits::LeafNodeIndex<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
        own_leaf_index: &LeafNodeIndex,
    ) -> Result<(), Self::Error> {
        self.put(Domain::OwnLeafIndex, group_id, own_leaf_index)
    }

    fn delete_own_leaf_index<GroupId: traits::GroupId<CURRENT_VERSION>>(
        &self,
        group_id: &GroupId,
    ) -> Result<(), Self::Error> {
        self.erase(Domain::OwnLeafIndex, group_id)
    }

    fn group_epoch_secrets<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        GroupEpochSecrets: traits::GroupEpochSecrets<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
    ) -> Result<Option<GroupEpochSecrets>, Self::Error> {
        self.fetch(Domain::EpochSecrets, group_id)
    }

    fn write_group_epoch_secrets<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        GroupEpochSecrets: traits::GroupEpochSecrets<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
        group_epoch_secrets: &GroupEpochSecrets,
    ) -> Result<(), Self::Error> {
        self.put(Domain::EpochSecrets, group_id, group_epoch_secrets)
    }

    fn delete_group_epoch_secrets<GroupId: traits::GroupId<CURRENT_VERSION>>(
        &self,
        group_id: &GroupId,
    ) -> Result<(), Self::Error> {
        self.erase(Domain::EpochSecrets, group_id)
    }

    fn write_encryption_epoch_key_pairs<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        EpochKey: traits::EpochKey<CURRENT_VERSION>,
        HpkeKeyPair: traits::HpkeKeyPair<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
        epoch: &EpochKey,
        leaf_index: u32,
        key_pairs: &[HpkeKeyPair],
    ) -> Result<(), Self::Error> {
        let key = epoch_pairs_key(group_id, epoch, leaf_index)?;
        self.put(Domain::EpochKeyPairs, &key, &key_pairs)
    }

    fn encryption_epoch_key_pairs<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        EpochKey: traits::EpochKey<CURRENT_VERSION>,
        HpkeKeyPair: traits::HpkeKeyPair<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
        epoch: &EpochKey,
        leaf_index: u32,
    ) -> Result<Vec<HpkeKeyPair>, Self::Error> {
        let key = epoch_pairs_key(group_id, epoch, leaf_index)?;
        self.fetch(Domain::EpochKeyPairs, &key)?
            .ok_or(EngineStorageError::NotFound)
    }

    fn delete_encryption_epoch_key_pairs<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        EpochKey: traits::EpochKey<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
        epoch: &EpochKey,
        leaf_index: u32,
    ) -> Result<(), Self::Error> {
        let key = epoch_pairs_key(group_id, epoch, leaf_index)?;
        self.erase(Domain::EpochKeyPairs, &key)
    }

    fn clear_proposal_queue<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        ProposalRef: traits::ProposalRef<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
    ) -> Result<(), Self::Error> {
        let refs: Vec<ProposalRef> = self.fetch_list(Domain::ProposalQueueRefs, group_id)?;
        for proposal_ref in refs {
            self.erase(Domain::QueuedProposal, &(group_id, &proposal_ref))?;
        }
        self.erase(Domain::ProposalQueueRefs, group_id)
    }

    fn mls_group_join_config<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        MlsGroupJoinConfig: traits::MlsGroupJoinConfig<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
    ) -> Result<Option<MlsGroupJoinConfig>, Self::Error> {
        self.fetch(Domain::JoinConfig, group_id)
    }

    fn write_mls_join_config<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        MlsGroupJoinConfig: traits::MlsGroupJoinConfig<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
        config: &MlsGroupJoinConfig,
    ) -> Result<(), Self::Error> {
        self.put(Domain::JoinConfig, group_id, config)
    }

    fn own_leaf_nodes<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        LeafNode: traits::LeafNode<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<LeafNode>, Self::Error> {
        self.fetch_list(Domain::OwnLeafNodes, group_id)
    }

    fn append_own_leaf_node<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        LeafNode: traits::LeafNode<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
        leaf_node: &LeafNode,
    ) -> Result<(), Self::Error> {
        self.push_item(Domain::OwnLeafNodes, group_id, leaf_node)
    }

    fn delete_own_leaf_nodes<GroupId: traits::GroupId<CURRENT_VERSION>>(
        &self,
        group_id: &GroupId,
    ) -> Result<(), Self::Error> {
        self.erase(Domain::OwnLeafNodes, group_id)
    }

    fn delete_group_config<GroupId: traits::GroupId<CURRENT_VERSION>>(
        &self,
        group_id: &GroupId,
    ) -> Result<(), Self::Error> {
        self.erase(Domain::JoinConfig, group_id)
    }

    fn delete_tree<GroupId: traits::GroupId<CURRENT_VERSION>>(
        &self,
        group_id: &GroupId,
    ) -> Result<(), Self::Error> {
        self.erase(Domain::Tree, group_id)
    }

    fn delete_confirmation_tag<GroupId: traits::GroupId<CURRENT_VERSION>>(
        &self,
        group_id: &GroupId,
    ) -> Result<(), Self::Error> {
        self.erase(Domain::ConfirmationTag, group_id)
    }

    fn delete_context<GroupId: traits::GroupId<CURRENT_VERSION>>(
        &self,
        group_id: &GroupId,
    ) -> Result<(), Self::Error> {
        self.erase(Domain::GroupContext, group_id)
    }

    fn delete_interim_transcript_hash<GroupId: traits::GroupId<CURRENT_VERSION>>(
        &self,
        group_id: &GroupId,
    ) -> Result<(), Self::Error> {
        self.erase(Domain::InterimTranscriptHash, group_id)
    }

    fn remove_proposal<
        GroupId: traits::GroupId<CURRENT_VERSION>,
        ProposalRef: traits::ProposalRef<CURRENT_VERSION>,
    >(
        &self,
        group_id: &GroupId,
        proposal_ref: &ProposalRef,
    ) -> Result<(), Self::Error> {
        self.drop_item(Domain::ProposalQueueRefs, group_id, proposal_ref)?;
        self.erase(Domain::QueuedProposal, &(group_id, proposal_ref))
    }
}

/// The OpenMLS provider used by every group: RustCrypto plus exportable
/// in-memory storage.
#[derive(Default)]
pub struct GarrisonProvider {
    crypto: RustCrypto,
    storage: EngineStorage,
}

impl GarrisonProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a provider from a storage snapshot.
    pub fn restore(snapshot: &[u8]) -> Result<Self, EngineStorageError> {
        Ok(Self {
            crypto: RustCrypto::default(),
            storage: EngineStorage::restore(snapshot)?,
        })
    }

    /// Snapshot the full MLS storage.
    pub fn snapshot(&self) -> Vec<u8> {
        self.storage.snapshot()
    }
}

impl OpenMlsProvider for GarrisonProvider {
    type CryptoProvider = RustCrypto;
    type RandProvider = RustCrypto;
    type StorageProvider = EngineStorage;

    fn storage(&self) -> &Self::StorageProvider {
        &self.storage
    }

    fn crypto(&self) -> &Self::CryptoProvider {
        &self.crypto
    }

    fn rand(&self) -> &Self::RandProvider {
        &self.crypto
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_roundtrip() {
        let storage = EngineStorage::new();
        storage.put(Domain::Tree, b"group-a", b"tree-bytes").unwrap();
        storage.put(Domain::GroupContext, b"group-a", b"ctx").unwrap();

        let snapshot = storage.snapshot();
        let restored = EngineStorage::restore(&snapshot).unwrap();

        let tree: Option<Vec<u8>> = restored.fetch(Domain::Tree, b"group-a").unwrap();
        assert_eq!(tree.as_deref(), Some(b"tree-bytes".as_slice()));
    }

    #[test]
    fn test_snapshot_is_deterministic() {
        let a = EngineStorage::new();
        let b = EngineStorage::new();
        // Insert in different orders; ordered cells make snapshots equal.
        a.put(Domain::Tree, b"k1", b"v1").unwrap();
        a.put(Domain::GroupContext, b"k2", b"v2").unwrap();
        b.put(Domain::GroupContext, b"k2", b"v2").unwrap();
        b.put(Domain::Tree, b"k1", b"v1").unwrap();

        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_restore_rejects_garbage() {
        assert!(EngineStorage::restore(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_restore_rejects_trailing_bytes() {
        let storage = EngineStorage::new();
        let mut snapshot = storage.snapshot();
        snapshot.push(0xFF);
        assert!(matches!(
            EngineStorage::restore(&snapshot),
            Err(EngineStorageError::Snapshot(_))
        ));
    }

    #[test]
    fn test_list_cells() {
        let storage = EngineStorage::new();
        storage
            .push_item(Domain::OwnLeafNodes, b"g", &vec![1u8])
            .unwrap();
        storage
            .push_item(Domain::OwnLeafNodes, b"g", &vec![2u8])
            .unwrap();

        let items: Vec<Vec<u8>> = storage.fetch_list(Domain::OwnLeafNodes, b"g").unwrap();
        assert_eq!(items, vec![vec![1u8], vec![2u8]]);

        storage
            .drop_item(Domain::OwnLeafNodes, b"g", &vec![1u8])
            .unwrap();
        let items: Vec<Vec<u8>> = storage.fetch_list(Domain::OwnLeafNodes, b"g").unwrap();
        assert_eq!(items, vec![vec![2u8]]);
    }
}
