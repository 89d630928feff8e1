//! Key package generation, custody and publication.
//!
//! A key package is pre-keyed material an identity publishes so that
//! others can add it to groups. The public part travels in a kind-443
//! event; the private part never leaves the custody store. Custody keeps
//! the full MLS storage snapshot taken right after generation, which is
//! exactly what joining from a welcome later needs.

use std::sync::Arc;

use openmls::prelude::tls_codec::{Deserialize as TlsDeserialize, Serialize as TlsSerialize};
use openmls::prelude::*;
use openmls_basic_credential::SignatureKeyPair;
use serde::{Deserialize, Serialize};

use garrison_proto::{
    ContentEncoding, Event, EventId, KeyPackagePublication, Kind, Pubkey, RelayListEvent, Rumor,
    Tag,
};

use crate::credential::{create_credential, CredentialPolicy};
use crate::error::{Error, Result};
use crate::provider::GarrisonProvider;
use crate::signal::Watch;
use crate::store::KvStore;
use crate::{CIPHERSUITE, SUPPORTED_EXTENSION_TYPES};

/// Grease values reserved by MLS to exercise extension-point handling.
///
/// Recognizable by equal high and low bytes; filtered out of the
/// `mls_extensions` tag so advertisements stay stable across clients.
pub const GREASE_VALUES: [u16; 15] = [
    0x0A0A, 0x1A1A, 0x2A2A, 0x3A3A, 0x4A4A, 0x5A5A, 0x6A6A, 0x7A7A, 0x8A8A, 0x9A9A, 0xAAAA,
    0xBABA, 0xCACA, 0xDADA, 0xEAEA,
];

/// True for identifiers in the MLS grease set.
pub fn is_grease(extension_type: u16) -> bool {
    GREASE_VALUES.contains(&extension_type)
}

/// A freshly generated key package with its custody material.
pub struct GeneratedKeyPackage {
    pub key_package: KeyPackage,
    /// Hex form of the OpenMLS hash reference.
    pub reference: String,
    pub entry: CustodyEntry,
}

/// Custody record for one key package.
///
/// `mls_snapshot` is the generating provider's full storage, holding the
/// init and leaf private keys plus the signature key pair. It is restored
/// verbatim when this key package is consumed by a welcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyEntry {
    /// TLS-serialized public key package.
    pub key_package: Vec<u8>,
    /// MLS storage snapshot containing the private half.
    pub mls_snapshot: Vec<u8>,
    /// Public signature key, used to re-read the signer after restore.
    pub signature_pubkey: Vec<u8>,
}

/// Generate a key package for `identity` with the required capability set.
///
/// The leaf capabilities declare the group data extension and last resort
/// extension types, and the package itself carries the last resort
/// extension so it survives being consumed once.
pub fn generate_key_package(
    identity: &Pubkey,
    lifetime_seconds: u64,
) -> Result<GeneratedKeyPackage> {
    let provider = GarrisonProvider::new();

    let signature_keys = SignatureKeyPair::new(CIPHERSUITE.signature_algorithm())
        .map_err(|e| Error::KeyGeneration(e.to_string()))?;
    signature_keys
        .store(provider.storage())
        .map_err(|e| Error::KeyGeneration(e.to_string()))?;

    let credential_with_key = CredentialWithKey {
        credential: create_credential(identity),
        signature_key: signature_keys.to_public_vec().into(),
    };

    let capabilities = Capabilities::new(
        None,
        Some(&[CIPHERSUITE]),
        Some(&SUPPORTED_EXTENSION_TYPES),
        None,
        Some(&[CredentialType::Basic]),
    );

    let bundle = KeyPackage::builder()
        .leaf_node_capabilities(capabilities)
        .key_package_extensions(Extensions::single(Extension::LastResort(
            LastResortExtension::default(),
        )))
        .key_package_lifetime(Lifetime::new(lifetime_seconds))
        .build(CIPHERSUITE, &provider, &signature_keys, credential_with_key)
        .map_err(|e| Error::KeyPackageGeneration(e.to_string()))?;

    let key_package = bundle.key_package().clone();
    let reference = key_package_reference(&key_package, &provider)?;

    let entry = CustodyEntry {
        key_package: key_package
            .tls_serialize_detached()
            .map_err(|e| Error::Serialization(e.to_string()))?,
        mls_snapshot: provider.snapshot(),
        signature_pubkey: signature_keys.to_public_vec(),
    };

    Ok(GeneratedKeyPackage {
        key_package,
        reference,
        entry,
    })
}

/// Hex hash reference of a key package.
pub fn key_package_reference(
    key_package: &KeyPackage,
    provider: &GarrisonProvider,
) -> Result<String> {
    let hash_ref = key_package
        .hash_ref(provider.crypto())
        .map_err(|e| Error::KeyPackageGeneration(e.to_string()))?;
    Ok(hex::encode(hash_ref.as_slice()))
}

/// Extension type ids a key package signals: its own extensions plus the
/// leaf capabilities, grease values removed.
fn signaled_extension_ids(key_package: &KeyPackage) -> Vec<u16> {
    let mut ids: Vec<u16> = key_package
        .extensions()
        .iter()
        .map(|ext| ext.extension_type().into())
        .chain(
            key_package
                .leaf_node()
                .capabilities()
                .extensions()
                .iter()
                .map(|et| (*et).into()),
        )
        .filter(|id| !is_grease(*id))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Build the unsigned kind-443 publication event for a key package.
pub fn create_key_package_event(
    identity: &Pubkey,
    key_package: &KeyPackage,
    relays: &[String],
    client_name: Option<&str>,
) -> Result<Rumor> {
    let encoded = key_package
        .tls_serialize_detached()
        .map_err(|e| Error::Serialization(e.to_string()))?;

    let suite_id = CIPHERSUITE as u16;
    let extension_ids: Vec<String> = signaled_extension_ids(key_package)
        .into_iter()
        .map(|id| format!("{id:#06x}"))
        .collect();

    let mut tags = vec![
        Tag::mls_protocol_version("1.0"),
        Tag::mls_ciphersuite(&format!("{suite_id:#06x}")),
        Tag::mls_extensions(&extension_ids),
        Tag::encoding(ContentEncoding::Base64.as_str()),
    ];
    if !relays.is_empty() {
        tags.push(Tag::relays(relays));
    }
    if let Some(name) = client_name {
        tags.push(Tag::client(name));
    }

    Ok(Rumor::new(
        *identity,
        Kind::KEY_PACKAGE,
        tags,
        ContentEncoding::Base64.encode(&encoded),
    ))
}

/// Parse and validate the key package carried by a kind-443 event.
///
/// The wire-level tag validation (including the legacy hex content
/// default) lives in [`KeyPackagePublication::parse`]; this adds the MLS
/// parse, signature validation, and the credential policy check on the
/// leaf.
pub fn extract_key_package(event: &Event) -> Result<KeyPackage> {
    let publication = KeyPackagePublication::parse(event)
        .map_err(|e| Error::KeyPackageValidation(e.to_string()))?;

    let key_package_in = KeyPackageIn::tls_deserialize_exact(&publication.key_package_bytes)
        .map_err(|e| Error::KeyPackageValidation(e.to_string()))?;

    let provider = GarrisonProvider::new();
    let key_package = key_package_in
        .validate(provider.crypto(), ProtocolVersion::Mls10)
        .map_err(|e| Error::KeyPackageValidation(e.to_string()))?;

    let leaf = key_package.leaf_node();
    if !CredentialPolicy.validate_credential(leaf.credential(), leaf.signature_key()) {
        return Err(Error::KeyPackageValidation(
            "leaf credential fails authentication policy".into(),
        ));
    }
    Ok(key_package)
}

/// Build the kind-5 deletion event covering published key package events.
pub fn create_key_package_deletion_event(identity: &Pubkey, event_ids: &[EventId]) -> Rumor {
    let mut tags = vec![Tag::kind_ref(Kind::KEY_PACKAGE)];
    for id in event_ids {
        tags.push(Tag::event_ref(id));
    }
    Rumor::new(*identity, Kind::DELETION, tags, String::new())
}

/// Build the kind-10051 relay list naming where this identity wants its
/// key package gift wraps delivered.
pub fn create_relay_list_event(identity: &Pubkey, relays: &[String]) -> Rumor {
    let tags = relays.iter().map(|url| Tag::relay(url)).collect();
    Rumor::new(*identity, Kind::KEY_PACKAGE_RELAYS, tags, String::new())
}

/// Relay URLs declared by a kind-10051 event, invalid entries dropped.
pub fn extract_relay_list(event: &Event) -> Result<Vec<String>> {
    let parsed = RelayListEvent::parse(event)?;
    Ok(parsed
        .relays
        .into_iter()
        .filter(|url| garrison_proto::group_data::validate_relay_url(url).is_ok())
        .collect())
}

/// Custody store: reference -> complete key package.
///
/// The private half only ever leaves through [`KeyPackageStore::get`].
pub struct KeyPackageStore {
    store: Arc<dyn KvStore>,
    refs: Watch<Vec<String>>,
}

impl KeyPackageStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        let initial = store.keys().unwrap_or_default();
        Self {
            store,
            refs: Watch::new(initial),
        }
    }

    /// Store a generated key package under its reference.
    pub fn add(&self, generated: &GeneratedKeyPackage) -> Result<String> {
        let encoded = serde_json::to_vec(&generated.entry)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.store.set(&generated.reference, encoded)?;
        self.notify()?;
        Ok(generated.reference.clone())
    }

    /// Remove a key package. Explicit rotation: generation never does this.
    pub fn remove(&self, reference: &str) -> Result<()> {
        self.store.remove(reference)?;
        self.notify()
    }

    /// Full custody entry for a reference.
    pub fn get(&self, reference: &str) -> Result<Option<CustodyEntry>> {
        match self.store.get(reference)? {
            Some(raw) => {
                let entry = serde_json::from_slice(&raw)
                    .map_err(|e| Error::CorruptedState(e.to_string()))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Public parts of every stored key package.
    pub fn list(&self) -> Result<Vec<KeyPackage>> {
        let mut out = Vec::new();
        for (reference, raw) in self.store.entries()? {
            let entry: CustodyEntry = match serde_json::from_slice(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(reference = %reference, error = %e, "skipping corrupted custody entry");
                    continue;
                }
            };
            let key_package_in = KeyPackageIn::tls_deserialize_exact(&entry.key_package)
                .map_err(|e| Error::CorruptedState(e.to_string()))?;
            let provider = GarrisonProvider::new();
            let key_package = key_package_in
                .validate(provider.crypto(), ProtocolVersion::Mls10)
                .map_err(|e| Error::CorruptedState(e.to_string()))?;
            out.push(key_package);
        }
        Ok(out)
    }

    /// Stored references.
    pub fn references(&self) -> Result<Vec<String>> {
        self.store.keys()
    }

    /// Snapshot of references plus a stream of updates on each mutation.
    pub fn watch(&self) -> (Vec<String>, tokio::sync::mpsc::UnboundedReceiver<Vec<String>>) {
        self.refs.watch()
    }

    fn notify(&self) -> Result<()> {
        self.refs.set(self.store.keys()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;
    use crate::config::DEFAULT_KEY_PACKAGE_LIFETIME_SECONDS;

    fn identity(byte: u8) -> Pubkey {
        Pubkey::from_bytes([byte; 32])
    }

    fn generate(byte: u8) -> GeneratedKeyPackage {
        generate_key_package(&identity(byte), DEFAULT_KEY_PACKAGE_LIFETIME_SECONDS).unwrap()
    }

    #[test]
    fn test_generation_declares_required_capabilities() {
        let generated = generate(1);
        let declared: Vec<u16> = generated
            .key_package
            .leaf_node()
            .capabilities()
            .extensions()
            .iter()
            .map(|et| (*et).into())
            .collect();
        assert!(declared.contains(&0xF2EE));
        assert!(declared.contains(&0x000A));
    }

    #[test]
    fn test_generation_carries_last_resort_extension() {
        let generated = generate(1);
        assert!(generated
            .key_package
            .extensions()
            .iter()
            .any(|ext| ext.extension_type() == ExtensionType::LastResort));
    }

    #[test]
    fn test_references_are_unique() {
        let a = generate(1);
        let b = generate(1);
        assert_ne!(a.reference, b.reference);
    }

    #[test]
    fn test_publication_roundtrip() {
        let generated = generate(2);
        let rumor = create_key_package_event(
            &identity(2),
            &generated.key_package,
            &["wss://relay.example".to_string()],
            Some("garrison"),
        )
        .unwrap();
        assert_eq!(rumor.kind, Kind::KEY_PACKAGE);
        assert_eq!(rumor.tag_value("encoding"), Some("base64"));
        assert_eq!(rumor.tag_value("mls_protocol_version"), Some("1.0"));
        assert_eq!(rumor.tag_value("mls_ciphersuite"), Some("0x0001"));

        // Round-trip through a signed event.
        let keys = garrison_proto::EphemeralKeys::generate();
        let event = keys.sign_at(rumor.kind, rumor.tags.clone(), rumor.content.clone(), rumor.created_at);
        let extracted = extract_key_package(&event).unwrap();

        assert_eq!(extracted.ciphersuite(), generated.key_package.ciphersuite());
        assert_eq!(
            extracted.leaf_node().credential(),
            generated.key_package.leaf_node().credential()
        );
        // Byte-identical after the round trip, so version and lifetime
        // survive too.
        assert_eq!(
            extracted.tls_serialize_detached().unwrap(),
            generated.key_package.tls_serialize_detached().unwrap()
        );
    }

    #[test]
    fn test_extensions_tag_filters_grease() {
        let generated = generate(3);
        let rumor =
            create_key_package_event(&identity(3), &generated.key_package, &[], None).unwrap();
        for value in rumor.tag_values("mls_extensions") {
            let id = u16::from_str_radix(value.trim_start_matches("0x"), 16).unwrap();
            assert!(!is_grease(id), "grease value {value} leaked into tag");
        }
    }

    #[test]
    fn test_extract_rejects_wrong_kind() {
        let keys = garrison_proto::EphemeralKeys::generate();
        let event = keys.sign(Kind::GROUP_MESSAGE, vec![], "00".into());
        assert!(matches!(
            extract_key_package(&event),
            Err(Error::KeyPackageValidation(_))
        ));
    }

    #[test]
    fn test_extract_rejects_garbage_content() {
        let keys = garrison_proto::EphemeralKeys::generate();
        let event = keys.sign(
            Kind::KEY_PACKAGE,
            vec![Tag::encoding("base64")],
            "bm90IGEga2V5IHBhY2thZ2U=".into(),
        );
        assert!(matches!(
            extract_key_package(&event),
            Err(Error::KeyPackageValidation(_))
        ));
    }

    #[test]
    fn test_custody_lifecycle() {
        let store = KeyPackageStore::new(Arc::new(MemoryKvStore::new()));
        let generated = generate(4);
        let reference = store.add(&generated).unwrap();

        assert!(store.get(&reference).unwrap().is_some());
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.references().unwrap(), vec![reference.clone()]);

        // Rotation: adding a second package leaves the first in place.
        let second = generate(4);
        store.add(&second).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);

        store.remove(&reference).unwrap();
        assert!(store.get(&reference).unwrap().is_none());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_custody_watch() {
        let store = KeyPackageStore::new(Arc::new(MemoryKvStore::new()));
        let (snapshot, mut rx) = store.watch();
        assert!(snapshot.is_empty());

        let generated = generate(5);
        let reference = store.add(&generated).unwrap();
        assert_eq!(rx.try_recv().unwrap(), vec![reference]);
    }

    #[test]
    fn test_relay_list_roundtrip() {
        let urls = vec![
            "wss://inbox.example".to_string(),
            "https://not-websocket.example".to_string(),
        ];
        let rumor = create_relay_list_event(&identity(7), &urls);
        assert_eq!(rumor.kind, Kind::KEY_PACKAGE_RELAYS);

        let keys = garrison_proto::EphemeralKeys::generate();
        let event = keys.sign_at(rumor.kind, rumor.tags, rumor.content, rumor.created_at);
        // Only the websocket URL survives extraction.
        assert_eq!(
            extract_relay_list(&event).unwrap(),
            vec!["wss://inbox.example".to_string()]
        );
    }

    #[test]
    fn test_deletion_event_shape() {
        let ids = vec![EventId::from_bytes([1; 32]), EventId::from_bytes([2; 32])];
        let rumor = create_key_package_deletion_event(&identity(6), &ids);
        assert_eq!(rumor.kind, Kind::DELETION);
        assert_eq!(rumor.tag_value("k"), Some("443"));
        assert_eq!(rumor.tag_values("e").len(), 1); // first `e` tag
        let e_tags: Vec<_> = rumor
            .tags
            .iter()
            .filter(|t| t.name() == Some("e"))
            .collect();
        assert_eq!(e_tags.len(), 2);
    }
}
