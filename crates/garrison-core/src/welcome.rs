//! Welcome construction, extraction and joining.
//!
//! A commit that admits members produces an MLS Welcome. For each
//! recipient the facade builds an unsigned kind-444 rumor carrying the
//! base64 welcome, the group's relay list and a reference to the key
//! package event that was consumed; the gift wrap layer then seals it to
//! the recipient. Joining reverses the path: parse the welcome, find the
//! custody entry whose reference the welcome names, and hand both to
//! OpenMLS.

use openmls::prelude::tls_codec::{Deserialize as TlsDeserialize, Serialize as TlsSerialize};
use openmls::prelude::*;
use openmls_basic_credential::SignatureKeyPair;

use garrison_proto::codec::{decode_base64, encode_base64, ContentEncoding};
use garrison_proto::{EventId, Kind, Pubkey, Rumor, Tag};

use crate::error::{Error, Result};
use crate::group::{GroupState, MAX_PAST_EPOCHS};
use crate::key_package::KeyPackageStore;
use crate::provider::GarrisonProvider;
use crate::CIPHERSUITE;

/// Build one kind-444 rumor per recipient for a welcome message.
///
/// All recipients receive the same serialized welcome; MLS scopes the
/// per-joiner secrets inside it.
pub fn build_welcome_rumors(
    sender: &Pubkey,
    welcome: &MlsMessageOut,
    group_relays: &[String],
    key_package_event_id: Option<EventId>,
    recipients: &[Pubkey],
) -> Result<Vec<(Pubkey, Rumor)>> {
    let serialized = welcome
        .tls_serialize_detached()
        .map_err(|e| Error::Serialization(e.to_string()))?;
    let content = encode_base64(&serialized);

    let mut tags = vec![
        Tag::relays(group_relays),
        Tag::encoding(ContentEncoding::Base64.as_str()),
    ];
    if let Some(id) = key_package_event_id {
        tags.push(Tag::event_ref(&id));
    }

    Ok(recipients
        .iter()
        .map(|recipient| {
            (
                *recipient,
                Rumor::new(*sender, Kind::WELCOME, tags.clone(), content.clone()),
            )
        })
        .collect())
}

/// Parse the MLS Welcome carried by a kind-444 rumor.
///
/// Welcome rumors default to base64 content; an explicit `encoding` tag
/// overrides.
pub fn parse_welcome(rumor: &Rumor) -> Result<Welcome> {
    if rumor.kind != Kind::WELCOME {
        return Err(Error::InvalidWelcome(format!(
            "expected kind 444, got {}",
            rumor.kind
        )));
    }

    let raw = match rumor.tag_value("encoding") {
        Some(tag) => ContentEncoding::from_tag(Some(tag))
            .decode(&rumor.content)
            .map_err(|e| Error::InvalidWelcome(e.to_string()))?,
        None => decode_base64(&rumor.content).map_err(|e| Error::InvalidWelcome(e.to_string()))?,
    };

    let message = MlsMessageIn::tls_deserialize_exact(&raw)
        .map_err(|e| Error::InvalidWelcome(e.to_string()))?;
    match message.extract() {
        MlsMessageBodyIn::Welcome(welcome) => Ok(welcome),
        _ => Err(Error::InvalidWelcome("event does not carry a welcome".into())),
    }
}

/// Hex key package references the welcome was addressed to.
pub fn welcome_key_package_refs(welcome: &Welcome) -> Vec<String> {
    welcome
        .secrets()
        .iter()
        .map(|secrets| hex::encode(secrets.new_member().as_slice()))
        .collect()
}

/// Join a group from a welcome rumor, consuming matching custody material.
///
/// The custody store is searched by the key package references named in
/// the welcome. When `key_package_event_id` is given it is checked
/// against the rumor's `e` tag, catching welcomes routed to the wrong
/// invite.
pub fn join_from_welcome(
    rumor: &Rumor,
    custody: &KeyPackageStore,
    key_package_event_id: Option<EventId>,
) -> Result<GroupState> {
    if let (Some(expected), Some(tagged)) = (key_package_event_id, rumor.tag_value("e")) {
        if tagged != expected.to_hex() {
            return Err(Error::InvalidWelcome(format!(
                "welcome references key package event {tagged}, expected {expected}"
            )));
        }
    }

    let welcome = parse_welcome(rumor)?;

    let refs = welcome_key_package_refs(&welcome);
    let entry = refs
        .iter()
        .find_map(|reference| custody.get(reference).transpose())
        .transpose()?
        .ok_or_else(|| {
            Error::KeyPackageNotFound(format!(
                "no custody entry for any of [{}]",
                refs.join(", ")
            ))
        })?;

    let provider = GarrisonProvider::restore(&entry.mls_snapshot)
        .map_err(|e| Error::CorruptedState(e.to_string()))?;
    let signer = SignatureKeyPair::read(
        provider.storage(),
        &entry.signature_pubkey,
        CIPHERSUITE.signature_algorithm(),
    )
    .ok_or_else(|| Error::CorruptedState("custody entry lost its signature key".into()))?;

    let join_config = MlsGroupJoinConfig::builder()
        .use_ratchet_tree_extension(true)
        .max_past_epochs(MAX_PAST_EPOCHS)
        .build();

    let staged = StagedWelcome::new_from_welcome(&provider, &join_config, welcome, None)
        .map_err(|e| Error::ProcessWelcome(e.to_string()))?;
    let group = staged
        .into_group(&provider)
        .map_err(|e| Error::ProcessWelcome(e.to_string()))?;

    GroupState::from_parts(provider, group, signer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_wrong_kind() {
        let rumor = Rumor::new(Pubkey::from_bytes([1; 32]), Kind(9), vec![], "x".into());
        assert!(matches!(
            parse_welcome(&rumor),
            Err(Error::InvalidWelcome(_))
        ));
    }

    #[test]
    fn test_parse_rejects_garbage_content() {
        let rumor = Rumor::new(
            Pubkey::from_bytes([1; 32]),
            Kind::WELCOME,
            vec![Tag::encoding("base64")],
            encode_base64(b"not a welcome"),
        );
        assert!(matches!(
            parse_welcome(&rumor),
            Err(Error::InvalidWelcome(_))
        ));
    }

    #[test]
    fn test_welcome_rumor_shape() {
        // Build a real welcome by creating a group and adding a member.
        let creator = Pubkey::from_bytes([1; 32]);
        let joiner = Pubkey::from_bytes([2; 32]);
        let data = garrison_proto::GroupData::new(
            "g",
            "",
            vec![creator],
            vec!["wss://relay.example".into()],
        );
        let mut state = GroupState::create(&creator, &data, vec![]).unwrap();

        let generated = crate::key_package::generate_key_package(&joiner, 3600).unwrap();
        let (group, provider, signer) = state.mls_parts();
        let (_commit, welcome, _info) = group
            .add_members(provider, signer, &[generated.key_package.clone()])
            .unwrap();
        group.merge_pending_commit(provider).unwrap();

        let kp_event_id = EventId::from_bytes([9; 32]);
        let rumors = build_welcome_rumors(
            &creator,
            &welcome,
            &data.relays,
            Some(kp_event_id),
            &[joiner],
        )
        .unwrap();

        assert_eq!(rumors.len(), 1);
        let (recipient, rumor) = &rumors[0];
        assert_eq!(*recipient, joiner);
        assert_eq!(rumor.kind, Kind::WELCOME);
        assert_eq!(rumor.pubkey, creator);
        assert_eq!(rumor.tag_value("e"), Some(kp_event_id.to_hex().as_str()));
        assert_eq!(rumor.tag_values("relays"), vec!["wss://relay.example"]);

        // The welcome parses and names the joiner's key package.
        let parsed = parse_welcome(rumor).unwrap();
        assert_eq!(welcome_key_package_refs(&parsed), vec![generated.reference.clone()]);
    }
}
