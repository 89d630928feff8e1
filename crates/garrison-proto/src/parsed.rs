//! Typed views over the event kinds this protocol recognizes.
//!
//! Raw events are dynamic: an integer kind plus a tag list. Each kind
//! gets one parse function that owns the validation, producing a variant
//! carrying already-validated fields. Everything downstream works with
//! these instead of re-reading tags.

use crate::codec::ContentEncoding;
use crate::event::{Event, EventError, EventId, Kind, Pubkey};
use crate::group_data::NETWORK_GROUP_ID_LEN;

/// A kind-443 key package publication, tags decoded.
#[derive(Debug, Clone)]
pub struct KeyPackagePublication {
    pub event_id: EventId,
    pub author: Pubkey,
    /// MLS protocol version string, e.g. "1.0".
    pub protocol_version: String,
    /// Numeric cipher suite id from the `mls_ciphersuite` tag.
    pub ciphersuite_id: u16,
    /// Extension type ids signaled in the `mls_extensions` tag.
    pub extension_ids: Vec<u16>,
    /// Decoded key package bytes, per the `encoding` tag (hex legacy).
    pub key_package_bytes: Vec<u8>,
    pub relays: Vec<String>,
    pub client_name: Option<String>,
}

impl KeyPackagePublication {
    pub fn parse(event: &Event) -> Result<Self, EventError> {
        event.expect_kind(Kind::KEY_PACKAGE)?;

        let protocol_version = event
            .tag_value("mls_protocol_version")
            .ok_or_else(|| EventError::InvalidPayload("missing mls_protocol_version tag".into()))?
            .to_string();

        let ciphersuite_id = parse_hex_id(
            event
                .tag_value("mls_ciphersuite")
                .ok_or_else(|| EventError::InvalidPayload("missing mls_ciphersuite tag".into()))?,
        )?;

        let extension_ids = event
            .tag_values("mls_extensions")
            .iter()
            .map(|value| parse_hex_id(value))
            .collect::<Result<Vec<u16>, EventError>>()?;

        let encoding = ContentEncoding::from_tag(event.tag_value("encoding"));
        let key_package_bytes = encoding
            .decode(&event.content)
            .map_err(|e| EventError::InvalidPayload(e.to_string()))?;

        Ok(Self {
            event_id: event.id,
            author: event.pubkey,
            protocol_version,
            ciphersuite_id,
            extension_ids,
            key_package_bytes,
            relays: event.tag_values("relays").iter().map(|s| s.to_string()).collect(),
            client_name: event.tag_value("client").map(str::to_string),
        })
    }
}

/// A kind-445 group message envelope.
#[derive(Debug, Clone)]
pub struct GroupMessageEnvelope {
    pub event_id: EventId,
    /// Ephemeral publisher key; never a member identity.
    pub publisher: Pubkey,
    pub created_at: u64,
    /// Network group id from the `h` tag.
    pub group_id: [u8; NETWORK_GROUP_ID_LEN],
    /// Sealed payload decoded from base64 content.
    pub ciphertext: Vec<u8>,
}

impl GroupMessageEnvelope {
    pub fn parse(event: &Event) -> Result<Self, EventError> {
        event.expect_kind(Kind::GROUP_MESSAGE)?;

        let group_hex = event
            .tag_value("h")
            .ok_or_else(|| EventError::InvalidPayload("missing h tag".into()))?;
        let raw = hex::decode(group_hex)
            .map_err(|_| EventError::InvalidPayload("h tag is not hex".into()))?;
        let group_id: [u8; NETWORK_GROUP_ID_LEN] = raw
            .try_into()
            .map_err(|_| EventError::InvalidPayload("h tag is not a 32-byte group id".into()))?;

        let ciphertext = crate::codec::decode_base64(&event.content)
            .map_err(|e| EventError::InvalidPayload(e.to_string()))?;

        Ok(Self {
            event_id: event.id,
            publisher: event.pubkey,
            created_at: event.created_at,
            group_id,
            ciphertext,
        })
    }
}

/// A kind-1059 gift wrap, opaque except for its addressing.
#[derive(Debug, Clone)]
pub struct GiftWrapEnvelope {
    pub event_id: EventId,
    pub recipient: Pubkey,
}

impl GiftWrapEnvelope {
    pub fn parse(event: &Event) -> Result<Self, EventError> {
        event.expect_kind(Kind::GIFT_WRAP)?;
        let recipient = event
            .tag_value("p")
            .ok_or_else(|| EventError::InvalidPayload("missing p tag".into()))
            .and_then(Pubkey::from_hex)?;
        Ok(Self {
            event_id: event.id,
            recipient,
        })
    }
}

/// A kind-10051 key package relay list.
#[derive(Debug, Clone)]
pub struct RelayListEvent {
    pub author: Pubkey,
    pub relays: Vec<String>,
}

impl RelayListEvent {
    pub fn parse(event: &Event) -> Result<Self, EventError> {
        event.expect_kind(Kind::KEY_PACKAGE_RELAYS)?;
        Ok(Self {
            author: event.pubkey,
            relays: event
                .tags
                .iter()
                .filter(|tag| tag.name() == Some("relay"))
                .filter_map(|tag| tag.value())
                .map(str::to_string)
                .collect(),
        })
    }
}

/// A kind-5 deletion request.
#[derive(Debug, Clone)]
pub struct DeletionEvent {
    pub author: Pubkey,
    /// Kinds named by `k` tags.
    pub kinds: Vec<Kind>,
    /// Events named by `e` tags.
    pub event_ids: Vec<EventId>,
}

impl DeletionEvent {
    pub fn parse(event: &Event) -> Result<Self, EventError> {
        event.expect_kind(Kind::DELETION)?;

        let kinds = event
            .tags
            .iter()
            .filter(|tag| tag.name() == Some("k"))
            .filter_map(|tag| tag.value())
            .map(|value| {
                value
                    .parse::<u16>()
                    .map(Kind)
                    .map_err(|_| EventError::InvalidPayload(format!("bad k tag: {value}")))
            })
            .collect::<Result<Vec<Kind>, EventError>>()?;

        let event_ids = event
            .tags
            .iter()
            .filter(|tag| tag.name() == Some("e"))
            .filter_map(|tag| tag.value())
            .map(EventId::from_hex)
            .collect::<Result<Vec<EventId>, EventError>>()?;

        Ok(Self {
            author: event.pubkey,
            kinds,
            event_ids,
        })
    }
}

fn parse_hex_id(value: &str) -> Result<u16, EventError> {
    let trimmed = value.trim_start_matches("0x");
    u16::from_str_radix(trimmed, 16)
        .map_err(|_| EventError::InvalidPayload(format!("bad hex id: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_base64;
    use crate::event::{EphemeralKeys, Tag};

    #[test]
    fn test_key_package_publication_parse() {
        let keys = EphemeralKeys::generate();
        let event = keys.sign(
            Kind::KEY_PACKAGE,
            vec![
                Tag::mls_protocol_version("1.0"),
                Tag::mls_ciphersuite("0x0001"),
                Tag::mls_extensions(&["0x000a".into(), "0xf2ee".into()]),
                Tag::encoding("base64"),
                Tag::relays(&["wss://relay.example".into()]),
                Tag::client("garrison"),
            ],
            encode_base64(&[1, 2, 3]),
        );

        let parsed = KeyPackagePublication::parse(&event).unwrap();
        assert_eq!(parsed.protocol_version, "1.0");
        assert_eq!(parsed.ciphersuite_id, 1);
        assert_eq!(parsed.extension_ids, vec![0x000A, 0xF2EE]);
        assert_eq!(parsed.key_package_bytes, vec![1, 2, 3]);
        assert_eq!(parsed.relays, vec!["wss://relay.example"]);
        assert_eq!(parsed.client_name.as_deref(), Some("garrison"));
    }

    #[test]
    fn test_key_package_publication_legacy_hex() {
        let keys = EphemeralKeys::generate();
        // No encoding tag: hex is the legacy default.
        let event = keys.sign(
            Kind::KEY_PACKAGE,
            vec![
                Tag::mls_protocol_version("1.0"),
                Tag::mls_ciphersuite("0x0001"),
            ],
            "010203".into(),
        );
        let parsed = KeyPackagePublication::parse(&event).unwrap();
        assert_eq!(parsed.key_package_bytes, vec![1, 2, 3]);
    }

    #[test]
    fn test_key_package_publication_missing_tags() {
        let keys = EphemeralKeys::generate();
        let event = keys.sign(Kind::KEY_PACKAGE, vec![], "00".into());
        assert!(matches!(
            KeyPackagePublication::parse(&event),
            Err(EventError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_group_message_parse() {
        let keys = EphemeralKeys::generate();
        let gid = "ab".repeat(32);
        let event = keys.sign(
            Kind::GROUP_MESSAGE,
            vec![Tag::group(&gid)],
            encode_base64(b"sealed"),
        );
        let parsed = GroupMessageEnvelope::parse(&event).unwrap();
        assert_eq!(parsed.group_id, [0xAB; 32]);
        assert_eq!(parsed.ciphertext, b"sealed");
        assert_eq!(parsed.publisher, keys.public_key());
    }

    #[test]
    fn test_group_message_bad_group_id() {
        let keys = EphemeralKeys::generate();
        let event = keys.sign(
            Kind::GROUP_MESSAGE,
            vec![Tag::group("abcd")],
            encode_base64(b"sealed"),
        );
        assert!(GroupMessageEnvelope::parse(&event).is_err());
    }

    #[test]
    fn test_gift_wrap_parse() {
        let keys = EphemeralKeys::generate();
        let recipient = Pubkey::from_bytes([9; 32]);
        let event = keys.sign(Kind::GIFT_WRAP, vec![Tag::recipient(&recipient)], "x".into());
        let parsed = GiftWrapEnvelope::parse(&event).unwrap();
        assert_eq!(parsed.recipient, recipient);
    }

    #[test]
    fn test_gift_wrap_requires_recipient() {
        let keys = EphemeralKeys::generate();
        let event = keys.sign(Kind::GIFT_WRAP, vec![], "x".into());
        assert!(GiftWrapEnvelope::parse(&event).is_err());
    }

    #[test]
    fn test_deletion_parse() {
        let keys = EphemeralKeys::generate();
        let target = EventId::from_bytes([4; 32]);
        let event = keys.sign(
            Kind::DELETION,
            vec![Tag::kind_ref(Kind::KEY_PACKAGE), Tag::event_ref(&target)],
            String::new(),
        );
        let parsed = DeletionEvent::parse(&event).unwrap();
        assert_eq!(parsed.kinds, vec![Kind::KEY_PACKAGE]);
        assert_eq!(parsed.event_ids, vec![target]);
    }

    #[test]
    fn test_relay_list_parse() {
        let keys = EphemeralKeys::generate();
        let event = keys.sign(
            Kind::KEY_PACKAGE_RELAYS,
            vec![Tag::relay("wss://a.example"), Tag::relay("wss://b.example")],
            String::new(),
        );
        let parsed = RelayListEvent::parse(&event).unwrap();
        assert_eq!(parsed.relays, vec!["wss://a.example", "wss://b.example"]);
    }

    #[test]
    fn test_wrong_kind_everywhere() {
        let keys = EphemeralKeys::generate();
        let event = keys.sign(Kind(1), vec![], String::new());
        assert!(KeyPackagePublication::parse(&event).is_err());
        assert!(GroupMessageEnvelope::parse(&event).is_err());
        assert!(GiftWrapEnvelope::parse(&event).is_err());
        assert!(RelayListEvent::parse(&event).is_err());
        assert!(DeletionEvent::parse(&event).is_err());
    }
}
