//! Symmetric envelope around MLS messages.
//!
//! Every kind-445 event carries an MLS message sealed under a key derived
//! from the group's exporter secret. The exporter output is treated as
//! the private half of an X25519 pair, the public half is derived from
//! it, and the conversation key is the Diffie-Hellman of the two run
//! through HKDF-SHA256. That construction gives a secret every current
//! member can compute and nobody else can.
//!
//! The sealed payload is `nonce (24) ‖ ciphertext` under
//! XChaCha20-Poly1305, base64 in the event content. Events are signed by
//! a one-shot key pair so the publisher never links to an identity.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305,
};
use hkdf::Hkdf;
use openmls::prelude::tls_codec::{Deserialize as TlsDeserialize, Serialize as TlsSerialize};
use openmls::prelude::{MlsMessageIn, MlsMessageOut};
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use garrison_proto::codec::encode_base64;
use garrison_proto::{EphemeralKeys, Event, GroupMessageEnvelope, Kind, Tag};

use crate::error::{Error, Result};
use crate::group::GroupState;

/// Domain separation label for the conversation key derivation.
const ENVELOPE_LABEL: &[u8] = b"garrison-envelope-v1";

const NONCE_SIZE: usize = 24;

/// Derive the conversation key from an exporter secret.
///
/// Deterministic: all members holding the same exporter secret derive the
/// same key.
pub fn conversation_key(exporter_secret: &[u8; 32]) -> [u8; 32] {
    let private = StaticSecret::from(*exporter_secret);
    let public = X25519Public::from(&private);
    let shared = private.diffie_hellman(&public);

    let hk = Hkdf::<Sha256>::new(Some(ENVELOPE_LABEL), shared.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(&[], &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

/// Seal plaintext under a conversation key. Output: nonce ‖ ciphertext.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = XChaCha20Poly1305::new(key.into());
    let ciphertext = cipher
        .encrypt(&nonce.into(), plaintext)
        .map_err(|e| Error::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed payload. All failures are unreadable.
pub fn open(key: &[u8; 32], payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < NONCE_SIZE {
        return Err(Error::Unreadable("payload shorter than nonce".into()));
    }
    let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);
    let nonce: [u8; NONCE_SIZE] = nonce.try_into().expect("split at nonce size");

    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(&nonce.into(), ciphertext)
        .map_err(|_| Error::Unreadable("authenticated decryption failed".into()))
}

/// Seal an MLS message into a signed kind-445 event for the group.
pub fn seal_group_event(state: &mut GroupState, message: &MlsMessageOut) -> Result<Event> {
    seal_group_event_at(state, message, garrison_proto::event::unix_now())
}

/// Seal an MLS message with an explicit timestamp.
pub fn seal_group_event_at(
    state: &mut GroupState,
    message: &MlsMessageOut,
    created_at: u64,
) -> Result<Event> {
    let serialized = message
        .tls_serialize_detached()
        .map_err(|e| Error::Serialization(e.to_string()))?;

    let exporter = state.exporter_secret()?;
    let key = conversation_key(&exporter);
    let sealed = seal(&key, &serialized)?;

    let keys = EphemeralKeys::generate();
    Ok(keys.sign_at(
        Kind::GROUP_MESSAGE,
        vec![Tag::group(&state.group_id_hex())],
        encode_base64(&sealed),
        created_at,
    ))
}

/// Decrypt a kind-445 event to the serialized MLS message it carries.
///
/// Tries the current epoch's key first, then recorded prior epochs, so
/// messages that crossed a commit on the wire still decrypt. Every
/// failure mode maps to [`Error::Unreadable`].
pub fn open_group_payload(state: &mut GroupState, event: &Event) -> Result<Vec<u8>> {
    let envelope =
        GroupMessageEnvelope::parse(event).map_err(|e| Error::Unreadable(e.to_string()))?;
    if envelope.group_id.as_slice() != state.group_id() {
        return Err(Error::Unreadable("envelope addresses another group".into()));
    }
    let payload = envelope.ciphertext;

    // Make sure the current epoch is recorded before walking history.
    state.exporter_secret()?;

    let mut last_error = Error::Unreadable("no exporter secret available".into());
    for epoch in state.known_epochs() {
        let Some(exporter) = state.exporter_secret_at(epoch) else {
            continue;
        };
        let key = conversation_key(&exporter);
        match open(&key, &payload) {
            Ok(plaintext) => return Ok(plaintext),
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

/// Open a kind-445 event back into an MLS message.
pub fn open_group_event(state: &mut GroupState, event: &Event) -> Result<MlsMessageIn> {
    let plaintext = open_group_payload(state, event)?;
    MlsMessageIn::tls_deserialize_exact(&plaintext).map_err(|e| Error::Unreadable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use garrison_proto::{GroupData, Pubkey};

    #[test]
    fn test_conversation_key_is_deterministic() {
        let secret = [7u8; 32];
        assert_eq!(conversation_key(&secret), conversation_key(&secret));
        assert_ne!(conversation_key(&secret), conversation_key(&[8u8; 32]));
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = conversation_key(&[1u8; 32]);
        let sealed = seal(&key, b"the plaintext").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"the plaintext");
    }

    #[test]
    fn test_open_with_wrong_key_is_unreadable() {
        let sealed = seal(&conversation_key(&[1u8; 32]), b"secret").unwrap();
        let result = open(&conversation_key(&[2u8; 32]), &sealed);
        assert!(matches!(result, Err(Error::Unreadable(_))));
    }

    #[test]
    fn test_open_truncated_payload_is_unreadable() {
        let key = conversation_key(&[1u8; 32]);
        assert!(matches!(open(&key, &[1, 2, 3]), Err(Error::Unreadable(_))));
    }

    #[test]
    fn test_sealed_payloads_differ_per_call() {
        let key = conversation_key(&[3u8; 32]);
        let a = seal(&key, b"same").unwrap();
        let b = seal(&key, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_group_event_shape() {
        let creator = Pubkey::from_bytes([5; 32]);
        let data = GroupData::new("g", "", vec![creator], vec!["wss://r.example".into()]);
        let mut state = GroupState::create(&creator, &data, vec![]).unwrap();

        let (group, provider, signer) = state.mls_parts();
        let message = group
            .create_message(provider, signer, b"app data")
            .unwrap();
        let event = seal_group_event(&mut state, &message).unwrap();

        assert_eq!(event.kind, Kind::GROUP_MESSAGE);
        assert_eq!(event.tag_value("h"), Some(data.network_group_id_hex().as_str()));
        // The publisher key is ephemeral, never the member identity.
        assert_ne!(event.pubkey, creator);
        event.verify().unwrap();
    }
}
