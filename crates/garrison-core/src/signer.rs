//! Identity signer seam and the local implementation.
//!
//! The core never holds long-term identity keys directly: signing and
//! gift-wrap handling go through [`Signer`], which an application may
//! back with a hardware key or an out-of-process prompt (which is why
//! unwrapping is a separate, caller-timed step in the inbox).
//!
//! [`LocalSigner`] keeps an Ed25519 identity in memory. Gift wraps are
//! sealed to the recipient's identity by converting the Ed25519 keys to
//! X25519: a fresh ephemeral key pair per wrap, HKDF-SHA256 over the
//! shared secret, XChaCha20-Poly1305 over the inner rumor. The wrap event
//! itself is signed by a one-shot key, so observers see neither sender
//! nor any linkable publisher.

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305,
};
use ed25519_dalek::{SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{x25519, PublicKey as X25519Public, StaticSecret};

use garrison_proto::codec::{decode_base64, encode_base64};
use garrison_proto::{EphemeralKeys, Event, Kind, Pubkey, Rumor, Tag};

use crate::error::{Error, Result};

/// Domain separation label for gift wrap key derivation.
const GIFT_WRAP_LABEL: &[u8] = b"garrison-gift-wrap-v1";

const PUBKEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;

/// Identity operations the core delegates to the application.
#[async_trait]
pub trait Signer: Send + Sync {
    /// The identity this signer controls.
    async fn public_key(&self) -> Result<Pubkey>;

    /// Sign a rumor authored by this identity into a publishable event.
    async fn sign_event(&self, rumor: Rumor) -> Result<Event>;

    /// Seal a rumor into a kind-1059 gift wrap for `recipient`.
    async fn gift_wrap(&self, recipient: &Pubkey, rumor: Rumor) -> Result<Event>;

    /// Unwrap a gift wrap addressed to this identity.
    async fn unwrap_gift(&self, event: &Event) -> Result<Rumor>;
}

/// In-memory Ed25519 signer.
pub struct LocalSigner {
    signing: SigningKey,
}

impl LocalSigner {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Build from 32 secret seed bytes.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// The identity public key.
    pub fn identity(&self) -> Pubkey {
        Pubkey::from_bytes(self.signing.verifying_key().to_bytes())
    }
}

/// X25519 public key equivalent of an Ed25519 identity.
fn identity_exchange_key(identity: &Pubkey) -> Result<[u8; 32]> {
    let verifying = VerifyingKey::from_bytes(identity.as_bytes())
        .map_err(|e| Error::Signer(format!("identity is not a valid key: {e}")))?;
    Ok(verifying.to_montgomery().to_bytes())
}

fn wrap_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(GIFT_WRAP_LABEL), shared_secret);
    let mut key = [0u8; 32];
    hk.expand(&[], &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

/// Seal `plaintext` to a recipient identity.
///
/// Payload layout: `ephemeral_pubkey (32) ‖ nonce (24) ‖ ciphertext`.
fn seal_to_identity(recipient: &Pubkey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let recipient_exchange = identity_exchange_key(recipient)?;

    let mut rng = rand::thread_rng();
    let mut ephemeral_seed = [0u8; 32];
    rng.fill_bytes(&mut ephemeral_seed);
    let ephemeral_secret = StaticSecret::from(ephemeral_seed);
    let ephemeral_public = X25519Public::from(&ephemeral_secret);

    let shared = ephemeral_secret.diffie_hellman(&X25519Public::from(recipient_exchange));
    let key = wrap_key(shared.as_bytes());

    let mut nonce = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce);

    let cipher = XChaCha20Poly1305::new(&key.into());
    let ciphertext = cipher
        .encrypt(&nonce.into(), plaintext)
        .map_err(|e| Error::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(PUBKEY_SIZE + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a payload sealed to this signing key's identity.
fn open_for_identity(signing: &SigningKey, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < PUBKEY_SIZE + NONCE_SIZE {
        return Err(Error::Unreadable("gift wrap payload too short".into()));
    }
    let ephemeral_public: [u8; 32] = payload[..PUBKEY_SIZE].try_into().expect("checked length");
    let nonce: [u8; NONCE_SIZE] = payload[PUBKEY_SIZE..PUBKEY_SIZE + NONCE_SIZE]
        .try_into()
        .expect("checked length");
    let ciphertext = &payload[PUBKEY_SIZE + NONCE_SIZE..];

    let shared = x25519(signing.to_scalar_bytes(), ephemeral_public);
    let key = wrap_key(&shared);

    let cipher = XChaCha20Poly1305::new(&key.into());
    cipher
        .decrypt(&nonce.into(), ciphertext)
        .map_err(|_| Error::Unreadable("gift wrap decryption failed".into()))
}

#[async_trait]
impl Signer for LocalSigner {
    async fn public_key(&self) -> Result<Pubkey> {
        Ok(self.identity())
    }

    async fn sign_event(&self, rumor: Rumor) -> Result<Event> {
        if rumor.pubkey != self.identity() {
            return Err(Error::Signer(format!(
                "rumor author {} is not this signer",
                rumor.pubkey
            )));
        }
        let keys = EphemeralKeys::from_seed(self.signing.to_bytes());
        Ok(keys.sign_at(rumor.kind, rumor.tags, rumor.content, rumor.created_at))
    }

    async fn gift_wrap(&self, recipient: &Pubkey, rumor: Rumor) -> Result<Event> {
        let sealed = seal_to_identity(recipient, &rumor.serialize())?;
        let one_shot = EphemeralKeys::generate();
        Ok(one_shot.sign(
            Kind::GIFT_WRAP,
            vec![Tag::recipient(recipient)],
            encode_base64(&sealed),
        ))
    }

    async fn unwrap_gift(&self, event: &Event) -> Result<Rumor> {
        event.expect_kind(Kind::GIFT_WRAP)?;
        let payload =
            decode_base64(&event.content).map_err(|e| Error::Unreadable(e.to_string()))?;
        let plaintext = open_for_identity(&self.signing, &payload)?;
        let rumor = Rumor::deserialize(&plaintext)
            .map_err(|e| Error::InvalidApplicationData(e.to_string()))?;
        if !rumor.id_is_consistent() {
            return Err(Error::InvalidApplicationData(
                "inner rumor id does not match its content".into(),
            ));
        }
        Ok(rumor)
    }
}
