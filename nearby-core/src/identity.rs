//! Peer identity and link crypto: peer IDs, keypairs, session keys, frame encryption.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::info::{DisplayName, ValidationError};

/// Peer ID: random 128-bit identifier generated once per node.
/// Carried explicitly in every announcement, invitation and link hello; never derived
/// from a transport address.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn random() -> Self {
        PeerId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(PeerId)
    }
}

/// Link public key (32 bytes, X25519). Announced so peers can derive a session key.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// X25519 keypair for link encryption. The secret never leaves this struct.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Shared secret with another peer's public key. Used to derive the link key.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Everything that identifies the local node: stable ID, current display name, link keypair.
pub struct LocalIdentity {
    peer_id: PeerId,
    display_name: DisplayName,
    keypair: Arc<Keypair>,
}

impl LocalIdentity {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn display_name(&self) -> &DisplayName {
        &self.display_name
    }

    pub fn set_display_name(&mut self, name: DisplayName) {
        self.display_name = name;
    }

    /// Shared with link tasks, which run the handshake outside the core.
    pub fn keypair(&self) -> &Arc<Keypair> {
        &self.keypair
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("peer_id", &self.peer_id)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

/// Create the local identity: validate the display name, generate a fresh peer ID and keypair.
pub fn create_identity(display_name: &str) -> Result<LocalIdentity, ValidationError> {
    Ok(LocalIdentity {
        peer_id: PeerId::random(),
        display_name: DisplayName::new(display_name)?,
        keypair: Arc::new(Keypair::generate()),
    })
}

/// Derive the 32-byte link key from an X25519 shared secret.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"nearby-link-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Which side of a link produced a frame. Part of the nonce so the two directions,
/// which share one key, never reuse a nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Frames written by the peer that opened the TCP connection.
    Initiator,
    /// Frames written by the peer that accepted it.
    Responder,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Initiator => Direction::Responder,
            Direction::Responder => Direction::Initiator,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Direction::Initiator => 0x01,
            Direction::Responder => 0x02,
        }
    }
}

fn nonce_bytes(direction: Direction, counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[0] = direction.tag();
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Frame encryption: ChaCha20-Poly1305, nonce = direction tag + 64-bit counter. Never reuse a counter.
pub fn encrypt_wire(
    key: &[u8; 32],
    direction: Direction,
    counter: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce = nonce_bytes(direction, counter);
    cipher
        .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

/// Frame decryption; fails on tampering, wrong key, wrong direction or out-of-sequence counter.
pub fn decrypt_wire(
    key: &[u8; 32],
    direction: Direction,
    counter: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce = nonce_bytes(direction, counter);
    cipher
        .decrypt(chacha20poly1305::Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}
