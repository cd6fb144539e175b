//! secp256k1 keys, signatures and base58check addresses.
//!
//! The processor signs blocks with a compressed secp256k1 key imported from
//! WIF (prefix 0x80, compressed flag). Transaction senders are identified by
//! the base58check address of their compressed public key.

use std::fmt;

use libsecp256k1::{Message, SecretKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

use super::hash::sha256;

/// Size of a compressed secp256k1 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 33;

/// Size of a compact ECDSA signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

// base58check version bytes
const ADDRESS_VERSION: u8 = 0x00;
const WIF_VERSION: u8 = 0x80;
const WIF_COMPRESSED_FLAG: u8 = 0x01;

#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    #[error("Invalid base58 string")]
    InvalidBase58,

    #[error("Invalid base58check checksum")]
    InvalidChecksum,

    #[error("Invalid WIF private key")]
    InvalidWif,

    #[error("Invalid public key length: expected {}, got {}", PUBLIC_KEY_SIZE, _0)]
    InvalidPublicKeyLength(usize),

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid signature length: expected {}, got {}", SIGNATURE_SIZE, _0)]
    InvalidSignatureLength(usize),
}

fn base58check_encode(payload: &[u8]) -> String {
    let checksum = Sha256::digest(Sha256::digest(payload));
    let mut bytes = payload.to_vec();
    bytes.extend_from_slice(&checksum[..4]);
    bs58::encode(bytes).into_string()
}

fn base58check_decode(encoded: &str) -> Result<Vec<u8>, CryptoError> {
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| CryptoError::InvalidBase58)?;
    if bytes.len() < 5 {
        return Err(CryptoError::InvalidChecksum);
    }
    let (payload, checksum) = bytes.split_at(bytes.len() - 4);
    let expected = Sha256::digest(Sha256::digest(payload));
    if checksum != &expected[..4] {
        return Err(CryptoError::InvalidChecksum);
    }
    Ok(payload.to_vec())
}

/// A compressed secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Wrap 33 key bytes. The curve-point check happens at verify time so a
    /// malformed key degrades to a failed signature instead of blocking the
    /// row it came from.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; PUBLIC_KEY_SIZE] = slice
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKeyLength(slice.len()))?;
        Ok(PublicKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a compact signature over `data`.
    ///
    /// The signed message is SHA-256(data); `data` already carries the sign
    /// prefix when it is a canonical signing payload.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        let message = Message::parse(sha256(data).as_bytes());
        let parsed = match libsecp256k1::Signature::parse_standard(&signature.0) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        match libsecp256k1::PublicKey::parse_compressed(&self.0) {
            Ok(key) => libsecp256k1::verify(&message, &parsed, &key),
            Err(_) => false,
        }
    }

    /// Derive the base58check address of this key (version byte 0x00 over
    /// RIPEMD-160(SHA-256(key))).
    pub fn address(&self) -> Address {
        let sha = Sha256::digest(self.0);
        let rip = Ripemd160::digest(sha);
        let mut payload = Vec::with_capacity(1 + rip.len());
        payload.push(ADDRESS_VERSION);
        payload.extend_from_slice(&rip);
        Address(base58check_encode(&payload))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A compact 64-byte ECDSA signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    pub const fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Signature(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; SIGNATURE_SIZE] = slice
            .try_into()
            .map_err(|_| CryptoError::InvalidSignatureLength(slice.len()))?;
        Ok(Signature(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

/// The processor's signing key.
///
/// Imported from WIF; the intermediate decoded buffer is zeroized and the
/// Debug impl never prints key material.
#[derive(Clone)]
pub struct PrivateKey {
    secret: SecretKey,
    public: PublicKey,
}

impl PrivateKey {
    fn from_secret(secret: SecretKey) -> Self {
        let public = libsecp256k1::PublicKey::from_secret_key(&secret);
        PrivateKey {
            secret,
            public: PublicKey(public.serialize_compressed()),
        }
    }

    /// Import a compressed-key WIF string (0x80 | key | 0x01 | checksum).
    pub fn from_wif(wif: &str) -> Result<Self, CryptoError> {
        let payload = Zeroizing::new(base58check_decode(wif)?);
        // version byte + 32 key bytes + compressed flag
        if payload.len() != 34
            || payload[0] != WIF_VERSION
            || payload[33] != WIF_COMPRESSED_FLAG
        {
            return Err(CryptoError::InvalidWif);
        }
        let mut bytes = Zeroizing::new([0u8; 32]);
        bytes.copy_from_slice(&payload[1..33]);
        let secret = SecretKey::parse(&bytes).map_err(|_| CryptoError::InvalidWif)?;
        Ok(PrivateKey::from_secret(secret))
    }

    /// Export as WIF. Only used by tooling and tests.
    pub fn to_wif(&self) -> String {
        let mut payload = Zeroizing::new(Vec::with_capacity(34));
        payload.push(WIF_VERSION);
        payload.extend_from_slice(&self.secret.serialize());
        payload.push(WIF_COMPRESSED_FLAG);
        base58check_encode(&payload)
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        PrivateKey::from_secret(SecretKey::random(&mut rand::rngs::OsRng))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn address(&self) -> Address {
        self.public.address()
    }

    /// Sign SHA-256(data) with deterministic ECDSA.
    pub fn sign(&self, data: &[u8]) -> Signature {
        let message = Message::parse(sha256(data).as_bytes());
        let (signature, _) = libsecp256k1::sign(&message, &self.secret);
        Signature(signature.serialize())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("secret", &"[REDACTED]")
            .field("address", &self.address())
            .finish()
    }
}

/// A base58check account address (at most 35 characters).
#[derive(Clone, PartialEq, Eq, Debug, Hash, serde::Serialize, serde::Deserialize)]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
