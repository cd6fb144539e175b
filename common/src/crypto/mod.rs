mod hash;
mod keys;

pub use hash::{sha256, sha256d, Hash, HASH_SIZE};
pub use keys::{
    Address, CryptoError, PrivateKey, PublicKey, Signature, PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};
