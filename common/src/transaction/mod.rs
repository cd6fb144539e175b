use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::{MAX_ADDRESS_LENGTH, MAX_MESSAGE_LENGTH, TRANSACTION_VERSION},
    crypto::{Hash, PublicKey, Signature, PUBLIC_KEY_SIZE, SIGNATURE_SIZE},
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::TimestampMillis,
};

pub const TRANSACTION_ID_SIZE: usize = 16;

// Fixed overhead of a packed transaction: everything except the payload.
// version + valid_till + contract_hash + payload length + key + signature + id
pub const EMPTY_TX_LENGTH: usize =
    1 + 8 + 32 + 4 + PUBLIC_KEY_SIZE + SIGNATURE_SIZE + TRANSACTION_ID_SIZE;

/// Terminal and pending states of a transaction row.
///
/// `New` rows belong to the backends; the processor moves each row to
/// exactly one terminal state and never touches it again.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    New,
    Accepted,
    Rejected,
    Invalid,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::New => "new",
            TxStatus::Accepted => "accepted",
            TxStatus::Rejected => "rejected",
            TxStatus::Invalid => "invalid",
        }
    }
}

impl Display for TxStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(TxStatus::New),
            "accepted" => Ok(TxStatus::Accepted),
            "rejected" => Ok(TxStatus::Rejected),
            "invalid" => Ok(TxStatus::Invalid),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxValidationError {
    #[error("Unsupported transaction version {0}")]
    UnsupportedVersion(u8),

    #[error("Transaction expired")]
    Expired,

    #[error("Payload is not a JSON object")]
    BadPayload,

    #[error("Invalid signature")]
    BadSignature,
}

/// A pending transaction as fetched from `basics.transactions`.
///
/// Payload, key and signature are immutable from insert; only the status
/// columns are ever written back, and only by the processor.
#[derive(Clone, Debug)]
pub struct PendingTransaction {
    pub transaction_id: [u8; TRANSACTION_ID_SIZE],
    pub version: u8,
    pub contract_hash: Hash,
    // Milliseconds since epoch, 0 = no expiry
    pub valid_till: TimestampMillis,
    pub payload: String,
    pub public_key: PublicKey,
    pub signature: Signature,
    // Ordering hint assigned at insert
    pub create_ts: TimestampMillis,
}

impl PendingTransaction {
    /// Total packed size in bytes, used for block-size budgeting.
    pub fn packed_size(&self) -> usize {
        EMPTY_TX_LENGTH + self.payload.len()
    }

    /// The canonical packed form that ends up inside a block.
    pub fn pack(&self) -> Vec<u8> {
        self.to_bytes()
    }

    /// Bytes covered by the sender's signature: the packed form without the
    /// key and signature, bound to the chain's sign prefix.
    pub fn signing_payload(&self, sign_prefix: &[u8]) -> Vec<u8> {
        let mut writer = Writer::with_capacity(sign_prefix.len() + self.packed_size());
        writer.write_bytes(sign_prefix);
        writer.write_u8(self.version);
        writer.write_u64(self.valid_till as u64);
        writer.write_hash(&self.contract_hash);
        writer.write_u32(self.payload.len() as u32);
        writer.write_bytes(self.payload.as_bytes());
        writer.write_bytes(&self.transaction_id);
        writer.bytes()
    }

    pub fn verify_signature(&self, sign_prefix: &[u8]) -> bool {
        self.public_key
            .verify(&self.signing_payload(sign_prefix), &self.signature)
    }

    /// Structural validation, run before the contract is ever invoked.
    /// Returns the parsed payload object on success.
    pub fn validate(
        &self,
        block_ts: TimestampMillis,
        sign_prefix: &[u8],
    ) -> Result<serde_json::Map<String, serde_json::Value>, TxValidationError> {
        if self.version != TRANSACTION_VERSION {
            return Err(TxValidationError::UnsupportedVersion(self.version));
        }
        if self.valid_till != 0 && self.valid_till <= block_ts {
            return Err(TxValidationError::Expired);
        }
        let payload: serde_json::Value =
            serde_json::from_str(&self.payload).map_err(|_| TxValidationError::BadPayload)?;
        let object = match payload {
            serde_json::Value::Object(map) => map,
            _ => return Err(TxValidationError::BadPayload),
        };
        if !self.verify_signature(sign_prefix) {
            return Err(TxValidationError::BadSignature);
        }
        Ok(object)
    }

    /// The sender address derived from the transaction's public key.
    pub fn sender(&self) -> crate::crypto::Address {
        self.public_key.address()
    }

    pub fn id_hex(&self) -> String {
        hex::encode(self.transaction_id)
    }
}

impl Serializer for PendingTransaction {
    fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.version);
        writer.write_u64(self.valid_till as u64);
        writer.write_hash(&self.contract_hash);
        writer.write_u32(self.payload.len() as u32);
        writer.write_bytes(self.payload.as_bytes());
        writer.write_bytes(self.public_key.as_bytes());
        writer.write_bytes(self.signature.as_bytes());
        writer.write_bytes(&self.transaction_id);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let version = reader.read_u8()?;
        let valid_till = reader.read_u64()? as TimestampMillis;
        let contract_hash = reader.read_hash()?;
        let payload_len = reader.read_u32()? as usize;
        let payload = reader.read_string(payload_len)?;
        let public_key = PublicKey::from_slice(reader.read_bytes(PUBLIC_KEY_SIZE)?)
            .map_err(|_| ReaderError::InvalidValue("public key"))?;
        let signature = Signature::from_slice(reader.read_bytes(SIGNATURE_SIZE)?)
            .map_err(|_| ReaderError::InvalidValue("signature"))?;
        let transaction_id = reader.read_array::<TRANSACTION_ID_SIZE>()?;
        Ok(PendingTransaction {
            transaction_id,
            version,
            contract_hash,
            valid_till,
            payload,
            public_key,
            signature,
            // not part of the packed form
            create_ts: 0,
        })
    }

    fn size(&self) -> usize {
        self.packed_size()
    }
}

impl Display for PendingTransaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transaction[id: {}, contract: {}, size: {}]",
            self.id_hex(),
            self.contract_hash,
            self.packed_size()
        )
    }
}

/// Extract the optional receiver from a payload: coerced to a string and
/// truncated to the address length; `null` and missing mean absent.
pub fn receiver_of(payload: &serde_json::Map<String, serde_json::Value>) -> Option<String> {
    let value = payload.get("receiver")?;
    let text = match value {
        serde_json::Value::Null => return None,
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some(truncate_utf8(&text, MAX_ADDRESS_LENGTH))
}

/// Sanitise a contract or validation message before it is stored: control
/// characters stripped, truncated to the column limit on a char boundary.
pub fn sanitize_message(message: &str) -> String {
    let clean: String = message.chars().filter(|c| !c.is_control()).collect();
    truncate_utf8(&clean, MAX_MESSAGE_LENGTH)
}

fn truncate_utf8(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
