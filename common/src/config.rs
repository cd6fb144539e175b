use crate::crypto::Hash;

// Canonical encoding versions
pub const BLOCK_VERSION: u8 = 1;
pub const TRANSACTION_VERSION: u8 = 1;

// Distinguished contract hashes
// A transaction addressed to the all-zero hash creates a contract,
// one addressed to the all-0xFF hash deletes a contract.
pub const CREATE_CONTRACT_HASH: Hash = Hash::zero();
pub const DELETE_CONTRACT_HASH: Hash = Hash::max();

// Millis per second, to avoid random 1000 values everywhere
pub const MILLIS_PER_SECOND: i64 = 1000;

// Slack applied to the pacing and emission gates of the mining loop.
// Empirical: avoids block bunching right after a catch-up.
pub const PACING_SLACK_MILLIS: i64 = 500;

// Slack before the admission deadline: stop admitting transactions this
// long before the block has to close so signing and committing still fit.
pub const ADMISSION_SLACK_MILLIS: i64 = 100;

// The sign prefix is bound into every signature and hash; it must fit in
// a single length-prefixed byte on the wire.
pub const MAX_SIGN_PREFIX_LENGTH: usize = 255;

// Addresses are base58check strings and never exceed this length
pub const MAX_ADDRESS_LENGTH: usize = 35;

// Upper bound for a sanitised transaction message, in UTF-8 bytes
pub const MAX_MESSAGE_LENGTH: usize = 128;
