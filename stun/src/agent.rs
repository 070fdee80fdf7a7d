use std::hash::{Hash, Hasher};

use rand::Rng;

use crate::message::*;

/// Size of a transaction ID on the wire for a modern (RFC 5389) STUN message.
pub const TRANSACTION_ID_SIZE: usize = 12; // 96 bit

/// Size of a legacy (RFC 3489) transaction ID, carried when the magic cookie
/// is absent from the header.
pub const LEGACY_TRANSACTION_ID_SIZE: usize = 16; // 128 bit

/// TransactionId identifies a STUN transaction on the wire. Most messages use
/// the 12-byte RFC 5389 form; decoders must still recognize the 16-byte RFC
/// 3489 form when a message arrives without the magic cookie.
#[derive(Debug, Copy, Clone)]
pub enum TransactionId {
    Rfc5389([u8; TRANSACTION_ID_SIZE]),
    Rfc3489([u8; LEGACY_TRANSACTION_ID_SIZE]),
}

impl Default for TransactionId {
    fn default() -> Self {
        TransactionId::Rfc5389([0u8; TRANSACTION_ID_SIZE])
    }
}

impl TransactionId {
    /// Generates a new random RFC 5389 transaction id.
    pub fn new() -> Self {
        let mut b = [0u8; TRANSACTION_ID_SIZE];
        rand::thread_rng().fill(&mut b);
        TransactionId::Rfc5389(b)
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TransactionId::Rfc5389(b) => b,
            TransactionId::Rfc3489(b) => b,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, TransactionId::Rfc3489(_))
    }
}

impl PartialEq for TransactionId {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}
impl Eq for TransactionId {}

impl Hash for TransactionId {
    // Hash is the low 32 bits, per the transaction ID's data-model contract.
    fn hash<H: Hasher>(&self, state: &mut H) {
        let b = self.as_bytes();
        let n = b.len();
        state.write(&b[n - 4..]);
    }
}

impl Setter for TransactionId {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.transaction_id = *self;
        m.write_transaction_id();
        Ok(())
    }
}
