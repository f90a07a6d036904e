//! Transactions carried by blocks

use std::fmt::{self, Display};

use rand::Rng;
use serde::{Serialize, Serializer};

use crate::{peer::PeerId, scheduler::SimTime};

/// Numeric type used to represent coin amounts and balances.
pub type Coins = f64;

/// Size of every transaction, in KB.
pub const TRANSACTION_SIZE_KB: usize = 1;

/// Opaque, randomly drawn transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(u64);

impl TxnId {
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.gen())
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TxnId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Serialize for TxnId {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Who pays whom.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TxnKind {
    Transfer { sender: PeerId, recipient: PeerId },
    /// Mining reward. Has no sender and only credits the miner.
    Coinbase { miner: PeerId },
}

/// A transfer of coins between peers. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transaction {
    pub id: TxnId,
    pub kind: TxnKind,
    pub amount: Coins,
    pub created_at: SimTime,
}

impl Transaction {
    pub fn transfer(
        id: TxnId,
        sender: PeerId,
        recipient: PeerId,
        amount: Coins,
        created_at: SimTime,
    ) -> Self {
        assert!(
            amount.is_finite() && amount >= 0.0,
            "transaction amount {} must be finite and non-negative",
            amount
        );

        Self {
            id,
            kind: TxnKind::Transfer { sender, recipient },
            amount,
            created_at,
        }
    }

    pub fn coinbase(
        id: TxnId,
        miner: PeerId,
        reward: Coins,
        created_at: SimTime,
    ) -> Self {
        Self {
            id,
            kind: TxnKind::Coinbase { miner },
            amount: reward,
            created_at,
        }
    }

    #[inline]
    pub fn sender(&self) -> Option<PeerId> {
        match self.kind {
            TxnKind::Transfer { sender, .. } => Some(sender),
            TxnKind::Coinbase { .. } => None,
        }
    }

    #[inline]
    pub fn recipient(&self) -> PeerId {
        match self.kind {
            TxnKind::Transfer { recipient, .. } => recipient,
            TxnKind::Coinbase { miner } => miner,
        }
    }

    #[inline]
    pub fn is_coinbase(&self) -> bool {
        matches!(self.kind, TxnKind::Coinbase { .. })
    }

    #[inline]
    pub fn size(&self) -> usize {
        TRANSACTION_SIZE_KB
    }
}

impl Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TxnKind::Transfer { sender, recipient } => write!(
                f,
                "{}: {} pays {} {:.3} coins",
                self.id, sender, recipient, self.amount
            ),
            TxnKind::Coinbase { miner } => {
                write!(
                    f,
                    "{}: {} mines {:.3} coins",
                    self.id, miner, self.amount
                )
            }
        }
    }
}
