use std::fmt::{self, Display};

use serde::{Serialize, Serializer};

use crate::{peer::PeerId, scheduler::SimTime, transaction::Transaction};

/// Fixed per-block header overhead, in KB.
pub const BLOCK_HEADER_SIZE_KB: usize = 1;

/// Representation of a mined block of transactions.
#[derive(Debug, Clone)]
pub struct Block {
    /// Digest of the block's contents.
    pub id: BlockId,
    /// `None` only for the genesis block.
    pub parent: Option<BlockId>,
    /// The transactions contained within this block, in order.
    pub txns: Vec<Transaction>,
    /// Simulated time at which the block was created.
    pub timestamp: SimTime,
    /// The miner of this block. `None` only for the genesis block.
    pub miner: Option<PeerId>,
    /// Set when the block was mined under a withholding strategy.
    pub private: bool,
}

/// A unique identifier assigned to each [`Block`], derived from the block's
/// parent, timestamp, miner, transaction ids and a random nonce.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct BlockId(u64);

impl BlockId {
    fn derive(
        parent: Option<BlockId>,
        timestamp: SimTime,
        miner: Option<PeerId>,
        txns: &[Transaction],
        nonce: u64,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        if let Some(parent) = parent {
            hasher.update(&parent.0.to_le_bytes());
        }
        hasher.update(&timestamp.as_millis().to_bits().to_le_bytes());
        if let Some(miner) = miner {
            hasher.update(&(miner.get() as u64).to_le_bytes());
        }
        for txn in txns {
            hasher.update(&txn.id.get().to_le_bytes());
        }
        hasher.update(&nonce.to_le_bytes());

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hasher.finalize().as_bytes()[..8]);

        BlockId(u64::from_le_bytes(bytes))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Serialize for BlockId {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl Block {
    /// Creates the genesis block: no parent, no transactions, timestamp zero.
    pub fn genesis() -> Self {
        let id = BlockId::derive(None, SimTime::ZERO, None, &[], 0);

        Block {
            id,
            parent: None,
            txns: vec![],
            timestamp: SimTime::ZERO,
            miner: None,
            private: false,
        }
    }

    /// Creates a block on top of `parent`. `nonce` should come from a
    /// high-entropy source so that separate mining attempts never collide.
    pub fn new(
        parent: BlockId,
        txns: Vec<Transaction>,
        timestamp: SimTime,
        miner: PeerId,
        private: bool,
        nonce: u64,
    ) -> Self {
        let id =
            BlockId::derive(Some(parent), timestamp, Some(miner), &txns, nonce);

        Block {
            id,
            parent: Some(parent),
            txns,
            timestamp,
            miner: Some(miner),
            private,
        }
    }

    #[inline]
    pub fn is_genesis(&self) -> bool {
        self.parent.is_none()
    }

    /// Size in KB: one per transaction plus the header.
    #[inline]
    pub fn size(&self) -> usize {
        self.txns.iter().map(|txn| txn.size()).sum::<usize>()
            + BLOCK_HEADER_SIZE_KB
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Block {}

impl Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.parent, self.miner) {
            (Some(parent), Some(miner)) => write!(
                f,
                "block {} (parent {}, miner {}, {} txns)",
                self.id,
                parent,
                miner,
                self.txns.len()
            ),
            _ => write!(f, "genesis block {}", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Block;
    use crate::{
        peer::PeerId,
        scheduler::SimTime,
        transaction::{Transaction, TxnId},
    };

    #[test]
    fn genesis_is_stable() {
        assert_eq!(Block::genesis().id, Block::genesis().id);
        assert!(Block::genesis().is_genesis());
        assert_eq!(Block::genesis().size(), 1);
    }

    #[test]
    fn nonce_separates_identical_contents() {
        let genesis = Block::genesis();
        let txn = Transaction::coinbase(
            TxnId::from(1),
            PeerId::from(0),
            50.0,
            SimTime::from_millis(3.0),
        );
        let t = SimTime::from_millis(3.0);

        let a = Block::new(genesis.id, vec![txn], t, PeerId::from(0), false, 1);
        let b = Block::new(genesis.id, vec![txn], t, PeerId::from(0), false, 2);
        let c = Block::new(genesis.id, vec![txn], t, PeerId::from(0), false, 1);

        assert_ne!(a.id, b.id);
        assert_eq!(a.id, c.id);
        assert_eq!(a.size(), 2);
    }
}
