/*!
Per-peer block tree and the state derived along each branch

Every peer owns its own [`Blockchain`]. Each accepted block is stored together
with [`BlockData`], which is computed once from the parent's data at
acceptance time and never changed afterwards: the length of the chain ending
at the block, the balance of every participant, and the set of transactions
included on the path from the genesis block.
*/

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ops::Index,
    sync::Arc,
};

use log::debug;
use thiserror::Error;

use crate::{
    block::{Block, BlockId},
    peer::PeerId,
    scheduler::SimTime,
    transaction::{Coins, Transaction, TxnId, TxnKind},
};

/// Balance of every participant. Ordered for reproducible exports.
pub type Balances = BTreeMap<PeerId, Coins>;

/// Tolerance used when comparing coinbase amounts to the configured reward.
const EPSILON_COINS: Coins = 1e-9;

/// A block and its derived state as held within a [`Blockchain`].
#[derive(Debug, Clone)]
pub struct BlockData {
    pub block: Arc<Block>,
    /// Number of blocks on the path from the genesis block to `block`,
    /// both included.
    pub chain_length: u64,
    /// Balances after applying every transaction on the path.
    pub balances: Balances,
    /// Every transaction on the path.
    pub included: HashSet<TxnId>,
    /// Simulated time at which the owning peer accepted the block.
    pub arrived_at: SimTime,
}

/// Reasons a block is not accepted into a [`Blockchain`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BlockValidationError {
    #[error("parent {0} is not in this chain")]
    MissingParent(BlockId),
    #[error("block does not reference a parent block")]
    NoParentGiven,
    #[error("block {0} is already in this chain")]
    Duplicate(BlockId),
    #[error("transaction {txn} spends {amount} but the sender holds {balance}")]
    InsufficientBalance { txn: TxnId, amount: Coins, balance: Coins },
    #[error("transaction {0} is already included on this branch")]
    DoubleInclusion(TxnId),
    #[error("block carries an invalid coinbase transaction")]
    InvalidCoinbase,
    #[error("ancestor {0} was rejected")]
    InvalidAncestor(BlockId),
}

impl BlockValidationError {
    /// True for errors which mean the block can never be accepted on any
    /// peer, as opposed to missing or duplicate blocks.
    pub fn is_invalid(&self) -> bool {
        !matches!(self, Self::MissingParent(_) | Self::Duplicate(_))
    }
}

/// Block tree of a single peer, plus the blocks buffered while waiting for
/// their parent.
#[derive(Debug, Clone)]
pub struct Blockchain {
    genesis: BlockId,
    reward: Coins,
    blocks: HashMap<BlockId, BlockData>,
    /// IDs of all blocks in the chain, in the order they were accepted.
    accepted: Vec<BlockId>,
    /// Blocks whose parent has not arrived yet, in arrival order.
    pending: Vec<Arc<Block>>,
    /// Blocks which failed validation, and everything built on them.
    rejected: HashSet<BlockId>,
}

impl Blockchain {
    /// Creates a chain containing only `genesis`, whose derived balances are
    /// `allocation`. Coinbase transactions must pay exactly `reward`.
    pub fn new(
        genesis: Arc<Block>,
        allocation: Balances,
        reward: Coins,
    ) -> Self {
        assert!(genesis.is_genesis(), "{} has a parent", genesis);

        let id = genesis.id;
        let data = BlockData {
            block: genesis,
            chain_length: 1,
            balances: allocation,
            included: HashSet::new(),
            arrived_at: SimTime::ZERO,
        };

        Blockchain {
            genesis: id,
            reward,
            blocks: HashMap::from([(id, data)]),
            accepted: vec![id],
            pending: vec![],
            rejected: HashSet::new(),
        }
    }

    #[inline]
    pub fn genesis(&self) -> BlockId {
        self.genesis
    }

    #[inline]
    pub fn reward(&self) -> Coins {
        self.reward
    }

    #[inline]
    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    #[inline]
    pub fn get(&self, id: BlockId) -> Option<&BlockData> {
        self.blocks.get(&id)
    }

    #[inline]
    pub fn chain_length(&self, id: BlockId) -> Option<u64> {
        self.blocks.get(&id).map(|data| data.chain_length)
    }

    #[inline]
    pub fn balances(&self, id: BlockId) -> Option<&Balances> {
        self.blocks.get(&id).map(|data| &data.balances)
    }

    /// Number of accepted blocks, genesis included.
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Accepted blocks in acceptance order.
    pub fn iter(&self) -> impl Iterator<Item = &BlockData> + '_ {
        self.accepted.iter().map(|id| &self.blocks[id])
    }

    /// Blocks buffered while their parent is missing.
    pub fn pending(&self) -> &[Arc<Block>] {
        &self.pending
    }

    #[inline]
    pub fn is_pending(&self, id: BlockId) -> bool {
        self.pending.iter().any(|block| block.id == id)
    }

    /// Returns true if `id` failed validation or descends from a block
    /// which did.
    #[inline]
    pub fn is_rejected(&self, id: BlockId) -> bool {
        self.rejected.contains(&id)
    }

    /// Returns the IDs of all blocks on the path from the genesis block to
    /// the given block, in ascending order of chain length.
    ///
    /// ## Panics
    /// If a block with ID `id` is not present on the chain.
    pub fn ancestors_of(&self, id: BlockId) -> Vec<BlockId> {
        assert!(self.contains(id), "chain does not contain block {}", id);

        let mut ancestors = vec![id];
        let mut curr = id;
        while let Some(parent) = self.blocks[&curr].block.parent {
            ancestors.push(parent);
            curr = parent;
        }

        ancestors.reverse();
        ancestors
    }

    /// Checks whether `block` could be accepted right now.
    pub fn validate(&self, block: &Block) -> Result<(), BlockValidationError> {
        self.check(block).map(|_| ())
    }

    /// Validates and accepts `block`, then retries every buffered block.
    /// Returns the IDs of all blocks accepted by this call, `block` first.
    ///
    /// A block whose parent is missing is buffered and
    /// [`BlockValidationError::MissingParent`] is returned. Invalid blocks
    /// are remembered, so their descendants are rejected as well, whether
    /// they arrive later or are already buffered.
    pub fn insert(
        &mut self,
        block: Arc<Block>,
        now: SimTime,
    ) -> Result<Vec<BlockId>, BlockValidationError> {
        let (chain_length, balances) = match self.check(&block) {
            Ok(derived) => derived,
            Err(BlockValidationError::MissingParent(parent))
                if self.is_rejected(parent) =>
            {
                self.reject(block.id);
                return Err(BlockValidationError::InvalidAncestor(parent));
            }
            Err(err @ BlockValidationError::MissingParent(_)) => {
                if !self.is_pending(block.id) {
                    debug!("buffering {}: {}", block, err);
                    self.pending.push(block);
                }
                return Err(err);
            }
            Err(err) => {
                if err.is_invalid() {
                    self.reject(block.id);
                }
                return Err(err);
            }
        };

        let mut accepted = vec![block.id];
        self.apply(block, chain_length, balances, now);
        self.retry_pending(now, &mut accepted);

        Ok(accepted)
    }

    /// Removes `id` from the chain, returning its data. The genesis block
    /// cannot be removed.
    pub fn remove(&mut self, id: BlockId) -> Option<BlockData> {
        if id == self.genesis {
            return None;
        }

        let data = self.blocks.remove(&id)?;
        self.accepted.retain(|&block_id| block_id != id);

        Some(data)
    }

    /// Chooses the transactions a new block on top of `parent` should carry:
    /// ordered by creation time, skipping coinbases, transactions already
    /// on the branch, and transfers the sender cannot currently afford.
    ///
    /// ## Panics
    /// If `parent` is not present on the chain.
    pub fn select_transactions<'a, I>(
        &self,
        parent: BlockId,
        candidates: I,
    ) -> Vec<Transaction>
    where
        I: IntoIterator<Item = &'a Transaction>,
    {
        let parent = &self.blocks[&parent];

        let mut candidates: Vec<_> = candidates
            .into_iter()
            .filter(|txn| !txn.is_coinbase())
            .filter(|txn| !parent.included.contains(&txn.id))
            .copied()
            .collect();
        candidates.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
        });

        let mut balances = parent.balances.clone();
        candidates
            .into_iter()
            .filter(|txn| {
                let TxnKind::Transfer { sender, recipient } = txn.kind else {
                    return false;
                };
                let balance = balances.get(&sender).copied().unwrap_or(0.0);
                if balance < txn.amount {
                    return false;
                }

                balances.insert(sender, balance - txn.amount);
                *balances.entry(recipient).or_default() += txn.amount;
                true
            })
            .collect()
    }

    /// Runs every validation rule and returns the derived chain length and
    /// balances of `block` on success.
    fn check(
        &self,
        block: &Block,
    ) -> Result<(u64, Balances), BlockValidationError> {
        use BlockValidationError::*;

        let parent_id = block.parent.ok_or(NoParentGiven)?;
        let parent =
            self.blocks.get(&parent_id).ok_or(MissingParent(parent_id))?;
        if self.contains(block.id) {
            return Err(Duplicate(block.id));
        }

        let mut balances = parent.balances.clone();
        let mut seen = HashSet::new();
        let mut coinbases = 0;
        for txn in &block.txns {
            if parent.included.contains(&txn.id) || !seen.insert(txn.id) {
                return Err(DoubleInclusion(txn.id));
            }

            match txn.kind {
                TxnKind::Transfer { sender, recipient } => {
                    let balance = balances.get(&sender).copied().unwrap_or(0.0);
                    if balance < txn.amount {
                        return Err(InsufficientBalance {
                            txn: txn.id,
                            amount: txn.amount,
                            balance,
                        });
                    }

                    balances.insert(sender, balance - txn.amount);
                    *balances.entry(recipient).or_default() += txn.amount;
                }
                TxnKind::Coinbase { miner } => {
                    coinbases += 1;
                    if coinbases > 1
                        || block.miner != Some(miner)
                        || (txn.amount - self.reward).abs() > EPSILON_COINS
                    {
                        return Err(InvalidCoinbase);
                    }

                    *balances.entry(miner).or_default() += txn.amount;
                }
            }
        }

        Ok((parent.chain_length + 1, balances))
    }

    fn apply(
        &mut self,
        block: Arc<Block>,
        chain_length: u64,
        balances: Balances,
        now: SimTime,
    ) {
        // Parent presence was checked by `check`.
        let parent = block.parent.unwrap_or(self.genesis);
        let mut included = self.blocks[&parent].included.clone();
        included.extend(block.txns.iter().map(|txn| txn.id));

        let id = block.id;
        let data = BlockData {
            block,
            chain_length,
            balances,
            included,
            arrived_at: now,
        };
        self.blocks.insert(id, data);
        self.accepted.push(id);
    }

    /// Accepts buffered blocks until none of them can make progress. Blocks
    /// which turn out to be duplicates or invalid are dropped.
    fn retry_pending(&mut self, now: SimTime, accepted: &mut Vec<BlockId>) {
        loop {
            let mut progressed = false;

            for block in std::mem::take(&mut self.pending) {
                match self.check(&block) {
                    Ok((chain_length, balances)) => {
                        debug!("accepting buffered {}", block);
                        accepted.push(block.id);
                        self.apply(block, chain_length, balances, now);
                        progressed = true;
                    }
                    Err(BlockValidationError::MissingParent(_)) => {
                        self.pending.push(block)
                    }
                    Err(err) => {
                        debug!("dropping buffered {}: {}", block, err);
                        if err.is_invalid() {
                            self.reject(block.id);
                        }
                    }
                }
            }

            if !progressed {
                break;
            }
        }
    }

    /// Marks `id` as rejected and drops every buffered descendant of it.
    fn reject(&mut self, id: BlockId) {
        self.rejected.insert(id);

        loop {
            let (orphans, pending): (Vec<_>, Vec<_>) =
                std::mem::take(&mut self.pending).into_iter().partition(
                    |block| {
                        block.parent.is_some_and(|p| self.rejected.contains(&p))
                    },
                );
            self.pending = pending;
            if orphans.is_empty() {
                break;
            }

            for block in orphans {
                debug!("dropping buffered {}: ancestor rejected", block);
                self.rejected.insert(block.id);
            }
        }
    }
}

impl Index<BlockId> for Blockchain {
    type Output = BlockData;

    fn index(&self, index: BlockId) -> &Self::Output {
        self.blocks.index(&index)
    }
}

impl Index<&BlockId> for Blockchain {
    type Output = BlockData;

    fn index(&self, index: &BlockId) -> &Self::Output {
        self.blocks.index(index)
    }
}
