/*!
Network participants and the chain state each of them maintains

A [`Peer`] combines a [`ChainState`] (block tree, transaction pool, public
leaf) with a boxed [`Miner`] strategy. Peers never talk to each other or to
the scheduler directly: every operation returns [`Command`]s which the
[`Network`](crate::network::Network) turns into scheduled actions.
*/

use std::{
    collections::HashMap,
    fmt::{self, Display},
    sync::Arc,
};

use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    block::{Block, BlockId},
    blockchain::{Balances, BlockValidationError, Blockchain},
    miner::{Action, Miner},
    power_dist::PowerValue,
    scheduler::SimTime,
    transaction::{Coins, Transaction, TxnId},
};

/// Unique identifier of a peer. Peers of a network are numbered from 0.
#[repr(transparent)]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(pub(crate) usize);

impl PeerId {
    /// Returns the [`usize`] corresponding to this [`PeerId`].
    pub fn get(&self) -> usize {
        self.0
    }
}

impl From<usize> for PeerId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer {}", self.0)
    }
}

/// Static properties of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeerProfile {
    /// Slow peers communicate over low-bandwidth links.
    pub slow: bool,
    /// Low-CPU peers have a tenth of the hashing weight of other peers.
    pub low_cpu: bool,
    /// Fraction of the network's total mining power.
    pub power: PowerValue,
}

/// A peer's view of the network: its block tree, the transactions it has
/// heard of but not yet seen settled, and its public leaf.
#[derive(Debug, Clone)]
pub struct ChainState {
    peer: PeerId,
    chain: Blockchain,
    pool: HashMap<TxnId, Transaction>,
    public_leaf: BlockId,
}

impl ChainState {
    pub fn new(peer: PeerId, chain: Blockchain) -> Self {
        let public_leaf = chain.genesis();

        Self { peer, chain, pool: HashMap::new(), public_leaf }
    }

    #[inline]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    #[inline]
    pub fn chain(&self) -> &Blockchain {
        &self.chain
    }

    /// The accepted block with maximal chain length, first seen on ties.
    #[inline]
    pub fn public_leaf(&self) -> BlockId {
        self.public_leaf
    }

    #[inline]
    pub fn public_length(&self) -> u64 {
        self.chain[self.public_leaf].chain_length
    }

    /// Transactions waiting to be included in a block.
    pub fn pool(&self) -> impl Iterator<Item = &Transaction> + '_ {
        self.pool.values()
    }

    #[inline]
    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Balance of `peer` at the public leaf.
    pub fn balance_of(&self, peer: PeerId) -> Coins {
        self.chain[self.public_leaf]
            .balances
            .get(&peer)
            .copied()
            .unwrap_or_default()
    }

    /// Fork choice: adopts `id` as the public leaf iff its chain is strictly
    /// longer than the current one. Returns whether the leaf changed.
    pub fn select_leaf(&mut self, id: BlockId) -> bool {
        match self.chain.chain_length(id) {
            Some(length) if length > self.public_length() => {
                self.public_leaf = id;
                true
            }
            _ => false,
        }
    }

    /// Adds `txn` to the pool. Returns false if it was already known.
    pub fn add_transaction(&mut self, txn: Transaction) -> bool {
        if txn.is_coinbase()
            || self.chain[self.public_leaf].included.contains(&txn.id)
        {
            return false;
        }

        self.pool.insert(txn.id, txn).is_none()
    }

    /// Removes a never-published block from the tree and returns its
    /// transfers to the pool.
    pub fn discard(&mut self, id: BlockId) {
        let Some(data) = self.chain.remove(id) else {
            return;
        };

        for txn in data.block.txns.iter().filter(|txn| !txn.is_coinbase()) {
            self.add_transaction(*txn);
        }
        debug!("{} discarded {}", self.peer, data.block);
    }

    pub(crate) fn insert(
        &mut self,
        block: Arc<Block>,
        now: SimTime,
    ) -> Result<Vec<BlockId>, BlockValidationError> {
        let accepted = self.chain.insert(block, now)?;
        for id in &accepted {
            for txn in &self.chain[id].block.txns {
                self.pool.remove(&txn.id);
            }
        }

        Ok(accepted)
    }
}

/// Identifier of one mining attempt of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(u64);

/// A block candidate being mined. The block itself only exists once the
/// attempt completes successfully.
#[derive(Debug, Clone)]
pub struct MiningAttempt {
    pub id: AttemptId,
    pub peer: PeerId,
    pub parent: BlockId,
    pub txns: Vec<Transaction>,
    pub started_at: SimTime,
}

/// Side effects requested by a [`Peer`].
#[derive(Debug, Clone)]
pub enum Command {
    /// Schedule completion of this attempt after a sampled mining delay.
    Mine(MiningAttempt),
    /// Broadcast the block to the network without delay.
    Publish(Arc<Block>),
}

/// Outcome of delivering a block to a [`Peer`].
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub commands: Vec<Command>,
    /// Whether the relay should forward the block to the peer's neighbours.
    pub forward: bool,
}

/// A network participant.
#[derive(Debug, Clone)]
pub struct Peer {
    id: PeerId,
    profile: PeerProfile,
    state: ChainState,
    miner: Box<dyn Miner>,
    attempt: Option<AttemptId>,
    attempts_started: u64,
    blocks_mined: Vec<BlockId>,
}

impl Peer {
    /// Creates a peer whose chain holds only `genesis`, with `allocation` as
    /// the genesis balances.
    pub fn new(
        id: PeerId,
        profile: PeerProfile,
        miner: Box<dyn Miner>,
        genesis: Arc<Block>,
        allocation: Balances,
        reward: Coins,
    ) -> Self {
        let chain = Blockchain::new(genesis, allocation, reward);

        Self {
            id,
            profile,
            state: ChainState::new(id, chain),
            miner,
            attempt: None,
            attempts_started: 0,
            blocks_mined: vec![],
        }
    }

    #[inline]
    pub fn id(&self) -> PeerId {
        self.id
    }

    #[inline]
    pub fn profile(&self) -> &PeerProfile {
        &self.profile
    }

    #[inline]
    pub fn state(&self) -> &ChainState {
        &self.state
    }

    #[inline]
    pub fn miner(&self) -> &dyn Miner {
        self.miner.as_ref()
    }

    /// Block the peer currently mines on.
    #[inline]
    pub fn mining_parent(&self) -> BlockId {
        self.miner.mining_parent(&self.state)
    }

    /// Blocks this peer has mined successfully, in order.
    pub fn blocks_mined(&self) -> &[BlockId] {
        &self.blocks_mined
    }

    /// Starts a new mining attempt on the current mining parent. Any attempt
    /// still in flight becomes stale.
    pub fn start_mining(&mut self, now: SimTime) -> Command {
        let parent = self.mining_parent();
        let txns =
            self.state.chain.select_transactions(parent, self.state.pool());

        let id = AttemptId(self.attempts_started);
        self.attempts_started += 1;
        self.attempt = Some(id);

        debug!(
            "{} started mining on {} with {} txns",
            self.id,
            parent,
            txns.len()
        );

        Command::Mine(MiningAttempt {
            id,
            peer: self.id,
            parent,
            txns,
            started_at: now,
        })
    }

    /// Adds a relayed transaction to the pool. Returns false if the
    /// transaction was already known.
    pub fn receive_transaction(&mut self, txn: Transaction) -> bool {
        self.state.add_transaction(txn)
    }

    /// Validates and accepts a relayed block, applying fork choice to every
    /// block accepted as a result.
    pub fn receive_block(
        &mut self,
        block: Arc<Block>,
        now: SimTime,
    ) -> Delivery {
        let parent_before = self.mining_parent();

        let accepted = match self.state.insert(block.clone(), now) {
            Ok(accepted) => accepted,
            Err(BlockValidationError::MissingParent(parent)) => {
                debug!(
                    "{} buffered {}, waiting for {}",
                    self.id, block, parent
                );
                return Delivery { commands: vec![], forward: true };
            }
            Err(BlockValidationError::Duplicate(_)) => {
                return Delivery::default();
            }
            Err(err) => {
                warn!("{} rejected {}: {}", self.id, block, err);
                return Delivery::default();
            }
        };

        let mut commands = vec![];
        for id in accepted {
            let miner = self.state.chain[id].block.miner;
            if miner != Some(self.id) && self.state.select_leaf(id) {
                debug!(
                    "{} adopted {} at length {}",
                    self.id,
                    id,
                    self.state.public_length()
                );

                let action =
                    self.miner.on_competitor_block(&mut self.state, id);
                commands.extend(publications(action));
            }
        }

        if self.mining_parent() != parent_before {
            commands.push(self.start_mining(now));
        }

        Delivery { commands, forward: true }
    }

    /// Completes a mining attempt. Every change of mining parent starts a
    /// new attempt, so a superseded attempt has failed and produces nothing.
    /// The current attempt always yields a block, and mining restarts.
    pub fn complete_mining<R: Rng + ?Sized>(
        &mut self,
        attempt: MiningAttempt,
        now: SimTime,
        rng: &mut R,
    ) -> Vec<Command> {
        if self.attempt != Some(attempt.id) {
            info!(
                "{} failed to mine on {}: attempt was superseded",
                self.id, attempt.parent
            );
            return vec![];
        }
        self.attempt = None;
        debug_assert_eq!(attempt.parent, self.mining_parent());

        let MiningAttempt { parent, mut txns, .. } = attempt;
        let reward = self.state.chain.reward();
        txns.push(Transaction::coinbase(
            TxnId::random(rng),
            self.id,
            reward,
            now,
        ));
        let block = Arc::new(Block::new(
            parent,
            txns,
            now,
            self.id,
            self.miner.withholds(),
            rng.gen(),
        ));

        let mut commands = vec![];
        match self.state.insert(block.clone(), now) {
            Ok(_) => {
                info!("{} mined {}", self.id, block);
                self.blocks_mined.push(block.id);

                let action =
                    self.miner.on_mine_complete(&mut self.state, block);
                commands.extend(publications(action));
            }
            Err(err) => {
                warn!("{} dropped its own {}: {}", self.id, block, err)
            }
        }

        commands.push(self.start_mining(now));
        commands
    }
}

fn publications(action: Action) -> Vec<Command> {
    match action {
        Action::Wait => vec![],
        Action::Publish(block) => vec![Command::Publish(block)],
        Action::PublishSet(blocks) => {
            blocks.into_iter().map(Command::Publish).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::{rngs::StdRng, SeedableRng};

    use super::{Command, MiningAttempt, Peer, PeerId, PeerProfile};
    use crate::{
        block::{Block, BlockId},
        blockchain::Balances,
        miner::{Honest, Miner, Selfish},
        scheduler::SimTime,
        transaction::{Transaction, TxnId},
    };

    const REWARD: f64 = 50.0;

    fn t(millis: f64) -> SimTime {
        SimTime::from_millis(millis)
    }

    fn peer_with<M: Miner + 'static>(id: usize, miner: M) -> Peer {
        let allocation: Balances =
            (0..4).map(|n| (PeerId::from(n), 100.0)).collect();
        let profile = PeerProfile { slow: false, low_cpu: false, power: 0.25 };

        Peer::new(
            PeerId::from(id),
            profile,
            Box::new(miner),
            Arc::new(Block::genesis()),
            allocation,
            REWARD,
        )
    }

    fn competitor(parent: BlockId, miner: usize, nonce: u64) -> Arc<Block> {
        let coinbase = Transaction::coinbase(
            TxnId::from(50_000 + nonce),
            PeerId::from(miner),
            REWARD,
            t(nonce as f64),
        );

        Arc::new(Block::new(
            parent,
            vec![coinbase],
            t(nonce as f64),
            PeerId::from(miner),
            false,
            nonce,
        ))
    }

    fn attempt_of(command: &Command) -> MiningAttempt {
        match command {
            Command::Mine(attempt) => attempt.clone(),
            other => panic!("expected a mining command, got {:?}", other),
        }
    }

    fn published(commands: &[Command]) -> Vec<BlockId> {
        commands
            .iter()
            .filter_map(|command| match command {
                Command::Publish(block) => Some(block.id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn honest_success_publishes_and_adopts() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut peer = peer_with(0, Honest::new());
        let attempt = attempt_of(&peer.start_mining(t(0.0)));

        let commands = peer.complete_mining(attempt, t(5.0), &mut rng);

        let published = published(&commands);
        assert_eq!(published.len(), 1);
        assert_eq!(peer.state().public_leaf(), published[0]);
        assert_eq!(peer.blocks_mined(), &published[..]);
        assert_eq!(peer.state().balance_of(PeerId::from(0)), 150.0);
        assert_eq!(attempt_of(commands.last().unwrap()).parent, published[0]);
    }

    #[test]
    fn honest_restarts_on_longer_chain_and_ignores_stale_completion() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut peer = peer_with(0, Honest::new());
        let genesis = peer.state().chain().genesis();
        let stale = attempt_of(&peer.start_mining(t(0.0)));

        let b1 = competitor(genesis, 1, 1);
        let delivery = peer.receive_block(b1.clone(), t(1.0));
        assert!(delivery.forward);
        assert_eq!(peer.state().public_leaf(), b1.id);

        let fresh = attempt_of(&delivery.commands[0]);
        assert_eq!(fresh.parent, b1.id);

        assert!(peer.complete_mining(stale, t(2.0), &mut rng).is_empty());
        assert!(peer.blocks_mined().is_empty());

        let commands = peer.complete_mining(fresh, t(3.0), &mut rng);
        assert_eq!(published(&commands).len(), 1);
    }

    #[test]
    fn equal_length_fork_keeps_first_seen_leaf() {
        let mut peer = peer_with(0, Honest::new());
        let genesis = peer.state().chain().genesis();
        let a = competitor(genesis, 1, 1);
        let b = competitor(genesis, 2, 2);

        peer.receive_block(a.clone(), t(1.0));
        let delivery = peer.receive_block(b.clone(), t(2.0));

        assert_eq!(peer.state().public_leaf(), a.id);
        assert!(delivery.commands.is_empty());
        assert!(peer.state().chain().contains(b.id));
    }

    #[test]
    fn fork_choice_is_monotonic() {
        let mut peer = peer_with(0, Honest::new());
        let genesis = peer.state().chain().genesis();
        let a1 = competitor(genesis, 1, 1);
        let a2 = competitor(a1.id, 1, 2);
        let b1 = competitor(genesis, 2, 3);
        let b2 = competitor(b1.id, 2, 4);
        let b3 = competitor(b2.id, 2, 5);

        let mut lengths = vec![peer.state().public_length()];
        for block in [a1, a2, b1, b2, b3.clone()] {
            peer.receive_block(block, t(1.0));
            lengths.push(peer.state().public_length());
        }

        assert!(lengths.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(lengths, vec![1, 2, 3, 3, 3, 4]);
        assert_eq!(peer.state().public_leaf(), b3.id);
    }

    #[test]
    fn missing_parent_is_retried_without_redelivery() {
        let mut peer = peer_with(0, Honest::new());
        let genesis = peer.state().chain().genesis();
        let p = competitor(genesis, 1, 1);
        let c = competitor(p.id, 2, 2);

        let delivery = peer.receive_block(c.clone(), t(1.0));
        assert!(delivery.forward);
        assert!(peer.state().chain().is_pending(c.id));
        assert_eq!(peer.state().public_leaf(), genesis);

        peer.receive_block(p.clone(), t(2.0));
        assert!(peer.state().chain().contains(c.id));
        assert!(!peer.state().chain().is_pending(c.id));
        assert_eq!(peer.state().public_leaf(), c.id);
    }

    #[test]
    fn redelivered_block_is_not_forwarded_twice() {
        let mut peer = peer_with(0, Honest::new());
        let b1 = competitor(peer.state().chain().genesis(), 1, 1);

        assert!(peer.receive_block(b1.clone(), t(1.0)).forward);
        let again = peer.receive_block(b1.clone(), t(2.0));

        assert!(!again.forward);
        assert!(again.commands.is_empty());
        assert_eq!(peer.state().chain().len(), 2);
    }

    #[test]
    fn overspending_block_is_not_forwarded() {
        let mut peer = peer_with(0, Honest::new());
        let genesis = peer.state().chain().genesis();
        let overspend = Transaction::transfer(
            TxnId::from(7),
            PeerId::from(2),
            PeerId::from(3),
            500.0,
            t(1.0),
        );
        let coinbase = Transaction::coinbase(
            TxnId::from(8),
            PeerId::from(1),
            REWARD,
            t(1.0),
        );
        let bad = Arc::new(Block::new(
            genesis,
            vec![overspend, coinbase],
            t(1.0),
            PeerId::from(1),
            false,
            1,
        ));

        let delivery = peer.receive_block(bad.clone(), t(2.0));

        assert!(!delivery.forward);
        assert!(delivery.commands.is_empty());
        assert!(!peer.state().chain().contains(bad.id));
        assert_eq!(peer.state().public_leaf(), genesis);
    }

    #[test]
    fn settled_transactions_leave_the_pool() {
        let mut peer = peer_with(0, Honest::new());
        let genesis = peer.state().chain().genesis();
        let txn = Transaction::transfer(
            TxnId::from(7),
            PeerId::from(1),
            PeerId::from(2),
            10.0,
            t(0.0),
        );
        assert!(peer.receive_transaction(txn));
        assert!(!peer.receive_transaction(txn));

        let coinbase = Transaction::coinbase(
            TxnId::from(8),
            PeerId::from(3),
            REWARD,
            t(1.0),
        );
        let block = Arc::new(Block::new(
            genesis,
            vec![txn, coinbase],
            t(1.0),
            PeerId::from(3),
            false,
            1,
        ));
        peer.receive_block(block, t(1.0));

        assert_eq!(peer.state().pool_len(), 0);
        assert!(!peer.receive_transaction(txn));
    }

    #[test]
    fn selfish_peer_withholds_own_blocks() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut peer = peer_with(0, Selfish::new());
        let genesis = peer.state().chain().genesis();
        let attempt = attempt_of(&peer.start_mining(t(0.0)));

        let commands = peer.complete_mining(attempt, t(4.0), &mut rng);
        let mined = peer.blocks_mined()[0];

        assert!(published(&commands).is_empty());
        assert!(peer.state().chain()[mined].block.private);
        assert_eq!(peer.state().public_leaf(), genesis);
        assert_eq!(peer.mining_parent(), mined);
        assert_eq!(attempt_of(commands.last().unwrap()).parent, mined);
    }

    #[test]
    fn selfish_peer_releases_lead_when_challenged() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut peer = peer_with(0, Selfish::new());
        let genesis = peer.state().chain().genesis();

        let first = attempt_of(&peer.start_mining(t(0.0)));
        let commands = peer.complete_mining(first, t(1.0), &mut rng);
        let second = attempt_of(commands.last().unwrap());
        peer.complete_mining(second, t(2.0), &mut rng);
        let secret = peer.blocks_mined().to_vec();

        // Lead 2: one competing block makes the whole secret chain public.
        let delivery = peer.receive_block(competitor(genesis, 1, 9), t(3.0));

        assert_eq!(published(&delivery.commands), secret);
        assert_eq!(peer.mining_parent(), secret[1]);
    }
}
