/*!
Message relay between peers

The [`Network`] is the [`Handler`] of a simulation's [`Scheduler`]. It owns
every [`Peer`] and the [`Topology`] connecting them, turns the
[`Command`]s returned by peers into scheduled [`NetworkEvent`]s, and floods
messages through the overlay: each peer processes and forwards a given
message at most once.
*/

use std::{collections::HashSet, sync::Arc};

use log::{debug, trace};
use rand::{rngs::StdRng, seq::IteratorRandom, Rng};

use crate::{
    block::{Block, BlockId},
    peer::{Command, MiningAttempt, Peer, PeerId},
    scheduler::{Event, Handler, Scheduler, SimTime},
    transaction::{Transaction, TxnId},
    utils::sample_exponential,
};

pub mod topology;

pub use topology::{Topology, TopologyError};

/// Payload relayed between neighbours.
#[derive(Debug, Clone)]
pub enum Message {
    Transaction(Transaction),
    Block(Arc<Block>),
}

/// Identity of a [`Message`], used to forward each message at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Transaction(TxnId),
    Block(BlockId),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Self::Transaction(txn) => MessageId::Transaction(txn.id),
            Self::Block(block) => MessageId::Block(block.id),
        }
    }

    /// Size in kilobytes.
    pub fn size(&self) -> usize {
        match self {
            Self::Transaction(txn) => txn.size(),
            Self::Block(block) => block.size(),
        }
    }
}

/// Actions dispatched by the scheduler of a simulation.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// `peer` creates a new transaction and schedules its next one.
    GenerateTransaction { peer: PeerId },
    /// `message` arrives at `to` over the link from `from`.
    Deliver { from: PeerId, to: PeerId, message: Message },
    /// The mining delay of `attempt` has elapsed.
    MiningFinished { attempt: MiningAttempt },
    /// `peer` sends one of its own blocks to all of its neighbours.
    BroadcastBlock { peer: PeerId, block: Arc<Block> },
}

/// Payload-free description of a [`NetworkEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkEventKind {
    GenerateTransaction,
    DeliverTransaction,
    DeliverBlock,
    MiningFinished,
    BroadcastBlock,
}

impl Event for NetworkEvent {
    type Kind = NetworkEventKind;

    fn kind(&self) -> NetworkEventKind {
        match self {
            Self::GenerateTransaction { .. } => {
                NetworkEventKind::GenerateTransaction
            }
            Self::Deliver { message: Message::Transaction(_), .. } => {
                NetworkEventKind::DeliverTransaction
            }
            Self::Deliver { message: Message::Block(_), .. } => {
                NetworkEventKind::DeliverBlock
            }
            Self::MiningFinished { .. } => NetworkEventKind::MiningFinished,
            Self::BroadcastBlock { .. } => NetworkEventKind::BroadcastBlock,
        }
    }
}

/// Timing parameters of a [`Network`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkParams {
    /// Mean time between two transactions created by the same peer (ms).
    pub txn_interval: f64,
    /// Mean time between two blocks mined by the whole network (ms).
    pub block_interval: f64,
}

/// All peers of a simulation and the overlay connecting them.
#[derive(Debug)]
pub struct Network {
    topology: Topology,
    peers: Vec<Peer>,
    /// Messages each peer has already processed.
    seen: Vec<HashSet<MessageId>>,
    params: NetworkParams,
    rng: StdRng,
    /// Blocks each peer has broadcast, in order.
    published: Vec<Vec<BlockId>>,
    blocks_broadcast: u64,
    txns_created: u64,
}

impl Network {
    /// Creates a network. `peers[i]` must have [`PeerId`] `i`, and the
    /// topology must span exactly the given peers.
    pub fn new(
        topology: Topology,
        peers: Vec<Peer>,
        params: NetworkParams,
        rng: StdRng,
    ) -> Self {
        assert_eq!(
            topology.len(),
            peers.len(),
            "topology does not span all peers"
        );
        assert!(
            peers.iter().enumerate().all(|(i, peer)| peer.id().get() == i),
            "peers are not numbered in order"
        );

        let seen = vec![HashSet::new(); peers.len()];
        let published = vec![vec![]; peers.len()];

        Self {
            topology,
            peers,
            seen,
            params,
            rng,
            published,
            blocks_broadcast: 0,
            txns_created: 0,
        }
    }

    #[inline]
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    #[inline]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Number of block broadcasts started by their miners so far.
    #[inline]
    pub fn blocks_broadcast(&self) -> u64 {
        self.blocks_broadcast
    }

    #[inline]
    pub fn txns_created(&self) -> u64 {
        self.txns_created
    }

    /// Blocks broadcast by `peer` so far, in order. Blocks a peer withheld
    /// and never released are not included.
    #[inline]
    pub fn published_by(&self, peer: PeerId) -> &[BlockId] {
        &self.published[peer.get()]
    }

    /// Splits the network into its overlay, its peers and the blocks each
    /// peer broadcast.
    pub fn into_parts(self) -> (Topology, Vec<Peer>, Vec<Vec<BlockId>>) {
        (self.topology, self.peers, self.published)
    }

    /// Schedules the first transaction of every peer and starts mining on
    /// every peer with mining power.
    pub fn bootstrap(&mut self, scheduler: &mut Scheduler<NetworkEvent>) {
        for i in 0..self.peers.len() {
            let peer = PeerId(i);
            let delay =
                sample_exponential(&mut self.rng, self.params.txn_interval);
            let event = NetworkEvent::GenerateTransaction { peer };
            scheduler.enqueue_after(event, delay);

            let command = self.peers[i].start_mining(scheduler.now());
            self.execute(peer, vec![command], scheduler);
        }
    }

    /// Turns the commands issued by `peer` into scheduled events.
    fn execute(
        &mut self,
        peer: PeerId,
        commands: Vec<Command>,
        scheduler: &mut Scheduler<NetworkEvent>,
    ) {
        for command in commands {
            match command {
                Command::Mine(attempt) => {
                    let power = self.peers[peer.get()].profile().power;
                    if power <= 0.0 {
                        trace!("{} has no mining power", peer);
                        continue;
                    }

                    let mean = self.params.block_interval / power;
                    let delay = sample_exponential(&mut self.rng, mean);
                    debug!("{} will finish mining in {:.3}ms", peer, delay);
                    let event = NetworkEvent::MiningFinished { attempt };
                    scheduler.enqueue_after(event, delay);
                }
                Command::Publish(block) => {
                    let event = NetworkEvent::BroadcastBlock { peer, block };
                    scheduler.enqueue_after(event, 0.0);
                }
            }
        }
    }

    /// Sends `message` from `peer` to all of its neighbours except `source`.
    fn relay(
        &mut self,
        peer: PeerId,
        message: &Message,
        source: Option<PeerId>,
        scheduler: &mut Scheduler<NetworkEvent>,
    ) {
        let size = message.size();
        for link in self.topology.neighbours(peer) {
            if Some(link.peer) == source {
                continue;
            }

            let to = link.peer;
            let delay = self.topology.delay(peer, to, size, &mut self.rng);
            let message = message.clone();
            let event = NetworkEvent::Deliver { from: peer, to, message };
            scheduler.enqueue_after(event, delay);
        }
    }

    fn generate_transaction(
        &mut self,
        peer: PeerId,
        scheduler: &mut Scheduler<NetworkEvent>,
    ) {
        let now = scheduler.now();
        let delay = sample_exponential(&mut self.rng, self.params.txn_interval);
        scheduler
            .enqueue_after(NetworkEvent::GenerateTransaction { peer }, delay);

        let balance = self.peers[peer.get()].state().balance_of(peer);
        let recipient = (0..self.peers.len())
            .filter(|&other| other != peer.get())
            .choose(&mut self.rng);
        let Some(recipient) = recipient.filter(|_| balance > 0.0) else {
            trace!("{} skipped creating a transaction", peer);
            return;
        };

        // 1 - u lies in (0, 1], so the amount is never zero.
        let amount = balance * (1.0 - self.rng.gen::<f64>());
        let txn = Transaction::transfer(
            TxnId::random(&mut self.rng),
            peer,
            PeerId(recipient),
            amount,
            now,
        );
        trace!("{} created {}", peer, txn);
        self.txns_created += 1;

        let message = Message::Transaction(txn);
        self.seen[peer.get()].insert(message.id());
        self.peers[peer.get()].receive_transaction(txn);
        self.relay(peer, &message, None, scheduler);
    }

    fn deliver(
        &mut self,
        from: PeerId,
        to: PeerId,
        message: Message,
        scheduler: &mut Scheduler<NetworkEvent>,
    ) {
        if !self.seen[to.get()].insert(message.id()) {
            return;
        }

        let now = scheduler.now();
        match &message {
            Message::Transaction(txn) => {
                self.peers[to.get()].receive_transaction(*txn);
                self.relay(to, &message, Some(from), scheduler);
            }
            Message::Block(block) => {
                let delivery =
                    self.peers[to.get()].receive_block(block.clone(), now);
                self.execute(to, delivery.commands, scheduler);
                if delivery.forward {
                    self.relay(to, &message, Some(from), scheduler);
                }
            }
        }
    }

    fn broadcast_block(
        &mut self,
        peer: PeerId,
        block: Arc<Block>,
        scheduler: &mut Scheduler<NetworkEvent>,
    ) {
        debug!("{} broadcasting {}", peer, block);
        let id = block.id;
        let message = Message::Block(block);
        if !self.seen[peer.get()].insert(message.id()) {
            return;
        }

        self.blocks_broadcast += 1;
        self.published[peer.get()].push(id);
        self.relay(peer, &message, None, scheduler);
    }
}

impl Handler<NetworkEvent> for Network {
    fn handle(
        &mut self,
        event: NetworkEvent,
        scheduler: &mut Scheduler<NetworkEvent>,
    ) {
        match event {
            NetworkEvent::GenerateTransaction { peer } => {
                self.generate_transaction(peer, scheduler)
            }
            NetworkEvent::Deliver { from, to, message } => {
                self.deliver(from, to, message, scheduler)
            }
            NetworkEvent::MiningFinished { attempt } => {
                let peer = attempt.peer;
                let now: SimTime = scheduler.now();
                let commands = self.peers[peer.get()].complete_mining(
                    attempt,
                    now,
                    &mut self.rng,
                );
                self.execute(peer, commands, scheduler);
            }
            NetworkEvent::BroadcastBlock { peer, block } => {
                self.broadcast_block(peer, block, scheduler)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::{rngs::StdRng, SeedableRng};

    use super::{
        Message, Network, NetworkEvent, NetworkEventKind, NetworkParams,
        Topology,
    };
    use crate::{
        block::Block,
        blockchain::Balances,
        miner::{Honest, Miner, Selfish},
        peer::{Peer, PeerId, PeerProfile},
        scheduler::{Handler, Scheduler, SimTime, StopFlag},
        transaction::{Transaction, TxnId},
    };

    const PEERS: usize = 6;

    fn network(seed: u64, selfish: bool) -> Network {
        let mut rng = StdRng::seed_from_u64(seed);
        let slow: Vec<_> = (0..PEERS).map(|i| i % 3 == 0).collect();
        let topology = Topology::random(&slow, &mut rng).unwrap();

        let genesis = Arc::new(Block::genesis());
        let allocation: Balances =
            (0..PEERS).map(|i| (PeerId::from(i), 100.0)).collect();
        let peers = (0..PEERS)
            .map(|i| {
                let miner: Box<dyn Miner> = if selfish && i == 0 {
                    Box::new(Selfish::new())
                } else {
                    Box::new(Honest::new())
                };
                let profile = PeerProfile {
                    slow: slow[i],
                    low_cpu: false,
                    power: 1.0 / PEERS as f64,
                };
                Peer::new(
                    PeerId::from(i),
                    profile,
                    miner,
                    genesis.clone(),
                    allocation.clone(),
                    50.0,
                )
            })
            .collect();

        let params =
            NetworkParams { txn_interval: 50.0, block_interval: 1000.0 };
        Network::new(topology, peers, params, rng)
    }

    /// Runs until `blocks` broadcasts have happened, then lets in-flight
    /// messages settle without generating new work.
    fn run(network: &mut Network, blocks: u64) -> Scheduler<NetworkEvent> {
        let mut scheduler = Scheduler::new();
        network.bootstrap(&mut scheduler);

        let mut seen = 0;
        scheduler.run(
            network,
            &mut |_: SimTime, kind: NetworkEventKind, stop: &StopFlag| {
                if kind == NetworkEventKind::BroadcastBlock {
                    seen += 1;
                    if seen >= blocks {
                        stop.raise();
                    }
                }
            },
        );

        scheduler
    }

    #[test]
    fn blocks_reach_every_peer() {
        let mut network = network(1, false);
        let mut scheduler = run(&mut network, 5);
        assert_eq!(network.blocks_broadcast(), 5);

        // Let broadcast blocks settle without mining or creating anything new.
        while let Some((_, event)) = scheduler.pop() {
            match event {
                NetworkEvent::Deliver { message: Message::Block(_), .. }
                | NetworkEvent::BroadcastBlock { .. } => {
                    network.handle(event, &mut scheduler)
                }
                _ => (),
            }
        }

        let (_, peers, _) = network.into_parts();
        let all_mined: Vec<_> = peers
            .iter()
            .flat_map(|peer| peer.blocks_mined().to_vec())
            .collect();
        for peer in &peers {
            for id in &all_mined {
                assert!(
                    peer.state().chain().contains(*id)
                        || peer.state().chain().is_pending(*id),
                    "{} never received block {}",
                    peer.id(),
                    id
                );
            }
        }
    }

    #[test]
    fn honest_views_respect_ledger_invariants() {
        let mut network = network(2, false);
        run(&mut network, 8);

        assert!(network.txns_created() > 0);
        for peer in network.peers() {
            let chain = peer.state().chain();
            for data in chain.iter() {
                assert!(data.balances.values().all(|&b| b >= 0.0));
                if let Some(parent) = data.block.parent {
                    assert_eq!(
                        data.chain_length,
                        chain[parent].chain_length + 1
                    );
                }
            }
        }
    }

    #[test]
    fn zero_power_peers_never_mine() {
        let mut network = network(3, false);
        network.peers[1] = {
            let old = &network.peers[1];
            let profile = PeerProfile { power: 0.0, ..*old.profile() };
            Peer::new(
                old.id(),
                profile,
                Box::new(Honest::new()),
                Arc::new(Block::genesis()),
                (0..PEERS).map(|i| (PeerId::from(i), 100.0)).collect(),
                50.0,
            )
        };
        run(&mut network, 6);

        assert!(network.peers()[1].blocks_mined().is_empty());
    }

    #[test]
    fn same_seed_same_history() {
        let mut a = network(4, true);
        let mut b = network(4, true);
        let sa = run(&mut a, 6);
        let sb = run(&mut b, 6);

        assert_eq!(sa.now(), sb.now());
        assert_eq!(sa.dispatched(), sb.dispatched());
        for (pa, pb) in a.peers().iter().zip(b.peers()) {
            assert_eq!(pa.blocks_mined(), pb.blocks_mined());
            assert_eq!(pa.state().public_leaf(), pb.state().public_leaf());
        }
    }

    /// Three fully connected peers without mining power, so handling an
    /// event only ever schedules relayed messages.
    fn triangle() -> Network {
        let mut rng = StdRng::seed_from_u64(5);
        let topology = Topology::random(&[false; 3], &mut rng).unwrap();
        assert_eq!(topology.num_links(), 3);

        let genesis = Arc::new(Block::genesis());
        let allocation: Balances =
            (0..3).map(|i| (PeerId::from(i), 100.0)).collect();
        let peers = (0..3)
            .map(|i| {
                let profile =
                    PeerProfile { slow: false, low_cpu: false, power: 0.0 };
                Peer::new(
                    PeerId::from(i),
                    profile,
                    Box::new(Honest::new()),
                    genesis.clone(),
                    allocation.clone(),
                    50.0,
                )
            })
            .collect();

        let params =
            NetworkParams { txn_interval: 50.0, block_interval: 1000.0 };
        Network::new(topology, peers, params, rng)
    }

    fn block_by(
        network: &Network,
        miner: usize,
        mut txns: Vec<Transaction>,
    ) -> Arc<Block> {
        let genesis = network.peers()[0].state().chain().genesis();
        let t = SimTime::from_millis(1.0);
        txns.push(Transaction::coinbase(
            TxnId::from(900),
            PeerId::from(miner),
            50.0,
            t,
        ));
        Arc::new(Block::new(genesis, txns, t, PeerId::from(miner), false, 1))
    }

    /// Pops every scheduled event, which must all be deliveries, and returns
    /// their endpoints.
    fn deliveries(
        scheduler: &mut Scheduler<NetworkEvent>,
    ) -> Vec<(usize, usize)> {
        let mut links = vec![];
        while let Some((_, event)) = scheduler.pop() {
            match event {
                NetworkEvent::Deliver { from, to, .. } => {
                    links.push((from.get(), to.get()))
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        links
    }

    fn deliver(
        network: &mut Network,
        scheduler: &mut Scheduler<NetworkEvent>,
        from: usize,
        to: usize,
        message: &Message,
    ) {
        let event = NetworkEvent::Deliver {
            from: PeerId::from(from),
            to: PeerId::from(to),
            message: message.clone(),
        };
        network.handle(event, scheduler);
    }

    #[test]
    fn transactions_are_forwarded_once() {
        let mut network = triangle();
        let mut scheduler = Scheduler::new();
        let txn = Transaction::transfer(
            TxnId::from(1),
            PeerId::from(0),
            PeerId::from(2),
            10.0,
            SimTime::ZERO,
        );
        let message = Message::Transaction(txn);

        deliver(&mut network, &mut scheduler, 0, 1, &message);
        deliver(&mut network, &mut scheduler, 2, 1, &message);

        assert_eq!(deliveries(&mut scheduler), vec![(1, 2)]);
        assert_eq!(network.peers()[1].state().pool_len(), 1);
    }

    #[test]
    fn blocks_are_forwarded_once() {
        let mut network = triangle();
        let mut scheduler = Scheduler::new();
        let block = block_by(&network, 0, vec![]);
        let message = Message::Block(block.clone());

        deliver(&mut network, &mut scheduler, 0, 1, &message);
        deliver(&mut network, &mut scheduler, 2, 1, &message);

        assert_eq!(deliveries(&mut scheduler), vec![(1, 2)]);
        assert_eq!(network.peers()[1].state().public_leaf(), block.id);
    }

    #[test]
    fn invalid_blocks_are_not_forwarded() {
        let mut network = triangle();
        let mut scheduler = Scheduler::new();
        let overspend = Transaction::transfer(
            TxnId::from(1),
            PeerId::from(2),
            PeerId::from(1),
            500.0,
            SimTime::ZERO,
        );
        let block = block_by(&network, 0, vec![overspend]);

        deliver(&mut network, &mut scheduler, 0, 1, &Message::Block(block));

        assert!(deliveries(&mut scheduler).is_empty());
        let chain = network.peers()[1].state().chain();
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn own_blocks_are_broadcast_once() {
        let mut network = triangle();
        let mut scheduler = Scheduler::new();
        let block = block_by(&network, 0, vec![]);
        let peer = PeerId::from(0);

        for _ in 0..2 {
            let event =
                NetworkEvent::BroadcastBlock { peer, block: block.clone() };
            network.handle(event, &mut scheduler);
        }

        let mut links = deliveries(&mut scheduler);
        links.sort_unstable();
        assert_eq!(links, vec![(0, 1), (0, 2)]);
        assert_eq!(network.blocks_broadcast(), 1);
        assert_eq!(network.published_by(peer), &[block.id]);
        assert!(network.published_by(PeerId::from(1)).is_empty());
    }
}
