//! Serializable views of finished simulations

use serde::Serialize;

use crate::{
    block::BlockId,
    blockchain::{Balances, BlockData},
    peer::{Peer, PeerId},
    power_dist::PowerValue,
};

use super::SimulationOutput;

/// One block of a peer's tree, with the state the peer derived for it.
#[derive(Debug, Clone, Serialize)]
pub struct BlockRecord {
    pub id: BlockId,
    pub parent: Option<BlockId>,
    pub miner: Option<PeerId>,
    /// Creation time (ms).
    pub timestamp: f64,
    pub txns: usize,
    pub chain_length: u64,
    /// Time the peer accepted the block (ms).
    pub arrived_at: f64,
    pub balances: Balances,
}

impl From<&BlockData> for BlockRecord {
    fn from(data: &BlockData) -> Self {
        Self {
            id: data.block.id,
            parent: data.block.parent,
            miner: data.block.miner,
            timestamp: data.block.timestamp.as_millis(),
            txns: data.block.txns.len(),
            chain_length: data.chain_length,
            arrived_at: data.arrived_at.as_millis(),
            balances: data.balances.clone(),
        }
    }
}

/// A peer's final view of the network.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub peer: PeerId,
    pub strategy: String,
    pub power: PowerValue,
    pub slow: bool,
    pub low_cpu: bool,
    pub public_leaf: BlockId,
    /// The peer's public chain, genesis first.
    pub longest_chain: Vec<BlockId>,
    /// Every block in the peer's tree, in acceptance order.
    pub blocks: Vec<BlockRecord>,
}

impl From<&Peer> for PeerSnapshot {
    fn from(peer: &Peer) -> Self {
        let state = peer.state();
        let profile = peer.profile();

        Self {
            peer: peer.id(),
            strategy: peer.miner().name(),
            power: profile.power,
            slow: profile.slow,
            low_cpu: profile.low_cpu,
            public_leaf: state.public_leaf(),
            longest_chain: state.chain().ancestors_of(state.public_leaf()),
            blocks: state.chain().iter().map(BlockRecord::from).collect(),
        }
    }
}

/// Everything exported from one simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationSnapshot {
    pub seed: u64,
    /// Simulated time at which the run stopped (ms).
    pub end_time: f64,
    pub blocks_broadcast: u64,
    pub txns_created: u64,
    pub longest_chain: Vec<BlockId>,
    /// Blocks broadcast by every peer, indexed by peer.
    pub published: Vec<Vec<BlockId>>,
    pub peers: Vec<PeerSnapshot>,
}

impl SimulationSnapshot {
    pub fn of(output: &SimulationOutput) -> Self {
        Self {
            seed: output.seed,
            end_time: output.end_time.as_millis(),
            blocks_broadcast: output.blocks_broadcast,
            txns_created: output.txns_created,
            longest_chain: output.longest_chain.clone(),
            published: output.published.clone(),
            peers: output.peers.iter().map(PeerSnapshot::from).collect(),
        }
    }
}
