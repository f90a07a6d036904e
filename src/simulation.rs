//! Building/running simulations and analyzing the resulting data

use std::{num::NonZeroUsize, sync::Arc};

use log::info;
use rand::{rngs::StdRng, seq::index, SeedableRng};
#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::{
    block::{Block, BlockId},
    blockchain::Balances,
    miner::{Honest, Miner},
    network::{
        Network, NetworkEvent, NetworkEventKind, NetworkParams, Topology,
        TopologyError,
    },
    peer::{Peer, PeerId, PeerProfile},
    power_dist::{
        PowerDistribution, PowerDistributionError, PowerValue, HIGH_CPU_WEIGHT,
        LOW_CPU_WEIGHT,
    },
    results::ResultsBuilder,
    scheduler::{Observer, Scheduler, SimTime, StopFlag},
    transaction::Coins,
};

pub mod builder;
pub mod config;
pub mod snapshot;

pub use builder::{SimulationBuildError, SimulationBuilder};
pub use config::{ConfigError, SimulationConfig};
pub use snapshot::{BlockRecord, PeerSnapshot, SimulationSnapshot};

/// Parameters shared by every run of a [`SimulationGroup`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationParams {
    pub num_peers: usize,
    /// Fraction of peers communicating over slow links.
    pub slow_fraction: f64,
    /// Fraction of peers with low hashing power.
    pub low_cpu_fraction: f64,
    /// Mean time between transactions of one peer (ms).
    pub txn_interval: f64,
    /// Mean time between blocks of the whole network (ms).
    pub block_interval: f64,
    pub initial_coins: Coins,
    pub mining_reward: Coins,
    /// Stop after this many block broadcasts.
    pub max_blocks: Option<u64>,
    /// Stop once simulated time exceeds this many milliseconds.
    pub max_time: Option<f64>,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            num_peers: 20,
            slow_fraction: 0.3,
            low_cpu_fraction: 0.2,
            txn_interval: 10.0,
            block_interval: 600.0,
            initial_coins: 1000.0,
            mining_reward: 50.0,
            max_blocks: Some(100),
            max_time: None,
        }
    }
}

/// Container for a group of simulations which run on the same set of miners.
/// Simulations should be run using this struct's `run_all` method.
#[derive(Debug, Clone)]
pub struct SimulationGroup {
    miners: Vec<Box<dyn Miner>>,
    params: SimulationParams,
    power_dists: Vec<PowerDistribution>,
    repeat_all: NonZeroUsize,
    seed: Option<u64>,
}

impl SimulationGroup {
    pub fn builder() -> SimulationBuilder {
        SimulationBuilder::new()
    }

    pub fn add(&mut self, power_dist: PowerDistribution) {
        self.power_dists.push(power_dist);
    }

    /// Runs every power distribution `repeat_all` times. Runs are independent
    /// and execute in parallel when the `rayon` feature is enabled.
    pub fn run_all(self) -> Result<ResultsBuilder, SimulationError> {
        let SimulationGroup { miners, params, power_dists, repeat_all, seed } =
            self;

        let sims: Vec<_> = power_dists
            .into_iter()
            .flat_map(|power_dist| vec![power_dist; repeat_all.get()])
            .enumerate()
            .map(|(i, power_dist)| Simulation {
                miners: miners.clone(),
                params,
                power_dist,
                seed: seed
                    .map_or_else(rand::random, |s| s.wrapping_add(i as u64)),
            })
            .collect();

        #[cfg(feature = "rayon")]
        let outputs: Result<Vec<_>, _> =
            sims.into_par_iter().map(|sim| sim.run()).collect();
        #[cfg(not(feature = "rayon"))]
        let outputs: Result<Vec<_>, _> =
            sims.into_iter().map(|sim| sim.run()).collect();

        Ok(ResultsBuilder::new(outputs?, repeat_all))
    }
}

/// A single run of a network simulation.
#[derive(Debug, Clone)]
pub struct Simulation {
    /// Strategies of the first peers. All other peers mine honestly.
    pub miners: Vec<Box<dyn Miner>>,
    pub params: SimulationParams,
    pub power_dist: PowerDistribution,
    pub seed: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("invalid mining power distribution")]
    PowerDistributionError(#[from] PowerDistributionError),
    #[error("could not create the network overlay")]
    TopologyError(#[from] TopologyError),
}

impl Simulation {
    /// Executes the configured simulation.
    pub fn run(self) -> Result<SimulationOutput, SimulationError> {
        let Simulation { miners, params, power_dist, seed } = self;
        let n = params.num_peers;
        let mut rng = StdRng::seed_from_u64(seed);

        let slow = flags(&mut rng, n, params.slow_fraction);
        let low_cpu = flags(&mut rng, n, params.low_cpu_fraction);
        let weights: Vec<_> = low_cpu
            .iter()
            .map(|&low| if low { LOW_CPU_WEIGHT } else { HIGH_CPU_WEIGHT })
            .collect();
        let power_values = power_dist.values(&weights)?;
        let topology = Topology::random(&slow, &mut rng)?;

        let genesis = Arc::new(Block::genesis());
        let allocation: Balances =
            (0..n).map(|i| (PeerId(i), params.initial_coins)).collect();
        let mut miners = miners.into_iter();
        let peers = (0..n)
            .map(|i| {
                let profile = PeerProfile {
                    slow: slow[i],
                    low_cpu: low_cpu[i],
                    power: power_values[i],
                };
                let miner =
                    miners.next().unwrap_or_else(|| Box::new(Honest::new()));

                Peer::new(
                    PeerId(i),
                    profile,
                    miner,
                    genesis.clone(),
                    allocation.clone(),
                    params.mining_reward,
                )
            })
            .collect();

        let network_params = NetworkParams {
            txn_interval: params.txn_interval,
            block_interval: params.block_interval,
        };
        let mut network = Network::new(topology, peers, network_params, rng);
        let mut scheduler: Scheduler<NetworkEvent> = Scheduler::new();
        let mut termination =
            Termination::new(params.max_blocks, params.max_time);

        info!("simulating {} peers with seed {}", n, seed);
        network.bootstrap(&mut scheduler);
        scheduler.run(&mut network, &mut termination);
        info!(
            "finished after {} actions at {}",
            scheduler.dispatched(),
            scheduler.now()
        );

        let blocks_broadcast = network.blocks_broadcast();
        let txns_created = network.txns_created();
        let (_, peers, published) = network.into_parts();
        let longest_chain = reference_chain(&peers);

        Ok(SimulationOutput {
            peers,
            power_dist,
            power_values,
            longest_chain,
            published,
            blocks_broadcast,
            txns_created,
            end_time: scheduler.now(),
            seed,
        })
    }
}

/// Marks `round(n * fraction)` random entries of `n`.
fn flags(rng: &mut StdRng, n: usize, fraction: f64) -> Vec<bool> {
    let count = ((n as f64 * fraction).round() as usize).min(n);
    let mut flags = vec![false; n];
    for i in index::sample(rng, n, count) {
        flags[i] = true;
    }

    flags
}

/// Longest public chain over all peers' views, genesis first. Ties go to the
/// peer with the lowest ID.
fn reference_chain(peers: &[Peer]) -> Vec<BlockId> {
    let best = peers.iter().fold(None::<&Peer>, |best, peer| match best {
        Some(b)
            if b.state().public_length() >= peer.state().public_length() =>
        {
            Some(b)
        }
        _ => Some(peer),
    });

    best.map(|peer| {
        let state = peer.state();
        state.chain().ancestors_of(state.public_leaf())
    })
    .unwrap_or_default()
}

/// Stock [`Observer`] of a simulation: stops a run after a number of block
/// broadcasts or once simulated time passes a limit, and logs progress
/// every 10% of the block limit.
#[derive(Debug, Clone)]
pub struct Termination {
    max_blocks: Option<u64>,
    max_time: Option<SimTime>,
    blocks: u64,
}

impl Termination {
    pub fn new(max_blocks: Option<u64>, max_time: Option<f64>) -> Self {
        Self {
            max_blocks,
            max_time: max_time.map(SimTime::from_millis),
            blocks: 0,
        }
    }

    /// Block broadcasts observed so far.
    #[inline]
    pub fn blocks(&self) -> u64 {
        self.blocks
    }
}

impl Observer<NetworkEventKind> for Termination {
    fn observe(
        &mut self,
        now: SimTime,
        kind: NetworkEventKind,
        stop: &StopFlag,
    ) {
        if matches!(self.max_time, Some(max_time) if now > max_time) {
            info!("reached time limit at {}", now);
            stop.raise();
            return;
        }

        if kind != NetworkEventKind::BroadcastBlock {
            return;
        }
        self.blocks += 1;

        let Some(max_blocks) = self.max_blocks else {
            return;
        };
        let step = (max_blocks / 10).max(1);
        if self.blocks % step == 0 {
            info!(
                "{}% done: {}/{} blocks broadcast at {}",
                self.blocks * 100 / max_blocks.max(1),
                self.blocks,
                max_blocks,
                now
            );
        }
        if self.blocks >= max_blocks {
            stop.raise();
        }
    }
}

/// Contains the output data from a simulation.
#[derive(Debug, Clone)]
pub struct SimulationOutput {
    pub peers: Vec<Peer>,
    pub power_dist: PowerDistribution,
    /// Mining power of every peer, indexed by [`PeerId`].
    pub power_values: Vec<PowerValue>,
    /// Longest public chain at the end of the run, genesis first.
    pub longest_chain: Vec<BlockId>,
    /// Blocks broadcast by every peer, indexed by [`PeerId`].
    pub published: Vec<Vec<BlockId>>,
    pub blocks_broadcast: u64,
    pub txns_created: u64,
    pub end_time: SimTime,
    pub seed: u64,
}

impl SimulationOutput {
    /// Number of non-genesis blocks on the longest chain.
    pub fn longest_chain_length(&self) -> usize {
        self.longest_chain.len().saturating_sub(1)
    }

    /// Number of blocks on the longest chain mined by `peer`.
    pub fn blocks_in_chain(&self, peer: PeerId) -> usize {
        let Some(reference) = self.reference_peer() else {
            return 0;
        };
        let chain = reference.state().chain();

        self.longest_chain
            .iter()
            .filter(|&&id| chain[id].block.miner == Some(peer))
            .count()
    }

    /// Fraction of the longest chain's blocks mined by `peer`.
    pub fn revenue_of(&self, peer: PeerId) -> f64 {
        match self.longest_chain_length() {
            0 => 0.0,
            len => self.blocks_in_chain(peer) as f64 / len as f64,
        }
    }

    /// Number of blocks `peer` mined, published or not.
    pub fn blocks_mined_by(&self, peer: PeerId) -> usize {
        self.peers
            .get(peer.get())
            .map_or(0, |peer| peer.blocks_mined().len())
    }

    /// Blocks `peer` broadcast to the network, in order.
    pub fn blocks_published_by(&self, peer: PeerId) -> &[BlockId] {
        self.published
            .get(peer.get())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Exportable view of this run.
    pub fn snapshot(&self) -> SimulationSnapshot {
        SimulationSnapshot::of(self)
    }

    /// A peer whose tree holds the whole longest chain.
    fn reference_peer(&self) -> Option<&Peer> {
        let leaf = *self.longest_chain.last()?;
        self.peers.iter().find(|peer| peer.state().public_leaf() == leaf)
    }
}
