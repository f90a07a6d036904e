use std::num::NonZeroUsize;

use crate::{
    miner::Miner,
    peer::PeerId,
    power_dist::{PowerDistribution, PowerDistributionError, PowerValue},
    transaction::Coins,
};

use super::{SimulationGroup, SimulationParams};

/// Builds a [`SimulationGroup`].
///
/// Miners added with [`add_miner`](Self::add_miner) are assigned to peers
/// `0, 1, 2, ...` in the order of addition. All remaining peers mine
/// honestly.
#[derive(Debug, Clone, Default)]
pub struct SimulationBuilder {
    miners: Vec<Box<dyn Miner>>,
    params: SimulationParams,
    power_dists: Vec<PowerDistribution>,
    repeat_all: Option<usize>,
    seed: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum SimulationBuildError {
    #[error("a network needs at least one peer")]
    NoPeers,
    #[error("{0} miners were added to a network of {1} peers")]
    TooManyMiners(usize, usize),
    #[error("{name} must be a fraction between 0.0 and 1.0, got {value}")]
    BadFraction { name: &'static str, value: f64 },
    #[error("{name} must be a positive number of milliseconds, got {value}")]
    BadInterval { name: &'static str, value: f64 },
    #[error("{name} must be a non-negative amount of coins, got {value}")]
    BadAmount { name: &'static str, value: Coins },
    #[error("simulation has no block or time limit")]
    Unbounded,
    #[error("cannot repeat simulations 0 times")]
    RepeatZero,
    #[error(transparent)]
    PowerDistributionError(#[from] PowerDistributionError),
}

impl SimulationBuilder {
    /// Creates a new [`SimulationBuilder`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `miner` to the next peer without a strategy.
    pub fn add_miner<M: Miner + 'static>(mut self, miner: M) -> Self {
        self.miners.push(Box::new(miner));

        self
    }

    /// Add each miner in `miners` with [`add_miner`](Self::add_miner).
    pub fn add_miners<I>(mut self, miners: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn Miner>>,
    {
        self.miners.extend(miners);

        self
    }

    /// Sets the number of peers in the network (default 20).
    pub fn peers(mut self, num_peers: usize) -> Self {
        self.params.num_peers = num_peers;

        self
    }

    /// Sets the fraction of peers with slow links (default 0.3).
    pub fn slow_fraction(mut self, fraction: f64) -> Self {
        self.params.slow_fraction = fraction;

        self
    }

    /// Sets the fraction of low-CPU peers (default 0.2).
    pub fn low_cpu_fraction(mut self, fraction: f64) -> Self {
        self.params.low_cpu_fraction = fraction;

        self
    }

    /// Sets the mean time between transactions of one peer in milliseconds
    /// (default 10).
    pub fn txn_interval(mut self, millis: f64) -> Self {
        self.params.txn_interval = millis;

        self
    }

    /// Sets the mean time between blocks of the whole network in
    /// milliseconds (default 600).
    pub fn block_interval(mut self, millis: f64) -> Self {
        self.params.block_interval = millis;

        self
    }

    /// Sets the genesis balance of every peer (default 1000).
    pub fn initial_coins(mut self, coins: Coins) -> Self {
        self.params.initial_coins = coins;

        self
    }

    /// Sets the amount paid by coinbase transactions (default 50).
    pub fn mining_reward(mut self, coins: Coins) -> Self {
        self.params.mining_reward = coins;

        self
    }

    /// Each simulation stops after `blocks` block broadcasts (default 100).
    /// `None` removes the limit.
    pub fn max_blocks(mut self, blocks: Option<u64>) -> Self {
        self.params.max_blocks = blocks;

        self
    }

    /// Each simulation stops once simulated time exceeds `millis`.
    pub fn max_time(mut self, millis: Option<f64>) -> Self {
        self.params.max_time = millis;

        self
    }

    /// Each simulation will be run `times` times.
    pub fn repeat_all(mut self, times: usize) -> Self {
        self.repeat_all = Some(times);

        self
    }

    /// Seeds run `i` of the group with `seed + i`. Unseeded runs draw a
    /// random seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);

        self
    }

    /// Adds a simulation with the given [`PowerDistribution`].
    pub fn power_dist(mut self, power_dist: PowerDistribution) -> Self {
        self.power_dists.push(power_dist);

        self
    }

    /// Adds a simulation in which mining power follows each peer's CPU
    /// weight (this is the default behavior).
    pub fn proportional_power(self) -> Self {
        self.power_dist(PowerDistribution::Proportional)
    }

    /// Adds a simulation in which the mining power of every peer is equal to
    /// what's specified by `values`.
    pub fn power_values<I>(self, values: I) -> Self
    where
        I: IntoIterator<Item = PowerValue>,
    {
        let dist = values.into_iter().collect();
        self.power_dist(PowerDistribution::SetValues(dist))
    }

    /// Adds a simulation in which the mining power of `peer` is `value`,
    /// with the rest distributed by CPU weight.
    pub fn peer_power(self, peer: PeerId, value: PowerValue) -> Self {
        self.power_dist(PowerDistribution::SetPeers(vec![(peer, value)]))
    }

    /// Call [`peer_power`](Self::peer_power) once for each element of
    /// `values`.
    pub fn peer_power_iter<I>(mut self, peer: PeerId, values: I) -> Self
    where
        I: IntoIterator<Item = PowerValue>,
    {
        for value in values {
            self = self.peer_power(peer, value);
        }

        self
    }

    /// Creates a [`SimulationGroup`] from the specified parameters.
    pub fn build(self) -> Result<SimulationGroup, SimulationBuildError> {
        use SimulationBuildError::*;

        let SimulationBuilder {
            miners,
            params,
            mut power_dists,
            repeat_all,
            seed,
        } = self;

        let n = params.num_peers;
        if n == 0 {
            return Err(NoPeers);
        }
        if miners.len() > n {
            return Err(TooManyMiners(miners.len(), n));
        }

        for (name, value) in [
            ("slow_fraction", params.slow_fraction),
            ("low_cpu_fraction", params.low_cpu_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(BadFraction { name, value });
            }
        }
        for (name, value) in [
            ("txn_interval", params.txn_interval),
            ("block_interval", params.block_interval),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(BadInterval { name, value });
            }
        }
        for (name, value) in [
            ("initial_coins", params.initial_coins),
            ("mining_reward", params.mining_reward),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(BadAmount { name, value });
            }
        }
        if let Some(value) = params.max_time.filter(|t| !(*t >= 0.0)) {
            return Err(BadInterval { name: "max_time", value });
        }
        if params.max_blocks.is_none() && params.max_time.is_none() {
            return Err(Unbounded);
        }

        let repeat_all = match repeat_all {
            Some(x) => NonZeroUsize::new(x).ok_or(RepeatZero)?,
            None => NonZeroUsize::MIN,
        };

        if power_dists.is_empty() {
            power_dists.push(PowerDistribution::Proportional);
        }
        for power_dist in &power_dists {
            power_dist.validate(n)?;
        }

        Ok(SimulationGroup { miners, params, power_dists, repeat_all, seed })
    }
}
