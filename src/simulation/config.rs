/*!
YAML configuration of a simulation group

Every field is optional. A minimal configuration with one selfish peer
holding 30% of the mining power:

```
use pow_network_sim::simulation::SimulationConfig;

let config = SimulationConfig::from_yaml("
peers: 10
max_blocks: 50
seed: 42
selfish:
  - power: 0.3
").unwrap();

assert_eq!(config.peers, 10);
assert!(config.into_builder().build().is_ok());
```
*/

use std::{fs, path::{Path, PathBuf}};

use log::LevelFilter;
use serde::Deserialize;

use crate::{
    miner::Selfish,
    peer::PeerId,
    power_dist::{PowerDistribution, PowerValue},
    results::{Average, Format},
    transaction::Coins,
};

use super::{SimulationBuilder, SimulationParams};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unknown log level {0:?}")]
    BadLogLevel(String),
}

/// Configuration of a [`SimulationGroup`](super::SimulationGroup) and of
/// how its results are reported.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    pub peers: usize,
    pub slow_fraction: f64,
    pub low_cpu_fraction: f64,
    /// Mean time between transactions of one peer (ms).
    pub txn_interval: f64,
    /// Mean time between blocks of the whole network (ms).
    pub block_interval: f64,
    pub initial_coins: Coins,
    pub mining_reward: Coins,
    pub max_blocks: Option<u64>,
    /// Time limit of each run (ms).
    pub max_time: Option<f64>,
    pub seed: Option<u64>,
    pub repeat: usize,
    /// Selfish peers, assigned to peers `0, 1, ...` in order.
    pub selfish: Vec<SelfishPeer>,
    /// One of `off`, `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelfishPeer {
    /// Fixed share of the total mining power. Peers without a fixed share
    /// get power according to their CPU weight.
    pub power: Option<PowerValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub format: Format,
    pub average: Average,
    /// Adds the ideal selfish revenue for this gamma as a column.
    pub gamma: Option<f64>,
    /// Where to write YAML snapshots of every run.
    pub snapshot: Option<PathBuf>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let params = SimulationParams::default();

        Self {
            peers: params.num_peers,
            slow_fraction: params.slow_fraction,
            low_cpu_fraction: params.low_cpu_fraction,
            txn_interval: params.txn_interval,
            block_interval: params.block_interval,
            initial_coins: params.initial_coins,
            mining_reward: params.mining_reward,
            max_blocks: params.max_blocks,
            max_time: params.max_time,
            seed: None,
            repeat: 1,
            selfish: vec![],
            log_level: "info".to_string(),
            output: OutputConfig::default(),
        }
    }
}

impl SimulationConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path).map_err(|source| {
            ConfigError::Io { path: path.to_path_buf(), source }
        })?;

        Self::from_yaml(&yaml)
    }

    pub fn log_level(&self) -> Result<LevelFilter, ConfigError> {
        self.log_level
            .parse()
            .map_err(|_| ConfigError::BadLogLevel(self.log_level.clone()))
    }

    /// Peers given a fixed power share by the configuration.
    pub fn fixed_power(&self) -> Vec<(PeerId, PowerValue)> {
        self.selfish
            .iter()
            .enumerate()
            .filter_map(|(i, peer)| peer.power.map(|power| (PeerId(i), power)))
            .collect()
    }

    pub fn into_builder(self) -> SimulationBuilder {
        let power_dist = match self.fixed_power() {
            fixed if fixed.is_empty() => PowerDistribution::Proportional,
            fixed => PowerDistribution::SetPeers(fixed),
        };

        let mut builder = SimulationBuilder::new()
            .peers(self.peers)
            .slow_fraction(self.slow_fraction)
            .low_cpu_fraction(self.low_cpu_fraction)
            .txn_interval(self.txn_interval)
            .block_interval(self.block_interval)
            .initial_coins(self.initial_coins)
            .mining_reward(self.mining_reward)
            .max_blocks(self.max_blocks)
            .max_time(self.max_time)
            .repeat_all(self.repeat)
            .power_dist(power_dist);

        if let Some(seed) = self.seed {
            builder = builder.seed(seed);
        }
        for _ in &self.selfish {
            builder = builder.add_miner(Selfish::new());
        }

        builder
    }
}
