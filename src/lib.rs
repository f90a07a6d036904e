/*!
Discrete-event simulator of a proof-of-work blockchain network.

Peers connected by latency-bearing links create transactions and mine
blocks. Every peer keeps its own view of the block tree and follows a mining
strategy: honest peers publish each block as soon as they find it, while
selfish peers withhold blocks to build a private lead over the public chain.

Simulations are described with a
[`SimulationBuilder`](simulation::SimulationBuilder) (or a YAML
[`SimulationConfig`](simulation::SimulationConfig)), run as a
[`SimulationGroup`](simulation::SimulationGroup), and analyzed with a
[`ResultsBuilder`](results::ResultsBuilder).
*/

pub mod block;
pub mod blockchain;
pub mod miner;
pub mod network;
pub mod peer;
pub mod power_dist;
pub mod prelude;
pub mod results;
pub mod scheduler;
pub mod simulation;
pub mod transaction;

pub(crate) mod utils;
