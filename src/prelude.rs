/*!
Re-export of common values and datatypes used for running and analyzing
simulations. Must be imported manually.

```
use pow_network_sim::prelude::*;
```
*/

use crate::{
    block, blockchain, miner, peer, power_dist, results, scheduler,
    simulation, transaction,
};

pub use block::{Block, BlockId};

pub use blockchain::{BlockValidationError, Blockchain};

pub use miner::{honest::Honest, selfish::Selfish, Action, Miner};

pub use peer::{ChainState, Peer, PeerId, PeerProfile};

pub use power_dist::{
    Percent, PowerDistribution, PowerDistributionError, PowerValue,
};

pub use results::{selfish_revenue, Average, Format, ResultsBuilder};

pub use scheduler::SimTime;

pub use simulation::{
    SimulationBuildError, SimulationBuilder, SimulationConfig,
    SimulationError, SimulationGroup, SimulationOutput,
};

pub use transaction::{Transaction, TxnId};
