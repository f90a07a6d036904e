/*!
Definitions for mining strategies

A strategy is any type which implements the [`Miner`] trait. It decides which
block its peer mines on and what happens to the blocks the peer mines. The
surrounding [`Peer`](crate::peer::Peer) takes care of validation, fork
choice, and scheduling.

# Built-In Strategies
- Honest Mining [`honest::Honest`]
- Selfish Mining [`selfish::Selfish`]

# Examples
A strategy which mines on the public leaf, but never publishes anything.

```
use std::sync::Arc;

use pow_network_sim::prelude::*;

#[derive(Debug, Clone)]
struct Hoarder;

impl Miner for Hoarder {
    fn name(&self) -> String {
        "Hoarder".to_string()
    }

    fn mining_parent(&self, state: &ChainState) -> BlockId {
        state.public_leaf()
    }

    fn on_mine_complete(
        &mut self,
        _state: &mut ChainState,
        _block: Arc<Block>,
    ) -> Action {
        Action::Wait
    }

    fn on_competitor_block(
        &mut self,
        _state: &mut ChainState,
        _block: BlockId,
    ) -> Action {
        Action::Wait
    }
}
```
*/

use std::{fmt::Debug, sync::Arc};

use crate::{
    block::{Block, BlockId},
    peer::ChainState,
};

pub mod honest;
pub mod selfish;

pub use honest::Honest;
pub use selfish::Selfish;

/// Blocks a strategy wants released to the network.
#[derive(Debug, Clone)]
pub enum Action {
    /// Don't publish any blocks.
    Wait,
    /// Publish the given block.
    Publish(Arc<Block>),
    /// Publish the given blocks in order, oldest first, so that receivers
    /// see parents before children.
    PublishSet(Vec<Arc<Block>>),
}

/// Defines the behavior of a mining strategy.
pub trait Miner: Debug + dyn_clone::DynClone + Send + Sync {
    /// Returns the name of this miner's strategy.
    ///
    /// The return value of this method will appear in the "Strategy" column
    /// of [`ResultsTable`](crate::results::ResultsTable).
    fn name(&self) -> String;

    /// The block the next mining attempt builds on.
    fn mining_parent(&self, state: &ChainState) -> BlockId;

    /// Whether blocks mined under this strategy are withheld at first.
    fn withholds(&self) -> bool {
        false
    }

    /// Called once the peer's own freshly mined `block` has been accepted
    /// into its chain.
    fn on_mine_complete(
        &mut self,
        state: &mut ChainState,
        block: Arc<Block>,
    ) -> Action;

    /// Called when a block mined by someone else has just become the peer's
    /// public leaf.
    fn on_competitor_block(
        &mut self,
        state: &mut ChainState,
        block: BlockId,
    ) -> Action;
}

dyn_clone::clone_trait_object!(Miner);
