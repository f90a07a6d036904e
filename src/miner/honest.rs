//! Honest/Frontier mining strategy

use std::sync::Arc;

use crate::{
    block::{Block, BlockId},
    miner::{Action, Miner},
    peer::ChainState,
};

/// Mines on the public leaf and publishes every block as soon as it is
/// found.
#[derive(Debug, Default, Clone)]
pub struct Honest;

impl Honest {
    /// Creates a new honest miner.
    pub fn new() -> Self {
        Self
    }
}

impl Miner for Honest {
    fn name(&self) -> String {
        "Honest".to_string()
    }

    fn mining_parent(&self, state: &ChainState) -> BlockId {
        state.public_leaf()
    }

    fn on_mine_complete(
        &mut self,
        state: &mut ChainState,
        block: Arc<Block>,
    ) -> Action {
        state.select_leaf(block.id);

        Action::Publish(block)
    }

    fn on_competitor_block(
        &mut self,
        _state: &mut ChainState,
        _block: BlockId,
    ) -> Action {
        Action::Wait
    }
}
