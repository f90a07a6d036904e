//! Selfish mining implementation

use std::{collections::VecDeque, sync::Arc};

use log::debug;

use crate::{
    block::{Block, BlockId},
    miner::{Action, Miner},
    peer::ChainState,
};

/// Follows the selfish mining strategy described by
/// [Eyal and Sirer](https://doi.org/10.48550/arXiv.1311.0243).
///
/// Newly mined blocks are withheld on a secret chain. The lead of the secret
/// chain over the public one decides how many withheld blocks are released
/// each time a competing block extends the public chain.
#[derive(Debug, Default, Clone)]
pub struct Selfish {
    /// Lead of the secret chain over the public chain.
    lead: i64,
    /// All blocks which are mined, but unpublished, oldest first.
    withheld: VecDeque<Arc<Block>>,
    /// Last block mined by this peer, or the public leaf after giving up on
    /// the secret chain. `None` until either happens.
    secret_tip: Option<BlockId>,
    /// `None` means the public leaf.
    mining_parent: Option<BlockId>,
}

impl Selfish {
    /// Creates a new selfish miner.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn lead(&self) -> i64 {
        self.lead
    }

    /// Mined but unpublished blocks, oldest first.
    pub fn withheld(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.withheld.iter().map(|block| block.id)
    }

    #[inline]
    pub fn secret_tip(&self) -> Option<BlockId> {
        self.secret_tip
    }

    /// Applies a lead change of `delta` and returns the blocks to release.
    ///
    /// ## Panics
    /// If `delta` is not `1` or `-1`, or if the lead or the withheld blocks
    /// are in a state the transitions can never produce.
    fn update_lead(&mut self, delta: i64, state: &mut ChainState) -> Action {
        let old_lead = self.lead;
        assert_ne!(delta, 0, "{}: lead change of 0", state.peer());
        assert_eq!(
            delta.abs(),
            1,
            "{}: lead may only change by one block at a time",
            state.peer()
        );

        if delta > 0 {
            self.lead = old_lead + 1;
            self.mining_parent = self.secret_tip;
            debug!("{}: lead {} -> {}", state.peer(), old_lead, self.lead);
            return Action::Wait;
        }

        let (new_lead, action) = match old_lead {
            lead if lead > 2 => {
                let Some(oldest) = self.withheld.pop_front() else {
                    panic!(
                        "{}: lead {} without withheld blocks",
                        state.peer(),
                        lead
                    )
                };
                self.mining_parent = self.secret_tip;

                (lead - 1, Action::Publish(oldest))
            }
            2 => {
                self.mining_parent = self.secret_tip;
                (0, Action::PublishSet(self.withheld.drain(..).collect()))
            }
            1 => {
                self.mining_parent = self.secret_tip;
                (-1, Action::PublishSet(self.withheld.drain(..).collect()))
            }
            -1 => {
                self.mining_parent = Some(state.public_leaf());
                (0, Action::Wait)
            }
            0 => {
                for block in self.withheld.drain(..) {
                    state.discard(block.id);
                }
                self.secret_tip = Some(state.public_leaf());
                self.mining_parent = self.secret_tip;

                (0, Action::Wait)
            }
            lead => panic!("{}: unreachable lead {}", state.peer(), lead),
        };

        debug!("{}: lead {} -> {}", state.peer(), old_lead, new_lead);
        self.lead = new_lead;

        action
    }
}

impl Miner for Selfish {
    fn name(&self) -> String {
        "Selfish".to_string()
    }

    fn mining_parent(&self, state: &ChainState) -> BlockId {
        self.mining_parent.unwrap_or_else(|| state.public_leaf())
    }

    fn withholds(&self) -> bool {
        true
    }

    fn on_mine_complete(
        &mut self,
        state: &mut ChainState,
        block: Arc<Block>,
    ) -> Action {
        self.secret_tip = Some(block.id);
        self.withheld.push_back(block);

        self.update_lead(1, state)
    }

    fn on_competitor_block(
        &mut self,
        state: &mut ChainState,
        _block: BlockId,
    ) -> Action {
        self.update_lead(-1, state)
    }
}
