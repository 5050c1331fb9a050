//! End-to-end Integration Test Suite
//!
//! Tests that verify the complete session flow over the in-memory mesh:
//! - Symmetric discovery collapsing to one link per pair
//! - Color propagation to every connected peer
//! - Link loss reflected in every snapshot
//! - Admission policy and discovery failures

use std::time::Duration;

use shutter_core::ColorSelection;

use crate::scenario::MeshScenario;

/// Outcome of one broadcast round
#[derive(Debug, Clone)]
pub struct ColorRoundResult {
    pub sender: usize,
    pub selection: ColorSelection,
    /// Nodes whose snapshot shows the selection, sender included
    pub reached: Vec<usize>,
    /// Nodes that never showed it before the timeout
    pub missed: Vec<usize>,
}

impl ColorRoundResult {
    pub fn passed(&self) -> bool {
        self.missed.is_empty()
    }
}

/// Broadcast from `sender` and wait until every node reports the selection
pub async fn run_color_round(
    scenario: &MeshScenario,
    sender: usize,
    selection: ColorSelection,
    timeout: Duration,
) -> ColorRoundResult {
    scenario.node(sender).broadcast(selection);

    let converged = |s: &MeshScenario| {
        s.snapshots()
            .iter()
            .all(|snapshot| snapshot.last_selection == Some(selection))
    };
    scenario.wait_for(timeout, converged).await;

    let (reached, missed): (Vec<usize>, Vec<usize>) = (0..scenario.len())
        .partition(|&i| scenario.node(i).snapshot().last_selection == Some(selection));

    ColorRoundResult {
        sender,
        selection,
        reached,
        missed,
    }
}
