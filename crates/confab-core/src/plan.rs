//! Plan (InfoNav) lifecycle data.

use crate::mindfill::FactRegistry;

/// The plan progresses Draft -> Marked -> Updating within an agent's first
/// turns and stays in Updating for the rest of the communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStatus {
    /// No plan text yet; the next turn drafts one.
    Draft,
    /// Drafted; the next step marks unknown rationales with bracket slots.
    Marked,
    /// Marked; every later turn merges newly learned facts.
    Updating,
}

#[derive(Debug)]
pub struct PlanState {
    pub text: String,
    pub status: PlanStatus,
    pub facts: FactRegistry,
}

impl PlanState {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            status: PlanStatus::Draft,
            facts: FactRegistry::new(),
        }
    }
}

impl Default for PlanState {
    fn default() -> Self {
        Self::new()
    }
}
