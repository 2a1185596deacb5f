//! Cost cap accounting interface.
//!
//! The registry itself is an external collaborator of this subsystem: the
//! platform tracks per-tool budgets in USD-micros and tokens and exposes an
//! atomic check-and-reserve. The driver only consumes the interface, so it is
//! expressed as a trait here. `MemoryCostCaps` is a thread-safe in-memory
//! implementation used by tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Budget remaining for a tool, as reported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemainingBudget {
    /// Remaining budget in millionths of a USD.
    pub usd_micros_remaining: u64,
    /// Remaining token budget.
    pub tokens_remaining: u64,
}

/// Per-tool budget gate consulted before every sandboxed execution.
pub trait CostCapRegistry: Send + Sync {
    /// Atomically checks whether `tool_id` can afford the given cost and, if
    /// so, reserves it. Returns `false` and reserves nothing otherwise.
    fn check_and_update_cost(&self, tool_id: &str, usd_micros: u64, tokens: u64) -> bool;

    /// Returns the budget left for `tool_id`, or `None` if the tool is
    /// unknown to the registry.
    fn get_remaining_budget(&self, tool_id: &str) -> Option<RemainingBudget>;
}

/// In-memory cost cap registry.
///
/// Tools not explicitly registered are unconstrained: checks pass and no
/// budget snapshot is available.
#[derive(Debug, Default)]
pub struct MemoryCostCaps {
    budgets: Mutex<HashMap<String, RemainingBudget>>,
}

impl MemoryCostCaps {
    /// Creates an empty registry (all tools unconstrained).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a budget for a tool, replacing any previous one.
    pub fn set_budget(&self, tool_id: impl Into<String>, usd_micros: u64, tokens: u64) {
        let mut budgets = self.budgets.lock().unwrap_or_else(|e| e.into_inner());
        budgets.insert(
            tool_id.into(),
            RemainingBudget {
                usd_micros_remaining: usd_micros,
                tokens_remaining: tokens,
            },
        );
    }
}

impl CostCapRegistry for MemoryCostCaps {
    fn check_and_update_cost(&self, tool_id: &str, usd_micros: u64, tokens: u64) -> bool {
        let mut budgets = self.budgets.lock().unwrap_or_else(|e| e.into_inner());
        match budgets.get_mut(tool_id) {
            Some(remaining) => {
                if remaining.usd_micros_remaining >= usd_micros
                    && remaining.tokens_remaining >= tokens
                {
                    remaining.usd_micros_remaining -= usd_micros;
                    remaining.tokens_remaining -= tokens;
                    true
                } else {
                    false
                }
            }
            // Unregistered tools are not capped.
            None => true,
        }
    }

    fn get_remaining_budget(&self, tool_id: &str) -> Option<RemainingBudget> {
        let budgets = self.budgets.lock().unwrap_or_else(|e| e.into_inner());
        budgets.get(tool_id).copied()
    }
}
