use serde::{Deserialize, Serialize};

/// Spin allowance for a player, optionally scoped to one template.
///
/// `max_spins == None` means unlimited.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpinBudget {
    pub player_id: String,
    pub max_spins: Option<u32>,
    pub template: Option<String>,
    pub spins_used: u32,
}

impl SpinBudget {
    /// The default budget of a player nobody has configured: unlimited.
    pub fn unlimited(player_id: impl Into<String>, template: Option<String>) -> Self {
        Self {
            player_id: player_id.into(),
            max_spins: None,
            template,
            spins_used: 0,
        }
    }

    /// Spins left, or `None` when unlimited.
    pub fn remaining(&self) -> Option<u32> {
        self.max_spins
            .map(|max| max.saturating_sub(self.spins_used))
    }

    /// True when another spin may be consumed.
    pub fn can_spin(&self) -> bool {
        match self.max_spins {
            Some(max) => self.spins_used < max,
            None => true,
        }
    }
}

/// Identifies a stored budget: a player, and optionally a template.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetKey {
    pub player_id: String,
    pub template: Option<String>,
}

impl BudgetKey {
    pub fn new(player_id: impl Into<String>, template: Option<String>) -> Self {
        Self {
            player_id: player_id.into(),
            template,
        }
    }

    /// The player-wide key this key falls back to.
    pub fn player_wide(&self) -> Self {
        Self {
            player_id: self.player_id.clone(),
            template: None,
        }
    }
}
