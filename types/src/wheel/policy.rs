use super::{Prize, MAX_CYCLE_LENGTH, MIN_CYCLE_LENGTH};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// A policy config that must not be stored.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("prize at position {index} has a blank id")]
    BlankPrizeId { index: usize },
    #[error("prize id {id} appears more than once")]
    DuplicatePrizeId { id: String },
    #[error("prize {id} has invalid weight {weight} (must be finite and > 0)")]
    InvalidWeight { id: String, weight: f64 },
}

fn default_cycle_length() -> u32 {
    MIN_CYCLE_LENGTH
}

fn default_exclude_guaranteed_from_free() -> bool {
    true
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|id| !id.trim().is_empty())
}

/// Per-template prize policy.
///
/// `sequence[i]` forces the prize drawn at position `i` of every cycle
/// (0-indexed). Blank or missing entries leave that position to the weighted
/// draw. The last position of a cycle belongs to the guaranteed prize.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpinPolicyConfig {
    pub prizes: Vec<Prize>,
    #[serde(default)]
    pub guaranteed_prize_id: Option<String>,
    #[serde(default)]
    pub guaranteed_enabled: bool,
    #[serde(default = "default_cycle_length")]
    pub cycle_length: u32,
    #[serde(default)]
    pub sequence: Vec<Option<String>>,
    /// Keep the guaranteed prize out of off-slot free draws in enhanced mode.
    #[serde(default = "default_exclude_guaranteed_from_free")]
    pub exclude_guaranteed_from_free: bool,
}

impl Default for SpinPolicyConfig {
    fn default() -> Self {
        Self {
            prizes: Vec::new(),
            guaranteed_prize_id: None,
            guaranteed_enabled: false,
            cycle_length: MIN_CYCLE_LENGTH,
            sequence: Vec::new(),
            exclude_guaranteed_from_free: true,
        }
    }
}

impl SpinPolicyConfig {
    pub fn new(prizes: Vec<Prize>) -> Self {
        Self {
            prizes,
            ..Self::default()
        }
    }

    /// The configured guaranteed prize, if it is not blank.
    pub fn guaranteed_id(&self) -> Option<&str> {
        non_blank(&self.guaranteed_prize_id)
    }

    /// The prize id forced at `position` of the cycle, if any.
    pub fn sequence_slot(&self, position: usize) -> Option<&str> {
        self.sequence.get(position).and_then(non_blank)
    }

    /// True when at least one sequence entry names a prize.
    pub fn has_sequence(&self) -> bool {
        self.sequence.iter().any(|slot| non_blank(slot).is_some())
    }

    /// Largest cycle length allowed for the current pool.
    pub fn max_cycle_length(&self) -> u32 {
        if self.prizes.is_empty() {
            return MAX_CYCLE_LENGTH;
        }
        let pool = u32::try_from(self.prizes.len()).unwrap_or(u32::MAX);
        pool.max(MIN_CYCLE_LENGTH)
    }

    /// Cycle length used at draw time. Never below [MIN_CYCLE_LENGTH], even
    /// if a config skipped [SpinPolicyConfig::sanitize].
    pub fn effective_cycle_length(&self) -> u32 {
        self.cycle_length.max(MIN_CYCLE_LENGTH)
    }

    /// Position of the prize with `id` in the pool.
    pub fn prize_index(&self, id: &str) -> Option<usize> {
        self.prizes.iter().position(|prize| prize.id == id)
    }

    /// Checks the pool invariants: non-blank unique ids and positive weights.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::with_capacity(self.prizes.len());
        for (index, prize) in self.prizes.iter().enumerate() {
            if prize.id.trim().is_empty() {
                return Err(ConfigError::BlankPrizeId { index });
            }
            if !seen.insert(prize.id.as_str()) {
                return Err(ConfigError::DuplicatePrizeId {
                    id: prize.id.clone(),
                });
            }
            if !prize.weight.is_finite() || prize.weight <= 0.0 {
                return Err(ConfigError::InvalidWeight {
                    id: prize.id.clone(),
                    weight: prize.weight,
                });
            }
        }
        Ok(())
    }

    /// Validates the pool and normalizes the rest of the config for storage:
    /// the cycle length is clamped into `[2, max_cycle_length()]` and blank
    /// ids are stored as `None`.
    pub fn sanitize(mut self) -> Result<Self, ConfigError> {
        self.validate()?;
        self.cycle_length = self
            .cycle_length
            .clamp(MIN_CYCLE_LENGTH, self.max_cycle_length());
        if self.guaranteed_id().is_none() {
            self.guaranteed_prize_id = None;
        }
        for slot in self.sequence.iter_mut() {
            if non_blank(slot).is_none() {
                *slot = None;
            }
        }
        Ok(self)
    }
}
