//! Spin sequencing policy.
//!
//! Decides, for a 1-based spin index, whether a spin is a free weighted draw
//! or is forced to the guaranteed prize or a sequence prize, and which pool
//! the draw uses. The decision is a pure function of the template config and
//! the spin index; the per-player spin count lives in the history store.

use std::borrow::Cow;
use wheelspin_types::{Prize, SpinPolicyConfig};

/// Which rule decided a spin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Weighted draw with no forced id.
    Free,
    /// Guaranteed prize forced (every spin when enhanced mode is off, or the
    /// last slot of a sequenced cycle).
    AlwaysGuaranteed,
    /// A sequence entry forced this position of the cycle.
    Sequence,
    /// Guaranteed prize forced on every `cycle_length`-th spin.
    GuaranteedOnNth,
}

/// Input for the selector.
#[derive(Clone, Debug, PartialEq)]
pub struct Decision<'a> {
    pub mode: Mode,
    pub pool: Cow<'a, [Prize]>,
    pub forced_id: Option<&'a str>,
    pub used_guaranteed: bool,
    pub used_sequence: bool,
    /// True when the guaranteed prize was removed from `pool`.
    pub excluded_guaranteed: bool,
}

impl<'a> Decision<'a> {
    fn free(config: &'a SpinPolicyConfig) -> Self {
        Self {
            mode: Mode::Free,
            pool: Cow::Borrowed(&config.prizes),
            forced_id: None,
            used_guaranteed: false,
            used_sequence: false,
            excluded_guaranteed: false,
        }
    }

    fn guaranteed(config: &'a SpinPolicyConfig, id: &'a str, mode: Mode) -> Self {
        Self {
            mode,
            pool: Cow::Borrowed(&config.prizes),
            forced_id: Some(id),
            used_guaranteed: true,
            used_sequence: false,
            excluded_guaranteed: false,
        }
    }

    fn sequence(config: &'a SpinPolicyConfig, id: &'a str) -> Self {
        Self {
            mode: Mode::Sequence,
            pool: Cow::Borrowed(&config.prizes),
            forced_id: Some(id),
            used_guaranteed: false,
            used_sequence: true,
            excluded_guaranteed: false,
        }
    }

    /// Free draw in enhanced mode: the guaranteed prize is reserved for its
    /// slot unless that would leave nothing to draw.
    fn free_reserving(config: &'a SpinPolicyConfig, guaranteed: &str) -> Self {
        let mut decision = Self::free(config);
        if !config.exclude_guaranteed_from_free {
            return decision;
        }
        let remaining: Vec<Prize> = config
            .prizes
            .iter()
            .filter(|prize| prize.id != guaranteed)
            .cloned()
            .collect();
        if remaining.is_empty() || remaining.len() == config.prizes.len() {
            return decision;
        }
        decision.pool = Cow::Owned(remaining);
        decision.excluded_guaranteed = true;
        decision
    }
}

/// 0-indexed slot of `spin_index` within the repeating cycle.
pub fn cycle_position(spin_index: u64, cycle_length: u32) -> u64 {
    let cycle = u64::from(cycle_length.max(1));
    (spin_index.max(1) - 1) % cycle
}

/// Decide how spin number `spin_index` (1-based) is resolved.
///
/// An index of 0 is treated as the first spin.
pub fn decide(config: &SpinPolicyConfig, spin_index: u64) -> Decision<'_> {
    let Some(guaranteed) = config.guaranteed_id() else {
        return Decision::free(config);
    };
    if !config.guaranteed_enabled {
        return Decision::guaranteed(config, guaranteed, Mode::AlwaysGuaranteed);
    }

    let spin_index = spin_index.max(1);
    let cycle_length = config.effective_cycle_length();
    let cycle = u64::from(cycle_length);
    let position = cycle_position(spin_index, cycle_length);

    if config.has_sequence() {
        if position < cycle - 1 {
            return match config.sequence_slot(position as usize) {
                Some(id) => Decision::sequence(config, id),
                None => Decision::free_reserving(config, guaranteed),
            };
        }
        return Decision::guaranteed(config, guaranteed, Mode::AlwaysGuaranteed);
    }

    if spin_index % cycle == 0 {
        Decision::guaranteed(config, guaranteed, Mode::GuaranteedOnNth)
    } else {
        Decision::free_reserving(config, guaranteed)
    }
}
