use super::Prize;
use serde::{Deserialize, Serialize};

/// The resolved result of one spin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpinOutcome {
    pub prize: Prize,
    pub probability_percent: f64,
    pub used_guaranteed: bool,
    pub used_sequence: bool,
    /// 1-based count of spins in this session and template.
    pub spin_index: u64,
    /// Position of `prize` on the wheel (the template's prize order).
    pub slice_index: usize,
}

/// Rotation the presentation layer animates, in degrees.
///
/// `end_angle` is absolute in the wheel's frame: after rotating to it, the
/// center of the chosen slice sits under the pointer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationPlan {
    pub start_angle: f64,
    pub end_angle: f64,
    pub full_turns: u32,
    pub duration_seconds: f64,
}
