use serde::{Deserialize, Serialize};

/// A candidate on the wheel.
///
/// `weight` is relative: a pool of weights `[1, 2, 3]` gives the last prize
/// half of all free draws. Weights are validated to be positive when a
/// [SpinPolicyConfig](super::SpinPolicyConfig) is written, not at draw time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prize {
    pub id: String,
    pub label: String,
    pub weight: f64,
    #[serde(default)]
    pub color: String,
}

impl Prize {
    pub fn new(id: impl Into<String>, label: impl Into<String>, weight: f64) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            weight,
            color: String::new(),
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }
}

/// Probability of a single prize within its pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrizeProbability {
    pub prize: Prize,
    /// `weight / total * 100`.
    pub percent: f64,
    /// `weight / total`.
    pub fraction: f64,
}
