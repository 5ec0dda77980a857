//! Request and response bodies of the HTTP API.

use crate::wheel::{HistoryEntry, RotationPlan, SpinBudget, SpinOutcome};
use serde::{Deserialize, Serialize};

/// Error code returned when a player has no spins left.
pub const ERROR_NO_SPINS_REMAINING: &str = "no_spins_remaining";
/// Error code returned when persistence is unreachable.
pub const ERROR_UNAVAILABLE: &str = "unavailable";
pub const ERROR_EMPTY_POOL: &str = "empty_pool";
pub const ERROR_UNKNOWN_TEMPLATE: &str = "unknown_template";
pub const ERROR_INVALID_CONFIG: &str = "invalid_config";
pub const ERROR_INVALID_REQUEST: &str = "invalid_request";
pub const ERROR_NOT_FOUND: &str = "not_found";
pub const ERROR_ALREADY_CLAIMED: &str = "already_claimed";
pub const ERROR_IN_PROGRESS: &str = "in_progress";
pub const ERROR_INTERNAL: &str = "internal";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpinRequest {
    pub session_id: String,
    #[serde(default)]
    pub player_id: Option<String>,
    pub template: String,
    /// 1-based spin number. Derived from history when absent.
    #[serde(default)]
    pub spin_index: Option<u64>,
    /// Idempotency key. Retrying with the same key never consumes twice.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Current wheel rotation in degrees, so the animation starts in place.
    #[serde(default)]
    pub current_rotation: Option<f64>,
}

impl SpinRequest {
    pub fn new(session_id: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            player_id: None,
            template: template.into(),
            spin_index: None,
            request_id: None,
            current_rotation: None,
        }
    }

    pub fn with_player(mut self, player_id: impl Into<String>) -> Self {
        self.player_id = Some(player_id.into());
        self
    }

    pub fn with_spin_index(mut self, spin_index: u64) -> Self {
        self.spin_index = Some(spin_index);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpinResponse {
    /// History entry id, used to claim the prize.
    pub entry_id: u64,
    pub outcome: SpinOutcome,
    pub animation: RotationPlan,
    /// Budget after this spin, when the request named a player.
    pub budget: Option<SpinBudget>,
    /// True when this response replays an earlier request with the same key.
    #[serde(default)]
    pub replayed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub entry_id: u64,
    pub session_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLimitRequest {
    pub max_spins: Option<u32>,
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantRequest {
    pub additional: u32,
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateQuery {
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: HealthStatus,
    pub degraded: bool,
    pub backend: String,
}

/// Body of every non-2xx response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            message: message.into(),
        }
    }
}

/// A history entry as pushed over the updates WebSocket.
pub type Update = HistoryEntry;
