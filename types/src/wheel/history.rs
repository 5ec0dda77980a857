use super::{SpinOutcome, DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Spin,
    Claim,
}

/// An append-only record of a spin or a claim.
///
/// The only field that changes after creation is `claimed_at`, set once on
/// a spin entry when its prize is claimed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub session_id: String,
    #[serde(default)]
    pub player_id: Option<String>,
    pub template: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub outcome: SpinOutcome,
    #[serde(default)]
    pub request_id: Option<String>,
    /// For claims, the id of the spin entry being claimed.
    #[serde(default)]
    pub outcome_ref: Option<u64>,
    #[serde(default)]
    pub claimed_at: Option<u64>,
}

/// A history entry before the store assigns its id.
#[derive(Clone, Debug, PartialEq)]
pub struct NewEntry {
    pub kind: EntryKind,
    pub session_id: String,
    pub player_id: Option<String>,
    pub template: String,
    pub timestamp: u64,
    pub outcome: SpinOutcome,
    pub request_id: Option<String>,
    pub outcome_ref: Option<u64>,
}

impl NewEntry {
    pub fn into_entry(self, id: u64) -> HistoryEntry {
        HistoryEntry {
            id,
            kind: self.kind,
            session_id: self.session_id,
            player_id: self.player_id,
            template: self.template,
            timestamp: self.timestamp,
            outcome: self.outcome,
            request_id: self.request_id,
            outcome_ref: self.outcome_ref,
            claimed_at: None,
        }
    }
}

/// Filter for history queries. Results are ordered most-recent-first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryFilter {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl HistoryFilter {
    /// The page size to use, clamped to `[1, MAX_HISTORY_LIMIT]`.
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }

    pub fn matches(&self, entry: &HistoryEntry) -> bool {
        if let Some(session_id) = &self.session_id {
            if &entry.session_id != session_id {
                return false;
            }
        }
        if let Some(template) = &self.template {
            if &entry.template != template {
                return false;
            }
        }
        true
    }
}

/// Aggregate counts over the history.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_spins: u64,
    pub total_claims: u64,
    /// Distinct sessions with at least one entry.
    pub active_sessions: u64,
}
