use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    future::Future,
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use thiserror::Error;
use tracing::error;
use wheelspin_types::{
    BudgetKey, EntryKind, HistoryEntry, HistoryFilter, NewEntry, SpinBudget, Stats,
};

/// Request ids remembered per budget for idempotent consumption.
pub const MAX_TRACKED_REQUESTS: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store timed out after {0:?}")]
    Timeout(Duration),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt store record: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result of consuming one spin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Consume {
    /// One spin was charged; carries the budget after the charge.
    Consumed(SpinBudget),
    /// The request id was already charged; nothing changed.
    Replayed(SpinBudget),
    /// No spins left; nothing changed.
    Exhausted(SpinBudget),
}

/// Result of claiming a spin entry.
#[derive(Clone, Debug, PartialEq)]
pub enum Claim {
    /// The spin was stamped; carries `(spin, claim)` entries.
    Claimed(HistoryEntry, HistoryEntry),
    /// The spin was claimed before; carries the spin entry.
    AlreadyClaimed(HistoryEntry),
    /// The id names a claim entry, not a spin.
    NotASpin,
    /// No entry with that id belongs to the session.
    Missing,
}

/// Per-player spin budgets.
///
/// A lookup for `(player, Some(template))` uses the template's own budget when
/// one was set, else the player-wide `(player, None)` budget. Players with no
/// budget are unlimited.
pub trait BudgetStore: Send + Sync {
    /// Current budget for `key`.
    fn budget(&self, key: &BudgetKey)
        -> impl Future<Output = Result<SpinBudget, StoreError>> + Send;

    /// Overwrite the ceiling stored at exactly `key`. Usage is kept.
    fn set_limit(
        &self,
        key: BudgetKey,
        max_spins: Option<u32>,
    ) -> impl Future<Output = Result<SpinBudget, StoreError>> + Send;

    /// Atomically charge one spin unless the ceiling is reached.
    fn try_consume(
        &self,
        key: &BudgetKey,
        request_id: Option<&str>,
    ) -> impl Future<Output = Result<Consume, StoreError>> + Send;

    /// Undo a charge made by [BudgetStore::try_consume].
    fn release(
        &self,
        key: &BudgetKey,
        request_id: Option<&str>,
    ) -> impl Future<Output = Result<SpinBudget, StoreError>> + Send;
}

/// Append-only spin and claim history.
pub trait HistoryStore: Send + Sync {
    /// Append an entry and assign it the next id.
    fn append(&self, entry: NewEntry)
        -> impl Future<Output = Result<HistoryEntry, StoreError>> + Send;

    fn entry(
        &self,
        id: u64,
    ) -> impl Future<Output = Result<Option<HistoryEntry>, StoreError>> + Send;

    /// The spin entry recorded for an idempotency key.
    fn find_by_request(
        &self,
        request_id: &str,
    ) -> impl Future<Output = Result<Option<HistoryEntry>, StoreError>> + Send;

    /// Stamp `claimed_at` on a spin of `session_id` and append the claim
    /// entry, as one operation.
    fn claim(
        &self,
        spin_id: u64,
        session_id: &str,
        claimed_at: u64,
    ) -> impl Future<Output = Result<Claim, StoreError>> + Send;

    /// Matching entries, most recent first.
    fn query(
        &self,
        filter: &HistoryFilter,
    ) -> impl Future<Output = Result<Vec<HistoryEntry>, StoreError>> + Send;

    fn stats(&self, template: Option<&str>)
        -> impl Future<Output = Result<Stats, StoreError>> + Send;

    /// Number of spins recorded for a session on a template.
    fn count_spins(
        &self,
        session_id: &str,
        template: &str,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

/// Which backend is serving store calls.
pub trait Tier {
    fn backend(&self) -> &'static str;

    /// True when calls are served by an ephemeral fallback, or when the
    /// store is recovering from a failed write.
    fn degraded(&self) -> bool {
        false
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BudgetRow {
    pub budget: SpinBudget,
    #[serde(default)]
    pub requests: VecDeque<String>,
}

impl BudgetRow {
    fn new(key: &BudgetKey) -> Self {
        Self {
            budget: SpinBudget::unlimited(key.player_id.clone(), key.template.clone()),
            requests: VecDeque::new(),
        }
    }

    fn remember(&mut self, request_id: &str) {
        if self.requests.len() == MAX_TRACKED_REQUESTS {
            self.requests.pop_front();
        }
        self.requests.push_back(request_id.to_string());
    }
}

/// Budget table shared by the memory and journal stores.
///
/// Mutations are planned against the table first and applied afterwards, so
/// a durable store can persist the planned row before the table changes.
#[derive(Debug, Default)]
pub(crate) struct Budgets {
    rows: HashMap<BudgetKey, BudgetRow>,
}

impl Budgets {
    /// The key whose row governs `key`, if any row does.
    fn resolve(&self, key: &BudgetKey) -> Option<BudgetKey> {
        if self.rows.contains_key(key) {
            return Some(key.clone());
        }
        let player_wide = key.player_wide();
        self.rows.contains_key(&player_wide).then_some(player_wide)
    }

    pub fn status(&self, key: &BudgetKey) -> SpinBudget {
        self.resolve(key)
            .and_then(|resolved| self.rows.get(&resolved))
            .map(|row| row.budget.clone())
            .unwrap_or_else(|| SpinBudget::unlimited(key.player_id.clone(), key.template.clone()))
    }

    pub fn plan_set_limit(&self, key: BudgetKey, max_spins: Option<u32>) -> (BudgetKey, BudgetRow) {
        let mut row = self.rows.get(&key).cloned().unwrap_or_else(|| BudgetRow::new(&key));
        row.budget.max_spins = max_spins;
        (key, row)
    }

    pub fn plan_consume(
        &self,
        key: &BudgetKey,
        request_id: Option<&str>,
    ) -> (Consume, Option<(BudgetKey, BudgetRow)>) {
        // Budgets are created lazily at the player-wide key.
        let resolved = self.resolve(key).unwrap_or_else(|| key.player_wide());
        let mut row = self
            .rows
            .get(&resolved)
            .cloned()
            .unwrap_or_else(|| BudgetRow::new(&resolved));

        if let Some(request_id) = request_id {
            if row.requests.iter().any(|seen| seen == request_id) {
                return (Consume::Replayed(row.budget), None);
            }
        }
        if !row.budget.can_spin() {
            return (Consume::Exhausted(row.budget), None);
        }

        row.budget.spins_used += 1;
        if let Some(request_id) = request_id {
            row.remember(request_id);
        }
        (Consume::Consumed(row.budget.clone()), Some((resolved, row)))
    }

    pub fn plan_release(
        &self,
        key: &BudgetKey,
        request_id: Option<&str>,
    ) -> (SpinBudget, Option<(BudgetKey, BudgetRow)>) {
        let Some(resolved) = self.resolve(key) else {
            return (self.status(key), None);
        };
        let Some(mut row) = self.rows.get(&resolved).cloned() else {
            return (self.status(key), None);
        };
        row.budget.spins_used = row.budget.spins_used.saturating_sub(1);
        if let Some(request_id) = request_id {
            row.requests.retain(|seen| seen != request_id);
        }
        (row.budget.clone(), Some((resolved, row)))
    }

    pub fn apply(&mut self, key: BudgetKey, row: BudgetRow) {
        self.rows.insert(key, row);
    }
}

/// History table shared by the memory and journal stores.
#[derive(Debug, Default)]
pub(crate) struct Entries {
    entries: BTreeMap<u64, HistoryEntry>,
    requests: HashMap<String, u64>,
}

impl Entries {
    pub fn next_id(&self) -> u64 {
        self.entries.last_key_value().map(|(id, _)| id + 1).unwrap_or(1)
    }

    pub fn plan_append(&self, entry: NewEntry) -> HistoryEntry {
        entry.into_entry(self.next_id())
    }

    pub fn apply_append(&mut self, entry: HistoryEntry) {
        if entry.kind == EntryKind::Spin {
            if let Some(request_id) = &entry.request_id {
                self.requests.insert(request_id.clone(), entry.id);
            }
        }
        self.entries.insert(entry.id, entry);
    }

    pub fn entry(&self, id: u64) -> Option<HistoryEntry> {
        self.entries.get(&id).cloned()
    }

    pub fn find_by_request(&self, request_id: &str) -> Option<HistoryEntry> {
        self.requests
            .get(request_id)
            .and_then(|id| self.entries.get(id))
            .cloned()
    }

    pub fn plan_claim(&self, spin_id: u64, session_id: &str, claimed_at: u64) -> Claim {
        let Some(spin) = self
            .entries
            .get(&spin_id)
            .filter(|entry| entry.session_id == session_id)
        else {
            return Claim::Missing;
        };
        if spin.kind != EntryKind::Spin {
            return Claim::NotASpin;
        }
        if spin.claimed_at.is_some() {
            return Claim::AlreadyClaimed(spin.clone());
        }

        let mut stamped = spin.clone();
        stamped.claimed_at = Some(claimed_at);
        let claim = NewEntry {
            kind: EntryKind::Claim,
            session_id: spin.session_id.clone(),
            player_id: spin.player_id.clone(),
            template: spin.template.clone(),
            timestamp: claimed_at,
            outcome: spin.outcome.clone(),
            request_id: None,
            outcome_ref: Some(spin.id),
        }
        .into_entry(self.next_id());
        Claim::Claimed(stamped, claim)
    }

    pub fn apply_claim(&mut self, spin_id: u64, claimed_at: u64, claim: HistoryEntry) {
        if let Some(spin) = self.entries.get_mut(&spin_id) {
            spin.claimed_at = Some(claimed_at);
        }
        self.entries.insert(claim.id, claim);
    }

    pub fn query(&self, filter: &HistoryFilter) -> Vec<HistoryEntry> {
        self.entries
            .values()
            .rev()
            .filter(|entry| filter.matches(entry))
            .take(filter.effective_limit())
            .cloned()
            .collect()
    }

    pub fn stats(&self, template: Option<&str>) -> Stats {
        let mut stats = Stats::default();
        let mut sessions = HashSet::new();
        for entry in self.entries.values() {
            if template.is_some_and(|template| entry.template != template) {
                continue;
            }
            match entry.kind {
                EntryKind::Spin => stats.total_spins += 1,
                EntryKind::Claim => stats.total_claims += 1,
            }
            sessions.insert(entry.session_id.as_str());
        }
        stats.active_sessions = sessions.len() as u64;
        stats
    }

    pub fn count_spins(&self, session_id: &str, template: &str) -> u64 {
        self.entries
            .values()
            .filter(|entry| {
                entry.kind == EntryKind::Spin
                    && entry.session_id == session_id
                    && entry.template == template
            })
            .count() as u64
    }
}

#[derive(Debug, Default)]
struct Tables {
    budgets: Budgets,
    entries: Entries,
}

/// Ephemeral store. Every operation runs under one lock, so consumption is
/// atomic per call.
#[derive(Debug, Default)]
pub struct Memory {
    tables: Mutex<Tables>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|e| {
            error!("Failed to acquire memory store lock: {}", e);
            StoreError::Unavailable("memory store lock poisoned".to_string())
        })
    }
}

impl Tier for Memory {
    fn backend(&self) -> &'static str {
        "memory"
    }
}

impl BudgetStore for Memory {
    async fn budget(&self, key: &BudgetKey) -> Result<SpinBudget, StoreError> {
        Ok(self.lock()?.budgets.status(key))
    }

    async fn set_limit(
        &self,
        key: BudgetKey,
        max_spins: Option<u32>,
    ) -> Result<SpinBudget, StoreError> {
        let mut tables = self.lock()?;
        let (key, row) = tables.budgets.plan_set_limit(key, max_spins);
        let budget = row.budget.clone();
        tables.budgets.apply(key, row);
        Ok(budget)
    }

    async fn try_consume(
        &self,
        key: &BudgetKey,
        request_id: Option<&str>,
    ) -> Result<Consume, StoreError> {
        let mut tables = self.lock()?;
        let (result, write) = tables.budgets.plan_consume(key, request_id);
        if let Some((key, row)) = write {
            tables.budgets.apply(key, row);
        }
        Ok(result)
    }

    async fn release(
        &self,
        key: &BudgetKey,
        request_id: Option<&str>,
    ) -> Result<SpinBudget, StoreError> {
        let mut tables = self.lock()?;
        let (budget, write) = tables.budgets.plan_release(key, request_id);
        if let Some((key, row)) = write {
            tables.budgets.apply(key, row);
        }
        Ok(budget)
    }
}

impl HistoryStore for Memory {
    async fn append(&self, entry: NewEntry) -> Result<HistoryEntry, StoreError> {
        let mut tables = self.lock()?;
        let entry = tables.entries.plan_append(entry);
        tables.entries.apply_append(entry.clone());
        Ok(entry)
    }

    async fn entry(&self, id: u64) -> Result<Option<HistoryEntry>, StoreError> {
        Ok(self.lock()?.entries.entry(id))
    }

    async fn find_by_request(&self, request_id: &str) -> Result<Option<HistoryEntry>, StoreError> {
        Ok(self.lock()?.entries.find_by_request(request_id))
    }

    async fn claim(
        &self,
        spin_id: u64,
        session_id: &str,
        claimed_at: u64,
    ) -> Result<Claim, StoreError> {
        let mut tables = self.lock()?;
        let result = tables.entries.plan_claim(spin_id, session_id, claimed_at);
        if let Claim::Claimed(_, claim) = &result {
            tables.entries.apply_claim(spin_id, claimed_at, claim.clone());
        }
        Ok(result)
    }

    async fn query(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self.lock()?.entries.query(filter))
    }

    async fn stats(&self, template: Option<&str>) -> Result<Stats, StoreError> {
        Ok(self.lock()?.entries.stats(template))
    }

    async fn count_spins(&self, session_id: &str, template: &str) -> Result<u64, StoreError> {
        Ok(self.lock()?.entries.count_spins(session_id, template))
    }
}
