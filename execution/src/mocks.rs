//! Stores with injectable faults, for exercising failure paths.

use crate::state::{BudgetStore, Claim, Consume, HistoryStore, Memory, StoreError, Tier};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use wheelspin_types::{BudgetKey, HistoryEntry, HistoryFilter, NewEntry, SpinBudget, Stats};

/// What a faulty call does instead of reaching the inner store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Fault {
    None = 0,
    /// Return [StoreError::Unavailable].
    Fail = 1,
    /// Never complete.
    Stall = 2,
}

impl Fault {
    fn load(cell: &AtomicU8) -> Self {
        match cell.load(Ordering::Acquire) {
            1 => Fault::Fail,
            2 => Fault::Stall,
            _ => Fault::None,
        }
    }

    async fn inject(self) -> Result<(), StoreError> {
        match self {
            Fault::None => Ok(()),
            Fault::Fail => Err(StoreError::Unavailable("injected failure".to_string())),
            Fault::Stall => std::future::pending().await,
        }
    }
}

/// A [Memory] store whose budget, release and history calls can each be
/// made to fail or stall, and which can report itself degraded.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: Memory,
    budget_fault: AtomicU8,
    release_fault: AtomicU8,
    history_fault: AtomicU8,
    degraded: AtomicBool,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &Memory {
        &self.inner
    }

    /// Applies to every budget call except `release`.
    pub fn set_budget_fault(&self, fault: Fault) {
        self.budget_fault.store(fault as u8, Ordering::Release);
    }

    pub fn set_release_fault(&self, fault: Fault) {
        self.release_fault.store(fault as u8, Ordering::Release);
    }

    pub fn set_history_fault(&self, fault: Fault) {
        self.history_fault.store(fault as u8, Ordering::Release);
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Release);
    }

    async fn budget_call(&self) -> Result<(), StoreError> {
        Fault::load(&self.budget_fault).inject().await
    }

    async fn history_call(&self) -> Result<(), StoreError> {
        Fault::load(&self.history_fault).inject().await
    }
}

impl Tier for FaultyStore {
    fn backend(&self) -> &'static str {
        "faulty"
    }

    fn degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }
}

impl BudgetStore for FaultyStore {
    async fn budget(&self, key: &BudgetKey) -> Result<SpinBudget, StoreError> {
        self.budget_call().await?;
        self.inner.budget(key).await
    }

    async fn set_limit(
        &self,
        key: BudgetKey,
        max_spins: Option<u32>,
    ) -> Result<SpinBudget, StoreError> {
        self.budget_call().await?;
        self.inner.set_limit(key, max_spins).await
    }

    async fn try_consume(
        &self,
        key: &BudgetKey,
        request_id: Option<&str>,
    ) -> Result<Consume, StoreError> {
        self.budget_call().await?;
        self.inner.try_consume(key, request_id).await
    }

    async fn release(
        &self,
        key: &BudgetKey,
        request_id: Option<&str>,
    ) -> Result<SpinBudget, StoreError> {
        Fault::load(&self.release_fault).inject().await?;
        self.inner.release(key, request_id).await
    }
}

impl HistoryStore for FaultyStore {
    async fn append(&self, entry: NewEntry) -> Result<HistoryEntry, StoreError> {
        self.history_call().await?;
        self.inner.append(entry).await
    }

    async fn entry(&self, id: u64) -> Result<Option<HistoryEntry>, StoreError> {
        self.history_call().await?;
        self.inner.entry(id).await
    }

    async fn find_by_request(&self, request_id: &str) -> Result<Option<HistoryEntry>, StoreError> {
        self.history_call().await?;
        self.inner.find_by_request(request_id).await
    }

    async fn claim(
        &self,
        spin_id: u64,
        session_id: &str,
        claimed_at: u64,
    ) -> Result<Claim, StoreError> {
        self.history_call().await?;
        self.inner.claim(spin_id, session_id, claimed_at).await
    }

    async fn query(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>, StoreError> {
        self.history_call().await?;
        self.inner.query(filter).await
    }

    async fn stats(&self, template: Option<&str>) -> Result<Stats, StoreError> {
        self.history_call().await?;
        self.inner.stats(template).await
    }

    async fn count_spins(&self, session_id: &str, template: &str) -> Result<u64, StoreError> {
        self.history_call().await?;
        self.inner.count_spins(session_id, template).await
    }
}
