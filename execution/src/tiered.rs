//! Primary store with a bounded timeout and an optional in-memory fallback.
//!
//! The first failed or timed out primary call switches the store into
//! degraded mode when a fallback is configured. Degraded mode is sticky for
//! the life of the process: the fallback starts empty, so budgets fail open
//! (unlimited) and history restarts, and mixing the tiers afterwards would
//! split one player's state across both. A primary that reports itself
//! degraded, such as a journal after a failed write, is surfaced as well.

use crate::{
    journal::Journal,
    metrics::Metrics,
    state::{BudgetStore, Claim, Consume, HistoryStore, Memory, StoreError, Tier},
};
use std::{
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tracing::warn;
use wheelspin_types::{BudgetKey, HistoryEntry, HistoryFilter, NewEntry, SpinBudget, Stats};

/// Default bound on a single primary store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Tiered<P> {
    primary: P,
    fallback: Option<Memory>,
    timeout: Duration,
    degraded: AtomicBool,
    metrics: Metrics,
}

impl<P> Tiered<P> {
    /// Wrap `primary`. With `fallback` set, failures degrade to memory
    /// instead of surfacing a [StoreError].
    pub fn new(primary: P, timeout: Duration, fallback: bool, metrics: Metrics) -> Self {
        Self {
            primary,
            fallback: fallback.then(Memory::new),
            timeout,
            degraded: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    async fn bounded<T>(
        &self,
        future: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    /// The fallback, once degraded mode is active.
    fn active_fallback(&self) -> Option<&Memory> {
        let fallback = self.fallback.as_ref()?;
        if !self.is_degraded() {
            return None;
        }
        self.metrics.persistence_fallbacks.inc();
        Some(fallback)
    }

    /// Handle a primary failure: enter degraded mode, or hand the error back.
    fn degrade(&self, op: &'static str, error: StoreError) -> Result<&Memory, StoreError> {
        let Some(fallback) = &self.fallback else {
            warn!(op, "Primary store failed: {}", error);
            return Err(error);
        };
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(op, "Primary store failed, serving from memory fallback: {}", error);
            self.metrics.degraded.set(1);
        }
        self.metrics.persistence_fallbacks.inc();
        Ok(fallback)
    }
}

/// Run `$call` against the active tier, binding the store to `$store`.
macro_rules! route {
    ($self:ident, $op:literal, $store:ident => $call:expr) => {{
        if let Some($store) = $self.active_fallback() {
            return $call.await;
        }
        let result = {
            let $store = &$self.primary;
            $self.bounded($call).await
        };
        match result {
            Ok(value) => Ok(value),
            Err(error) => {
                let $store = $self.degrade($op, error)?;
                $call.await
            }
        }
    }};
}

impl<P: Tier> Tier for Tiered<P> {
    fn backend(&self) -> &'static str {
        if self.is_degraded() {
            "memory"
        } else {
            self.primary.backend()
        }
    }

    fn degraded(&self) -> bool {
        self.is_degraded() || self.primary.degraded()
    }
}

impl<P: BudgetStore> BudgetStore for Tiered<P> {
    async fn budget(&self, key: &BudgetKey) -> Result<SpinBudget, StoreError> {
        route!(self, "budget", store => store.budget(key))
    }

    async fn set_limit(
        &self,
        key: BudgetKey,
        max_spins: Option<u32>,
    ) -> Result<SpinBudget, StoreError> {
        route!(self, "set_limit", store => store.set_limit(key.clone(), max_spins))
    }

    async fn try_consume(
        &self,
        key: &BudgetKey,
        request_id: Option<&str>,
    ) -> Result<Consume, StoreError> {
        route!(self, "try_consume", store => store.try_consume(key, request_id))
    }

    async fn release(
        &self,
        key: &BudgetKey,
        request_id: Option<&str>,
    ) -> Result<SpinBudget, StoreError> {
        route!(self, "release", store => store.release(key, request_id))
    }
}

impl<P: HistoryStore> HistoryStore for Tiered<P> {
    async fn append(&self, entry: NewEntry) -> Result<HistoryEntry, StoreError> {
        route!(self, "append", store => store.append(entry.clone()))
    }

    async fn entry(&self, id: u64) -> Result<Option<HistoryEntry>, StoreError> {
        route!(self, "entry", store => store.entry(id))
    }

    async fn find_by_request(&self, request_id: &str) -> Result<Option<HistoryEntry>, StoreError> {
        route!(self, "find_by_request", store => store.find_by_request(request_id))
    }

    async fn claim(
        &self,
        spin_id: u64,
        session_id: &str,
        claimed_at: u64,
    ) -> Result<Claim, StoreError> {
        route!(self, "claim", store => store.claim(spin_id, session_id, claimed_at))
    }

    async fn query(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>, StoreError> {
        route!(self, "query", store => store.query(filter))
    }

    async fn stats(&self, template: Option<&str>) -> Result<Stats, StoreError> {
        route!(self, "stats", store => store.stats(template))
    }

    async fn count_spins(&self, session_id: &str, template: &str) -> Result<u64, StoreError> {
        route!(self, "count_spins", store => store.count_spins(session_id, template))
    }
}

/// The primary store selected by configuration.
pub enum Backend {
    Memory(Memory),
    Journal(Journal),
}

impl Tier for Backend {
    fn backend(&self) -> &'static str {
        match self {
            Backend::Memory(store) => store.backend(),
            Backend::Journal(store) => store.backend(),
        }
    }

    fn degraded(&self) -> bool {
        match self {
            Backend::Memory(store) => store.degraded(),
            Backend::Journal(store) => store.degraded(),
        }
    }
}

/// Forward a call to whichever backend is configured.
macro_rules! delegate {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            Backend::Memory($store) => $call.await,
            Backend::Journal($store) => $call.await,
        }
    };
}

impl BudgetStore for Backend {
    async fn budget(&self, key: &BudgetKey) -> Result<SpinBudget, StoreError> {
        delegate!(self, store => store.budget(key))
    }

    async fn set_limit(
        &self,
        key: BudgetKey,
        max_spins: Option<u32>,
    ) -> Result<SpinBudget, StoreError> {
        delegate!(self, store => store.set_limit(key, max_spins))
    }

    async fn try_consume(
        &self,
        key: &BudgetKey,
        request_id: Option<&str>,
    ) -> Result<Consume, StoreError> {
        delegate!(self, store => store.try_consume(key, request_id))
    }

    async fn release(
        &self,
        key: &BudgetKey,
        request_id: Option<&str>,
    ) -> Result<SpinBudget, StoreError> {
        delegate!(self, store => store.release(key, request_id))
    }
}

impl HistoryStore for Backend {
    async fn append(&self, entry: NewEntry) -> Result<HistoryEntry, StoreError> {
        delegate!(self, store => store.append(entry))
    }

    async fn entry(&self, id: u64) -> Result<Option<HistoryEntry>, StoreError> {
        delegate!(self, store => store.entry(id))
    }

    async fn find_by_request(&self, request_id: &str) -> Result<Option<HistoryEntry>, StoreError> {
        delegate!(self, store => store.find_by_request(request_id))
    }

    async fn claim(
        &self,
        spin_id: u64,
        session_id: &str,
        claimed_at: u64,
    ) -> Result<Claim, StoreError> {
        delegate!(self, store => store.claim(spin_id, session_id, claimed_at))
    }

    async fn query(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>, StoreError> {
        delegate!(self, store => store.query(filter))
    }

    async fn stats(&self, template: Option<&str>) -> Result<Stats, StoreError> {
        delegate!(self, store => store.stats(template))
    }

    async fn count_spins(&self, session_id: &str, template: &str) -> Result<u64, StoreError> {
        delegate!(self, store => store.count_spins(session_id, template))
    }
}
