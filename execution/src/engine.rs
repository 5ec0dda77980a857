//! The end-to-end spin pipeline.
//!
//! A spin reads the template's policy, charges the player's budget, decides
//! and draws the prize, plans the rotation and records the result. A charge
//! is held by a [Charge] until the spin is recorded. A failure releases it
//! before the error is returned, and a spin future dropped part way releases
//! it from a background task.
//!
//! Spins that derive their index from the recorded count take a per session
//! turn, so concurrent spins of one session get consecutive indexes.

use crate::{
    animation::{self, AnimationError},
    ledger::Ledger,
    metrics::Metrics,
    policy,
    recorder::Recorder,
    selector::{self, Forced, SelectError},
    state::{BudgetStore, Claim, Consume, HistoryStore, StoreError, Tier},
    templates::{TemplateStore, Templates},
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use wheelspin_types::{
    api::{Health, HealthStatus, SpinRequest, SpinResponse},
    ConfigError, HistoryEntry, HistoryFilter, PrizeProbability, RotationPlan, SpinBudget,
    SpinOutcome, SpinPolicyConfig, Stats,
};

#[derive(Debug, Error)]
pub enum SpinError {
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    #[error("template has no prizes to draw from")]
    EmptyPool,
    #[error("no spins remaining")]
    LimitExceeded { budget: SpinBudget },
    #[error("request {0} is still in progress")]
    InProgress(String),
    #[error("request {0} belongs to a different spin")]
    RequestConflict(String),
    #[error(transparent)]
    Unavailable(#[from] StoreError),
    #[error("cannot place prize on wheel: {0}")]
    InvalidSlice(#[from] AnimationError),
}

impl From<SelectError> for SpinError {
    fn from(error: SelectError) -> Self {
        match error {
            SelectError::EmptyPool => SpinError::EmptyPool,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("no spin {0} in this session")]
    NotFound(u64),
    #[error("spin {0} was already claimed")]
    AlreadyClaimed(u64),
    #[error("entry {0} is not a spin")]
    NotASpin(u64),
    #[error(transparent)]
    Unavailable(#[from] StoreError),
}

/// A resolved (or replayed) spin.
#[derive(Clone, Debug, PartialEq)]
pub struct SpinReceipt {
    pub entry: HistoryEntry,
    pub animation: RotationPlan,
    pub budget: Option<SpinBudget>,
    pub replayed: bool,
}

impl SpinReceipt {
    pub fn outcome(&self) -> &SpinOutcome {
        &self.entry.outcome
    }

    pub fn response(&self) -> SpinResponse {
        SpinResponse {
            entry_id: self.entry.id,
            outcome: self.entry.outcome.clone(),
            animation: self.animation,
            budget: self.budget.clone(),
            replayed: self.replayed,
        }
    }
}

/// The stamped spin and the claim entry appended for it.
#[derive(Clone, Debug, PartialEq)]
pub struct ClaimReceipt {
    pub spin: HistoryEntry,
    pub claim: HistoryEntry,
}

/// A spin charged against a player's budget and not yet recorded.
struct Charge<S: BudgetStore + 'static> {
    ledger: Ledger<S>,
    metrics: Metrics,
    player_id: String,
    template: String,
    request_id: Option<String>,
    settled: bool,
}

impl<S: BudgetStore + 'static> Charge<S> {
    /// The spin was recorded.
    fn keep(mut self) {
        self.settled = true;
    }

    /// Return the spin after a failure further down the pipeline.
    async fn release(mut self) {
        release(
            &self.ledger,
            &self.metrics,
            &self.player_id,
            &self.template,
            self.request_id.as_deref(),
        )
        .await;
        self.settled = true;
    }
}

impl<S: BudgetStore + 'static> Drop for Charge<S> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let player_id = std::mem::take(&mut self.player_id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.metrics.compensation_failures.inc();
            error!(
                player_id = %player_id,
                request_id = ?self.request_id,
                "Cannot release abandoned spin outside a runtime"
            );
            return;
        };
        warn!(
            player_id = %player_id,
            request_id = ?self.request_id,
            "spin abandoned before it was recorded"
        );
        let ledger = self.ledger.clone();
        let metrics = self.metrics.clone();
        let template = std::mem::take(&mut self.template);
        let request_id = self.request_id.take();
        runtime.spawn(async move {
            release(&ledger, &metrics, &player_id, &template, request_id.as_deref()).await;
        });
    }
}

async fn release<S: BudgetStore>(
    ledger: &Ledger<S>,
    metrics: &Metrics,
    player_id: &str,
    template: &str,
    request_id: Option<&str>,
) {
    match ledger.release(player_id, Some(template), request_id).await {
        Ok(budget) => {
            warn!(player_id, spins_used = budget.spins_used, "released spin after failure");
        }
        Err(e) => {
            metrics.compensation_failures.inc();
            error!(player_id, ?request_id, "Failed to release consumed spin: {}", e);
        }
    }
}

/// Per (session, template) locks held from counting a session's spins to
/// recording the next one.
#[derive(Default)]
struct Turns {
    locks: Mutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>,
}

impl Turns {
    async fn take(&self, session_id: &str, template: &str) -> Turn<'_> {
        let key = (session_id.to_string(), template.to_string());
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key.clone()).or_default().clone()
        };
        Turn {
            turns: self,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }
}

struct Turn<'a> {
    turns: &'a Turns,
    key: (String, String),
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut locks = self.turns.locks.lock().unwrap_or_else(PoisonError::into_inner);
        self.guard.take();
        // Waiters clone the lock under the map lock, so a count of one means
        // nobody is queued behind this turn.
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

pub struct Engine<S, T = Templates> {
    store: Arc<S>,
    ledger: Ledger<S>,
    recorder: Recorder<S>,
    templates: T,
    rng: Mutex<ChaCha20Rng>,
    turns: Turns,
    metrics: Metrics,
}

impl<S, T> Engine<S, T>
where
    S: BudgetStore + HistoryStore + Tier + 'static,
    T: TemplateStore,
{
    /// Create an engine. A `seed` makes every draw reproducible.
    pub fn new(store: Arc<S>, templates: T, metrics: Metrics, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        };
        Self {
            ledger: Ledger::new(store.clone(), metrics.clone()),
            recorder: Recorder::new(store.clone()),
            store,
            templates,
            rng: Mutex::new(rng),
            turns: Turns::default(),
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn templates(&self) -> &T {
        &self.templates
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Resolve one spin.
    pub async fn spin(&self, request: SpinRequest) -> Result<SpinReceipt, SpinError> {
        let start = Instant::now();
        let result = self.run_spin(&request).await;
        self.metrics
            .spin_latency
            .observe(start.elapsed().as_secs_f64());
        result
    }

    async fn run_spin(&self, request: &SpinRequest) -> Result<SpinReceipt, SpinError> {
        let config = self
            .templates
            .get(&request.template)
            .ok_or_else(|| SpinError::UnknownTemplate(request.template.clone()))?;
        let request_id = request
            .request_id
            .as_deref()
            .filter(|id| !id.trim().is_empty());
        let player_id = request
            .player_id
            .as_deref()
            .filter(|id| !id.trim().is_empty());
        let template = Some(request.template.as_str());
        let rotation = request.current_rotation.unwrap_or(0.0);

        // A request id that already produced a spin is answered from history.
        if let Some(request_id) = request_id {
            if let Some(entry) = self.recorder.find_by_request(request_id).await? {
                owned_by(&entry, request, player_id)?;
                let budget = match player_id {
                    Some(player_id) => Some(self.ledger.get_status(player_id, template).await?),
                    None => None,
                };
                return self.replay(entry, budget, rotation);
            }
        }

        let (budget, charge) = match player_id {
            Some(player_id) => {
                match self
                    .ledger
                    .consume_spin(player_id, template, request_id)
                    .await?
                {
                    Consume::Consumed(budget) => {
                        let charge = Charge {
                            ledger: self.ledger.clone(),
                            metrics: self.metrics.clone(),
                            player_id: player_id.to_string(),
                            template: request.template.clone(),
                            request_id: request_id.map(str::to_string),
                            settled: false,
                        };
                        (Some(budget), Some(charge))
                    }
                    Consume::Exhausted(budget) => return Err(SpinError::LimitExceeded { budget }),
                    Consume::Replayed(budget) => {
                        // Charged by a concurrent attempt with the same id.
                        let request_id = request_id.unwrap_or_default();
                        return match self.recorder.find_by_request(request_id).await? {
                            Some(entry) => {
                                owned_by(&entry, request, Some(player_id))?;
                                self.replay(entry, Some(budget), rotation)
                            }
                            None => Err(SpinError::InProgress(request_id.to_string())),
                        };
                    }
                }
            }
            None => (None, None),
        };

        match self.resolve(request, &config, player_id, request_id).await {
            Ok((entry, animation)) => {
                if let Some(charge) = charge {
                    charge.keep();
                }
                self.metrics.spins.inc();
                info!(
                    id = entry.id,
                    session_id = %entry.session_id,
                    template = %entry.template,
                    prize = %entry.outcome.prize.id,
                    spin_index = entry.outcome.spin_index,
                    "spin resolved"
                );
                Ok(SpinReceipt {
                    entry,
                    animation,
                    budget,
                    replayed: false,
                })
            }
            Err(e) => {
                if let Some(charge) = charge {
                    charge.release().await;
                }
                Err(e)
            }
        }
    }

    async fn resolve(
        &self,
        request: &SpinRequest,
        config: &SpinPolicyConfig,
        player_id: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<(HistoryEntry, RotationPlan), SpinError> {
        let (spin_index, _turn) = match request.spin_index {
            Some(index) => (index.max(1), None),
            None => {
                let turn = self
                    .turns
                    .take(&request.session_id, &request.template)
                    .await;
                let recorded = self
                    .recorder
                    .count_spins(&request.session_id, &request.template)
                    .await?;
                (recorded + 1, Some(turn))
            }
        };
        let (outcome, animation) =
            self.draw(config, spin_index, request.current_rotation.unwrap_or(0.0))?;
        let entry = self
            .recorder
            .record_spin(
                &request.session_id,
                player_id,
                &request.template,
                outcome,
                request_id,
            )
            .await?;
        Ok((entry, animation))
    }

    /// Decide, draw and plan. Pure apart from the shared RNG.
    fn draw(
        &self,
        config: &SpinPolicyConfig,
        spin_index: u64,
        current_rotation: f64,
    ) -> Result<(SpinOutcome, RotationPlan), SpinError> {
        let decision = policy::decide(config, spin_index);
        // The RNG holds no invariant a panic could break.
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let selection = selector::select(&mut *rng, &decision.pool, decision.forced_id)?;
        if selection.forced == Forced::Stale {
            self.metrics.stale_forced_ids.inc();
            warn!(
                forced_id = ?decision.forced_id,
                spin_index,
                "forced prize is not in the pool, drew at random"
            );
        }

        let slice_count = config.prizes.len();
        let slice_index = config.prize_index(&selection.prize.id).ok_or(
            AnimationError::SliceOutOfRange {
                index: slice_count,
                count: slice_count,
            },
        )?;
        let animation =
            animation::plan_rotation(&mut *rng, slice_index, slice_count, current_rotation)?;
        drop(rng);

        let forced = selection.forced == Forced::Hit;
        debug!(
            mode = ?decision.mode,
            spin_index,
            prize = %selection.prize.id,
            excluded_guaranteed = decision.excluded_guaranteed,
            "drew prize"
        );
        let outcome = SpinOutcome {
            prize: selection.prize.clone(),
            probability_percent: selection.probability_percent,
            used_guaranteed: decision.used_guaranteed && forced,
            used_sequence: decision.used_sequence && forced,
            spin_index,
            slice_index,
        };
        Ok((outcome, animation))
    }

    fn replay(
        &self,
        entry: HistoryEntry,
        budget: Option<SpinBudget>,
        current_rotation: f64,
    ) -> Result<SpinReceipt, SpinError> {
        let config = self
            .templates
            .get(&entry.template)
            .ok_or_else(|| SpinError::UnknownTemplate(entry.template.clone()))?;
        let animation = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            animation::plan_rotation(
                &mut *rng,
                entry.outcome.slice_index,
                config.prizes.len(),
                current_rotation,
            )?
        };
        debug!(id = entry.id, request_id = ?entry.request_id, "replayed spin");
        Ok(SpinReceipt {
            entry,
            animation,
            budget,
            replayed: true,
        })
    }

    /// Claim the prize of spin `entry_id` for `session_id`.
    pub async fn claim(&self, entry_id: u64, session_id: &str) -> Result<ClaimReceipt, ClaimError> {
        match self.recorder.claim(entry_id, session_id).await? {
            Claim::Claimed(spin, claim) => {
                self.metrics.claims.inc();
                info!(id = spin.id, session_id, prize = %spin.outcome.prize.id, "prize claimed");
                Ok(ClaimReceipt { spin, claim })
            }
            Claim::AlreadyClaimed(spin) => Err(ClaimError::AlreadyClaimed(spin.id)),
            Claim::NotASpin => Err(ClaimError::NotASpin(entry_id)),
            Claim::Missing => Err(ClaimError::NotFound(entry_id)),
        }
    }

    pub async fn status(
        &self,
        player_id: &str,
        template: Option<&str>,
    ) -> Result<SpinBudget, StoreError> {
        self.ledger.get_status(player_id, template).await
    }

    pub async fn set_limit(
        &self,
        player_id: &str,
        max_spins: Option<u32>,
        template: Option<&str>,
    ) -> Result<SpinBudget, StoreError> {
        self.ledger.set_limit(player_id, max_spins, template).await
    }

    pub async fn grant(
        &self,
        player_id: &str,
        additional: u32,
        template: Option<&str>,
    ) -> Result<SpinBudget, StoreError> {
        self.ledger
            .grant_spins(player_id, additional, template)
            .await
    }

    pub async fn history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>, StoreError> {
        self.recorder.query(filter).await
    }

    pub async fn stats(&self, template: Option<&str>) -> Result<Stats, StoreError> {
        self.recorder.stats(template).await
    }

    /// Probabilities of the template's full pool, or `None` if unknown.
    pub fn probabilities(&self, template: &str) -> Option<Vec<PrizeProbability>> {
        let config = self.templates.get(template)?;
        Some(selector::calculate_probabilities(&config.prizes))
    }

    pub fn put_template(
        &self,
        template: &str,
        config: SpinPolicyConfig,
    ) -> Result<Arc<SpinPolicyConfig>, ConfigError> {
        self.templates.put(template, config)
    }

    pub fn health(&self) -> Health {
        let degraded = self.store.degraded();
        Health {
            status: if degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Ok
            },
            degraded,
            backend: self.store.backend().to_string(),
        }
    }
}

/// A request id only replays the spin it produced for the same session,
/// player and template.
fn owned_by(
    entry: &HistoryEntry,
    request: &SpinRequest,
    player_id: Option<&str>,
) -> Result<(), SpinError> {
    if entry.session_id == request.session_id
        && entry.player_id.as_deref() == player_id
        && entry.template == request.template
    {
        return Ok(());
    }
    Err(SpinError::RequestConflict(
        entry.request_id.clone().unwrap_or_default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{Fault, FaultyStore},
        state::Memory,
        tiered::Tiered,
    };
    use std::time::Duration;
    use wheelspin_types::{BudgetKey, EntryKind, Prize};

    fn basic() -> SpinPolicyConfig {
        SpinPolicyConfig::new(vec![
            Prize::new("a", "A", 1.0),
            Prize::new("b", "B", 2.0),
            Prize::new("c", "C", 3.0),
        ])
    }

    fn sequenced() -> SpinPolicyConfig {
        SpinPolicyConfig {
            prizes: vec![
                Prize::new("a", "A", 1.0),
                Prize::new("b", "B", 1.0),
                Prize::new("c", "C", 1.0),
                Prize::new("g", "G", 1.0),
                Prize::new("x", "X", 1.0),
            ],
            guaranteed_prize_id: Some("g".to_string()),
            guaranteed_enabled: true,
            cycle_length: 5,
            sequence: vec![Some("a".to_string()), None, Some("b".to_string()), None],
            exclude_guaranteed_from_free: true,
        }
    }

    fn engine<S: BudgetStore + HistoryStore + Tier + 'static>(store: Arc<S>) -> Engine<S> {
        let templates = Templates::new();
        templates.put("basic", basic()).unwrap();
        templates.put("sequenced", sequenced()).unwrap();
        Engine::new(store, templates, Metrics::default(), Some(7))
    }

    #[tokio::test]
    async fn test_spin_lands_on_recorded_prize() {
        let engine = engine(Arc::new(Memory::new()));
        for _ in 0..20 {
            let receipt = engine.spin(SpinRequest::new("s1", "basic")).await.unwrap();
            let outcome = receipt.outcome();
            assert_eq!(receipt.entry.kind, EntryKind::Spin);
            assert_eq!(
                basic().prize_index(&outcome.prize.id),
                Some(outcome.slice_index)
            );
            assert_eq!(
                animation::index_from_angle(receipt.animation.end_angle, 3).unwrap(),
                outcome.slice_index
            );
            assert!(!receipt.replayed);
            assert_eq!(receipt.budget, None);
        }
        assert_eq!(engine.metrics().spins.get(), 20);
        assert_eq!(engine.stats(None).await.unwrap().total_spins, 20);
    }

    #[tokio::test]
    async fn test_derived_spin_index_follows_cycle() {
        let engine = engine(Arc::new(Memory::new()));
        for spin in 1..=10u64 {
            let receipt = engine
                .spin(SpinRequest::new("s1", "sequenced"))
                .await
                .unwrap();
            let outcome = receipt.outcome();
            assert_eq!(outcome.spin_index, spin);
            match (spin - 1) % 5 {
                0 => assert_eq!(outcome.prize.id, "a"),
                2 => assert_eq!(outcome.prize.id, "b"),
                4 => {
                    assert_eq!(outcome.prize.id, "g");
                    assert!(outcome.used_guaranteed);
                }
                _ => {
                    assert_ne!(outcome.prize.id, "g");
                    assert!(!outcome.used_guaranteed && !outcome.used_sequence);
                }
            }
        }

        // Another session starts its own cycle.
        let receipt = engine
            .spin(SpinRequest::new("s2", "sequenced"))
            .await
            .unwrap();
        assert_eq!(receipt.outcome().spin_index, 1);
        assert!(receipt.outcome().used_sequence);
    }

    #[tokio::test]
    async fn test_limit_exceeded() {
        let engine = engine(Arc::new(Memory::new()));
        engine.set_limit("p1", Some(1), None).await.unwrap();
        let request = SpinRequest::new("s1", "basic").with_player("p1");
        let receipt = engine.spin(request.clone()).await.unwrap();
        assert_eq!(receipt.budget.unwrap().spins_used, 1);

        let Err(SpinError::LimitExceeded { budget }) = engine.spin(request).await else {
            panic!("expected limit exceeded");
        };
        assert_eq!(budget.spins_used, 1);
        assert_eq!(engine.metrics().limit_exceeded.get(), 1);
        assert_eq!(engine.stats(None).await.unwrap().total_spins, 1);
    }

    #[tokio::test]
    async fn test_request_id_replays_recorded_spin() {
        let engine = engine(Arc::new(Memory::new()));
        engine.set_limit("p1", Some(1), None).await.unwrap();
        let request = SpinRequest::new("s1", "basic")
            .with_player("p1")
            .with_request_id("r1");

        let first = engine.spin(request.clone()).await.unwrap();
        let second = engine.spin(request).await.unwrap();
        assert!(second.replayed);
        assert_eq!(second.entry, first.entry);
        assert_eq!(second.budget.unwrap().spins_used, 1);
        assert_eq!(
            animation::index_from_angle(second.animation.end_angle, 3).unwrap(),
            first.outcome().slice_index
        );
        assert_eq!(engine.stats(None).await.unwrap().total_spins, 1);
    }

    #[tokio::test]
    async fn test_charged_request_without_record_is_in_progress() {
        let store = Arc::new(Memory::new());
        let engine = engine(store.clone());
        let key = BudgetKey::new("p1", None);
        store.try_consume(&key, Some("r1")).await.unwrap();

        let request = SpinRequest::new("s1", "basic")
            .with_player("p1")
            .with_request_id("r1");
        assert!(matches!(
            engine.spin(request).await,
            Err(SpinError::InProgress(id)) if id == "r1"
        ));
    }

    #[tokio::test]
    async fn test_failed_record_releases_spin() {
        let store = Arc::new(FaultyStore::new());
        let engine = engine(store.clone());
        engine.set_limit("p1", Some(1), None).await.unwrap();
        store.set_history_fault(Fault::Fail);

        let request = SpinRequest::new("s1", "basic")
            .with_player("p1")
            .with_spin_index(1);
        assert!(matches!(
            engine.spin(request.clone()).await,
            Err(SpinError::Unavailable(_))
        ));
        assert_eq!(engine.status("p1", None).await.unwrap().spins_used, 0);
        assert_eq!(engine.metrics().compensation_failures.get(), 0);

        // The returned spin can still be used.
        store.set_history_fault(Fault::None);
        assert!(engine.spin(request).await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_spin_is_released() {
        let store = Arc::new(FaultyStore::new());
        let engine = engine(store.clone());
        engine.set_limit("p1", Some(1), None).await.unwrap();
        store.set_history_fault(Fault::Stall);

        let request = SpinRequest::new("s1", "basic")
            .with_player("p1")
            .with_spin_index(1);
        let spin = tokio::time::timeout(Duration::from_millis(50), engine.spin(request));
        assert!(spin.await.is_err());

        // The release runs on a background task.
        for _ in 0..100 {
            if engine.status("p1", None).await.unwrap().spins_used == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(engine.status("p1", None).await.unwrap().spins_used, 0);
        assert_eq!(engine.metrics().spins.get(), 0);
        assert_eq!(engine.metrics().compensation_failures.get(), 0);

        store.set_history_fault(Fault::None);
        assert_eq!(engine.stats(None).await.unwrap().total_spins, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_spins_get_distinct_indexes() {
        let engine = Arc::new(engine(Arc::new(Memory::new())));
        for round in 0..10 {
            let session = format!("s{round}");
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let engine = engine.clone();
                    let request = SpinRequest::new(session.clone(), "sequenced");
                    tokio::spawn(async move { engine.spin(request).await })
                })
                .collect();
            let mut indexes = Vec::new();
            for handle in handles {
                indexes.push(handle.await.unwrap().unwrap().outcome().spin_index);
            }
            indexes.sort_unstable();
            assert_eq!(indexes, (1..=8).collect::<Vec<u64>>());
        }
        // Idle sessions leave no locks behind.
        assert!(engine.turns.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_id_is_scoped_to_its_spin() {
        let engine = engine(Arc::new(Memory::new()));
        let request = SpinRequest::new("s1", "basic")
            .with_player("p1")
            .with_request_id("r1");
        engine.spin(request).await.unwrap();

        for other in [
            SpinRequest::new("s2", "basic").with_player("p1"),
            SpinRequest::new("s1", "basic").with_player("p2"),
            SpinRequest::new("s1", "basic"),
            SpinRequest::new("s1", "sequenced").with_player("p1"),
        ] {
            assert!(matches!(
                engine.spin(other.with_request_id("r1")).await,
                Err(SpinError::RequestConflict(id)) if id == "r1"
            ));
        }
        assert_eq!(engine.status("p2", None).await.unwrap().spins_used, 0);
        assert_eq!(engine.stats(None).await.unwrap().total_spins, 1);
    }

    #[tokio::test]
    async fn test_degraded_primary_shows_in_health() {
        let metrics = Metrics::default();
        let store = Arc::new(Tiered::new(
            FaultyStore::new(),
            Duration::from_millis(50),
            false,
            metrics.clone(),
        ));
        let templates = Templates::new();
        templates.put("basic", basic()).unwrap();
        let engine = Engine::new(store.clone(), templates, metrics, Some(1));

        store.primary().set_degraded(true);
        let health = engine.health();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.degraded);
        assert_eq!(health.backend, "faulty");

        store.primary().set_degraded(false);
        assert_eq!(engine.health().status, HealthStatus::Ok);
    }

    #[tokio::test]
    async fn test_failed_release_is_counted() {
        let store = Arc::new(FaultyStore::new());
        let engine = engine(store.clone());
        engine.set_limit("p1", Some(2), None).await.unwrap();
        store.set_history_fault(Fault::Fail);
        store.set_release_fault(Fault::Fail);

        let request = SpinRequest::new("s1", "basic")
            .with_player("p1")
            .with_spin_index(1);
        assert!(engine.spin(request).await.is_err());
        assert_eq!(engine.metrics().compensation_failures.get(), 1);
        assert_eq!(engine.status("p1", None).await.unwrap().spins_used, 1);
    }

    #[tokio::test]
    async fn test_degraded_store_keeps_spinning() {
        let metrics = Metrics::default();
        let store = Arc::new(Tiered::new(
            FaultyStore::new(),
            Duration::from_millis(50),
            true,
            metrics.clone(),
        ));
        let templates = Templates::new();
        templates.put("basic", basic()).unwrap();
        let engine = Engine::new(store.clone(), templates, metrics, Some(1));
        assert_eq!(engine.health().status, HealthStatus::Ok);

        store.primary().set_history_fault(Fault::Stall);
        let receipt = engine.spin(SpinRequest::new("s1", "basic")).await.unwrap();
        assert_eq!(receipt.entry.id, 1);

        let health = engine.health();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.degraded);
        assert_eq!(health.backend, "memory");
    }

    #[tokio::test]
    async fn test_unknown_template() {
        let engine = engine(Arc::new(Memory::new()));
        let request = SpinRequest::new("s1", "missing").with_player("p1");
        assert!(matches!(
            engine.spin(request).await,
            Err(SpinError::UnknownTemplate(template)) if template == "missing"
        ));
        // Nothing was charged.
        assert_eq!(engine.status("p1", None).await.unwrap().spins_used, 0);
        assert!(engine.probabilities("missing").is_none());
    }

    #[tokio::test]
    async fn test_empty_pool_releases_spin() {
        let engine = engine(Arc::new(Memory::new()));
        engine
            .put_template("empty", SpinPolicyConfig::default())
            .unwrap();
        let request = SpinRequest::new("s1", "empty")
            .with_player("p1")
            .with_spin_index(1);
        assert!(matches!(engine.spin(request).await, Err(SpinError::EmptyPool)));
        assert_eq!(engine.status("p1", None).await.unwrap().spins_used, 0);
    }

    #[tokio::test]
    async fn test_single_guaranteed_prize_is_still_drawn() {
        let engine = engine(Arc::new(Memory::new()));
        let config = SpinPolicyConfig {
            prizes: vec![Prize::new("g", "G", 1.0)],
            guaranteed_prize_id: Some("g".to_string()),
            guaranteed_enabled: true,
            cycle_length: 2,
            sequence: Vec::new(),
            exclude_guaranteed_from_free: true,
        };
        engine.put_template("solo", config).unwrap();
        let receipt = engine
            .spin(SpinRequest::new("s1", "solo").with_spin_index(1))
            .await
            .unwrap();
        assert_eq!(receipt.outcome().prize.id, "g");
        assert!(!receipt.outcome().used_guaranteed);
        assert_eq!(receipt.outcome().probability_percent, 100.0);
    }

    #[tokio::test]
    async fn test_stale_forced_id_is_counted() {
        let engine = engine(Arc::new(Memory::new()));
        let mut config = sequenced();
        config.sequence = vec![Some("retired".to_string())];
        engine.put_template("stale", config).unwrap();

        let receipt = engine
            .spin(SpinRequest::new("s1", "stale").with_spin_index(1))
            .await
            .unwrap();
        assert!(!receipt.outcome().used_sequence);
        assert_eq!(engine.metrics().stale_forced_ids.get(), 1);
    }

    #[tokio::test]
    async fn test_claim_once() {
        let engine = engine(Arc::new(Memory::new()));
        let receipt = engine.spin(SpinRequest::new("s1", "basic")).await.unwrap();
        let id = receipt.entry.id;

        assert!(matches!(
            engine.claim(id, "s2").await,
            Err(ClaimError::NotFound(missing)) if missing == id
        ));
        let claimed = engine.claim(id, "s1").await.unwrap();
        assert!(claimed.spin.claimed_at.is_some());
        assert_eq!(claimed.claim.kind, EntryKind::Claim);
        assert_eq!(claimed.claim.outcome_ref, Some(id));
        assert!(matches!(
            engine.claim(id, "s1").await,
            Err(ClaimError::AlreadyClaimed(_))
        ));
        assert!(matches!(
            engine.claim(claimed.claim.id, "s1").await,
            Err(ClaimError::NotASpin(_))
        ));
        assert_eq!(engine.metrics().claims.get(), 1);

        let stats = engine.stats(Some("basic")).await.unwrap();
        assert_eq!((stats.total_spins, stats.total_claims), (1, 1));
    }

    #[tokio::test]
    async fn test_grant_and_probabilities() {
        let engine = engine(Arc::new(Memory::new()));
        let budget = engine.grant("p1", 2, None).await.unwrap();
        assert_eq!(budget.max_spins, Some(2));

        let probabilities = engine.probabilities("basic").unwrap();
        let ids: Vec<&str> = probabilities.iter().map(|p| p.prize.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(probabilities[2].percent, 50.0);
    }
}
