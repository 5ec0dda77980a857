//! Per-player spin budgets.

use crate::{
    metrics::Metrics,
    state::{BudgetStore, Consume, StoreError},
};
use std::sync::Arc;
use tracing::{debug, info};
use wheelspin_types::{BudgetKey, SpinBudget};

pub struct Ledger<S> {
    store: Arc<S>,
    metrics: Metrics,
}

impl<S> Clone for Ledger<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S: BudgetStore> Ledger<S> {
    pub fn new(store: Arc<S>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    /// Current budget. Players nobody configured are unlimited.
    pub async fn get_status(
        &self,
        player_id: &str,
        template: Option<&str>,
    ) -> Result<SpinBudget, StoreError> {
        self.store.budget(&key(player_id, template)).await
    }

    /// Overwrite the ceiling without touching usage.
    pub async fn set_limit(
        &self,
        player_id: &str,
        max_spins: Option<u32>,
        template: Option<&str>,
    ) -> Result<SpinBudget, StoreError> {
        let budget = self
            .store
            .set_limit(key(player_id, template), max_spins)
            .await?;
        info!(player_id, ?template, ?max_spins, spins_used = budget.spins_used, "set spin limit");
        Ok(budget)
    }

    /// Charge one spin. [Consume::Exhausted] leaves the budget untouched.
    pub async fn consume_spin(
        &self,
        player_id: &str,
        template: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<Consume, StoreError> {
        let result = self
            .store
            .try_consume(&key(player_id, template), request_id)
            .await?;
        match &result {
            Consume::Consumed(budget) => {
                debug!(player_id, spins_used = budget.spins_used, "consumed spin");
            }
            Consume::Replayed(_) => debug!(player_id, ?request_id, "replayed spin request"),
            Consume::Exhausted(budget) => {
                self.metrics.limit_exceeded.inc();
                info!(player_id, max_spins = ?budget.max_spins, "no spins remaining");
            }
        }
        Ok(result)
    }

    /// Raise the ceiling by `additional`, treating unlimited as zero.
    ///
    /// This reads then writes, so a grant racing a consume can lose the
    /// consume's view of the old ceiling. Grants are rare admin actions.
    pub async fn grant_spins(
        &self,
        player_id: &str,
        additional: u32,
        template: Option<&str>,
    ) -> Result<SpinBudget, StoreError> {
        let current = self.get_status(player_id, template).await?;
        let max_spins = current.max_spins.unwrap_or(0).saturating_add(additional);
        self.set_limit(player_id, Some(max_spins), template).await
    }

    /// Return a spin charged by [Ledger::consume_spin].
    pub async fn release(
        &self,
        player_id: &str,
        template: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<SpinBudget, StoreError> {
        self.store
            .release(&key(player_id, template), request_id)
            .await
    }
}

fn key(player_id: &str, template: Option<&str>) -> BudgetKey {
    BudgetKey::new(player_id, template.map(str::to_string))
}
