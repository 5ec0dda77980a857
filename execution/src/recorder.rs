//! Spin and claim history.

use crate::state::{Claim, HistoryStore, StoreError};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::debug;
use wheelspin_types::{EntryKind, HistoryEntry, HistoryFilter, NewEntry, SpinOutcome, Stats};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

pub struct Recorder<S> {
    store: Arc<S>,
}

impl<S: HistoryStore> Recorder<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Append a spin. The store assigns the id; the timestamp is taken now.
    pub async fn record_spin(
        &self,
        session_id: &str,
        player_id: Option<&str>,
        template: &str,
        outcome: SpinOutcome,
        request_id: Option<&str>,
    ) -> Result<HistoryEntry, StoreError> {
        let entry = self
            .store
            .append(NewEntry {
                kind: EntryKind::Spin,
                session_id: session_id.to_string(),
                player_id: player_id.map(str::to_string),
                template: template.to_string(),
                timestamp: now_millis(),
                outcome,
                request_id: request_id.map(str::to_string),
                outcome_ref: None,
            })
            .await?;
        debug!(
            id = entry.id,
            session_id,
            template,
            prize = %entry.outcome.prize.id,
            "recorded spin"
        );
        Ok(entry)
    }

    /// Claim spin `spin_id` for `session_id`.
    pub async fn claim(&self, spin_id: u64, session_id: &str) -> Result<Claim, StoreError> {
        self.store.claim(spin_id, session_id, now_millis()).await
    }

    pub async fn find_by_request(
        &self,
        request_id: &str,
    ) -> Result<Option<HistoryEntry>, StoreError> {
        self.store.find_by_request(request_id).await
    }

    pub async fn query(&self, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>, StoreError> {
        self.store.query(filter).await
    }

    pub async fn stats(&self, template: Option<&str>) -> Result<Stats, StoreError> {
        self.store.stats(template).await
    }

    pub async fn count_spins(&self, session_id: &str, template: &str) -> Result<u64, StoreError> {
        self.store.count_spins(session_id, template).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Memory;
    use wheelspin_types::Prize;

    fn outcome(prize: &str) -> SpinOutcome {
        SpinOutcome {
            prize: Prize::new(prize, prize, 1.0),
            probability_percent: 50.0,
            used_guaranteed: false,
            used_sequence: false,
            spin_index: 1,
            slice_index: 0,
        }
    }

    #[tokio::test]
    async fn test_record_and_claim() {
        let recorder = Recorder::new(Arc::new(Memory::new()));
        let before = now_millis();
        let spin = recorder
            .record_spin("s1", Some("p1"), "t1", outcome("a"), Some("r1"))
            .await
            .unwrap();
        assert_eq!(spin.kind, EntryKind::Spin);
        assert!(spin.timestamp >= before);
        assert_eq!(spin.player_id.as_deref(), Some("p1"));

        let Claim::Claimed(stamped, claim) = recorder.claim(spin.id, "s1").await.unwrap() else {
            panic!("expected claim");
        };
        assert!(stamped.claimed_at.is_some());
        assert_eq!(claim.outcome_ref, Some(spin.id));

        let history = recorder.query(&HistoryFilter::default()).await.unwrap();
        assert_eq!(history.iter().map(|e| e.id).collect::<Vec<_>>(), vec![claim.id, spin.id]);
        assert_eq!(history[1].claimed_at, stamped.claimed_at);
        assert_eq!(recorder.count_spins("s1", "t1").await.unwrap(), 1);
        assert_eq!(
            recorder.find_by_request("r1").await.unwrap().map(|e| e.id),
            Some(spin.id)
        );
    }

    #[tokio::test]
    async fn test_ids_increase() {
        let recorder = Recorder::new(Arc::new(Memory::new()));
        let mut last = 0;
        for prize in ["a", "b", "c"] {
            let entry = recorder
                .record_spin("s1", None, "t1", outcome(prize), None)
                .await
                .unwrap();
            assert!(entry.id > last);
            last = entry.id;
        }
        let stats = recorder.stats(Some("t1")).await.unwrap();
        assert_eq!(stats.total_spins, 3);
        assert_eq!(stats.active_sessions, 1);
    }
}
