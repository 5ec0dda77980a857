//! Prize selection, spin sequencing, budgets and history.
//!
//! The pure parts ([selector], [policy], [animation]) take no locks and do no
//! I/O. Everything that persists goes through the [BudgetStore] and
//! [HistoryStore] traits, implemented by [Memory], [journal::Journal] and the
//! [tiered::Tiered] wrapper that adds a timeout and a degraded fallback.

pub mod animation;
pub mod engine;
pub mod journal;
pub mod ledger;
pub mod metrics;
pub mod policy;
pub mod recorder;
pub mod selector;
pub mod templates;
pub mod tiered;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

mod state;

pub use engine::{ClaimError, ClaimReceipt, Engine, SpinError, SpinReceipt};
pub use metrics::Metrics;
pub use state::{
    BudgetStore, Claim, Consume, HistoryStore, Memory, StoreError, Tier, MAX_TRACKED_REQUESTS,
};
pub use templates::{TemplateStore, Templates};
