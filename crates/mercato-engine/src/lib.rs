//! # Mercato Engine
//!
//! The synchronization core: a webhook-driven, asynchronous, idempotent,
//! conflict-safe reconciliation pipeline between a source system of
//! record and a storefront sink, plus the embedded price-rule
//! computation engine.
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐
//! │   Webhook    │───►│  Dispatcher  │───►│     Worker       │
//! │   Gateway    │    │ (task queue) │    │  (poll + retry)  │
//! └──────────────┘    └──────────────┘    └────────┬─────────┘
//!                                                  │
//!                      ┌───────────────────────────┼──────────┐
//!                      │                           ▼          │
//!                 ┌──────────┐              ┌─────────────┐   │
//!                 │   Lock   │◄────────────►│  Reconciler │   │
//!                 │  Broker  │              │ (per kind)  │   │
//!                 └──────────┘              └──────┬──────┘   │
//!                                                  │          │
//!                 ┌──────────────┐          ┌──────▼──────┐   │
//!                 │ Price Engine │◄─────────│  Sync Store │◄──┘
//!                 └──────────────┘          └─────────────┘
//! ```
//!
//! Every reconciliation runs under a per-entity distributed lease and
//! records its outcome in the sync store, which is the single source of
//! truth for source↔sink identity mapping. Tasks are pulled from a
//! shared at-least-once queue; effects are idempotent despite
//! redelivery.

pub mod adapters;
pub mod alerts;
pub mod classifier;
pub mod hierarchy;
pub mod jobs;
pub mod lock;
pub mod pricing;
pub mod queue;
pub mod reconciler;
pub mod store;
pub mod worker;

pub use alerts::{Alert, AlertSeverity, AlertSink, HttpAlertSink, NoopAlertSink};
pub use classifier::{classify, SyncStatus};
pub use hierarchy::{build_chain, CategoryNode};
pub use jobs::{JobError, JobRunner};
pub use lock::{InMemoryLockBroker, Lease, LockBroker, LockOptions, PgLeaseBroker};
pub use pricing::{
    PriceBase, PriceCompute, PriceEngine, PriceFields, PriceRule, PriceRuleScope, ProductPricing,
};
pub use queue::{retry_delay, Dispatcher, TaskKind};
pub use reconciler::{
    reconcile_entity, EntityAdapter, ReconcileError, ReconcileOptions, SourceEntity, SyncAction,
    SyncBatchSummary, SyncOutcome,
};
pub use store::{InMemorySyncStore, PgSyncStore, StoreError, SyncStore};
pub use worker::{SyncWorker, TaskHandler, TaskRunError, WorkerConfig};
