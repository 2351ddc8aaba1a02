//! # Mercato Webhooks
//!
//! Inbound webhook gateway: validates, deduplicates and logs change
//! notifications from the sink system, then hands them to the task
//! dispatcher. Also serves the task status query API.
//!
//! Deliveries are idempotent by `event_id`: a replay of a completed
//! delivery is acknowledged without reprocessing, and a delivery that is
//! mid-flight on another worker is answered with a duplicate signal
//! rather than an error.

pub mod crypto;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod router;

pub use error::{ApiResult, GatewayError};
pub use gateway::{WebhookAck, WebhookGateway, WebhookHeaders};
pub use router::{webhooks_router, WebhooksState};
