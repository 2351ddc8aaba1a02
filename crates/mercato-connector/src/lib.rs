//! # Mercato Connector
//!
//! Clients for the two external systems the sync engine talks to:
//!
//! - the **source** system of record, a JSON-RPC API with session
//!   authentication, consumed as a typed key-value document source
//!   ([`source::SourceClient`]);
//! - the **sink** storefront, a REST API keyed by consumer credentials,
//!   consumed as opaque JSON documents with an `id`/`slug`/`sku`
//!   identity surface ([`sink::SinkClient`]).
//!
//! Both clients map transport failures onto the shared
//! [`error::ConnectorError`] taxonomy so the task layer can decide what
//! is retryable.

pub mod error;
pub mod sink;
pub mod source;

pub use error::{ConnectorError, ConnectorResult};
pub use sink::{SinkClient, SinkConfig};
pub use source::{normalize_record, SourceClient, SourceConfig};
