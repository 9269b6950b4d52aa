//! # Chat Bridge
//!
//! Service shell around the intent engine: the persisted rule store, the
//! public request/response contract, the dispatch service, the scheduled
//! refresh task, and dispatch telemetry.

pub mod api_types;
pub mod refresh;
pub mod service;
pub mod store;
pub mod telemetry;

pub use api_types::{DispatchRequest, DispatchResponse, RequestError};
pub use refresh::{RefreshScheduler, SchedulerConfig};
pub use service::{DispatchService, ServiceConfig};
pub use store::{RuleStore, StoreConfig, StoreError};
pub use telemetry::{DispatchTelemetry, TelemetrySnapshot};
