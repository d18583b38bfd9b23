//! Core library for the `weather-ingest` pipeline.
//!
//! This crate defines:
//! - Configuration layering and validation
//! - The weather API client and the payload normalizer
//! - The `weather_data` schema and the stores that write to it
//! - The run coordinator that sequences one ingestion run
//!
//! It is used by `ingest-cli`, but the coordinator can be driven by any scheduler.

pub mod config;
pub mod error;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod provider;
pub mod store;

pub use config::{RetryPolicy, RunConfig, Settings};
pub use error::{ErrorKind, IngestError, Step, StepError};
pub use model::{RawPayload, WeatherSnapshot};
pub use normalize::normalize;
pub use pipeline::{Cancellation, RunCoordinator, RunOutcome, run_once};
pub use provider::{WeatherSource, WeatherstackClient};
pub use store::{MemoryStore, PgStore, SnapshotStore};
