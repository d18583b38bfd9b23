use async_trait::async_trait;
use std::fmt::Debug;

use crate::{error::Result, model::RawPayload};

pub mod weatherstack;

pub use weatherstack::WeatherstackClient;

/// Anything that can produce a raw current-conditions payload for a location.
#[async_trait]
pub trait WeatherSource: Send + Sync + Debug {
    async fn fetch(&self, location: &str) -> Result<RawPayload>;
}
