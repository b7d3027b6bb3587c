pub mod fabric;
pub mod job;
pub mod postgres;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub use fabric::{Fabric, LocalFabric, LockGrant};
pub use job::{JobService, LockHandle};
pub use postgres::PgFabric;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("could not acquire lock `{name}` within {} ms", waited.as_millis())]
    LockTimeout { name: String, waited: Duration },
    #[error("cluster fabric: {0}")]
    Fabric(String),
}

impl From<sqlx::Error> for JobError {
    fn from(err: sqlx::Error) -> Self {
        JobError::Fabric(err.to_string())
    }
}

/// A notification fanned out to every live instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BroadcastMessage {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
    /// Instance id of the sender.
    pub origin: String,
}
