use thiserror::Error;

use crate::ports::BrokerError;

/// Errors that end a worker run. Per-message and per-task problems never
/// surface here; the loop settles those itself.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("cannot connect to broker at {endpoint}")]
    Connect {
        endpoint: String,
        #[source]
        source: BrokerError,
    },

    #[error("cannot set up consumption on queue '{queue}'")]
    Setup {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("broker connection lost: {reason}")]
    ConnectionLost { reason: String },
}
