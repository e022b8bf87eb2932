//! App - the worker assembled from ports.
//!
//! - **decoder**: broker message -> `todo` task
//! - **registry**: operation -> handler
//! - **dispatcher**: runs a task and resolves it
//! - **worker_loop**: the consumption lifecycle
//! - **builder**: wiring + fail-fast checks
//! - **shutdown**: signal handling
//! - **reconnect**: backoff for a dropped broker connection

pub mod builder;
pub mod decoder;
pub mod dispatcher;
pub mod reconnect;
pub mod registry;
pub mod shutdown;
pub mod worker_loop;

pub use self::builder::{BuildError, WorkerBuilder};
pub use self::decoder::decode;
pub use self::dispatcher::{AlreadyResolved, DispatchError, DispatchReport, Dispatcher, Resolution};
pub use self::reconnect::ReconnectPolicy;
pub use self::registry::{OperationRegistry, RegistryError};
pub use self::shutdown::{ShutdownHandle, ShutdownSignal, listen_for_signals, shutdown_channel};
pub use self::worker_loop::{AckDecision, Worker, WorkerSettings, settle_rejected};
