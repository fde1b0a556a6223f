//! job-supervisor — embedded library for launching shell commands as
//! tracked child processes with persistent state and log capture.
//!
//! [`JobManager`] is the entry point: it owns a [`RecordStore`] for durable
//! bookkeeping and a [`ProcessSupervisor`] for live process tracking, and
//! reconciles the two whenever a caller asks for a job's status.

pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod schema;
pub mod store;
pub mod supervisor;

pub use config::{resolve_base, SupervisorTunables};
pub use error::{ManagerError, StoreError, SupervisorError};
pub use manager::JobManager;
pub use schema::{JobFilter, JobRecord, JobStatus};
pub use store::RecordStore;
pub use supervisor::ProcessSupervisor;
