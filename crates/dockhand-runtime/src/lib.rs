pub mod job_store;
pub mod supervisor;

pub use job_store::{JobRecord, JobStore, JobStoreError};
pub use supervisor::{JobSupervisor, SupervisorHealth, SPAWN_FAILURE_EXIT_CODE};
