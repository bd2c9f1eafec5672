// Mirroring cached messages into remote repositories.

pub mod engine;
pub mod error;
pub mod github;
pub mod remote;
pub mod render;
pub mod scheduler;
pub mod target;

pub use engine::{RunOutcome, SkipReason, SweepReport, SyncEngine, SyncMode, SyncRun, SyncSettings};
pub use error::{CommitError, SyncError};
pub use remote::{CommitReceipt, CommitRequest, FileChange, FileOutcome, RemoteRepositoryClient};
pub use scheduler::{Scheduler, SchedulerHandle, SweepTrigger};
pub use target::{TargetHealth, TargetRecord, TargetSpec};
