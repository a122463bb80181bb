pub mod config;
pub mod engine;
pub mod error;
pub mod hasher;
pub mod lock;
pub mod progress;
pub mod reclaimer;
pub mod remote;
pub mod safe_delete;
pub mod scanner;
pub mod storage;
pub mod transfer;

pub use config::SyncConfig;
pub use engine::{CycleReport, SyncEngine};
pub use error::Error;
pub use lock::{LockRecord, SyncLock};
pub use progress::{SilentReporter, SyncReporter};
pub use reclaimer::{StorageReclaimer, UsageStatus};
pub use remote::{LocalChannel, RemoteChannel, SshChannel};
pub use safe_delete::{DeleteTask, SafeDeleteManager};
pub use storage::Database;
pub use transfer::{AtomicTransfer, TransferError};
