pub mod comparator;
pub mod connection;
pub mod engine;
pub mod retry;
pub mod snapshot;
pub mod transfer;
pub mod watcher;

pub use comparator::{diff, ChangeSet};
pub use connection::{Connection, ConnectionManager, Limiter, POOL_SIZE};
pub use engine::{remote_path_for, sync_changes, SyncReport, SyncService, SyncStatus};
pub use retry::{retry_with_backoff, BackoffPolicy};
pub use snapshot::{hash_file, Snapshot, SnapshotStore, Snapshotter};
pub use transfer::{SyncOp, TransferEngine};
pub use watcher::{
    DirectoryWatcher, WatchMessage, WatcherConfig, WatcherRegistry, WatcherState, CHANGE_MARKER,
    SYNC_REQUIRED,
};
