//! Credential failover engine
//!
//! Keeps a pool of interchangeable credentials for a single CLI client and
//! guarantees exactly one of them is active. The client reads the active
//! credential from a fixed file; everything else sits benched in the pool file.
//!
//! Components:
//! - `CredentialStore` holds the pool and active slot and persists them
//! - `SwitchCoordinator` is the only writer; one lock serializes every mutation
//! - `QuotaProbe` periodically asks the usage endpoint about the active credential
//! - `LogFailoverWatcher` tails the client log and triggers `auto_failover()`
//!
//! Failover flow:
//! 1. Client logs "Ready for more? Reload your tokens" → watcher detects it
//! 2. Watcher calls `SwitchCoordinator::auto_failover()`
//! 3. Coordinator benches the active credential with its quota state and
//!    activates the first pool credential that is not exhausted
//! 4. Both files are rewritten atomically; `Switched` and `FailoverTriggered`
//!    events go out to subscribers

pub mod coordinator;
pub mod error;
pub mod events;
pub mod probe;
pub mod signature;
pub mod store;
mod task;
pub mod watcher;

pub use coordinator::{
    DEFAULT_LOCK_TIMEOUT, DeleteOutcome, ImportOutcome, QuotaUpdate, SwitchCoordinator,
    SwitchOutcome,
};
pub use error::{Error, Result};
pub use events::{FailoverFailure, PoolEvent, SwitchTrigger};
pub use probe::{ProbeSettings, QuotaProbe};
pub use signature::{DEFAULT_EXHAUSTION_PATTERNS, Signature};
pub use store::{CredentialStore, StoreSnapshot};
pub use watcher::{LogFailoverWatcher, LogTail, WatcherSettings};
