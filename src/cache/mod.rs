//! Response cache subsystem.
//!
//! # Data Flow
//! ```text
//! Request (GET/HEAD)
//!     → handler.rs (derive key, bypass checks)
//!     → engine.rs (read entry, decide freshness)
//!         → storage.rs (get / set JSON documents)
//!         → pending table (one recomputation per key)
//!     → handler.rs (materialize, validate, 304 / HEAD handling)
//!     → Response
//!
//! Background revalidation:
//!     engine.rs → WaitUntil (host hook) or detached tokio task
//!     failures → ErrorHook
//! ```
//!
//! # Design Decisions
//! - Storage and error reporting are injected, nothing is process-global
//! - Entries are never deleted, only overwritten or invalidated by integrity

pub mod engine;
pub mod entry;
pub mod handler;
pub mod hash;
pub mod storage;
pub mod types;

pub use engine::{CacheOptions, CachedFunction};
pub use entry::CacheEntry;
pub use handler::{CachedHandler, CachedResponse};
pub use storage::{FsStorage, MemoryStorage, Storage};
pub use types::{
    CacheContext, CacheError, CacheResult, DeferredTasks, ErrorHook, StorageError,
    TracingErrorHook, WaitUntil, WaitUntilHandle,
};
