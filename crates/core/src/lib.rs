//! foldermerge core library.
//!
//! This crate reconciles a device's unmerged branch of a shared folder back
//! into the folder's merged history: per-node op chains, branch-specific
//! path resolution, conflict actions and their collapsing, copy-on-write
//! execution, and the scheduler that serializes and cancels attempts. An
//! in-memory folder backend implements every collaborator the engine needs.

pub mod cancel;
pub mod chains;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod memory;
pub mod model;
pub mod ops;
pub mod paths;
pub mod scheduler;
pub mod source;

// Re-exports for convenience.
pub use cancel::{CancellationToken, OutstandingCount};
pub use config::ResolverConfig;
pub use engine::{ResolutionEngine, ResolutionReport};
pub use errors::{CoreError, ResolveError};
pub use memory::MemoryFolder;
pub use model::{BlockPointer, BranchId, ConflictInput, Revision, WriterInfo};
pub use scheduler::{ConflictResolver, StatsSnapshot};
