//! Error types for the foldermerge core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type. [`ResolveError`] is what a resolution attempt returns;
//! it classifies failures into transient, data-consistency and supersession
//! cases so the scheduler can log and count them appropriately.

use thiserror::Error;

use crate::model::{BlockPointer, Revision};

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Folder(#[from] FolderError),
}

// ---------------------------------------------------------------------------
// Chain errors
// ---------------------------------------------------------------------------

/// Data-consistency errors raised while building per-node op chains.
#[derive(Debug, Error)]
pub enum ChainError {
    /// An op targets a pointer that no chain in this branch tracks.
    #[error("could not find chain for most recent pointer {0}")]
    NoChainFound(BlockPointer),

    /// An op unreferences a pointer its own branch already replaced.
    #[error("pointer {0} was already superseded earlier in this branch")]
    StalePointer(BlockPointer),

    /// A rename names a parent directory that is not tracked.
    #[error("rename of '{name}' references untracked parent {parent}")]
    RenameParentMissing {
        name: String,
        parent: BlockPointer,
    },
}

// ---------------------------------------------------------------------------
// Path errors
// ---------------------------------------------------------------------------

/// Errors from resolving branch-specific paths.
#[derive(Debug, Error)]
pub enum PathError {
    /// A node that must be reachable from a branch root was not found.
    #[error("node {ptr} not reachable in the {branch} tree")]
    NodeNotFound {
        ptr: BlockPointer,
        branch: &'static str,
    },

    /// A directory does not contain an entry the path walk expected.
    #[error("entry '{name}' missing from directory {dir}")]
    EntryNotFound {
        name: String,
        dir: BlockPointer,
    },

    /// Chains were built without any revision, so there is no head to walk.
    #[error("no {branch} head revision to resolve paths from")]
    MissingHead { branch: &'static str },
}

// ---------------------------------------------------------------------------
// Action errors
// ---------------------------------------------------------------------------

/// Errors from applying reconciling actions to directory blocks.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The entry an action copies from or modifies does not exist.
    #[error("entry '{name}' not found in the {side} directory")]
    EntryMissing {
        name: String,
        side: &'static str,
    },

    /// Every candidate for a unique copy name was already taken.
    #[error("could not find a free name for '{0}'")]
    UniqueNameExhausted(String),
}

// ---------------------------------------------------------------------------
// Fetch errors
// ---------------------------------------------------------------------------

/// Transient errors from the revision and block collaborators.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The requested revision does not exist (yet).
    #[error("revision {0} not found")]
    RevisionNotFound(Revision),

    /// A block could not be fetched.
    #[error("block {0} not found")]
    BlockNotFound(BlockPointer),

    /// The pointer refers to a file where a directory was expected.
    #[error("block {0} is not a directory")]
    NotADirectory(BlockPointer),

    /// The backing store is unavailable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Commit errors
// ---------------------------------------------------------------------------

/// Errors from publishing the resolved merged revision.
#[derive(Debug, Error)]
pub enum CommitError {
    /// The merged head moved since the resolution fetched it.
    #[error("merged head moved: expected {expected}, found {actual}")]
    HeadMoved {
        expected: Revision,
        actual: Revision,
    },

    /// The unmerged branch gained revisions the resolution did not include.
    #[error("unmerged branch advanced past {resolved} to {actual}")]
    BranchAdvanced {
        resolved: Revision,
        actual: Revision,
    },
}

// ---------------------------------------------------------------------------
// Resolution errors
// ---------------------------------------------------------------------------

/// Errors returned by one resolution attempt or by the scheduler.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The attempt was superseded or explicitly canceled.
    #[error("conflict resolution canceled")]
    Canceled,

    /// A fetched head is older than the recorded baseline.
    #[error("{branch} revision {observed} is lower than the expected {branch} revision {baseline}")]
    StaleBaseline {
        branch: &'static str,
        observed: Revision,
        baseline: Revision,
    },

    /// The resolver no longer accepts requests.
    #[error("conflict resolver is shut down")]
    ShutDown,

    /// Resolution failed too many times in a row on this branch; attempts
    /// are refused until the failure record is cleared.
    #[error("conflict resolution failed {failures} times in a row; branch is stuck")]
    TooManyAttempts { failures: u64 },

    #[error("conflict resolution error: {0}")]
    Chain(#[from] ChainError),

    #[error("conflict resolution error: {0}")]
    Path(#[from] PathError),

    #[error("conflict resolution error: {0}")]
    Action(#[from] ActionError),

    #[error("conflict resolution fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("conflict resolution commit error: {0}")]
    Commit(#[from] CommitError),
}

impl ResolveError {
    /// Failures that are retried implicitly when the next revision arrives.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Commit(_))
    }

    /// Invariant violations that must surface as hard errors.
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            Self::Chain(_) | Self::Path(_) | Self::Action(_) | Self::StaleBaseline { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Folder errors
// ---------------------------------------------------------------------------

/// Errors from writing to or reading an in-memory folder.
#[derive(Debug, Error)]
pub enum FolderError {
    /// No entry at the given path.
    #[error("no such entry: {0}")]
    NoSuchEntry(String),

    /// An entry already exists at the given path.
    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    /// A path component is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// The entry is a directory where a file was expected.
    #[error("not a file: {0}")]
    NotAFile(String),

    /// A directory cannot move into itself or its own descendant.
    #[error("cannot move {from} to {to}")]
    InvalidMove { from: String, to: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
