//! Collaborator interfaces consumed by the resolver.
//!
//! The engine never talks to storage or the network directly. It reads
//! revisions and directory blocks, consults the node cache, and commits
//! through these traits, passing the attempt's cancellation token to every
//! call so a superseded attempt stops promptly.

use std::future::Future;
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::errors::{CommitError, FetchError};
use crate::model::{Block, BlockPointer, BlockUpdate, BranchId, DirBlock, Path, Revision, RevisionData};

/// Reads revisions from both branches.
pub trait RevisionSource: Send + Sync {
    /// Every revision of the unmerged branch `branch`, oldest first.
    fn unmerged_revisions(
        &self,
        cancel: &CancellationToken,
        branch: &BranchId,
    ) -> impl Future<Output = Result<Vec<RevisionData>, FetchError>> + Send;

    /// Merged revisions strictly after `after`, oldest first.
    fn merged_revisions(
        &self,
        cancel: &CancellationToken,
        after: Revision,
    ) -> impl Future<Output = Result<Vec<RevisionData>, FetchError>> + Send;

    /// One merged revision.
    fn merged_revision(
        &self,
        cancel: &CancellationToken,
        revision: Revision,
    ) -> impl Future<Output = Result<RevisionData, FetchError>> + Send;
}

/// Reads directory blocks.
pub trait BlockSource: Send + Sync {
    /// A shared, read-only directory block.
    fn fetch_dir_block(
        &self,
        cancel: &CancellationToken,
        ptr: BlockPointer,
    ) -> impl Future<Output = Result<Arc<DirBlock>, FetchError>> + Send;

    /// A private copy of a directory block that the caller may mutate
    /// without affecting concurrent readers.
    fn fetch_dir_block_copy(
        &self,
        cancel: &CancellationToken,
        ptr: BlockPointer,
    ) -> impl Future<Output = Result<DirBlock, FetchError>> + Send;
}

/// Live paths of open node handles.
pub trait NodeCache: Send + Sync {
    /// The cached unmerged path of the node currently at `ptr`, if any.
    fn path_for(&self, ptr: &BlockPointer) -> Option<Path>;

    /// Move handles from `old` to `new` pointers after a commit.
    fn repoint(&self, moves: &[BlockUpdate]);
}

/// Blocks written and released by one resolution.
#[derive(Debug, Clone, Default)]
pub struct BlockChanges {
    pub new_blocks: Vec<(BlockPointer, Block)>,
    pub refs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockPointer>,
}

/// A resolved revision ready to be appended to the merged history.
#[derive(Debug, Clone)]
pub struct MergedCommit {
    pub revision: RevisionData,
    pub block_changes: BlockChanges,
    /// The unmerged branch this commit folds in.
    pub resolved_branch: BranchId,
    /// Last unmerged revision folded in.
    pub resolved_through: Revision,
}

/// Persists a resolved revision.
pub trait CommitSink: Send + Sync {
    /// Append `commit` to the merged history. Called exactly once per
    /// successful resolution.
    fn put_merged_revision(
        &self,
        cancel: &CancellationToken,
        commit: MergedCommit,
    ) -> impl Future<Output = Result<Revision, CommitError>> + Send;
}

/// Everything a resolver needs from its folder.
pub trait FolderStore: RevisionSource + BlockSource + NodeCache + CommitSink + 'static {}

impl<T> FolderStore for T where T: RevisionSource + BlockSource + NodeCache + CommitSink + 'static {}
