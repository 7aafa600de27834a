//! In-memory folder backend.
//!
//! [`MemoryFolder`] implements every collaborator the resolver consumes: a
//! content-addressed block store, the merged revision history, one unmerged
//! branch, a node cache and a commit sink. Writes go through
//! [`TreeWriter`], which rewrites the touched directory and its ancestors
//! copy-on-write and records well-formed ops, so a folder can be driven
//! exactly like a device would drive a real one.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::errors::{CommitError, FetchError, FolderError};
use crate::model::{
    Attr, Block, BlockId, BlockPointer, BlockUpdate, Branch, BranchId, DirBlock, DirEntry,
    EntryType, FileBlock, Path, Revision, RevisionData, WriterInfo,
};
use crate::ops::{CreateOp, Op, OpCommon, RenameOp, RmOp, SetAttrOp, SyncOp};
use crate::source::{BlockSource, CommitSink, MergedCommit, NodeCache, RevisionSource};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct UnmergedBranch {
    id: BranchId,
    branch_point: RevisionData,
    revisions: Vec<RevisionData>,
}

impl UnmergedBranch {
    fn head(&self) -> &RevisionData {
        self.revisions.last().unwrap_or(&self.branch_point)
    }
}

#[derive(Debug)]
struct FolderState {
    blocks: HashMap<BlockId, Block>,
    merged: Vec<RevisionData>,
    unmerged: Option<UnmergedBranch>,
    node_paths: HashMap<BlockPointer, Path>,
    unavailable: bool,
    fetch_delay: Option<Duration>,
}

impl FolderState {
    fn merged_head(&self) -> &RevisionData {
        // `new` always stores the initial revision.
        &self.merged[self.merged.len() - 1]
    }
}

/// One node in a flattened tree listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub entry_type: EntryType,
    pub pointer: BlockPointer,
    pub size: u64,
    /// File contents; `None` for directories.
    pub contents: Option<Vec<u8>>,
}

/// Which branch a write goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    Merged,
    Unmerged,
}

/// A folder held entirely in memory.
#[derive(Debug)]
pub struct MemoryFolder {
    state: RwLock<FolderState>,
}

impl MemoryFolder {
    /// A folder whose first merged revision is an empty root directory.
    pub fn new(writer: WriterInfo) -> Self {
        let mut blocks = HashMap::new();
        let root_block = Block::Dir(DirBlock::default());
        let id = root_block.content_id();
        blocks.insert(id, root_block);
        let initial = RevisionData {
            revision: Revision::INITIAL,
            branch: Branch::Merged,
            prev: Revision::UNINITIALIZED,
            root: BlockPointer::new(id),
            writer,
            ops: Vec::new(),
        };
        Self {
            state: RwLock::new(FolderState {
                blocks,
                merged: vec![initial],
                unmerged: None,
                node_paths: HashMap::new(),
                unavailable: false,
                fetch_delay: None,
            }),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, FolderState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, FolderState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn merged_head(&self) -> RevisionData {
        self.read_state().merged_head().clone()
    }

    pub fn merged_revision_count(&self) -> usize {
        self.read_state().merged.len()
    }

    pub fn merged_history(&self) -> Vec<RevisionData> {
        self.read_state().merged.clone()
    }

    pub fn unmerged_branch(&self) -> Option<BranchId> {
        self.read_state().unmerged.as_ref().map(|b| b.id.clone())
    }

    /// Head of the unmerged branch, or `None` without one.
    pub fn unmerged_head(&self) -> Option<RevisionData> {
        self.read_state()
            .unmerged
            .as_ref()
            .map(|b| b.head().clone())
    }

    /// Fork an unmerged branch at the current merged head, replacing any
    /// existing one.
    pub fn begin_unmerged_branch(&self) -> BranchId {
        let mut state = self.write_state();
        let id = BranchId::random();
        let branch_point = state.merged_head().clone();
        info!(branch = %id, at = %branch_point.revision, "starting unmerged branch");
        state.unmerged = Some(UnmergedBranch {
            id: id.clone(),
            branch_point,
            revisions: Vec::new(),
        });
        id
    }

    /// Make every fetch fail as if the server were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.write_state().unavailable = unavailable;
    }

    /// Delay every revision and block fetch.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.write_state().fetch_delay = delay;
    }

    /// Paths currently held by the node cache.
    pub fn cached_paths(&self) -> Vec<Path> {
        self.read_state().node_paths.values().cloned().collect()
    }

    /// Apply `f` to a branch as one new revision. Returns the new head
    /// revision, or the old one if `f` recorded no ops.
    pub fn write<F>(&self, target: WriteTarget, writer: WriterInfo, f: F) -> Result<Revision, FolderError>
    where
        F: FnOnce(&mut TreeWriter<'_>) -> Result<(), FolderError>,
    {
        let mut state = self.write_state();
        if target == WriteTarget::Unmerged && state.unmerged.is_none() {
            let branch_point = state.merged_head().clone();
            state.unmerged = Some(UnmergedBranch {
                id: BranchId::random(),
                branch_point,
                revisions: Vec::new(),
            });
        }
        let (head, branch) = match (&state.unmerged, target) {
            (Some(b), WriteTarget::Unmerged) => (b.head().clone(), Branch::Unmerged(b.id.clone())),
            _ => (state.merged_head().clone(), Branch::Merged),
        };

        let mut tw = TreeWriter {
            blocks: &mut state.blocks,
            root: head.root,
            writer: writer.clone(),
            ops: Vec::new(),
            touched: Vec::new(),
        };
        f(&mut tw)?;
        let TreeWriter {
            root, ops, touched, ..
        } = tw;
        if ops.is_empty() {
            return Ok(head.revision);
        }

        let revision = RevisionData {
            revision: head.revision.next(),
            branch,
            prev: head.revision,
            root,
            writer,
            ops,
        };
        debug!(revision = %revision.revision, ops = revision.ops.len(), ?target, "wrote revision");
        let number = revision.revision;
        match (&mut state.unmerged, target) {
            (Some(b), WriteTarget::Unmerged) => b.revisions.push(revision),
            _ => state.merged.push(revision),
        }

        if target == WriteTarget::Unmerged {
            let blocks = &state.blocks;
            let paths: Vec<(BlockPointer, Path)> = touched
                .iter()
                .filter_map(|p| resolve_path(blocks, root, p))
                .map(|p| (p.tail_pointer(), p))
                .collect();
            state.node_paths.extend(paths);
        }
        Ok(number)
    }

    pub fn write_merged<F>(&self, writer: WriterInfo, f: F) -> Result<Revision, FolderError>
    where
        F: FnOnce(&mut TreeWriter<'_>) -> Result<(), FolderError>,
    {
        self.write(WriteTarget::Merged, writer, f)
    }

    pub fn write_unmerged<F>(&self, writer: WriterInfo, f: F) -> Result<Revision, FolderError>
    where
        F: FnOnce(&mut TreeWriter<'_>) -> Result<(), FolderError>,
    {
        self.write(WriteTarget::Unmerged, writer, f)
    }

    /// Flattened listing of the tree under `root`, keyed by `/`-joined path.
    pub fn tree(&self, root: BlockPointer) -> Result<BTreeMap<String, TreeNode>, FolderError> {
        let state = self.read_state();
        let mut out = BTreeMap::new();
        let mut queue = VecDeque::from([(String::new(), root)]);
        while let Some((prefix, ptr)) = queue.pop_front() {
            let dir = dir_block(&state.blocks, ptr)?;
            for (name, entry) in &dir.entries {
                let path = format!("{prefix}/{name}");
                let contents = match state.blocks.get(&entry.pointer.id) {
                    Some(Block::File(file)) => Some(file.contents.clone()),
                    _ => None,
                };
                if entry.entry_type == EntryType::Dir {
                    queue.push_back((path.clone(), entry.pointer));
                }
                out.insert(
                    path,
                    TreeNode {
                        entry_type: entry.entry_type,
                        pointer: entry.pointer,
                        size: entry.size,
                        contents,
                    },
                );
            }
        }
        Ok(out)
    }

    pub fn merged_tree(&self) -> Result<BTreeMap<String, TreeNode>, FolderError> {
        let root = self.merged_head().root;
        self.tree(root)
    }

    pub fn unmerged_tree(&self) -> Result<BTreeMap<String, TreeNode>, FolderError> {
        let root = self
            .unmerged_head()
            .map(|h| h.root)
            .unwrap_or_else(|| self.merged_head().root);
        self.tree(root)
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), FetchError> {
        let (unavailable, delay) = {
            let state = self.read_state();
            (state.unavailable, state.fetch_delay)
        };
        if unavailable {
            return Err(FetchError::Unavailable("folder server unreachable".into()));
        }
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(FetchError::Unavailable("fetch canceled".into()));
                }
            }
        }
        Ok(())
    }
}

fn dir_block(blocks: &HashMap<BlockId, Block>, ptr: BlockPointer) -> Result<DirBlock, FetchError> {
    match blocks.get(&ptr.id) {
        Some(Block::Dir(dir)) => Ok(dir.clone()),
        Some(Block::File(_)) => Err(FetchError::NotADirectory(ptr)),
        None => Err(FetchError::BlockNotFound(ptr)),
    }
}

fn split(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

fn resolve_path(blocks: &HashMap<BlockId, Block>, root: BlockPointer, path: &str) -> Option<Path> {
    let mut out = Path::root(root);
    for name in split(path) {
        let dir = dir_block(blocks, out.tail_pointer()).ok()?;
        let entry = dir.get(name)?;
        out = out.child(name, entry.pointer);
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Tree writer
// ---------------------------------------------------------------------------

/// Stages changes to one branch and records the matching ops.
pub struct TreeWriter<'a> {
    blocks: &'a mut HashMap<BlockId, Block>,
    root: BlockPointer,
    writer: WriterInfo,
    ops: Vec<Op>,
    touched: Vec<String>,
}

impl TreeWriter<'_> {
    fn dir(&self, ptr: BlockPointer) -> Result<DirBlock, FolderError> {
        Ok(dir_block(self.blocks, ptr)?)
    }

    fn put(&mut self, block: Block) -> BlockPointer {
        let id = block.content_id();
        self.blocks.insert(id, block);
        BlockPointer::new(id).with_fresh_nonce()
    }

    fn common(&self) -> OpCommon {
        OpCommon::new(self.writer.clone())
    }

    /// Directories from the root down through `comps`.
    fn walk(&self, comps: &[&str]) -> Result<Path, FolderError> {
        let mut path = Path::root(self.root);
        for (i, name) in comps.iter().enumerate() {
            let dir = self.dir(path.tail_pointer())?;
            let entry = dir
                .get(name)
                .ok_or_else(|| FolderError::NoSuchEntry(comps[..=i].join("/")))?;
            if entry.entry_type != EntryType::Dir {
                return Err(FolderError::NotADirectory(comps[..=i].join("/")));
            }
            path = path.child(*name, entry.pointer);
        }
        Ok(path)
    }

    /// Store `block` as the new version of the last directory of `dirs`
    /// and rewrite its ancestors. Returns that directory's update followed
    /// by its ancestors', innermost first.
    fn rewrite(&mut self, dirs: &Path, block: DirBlock) -> Result<Vec<BlockUpdate>, FolderError> {
        let mut new_ptr = self.put(Block::Dir(block));
        let mut updates = vec![BlockUpdate::new(dirs.tail_pointer(), new_ptr)];
        for i in (0..dirs.len() - 1).rev() {
            let parent = dirs.nodes[i].pointer;
            let child_name = &dirs.nodes[i + 1].name;
            let mut parent_block = self.dir(parent)?;
            if let Some(entry) = parent_block.entries.get_mut(child_name) {
                entry.pointer = new_ptr;
            }
            new_ptr = self.put(Block::Dir(parent_block));
            updates.push(BlockUpdate::new(parent, new_ptr));
        }
        self.root = new_ptr;
        Ok(updates)
    }

    fn split_parent<'p>(path: &'p str) -> Result<(&'p str, Vec<&'p str>), FolderError> {
        let mut comps = split(path);
        let name = comps
            .pop()
            .ok_or_else(|| FolderError::NoSuchEntry(path.to_string()))?;
        Ok((name, comps))
    }

    pub fn mkdir(&mut self, path: &str) -> Result<BlockPointer, FolderError> {
        self.create(path, EntryType::Dir, Vec::new())
    }

    pub fn create_file(&mut self, path: &str, contents: impl Into<Vec<u8>>) -> Result<BlockPointer, FolderError> {
        self.create(path, EntryType::File, contents.into())
    }

    fn create(&mut self, path: &str, entry_type: EntryType, contents: Vec<u8>) -> Result<BlockPointer, FolderError> {
        let (name, parent) = Self::split_parent(path)?;
        let dirs = self.walk(&parent)?;
        let mut block = self.dir(dirs.tail_pointer())?;
        if block.contains(name) {
            return Err(FolderError::AlreadyExists(path.to_string()));
        }
        let size = contents.len() as u64;
        let node = match entry_type {
            EntryType::Dir => self.put(Block::Dir(DirBlock::default())),
            _ => self.put(Block::File(FileBlock { contents })),
        };
        block.entries.insert(
            name.to_string(),
            DirEntry {
                pointer: node,
                entry_type,
                size,
                mtime: self.writer.timestamp,
            },
        );
        let mut updates = self.rewrite(&dirs, block)?;
        let dir = updates.remove(0);
        let mut common = self.common();
        common.refs.push(node);
        common.updates = updates;
        self.ops.push(Op::Create(CreateOp {
            name: name.to_string(),
            dir,
            entry_type,
            node,
            renamed: false,
            common,
        }));
        self.touched.push(path.to_string());
        Ok(node)
    }

    /// Replace a file's contents.
    pub fn write_file(&mut self, path: &str, contents: impl Into<Vec<u8>>) -> Result<BlockPointer, FolderError> {
        let contents = contents.into();
        let (name, parent) = Self::split_parent(path)?;
        let dirs = self.walk(&parent)?;
        let mut block = self.dir(dirs.tail_pointer())?;
        let size = contents.len() as u64;
        let new = self.put(Block::File(FileBlock { contents }));
        let entry = block
            .entries
            .get_mut(name)
            .ok_or_else(|| FolderError::NoSuchEntry(path.to_string()))?;
        if !entry.entry_type.is_file() {
            return Err(FolderError::NotAFile(path.to_string()));
        }
        let old = entry.pointer;
        entry.pointer = new;
        entry.size = size;
        entry.mtime = self.writer.timestamp;

        let updates = self.rewrite(&dirs, block)?;
        let mut common = self.common();
        common.updates = updates;
        self.ops.push(Op::Sync(SyncOp {
            file: BlockUpdate::new(old, new),
            common,
        }));
        self.touched.push(path.to_string());
        Ok(new)
    }

    /// Remove an entry and release its whole subtree.
    pub fn remove(&mut self, path: &str) -> Result<(), FolderError> {
        let (name, parent) = Self::split_parent(path)?;
        let dirs = self.walk(&parent)?;
        let mut block = self.dir(dirs.tail_pointer())?;
        let entry = block
            .entries
            .remove(name)
            .ok_or_else(|| FolderError::NoSuchEntry(path.to_string()))?;

        let mut unrefs = vec![entry.pointer];
        let mut queue = VecDeque::new();
        if entry.entry_type == EntryType::Dir {
            queue.push_back(entry.pointer);
        }
        while let Some(ptr) = queue.pop_front() {
            for child in self.dir(ptr)?.entries.values() {
                unrefs.push(child.pointer);
                if child.entry_type == EntryType::Dir {
                    queue.push_back(child.pointer);
                }
            }
        }

        let mut updates = self.rewrite(&dirs, block)?;
        let dir = updates.remove(0);
        let mut common = self.common();
        common.unrefs = unrefs;
        common.updates = updates;
        self.ops.push(Op::Rm(RmOp {
            name: name.to_string(),
            dir,
            entry_type: entry.entry_type,
            node: entry.pointer,
            renamed: false,
            common,
        }));
        Ok(())
    }

    /// Move an entry, possibly across directories.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), FolderError> {
        let (old_name, old_parent) = Self::split_parent(from)?;
        let (new_name, new_parent) = Self::split_parent(to)?;
        let from_comps = split(from);
        if split(to).starts_with(&from_comps) {
            return Err(FolderError::InvalidMove {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let old_dirs = self.walk(&old_parent)?;
        let new_dirs_before = self.walk(&new_parent)?;
        if self.dir(new_dirs_before.tail_pointer())?.contains(new_name) {
            return Err(FolderError::AlreadyExists(to.to_string()));
        }
        let mut block = self.dir(old_dirs.tail_pointer())?;
        let entry = block
            .entries
            .remove(old_name)
            .ok_or_else(|| FolderError::NoSuchEntry(from.to_string()))?;
        let mut common = self.common();

        let (old_dir, new_dir) = if old_parent == new_parent {
            block.entries.insert(new_name.to_string(), entry.clone());
            let mut updates = self.rewrite(&old_dirs, block)?;
            let old_dir = updates.remove(0);
            common.updates = updates;
            (old_dir, None)
        } else {
            let mut combined = self.rewrite(&old_dirs, block)?;
            let new_dirs = self.walk(&new_parent)?;
            let mut target = self.dir(new_dirs.tail_pointer())?;
            target.entries.insert(new_name.to_string(), entry.clone());
            for update in self.rewrite(&new_dirs, target)? {
                match combined.iter_mut().find(|u| u.new == update.old) {
                    Some(earlier) => earlier.new = update.new,
                    None => combined.push(update),
                }
            }
            let take = |combined: &mut Vec<BlockUpdate>, old: BlockPointer| {
                combined
                    .iter()
                    .position(|u| u.old == old)
                    .map(|i| combined.remove(i))
            };
            let old_dir = take(&mut combined, old_dirs.tail_pointer())
                .ok_or_else(|| FolderError::NoSuchEntry(from.to_string()))?;
            let new_dir = take(&mut combined, new_dirs_before.tail_pointer())
                .ok_or_else(|| FolderError::NoSuchEntry(to.to_string()))?;
            common.updates = combined;
            (old_dir, Some(new_dir))
        };

        self.ops.push(Op::Rename(RenameOp {
            old_name: old_name.to_string(),
            old_dir,
            new_name: new_name.to_string(),
            new_dir,
            renamed: entry.pointer,
            renamed_type: entry.entry_type,
            common,
        }));
        self.touched.push(to.to_string());
        Ok(())
    }

    pub fn set_exec(&mut self, path: &str, exec: bool) -> Result<(), FolderError> {
        self.set_attr(path, Attr::Exec, |entry| {
            entry.entry_type = if exec { EntryType::Exec } else { EntryType::File };
        })
    }

    pub fn set_mtime(&mut self, path: &str, mtime: DateTime<Utc>) -> Result<(), FolderError> {
        self.set_attr(path, Attr::Mtime, |entry| entry.mtime = mtime)
    }

    fn set_attr(&mut self, path: &str, attr: Attr, apply: impl FnOnce(&mut DirEntry)) -> Result<(), FolderError> {
        let (name, parent) = Self::split_parent(path)?;
        let dirs = self.walk(&parent)?;
        let mut block = self.dir(dirs.tail_pointer())?;
        let entry = block
            .entries
            .get_mut(name)
            .ok_or_else(|| FolderError::NoSuchEntry(path.to_string()))?;
        if attr == Attr::Exec && !entry.entry_type.is_file() {
            return Err(FolderError::NotAFile(path.to_string()));
        }
        apply(entry);
        let file = entry.pointer;
        let entry_type = entry.entry_type;

        let mut updates = self.rewrite(&dirs, block)?;
        let dir = updates.remove(0);
        let mut common = self.common();
        common.updates = updates;
        self.ops.push(Op::SetAttr(SetAttrOp {
            name: name.to_string(),
            dir,
            attr,
            file,
            entry_type,
            common,
        }));
        self.touched.push(path.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Collaborator impls
// ---------------------------------------------------------------------------

impl RevisionSource for MemoryFolder {
    async fn unmerged_revisions(
        &self,
        cancel: &CancellationToken,
        branch: &BranchId,
    ) -> Result<Vec<RevisionData>, FetchError> {
        self.pause(cancel).await?;
        let state = self.read_state();
        match &state.unmerged {
            Some(b) if &b.id == branch => Ok(b.revisions.clone()),
            _ => Ok(Vec::new()),
        }
    }

    async fn merged_revisions(
        &self,
        cancel: &CancellationToken,
        after: Revision,
    ) -> Result<Vec<RevisionData>, FetchError> {
        self.pause(cancel).await?;
        let state = self.read_state();
        Ok(state
            .merged
            .iter()
            .filter(|r| r.revision > after)
            .cloned()
            .collect())
    }

    async fn merged_revision(
        &self,
        cancel: &CancellationToken,
        revision: Revision,
    ) -> Result<RevisionData, FetchError> {
        self.pause(cancel).await?;
        let state = self.read_state();
        state
            .merged
            .iter()
            .find(|r| r.revision == revision)
            .cloned()
            .ok_or(FetchError::RevisionNotFound(revision))
    }
}

impl BlockSource for MemoryFolder {
    async fn fetch_dir_block(
        &self,
        cancel: &CancellationToken,
        ptr: BlockPointer,
    ) -> Result<Arc<DirBlock>, FetchError> {
        self.pause(cancel).await?;
        let state = self.read_state();
        dir_block(&state.blocks, ptr).map(Arc::new)
    }

    async fn fetch_dir_block_copy(
        &self,
        cancel: &CancellationToken,
        ptr: BlockPointer,
    ) -> Result<DirBlock, FetchError> {
        self.pause(cancel).await?;
        let state = self.read_state();
        dir_block(&state.blocks, ptr)
    }
}

impl NodeCache for MemoryFolder {
    fn path_for(&self, ptr: &BlockPointer) -> Option<Path> {
        self.read_state().node_paths.get(ptr).cloned()
    }

    fn repoint(&self, moves: &[BlockUpdate]) {
        let mut state = self.write_state();
        for update in moves {
            if let Some(mut path) = state.node_paths.remove(&update.old) {
                if let Some(tail) = path.nodes.last_mut() {
                    tail.pointer = update.new;
                }
                state.node_paths.insert(update.new, path);
            }
        }
    }
}

impl CommitSink for MemoryFolder {
    async fn put_merged_revision(
        &self,
        _cancel: &CancellationToken,
        commit: MergedCommit,
    ) -> Result<Revision, CommitError> {
        let mut state = self.write_state();
        let head = state.merged_head().revision;
        if head != commit.revision.prev {
            return Err(CommitError::HeadMoved {
                expected: commit.revision.prev,
                actual: head,
            });
        }
        if let Some(branch) = &state.unmerged {
            if branch.id == commit.resolved_branch {
                let actual = branch.head().revision;
                if actual > commit.resolved_through {
                    return Err(CommitError::BranchAdvanced {
                        resolved: commit.resolved_through,
                        actual,
                    });
                }
            }
        }

        for (ptr, block) in commit.block_changes.new_blocks {
            state.blocks.insert(ptr.id, block);
        }
        let number = commit.revision.revision;
        state.merged.push(commit.revision);
        let resolved = state
            .unmerged
            .as_ref()
            .is_some_and(|b| b.id == commit.resolved_branch);
        if resolved {
            state.unmerged = None;
            state.node_paths.clear();
        }
        info!(revision = %number, "committed resolved revision");
        Ok(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::CrChains;
    use chrono::TimeZone;

    fn writer(name: &str) -> WriterInfo {
        WriterInfo::new(name, Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap())
    }

    #[test]
    fn test_write_and_list_tree() {
        let folder = MemoryFolder::new(writer("alice"));
        folder
            .write_merged(writer("alice"), |w| {
                w.mkdir("a")?;
                w.create_file("a/f", "hello")?;
                Ok(())
            })
            .unwrap();
        let tree = folder.merged_tree().unwrap();
        assert_eq!(tree.keys().collect::<Vec<_>>(), vec!["/a", "/a/f"]);
        assert_eq!(tree["/a/f"].contents.as_deref(), Some(&b"hello"[..]));
        assert_eq!(folder.merged_head().revision, Revision(2));
    }

    #[test]
    fn test_written_ops_build_chains() {
        let folder = MemoryFolder::new(writer("alice"));
        folder
            .write_merged(writer("alice"), |w| {
                w.mkdir("a")?;
                w.mkdir("b")?;
                w.create_file("a/f", "x")?;
                Ok(())
            })
            .unwrap();
        folder
            .write_unmerged(writer("bob"), |w| {
                w.write_file("a/f", "y")?;
                w.rename("a/f", "b/g")?;
                w.set_exec("b/g", true)?;
                w.remove("a")
            })
            .unwrap();
        let branch = folder.unmerged_branch().unwrap();
        let state = folder.read_state();
        let revisions = state.unmerged.as_ref().unwrap().revisions.clone();
        drop(state);
        assert_eq!(revisions.len(), 1);
        let chains = CrChains::build(&revisions).unwrap();
        assert!(!chains.is_empty());
        assert_eq!(chains.head().unwrap().root, folder.unmerged_head().unwrap().root);
        assert!(matches!(&revisions[0].branch, Branch::Unmerged(id) if *id == branch));
    }

    #[test]
    fn test_rename_into_own_subtree_rejected() {
        let folder = MemoryFolder::new(writer("alice"));
        let err = folder
            .write_merged(writer("alice"), |w| {
                w.mkdir("a")?;
                w.mkdir("a/b")?;
                w.rename("a", "a/b/a")
            })
            .unwrap_err();
        assert!(matches!(err, FolderError::InvalidMove { .. }));
        assert_eq!(folder.merged_revision_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_rejects_moved_head() {
        let folder = MemoryFolder::new(writer("alice"));
        let head = folder.merged_head();
        folder
            .write_merged(writer("alice"), |w| w.mkdir("a").map(|_| ()))
            .unwrap();
        let commit = MergedCommit {
            revision: RevisionData {
                revision: head.revision.next(),
                branch: Branch::Merged,
                prev: head.revision,
                root: head.root,
                writer: writer("bob"),
                ops: Vec::new(),
            },
            block_changes: Default::default(),
            resolved_branch: BranchId::random(),
            resolved_through: Revision(1),
        };
        let err = folder
            .put_merged_revision(&CancellationToken::new(), commit)
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::HeadMoved { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_fetch_fails() {
        let folder = MemoryFolder::new(writer("alice"));
        folder.set_unavailable(true);
        let err = folder
            .merged_revisions(&CancellationToken::new(), Revision(0))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unavailable(_)));
    }

    #[test]
    fn test_node_cache_tracks_unmerged_writes() {
        let folder = MemoryFolder::new(writer("alice"));
        folder
            .write_unmerged(writer("bob"), |w| w.create_file("f", "1").map(|_| ()))
            .unwrap();
        let paths = folder.cached_paths();
        assert_eq!(paths.len(), 1);
        let path = &paths[0];
        assert_eq!(path.to_string(), "/f");
        assert_eq!(folder.path_for(&path.tail_pointer()), Some(path.clone()));

        let moved = path.tail_pointer().with_fresh_nonce();
        folder.repoint(&[BlockUpdate::new(path.tail_pointer(), moved)]);
        assert_eq!(folder.path_for(&moved).unwrap().tail_pointer(), moved);
    }
}
