//! Applying actions and assembling the resolved revision.
//!
//! The executor works on private copies of merged directory blocks, so an
//! attempt that is canceled halfway leaves nothing visible to readers. It
//! processes directories leaf-first, then walks the resolved tree down from
//! the merged root and finalizes every changed block after its children,
//! pointing each parent entry at its child's new block. Directories are
//! matched to parent entries by node identity (original pointer), so a
//! directory the unmerged branch moved is linked under its new parent.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::cancel::CancellationToken;
use crate::chains::CrChains;
use crate::conflict::action::{CrAction, DirectoryState};
use crate::conflict::detector::DirActions;
use crate::errors::ResolveError;
use crate::model::{Block, BlockId, BlockPointer, BlockUpdate, DirBlock, DirEntry, EntryType, WriterInfo};
use crate::ops::{CreateOp, Op, OpCommon, ResolutionOp};
use crate::paths::{ResolvedPaths, TreeIndex};
use crate::source::{BlockChanges, BlockSource};

/// Everything the executor needs from the earlier phases.
pub struct ExecutionPlan<'a> {
    pub unmerged: &'a CrChains,
    pub merged: &'a CrChains,
    pub paths: &'a ResolvedPaths,
    /// Collapsed actions, leaf-first.
    pub dirs: &'a [DirActions],
    pub merged_index: Option<&'a TreeIndex>,
    pub merged_root: BlockPointer,
}

/// Result of one execution.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Root of the resolved merged tree.
    pub root: BlockPointer,
    /// Ops of the resolved revision, ending with its resolution op.
    pub ops: Vec<Op>,
    /// Synthetic ops local observers replay before the merged history.
    pub notifications: Vec<Op>,
    /// One line per applied action.
    pub summary: Vec<String>,
    pub block_changes: BlockChanges,
    /// Node cache moves from unmerged pointers to resolved pointers.
    pub repoints: Vec<BlockUpdate>,
}

struct WorkDir {
    /// `None` for a directory rebuilt after the merged branch deleted it.
    merged_ptr: Option<BlockPointer>,
    loaded_content: Option<BlockId>,
    block: DirBlock,
}

struct Rewritten {
    id: BlockPointer,
    before: Option<BlockPointer>,
    after: BlockPointer,
    block: DirBlock,
}

/// An unmerged file kept under a conflict name.
struct ConflictCopy {
    /// Identity of the unmerged directory holding it.
    dir: BlockPointer,
    name: String,
    entry: DirEntry,
    unmerged_ptr: BlockPointer,
}

/// Maps pointers from either branch to node identity.
#[derive(Clone, Copy)]
struct Identities<'a> {
    uc: &'a CrChains,
    mc: &'a CrChains,
}

impl Identities<'_> {
    fn of(&self, ptr: BlockPointer) -> BlockPointer {
        if self.mc.knows_pointer(&ptr) {
            self.mc.original_of(ptr)
        } else {
            self.uc.original_of(ptr)
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor<'a, B> {
    blocks: &'a B,
    cancel: &'a CancellationToken,
    writer: &'a WriterInfo,
    max_unique_name_attempts: usize,
}

impl<'a, B: BlockSource> Executor<'a, B> {
    pub fn new(
        blocks: &'a B,
        cancel: &'a CancellationToken,
        writer: &'a WriterInfo,
        max_unique_name_attempts: usize,
    ) -> Self {
        Self {
            blocks,
            cancel,
            writer,
            max_unique_name_attempts,
        }
    }

    pub async fn execute(&self, plan: &ExecutionPlan<'_>) -> Result<Execution, ResolveError> {
        let ids = Identities {
            uc: plan.unmerged,
            mc: plan.merged,
        };
        let mut work: HashMap<BlockPointer, WorkDir> = HashMap::new();
        let mut summary = Vec::new();
        let mut notifications = Vec::new();
        let mut renames: HashMap<BlockPointer, Vec<(String, String)>> = HashMap::new();
        // Keyed by the unmerged identity of the duplicated file.
        let mut repointed: HashMap<BlockPointer, BlockPointer> = HashMap::new();
        let mut excluded: HashSet<Op> = HashSet::new();
        let mut new_refs = Vec::new();
        let mut copies = Vec::new();

        self.load(&mut work, plan.merged_root, plan).await?;
        for dir in plan.dirs {
            self.cancel.check()?;
            for node in &dir.merged_path.nodes {
                self.load(&mut work, node.pointer, plan).await?;
            }
            let merged_dir = dir.merged_path.tail_pointer();
            let dir_id = merged_identity(merged_dir, plan);
            let unmerged_dir = dir.unmerged_path.tail_pointer();
            let unmerged_id = plan.unmerged.original_of(unmerged_dir);
            let unmerged_block = self.blocks.fetch_dir_block(self.cancel, unmerged_dir).await?;
            excluded.extend(dir.skipped.iter().cloned());

            let Some(wd) = work.get_mut(&dir_id) else {
                continue;
            };
            for action in &dir.actions {
                let mut state = DirectoryState {
                    unmerged: &unmerged_block,
                    merged: &mut wd.block,
                    merged_dir,
                    unmerged_chains: plan.unmerged,
                    merged_chains: plan.merged,
                    merged_index: plan.merged_index,
                    writer: self.writer,
                    max_unique_name_attempts: self.max_unique_name_attempts,
                };
                let (unmerged_patch, merged_patch) = action.apply(&mut state)?;
                trace!(dir = %dir.merged_path, action = %action, "applied action");
                summary.push(format!("{}: {}", dir.merged_path, action));

                if let (CrAction::RenameUnmerged { .. }, Some(update), Some((_, name))) = (
                    action,
                    unmerged_patch.repointed.first(),
                    unmerged_patch.renames.first(),
                ) {
                    if let Some(entry) = wd.block.get(name) {
                        copies.push(ConflictCopy {
                            dir: unmerged_id,
                            name: name.clone(),
                            entry: entry.clone(),
                            unmerged_ptr: update.old,
                        });
                    }
                }
                for update in unmerged_patch.repointed {
                    repointed.insert(plan.unmerged.original_of(update.old), update.new);
                }
                renames
                    .entry(unmerged_id)
                    .or_default()
                    .extend(unmerged_patch.renames);
                excluded.extend(unmerged_patch.dropped);
                new_refs.extend(unmerged_patch.new_refs);
                notifications.extend(merged_patch.notifications);
            }
        }

        self.cancel.check()?;
        let root_id = merged_identity(plan.merged_root, plan);
        let finalized = finalize(&mut work, root_id, plan.merged_root, ids);
        debug!(
            rewritten = finalized.rewritten.len(),
            root = %finalized.root,
            "finalized directory blocks"
        );

        let mut normalizer = OpNormalizer {
            ids,
            final_ptr: &finalized.final_ptr,
            touched: HashSet::new(),
        };
        let mut ops = Vec::new();
        let mut covered = HashSet::new();
        for chain in plan.unmerged.chains_with_ops() {
            let mut active: Vec<&(String, String)> = Vec::new();
            let dir_renames = renames.get(&chain.original);
            for op in &chain.ops {
                if excluded.contains(op) {
                    continue;
                }
                if let Some(list) = dir_renames {
                    for rename in list {
                        let starts_here = matches!(op, Op::Create(c) if c.name == rename.0);
                        let has_create = chain
                            .ops
                            .iter()
                            .any(|o| matches!(o, Op::Create(c) if c.name == rename.0));
                        if (starts_here || !has_create) && !active.contains(&rename) {
                            active.push(rename);
                        }
                    }
                }
                let mut op = op.clone();
                for (from, to) in &active {
                    op.rename_entry(from, to);
                }
                // Attribute ops sit in the node's own chain, not its parent's.
                if let Op::SetAttr(s) = &mut op {
                    let parent = plan.unmerged.original_of(s.dir.new);
                    if let Some((_, to)) = renames
                        .get(&parent)
                        .and_then(|list| list.iter().find(|(from, _)| *from == s.name))
                    {
                        s.name = to.clone();
                    }
                }
                if let Some(op) = normalizer.normalize(op, &repointed, &mut covered) {
                    ops.push(op);
                }
            }
        }

        for copy in &copies {
            if covered.contains(&plan.unmerged.original_of(copy.unmerged_ptr)) {
                continue;
            }
            let mut common = OpCommon::new(self.writer.clone());
            common.refs.push(copy.entry.pointer);
            ops.push(Op::Create(CreateOp {
                name: copy.name.clone(),
                dir: normalizer.update_for(copy.dir),
                entry_type: copy.entry.entry_type,
                node: copy.entry.pointer,
                renamed: false,
                common,
            }));
        }

        let mut block_changes = BlockChanges::default();
        let mut resolution = OpCommon::new(self.writer.clone());
        for rewritten in &finalized.rewritten {
            block_changes
                .new_blocks
                .push((rewritten.after, Block::Dir(rewritten.block.clone())));
            block_changes.refs.push(rewritten.after);
            resolution.refs.push(rewritten.after);
            if let Some(before) = rewritten.before {
                block_changes.unrefs.push(before);
                if !normalizer.touched.contains(&rewritten.id) {
                    resolution
                        .updates
                        .push(BlockUpdate::new(before, rewritten.after));
                }
            }
        }
        block_changes.refs.extend(new_refs.iter().copied());
        resolution.refs.extend(new_refs);
        ops.push(Op::Resolution(ResolutionOp {
            summary: summary.clone(),
            common: resolution,
        }));

        let mut repoints: Vec<BlockUpdate> = Vec::new();
        for (id, after) in &finalized.final_ptr {
            if repointed.contains_key(id) {
                continue;
            }
            if let Some(before) = plan.unmerged.most_recent_from_original(id) {
                if before != *after {
                    repoints.push(BlockUpdate::new(before, *after));
                }
            }
        }
        repoints.extend(
            copies
                .iter()
                .map(|c| BlockUpdate::new(c.unmerged_ptr, c.entry.pointer)),
        );
        repoints.sort_by_key(|u| (u.old, u.new));

        Ok(Execution {
            root: finalized.root,
            ops,
            notifications,
            summary,
            block_changes,
            repoints,
        })
    }

    /// Load a private copy of merged directory `ptr` unless already loaded.
    async fn load(
        &self,
        work: &mut HashMap<BlockPointer, WorkDir>,
        ptr: BlockPointer,
        plan: &ExecutionPlan<'_>,
    ) -> Result<(), ResolveError> {
        let id = merged_identity(ptr, plan);
        if work.contains_key(&id) {
            return Ok(());
        }
        let dir = if plan.paths.recreated.contains(&ptr) {
            WorkDir {
                merged_ptr: None,
                loaded_content: None,
                block: DirBlock::default(),
            }
        } else {
            let block = self.blocks.fetch_dir_block_copy(self.cancel, ptr).await?;
            WorkDir {
                merged_ptr: Some(ptr),
                loaded_content: Some(block.content_id()),
                block,
            }
        };
        work.insert(id, dir);
        Ok(())
    }
}

fn merged_identity(ptr: BlockPointer, plan: &ExecutionPlan<'_>) -> BlockPointer {
    if plan.paths.recreated.contains(&ptr) {
        ptr
    } else {
        plan.merged.original_of(ptr)
    }
}

// ---------------------------------------------------------------------------
// Finalization
// ---------------------------------------------------------------------------

struct Finalized {
    root: BlockPointer,
    rewritten: Vec<Rewritten>,
    /// Resolved pointer of every node under a finalized directory.
    final_ptr: HashMap<BlockPointer, BlockPointer>,
}

/// Post-order walk from the root over loaded directories. Unchanged blocks
/// keep their pointers; changed ones get a new pointer that their parent
/// entry is repointed to.
fn finalize(
    work: &mut HashMap<BlockPointer, WorkDir>,
    root_id: BlockPointer,
    merged_root: BlockPointer,
    ids: Identities<'_>,
) -> Finalized {
    let mut stack = vec![(root_id, false)];
    let mut visited = HashSet::new();
    let mut new_ptrs: HashMap<BlockPointer, BlockPointer> = HashMap::new();
    let mut final_ptr = HashMap::new();
    let mut rewritten = Vec::new();

    while let Some((id, expanded)) = stack.pop() {
        if !expanded {
            if !visited.insert(id) {
                continue;
            }
            let Some(wd) = work.get(&id) else {
                continue;
            };
            stack.push((id, true));
            for entry in wd.block.entries.values() {
                if entry.entry_type != EntryType::Dir {
                    continue;
                }
                let child = ids.of(entry.pointer);
                if child != id && work.contains_key(&child) && !visited.contains(&child) {
                    stack.push((child, false));
                }
            }
            continue;
        }

        let Some(wd) = work.get_mut(&id) else {
            continue;
        };
        for entry in wd.block.entries.values_mut() {
            let child = ids.of(entry.pointer);
            match new_ptrs.get(&child) {
                Some(ptr) => {
                    entry.pointer = *ptr;
                    final_ptr.insert(child, *ptr);
                }
                None => {
                    final_ptr.entry(child).or_insert(entry.pointer);
                }
            }
        }
        let content = wd.block.content_id();
        if wd.loaded_content != Some(content) {
            let ptr = BlockPointer::new(content).with_fresh_nonce();
            new_ptrs.insert(id, ptr);
            final_ptr.insert(id, ptr);
            rewritten.push(Rewritten {
                id,
                before: wd.merged_ptr,
                after: ptr,
                block: wd.block.clone(),
            });
        }
    }

    let detached = work.keys().filter(|id| !visited.contains(*id)).count();
    if detached > 0 {
        debug!(detached, "directories no longer reachable from the root");
    }

    let root = new_ptrs.get(&root_id).copied().unwrap_or(merged_root);
    final_ptr.insert(root_id, root);
    Finalized {
        root,
        rewritten,
        final_ptr,
    }
}

// ---------------------------------------------------------------------------
// Commit op normalization
// ---------------------------------------------------------------------------

/// Rewrites unmerged ops in terms of merged-branch pointers.
///
/// Every node's first update goes from its merged head pointer to its
/// resolved pointer; later updates keep the resolved pointer, so a chain
/// built over the merged history later never sees a superseded pointer.
struct OpNormalizer<'a> {
    ids: Identities<'a>,
    final_ptr: &'a HashMap<BlockPointer, BlockPointer>,
    touched: HashSet<BlockPointer>,
}

impl OpNormalizer<'_> {
    fn update_for(&mut self, ptr: BlockPointer) -> BlockUpdate {
        let id = self.ids.of(ptr);
        let before = self.ids.mc.most_recent_from_original_or_same(&id);
        match self.final_ptr.get(&id) {
            Some(&after) if after != before && self.touched.insert(id) => {
                BlockUpdate::new(before, after)
            }
            Some(&after) => BlockUpdate::unchanged(after),
            None => BlockUpdate::unchanged(before),
        }
    }

    fn resolved(&self, ptr: BlockPointer) -> BlockPointer {
        self.final_ptr
            .get(&self.ids.of(ptr))
            .copied()
            .unwrap_or(ptr)
    }

    fn merged_space(&self, ptr: BlockPointer) -> BlockPointer {
        self.ids
            .mc
            .most_recent_from_original_or_same(&self.ids.of(ptr))
    }

    /// The committed form of `op`, or `None` when it no longer applies.
    fn normalize(
        &mut self,
        mut op: Op,
        repointed: &HashMap<BlockPointer, BlockPointer>,
        covered: &mut HashSet<BlockPointer>,
    ) -> Option<Op> {
        let uc = self.ids.uc;
        match &mut op {
            Op::Create(c) => {
                let id = uc.original_of(c.node);
                if let Some(copy) = repointed.get(&id) {
                    covered.insert(id);
                    c.node = *copy;
                }
                c.dir = self.update_for(c.dir.new);
                c.node = self.resolved(c.node);
            }
            Op::Rm(rm) => {
                rm.dir = self.update_for(rm.dir.new);
                rm.node = self.merged_space(rm.node);
            }
            Op::Sync(s) => {
                if repointed.contains_key(&uc.original_of(s.file.new)) {
                    return None;
                }
                s.file = self.update_for(s.file.new);
            }
            Op::SetAttr(s) => {
                if repointed.contains_key(&uc.original_of(s.file)) {
                    return None;
                }
                s.dir = self.update_for(s.dir.new);
                s.file = self.resolved(s.file);
            }
            Op::Rename(_) | Op::Resolution(_) => {}
        }
        let common = op.common_mut();
        common.updates.clear();
        let refs: Vec<BlockPointer> = common.refs.iter().map(|p| self.resolved(*p)).collect();
        let unrefs: Vec<BlockPointer> = common.unrefs.iter().map(|p| self.merged_space(*p)).collect();
        let common = op.common_mut();
        common.refs = refs;
        common.unrefs = unrefs;
        Some(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockId, Path};
    use chrono::Utc;
    use std::sync::Arc;

    use crate::errors::FetchError;

    struct FakeBlocks(HashMap<BlockPointer, DirBlock>);

    impl BlockSource for FakeBlocks {
        async fn fetch_dir_block(
            &self,
            _cancel: &CancellationToken,
            ptr: BlockPointer,
        ) -> Result<Arc<DirBlock>, FetchError> {
            self.0
                .get(&ptr)
                .cloned()
                .map(Arc::new)
                .ok_or(FetchError::BlockNotFound(ptr))
        }

        async fn fetch_dir_block_copy(
            &self,
            _cancel: &CancellationToken,
            ptr: BlockPointer,
        ) -> Result<DirBlock, FetchError> {
            self.0
                .get(&ptr)
                .cloned()
                .ok_or(FetchError::BlockNotFound(ptr))
        }
    }

    fn ptr(s: &str) -> BlockPointer {
        BlockPointer::new(BlockId::from_content(s.as_bytes()))
    }

    fn entry(p: &str, entry_type: EntryType) -> DirEntry {
        DirEntry {
            pointer: ptr(p),
            entry_type,
            size: 1,
            mtime: Utc::now(),
        }
    }

    fn dir(entries: &[(&str, DirEntry)]) -> DirBlock {
        let mut block = DirBlock::default();
        for (name, e) in entries {
            block.entries.insert(name.to_string(), e.clone());
        }
        block
    }

    #[tokio::test]
    async fn test_execute_rewrites_dir_and_ancestors() {
        let merged_root = dir(&[("a", entry("a-m", EntryType::Dir))]);
        let merged_a = dir(&[("x", entry("x", EntryType::File))]);
        let unmerged_a = dir(&[
            ("x", entry("x", EntryType::File)),
            ("y", entry("y", EntryType::File)),
        ]);
        let blocks = FakeBlocks(HashMap::from([
            (ptr("root-m"), merged_root),
            (ptr("a-m"), merged_a),
            (ptr("a-u"), unmerged_a),
        ]));

        let uc = CrChains::default();
        let mc = CrChains::default();
        let paths = ResolvedPaths::default();
        let dirs = vec![DirActions {
            merged_path: Path::root(ptr("root-m")).child("a", ptr("a-m")),
            unmerged_path: Path::root(ptr("root-u")).child("a", ptr("a-u")),
            actions: vec![CrAction::CopyEntry {
                from: "y".into(),
                to: "y".into(),
            }],
            skipped: Vec::new(),
        }];
        let plan = ExecutionPlan {
            unmerged: &uc,
            merged: &mc,
            paths: &paths,
            dirs: &dirs,
            merged_index: None,
            merged_root: ptr("root-m"),
        };
        let cancel = CancellationToken::new();
        let writer = WriterInfo::new("alice", Utc::now());
        let out = Executor::new(&blocks, &cancel, &writer, 10)
            .execute(&plan)
            .await
            .unwrap();

        assert_ne!(out.root, ptr("root-m"));
        assert_eq!(out.block_changes.new_blocks.len(), 2);
        let new_root = out
            .block_changes
            .new_blocks
            .iter()
            .find(|(p, _)| *p == out.root)
            .map(|(_, b)| b.clone())
            .unwrap();
        let Block::Dir(new_root) = new_root else {
            panic!("root is not a directory");
        };
        let new_a = new_root.get("a").unwrap().pointer;
        assert_ne!(new_a, ptr("a-m"));
        assert!(out
            .block_changes
            .new_blocks
            .iter()
            .any(|(p, b)| *p == new_a && matches!(b, Block::Dir(d) if d.contains("x") && d.contains("y"))));
        assert_eq!(out.summary, vec!["/a: copy entry y".to_string()]);
        assert!(matches!(out.ops.last(), Some(Op::Resolution(r)) if r.common.updates.len() == 2));
    }

    #[tokio::test]
    async fn test_execute_unchanged_block_not_rewritten() {
        let merged_root = dir(&[("f", entry("f", EntryType::File))]);
        let blocks = FakeBlocks(HashMap::from([
            (ptr("root-m"), merged_root.clone()),
            (ptr("root-u"), merged_root),
        ]));
        let uc = CrChains::default();
        let mc = CrChains::default();
        let paths = ResolvedPaths::default();
        let dirs = vec![DirActions {
            merged_path: Path::root(ptr("root-m")),
            unmerged_path: Path::root(ptr("root-u")),
            actions: vec![CrAction::CopyEntry {
                from: "f".into(),
                to: "f".into(),
            }],
            skipped: Vec::new(),
        }];
        let plan = ExecutionPlan {
            unmerged: &uc,
            merged: &mc,
            paths: &paths,
            dirs: &dirs,
            merged_index: None,
            merged_root: ptr("root-m"),
        };
        let cancel = CancellationToken::new();
        let writer = WriterInfo::new("alice", Utc::now());
        let out = Executor::new(&blocks, &cancel, &writer, 10)
            .execute(&plan)
            .await
            .unwrap();
        assert_eq!(out.root, ptr("root-m"));
        assert!(out.block_changes.new_blocks.is_empty());
    }

    #[tokio::test]
    async fn test_execute_stops_when_canceled() {
        let blocks = FakeBlocks(HashMap::from([(ptr("root-m"), DirBlock::default())]));
        let uc = CrChains::default();
        let mc = CrChains::default();
        let paths = ResolvedPaths::default();
        let dirs = vec![DirActions {
            merged_path: Path::root(ptr("root-m")),
            unmerged_path: Path::root(ptr("root-u")),
            actions: Vec::new(),
            skipped: Vec::new(),
        }];
        let plan = ExecutionPlan {
            unmerged: &uc,
            merged: &mc,
            paths: &paths,
            dirs: &dirs,
            merged_index: None,
            merged_root: ptr("root-m"),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let writer = WriterInfo::new("alice", Utc::now());
        let err = Executor::new(&blocks, &cancel, &writer, 10)
            .execute(&plan)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Canceled));
    }
}
