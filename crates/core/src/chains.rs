//! Per-node op chains for one branch.
//!
//! [`CrChains::build`] walks a branch's revisions oldest to newest and files
//! every op under the node it touched, keyed by that node's *original*
//! (branch-point) pointer. Chains live in an arena owned by one resolution
//! attempt; the `by_original` and `by_most_recent` tables index into it by
//! value, so the unmerged and merged chain sets never alias each other.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::errors::ChainError;
use crate::model::{BlockPointer, BlockUpdate, EntryType, Revision, RevisionData, WriterInfo};
use crate::ops::{CreateOp, Op, RmOp};

/// Index of a chain in the arena.
pub type ChainId = usize;

/// The ops one branch applied to one node.
#[derive(Debug, Clone)]
pub struct CrChain {
    pub original: BlockPointer,
    pub most_recent: BlockPointer,
    pub ops: Vec<Op>,
    /// True when the node is known to be a file.
    pub file: bool,
}

impl CrChain {
    fn new(original: BlockPointer) -> Self {
        Self {
            original,
            most_recent: original,
            ops: Vec::new(),
            file: false,
        }
    }

    /// Drop create/remove pairs that cancel out.
    ///
    /// A create followed later by a remove of the same name never surfaces
    /// outside this branch, so both are discarded.
    fn collapse(&mut self) {
        let mut keep = vec![true; self.ops.len()];
        let mut creates: HashMap<String, usize> = HashMap::new();
        for (i, op) in self.ops.iter().enumerate() {
            match op {
                Op::Create(c) => {
                    creates.insert(c.name.clone(), i);
                }
                Op::Rm(r) => {
                    if let Some(ci) = creates.remove(&r.name) {
                        keep[ci] = false;
                        keep[i] = false;
                    }
                }
                _ => {}
            }
        }
        let mut flags = keep.into_iter();
        self.ops.retain(|_| flags.next().unwrap_or(true));
    }
}

/// Where a renamed node came from and where it ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameInfo {
    pub original_old_parent: BlockPointer,
    pub old_name: String,
    pub original_new_parent: BlockPointer,
    pub new_name: String,
    pub entry_type: EntryType,
    /// Writer of the latest rename of this node.
    pub writer: WriterInfo,
}

/// Head of the branch a chain set was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchHead {
    pub revision: Revision,
    pub root: BlockPointer,
}

/// All chains of one branch.
#[derive(Debug, Default)]
pub struct CrChains {
    chains: Vec<CrChain>,
    by_original: HashMap<BlockPointer, ChainId>,
    by_most_recent: HashMap<BlockPointer, ChainId>,
    /// Every pointer a tracked node has held, mapped to its original.
    originals: HashMap<BlockPointer, BlockPointer>,
    /// Pointers this branch has already replaced.
    superseded: HashSet<BlockPointer>,
    created_originals: HashSet<BlockPointer>,
    deleted_originals: HashSet<BlockPointer>,
    renamed_originals: HashMap<BlockPointer, RenameInfo>,
    head: Option<BranchHead>,
}

impl CrChains {
    /// Build the chain set for `revisions`, which must be in branch order.
    pub fn build(revisions: &[RevisionData]) -> Result<Self, ChainError> {
        let mut chains = Self::default();
        for rev in revisions {
            for op in &rev.ops {
                chains.make_chain_for_op(op)?;
            }
            chains.head = Some(BranchHead {
                revision: rev.revision,
                root: rev.root,
            });
        }
        for chain in &mut chains.chains {
            chain.collapse();
        }
        trace!(chains = chains.by_original.len(), "built chains");
        Ok(chains)
    }

    /// An empty chain set for a branch with no revisions past `head`.
    pub fn empty(head: BranchHead) -> Self {
        Self {
            head: Some(head),
            ..Self::default()
        }
    }

    pub fn head(&self) -> Option<BranchHead> {
        self.head
    }

    fn new_chain(&mut self, original: BlockPointer) -> ChainId {
        let id = self.chains.len();
        self.chains.push(CrChain::new(original));
        self.by_original.insert(original, id);
        self.by_most_recent.insert(original, id);
        self.originals.insert(original, original);
        id
    }

    fn apply_update(&mut self, update: &BlockUpdate) -> Result<(), ChainError> {
        let id = match self.by_most_recent.get(&update.old) {
            Some(id) => *id,
            None => {
                if self.superseded.contains(&update.old) {
                    return Err(ChainError::StalePointer(update.old));
                }
                self.new_chain(update.old)
            }
        };
        if update.old != update.new {
            self.by_most_recent.remove(&update.old);
            self.superseded.insert(update.old);
            let chain = &mut self.chains[id];
            chain.most_recent = update.new;
            let original = chain.original;
            self.by_most_recent.insert(update.new, id);
            self.originals.insert(update.new, original);
        }
        Ok(())
    }

    fn chain_id_for(&self, most_recent: BlockPointer) -> Result<ChainId, ChainError> {
        self.by_most_recent
            .get(&most_recent)
            .copied()
            .ok_or(ChainError::NoChainFound(most_recent))
    }

    fn make_chain_for_op(&mut self, op: &Op) -> Result<(), ChainError> {
        for update in op.all_updates() {
            self.apply_update(&update)?;
        }

        match op {
            Op::Create(c) if !c.renamed => {
                self.created_originals.extend(c.common.refs.iter().copied());
            }
            Op::Rm(r) if !r.renamed => {
                for ptr in &r.common.unrefs {
                    let original = self.original_of(*ptr);
                    self.deleted_originals.insert(original);
                }
            }
            _ => {}
        }

        match op {
            Op::Create(c) => {
                let id = self.chain_id_for(c.dir.new)?;
                self.chains[id].ops.push(op.clone());
                if !c.renamed && !self.by_most_recent.contains_key(&c.node) {
                    self.new_chain(c.node);
                }
            }
            Op::Rm(r) => {
                let id = self.chain_id_for(r.dir.new)?;
                self.chains[id].ops.push(op.clone());
            }
            Op::Rename(r) => {
                let old_id = self.chain_id_for(r.old_dir.new).map_err(|_| {
                    ChainError::RenameParentMissing {
                        name: r.old_name.clone(),
                        parent: r.old_dir.new,
                    }
                })?;
                let target = r.target_dir();
                let new_id =
                    self.chain_id_for(target.new)
                        .map_err(|_| ChainError::RenameParentMissing {
                            name: r.new_name.clone(),
                            parent: target.new,
                        })?;

                self.chains[old_id].ops.push(Op::Rm(RmOp {
                    name: r.old_name.clone(),
                    dir: r.old_dir,
                    entry_type: r.renamed_type,
                    node: r.renamed,
                    renamed: true,
                    common: r.common.clone(),
                }));
                self.chains[new_id].ops.push(Op::Create(CreateOp {
                    name: r.new_name.clone(),
                    dir: target,
                    entry_type: r.renamed_type,
                    node: r.renamed,
                    renamed: true,
                    common: r.common.clone(),
                }));

                let renamed_original = self.original_of(r.renamed);
                let old_parent = self.chains[old_id].original;
                let new_parent = self.chains[new_id].original;
                match self.renamed_originals.get_mut(&renamed_original) {
                    Some(info) => {
                        info.original_new_parent = new_parent;
                        info.new_name = r.new_name.clone();
                        info.writer = r.common.writer.clone();
                    }
                    None => {
                        self.renamed_originals.insert(
                            renamed_original,
                            RenameInfo {
                                original_old_parent: old_parent,
                                old_name: r.old_name.clone(),
                                original_new_parent: new_parent,
                                new_name: r.new_name.clone(),
                                entry_type: r.renamed_type,
                                writer: r.common.writer.clone(),
                            },
                        );
                    }
                }
                // Moved back where it started.
                if let Some(info) = self.renamed_originals.get(&renamed_original) {
                    if info.original_old_parent == info.original_new_parent
                        && info.old_name == info.new_name
                    {
                        self.renamed_originals.remove(&renamed_original);
                    }
                }
            }
            Op::Sync(s) => {
                let id = self.chain_id_for(s.file.new)?;
                let chain = &mut self.chains[id];
                chain.file = true;
                chain.ops.push(op.clone());
            }
            Op::SetAttr(s) => {
                let id = match self.by_most_recent.get(&s.file) {
                    Some(id) => *id,
                    None => self.new_chain(s.file),
                };
                let chain = &mut self.chains[id];
                chain.file = s.entry_type.is_file();
                chain.ops.push(op.clone());
            }
            Op::Resolution(_) => {}
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn by_original(&self, original: &BlockPointer) -> Option<&CrChain> {
        self.by_original.get(original).map(|id| &self.chains[*id])
    }

    pub fn by_most_recent(&self, most_recent: &BlockPointer) -> Option<&CrChain> {
        self.by_most_recent.get(most_recent).map(|id| &self.chains[*id])
    }

    pub fn most_recent_from_original(&self, original: &BlockPointer) -> Option<BlockPointer> {
        self.by_original(original).map(|c| c.most_recent)
    }

    pub fn most_recent_from_original_or_same(&self, original: &BlockPointer) -> BlockPointer {
        self.most_recent_from_original(original)
            .unwrap_or(*original)
    }

    pub fn original_from_most_recent(&self, most_recent: &BlockPointer) -> Option<BlockPointer> {
        self.by_most_recent(most_recent).map(|c| c.original)
    }

    /// Original of any pointer this branch has assigned, or the pointer itself.
    pub fn original_of(&self, ptr: BlockPointer) -> BlockPointer {
        self.originals.get(&ptr).copied().unwrap_or(ptr)
    }

    /// Whether this branch has ever assigned `ptr` to a node.
    pub fn knows_pointer(&self, ptr: &BlockPointer) -> bool {
        self.originals.contains_key(ptr)
    }

    pub fn is_created(&self, original: &BlockPointer) -> bool {
        self.created_originals.contains(original)
    }

    pub fn is_deleted(&self, original: &BlockPointer) -> bool {
        self.deleted_originals.contains(original)
    }

    pub fn renamed(&self, original: &BlockPointer) -> Option<&RenameInfo> {
        self.renamed_originals.get(original)
    }

    pub fn renamed_originals(&self) -> impl Iterator<Item = (&BlockPointer, &RenameInfo)> {
        self.renamed_originals.iter()
    }

    /// Live chains with at least one op, in the order they were started.
    pub fn chains_with_ops(&self) -> impl Iterator<Item = &CrChain> {
        self.chains
            .iter()
            .enumerate()
            .filter(|(id, c)| self.by_original.get(&c.original) == Some(id) && !c.ops.is_empty())
            .map(|(_, c)| c)
    }

    pub fn is_empty(&self) -> bool {
        self.chains_with_ops().next().is_none()
    }

    // -----------------------------------------------------------------------
    // Mutation during one attempt
    // -----------------------------------------------------------------------

    /// Forget the chain for `original`.
    pub fn remove_chain(&mut self, original: &BlockPointer) {
        if let Some(id) = self.by_original.remove(original) {
            let most_recent = self.chains[id].most_recent;
            self.by_most_recent.remove(&most_recent);
            self.chains[id].ops.clear();
        }
    }

    /// Insert `op` at the front of the chain for `original`, creating the
    /// chain if needed. Returns true if the chain had no ops before.
    pub fn prepend_op(&mut self, original: BlockPointer, op: Op) -> bool {
        let id = match self.by_original.get(&original) {
            Some(id) => *id,
            None => self.new_chain(original),
        };
        let chain = &mut self.chains[id];
        let was_empty = chain.ops.is_empty();
        chain.ops.insert(0, op);
        was_empty
    }

    /// Stop treating `original` as renamed. Returns what was recorded.
    pub fn forget_rename(&mut self, original: &BlockPointer) -> Option<RenameInfo> {
        self.renamed_originals.remove(original)
    }

    /// Remove and return the first op in `original`'s chain matching `pred`.
    pub fn take_op(
        &mut self,
        original: &BlockPointer,
        pred: impl Fn(&Op) -> bool,
    ) -> Option<Op> {
        let id = *self.by_original.get(original)?;
        let chain = &mut self.chains[id];
        let pos = chain.ops.iter().position(pred)?;
        Some(chain.ops.remove(pos))
    }

    /// Apply `f` to every op of `original`'s chain.
    pub fn for_each_op_mut(&mut self, original: &BlockPointer, mut f: impl FnMut(&mut Op)) {
        if let Some(id) = self.by_original.get(original) {
            for op in &mut self.chains[*id].ops {
                f(op);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockId, Branch};
    use crate::ops::{OpCommon, RenameOp, SyncOp};
    use chrono::Utc;

    fn ptr(s: &str) -> BlockPointer {
        BlockPointer::new(BlockId::from_content(s.as_bytes()))
    }

    fn common(updates: Vec<BlockUpdate>) -> OpCommon {
        let mut c = OpCommon::new(WriterInfo::new("alice", Utc::now()));
        c.updates = updates;
        c
    }

    fn rev(n: u64, root: &str, ops: Vec<Op>) -> RevisionData {
        RevisionData {
            revision: Revision(n),
            branch: Branch::Merged,
            prev: Revision(n - 1),
            root: ptr(root),
            writer: WriterInfo::new("alice", Utc::now()),
            ops,
        }
    }

    fn create(name: &str, dir: (&str, &str), node: &str, ancestors: Vec<BlockUpdate>) -> Op {
        let mut c = common(ancestors);
        c.refs.push(ptr(node));
        Op::Create(CreateOp {
            name: name.into(),
            dir: BlockUpdate::new(ptr(dir.0), ptr(dir.1)),
            entry_type: EntryType::File,
            node: ptr(node),
            renamed: false,
            common: c,
        })
    }

    #[test]
    fn test_chains_simple() {
        // root/dir1: create file1, then sync it.
        let root_up = BlockUpdate::new(ptr("root0"), ptr("root1"));
        let op1 = create("file1", ("dir0", "dir1"), "f0", vec![root_up]);
        let op2 = Op::Sync(SyncOp {
            file: BlockUpdate::new(ptr("f0"), ptr("f1")),
            common: common(vec![
                BlockUpdate::new(ptr("dir1"), ptr("dir2")),
                BlockUpdate::new(ptr("root1"), ptr("root2")),
            ]),
        });
        let chains =
            CrChains::build(&[rev(2, "root1", vec![op1]), rev(3, "root2", vec![op2])]).unwrap();

        let dir = chains.by_original(&ptr("dir0")).unwrap();
        assert_eq!(dir.most_recent, ptr("dir2"));
        assert_eq!(dir.ops.len(), 1);

        let file = chains.by_original(&ptr("f0")).unwrap();
        assert!(file.file);
        assert_eq!(file.most_recent, ptr("f1"));
        assert_eq!(chains.original_of(ptr("f1")), ptr("f0"));
        assert!(chains.is_created(&ptr("f0")));

        let root = chains.by_most_recent(&ptr("root2")).unwrap();
        assert_eq!(root.original, ptr("root0"));
        assert!(root.ops.is_empty());
        assert_eq!(chains.head().unwrap().revision, Revision(3));
    }

    #[test]
    fn test_chains_rename_split() {
        let op = Op::Rename(RenameOp {
            old_name: "x".into(),
            old_dir: BlockUpdate::new(ptr("a0"), ptr("a1")),
            new_name: "y".into(),
            new_dir: Some(BlockUpdate::new(ptr("b0"), ptr("b1"))),
            renamed: ptr("x0"),
            renamed_type: EntryType::Dir,
            common: common(vec![BlockUpdate::new(ptr("r0"), ptr("r1"))]),
        });
        let chains = CrChains::build(&[rev(2, "r1", vec![op])]).unwrap();

        let a = chains.by_original(&ptr("a0")).unwrap();
        assert!(matches!(&a.ops[0], Op::Rm(rm) if rm.renamed && rm.name == "x"));
        let b = chains.by_original(&ptr("b0")).unwrap();
        assert!(matches!(&b.ops[0], Op::Create(c) if c.renamed && c.name == "y"));

        let info = chains.renamed(&ptr("x0")).unwrap();
        assert_eq!(info.original_old_parent, ptr("a0"));
        assert_eq!(info.original_new_parent, ptr("b0"));
        assert_eq!(info.new_name, "y");
    }

    #[test]
    fn test_chains_create_then_remove_collapses() {
        let op1 = create("tmp", ("d0", "d1"), "t0", vec![]);
        let mut c = common(vec![]);
        c.unrefs.push(ptr("t0"));
        let op2 = Op::Rm(RmOp {
            name: "tmp".into(),
            dir: BlockUpdate::new(ptr("d1"), ptr("d2")),
            entry_type: EntryType::File,
            node: ptr("t0"),
            renamed: false,
            common: c,
        });
        let chains = CrChains::build(&[rev(2, "r", vec![op1, op2])]).unwrap();
        assert!(chains.by_original(&ptr("d0")).unwrap().ops.is_empty());
        assert!(chains.is_deleted(&ptr("t0")));
    }

    #[test]
    fn test_chains_stale_pointer_is_consistency_error() {
        let op1 = create("a", ("d0", "d1"), "a0", vec![]);
        // Mutates d0 again even though the branch already replaced it.
        let op2 = create("b", ("d0", "d9"), "b0", vec![]);
        let err = CrChains::build(&[rev(2, "r", vec![op1]), rev(3, "r", vec![op2])]).unwrap_err();
        assert!(matches!(err, ChainError::StalePointer(p) if p == ptr("d0")));
    }

    #[test]
    fn test_chains_prepend_and_take() {
        let mut chains = CrChains::default();
        let op = create("x", ("d", "d"), "x", vec![]);
        assert!(chains.prepend_op(ptr("d"), op.clone()));
        assert!(!chains.prepend_op(ptr("d"), op));
        let taken = chains.take_op(&ptr("d"), |o| matches!(o, Op::Create(_)));
        assert!(taken.is_some());
        assert_eq!(chains.by_original(&ptr("d")).unwrap().ops.len(), 1);
        chains.remove_chain(&ptr("d"));
        assert!(chains.by_original(&ptr("d")).is_none());
    }
}
