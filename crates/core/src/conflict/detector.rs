//! Action computation.
//!
//! For every directory the unmerged branch touched, the computer compares
//! each unmerged op against the merged chain of the same node and decides
//! which [`CrAction`]s reproduce the unmerged intent on top of the merged
//! tree. Before that, unmerged renames that would conflict with the merged
//! layout (the same node moved on both sides, or a directory nested inside
//! its own descendant) are discarded so the result is always a tree.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info};

use crate::chains::{CrChains, RenameInfo};
use crate::conflict::action::CrAction;
use crate::conflict::renamer::ConflictRenamer;
use crate::model::{Attr, BlockPointer, BlockUpdate, EntryType, Path};
use crate::ops::{CreateOp, Op, OpCommon, RenameOp, RmOp};
use crate::paths::{PathPair, ResolvedPaths, TreeIndex};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Actions for one merged directory.
#[derive(Debug, Clone)]
pub struct DirActions {
    pub merged_path: Path,
    pub unmerged_path: Path,
    pub actions: Vec<CrAction>,
    /// Unmerged ops that need no action and are left out of the commit.
    pub skipped: Vec<Op>,
}

impl DirActions {
    fn new(pair: &PathPair) -> Self {
        Self {
            merged_path: pair.merged.clone(),
            unmerged_path: pair.unmerged.clone(),
            actions: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

/// An unmerged rename discarded before actions are computed.
#[derive(Debug, Clone)]
pub struct DroppedRename {
    pub original: BlockPointer,
    pub info: RenameInfo,
    /// The rename as the unmerged branch recorded it.
    pub op: Op,
}

// ---------------------------------------------------------------------------
// Rename conflicts
// ---------------------------------------------------------------------------

/// Drop every unmerged rename that the merged layout cannot absorb.
///
/// A node renamed on both branches keeps its merged location. A directory
/// rename that would make the directory its own ancestor is dropped; when
/// several unmerged renames form the cycle, the latest one by timestamp,
/// then writer, goes. Merged renames never take part in that tie-break: an
/// unmerged rename always loses to a merged one.
pub fn drop_conflicting_renames(
    uc: &mut CrChains,
    mc: &CrChains,
    merged: &TreeIndex,
    unmerged: &TreeIndex,
) -> Vec<DroppedRename> {
    let mut dropped = Vec::new();

    let mut both: Vec<BlockPointer> = uc
        .renamed_originals()
        .filter(|(original, _)| mc.renamed(original).is_some())
        .map(|(original, _)| *original)
        .collect();
    both.sort();
    for original in both {
        debug!(node = %original, "node renamed on both branches, keeping merged rename");
        dropped.extend(drop_rename(uc, original));
    }

    let max_rounds = uc.renamed_originals().count();
    for _ in 0..max_rounds {
        let Some(cycle) = find_cycle(uc, mc, merged, unmerged) else {
            break;
        };
        let loser = cycle
            .iter()
            .filter_map(|o| uc.renamed(o).map(|info| (*o, info)))
            .max_by(|a, b| {
                (&a.1.writer.timestamp, &a.1.writer.writer, a.0)
                    .cmp(&(&b.1.writer.timestamp, &b.1.writer.writer, b.0))
            })
            .map(|(o, _)| o);
        let Some(loser) = loser else {
            break;
        };
        info!(node = %loser, participants = cycle.len(), "breaking rename cycle");
        dropped.extend(drop_rename(uc, loser));
    }
    dropped
}

/// Parent of `node` once all remaining unmerged renames are applied on top
/// of the merged tree.
fn final_parent(
    node: BlockPointer,
    uc: &CrChains,
    mc: &CrChains,
    merged: &TreeIndex,
    unmerged: &TreeIndex,
) -> Option<BlockPointer> {
    if let Some(info) = uc.renamed(&node) {
        return Some(info.original_new_parent);
    }
    let merged_ptr = mc.most_recent_from_original_or_same(&node);
    if let Some(parent) = merged.parent(&merged_ptr) {
        return Some(mc.original_of(parent));
    }
    let unmerged_ptr = uc.most_recent_from_original_or_same(&node);
    unmerged.parent(&unmerged_ptr).map(|p| uc.original_of(p))
}

/// The unmerged-renamed directories on one cycle, if any.
fn find_cycle(
    uc: &CrChains,
    mc: &CrChains,
    merged: &TreeIndex,
    unmerged: &TreeIndex,
) -> Option<Vec<BlockPointer>> {
    let limit = merged.len() + unmerged.len() + 1;
    let mut moved: Vec<(BlockPointer, BlockPointer)> = uc
        .renamed_originals()
        .filter(|(_, info)| info.entry_type == EntryType::Dir)
        .map(|(original, info)| (*original, info.original_new_parent))
        .collect();
    moved.sort();

    for (node, new_parent) in moved {
        let mut participants = vec![node];
        let mut current = new_parent;
        for _ in 0..limit {
            if current == node {
                return Some(participants);
            }
            if uc.renamed(&current).is_some() {
                participants.push(current);
            }
            match final_parent(current, uc, mc, merged, unmerged) {
                Some(parent) => current = parent,
                None => break,
            }
        }
    }
    None
}

fn drop_rename(uc: &mut CrChains, original: BlockPointer) -> Option<DroppedRename> {
    let info = uc.forget_rename(&original)?;
    uc.take_op(&info.original_old_parent, |op| {
        matches!(op, Op::Rm(rm) if rm.renamed && rm.name == info.old_name)
    });
    uc.take_op(&info.original_new_parent, |op| {
        matches!(op, Op::Create(c) if c.renamed && c.name == info.new_name)
    });

    let old_dir = uc.most_recent_from_original_or_same(&info.original_old_parent);
    let new_dir = uc.most_recent_from_original_or_same(&info.original_new_parent);
    let op = Op::Rename(RenameOp {
        old_name: info.old_name.clone(),
        old_dir: BlockUpdate::unchanged(old_dir),
        new_name: info.new_name.clone(),
        new_dir: (old_dir != new_dir).then(|| BlockUpdate::unchanged(new_dir)),
        renamed: uc.most_recent_from_original_or_same(&original),
        renamed_type: info.entry_type,
        common: OpCommon::new(info.writer.clone()),
    });
    Some(DroppedRename { original, info, op })
}

// ---------------------------------------------------------------------------
// Computer
// ---------------------------------------------------------------------------

/// Decides reconciling actions for one attempt.
pub struct ActionComputer<'a> {
    uc: &'a CrChains,
    mc: &'a CrChains,
    renamer: &'a dyn ConflictRenamer,
}

impl<'a> ActionComputer<'a> {
    pub fn new(uc: &'a CrChains, mc: &'a CrChains, renamer: &'a dyn ConflictRenamer) -> Self {
        Self { uc, mc, renamer }
    }

    /// Actions per merged directory, leaf-first by merged depth.
    ///
    /// `roots` is the (unmerged, merged) root pair, used to place a dropped
    /// rename when neither of its directories has a resolved path.
    pub fn compute(
        &self,
        paths: &ResolvedPaths,
        dropped: &[DroppedRename],
        roots: &PathPair,
    ) -> Vec<DirActions> {
        let mut dirs: HashMap<BlockPointer, DirActions> = HashMap::new();

        for (unmerged_ptr, pair) in paths.leaf_first() {
            let original = self.uc.original_of(*unmerged_ptr);
            let Some(chain) = self.uc.by_original(&original) else {
                continue;
            };
            for op in &chain.ops {
                self.op_actions(op, original, pair, &mut dirs);
            }
        }

        for drop in dropped {
            let pair = [drop.info.original_new_parent, drop.info.original_old_parent]
                .iter()
                .map(|o| self.uc.most_recent_from_original_or_same(o))
                .find_map(|p| paths.pairs.get(&p))
                .unwrap_or(roots);
            dirs.entry(pair.merged.tail_pointer())
                .or_insert_with(|| DirActions::new(pair))
                .actions
                .push(CrAction::DropUnmerged {
                    op: drop.op.clone(),
                });
        }

        let mut out: Vec<DirActions> = dirs.into_values().collect();
        out.sort_by(|a, b| {
            b.merged_path
                .len()
                .cmp(&a.merged_path.len())
                .then_with(|| a.merged_path.to_string().cmp(&b.merged_path.to_string()))
        });
        let total: usize = out.iter().map(|d| d.actions.len()).sum();
        debug!(dirs = out.len(), actions = total, "computed actions");
        out
    }

    fn op_actions(
        &self,
        op: &Op,
        original: BlockPointer,
        pair: &PathPair,
        dirs: &mut HashMap<BlockPointer, DirActions>,
    ) {
        match op {
            Op::Create(c) => {
                let dir = dirs
                    .entry(pair.merged.tail_pointer())
                    .or_insert_with(|| DirActions::new(pair));
                match self.create_action(original, c) {
                    Some(action) => dir.actions.push(action),
                    None => dir.skipped.push(op.clone()),
                }
            }
            Op::Rm(rm) => {
                let dir = dirs
                    .entry(pair.merged.tail_pointer())
                    .or_insert_with(|| DirActions::new(pair));
                match self.rm_action(original, rm) {
                    Some(action) => dir.actions.push(action),
                    None => dir.skipped.push(op.clone()),
                }
            }
            Op::Sync(_) | Op::SetAttr(_) => {
                // Moved entries are carried whole by their renamed create.
                if self.uc.renamed(&original).is_some() {
                    return;
                }
                let (Some(unmerged_parent), Some(merged_parent)) =
                    (pair.unmerged.parent(), pair.merged.parent())
                else {
                    return;
                };
                let from = pair.unmerged.tail_name().to_string();
                let to = pair.merged.tail_name().to_string();
                let action = self.file_action(original, op, from, to);
                let parent_pair = PathPair {
                    unmerged: unmerged_parent,
                    merged: merged_parent,
                };
                dirs.entry(parent_pair.merged.tail_pointer())
                    .or_insert_with(|| DirActions::new(&parent_pair))
                    .actions
                    .push(action);
            }
            Op::Rename(_) | Op::Resolution(_) => {}
        }
    }

    /// The merged branch's surviving create of `name` in `dir`, if any.
    fn merged_create(&self, dir: BlockPointer, name: &str) -> Option<&CreateOp> {
        self.mc.by_original(&dir)?.ops.iter().rev().find_map(|op| match op {
            Op::Create(c) if c.name == name => Some(c),
            _ => None,
        })
    }

    fn merged_modified(&self, node: &BlockPointer) -> bool {
        self.mc
            .by_original(node)
            .is_some_and(|c| !c.ops.is_empty() || c.most_recent != c.original)
    }

    fn unmerged_modified(&self, node: &BlockPointer) -> bool {
        self.uc
            .by_original(node)
            .is_some_and(|c| c.most_recent != c.original)
    }

    fn create_action(&self, dir: BlockPointer, c: &CreateOp) -> Option<CrAction> {
        let Some(merged) = self.merged_create(dir, &c.name) else {
            return Some(CrAction::CopyEntry {
                from: c.name.clone(),
                to: c.name.clone(),
            });
        };
        if self.mc.original_of(merged.node) == self.uc.original_of(c.node) {
            return Some(CrAction::CopyEntry {
                from: c.name.clone(),
                to: c.name.clone(),
            });
        }
        debug!(name = %c.name, "both branches created the same name");
        let action = match (merged.entry_type, c.entry_type) {
            (EntryType::Dir, EntryType::Dir) => CrAction::RenameUnmerged {
                from: c.name.clone(),
                to: self.renamer.conflict_name(&c.name, &c.common.writer),
            },
            (merged_type, EntryType::Dir) if merged_type.is_file() => CrAction::RenameMerged {
                from: c.name.clone(),
                to: self.renamer.conflict_name(&c.name, &merged.common.writer),
            },
            _ => CrAction::RenameUnmerged {
                from: c.name.clone(),
                to: self.renamer.conflict_name(&c.name, &c.common.writer),
            },
        };
        Some(action)
    }

    fn rm_action(&self, dir: BlockPointer, rm: &RmOp) -> Option<CrAction> {
        let node = self.uc.original_of(rm.node);
        if self.mc.is_deleted(&node) {
            debug!(name = %rm.name, "both branches removed the entry");
            return None;
        }
        if self.merged_create(dir, &rm.name).is_some() {
            debug!(name = %rm.name, "name reused on the merged branch, keeping it");
            return None;
        }
        if !rm.renamed && (self.merged_modified(&node) || self.mc.renamed(&node).is_some()) {
            debug!(name = %rm.name, "merged branch changed a removed entry, keeping it");
            return Some(CrAction::DropUnmerged {
                op: Op::Rm(rm.clone()),
            });
        }
        if rm.renamed
            && rm.entry_type.is_file()
            && self.merged_modified(&node)
            && self.unmerged_modified(&node)
        {
            debug!(name = %rm.name, "moved file edited on both branches, keeping merged copy");
            return None;
        }
        Some(CrAction::RemoveEntry {
            name: rm.name.clone(),
        })
    }

    fn file_action(&self, file: BlockPointer, op: &Op, from: String, to: String) -> CrAction {
        if self.mc.is_deleted(&file) {
            return CrAction::CopyEntry { from, to };
        }
        let merged_ops: &[Op] = self
            .mc
            .by_original(&file)
            .map(|c| c.ops.as_slice())
            .unwrap_or(&[]);
        let merged_synced = merged_ops.iter().any(|o| matches!(o, Op::Sync(_)));
        let merged_attrs: BTreeSet<Attr> = merged_ops
            .iter()
            .filter_map(|o| match o {
                Op::SetAttr(s) => Some(s.attr),
                _ => None,
            })
            .collect();

        match op {
            Op::SetAttr(s) => {
                let conflict = merged_attrs.contains(&s.attr) || (s.attr == Attr::Size && merged_synced);
                if conflict && s.entry_type.is_file() {
                    let name = self.renamer.conflict_name(&to, &s.common.writer);
                    CrAction::RenameUnmerged { from, to: name }
                } else {
                    CrAction::CopyAttr {
                        from,
                        to,
                        attrs: BTreeSet::from([s.attr]),
                    }
                }
            }
            _ if merged_synced => {
                let name = self.renamer.conflict_name(&to, op.writer());
                CrAction::RenameUnmerged { from, to: name }
            }
            _ if !merged_attrs.is_empty() => CrAction::CopyAttr {
                from,
                to,
                attrs: BTreeSet::from([Attr::Size]),
            },
            _ => CrAction::CopyEntry { from, to },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::renamer::WriterDateRenamer;
    use crate::model::{BlockId, Branch, Revision, RevisionData, WriterInfo};
    use crate::ops::SyncOp;
    use chrono::{TimeZone, Utc};

    fn ptr(s: &str) -> BlockPointer {
        BlockPointer::new(BlockId::from_content(s.as_bytes()))
    }

    fn writer(name: &str, secs: i64) -> WriterInfo {
        WriterInfo::new(name, Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap())
    }

    fn rev(n: u64, root: &str, ops: Vec<Op>) -> RevisionData {
        RevisionData {
            revision: Revision(n),
            branch: Branch::Merged,
            prev: Revision(n - 1),
            root: ptr(root),
            writer: writer("w", 0),
            ops,
        }
    }

    fn create(name: &str, dir: (&str, &str), node: &str, ty: EntryType, w: WriterInfo) -> Op {
        let mut common = OpCommon::new(w);
        common.refs.push(ptr(node));
        Op::Create(CreateOp {
            name: name.into(),
            dir: BlockUpdate::new(ptr(dir.0), ptr(dir.1)),
            entry_type: ty,
            node: ptr(node),
            renamed: false,
            common,
        })
    }

    fn sync(file: (&str, &str), dir: (&str, &str), w: WriterInfo) -> Op {
        let mut common = OpCommon::new(w);
        common.updates.push(BlockUpdate::new(ptr(dir.0), ptr(dir.1)));
        Op::Sync(SyncOp {
            file: BlockUpdate::new(ptr(file.0), ptr(file.1)),
            common,
        })
    }

    fn root_pair(unmerged: &str, merged: &str) -> PathPair {
        PathPair {
            unmerged: Path::root(ptr(unmerged)),
            merged: Path::root(ptr(merged)),
        }
    }

    fn paths_with(pairs: Vec<(BlockPointer, PathPair)>) -> ResolvedPaths {
        ResolvedPaths {
            pairs: pairs.into_iter().collect(),
            ..ResolvedPaths::default()
        }
    }

    #[test]
    fn test_disjoint_creates_copy() {
        let uc = CrChains::build(&[rev(2, "ru", vec![create(
            "a",
            ("root", "ru"),
            "a0",
            EntryType::File,
            writer("alice", 1),
        )])])
        .unwrap();
        let mc = CrChains::build(&[rev(2, "rm", vec![create(
            "b",
            ("root", "rm"),
            "b0",
            EntryType::File,
            writer("bob", 1),
        )])])
        .unwrap();
        let renamer = WriterDateRenamer::default();
        let computer = ActionComputer::new(&uc, &mc, &renamer);
        let pair = root_pair("ru", "rm");
        let out = computer.compute(&paths_with(vec![(ptr("ru"), pair.clone())]), &[], &pair);
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].actions,
            vec![CrAction::CopyEntry {
                from: "a".into(),
                to: "a".into()
            }]
        );
    }

    #[test]
    fn test_same_name_create_renames_unmerged() {
        let alice = writer("alice", 5);
        let uc = CrChains::build(&[rev(2, "ru", vec![create(
            "file1",
            ("root", "ru"),
            "u0",
            EntryType::File,
            alice.clone(),
        )])])
        .unwrap();
        let mc = CrChains::build(&[rev(2, "rm", vec![create(
            "file1",
            ("root", "rm"),
            "m0",
            EntryType::File,
            writer("bob", 1),
        )])])
        .unwrap();
        let renamer = WriterDateRenamer::default();
        let computer = ActionComputer::new(&uc, &mc, &renamer);
        let pair = root_pair("ru", "rm");
        let out = computer.compute(&paths_with(vec![(ptr("ru"), pair.clone())]), &[], &pair);
        assert_eq!(
            out[0].actions,
            vec![CrAction::RenameUnmerged {
                from: "file1".into(),
                to: renamer.conflict_name("file1", &alice),
            }]
        );
    }

    #[test]
    fn test_file_vs_dir_renames_merged() {
        let bob = writer("bob", 1);
        let uc = CrChains::build(&[rev(2, "ru", vec![create(
            "x",
            ("root", "ru"),
            "u0",
            EntryType::Dir,
            writer("alice", 2),
        )])])
        .unwrap();
        let mc = CrChains::build(&[rev(2, "rm", vec![create(
            "x",
            ("root", "rm"),
            "m0",
            EntryType::File,
            bob.clone(),
        )])])
        .unwrap();
        let renamer = WriterDateRenamer::default();
        let computer = ActionComputer::new(&uc, &mc, &renamer);
        let pair = root_pair("ru", "rm");
        let out = computer.compute(&paths_with(vec![(ptr("ru"), pair.clone())]), &[], &pair);
        assert_eq!(
            out[0].actions,
            vec![CrAction::RenameMerged {
                from: "x".into(),
                to: renamer.conflict_name("x", &bob),
            }]
        );
    }

    #[test]
    fn test_both_synced_file_renames_unmerged() {
        let alice = writer("alice", 3);
        let uc = CrChains::build(&[rev(2, "ru", vec![sync(("f0", "fu"), ("root", "ru"), alice.clone())])])
            .unwrap();
        let mc = CrChains::build(&[rev(2, "rm", vec![sync(("f0", "fm"), ("root", "rm"), writer("bob", 1))])])
            .unwrap();
        let renamer = WriterDateRenamer::default();
        let computer = ActionComputer::new(&uc, &mc, &renamer);
        let roots = root_pair("ru", "rm");
        let file_pair = PathPair {
            unmerged: roots.unmerged.child("f", ptr("fu")),
            merged: roots.merged.child("f", ptr("fm")),
        };
        let out = computer.compute(&paths_with(vec![(ptr("fu"), file_pair)]), &[], &roots);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].merged_path.tail_pointer(), ptr("rm"));
        assert_eq!(
            out[0].actions,
            vec![CrAction::RenameUnmerged {
                from: "f".into(),
                to: renamer.conflict_name("f", &alice),
            }]
        );
    }

    #[test]
    fn test_rename_cycle_dropped() {
        // Unmerged moves /b into /a; merged moves /a into /b.
        let rename = |old: &str, new_dir: &str, node: &str, w: WriterInfo| {
            Op::Rename(RenameOp {
                old_name: old.into(),
                old_dir: BlockUpdate::unchanged(ptr("root")),
                new_name: old.into(),
                new_dir: Some(BlockUpdate::unchanged(ptr(new_dir))),
                renamed: ptr(node),
                renamed_type: EntryType::Dir,
                common: OpCommon::new(w),
            })
        };
        let mut uc =
            CrChains::build(&[rev(2, "root", vec![rename("b", "a", "b", writer("alice", 9))])]).unwrap();
        let mc =
            CrChains::build(&[rev(2, "root", vec![rename("a", "b", "a", writer("bob", 1))])]).unwrap();

        let mut merged = TreeIndex::default();
        merged.insert_for_test(ptr("b"), ptr("root"), "b", EntryType::Dir);
        merged.insert_for_test(ptr("a"), ptr("b"), "a", EntryType::Dir);
        let mut unmerged = TreeIndex::default();
        unmerged.insert_for_test(ptr("a"), ptr("root"), "a", EntryType::Dir);
        unmerged.insert_for_test(ptr("b"), ptr("a"), "b", EntryType::Dir);

        let dropped = drop_conflicting_renames(&mut uc, &mc, &merged, &unmerged);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].original, ptr("b"));
        assert!(uc.renamed(&ptr("b")).is_none());
        assert!(uc.by_original(&ptr("a")).unwrap().ops.is_empty());
        assert!(uc.by_original(&ptr("root")).unwrap().ops.is_empty());
    }

    #[test]
    fn test_older_unmerged_rename_still_loses_cycle() {
        // Same cycle as above, but the unmerged move happened first.
        let rename = |old: &str, new_dir: &str, w: WriterInfo| {
            Op::Rename(RenameOp {
                old_name: old.into(),
                old_dir: BlockUpdate::unchanged(ptr("root")),
                new_name: old.into(),
                new_dir: Some(BlockUpdate::unchanged(ptr(new_dir))),
                renamed: ptr(old),
                renamed_type: EntryType::Dir,
                common: OpCommon::new(w),
            })
        };
        let mut uc =
            CrChains::build(&[rev(2, "root", vec![rename("b", "a", writer("alice", 1))])]).unwrap();
        let mc =
            CrChains::build(&[rev(2, "root", vec![rename("a", "b", writer("bob", 9))])]).unwrap();

        let mut merged = TreeIndex::default();
        merged.insert_for_test(ptr("b"), ptr("root"), "b", EntryType::Dir);
        merged.insert_for_test(ptr("a"), ptr("b"), "a", EntryType::Dir);
        let mut unmerged = TreeIndex::default();
        unmerged.insert_for_test(ptr("a"), ptr("root"), "a", EntryType::Dir);
        unmerged.insert_for_test(ptr("b"), ptr("a"), "b", EntryType::Dir);

        let dropped = drop_conflicting_renames(&mut uc, &mc, &merged, &unmerged);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].original, ptr("b"));
        assert!(mc.renamed(&ptr("a")).is_some());
    }
}
