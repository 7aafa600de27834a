//! Reconciling actions applied to one merged directory.
//!
//! Every action is scoped to a name in one merged directory. Applying it
//! mutates the executor's private copy of that directory and reports two
//! patches: what changes in the unmerged op list that will be committed, and
//! which synthetic ops local observers must replay.

use std::collections::BTreeSet;
use std::fmt;

use tracing::debug;

use crate::chains::CrChains;
use crate::conflict::renamer::numbered_name;
use crate::errors::ActionError;
use crate::model::{Attr, BlockPointer, BlockUpdate, DirBlock, DirEntry, WriterInfo};
use crate::ops::{CreateOp, Op, OpCommon, RenameOp};
use crate::paths::TreeIndex;

/// One reconciling action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrAction {
    /// Copy the unmerged entry `from` into the merged directory as `to`.
    CopyEntry { from: String, to: String },
    /// Copy selected attributes of unmerged `from` onto merged `to`.
    CopyAttr {
        from: String,
        to: String,
        attrs: BTreeSet<Attr>,
    },
    /// Delete `name` from the merged directory.
    RemoveEntry { name: String },
    /// Keep the unmerged entry `from` under the conflict name `to`,
    /// duplicating file blocks under a fresh reference nonce.
    RenameUnmerged { from: String, to: String },
    /// Move the merged entry `from` to the conflict name `to` and put the
    /// unmerged entry under `from`.
    RenameMerged { from: String, to: String },
    /// Discard an unmerged op and tell local observers to undo it.
    DropUnmerged { op: Op },
}

/// The directory an action is applied to.
pub struct DirectoryState<'a> {
    /// Contents of the matching unmerged directory.
    pub unmerged: &'a DirBlock,
    /// The executor's private copy of the merged directory.
    pub merged: &'a mut DirBlock,
    /// Merged-side pointer of this directory, used in notification ops.
    pub merged_dir: BlockPointer,
    pub unmerged_chains: &'a CrChains,
    pub merged_chains: &'a CrChains,
    /// Index of the merged tree, present when entries may need swapping
    /// for their merged-side version.
    pub merged_index: Option<&'a TreeIndex>,
    /// Writer recorded on synthetic ops.
    pub writer: &'a WriterInfo,
    pub max_unique_name_attempts: usize,
}

/// Changes to the unmerged op list caused by an action.
#[derive(Debug, Default)]
pub struct UnmergedPatch {
    /// Entry renames to apply to later unmerged ops in this directory.
    pub renames: Vec<(String, String)>,
    /// File pointers replaced by duplicated copies.
    pub repointed: Vec<BlockUpdate>,
    /// Ops removed from the unmerged list.
    pub dropped: Vec<Op>,
    /// Pointers newly referenced by the merged tree.
    pub new_refs: Vec<BlockPointer>,
}

/// Synthetic ops for local observers, to be replayed before merged history.
#[derive(Debug, Default)]
pub struct MergedPatch {
    pub notifications: Vec<Op>,
}

impl CrAction {
    /// Apply the action to `state`.
    pub fn apply(
        &self,
        state: &mut DirectoryState<'_>,
    ) -> Result<(UnmergedPatch, MergedPatch), ActionError> {
        let mut unmerged_patch = UnmergedPatch::default();
        let mut merged_patch = MergedPatch::default();

        match self {
            CrAction::CopyEntry { from, to } => {
                let entry = entry_to_copy(state, from)?;
                state.merged.entries.insert(to.clone(), entry);
                if from != to {
                    unmerged_patch.renames.push((from.clone(), to.clone()));
                }
            }
            CrAction::CopyAttr { from, to, attrs } => {
                let source = unmerged_entry(state, from)?;
                match state.merged.entries.get_mut(to) {
                    Some(target) => {
                        for attr in attrs {
                            match attr {
                                Attr::Exec => target.entry_type = source.entry_type,
                                Attr::Mtime => target.mtime = source.mtime,
                                Attr::Size => {
                                    target.size = source.size;
                                    target.pointer = source.pointer;
                                }
                            }
                        }
                    }
                    None => {
                        debug!(name = %to, "attribute target missing, copying whole entry");
                        state.merged.entries.insert(to.clone(), source);
                    }
                }
            }
            CrAction::RemoveEntry { name } => {
                if state.merged.entries.remove(name).is_none() {
                    debug!(name = %name, "entry to remove already gone");
                }
            }
            CrAction::RenameUnmerged { from, to } => {
                let mut entry = unmerged_entry(state, from)?;
                let old_pointer = entry.pointer;
                if entry.entry_type.is_file() {
                    entry.pointer = old_pointer.with_fresh_nonce();
                    unmerged_patch.new_refs.push(entry.pointer);
                    unmerged_patch
                        .repointed
                        .push(BlockUpdate::new(old_pointer, entry.pointer));
                }
                let new_name = unique_name(state.merged, to, state.max_unique_name_attempts)?;
                let renamed_type = entry.entry_type;
                let renamed = entry.pointer;
                state.merged.entries.insert(new_name.clone(), entry);
                unmerged_patch.renames.push((from.clone(), new_name.clone()));

                let dir = BlockUpdate::unchanged(state.merged_dir);
                merged_patch.notifications.push(Op::Rename(RenameOp {
                    old_name: from.clone(),
                    old_dir: dir,
                    new_name: new_name.clone(),
                    new_dir: None,
                    renamed,
                    renamed_type,
                    common: OpCommon::new(state.writer.clone()),
                }));
                if let Some(merged_entry) = state.merged.get(from) {
                    merged_patch.notifications.push(Op::Create(CreateOp {
                        name: from.clone(),
                        dir,
                        entry_type: merged_entry.entry_type,
                        node: merged_entry.pointer,
                        renamed: false,
                        common: OpCommon::new(state.writer.clone()),
                    }));
                }
            }
            CrAction::RenameMerged { from, to } => {
                let merged_entry =
                    state
                        .merged
                        .get(from)
                        .cloned()
                        .ok_or_else(|| ActionError::EntryMissing {
                            name: from.clone(),
                            side: "merged",
                        })?;
                let unmerged = unmerged_entry(state, from)?;
                let new_name = unique_name(state.merged, to, state.max_unique_name_attempts)?;
                merged_patch.notifications.push(Op::Create(CreateOp {
                    name: new_name.clone(),
                    dir: BlockUpdate::unchanged(state.merged_dir),
                    entry_type: merged_entry.entry_type,
                    node: merged_entry.pointer,
                    renamed: false,
                    common: OpCommon::new(state.writer.clone()),
                }));
                state.merged.entries.insert(new_name, merged_entry);
                state.merged.entries.insert(from.clone(), unmerged);
            }
            CrAction::DropUnmerged { op } => {
                if let Some(inverted) = op.invert() {
                    merged_patch.notifications.push(inverted);
                }
                unmerged_patch.dropped.push(op.clone());
            }
        }
        Ok((unmerged_patch, merged_patch))
    }
}

impl fmt::Display for CrAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrAction::CopyEntry { from, to } if from == to => write!(f, "copy entry {from}"),
            CrAction::CopyEntry { from, to } => write!(f, "copy entry {from} -> {to}"),
            CrAction::CopyAttr { from, attrs, .. } => {
                let attrs: Vec<String> = attrs.iter().map(|a| a.to_string()).collect();
                write!(f, "copy attrs [{}] of {from}", attrs.join(","))
            }
            CrAction::RemoveEntry { name } => write!(f, "remove entry {name}"),
            CrAction::RenameUnmerged { from, to } => write!(f, "rename unmerged {from} -> {to}"),
            CrAction::RenameMerged { from, to } => write!(f, "rename merged {from} -> {to}"),
            CrAction::DropUnmerged { op } => write!(f, "drop unmerged {op}"),
        }
    }
}

fn unmerged_entry(state: &DirectoryState<'_>, name: &str) -> Result<DirEntry, ActionError> {
    state
        .unmerged
        .get(name)
        .cloned()
        .ok_or_else(|| ActionError::EntryMissing {
            name: name.to_string(),
            side: "unmerged",
        })
}

/// The unmerged entry `name`, swapped for its merged-side version when the
/// unmerged branch never changed the node but the merged branch did.
fn entry_to_copy(state: &DirectoryState<'_>, name: &str) -> Result<DirEntry, ActionError> {
    let entry = unmerged_entry(state, name)?;
    let Some(index) = state.merged_index else {
        return Ok(entry);
    };
    let original = state.unmerged_chains.original_of(entry.pointer);
    if original != entry.pointer || state.merged_chains.is_deleted(&original) {
        return Ok(entry);
    }
    let merged_ptr = state
        .merged_chains
        .most_recent_from_original_or_same(&original);
    if merged_ptr == entry.pointer {
        return Ok(entry);
    }
    match index.entry(&merged_ptr) {
        Some(merged_entry) => {
            debug!(name, "copying merged version of unchanged entry");
            Ok(merged_entry.clone())
        }
        None => Ok(entry),
    }
}

/// `name`, or the first free `name (N)` variant in `block`.
pub fn unique_name(block: &DirBlock, name: &str, max_attempts: usize) -> Result<String, ActionError> {
    if !block.contains(name) {
        return Ok(name.to_string());
    }
    for n in 1..=max_attempts {
        let candidate = numbered_name(name, n);
        if !block.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(ActionError::UniqueNameExhausted(name.to_string()))
}
