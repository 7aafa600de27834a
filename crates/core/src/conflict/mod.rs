//! Conflict handling: reconciling actions, how they are computed and
//! collapsed, and how conflicting entries are named.
//!
//! The subsystem is responsible for:
//! 1. **Detection** -- comparing each unmerged op with the merged chain of the same node.
//! 2. **Collapsing** -- keeping only the strongest action per directory entry.
//! 3. **Application** -- mutating a private directory copy and reporting patches.

pub mod action;
pub mod collapse;
pub mod detector;
pub mod renamer;

pub use action::{CrAction, DirectoryState, MergedPatch, UnmergedPatch};
pub use collapse::ActionCollapser;
pub use detector::{drop_conflicting_renames, ActionComputer, DirActions, DroppedRename};
pub use renamer::{ConflictRenamer, WriterDateRenamer};
