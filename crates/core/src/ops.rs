//! The op log recorded in every revision.
//!
//! Each op names the directory pointer(s) it changed, the entry name(s) it
//! touched, the blocks it referenced and released, and who made it. Ops are
//! plain values: the chain builder clones them into per-node chains and the
//! executor rewrites names and pointers on its own copies.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{Attr, BlockPointer, BlockUpdate, EntryType, WriterInfo};

/// Fields every op carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpCommon {
    pub writer: WriterInfo,
    /// Blocks newly referenced by this op.
    #[serde(default)]
    pub refs: Vec<BlockPointer>,
    /// Blocks released by this op.
    #[serde(default)]
    pub unrefs: Vec<BlockPointer>,
    /// Pointer changes of ancestor directories.
    #[serde(default)]
    pub updates: Vec<BlockUpdate>,
}

impl OpCommon {
    pub fn new(writer: WriterInfo) -> Self {
        Self {
            writer,
            refs: Vec::new(),
            unrefs: Vec::new(),
            updates: Vec::new(),
        }
    }
}

/// A new entry `name` in `dir`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CreateOp {
    pub name: String,
    pub dir: BlockUpdate,
    pub entry_type: EntryType,
    /// The created node's pointer.
    pub node: BlockPointer,
    /// Set when this is the arriving half of a split rename.
    #[serde(default)]
    pub renamed: bool,
    pub common: OpCommon,
}

/// Removal of entry `name` from `dir`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RmOp {
    pub name: String,
    pub dir: BlockUpdate,
    pub entry_type: EntryType,
    /// Pointer of the removed node at the time of removal.
    pub node: BlockPointer,
    /// Set when this is the departing half of a split rename.
    #[serde(default)]
    pub renamed: bool,
    pub common: OpCommon,
}

/// Move of `renamed` from `old_dir/old_name` to `new_dir/new_name`.
/// `new_dir` is `None` for a rename within one directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenameOp {
    pub old_name: String,
    pub old_dir: BlockUpdate,
    pub new_name: String,
    pub new_dir: Option<BlockUpdate>,
    pub renamed: BlockPointer,
    pub renamed_type: EntryType,
    pub common: OpCommon,
}

impl RenameOp {
    pub fn target_dir(&self) -> BlockUpdate {
        self.new_dir.unwrap_or(self.old_dir)
    }
}

/// New contents for a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncOp {
    pub file: BlockUpdate,
    pub common: OpCommon,
}

/// Attribute change on entry `name` in `dir`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetAttrOp {
    pub name: String,
    pub dir: BlockUpdate,
    pub attr: Attr,
    pub file: BlockPointer,
    pub entry_type: EntryType,
    pub common: OpCommon,
}

/// Summary op closing a conflict-resolution revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolutionOp {
    pub summary: Vec<String>,
    pub common: OpCommon,
}

/// One recorded change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Op {
    Create(CreateOp),
    Rm(RmOp),
    Rename(RenameOp),
    Sync(SyncOp),
    SetAttr(SetAttrOp),
    Resolution(ResolutionOp),
}

impl Op {
    pub fn common(&self) -> &OpCommon {
        match self {
            Op::Create(op) => &op.common,
            Op::Rm(op) => &op.common,
            Op::Rename(op) => &op.common,
            Op::Sync(op) => &op.common,
            Op::SetAttr(op) => &op.common,
            Op::Resolution(op) => &op.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut OpCommon {
        match self {
            Op::Create(op) => &mut op.common,
            Op::Rm(op) => &mut op.common,
            Op::Rename(op) => &mut op.common,
            Op::Sync(op) => &mut op.common,
            Op::SetAttr(op) => &mut op.common,
            Op::Resolution(op) => &mut op.common,
        }
    }

    pub fn writer(&self) -> &WriterInfo {
        &self.common().writer
    }

    /// The op's own pointer changes followed by its ancestor updates.
    pub fn all_updates(&self) -> Vec<BlockUpdate> {
        let mut updates = match self {
            Op::Create(op) => vec![op.dir],
            Op::Rm(op) => vec![op.dir],
            Op::Rename(op) => {
                let mut u = vec![op.old_dir];
                if let Some(new_dir) = op.new_dir {
                    u.push(new_dir);
                }
                u
            }
            Op::Sync(op) => vec![op.file],
            Op::SetAttr(op) => vec![op.dir],
            Op::Resolution(_) => Vec::new(),
        };
        updates.extend(self.common().updates.iter().copied());
        updates
    }

    /// Rename every reference to entry `from` as `to`.
    pub fn rename_entry(&mut self, from: &str, to: &str) {
        let fix = |name: &mut String| {
            if name == from {
                *name = to.to_string();
            }
        };
        match self {
            Op::Create(op) => fix(&mut op.name),
            Op::Rm(op) => fix(&mut op.name),
            Op::Rename(op) => {
                fix(&mut op.old_name);
                fix(&mut op.new_name);
            }
            Op::SetAttr(op) => fix(&mut op.name),
            Op::Sync(_) | Op::Resolution(_) => {}
        }
    }

    /// The op a local observer must replay to undo this one.
    ///
    /// Pointer updates are reversed; bare refs and unrefs are dropped since
    /// they carry no meaning for notifications.
    pub fn invert(&self) -> Option<Op> {
        let reverse = |u: &BlockUpdate| BlockUpdate::new(u.new, u.old);
        let mut common = OpCommon::new(self.writer().clone());
        common.updates = self.common().updates.iter().map(reverse).collect();
        let inverted = match self {
            Op::Create(op) => Op::Rm(RmOp {
                name: op.name.clone(),
                dir: reverse(&op.dir),
                entry_type: op.entry_type,
                node: op.node,
                renamed: op.renamed,
                common,
            }),
            Op::Rm(op) => Op::Create(CreateOp {
                name: op.name.clone(),
                dir: reverse(&op.dir),
                entry_type: op.entry_type,
                node: op.node,
                renamed: op.renamed,
                common,
            }),
            Op::Rename(op) => {
                let (old_dir, new_dir) = match op.new_dir {
                    Some(new_dir) => (reverse(&new_dir), Some(reverse(&op.old_dir))),
                    None => (reverse(&op.old_dir), None),
                };
                Op::Rename(RenameOp {
                    old_name: op.new_name.clone(),
                    old_dir,
                    new_name: op.old_name.clone(),
                    new_dir,
                    renamed: op.renamed,
                    renamed_type: op.renamed_type,
                    common,
                })
            }
            Op::Sync(op) => Op::Sync(SyncOp {
                file: reverse(&op.file),
                common,
            }),
            Op::SetAttr(op) => Op::SetAttr(SetAttrOp {
                dir: reverse(&op.dir),
                common,
                ..op.clone()
            }),
            Op::Resolution(_) => return None,
        };
        Some(inverted)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Create(op) if op.renamed => write!(f, "create {} (renamed {})", op.name, op.entry_type),
            Op::Create(op) => write!(f, "create {} ({})", op.name, op.entry_type),
            Op::Rm(op) => write!(f, "rm {}", op.name),
            Op::Rename(op) => write!(f, "rename {} -> {}", op.old_name, op.new_name),
            Op::Sync(op) => write!(f, "sync {}", op.file.new),
            Op::SetAttr(op) => write!(f, "setattr {} on {}", op.attr, op.name),
            Op::Resolution(op) => write!(f, "resolution ({} actions)", op.summary.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockId;
    use chrono::Utc;

    fn ptr(s: &str) -> BlockPointer {
        BlockPointer::new(BlockId::from_content(s.as_bytes()))
    }

    fn writer() -> WriterInfo {
        WriterInfo::new("alice", Utc::now())
    }

    #[test]
    fn test_all_updates_includes_ancestors() {
        let mut common = OpCommon::new(writer());
        common.updates.push(BlockUpdate::new(ptr("root"), ptr("root2")));
        let op = Op::Create(CreateOp {
            name: "f".into(),
            dir: BlockUpdate::new(ptr("a"), ptr("a2")),
            entry_type: EntryType::File,
            node: ptr("f"),
            renamed: false,
            common,
        });
        let updates = op.all_updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].new, ptr("a2"));
        assert_eq!(updates[1].old, ptr("root"));
    }

    #[test]
    fn test_json_is_tagged_by_kind() {
        let op = Op::Rm(RmOp {
            name: "old.txt".into(),
            dir: BlockUpdate::new(ptr("a"), ptr("a2")),
            entry_type: EntryType::File,
            node: ptr("old"),
            renamed: false,
            common: OpCommon::new(writer()),
        });
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "rm");
        assert_eq!(json["name"], "old.txt");
        let back: Op = serde_json::from_value(json).unwrap();
        assert!(matches!(back, Op::Rm(rm) if rm.node == ptr("old")));
    }

    #[test]
    fn test_ops_hash_by_value() {
        let writer = writer();
        let sync = |file: &str| {
            Op::Sync(SyncOp {
                file: BlockUpdate::new(ptr(file), ptr("new")),
                common: OpCommon::new(writer.clone()),
            })
        };
        let set: std::collections::HashSet<Op> = [sync("f"), sync("f"), sync("g")].into();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&sync("f")));
        assert!(!set.contains(&sync("h")));
    }

    #[test]
    fn test_invert_rename_swaps_directories() {
        let op = Op::Rename(RenameOp {
            old_name: "x".into(),
            old_dir: BlockUpdate::new(ptr("a"), ptr("a2")),
            new_name: "y".into(),
            new_dir: Some(BlockUpdate::new(ptr("b"), ptr("b2"))),
            renamed: ptr("x"),
            renamed_type: EntryType::Dir,
            common: OpCommon::new(writer()),
        });
        let Some(Op::Rename(inv)) = op.invert() else {
            panic!("expected rename");
        };
        assert_eq!(inv.old_name, "y");
        assert_eq!(inv.new_name, "x");
        assert_eq!(inv.old_dir, BlockUpdate::new(ptr("b2"), ptr("b")));
        assert_eq!(inv.new_dir, Some(BlockUpdate::new(ptr("a2"), ptr("a"))));
    }

    #[test]
    fn test_invert_create_is_rm() {
        let op = Op::Create(CreateOp {
            name: "f".into(),
            dir: BlockUpdate::new(ptr("a"), ptr("a2")),
            entry_type: EntryType::File,
            node: ptr("f"),
            renamed: false,
            common: OpCommon::new(writer()),
        });
        assert!(matches!(op.invert(), Some(Op::Rm(ref rm)) if rm.name == "f"));
    }

    #[test]
    fn test_rename_entry_rewrites_names() {
        let mut op = Op::SetAttr(SetAttrOp {
            name: "f".into(),
            dir: BlockUpdate::unchanged(ptr("a")),
            attr: Attr::Mtime,
            file: ptr("f"),
            entry_type: EntryType::File,
            common: OpCommon::new(writer()),
        });
        op.rename_entry("f", "f (1)");
        assert!(matches!(op, Op::SetAttr(ref s) if s.name == "f (1)"));
        op.rename_entry("other", "zzz");
        assert!(matches!(op, Op::SetAttr(ref s) if s.name == "f (1)"));
    }
}
