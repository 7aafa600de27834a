//! Shared data model: block pointers, revisions, directory blocks and paths.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ops::Op;

// ---------------------------------------------------------------------------
// Block identity
// ---------------------------------------------------------------------------

/// Content-derived block identifier (a sha-256 digest).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId([u8; 32]);

impl BlockId {
    /// Derive an id from block content.
    pub fn from_content(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        Self(id)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(&self.0[..5]))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({self})")
    }
}

/// Identity of one node version.
///
/// The `ref_nonce` distinguishes independent references to the same block
/// content; duplicating a file under a fresh nonce gives a second copy that
/// can be referenced and released independently of the first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockPointer {
    pub id: BlockId,
    pub ref_nonce: u64,
}

impl BlockPointer {
    pub fn new(id: BlockId) -> Self {
        Self { id, ref_nonce: 0 }
    }

    /// A second reference to the same block under a fresh random nonce.
    pub fn with_fresh_nonce(&self) -> Self {
        let mut rng = rand::thread_rng();
        let mut nonce = rng.gen::<u64>();
        while nonce == 0 || nonce == self.ref_nonce {
            nonce = rng.gen::<u64>();
        }
        Self {
            id: self.id,
            ref_nonce: nonce,
        }
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ref_nonce == 0 {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}#{:x}", self.id, self.ref_nonce)
        }
    }
}

impl fmt::Debug for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockPointer({self})")
    }
}

/// A pointer change made by one op: `old` is unreferenced, `new` referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockUpdate {
    pub old: BlockPointer,
    pub new: BlockPointer,
}

impl BlockUpdate {
    pub fn new(old: BlockPointer, new: BlockPointer) -> Self {
        Self { old, new }
    }

    /// An update that leaves the pointer in place.
    pub fn unchanged(ptr: BlockPointer) -> Self {
        Self { old: ptr, new: ptr }
    }
}

// ---------------------------------------------------------------------------
// Revisions and branches
// ---------------------------------------------------------------------------

/// Per-branch revision number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Revision(pub u64);

impl Revision {
    pub const UNINITIALIZED: Revision = Revision(0);
    pub const INITIAL: Revision = Revision(1);

    pub fn next(self) -> Self {
        Revision(self.0 + 1)
    }

    pub fn is_initialized(self) -> bool {
        self != Self::UNINITIALIZED
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a device-local unmerged branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchId(pub String);

impl BranchId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which history a revision belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Merged,
    Unmerged(BranchId),
}

/// Who made a change and when.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriterInfo {
    pub writer: String,
    pub timestamp: DateTime<Utc>,
}

impl WriterInfo {
    pub fn new(writer: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            writer: writer.into(),
            timestamp,
        }
    }
}

/// One immutable revision of a folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionData {
    pub revision: Revision,
    pub branch: Branch,
    /// Predecessor revision. For the first unmerged revision this is the
    /// merged revision the branch forked from.
    pub prev: Revision,
    /// Root directory pointer after this revision.
    pub root: BlockPointer,
    pub writer: WriterInfo,
    pub ops: Vec<Op>,
}

/// The `(unmerged, merged)` revision pair that triggers a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConflictInput {
    pub unmerged: Revision,
    pub merged: Revision,
}

impl ConflictInput {
    pub fn new(unmerged: Revision, merged: Revision) -> Self {
        Self { unmerged, merged }
    }

    /// True when neither revision is newer than `baseline`.
    pub fn is_covered_by(&self, baseline: &ConflictInput) -> bool {
        self.unmerged <= baseline.unmerged && self.merged <= baseline.merged
    }

    /// Component-wise maximum of two inputs.
    pub fn max(&self, other: &ConflictInput) -> ConflictInput {
        ConflictInput {
            unmerged: self.unmerged.max(other.unmerged),
            merged: self.merged.max(other.merged),
        }
    }
}

impl fmt::Display for ConflictInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(unmerged={}, merged={})", self.unmerged, self.merged)
    }
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// Kind of directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    File,
    Exec,
    Dir,
}

impl EntryType {
    pub fn is_file(self) -> bool {
        matches!(self, Self::File | Self::Exec)
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Exec => write!(f, "exec"),
            Self::Dir => write!(f, "dir"),
        }
    }
}

/// Attribute touched by a set-attribute op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attr {
    Exec,
    Mtime,
    Size,
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exec => write!(f, "exec"),
            Self::Mtime => write!(f, "mtime"),
            Self::Size => write!(f, "size"),
        }
    }
}

/// One named child of a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub pointer: BlockPointer,
    pub entry_type: EntryType,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

/// Directory contents, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirBlock {
    pub entries: BTreeMap<String, DirEntry>,
}

impl DirBlock {
    pub fn get(&self, name: &str) -> Option<&DirEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Digest over every entry, in name order.
    pub fn content_id(&self) -> BlockId {
        let mut bytes = Vec::new();
        for (name, entry) in &self.entries {
            bytes.extend_from_slice(name.as_bytes());
            bytes.push(0);
            bytes.extend_from_slice(&entry.pointer.id.0);
            bytes.extend_from_slice(&entry.pointer.ref_nonce.to_be_bytes());
            bytes.push(entry.entry_type as u8);
            bytes.extend_from_slice(&entry.size.to_be_bytes());
            bytes.extend_from_slice(&entry.mtime.timestamp_micros().to_be_bytes());
        }
        BlockId::from_content(&bytes)
    }
}

impl Block {
    pub fn content_id(&self) -> BlockId {
        match self {
            Block::Dir(dir) => dir.content_id(),
            Block::File(file) => BlockId::from_content(&file.contents),
        }
    }
}

/// File contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlock {
    pub contents: Vec<u8>,
}

/// Any stored block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Block {
    Dir(DirBlock),
    File(FileBlock),
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// One step of a path: the entry name and the pointer found under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathNode {
    pub name: String,
    pub pointer: BlockPointer,
}

/// A branch-specific path from the root to a node. The root node has an
/// empty name; the last node's pointer is the node's pointer in that branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    pub nodes: Vec<PathNode>,
}

impl Path {
    pub fn root(pointer: BlockPointer) -> Self {
        Self {
            nodes: vec![PathNode {
                name: String::new(),
                pointer,
            }],
        }
    }

    pub fn from_nodes(nodes: Vec<PathNode>) -> Self {
        Self { nodes }
    }

    pub fn child(&self, name: impl Into<String>, pointer: BlockPointer) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.push(PathNode {
            name: name.into(),
            pointer,
        });
        Self { nodes }
    }

    pub fn parent(&self) -> Option<Path> {
        if self.nodes.len() < 2 {
            return None;
        }
        Some(Self {
            nodes: self.nodes[..self.nodes.len() - 1].to_vec(),
        })
    }

    /// Pointer of the final node. Panics on an empty path.
    pub fn tail_pointer(&self) -> BlockPointer {
        self.nodes[self.nodes.len() - 1].pointer
    }

    pub fn tail_name(&self) -> &str {
        &self.nodes[self.nodes.len() - 1].name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nodes.len() <= 1 {
            return write!(f, "/");
        }
        for node in &self.nodes[1..] {
            write!(f, "/{}", node.name)?;
        }
        Ok(())
    }
}
