//! Path resolution for nodes the unmerged branch touched.
//!
//! For every chain with unmerged ops the resolver finds the node's path in
//! the unmerged tree, then the path of the same node in the merged tree.
//! The merged walk goes up the unmerged path until it reaches an ancestor
//! the merged branch still knows about. Every level the merged branch
//! deleted becomes a recreate op prepended to the parent's unmerged chain,
//! so the executor rebuilds it.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, trace};

use crate::cancel::CancellationToken;
use crate::chains::CrChains;
use crate::errors::{ChainError, PathError, ResolveError};
use crate::model::{BlockPointer, BlockUpdate, DirEntry, EntryType, Path, PathNode, WriterInfo};
use crate::ops::{CreateOp, Op, OpCommon};
use crate::source::{BlockSource, NodeCache};

// ---------------------------------------------------------------------------
// Tree walks
// ---------------------------------------------------------------------------

/// Breadth-first search from `root` for the paths of `targets`.
pub async fn search_paths<B: BlockSource>(
    blocks: &B,
    cancel: &CancellationToken,
    root: BlockPointer,
    targets: &HashSet<BlockPointer>,
) -> Result<HashMap<BlockPointer, Path>, ResolveError> {
    let mut found = HashMap::new();
    if targets.contains(&root) {
        found.insert(root, Path::root(root));
    }
    let mut queue = VecDeque::from([Path::root(root)]);
    while let Some(path) = queue.pop_front() {
        if found.len() == targets.len() {
            break;
        }
        cancel.check()?;
        let block = blocks.fetch_dir_block(cancel, path.tail_pointer()).await?;
        for (name, entry) in &block.entries {
            let child = path.child(name.clone(), entry.pointer);
            if targets.contains(&entry.pointer) {
                found.insert(entry.pointer, child.clone());
            }
            if entry.entry_type == EntryType::Dir {
                queue.push_back(child);
            }
        }
    }
    Ok(found)
}

/// One node in a [`TreeIndex`].
#[derive(Debug, Clone)]
pub struct IndexedNode {
    pub parent: BlockPointer,
    pub name: String,
    pub entry: DirEntry,
}

/// Parent and entry of every node reachable from one root.
#[derive(Debug, Default)]
pub struct TreeIndex {
    root: Option<BlockPointer>,
    nodes: HashMap<BlockPointer, IndexedNode>,
}

impl TreeIndex {
    pub async fn build<B: BlockSource>(
        blocks: &B,
        cancel: &CancellationToken,
        root: BlockPointer,
    ) -> Result<Self, ResolveError> {
        let mut nodes = HashMap::new();
        let mut queue = VecDeque::from([root]);
        while let Some(dir) = queue.pop_front() {
            cancel.check()?;
            let block = blocks.fetch_dir_block(cancel, dir).await?;
            for (name, entry) in &block.entries {
                if entry.entry_type == EntryType::Dir {
                    queue.push_back(entry.pointer);
                }
                nodes.insert(
                    entry.pointer,
                    IndexedNode {
                        parent: dir,
                        name: name.clone(),
                        entry: entry.clone(),
                    },
                );
            }
        }
        trace!(nodes = nodes.len(), "indexed tree");
        Ok(Self {
            root: Some(root),
            nodes,
        })
    }

    pub fn root(&self) -> Option<BlockPointer> {
        self.root
    }

    pub fn node(&self, ptr: &BlockPointer) -> Option<&IndexedNode> {
        self.nodes.get(ptr)
    }

    pub fn entry(&self, ptr: &BlockPointer) -> Option<&DirEntry> {
        self.nodes.get(ptr).map(|n| &n.entry)
    }

    pub fn parent(&self, ptr: &BlockPointer) -> Option<BlockPointer> {
        self.nodes.get(ptr).map(|n| n.parent)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(
        &mut self,
        ptr: BlockPointer,
        parent: BlockPointer,
        name: &str,
        entry_type: EntryType,
    ) {
        self.nodes.insert(
            ptr,
            IndexedNode {
                parent,
                name: name.to_string(),
                entry: DirEntry {
                    pointer: ptr,
                    entry_type,
                    size: 0,
                    mtime: chrono::Utc::now(),
                },
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Resolved paths
// ---------------------------------------------------------------------------

/// A node's path in both branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPair {
    pub unmerged: Path,
    pub merged: Path,
}

/// Output of path resolution.
#[derive(Debug, Default)]
pub struct ResolvedPaths {
    /// Keyed by the node's unmerged most-recent pointer.
    pub pairs: HashMap<BlockPointer, PathPair>,
    /// Originals of nodes the merged branch deleted that will be rebuilt.
    pub recreated: HashSet<BlockPointer>,
    /// Merged-side removals undone by recreation, as (parent original, name).
    pub suppressed_merged: HashSet<(BlockPointer, String)>,
    /// Synthesized recreate ops, innermost level first for each path.
    pub recreate_ops: Vec<CreateOp>,
}

impl ResolvedPaths {
    /// Pairs ordered leaf-first by unmerged path depth.
    pub fn leaf_first(&self) -> Vec<(&BlockPointer, &PathPair)> {
        let mut pairs: Vec<_> = self.pairs.iter().collect();
        pairs.sort_by(|a, b| {
            b.1.unmerged
                .len()
                .cmp(&a.1.unmerged.len())
                .then_with(|| a.1.unmerged.to_string().cmp(&b.1.unmerged.to_string()))
        });
        pairs
    }
}

struct PendingRecreate {
    op: CreateOp,
    parent_original: BlockPointer,
    unmerged_parent: Path,
    /// Index of the recreated node in the leaf-first suffix.
    leaf_index: usize,
}

struct MergedTail {
    start: BlockPointer,
    /// Nodes below `start`, root-first.
    suffix: Vec<PathNode>,
    recreates: Vec<PendingRecreate>,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Resolves unmerged and merged paths for one attempt.
pub struct PathResolver<'a, S> {
    store: &'a S,
    cancel: &'a CancellationToken,
}

impl<'a, S: BlockSource + NodeCache> PathResolver<'a, S> {
    pub fn new(store: &'a S, cancel: &'a CancellationToken) -> Self {
        Self { store, cancel }
    }

    /// Resolve both paths of every node with unmerged ops, synthesize
    /// recreate ops, and prepend them to the unmerged chains.
    pub async fn resolve(
        &self,
        uc: &mut CrChains,
        mc: &mut CrChains,
        merged_root: BlockPointer,
        writer: &WriterInfo,
    ) -> Result<ResolvedPaths, ResolveError> {
        let unmerged_paths = self.unmerged_paths(uc).await?;

        let mut tails = Vec::with_capacity(unmerged_paths.len());
        for path in &unmerged_paths {
            self.cancel.check()?;
            let tail = self.merged_tail(path, uc, mc, writer).await?;
            tails.push((path.clone(), tail));
        }

        let starts: HashSet<BlockPointer> = tails.iter().map(|(_, t)| t.start).collect();
        let found = search_paths(self.store, self.cancel, merged_root, &starts).await?;

        let mut resolved = ResolvedPaths::default();
        let mut seen_recreates: HashSet<(BlockPointer, String)> = HashSet::new();
        for (unmerged, tail) in tails {
            let base = found.get(&tail.start).ok_or(PathError::NodeNotFound {
                ptr: tail.start,
                branch: "merged",
            })?;
            let merged = extend(base, &tail.suffix);
            trace!(unmerged = %unmerged, merged = %merged, "matched paths");

            let suffix_len = tail.suffix.len();
            for rec in tail.recreates {
                let key = (rec.parent_original, rec.op.name.clone());
                if !seen_recreates.insert(key.clone()) {
                    continue;
                }
                resolved.recreated.insert(rec.op.node);

                let root_index = suffix_len - 1 - rec.leaf_index;
                let merged_parent = extend(base, &tail.suffix[..root_index]);
                let unmerged_parent_ptr = rec.unmerged_parent.tail_pointer();
                resolved
                    .pairs
                    .entry(unmerged_parent_ptr)
                    .or_insert_with(|| PathPair {
                        unmerged: rec.unmerged_parent.clone(),
                        merged: merged_parent,
                    });

                let node = rec.op.node;
                let removes_node =
                    |op: &Op| matches!(op, Op::Rm(rm) if rm.node == node || rm.name == key.1);
                if let Some(Op::Rm(rm)) = mc.take_op(&rec.parent_original, removes_node) {
                    resolved
                        .suppressed_merged
                        .insert((rec.parent_original, rm.name));
                }
                uc.prepend_op(rec.parent_original, Op::Create(rec.op.clone()));
                debug!(
                    name = %rec.op.name,
                    parent = %rec.unmerged_parent,
                    "recreating directory deleted on the merged branch"
                );
                resolved.recreate_ops.push(rec.op);
            }

            resolved
                .pairs
                .insert(unmerged.tail_pointer(), PathPair { unmerged, merged });
        }
        Ok(resolved)
    }

    /// Unmerged paths of every chain with ops that this branch neither
    /// created nor deleted, longest first. Chains without a path are dropped.
    pub async fn unmerged_paths(&self, uc: &mut CrChains) -> Result<Vec<Path>, ResolveError> {
        let head = uc
            .head()
            .ok_or(PathError::MissingHead { branch: "unmerged" })?;

        let targets: Vec<(BlockPointer, BlockPointer)> = uc
            .chains_with_ops()
            .filter(|c| !uc.is_created(&c.original) && !uc.is_deleted(&c.original))
            .map(|c| (c.original, c.most_recent))
            .collect();

        let mut found: HashMap<BlockPointer, Path> = HashMap::new();
        let mut missing = HashSet::new();
        for (_, most_recent) in &targets {
            match self.store.path_for(most_recent) {
                Some(p)
                    if !p.is_empty()
                        && p.tail_pointer() == *most_recent
                        && p.nodes[0].pointer == head.root =>
                {
                    found.insert(*most_recent, p);
                }
                _ => {
                    missing.insert(*most_recent);
                }
            }
        }
        if !missing.is_empty() {
            found.extend(search_paths(self.store, self.cancel, head.root, &missing).await?);
        }

        let mut paths = Vec::with_capacity(found.len());
        for (original, most_recent) in targets {
            match found.remove(&most_recent) {
                Some(path) => paths.push(path),
                None => {
                    debug!(node = %most_recent, "no unmerged path, dropping chain");
                    uc.remove_chain(&original);
                }
            }
        }
        paths.sort_by(|a, b| b.len().cmp(&a.len()));
        Ok(paths)
    }

    async fn merged_tail(
        &self,
        path: &Path,
        uc: &CrChains,
        mc: &CrChains,
        writer: &WriterInfo,
    ) -> Result<MergedTail, ResolveError> {
        let nodes = &path.nodes;
        let mut i = nodes.len() - 1;
        let mut suffix: Vec<PathNode> = Vec::new();
        let mut recreates = Vec::new();
        let mut current = uc.original_of(nodes[i].pointer);

        while i > 0 && mc.is_deleted(&current) {
            let parent_ptr = nodes[i - 1].pointer;
            let parent_original = uc.original_of(parent_ptr);
            let name = nodes[i].name.clone();
            let parent_block = self.store.fetch_dir_block(self.cancel, parent_ptr).await?;
            let entry_type = parent_block
                .get(&name)
                .map(|e| e.entry_type)
                .ok_or_else(|| PathError::EntryNotFound {
                    name: name.clone(),
                    dir: parent_ptr,
                })?;

            suffix.push(PathNode {
                name: name.clone(),
                pointer: current,
            });
            let mut common = OpCommon::new(writer.clone());
            common.refs.push(current);
            recreates.push(PendingRecreate {
                op: CreateOp {
                    name,
                    dir: BlockUpdate::unchanged(parent_original),
                    entry_type,
                    node: current,
                    renamed: false,
                    common,
                },
                parent_original,
                unmerged_parent: Path::from_nodes(nodes[..i].to_vec()),
                leaf_index: suffix.len() - 1,
            });
            i -= 1;
            current = parent_original;
        }

        let start = loop {
            if let Some(most_recent) = mc.most_recent_from_original(&current) {
                break most_recent;
            }
            if i == 0 {
                // The merged branch never touched the root.
                break current;
            }
            if uc.renamed(&current).is_some() {
                // Only this branch moved it, so the merged tree still holds
                // it under its unchanged pointer.
                break current;
            }
            if let Some(info) = mc.renamed(&current) {
                suffix.push(PathNode {
                    name: info.new_name.clone(),
                    pointer: current,
                });
                let parent = info.original_new_parent;
                break mc
                    .most_recent_from_original(&parent)
                    .ok_or(ChainError::NoChainFound(parent))?;
            }
            suffix.push(PathNode {
                name: nodes[i].name.clone(),
                pointer: current,
            });
            i -= 1;
            current = uc.original_of(nodes[i].pointer);
        };

        suffix.reverse();
        Ok(MergedTail {
            start,
            suffix,
            recreates,
        })
    }
}

fn extend(base: &Path, suffix: &[PathNode]) -> Path {
    let mut nodes = base.nodes.clone();
    nodes.extend(suffix.iter().cloned());
    Path::from_nodes(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use crate::chains::BranchHead;
    use crate::errors::FetchError;
    use crate::memory::MemoryFolder;
    use crate::model::DirBlock;
    use crate::source::RevisionSource;

    fn alice() -> WriterInfo {
        WriterInfo::new("alice", Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap())
    }

    fn bob() -> WriterInfo {
        WriterInfo::new("bob", Utc.with_ymd_and_hms(2026, 3, 1, 10, 30, 0).unwrap())
    }

    /// Serves blocks from a folder and node paths from a fixed map.
    struct FixedCache<'a> {
        folder: &'a MemoryFolder,
        paths: HashMap<BlockPointer, Path>,
    }

    impl BlockSource for FixedCache<'_> {
        async fn fetch_dir_block(
            &self,
            cancel: &CancellationToken,
            ptr: BlockPointer,
        ) -> Result<Arc<DirBlock>, FetchError> {
            self.folder.fetch_dir_block(cancel, ptr).await
        }

        async fn fetch_dir_block_copy(
            &self,
            cancel: &CancellationToken,
            ptr: BlockPointer,
        ) -> Result<DirBlock, FetchError> {
            self.folder.fetch_dir_block_copy(cancel, ptr).await
        }
    }

    impl NodeCache for FixedCache<'_> {
        fn path_for(&self, ptr: &BlockPointer) -> Option<Path> {
            self.paths.get(ptr).cloned()
        }

        fn repoint(&self, _moves: &[BlockUpdate]) {}
    }

    async fn branch_chains(folder: &MemoryFolder) -> (CrChains, CrChains, BlockPointer) {
        let cancel = CancellationToken::new();
        let branch = folder.unmerged_branch().unwrap();
        let unmerged = folder.unmerged_revisions(&cancel, &branch).await.unwrap();
        let merged = folder
            .merged_revisions(&cancel, unmerged[0].prev)
            .await
            .unwrap();
        let head = folder.merged_head();
        let uc = CrChains::build(&unmerged).unwrap();
        let mc = if merged.is_empty() {
            CrChains::empty(BranchHead {
                revision: head.revision,
                root: head.root,
            })
        } else {
            CrChains::build(&merged).unwrap()
        };
        (uc, mc, head.root)
    }

    fn path_of<'p>(paths: &'p [Path], ptr: &BlockPointer) -> Vec<&'p Path> {
        paths.iter().filter(|p| p.tail_pointer() == *ptr).collect()
    }

    #[tokio::test]
    async fn test_chain_deleted_by_own_branch_is_dropped() {
        let folder = MemoryFolder::new(alice());
        folder
            .write_merged(alice(), |w| {
                w.create_file("f", "base")?;
                w.create_file("g", "base")?;
                Ok(())
            })
            .unwrap();
        let file = folder.merged_tree().unwrap()["/f"].pointer;
        folder
            .write_unmerged(bob(), |w| w.write_file("f", "edited").map(|_| ()))
            .unwrap();
        folder.write_unmerged(bob(), |w| w.remove("f")).unwrap();

        let (mut uc, _, _) = branch_chains(&folder).await;
        assert!(uc.is_deleted(&file));
        let cancel = CancellationToken::new();
        let paths = PathResolver::new(&folder, &cancel)
            .unmerged_paths(&mut uc)
            .await
            .unwrap();

        // Only the root, which holds the removal, still needs a path.
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].tail_pointer(), folder.unmerged_head().unwrap().root);
        assert!(paths.iter().all(|p| p.tail_name() != "f"));
    }

    #[tokio::test]
    async fn test_moved_then_edited_node_has_one_path() {
        let folder = MemoryFolder::new(alice());
        folder
            .write_merged(alice(), |w| {
                w.mkdir("a")?;
                w.mkdir("b")?;
                w.create_file("a/f", "base")?;
                Ok(())
            })
            .unwrap();
        let file = folder.merged_tree().unwrap()["/a/f"].pointer;
        folder
            .write_unmerged(bob(), |w| w.rename("a/f", "b/g"))
            .unwrap();
        folder
            .write_unmerged(bob(), |w| w.write_file("b/g", "moved").map(|_| ()))
            .unwrap();

        let (mut uc, _, _) = branch_chains(&folder).await;
        let most_recent = uc.by_original(&file).unwrap().most_recent;
        let cancel = CancellationToken::new();
        let paths = PathResolver::new(&folder, &cancel)
            .unmerged_paths(&mut uc)
            .await
            .unwrap();

        let matches = path_of(&paths, &most_recent);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].to_string(), "/b/g");
        assert!(paths.iter().all(|p| p.to_string() != "/a/f"));
        // Longest first.
        assert!(paths.windows(2).all(|w| w[0].len() >= w[1].len()));
    }

    #[tokio::test]
    async fn test_cached_path_is_used_without_search() {
        let folder = MemoryFolder::new(alice());
        folder
            .write_merged(alice(), |w| w.create_file("f", "base").map(|_| ()))
            .unwrap();
        folder
            .write_unmerged(bob(), |w| w.write_file("f", "edited").map(|_| ()))
            .unwrap();
        let written = folder.unmerged_tree().unwrap()["/f"].pointer;
        let root = folder.unmerged_head().unwrap().root;

        // A cached entry is trusted as-is, so its name shows which source
        // answered.
        let cached = Path::root(root).child("alias", written);
        let cache = FixedCache {
            folder: &folder,
            paths: HashMap::from([(written, cached.clone())]),
        };
        let (mut uc, _, _) = branch_chains(&folder).await;
        let cancel = CancellationToken::new();
        let paths = PathResolver::new(&cache, &cancel)
            .unmerged_paths(&mut uc)
            .await
            .unwrap();
        assert_eq!(path_of(&paths, &written), vec![&cached]);
    }

    #[tokio::test]
    async fn test_unusable_cached_paths_fall_back_to_search() {
        let folder = MemoryFolder::new(alice());
        folder
            .write_merged(alice(), |w| {
                w.create_file("f", "base")?;
                w.create_file("g", "base")?;
                Ok(())
            })
            .unwrap();
        folder
            .write_unmerged(bob(), |w| {
                w.write_file("f", "edited")?;
                w.write_file("g", "edited")?;
                Ok(())
            })
            .unwrap();
        let tree = folder.unmerged_tree().unwrap();
        let (f, g) = (tree["/f"].pointer, tree["/g"].pointer);
        let merged_root = folder.merged_head().root;

        let cache = FixedCache {
            folder: &folder,
            paths: HashMap::from([
                (f, Path::from_nodes(Vec::new())),
                (g, Path::root(merged_root).child("g", g)),
            ]),
        };
        let (mut uc, _, _) = branch_chains(&folder).await;
        let cancel = CancellationToken::new();
        let paths = PathResolver::new(&cache, &cancel)
            .unmerged_paths(&mut uc)
            .await
            .unwrap();

        let root = folder.unmerged_head().unwrap().root;
        assert_eq!(path_of(&paths, &f)[0], &Path::root(root).child("f", f));
        assert_eq!(path_of(&paths, &g)[0], &Path::root(root).child("g", g));
    }

    #[tokio::test]
    async fn test_recreates_every_deleted_level() {
        let folder = MemoryFolder::new(alice());
        folder
            .write_merged(alice(), |w| {
                w.mkdir("a")?;
                w.mkdir("a/b")?;
                w.create_file("a/b/f", "base")?;
                Ok(())
            })
            .unwrap();
        // Creating children rewrites their parents, so read the final
        // pointers back from the tree.
        let tree = folder.merged_tree().unwrap();
        let originals: Vec<BlockPointer> =
            ["/a", "/a/b", "/a/b/f"].iter().map(|p| tree[*p].pointer).collect();
        folder
            .write_unmerged(bob(), |w| w.write_file("a/b/f", "edited").map(|_| ()))
            .unwrap();
        folder.write_merged(alice(), |w| w.remove("a")).unwrap();

        let (mut uc, mut mc, merged_root) = branch_chains(&folder).await;
        let file_tail = uc.by_original(&originals[2]).unwrap().most_recent;
        let cancel = CancellationToken::new();
        let resolved = PathResolver::new(&folder, &cancel)
            .resolve(&mut uc, &mut mc, merged_root, &bob())
            .await
            .unwrap();

        let names: Vec<&str> = resolved.recreate_ops.iter().map(|op| op.name.as_str()).collect();
        assert_eq!(names, vec!["f", "b", "a"]);
        assert_eq!(resolved.recreated, originals.iter().copied().collect::<HashSet<_>>());
        assert!(resolved
            .recreate_ops
            .iter()
            .all(|op| op.common.writer.writer == "bob"));

        let pair = &resolved.pairs[&file_tail];
        assert_eq!(pair.unmerged.to_string(), "/a/b/f");
        assert_eq!(pair.merged.to_string(), "/a/b/f");
        assert_eq!(pair.merged.nodes[0].pointer, merged_root);
        // Parents of every recreated level get a pair of their own.
        assert_eq!(resolved.pairs.len(), 4);

        // Only the top-level removal was a merged op, and it is undone.
        let base_root = uc.original_of(folder.unmerged_head().unwrap().root);
        assert_eq!(
            resolved.suppressed_merged,
            HashSet::from([(base_root, "a".to_string())])
        );
        assert!(mc
            .chains_with_ops()
            .all(|c| c.ops.iter().all(|op| !matches!(op, Op::Rm(_)))));
    }
}
