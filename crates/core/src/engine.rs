//! One conflict-resolution attempt.
//!
//! The [`ResolutionEngine`] runs the phases of a single attempt in order:
//!
//! 1. Fetch the unmerged branch and the merged revisions past its branch point.
//! 2. Build per-node op chains for both branches.
//! 3. Resolve unmerged and merged paths, synthesizing directory recreations.
//! 4. Drop unmerged renames the merged layout cannot absorb.
//! 5. Compute and collapse reconciling actions per merged directory.
//! 6. Execute them on private block copies.
//! 7. Commit one merged revision and repoint the node cache.
//!
//! The cancellation token is checked at every phase boundary; nothing is
//! visible to readers until the single commit in step 7.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::chains::{BranchHead, CrChains};
use crate::config::ResolverConfig;
use crate::conflict::{
    drop_conflicting_renames, ActionCollapser, ActionComputer, ConflictRenamer, WriterDateRenamer,
};
use crate::errors::ResolveError;
use crate::executor::{ExecutionPlan, Executor};
use crate::model::{Branch, BranchId, ConflictInput, Path, Revision, RevisionData, WriterInfo};
use crate::ops::Op;
use crate::paths::{PathPair, PathResolver, TreeIndex};
use crate::source::{FolderStore, MergedCommit};

// ---------------------------------------------------------------------------
// Fetched input
// ---------------------------------------------------------------------------

/// Revisions fetched at the start of an attempt.
#[derive(Debug, Clone, Default)]
pub struct FetchedRevisions {
    pub unmerged: Vec<RevisionData>,
    /// Merged revisions after the branch point, oldest first.
    pub merged: Vec<RevisionData>,
    /// The merged head: the last of `merged`, or the branch point itself.
    pub merged_head: Option<RevisionData>,
}

impl FetchedRevisions {
    /// The `(unmerged, merged)` heads this fetch observed, or `None` when
    /// the branch has no revisions.
    pub fn observed(&self) -> Option<ConflictInput> {
        let unmerged = self.unmerged.last()?.revision;
        let merged = self.merged_head.as_ref()?.revision;
        Some(ConflictInput::new(unmerged, merged))
    }
}

/// What one completed attempt did.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionReport {
    pub request_id: Uuid,
    pub branch: Option<BranchId>,
    /// Heads the attempt resolved.
    pub observed: Option<ConflictInput>,
    /// The committed merged revision; `None` when there was nothing to do.
    pub committed: Option<Revision>,
    pub summary: Vec<String>,
    /// Ops local observers replay to reach the resolved state.
    pub notifications: Vec<Op>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs resolution attempts against one folder.
pub struct ResolutionEngine<S> {
    store: Arc<S>,
    config: ResolverConfig,
    renamer: Arc<dyn ConflictRenamer>,
    /// Name recorded on resolved revisions and synthetic ops.
    writer: String,
}

impl<S: FolderStore> ResolutionEngine<S> {
    pub fn new(store: Arc<S>, config: ResolverConfig, writer: impl Into<String>) -> Self {
        let renamer = Arc::new(WriterDateRenamer::new(config.conflict_separator.clone()));
        Self {
            store,
            config,
            renamer,
            writer: writer.into(),
        }
    }

    /// Replace the default conflict renamer.
    pub fn with_renamer(mut self, renamer: Arc<dyn ConflictRenamer>) -> Self {
        self.renamer = renamer;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Fetch the unmerged branch and every merged revision after its
    /// branch point.
    pub async fn fetch(
        &self,
        cancel: &CancellationToken,
        branch: &BranchId,
    ) -> Result<FetchedRevisions, ResolveError> {
        cancel.check()?;
        let unmerged = self.store.unmerged_revisions(cancel, branch).await?;
        let Some(first) = unmerged.first() else {
            return Ok(FetchedRevisions::default());
        };
        let branch_point = first.prev;
        let merged = self.store.merged_revisions(cancel, branch_point).await?;
        let merged_head = match merged.last() {
            Some(head) => head.clone(),
            None => self.store.merged_revision(cancel, branch_point).await?,
        };
        debug!(
            unmerged = unmerged.len(),
            merged = merged.len(),
            branch_point = %branch_point,
            "fetched revisions"
        );
        Ok(FetchedRevisions {
            unmerged,
            merged,
            merged_head: Some(merged_head),
        })
    }

    /// Resolve `fetched` and commit the result.
    pub async fn resolve(
        &self,
        cancel: &CancellationToken,
        request_id: Uuid,
        branch: &BranchId,
        fetched: FetchedRevisions,
    ) -> Result<ResolutionReport, ResolveError> {
        let observed = fetched.observed();
        let mut report = ResolutionReport {
            request_id,
            branch: Some(branch.clone()),
            observed,
            committed: None,
            summary: Vec::new(),
            notifications: Vec::new(),
        };
        let (Some(unmerged_head), Some(merged_head)) =
            (fetched.unmerged.last(), fetched.merged_head.as_ref())
        else {
            info!("no unmerged revisions, nothing to resolve");
            return Ok(report);
        };

        cancel.check()?;
        debug!("building chains");
        let mut uc = CrChains::build(&fetched.unmerged)?;
        let mut mc = if fetched.merged.is_empty() {
            CrChains::empty(BranchHead {
                revision: merged_head.revision,
                root: merged_head.root,
            })
        } else {
            CrChains::build(&fetched.merged)?
        };

        cancel.check()?;
        debug!("resolving paths");
        let writer = WriterInfo::new(self.writer.clone(), Utc::now());
        let resolver = PathResolver::new(self.store.as_ref(), cancel);
        let paths = resolver
            .resolve(&mut uc, &mut mc, merged_head.root, &writer)
            .await?;

        cancel.check()?;
        let (merged_index, dropped) = if uc.renamed_originals().next().is_some() {
            let merged_index = TreeIndex::build(self.store.as_ref(), cancel, merged_head.root).await?;
            let unmerged_index =
                TreeIndex::build(self.store.as_ref(), cancel, unmerged_head.root).await?;
            let dropped = drop_conflicting_renames(&mut uc, &mc, &merged_index, &unmerged_index);
            (Some(merged_index), dropped)
        } else {
            (None, Vec::new())
        };

        debug!("computing actions");
        let roots = PathPair {
            unmerged: Path::root(unmerged_head.root),
            merged: Path::root(merged_head.root),
        };
        let computer = ActionComputer::new(&uc, &mc, self.renamer.as_ref());
        let mut dirs = computer.compute(&paths, &dropped, &roots);
        let collapser = ActionCollapser::new(self.config.merged_prefix.clone());
        for dir in &mut dirs {
            dir.actions = collapser.collapse(std::mem::take(&mut dir.actions));
        }

        cancel.check()?;
        debug!(dirs = dirs.len(), "executing actions");
        let plan = ExecutionPlan {
            unmerged: &uc,
            merged: &mc,
            paths: &paths,
            dirs: &dirs,
            merged_index: merged_index.as_ref(),
            merged_root: merged_head.root,
        };
        let execution = Executor::new(
            self.store.as_ref(),
            cancel,
            &writer,
            self.config.max_unique_name_attempts,
        )
        .execute(&plan)
        .await?;

        let mut notifications = execution.notifications;
        for revision in &fetched.merged {
            for op in &revision.ops {
                if let Op::Rm(rm) = op {
                    let key = (mc.original_of(rm.dir.old), rm.name.clone());
                    if paths.suppressed_merged.contains(&key) {
                        continue;
                    }
                }
                notifications.push(op.clone());
            }
        }

        cancel.check()?;
        let commit = MergedCommit {
            revision: RevisionData {
                revision: merged_head.revision.next(),
                branch: Branch::Merged,
                prev: merged_head.revision,
                root: execution.root,
                writer,
                ops: execution.ops,
            },
            block_changes: execution.block_changes,
            resolved_branch: branch.clone(),
            resolved_through: unmerged_head.revision,
        };
        let committed = self.store.put_merged_revision(cancel, commit).await?;
        self.store.repoint(&execution.repoints);

        let touched: HashSet<&str> = execution
            .summary
            .iter()
            .filter_map(|line| line.split(": ").next())
            .collect();
        info!(
            revision = %committed,
            actions = execution.summary.len(),
            dirs = touched.len(),
            notifications = notifications.len(),
            "committed resolution"
        );
        report.committed = Some(committed);
        report.summary = execution.summary;
        report.notifications = notifications;
        Ok(report)
    }
}
