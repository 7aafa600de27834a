//! TOML scenarios: a base tree plus the two divergent branches.
//!
//! A scenario lists revisions for three phases. `base` revisions are
//! committed to the merged history first, then `unmerged` revisions fork
//! the local branch from the base, then `merged` revisions model other
//! devices committing concurrently.
//!
//! ```toml
//! [writers]
//! merged = "alice"
//! unmerged = "bob"
//!
//! [[base]]
//! steps = [{ op = "mkdir", path = "docs" }]
//!
//! [[unmerged]]
//! steps = [{ op = "create", path = "docs/a.txt", contents = "local" }]
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use foldermerge_core::errors::FolderError;
use foldermerge_core::memory::TreeWriter;
use foldermerge_core::{MemoryFolder, WriterInfo};

// ---------------------------------------------------------------------------
// Scenario model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub writers: Writers,
    #[serde(default)]
    pub base: Vec<RevisionSteps>,
    #[serde(default)]
    pub unmerged: Vec<RevisionSteps>,
    #[serde(default)]
    pub merged: Vec<RevisionSteps>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Writers {
    #[serde(default = "default_merged_writer")]
    pub merged: String,
    #[serde(default = "default_unmerged_writer")]
    pub unmerged: String,
}

impl Default for Writers {
    fn default() -> Self {
        Self {
            merged: default_merged_writer(),
            unmerged: default_unmerged_writer(),
        }
    }
}

fn default_merged_writer() -> String {
    "remote".into()
}

fn default_unmerged_writer() -> String {
    "local".into()
}

/// One revision's worth of steps.
#[derive(Debug, Clone, Deserialize)]
pub struct RevisionSteps {
    /// Revision timestamp; defaults to the time the scenario is applied.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Mkdir { path: String },
    Create { path: String, #[serde(default)] contents: String },
    Write { path: String, contents: String },
    Rm { path: String },
    Rename { from: String, to: String },
    Chmod { path: String, exec: bool },
    Touch { path: String, mtime: DateTime<Utc> },
}

impl Step {
    fn apply(&self, w: &mut TreeWriter<'_>) -> Result<(), FolderError> {
        match self {
            Step::Mkdir { path } => w.mkdir(path).map(|_| ()),
            Step::Create { path, contents } => w.create_file(path, contents.as_bytes()).map(|_| ()),
            Step::Write { path, contents } => w.write_file(path, contents.as_bytes()).map(|_| ()),
            Step::Rm { path } => w.remove(path),
            Step::Rename { from, to } => w.rename(from, to),
            Step::Chmod { path, exec } => w.set_exec(path, *exec),
            Step::Touch { path, mtime } => w.set_mtime(path, *mtime),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and applying
// ---------------------------------------------------------------------------

impl Scenario {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("failed to parse scenario {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Build a folder holding the base tree, the unmerged branch and the
    /// concurrent merged revisions.
    pub fn build_folder(&self) -> Result<MemoryFolder> {
        let folder = MemoryFolder::new(WriterInfo::new(&self.writers.merged, Utc::now()));
        for (i, rev) in self.base.iter().enumerate() {
            apply_revision(&folder, &self.writers.merged, rev, false)
                .with_context(|| format!("base revision {} failed", i + 1))?;
        }
        if !self.unmerged.is_empty() {
            folder.begin_unmerged_branch();
        }
        for (i, rev) in self.unmerged.iter().enumerate() {
            apply_revision(&folder, &self.writers.unmerged, rev, true)
                .with_context(|| format!("unmerged revision {} failed", i + 1))?;
        }
        for (i, rev) in self.merged.iter().enumerate() {
            apply_revision(&folder, &self.writers.merged, rev, false)
                .with_context(|| format!("merged revision {} failed", i + 1))?;
        }
        info!(
            base = self.base.len(),
            unmerged = self.unmerged.len(),
            merged = self.merged.len(),
            "scenario applied"
        );
        Ok(folder)
    }
}

fn apply_revision(
    folder: &MemoryFolder,
    writer: &str,
    rev: &RevisionSteps,
    unmerged: bool,
) -> Result<(), FolderError> {
    let writer = WriterInfo::new(writer, rev.at.unwrap_or_else(Utc::now));
    let apply = |w: &mut TreeWriter<'_>| -> Result<(), FolderError> {
        for step in &rev.steps {
            debug!(?step, unmerged, "applying step");
            step.apply(w)?;
        }
        Ok(())
    };
    if unmerged {
        folder.write_unmerged(writer, apply)?;
    } else {
        folder.write_merged(writer, apply)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = include_str!("../scenarios/rename_cycle.toml");

    #[test]
    fn test_parse_sample_scenario() {
        let scenario = Scenario::from_toml(SAMPLE).expect("failed to parse scenario");
        assert_eq!(scenario.writers.merged, "alice");
        assert_eq!(scenario.writers.unmerged, "bob");
        assert_eq!(scenario.base.len(), 1);
        assert!(matches!(
            &scenario.unmerged[0].steps[0],
            Step::Rename { from, to } if from == "dirA" && to == "dirB/dirA"
        ));
    }

    #[test]
    fn test_build_folder_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(SAMPLE.as_bytes()).unwrap();
        let scenario = Scenario::load_from_file(tmp.path()).expect("load failed");

        let folder = scenario.build_folder().unwrap();
        assert!(folder.unmerged_branch().is_some());
        assert_eq!(folder.merged_revision_count(), 3);
        let unmerged = folder.unmerged_tree().unwrap();
        assert!(unmerged.contains_key("/dirB/dirA"));
        let merged = folder.merged_tree().unwrap();
        assert!(merged.contains_key("/dirA/dirB"));
    }

    #[test]
    fn test_default_writers() {
        let scenario = Scenario::from_toml("[[base]]\nsteps = [{ op = \"mkdir\", path = \"a\" }]\n")
            .unwrap();
        assert_eq!(scenario.writers.merged, "remote");
        assert_eq!(scenario.writers.unmerged, "local");
        assert!(scenario.unmerged.is_empty());
    }

    #[test]
    fn test_failing_step_reports_revision() {
        let scenario = Scenario::from_toml(
            "[[unmerged]]\nsteps = [{ op = \"rm\", path = \"missing\" }]\n",
        )
        .unwrap();
        let err = scenario.build_folder().unwrap_err();
        assert!(format!("{err:#}").contains("unmerged revision 1"));
    }

    #[test]
    fn test_unknown_op_rejected() {
        let result = Scenario::from_toml("[[base]]\nsteps = [{ op = \"explode\", path = \"a\" }]\n");
        assert!(result.is_err());
    }
}
