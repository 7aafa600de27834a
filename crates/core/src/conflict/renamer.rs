//! Conflict-suffix naming.
//!
//! When both branches claim one name, the losing entry is kept under a
//! suffixed name. The format is owned by a [`ConflictRenamer`] so the
//! filesystem layer can choose it; [`WriterDateRenamer`] is the default.

use chrono::SecondsFormat;

use crate::model::WriterInfo;

/// Produces the name a conflicting entry is kept under.
pub trait ConflictRenamer: Send + Sync {
    /// Name for the losing copy of `name`, written by `writer`.
    fn conflict_name(&self, name: &str, writer: &WriterInfo) -> String;
}

/// Formats `base.<separator>.<writer>.<time><ext>`.
#[derive(Debug, Clone)]
pub struct WriterDateRenamer {
    separator: String,
}

impl WriterDateRenamer {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }
}

impl Default for WriterDateRenamer {
    fn default() -> Self {
        Self::new("conflict")
    }
}

impl ConflictRenamer for WriterDateRenamer {
    fn conflict_name(&self, name: &str, writer: &WriterInfo) -> String {
        let (base, ext) = split_extension(name);
        format!(
            "{}.{}.{}.{}{}",
            base,
            self.separator,
            writer.writer,
            writer.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            ext
        )
    }
}

/// Split `name` into base and extension (with its dot). Leading dots do not
/// start an extension, so `.profile` has none.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx < name.len() - 1 => name.split_at(idx),
        _ => (name, ""),
    }
}

/// Candidate name number `n` for a unique copy: `base (n).ext`.
pub fn numbered_name(name: &str, n: usize) -> String {
    let (base, ext) = split_extension(name);
    format!("{base} ({n}){ext}")
}
