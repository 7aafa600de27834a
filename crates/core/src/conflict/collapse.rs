//! Collapsing superseded actions.
//!
//! Several unmerged ops on one name can each produce an action for the same
//! merged directory entry. Only the strongest survives:
//! rename-unmerged, then copy-entry, then copy-attr (whose attribute sets
//! are unioned). Merged-side renames are keyed under a reserved prefix so
//! they never compete with unmerged actions on the same name.

use std::collections::HashMap;

use tracing::trace;

use crate::conflict::action::CrAction;

/// Keeps the highest-precedence action per name.
#[derive(Debug, Clone)]
pub struct ActionCollapser {
    merged_prefix: String,
}

impl ActionCollapser {
    pub fn new(merged_prefix: impl Into<String>) -> Self {
        Self {
            merged_prefix: merged_prefix.into(),
        }
    }

    fn key(&self, action: &CrAction) -> Option<String> {
        match action {
            CrAction::CopyEntry { to, .. } | CrAction::CopyAttr { to, .. } => Some(to.clone()),
            CrAction::RenameUnmerged { from, .. } => Some(from.clone()),
            CrAction::RenameMerged { from, .. } => Some(format!("{}{}", self.merged_prefix, from)),
            CrAction::RemoveEntry { .. } | CrAction::DropUnmerged { .. } => None,
        }
    }

    /// One pass over `actions`. Survivors keep the position of the first
    /// action seen for their name; unkeyed actions keep their order.
    pub fn collapse(&self, actions: Vec<CrAction>) -> Vec<CrAction> {
        let before = actions.len();
        let mut out: Vec<CrAction> = Vec::with_capacity(actions.len());
        let mut slots: HashMap<String, usize> = HashMap::new();

        for action in actions {
            let Some(key) = self.key(&action) else {
                out.push(action);
                continue;
            };
            let Some(&slot) = slots.get(&key) else {
                slots.insert(key, out.len());
                out.push(action);
                continue;
            };
            let existing = &mut out[slot];
            match (existing, action) {
                (
                    CrAction::CopyAttr { attrs, .. },
                    CrAction::CopyAttr {
                        attrs: more_attrs, ..
                    },
                ) => attrs.extend(more_attrs),
                (existing, action) => {
                    if precedence(&action) > precedence(existing) {
                        *existing = action;
                    }
                }
            }
        }
        trace!(before, after = out.len(), "collapsed actions");
        out
    }
}

fn precedence(action: &CrAction) -> u8 {
    match action {
        CrAction::RenameUnmerged { .. } => 3,
        CrAction::CopyEntry { .. } => 2,
        CrAction::CopyAttr { .. } => 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Attr;
    use std::collections::BTreeSet;

    fn collapser() -> ActionCollapser {
        ActionCollapser::new(".merged_")
    }

    fn copy(name: &str) -> CrAction {
        CrAction::CopyEntry {
            from: name.into(),
            to: name.into(),
        }
    }

    fn attr(name: &str, attrs: &[Attr]) -> CrAction {
        CrAction::CopyAttr {
            from: name.into(),
            to: name.into(),
            attrs: attrs.iter().copied().collect(),
        }
    }

    #[test]
    fn test_rename_beats_copy() {
        let rename = CrAction::RenameUnmerged {
            from: "f".into(),
            to: "f.conflict".into(),
        };
        let out = collapser().collapse(vec![copy("f"), attr("f", &[Attr::Mtime]), rename.clone()]);
        assert_eq!(out, vec![rename]);
    }

    #[test]
    fn test_copy_beats_attr() {
        let out = collapser().collapse(vec![attr("f", &[Attr::Exec]), copy("f")]);
        assert_eq!(out, vec![copy("f")]);
    }

    #[test]
    fn test_attrs_union() {
        let out = collapser().collapse(vec![attr("f", &[Attr::Exec]), attr("f", &[Attr::Mtime])]);
        let expected: BTreeSet<Attr> = [Attr::Exec, Attr::Mtime].into_iter().collect();
        assert!(matches!(&out[..], [CrAction::CopyAttr { attrs, .. }] if *attrs == expected));
    }

    #[test]
    fn test_merged_rename_separate_key() {
        let merged = CrAction::RenameMerged {
            from: "x".into(),
            to: "x.conflict".into(),
        };
        let out = collapser().collapse(vec![merged.clone(), copy("x")]);
        assert_eq!(out, vec![merged, copy("x")]);
    }

    #[test]
    fn test_unkeyed_actions_keep_order() {
        let rm = CrAction::RemoveEntry { name: "a".into() };
        let out = collapser().collapse(vec![rm.clone(), copy("a"), copy("b"), copy("a")]);
        assert_eq!(out, vec![rm, copy("a"), copy("b")]);
    }
}
