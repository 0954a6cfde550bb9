//! Previewed changes.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::graph::ResourceKind;

use super::diff::ChangeAction;

/// What an apply would do, in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeSet {
    /// When the preview was computed.
    pub created_at: DateTime<Utc>,
    /// Fingerprint of the plan it was computed from.
    pub plan_hash: String,
    changes: Vec<PlannedChange>,
}

/// One resource in a preview.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedChange {
    /// Logical name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Cloud-side name.
    pub physical_name: String,
    /// What happens to it.
    pub action: ChangeAction,
    /// Why.
    pub reason: String,
}

impl ChangeSet {
    /// Wraps ordered changes.
    #[must_use]
    pub fn new(plan_hash: String, changes: Vec<PlannedChange>) -> Self {
        Self {
            created_at: Utc::now(),
            plan_hash,
            changes,
        }
    }

    /// Every resource, including unchanged ones.
    #[must_use]
    pub fn changes(&self) -> &[PlannedChange] {
        &self.changes
    }

    /// Only the resources an apply would touch.
    pub fn actionable(&self) -> impl Iterator<Item = &PlannedChange> {
        self.changes
            .iter()
            .filter(|c| c.action != ChangeAction::NoChange)
    }

    /// Number of resources with the given action.
    #[must_use]
    pub fn count(&self, action: ChangeAction) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }

    /// Returns true if an apply would call the backend for anything other
    /// than existence checks.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actionable().next().is_some()
    }

    /// One-line summary, e.g. `2 to create, 1 to update, 0 to delete`.
    #[must_use]
    pub fn summary(&self) -> String {
        let updates = self.count(ChangeAction::Update) + self.count(ChangeAction::Pending);
        let mut summary = format!(
            "{} to create, {updates} to update, {} to delete",
            self.count(ChangeAction::Create),
            self.count(ChangeAction::Delete)
        );
        let replaces = self.count(ChangeAction::Replace);
        if replaces > 0 {
            summary.push_str(&format!(", {replaces} to replace"));
        }
        summary
    }
}

impl std::fmt::Display for PlannedChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.action, self.name, self.kind)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan: {}", self.summary())?;
        for (i, change) in self.actionable().enumerate() {
            writeln!(f, "  {i}. {change}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(name: &str, action: ChangeAction) -> PlannedChange {
        PlannedChange {
            name: name.to_string(),
            kind: ResourceKind::SecurityGroup,
            physical_name: format!("tasks-dev-{name}"),
            action,
            reason: String::new(),
        }
    }

    #[test]
    fn test_summary_counts_pending_as_updates() {
        let set = ChangeSet::new(
            String::from("h"),
            vec![
                change("a", ChangeAction::Create),
                change("b", ChangeAction::Update),
                change("c", ChangeAction::Pending),
                change("d", ChangeAction::NoChange),
                change("e", ChangeAction::Replace),
            ],
        );
        assert_eq!(
            set.summary(),
            "1 to create, 2 to update, 0 to delete, 1 to replace"
        );
        assert_eq!(set.actionable().count(), 4);
    }

    #[test]
    fn test_no_changes_display() {
        let set = ChangeSet::new(String::from("h"), vec![change("a", ChangeAction::NoChange)]);
        assert!(!set.has_changes());
        assert_eq!(set.to_string(), "No changes required");
    }
}
