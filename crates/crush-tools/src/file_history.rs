// SPDX-License-Identifier: MIT
//! C2 — File History: append-only per-session versioned snapshots of edited
//! files, the basis of the diff metadata the edit/write tools surface to the
//! model and the UI. In-process only (per gateway instance), mirroring the
//! `DashMap`-per-key fanout `crush_gateway::Bus` uses for C6.

use std::sync::Arc;

use dashmap::DashMap;
use similar::{ChangeTag, TextDiff};

/// One recorded version of a file at a point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub content: Arc<str>,
}

/// Line-level diff summary between two versions, surfaced to the model as
/// tool-result metadata and to the UI as the basis of a rendered diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffMetadata {
    pub old_content: String,
    pub new_content: String,
    pub additions: usize,
    pub removals: usize,
}

impl DiffMetadata {
    fn compute(old: &str, new: &str) -> Self {
        let diff = TextDiff::from_lines(old, new);
        let mut additions = 0;
        let mut removals = 0;
        for change in diff.iter_all_changes() {
            match change.tag() {
                ChangeTag::Insert => additions += 1,
                ChangeTag::Delete => removals += 1,
                ChangeTag::Equal => {}
            }
        }
        Self { old_content: old.to_string(), new_content: new.to_string(), additions, removals }
    }
}

/// Per-session, per-path version history.
///
/// Invariants (SPEC_FULL.md §4.2): no two consecutive versions have the same
/// content; a baseline is written at most once per `(session, path)`.
#[derive(Clone, Default)]
pub struct FileHistory {
    versions: DashMap<(String, String), Vec<Snapshot>>,
}

impl FileHistory {
    pub fn new() -> Self {
        Self { versions: DashMap::new() }
    }

    /// Record `content` as the baseline for `(session_id, path)` if no
    /// version has been recorded yet. No-op otherwise — a baseline is
    /// written at most once.
    pub fn ensure_baseline(&self, session_id: &str, path: &str, content: &str) {
        let key = (session_id.to_string(), path.to_string());
        self.versions.entry(key).or_insert_with(|| vec![Snapshot { content: Arc::from(content) }]);
    }

    /// Append a new version and return the diff against the previous one.
    /// Skipped (returns `None`) if `content` is identical to the latest
    /// recorded version — consecutive duplicate versions are never stored.
    pub fn append_version(&self, session_id: &str, path: &str, content: &str) -> Option<DiffMetadata> {
        let key = (session_id.to_string(), path.to_string());
        let mut entry = self.versions.entry(key).or_default();
        let previous = entry.last().map(|s| s.content.to_string()).unwrap_or_default();
        if previous == content {
            return None;
        }
        let metadata = DiffMetadata::compute(&previous, content);
        entry.push(Snapshot { content: Arc::from(content) });
        Some(metadata)
    }

    /// Latest recorded content for `(session_id, path)`, if any.
    pub fn latest_of(&self, session_id: &str, path: &str) -> Option<Arc<str>> {
        self.versions.get(&(session_id.to_string(), path.to_string())).and_then(|v| v.last().map(|s| s.content.clone()))
    }

    /// Number of versions recorded for `(session_id, path)`. Used by tests
    /// to assert the baseline-at-most-once invariant.
    pub fn version_count(&self, session_id: &str, path: &str) -> usize {
        self.versions.get(&(session_id.to_string(), path.to_string())).map(|v| v.len()).unwrap_or(0)
    }

    /// Reconcile recorded history with the content actually sitting in the
    /// sandbox right now, before a tool's own write proceeds. SPEC_FULL.md
    /// §4.2: if nothing has been recorded yet, `sandbox_content` becomes the
    /// baseline; if a version exists but drifted from what the sandbox holds
    /// (an edit made outside this history — e.g. a prior crashed write, or a
    /// change applied directly in the sandbox), an intermediate version is
    /// recorded so the diff the tool computes next is against reality rather
    /// than a stale baseline.
    pub fn sync_with_sandbox(&self, session_id: &str, path: &str, sandbox_content: &str) {
        match self.latest_of(session_id, path) {
            None => self.ensure_baseline(session_id, path, sandbox_content),
            Some(latest) if latest.as_ref() != sandbox_content => {
                self.append_version(session_id, path, sandbox_content);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_is_written_at_most_once() {
        let h = FileHistory::new();
        h.ensure_baseline("s1", "/a.txt", "one");
        h.ensure_baseline("s1", "/a.txt", "two");
        assert_eq!(h.version_count("s1", "/a.txt"), 1);
        assert_eq!(h.latest_of("s1", "/a.txt").unwrap().as_ref(), "one");
    }

    #[test]
    fn append_version_computes_diff_against_previous() {
        let h = FileHistory::new();
        h.ensure_baseline("s1", "/a.txt", "line1\nline2\n");
        let diff = h.append_version("s1", "/a.txt", "line1\nline2 changed\nline3\n").unwrap();
        assert_eq!(diff.additions, 2);
        assert_eq!(diff.removals, 1);
        assert_eq!(h.latest_of("s1", "/a.txt").unwrap().as_ref(), "line1\nline2 changed\nline3\n");
    }

    #[test]
    fn identical_consecutive_content_is_not_stored() {
        let h = FileHistory::new();
        h.ensure_baseline("s1", "/a.txt", "same");
        let diff = h.append_version("s1", "/a.txt", "same");
        assert!(diff.is_none());
        assert_eq!(h.version_count("s1", "/a.txt"), 1);
    }

    #[test]
    fn sessions_and_paths_are_independent() {
        let h = FileHistory::new();
        h.ensure_baseline("s1", "/a.txt", "s1 content");
        h.ensure_baseline("s2", "/a.txt", "s2 content");
        assert_eq!(h.latest_of("s1", "/a.txt").unwrap().as_ref(), "s1 content");
        assert_eq!(h.latest_of("s2", "/a.txt").unwrap().as_ref(), "s2 content");
    }

    #[test]
    fn append_without_baseline_diffs_against_empty() {
        let h = FileHistory::new();
        let diff = h.append_version("s1", "/new.txt", "hello\n").unwrap();
        assert_eq!(diff.old_content, "");
        assert_eq!(diff.additions, 1);
        assert_eq!(diff.removals, 0);
    }

    #[test]
    fn latest_of_unknown_path_is_none() {
        let h = FileHistory::new();
        assert!(h.latest_of("s1", "/missing.txt").is_none());
    }

    // ── sync_with_sandbox (§4.2 intermediate baseline) ────────────────────────

    #[test]
    fn sync_with_sandbox_establishes_baseline_when_absent() {
        let h = FileHistory::new();
        h.sync_with_sandbox("s1", "/a.txt", "on disk");
        assert_eq!(h.version_count("s1", "/a.txt"), 1);
        assert_eq!(h.latest_of("s1", "/a.txt").unwrap().as_ref(), "on disk");
    }

    #[test]
    fn sync_with_sandbox_records_intermediate_version_on_divergence() {
        let h = FileHistory::new();
        h.ensure_baseline("s1", "/a.txt", "baseline");
        // Content changed outside this history (e.g. edited directly in the sandbox).
        h.sync_with_sandbox("s1", "/a.txt", "changed out of band");
        assert_eq!(h.version_count("s1", "/a.txt"), 2);
        assert_eq!(h.latest_of("s1", "/a.txt").unwrap().as_ref(), "changed out of band");
    }

    #[test]
    fn sync_with_sandbox_is_a_no_op_when_content_matches() {
        let h = FileHistory::new();
        h.ensure_baseline("s1", "/a.txt", "same");
        h.sync_with_sandbox("s1", "/a.txt", "same");
        assert_eq!(h.version_count("s1", "/a.txt"), 1);
    }
}
