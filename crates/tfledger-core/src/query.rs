// ABOUTME: List query filters and the filter predicate shared by every store backend.
// ABOUTME: Filters are conjunctive; an unset field imposes no constraint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::{Run, Status};

/// Filter and limit for a run listing. `limit == 0` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    /// Workspace pattern. `*` and `%` both match any run of characters,
    /// `?` matches one character. A pattern without wildcards matches as a substring.
    pub workspace: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub status: Option<Status>,
    pub user: Option<String>,
    pub program: Option<String>,
    pub branch: Option<String>,
    pub has_changes: bool,
    pub limit: usize,
}

impl ListQuery {
    /// An unfiltered, unbounded query.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_workspace(mut self, pattern: impl Into<String>) -> Self {
        self.workspace = Some(pattern.into());
        self
    }

    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Evaluate the predicate against a single run.
    pub fn matches(&self, run: &Run) -> bool {
        if let Some(pattern) = non_empty(&self.workspace)
            && !workspace_matches(pattern, &run.workspace)
        {
            return false;
        }

        if let Some(since) = self.since
            && run.timestamp < since
        {
            return false;
        }

        if let Some(status) = self.status
            && run.status != status
        {
            return false;
        }

        if let Some(user) = non_empty(&self.user)
            && run.user != user
        {
            return false;
        }

        if let Some(program) = non_empty(&self.program)
            && run.program != program
        {
            return false;
        }

        if let Some(branch) = non_empty(&self.branch) {
            match &run.git {
                Some(git) if git.branch == branch => {}
                _ => return false,
            }
        }

        if self.has_changes && !run.has_changes() {
            return false;
        }

        true
    }

    /// Sort newest first and apply the limit. Ties break on id so the order
    /// is stable for a given input set.
    pub fn finish(&self, runs: &mut Vec<Run>) {
        sort_newest_first(runs, |r| r);
        if self.limit > 0 {
            runs.truncate(self.limit);
        }
    }
}

/// Sort any collection of run-bearing items by timestamp descending, then id.
pub fn sort_newest_first<T>(items: &mut [T], run_of: impl Fn(&T) -> &Run) {
    items.sort_by(|a, b| {
        let (a, b) = (run_of(a), run_of(b));
        b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id))
    });
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

fn workspace_matches(pattern: &str, workspace: &str) -> bool {
    if !pattern.contains(['*', '%', '?']) {
        return workspace.contains(pattern);
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = workspace.chars().collect();
    glob_match(&pattern, &text)
}

/// Iterative wildcard match with single-star backtracking.
fn glob_match(pattern: &[char], text: &[char]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*' | '%') => {
                star = Some((p, t));
                p += 1;
            }
            Some('?') => {
                p += 1;
                t += 1;
            }
            Some(c) if *c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| matches!(c, '*' | '%'))
}
