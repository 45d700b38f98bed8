//! Failure message building blocks.
//!
//! Table usage classification is a heuristic over statement text: it looks
//! for the first `INSERT INTO`, `UPDATE`, `DELETE FROM` or `FROM` keyword and
//! takes the identifier after it. CTEs, multi-statement payloads and
//! subqueries in FROM position are classified best-effort or not at all.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::event::EventRecord;
use crate::executor::RunResult;
use crate::verdict::CheckKind;

static EXTRACT_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(insert\s+into|update|delete\s+from|from)\s+['"`]?([^\s'"`(),;]+)['"`]?"#)
        .expect("table extraction pattern is valid")
});

/// Statement kind derived from the keyword preceding the table name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl StatementKind {
    fn from_keyword(keyword: &str) -> Self {
        let keyword = keyword.to_ascii_lowercase();
        if keyword.starts_with("insert") {
            StatementKind::Insert
        } else if keyword.starts_with("update") {
            StatementKind::Update
        } else if keyword.starts_with("delete") {
            StatementKind::Delete
        } else {
            StatementKind::Select
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Extracts the target table and statement kind from a query.
pub fn classify(query: &str) -> Option<(String, StatementKind)> {
    let caps = EXTRACT_TABLE.captures(query)?;
    Some((caps[2].to_string(), StatementKind::from_keyword(&caps[1])))
}

/// Query counts per (table, kind). Unclassifiable queries are skipped.
pub fn table_usage(queries: &[EventRecord]) -> BTreeMap<(String, StatementKind), usize> {
    let mut usage = BTreeMap::new();
    for query in queries {
        if let Some(bucket) = classify(&query.payload) {
            *usage.entry(bucket).or_insert(0) += 1;
        }
    }
    usage
}

/// A (table, kind) bucket whose count changed between two runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageDelta {
    pub table: String,
    pub kind: StatementKind,
    pub before: usize,
    pub after: usize,
}

impl fmt::Display for UsageDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {} != {}",
            self.table, self.kind, self.before, self.after
        )
    }
}

/// Buckets whose counts differ; a bucket missing on one side counts as zero.
pub fn table_usage_delta(before: &[EventRecord], after: &[EventRecord]) -> Vec<UsageDelta> {
    let before = table_usage(before);
    let after = table_usage(after);
    let buckets: BTreeSet<&(String, StatementKind)> = before.keys().chain(after.keys()).collect();

    buckets
        .into_iter()
        .filter_map(|bucket| {
            let b = before.get(bucket).copied().unwrap_or(0);
            let a = after.get(bucket).copied().unwrap_or(0);
            (b != a).then(|| UsageDelta {
                table: bucket.0.clone(),
                kind: bucket.1,
                before: b,
                after: a,
            })
        })
        .collect()
}

/// Renders the table usage block of a failure message.
pub fn table_usage_stats(before: &[EventRecord], after: &[EventRecord]) -> String {
    let mut msg = String::from("Unmatched query numbers by tables:\n");
    for delta in table_usage_delta(before, after) {
        msg.push_str(&format!("  {}\n", delta));
    }
    msg
}

/// Renders per-table counts of a single run, when there is nothing to compare.
pub fn table_usage_counts(queries: &[EventRecord]) -> String {
    let mut msg = String::from("Query numbers by tables:\n");
    for ((table, kind), count) in table_usage(queries) {
        msg.push_str(&format!("  {} ({}): {}\n", table, kind, count));
    }
    msg
}

/// Header plus one count line per scale.
pub fn summary(kind: CheckKind, display_name: &str, key: &str, runs: &[RunResult]) -> String {
    let mut msg = format!("{} to {}, but got:\n", kind.expectation(), display_name);
    for run in runs {
        msg.push_str(&format!("  {} for N={}\n", run.count(key), run.scale));
    }
    msg
}

/// Every collected query per scale, truncated to `limit` characters.
pub fn query_dump(key: &str, runs: &[RunResult], limit: Option<usize>) -> String {
    let mut msg = String::new();
    for run in runs {
        msg.push_str(&format!("Queries for N={}\n", run.scale));
        for query in run.queries(key) {
            msg.push_str("  ");
            msg.push_str(&truncate_query(&query.payload, limit));
            if let Some(trace) = query.trace() {
                msg.push_str(&trace);
            }
            msg.push('\n');
        }
    }
    msg
}

/// Truncates a query to `limit` characters, ending in `...`.
///
/// Limits below 4 leave only the ellipsis. Queries within the limit are
/// returned unchanged.
pub fn truncate_query(query: &str, limit: Option<usize>) -> String {
    let Some(limit) = limit else {
        return query.to_string();
    };
    if query.chars().count() <= limit {
        return query.to_string();
    }
    if limit < 4 {
        return "...".to_string();
    }
    let kept: String = query.chars().take(limit - 3).collect();
    format!("{}...", kept)
}
