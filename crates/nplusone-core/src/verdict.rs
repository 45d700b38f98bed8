//! Pass/fail checks over executor results.
//!
//! All checks are pure functions of the [`RunResult`] sequence and the
//! collector keys to inspect. A failing check renders a diagnostic message
//! through each collector's [`CollectorDescriptor::failure_message`].

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::collector::CollectorDescriptor;
use crate::executor::RunResult;
use crate::settings::Settings;

/// Which expectation was checked; selects the failure message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckKind {
    ConstantQueries,
    LinearQueries,
    NumberOfQueries,
}

impl CheckKind {
    pub fn expectation(&self) -> &'static str {
        match self {
            CheckKind::ConstantQueries => "Expected to make the same number of queries",
            CheckKind::LinearQueries => "Expected to make linear number of queries",
            CheckKind::NumberOfQueries => "Expected to make the specified number of queries",
        }
    }
}

/// A check and its parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// Count never changes with scale.
    Constant,
    /// Count grows by at most `slope` per unit of scale.
    Linear { slope: i64 },
    /// Count equals `expected` at every scale.
    Exact { expected: usize },
}

impl Check {
    pub fn kind(&self) -> CheckKind {
        match self {
            Check::Constant => CheckKind::ConstantQueries,
            Check::Linear { .. } => CheckKind::LinearQueries,
            Check::Exact { .. } => CheckKind::NumberOfQueries,
        }
    }

    pub fn passes<S: AsRef<str>>(&self, runs: &[RunResult], keys: &[S]) -> bool {
        match *self {
            Check::Constant => is_constant(runs, keys),
            Check::Linear { slope } => is_linear(runs, keys, slope),
            Check::Exact { expected } => is_exact(runs, keys, expected),
        }
    }
}

/// Per-scale counts for one collector, in run order.
pub fn counts(runs: &[RunResult], key: &str) -> Vec<usize> {
    runs.iter().map(|r| r.count(key)).collect()
}

/// True if every collector's count is the same at every scale.
pub fn is_constant<S: AsRef<str>>(runs: &[RunResult], keys: &[S]) -> bool {
    keys.iter().all(|key| {
        let counts = counts(runs, key.as_ref());
        counts.iter().max() == counts.iter().min()
    })
}

/// True if every collector's count equals `expected` at every scale.
pub fn is_exact<S: AsRef<str>>(runs: &[RunResult], keys: &[S], expected: usize) -> bool {
    keys.iter()
        .all(|key| runs.iter().all(|r| r.count(key.as_ref()) == expected))
}

/// Floor of `(c[i+1] - c[i]) / (s[i+1] - s[i])` for each adjacent pair.
///
/// A pair with equal scales yields `None` when the count grew and `Some(0)`
/// otherwise.
pub fn slopes(runs: &[RunResult], key: &str) -> Vec<Option<i64>> {
    runs.windows(2)
        .map(|pair| {
            let dq = pair[1].count(key) as i64 - pair[0].count(key) as i64;
            let ds = i64::from(pair[1].scale) - i64::from(pair[0].scale);
            if ds == 0 {
                return if dq > 0 { None } else { Some(0) };
            }
            Some(floor_div(dq, ds))
        })
        .collect()
}

/// True if no adjacent pair grows faster than `slope` for any collector.
pub fn is_linear<S: AsRef<str>>(runs: &[RunResult], keys: &[S], slope: i64) -> bool {
    keys.iter().all(|key| {
        slopes(runs, key.as_ref())
            .into_iter()
            .all(|rate| rate.is_some_and(|r| r <= slope))
    })
}

fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

/// Outcome of a check, with the rendered diagnostic on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub kind: CheckKind,
    pub passed: bool,
    /// Empty when the check passed.
    pub message: String,
}

impl Verdict {
    /// Evaluates `check` and renders a failure message for every collector.
    pub fn evaluate(
        check: Check,
        runs: &[RunResult],
        collectors: &[Arc<dyn CollectorDescriptor>],
        settings: &Settings,
    ) -> Self {
        let keys: Vec<&str> = collectors.iter().map(|c| c.key()).collect();
        let passed = check.passes(runs, keys.as_slice());
        let message = if passed {
            String::new()
        } else {
            failure_message(check.kind(), runs, collectors, settings)
        };

        Verdict {
            kind: check.kind(),
            passed,
            message,
        }
    }

    /// Panics with the failure message if the check failed.
    #[track_caller]
    pub fn assert(&self) {
        if !self.passed {
            panic!("{}", self.message);
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed {
            write!(f, "passed")
        } else {
            f.write_str(&self.message)
        }
    }
}

/// Concatenates each collector's failure message.
pub fn failure_message(
    kind: CheckKind,
    runs: &[RunResult],
    collectors: &[Arc<dyn CollectorDescriptor>],
    settings: &Settings,
) -> String {
    collectors
        .iter()
        .map(|c| c.failure_message(kind, runs, settings))
        .collect()
}
