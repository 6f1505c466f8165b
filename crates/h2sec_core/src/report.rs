use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    /// The server misbehaved.
    Failed {
        expected: Vec<String>,
        actual: String,
    },
    /// The check could not be carried out.
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    /// e.g. `sec/2/1`
    pub id: String,
    pub desc: String,
    pub requirement: String,
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub id: String,
    pub title: String,
    /// Nesting level below the root, starting at 1.
    pub depth: usize,
    pub cases: Vec<CaseReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub title: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub groups: Vec<GroupReport>,
}

impl Report {
    pub fn cases(&self) -> impl Iterator<Item = &CaseReport> {
        self.groups.iter().flat_map(|g| g.cases.iter())
    }

    pub fn passed(&self) -> usize {
        self.cases()
            .filter(|c| c.outcome == Outcome::Passed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.cases().count() - self.passed()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Plain text rendering, one line per check and the details of every
    /// failure underneath it.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.title);
        for group in &self.groups {
            let indent = "  ".repeat(group.depth);
            let _ = writeln!(out, "{}{}", indent, group.title);
            for case in &group.cases {
                render_case(&mut out, &indent, case);
            }
            out.push('\n');
        }

        let elapsed = self.finished_at - self.started_at;
        let _ = writeln!(
            out,
            "Finished in {:.4} seconds",
            elapsed.num_milliseconds() as f64 / 1000.0
        );
        let _ = writeln!(
            out,
            "{} tests, {} passed, {} failed",
            self.cases().count(),
            self.passed(),
            self.failed()
        );
        out
    }
}

fn render_case(out: &mut String, indent: &str, case: &CaseReport) {
    let number = case.id.rsplit('/').next().unwrap_or_default();
    match &case.outcome {
        Outcome::Passed => {
            let _ = writeln!(out, "{}  [PASS] {}: {}", indent, number, case.desc);
        }
        Outcome::Failed { expected, actual } => {
            let _ = writeln!(out, "{}  [FAIL] {}: {}", indent, number, case.desc);
            let _ = writeln!(out, "{}    -> {}", indent, case.requirement);
            for (i, line) in expected.iter().enumerate() {
                let label = if i == 0 { "Expected:" } else { "" };
                let _ = writeln!(out, "{}       {:>9} {}", indent, label, line);
            }
            let _ = writeln!(out, "{}       {:>9} {}", indent, "Actual:", actual);
        }
        Outcome::Error { message } => {
            let _ = writeln!(out, "{}  [ERROR] {}: {}", indent, number, case.desc);
            let _ = writeln!(out, "{}    -> {}", indent, message);
        }
    }
}
