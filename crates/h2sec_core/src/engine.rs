use chrono::Utc;
use h2sec_harness::{Check, CheckContext, CheckError, TestGroup};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::report::{CaseReport, GroupReport, Outcome, Report};

/// A runnable check with its place in the tree.
pub struct PlannedCase {
    pub id: String,
    pub desc: String,
    pub requirement: String,
    pub check: Arc<dyn Check>,
}

pub struct PlannedGroup {
    pub id: String,
    pub title: String,
    pub depth: usize,
    pub cases: Vec<PlannedCase>,
}

/// Walks the check tree and runs the selected checks one after another.
pub struct EngineCore {
    root: TestGroup,
    ctx: CheckContext,
}

impl EngineCore {
    pub fn new(root: TestGroup, ctx: CheckContext) -> Self {
        Self { root, ctx }
    }

    /// Groups and cases matching any of `targets` (all when empty). A target
    /// selects an id equal to it or nested below it.
    pub fn plan(&self, targets: &[String]) -> Vec<PlannedGroup> {
        let mut groups = Vec::new();
        collect(&self.root, &self.root.key, 0, targets, &mut groups);
        groups
    }

    /// Indented listing of the selected checks, with their ids.
    pub fn outline(&self, targets: &[String]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.root.title());
        for group in self.plan(targets) {
            let indent = "  ".repeat(group.depth);
            let _ = writeln!(out, "{}{}  [{}]", indent, group.title, group.id);
            for case in &group.cases {
                let _ = writeln!(out, "{}  {}  [{}]", indent, case.desc, case.id);
            }
        }
        out
    }

    pub async fn run(&self, targets: &[String]) -> Report {
        let started_at = Utc::now();
        let plan = self.plan(targets);
        let total: usize = plan.iter().map(|g| g.cases.len()).sum();
        info!(checks = total, target = %self.ctx.config.target().authority(), "starting run");

        let mut groups = Vec::with_capacity(plan.len());
        for group in plan {
            let mut cases = Vec::with_capacity(group.cases.len());
            for case in group.cases {
                cases.push(self.run_case(case).await);
            }
            groups.push(GroupReport {
                id: group.id,
                title: group.title,
                depth: group.depth,
                cases,
            });
        }

        Report {
            title: self.root.title(),
            target: self.ctx.config.target().authority(),
            started_at,
            finished_at: Utc::now(),
            groups,
        }
    }

    async fn run_case(&self, case: PlannedCase) -> CaseReport {
        info!(id = %case.id, desc = %case.desc, "running check");
        let started = Instant::now();

        // A panicking check is reported instead of taking the run down.
        let check = case.check.clone();
        let ctx = self.ctx.clone();
        let joined = tokio::spawn(async move { check.run(ctx).await }).await;

        let outcome = match joined {
            Ok(Ok(())) => {
                info!(id = %case.id, "passed");
                Outcome::Passed
            }
            Ok(Err(CheckError::Mismatch { expected, actual })) => {
                warn!(id = %case.id, %actual, "failed");
                Outcome::Failed { expected, actual }
            }
            Ok(Err(CheckError::Transport(err))) => {
                warn!(id = %case.id, error = %format!("{:#}", err), "check error");
                Outcome::Error {
                    message: format!("{:#}", err),
                }
            }
            Err(err) => {
                error!(id = %case.id, error = %err, "check aborted");
                Outcome::Error {
                    message: err.to_string(),
                }
            }
        };

        CaseReport {
            id: case.id,
            desc: case.desc,
            requirement: case.requirement,
            elapsed_ms: started.elapsed().as_millis() as u64,
            outcome,
        }
    }
}

fn selected(id: &str, targets: &[String]) -> bool {
    targets.is_empty()
        || targets.iter().any(|t| {
            let t = t.trim_end_matches('/');
            id == t || id.starts_with(&format!("{}/", t))
        })
}

fn collect(
    group: &TestGroup,
    id: &str,
    depth: usize,
    targets: &[String],
    out: &mut Vec<PlannedGroup>,
) {
    if depth > 0 {
        let cases: Vec<PlannedCase> = group
            .cases
            .iter()
            .enumerate()
            .map(|(i, case)| PlannedCase {
                id: format!("{}/{}", id, i + 1),
                desc: case.desc.clone(),
                requirement: case.requirement.clone(),
                check: case.check.clone(),
            })
            .filter(|case| selected(&case.id, targets))
            .collect();
        if !cases.is_empty() {
            let number = id.rsplit('/').next().unwrap_or_default();
            out.push(PlannedGroup {
                id: id.to_string(),
                title: format!("{}: {}", number, group.title()),
                depth,
                cases,
            });
        }
    }
    for (i, child) in group.groups.iter().enumerate() {
        collect(child, &format!("{}/{}", id, i + 1), depth + 1, targets, out);
    }
}
