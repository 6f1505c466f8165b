use async_trait::async_trait;
use h2sec_traits::{Dialer, Event};
use std::sync::Arc;

use crate::config::Config;
use crate::conn::Conn;

/// Root key of the check tree; check ids read `sec/<group>/<case>`.
pub const KEY: &str = "sec";

/// Why a check did not pass.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    /// The server did not show any of the acceptable behaviors.
    #[error("expected {}, actual: {actual}", .expected.join(" or "))]
    Mismatch {
        expected: Vec<String>,
        actual: String,
    },
    /// Connecting, writing or handshaking failed.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl CheckError {
    pub fn mismatch(expected: Vec<String>, actual: &Event) -> Self {
        CheckError::Mismatch {
            expected,
            actual: actual.to_string(),
        }
    }
}

/// Everything a running check may use. Cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct CheckContext {
    pub config: Arc<Config>,
    pub dialer: Arc<dyn Dialer>,
}

impl CheckContext {
    pub fn new(config: Arc<Config>, dialer: Arc<dyn Dialer>) -> Self {
        Self { config, dialer }
    }

    /// Opens a new connection; the HTTP/2 handshake is left to the caller.
    pub async fn connect(&self) -> anyhow::Result<Conn> {
        let raw = self.dialer.dial().await?;
        Ok(Conn::new(raw))
    }
}

#[async_trait]
pub trait Check: Send + Sync {
    async fn run(&self, ctx: CheckContext) -> Result<(), CheckError>;
}

pub struct TestCase {
    pub desc: String,
    /// Requirement statement shown when the check fails.
    pub requirement: String,
    pub check: Arc<dyn Check>,
}

impl TestCase {
    pub fn new(desc: &str, requirement: &str, check: impl Check + 'static) -> Self {
        Self {
            desc: desc.to_string(),
            requirement: requirement.to_string(),
            check: Arc::new(check),
        }
    }
}

/// A named node of the check tree.
pub struct TestGroup {
    pub key: String,
    /// e.g. the CVE a group reproduces.
    pub section: String,
    pub name: String,
    pub groups: Vec<TestGroup>,
    pub cases: Vec<TestCase>,
}

impl TestGroup {
    pub fn new(section: &str, name: &str) -> Self {
        Self {
            key: KEY.to_string(),
            section: section.to_string(),
            name: name.to_string(),
            groups: Vec::new(),
            cases: Vec::new(),
        }
    }

    pub fn add_group(&mut self, group: TestGroup) {
        self.groups.push(group);
    }

    pub fn add_case(&mut self, case: TestCase) {
        self.cases.push(case);
    }

    /// `section: name`, or just the name for the root.
    pub fn title(&self) -> String {
        if self.section.is_empty() {
            self.name.clone()
        } else {
            format!("{}: {}", self.section, self.name)
        }
    }

    /// Number of cases in this group and every group below it.
    pub fn case_count(&self) -> usize {
        self.cases.len() + self.groups.iter().map(TestGroup::case_count).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pass;

    #[async_trait]
    impl Check for Pass {
        async fn run(&self, _ctx: CheckContext) -> Result<(), CheckError> {
            Ok(())
        }
    }

    #[test]
    fn mismatch_lists_every_expectation() {
        let err = CheckError::mismatch(
            vec!["Connection closed".to_string(), "no more open stream: {}".to_string()],
            &Event::Timeout,
        );
        assert_eq!(
            err.to_string(),
            "expected Connection closed or no more open stream: {}, actual: Timeout"
        );
    }

    #[test]
    fn case_count_walks_subgroups() {
        let mut root = TestGroup::new("", "root");
        let mut child = TestGroup::new("CVE-0000-0001", "child");
        child.add_case(TestCase::new("a", "r", Pass));
        child.add_case(TestCase::new("b", "r", Pass));
        root.add_group(child);
        root.add_case(TestCase::new("c", "r", Pass));

        assert_eq!(root.case_count(), 3);
        assert_eq!(root.title(), "root");
        assert_eq!(root.groups[0].title(), "CVE-0000-0001: child");
    }
}
