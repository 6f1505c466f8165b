//! CVE-2016-1546: many requests whose responses are read one tiny window
//! step at a time, over as many connections as it takes to reach the
//! configured concurrency.

use async_trait::async_trait;
use h2sec_harness::{Check, CheckContext, CheckError, TestCase, TestGroup};

pub mod budget;
pub mod coordinator;
pub mod worker;

pub use budget::{Share, SharePlanner, WindowBudget};

const REQUIREMENT: &str = "HTTP/2 stream represents request-response cycles and once closed.";

pub fn group() -> TestGroup {
    let mut group = TestGroup::new("CVE-2016-1546", "Slow Read");
    group.add_case(TestCase::new(
        "Sends thousands of GET requests with small window size",
        REQUIREMENT,
        SlowRead,
    ));
    group
}

pub struct SlowRead;

#[async_trait]
impl Check for SlowRead {
    async fn run(&self, ctx: CheckContext) -> Result<(), CheckError> {
        coordinator::run(&ctx).await
    }
}
