//! CVE-2015-8659: a PRIORITY dependency cycle across every open stream.

use async_trait::async_trait;
use bytes::Bytes;
use h2sec_harness::verify::{unmet, ExpectedOutcome};
use h2sec_harness::{Check, CheckContext, CheckError, StreamIds, StreamLedger, TestCase, TestGroup};
use h2sec_traits::{ErrorCode, Event, HeadersParam, PriorityParam};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

const REQUIREMENT: &str = "The endpoint MUST terminate the connection with a connection error.";

pub fn group() -> TestGroup {
    let mut group = TestGroup::new("CVE-2015-8659", "Dependency Cycle");
    group.add_case(TestCase::new(
        "Sends requests with Dependency Cycle",
        REQUIREMENT,
        DependencyCycle::new(),
    ));
    group
}

/// Stream `ids[i]` depends on `targets[i]`; the targets are a shuffle of the
/// same ids. Nothing guarantees the result actually contains a cycle.
pub fn dependency_targets<R: Rng + ?Sized>(ids: &[u32], rng: &mut R) -> Vec<u32> {
    let mut targets = ids.to_vec();
    targets.shuffle(rng);
    targets
}

#[derive(Debug, Default)]
pub struct DependencyCycle {
    seed: Option<u64>,
}

impl DependencyCycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixes the permutation.
    pub fn with_seed(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

#[async_trait]
impl Check for DependencyCycle {
    async fn run(&self, ctx: CheckContext) -> Result<(), CheckError> {
        let mut conn = ctx.connect().await?;
        conn.handshake().await?;

        let count = ctx
            .config
            .stream_budget(conn.settings().max_concurrent_streams());
        let ids = StreamIds::first(count);
        info!(streams = count, "opening streams");

        let headers = ctx.config.common_headers();
        let mut ledger = StreamLedger::new();
        for &stream_id in &ids {
            let block = conn.encode_headers(&headers);
            conn.write_headers(HeadersParam {
                stream_id,
                end_stream: false,
                end_headers: true,
                block,
            })
            .await?;
            ledger.open(stream_id);
        }

        let targets = dependency_targets(&ids, &mut self.rng());
        for (&stream_id, &dependency) in ids.iter().zip(&targets) {
            conn.write_priority(
                stream_id,
                PriorityParam {
                    dependency,
                    exclusive: true,
                    weight: 2,
                },
            )
            .await?;
        }

        for &stream_id in ids.iter().rev() {
            conn.write_data(stream_id, true, Bytes::from_static(b"test"))
                .await?;
        }

        loop {
            let event = conn.wait_event().await;
            match &event {
                Event::WindowUpdate { .. }
                | Event::Headers {
                    end_stream: false, ..
                } => {}
                Event::GoAway { error_code, .. } if *error_code == ErrorCode::NO_ERROR => {
                    debug!(%event, "graceful shutdown, still waiting")
                }
                Event::GoAway { .. } | Event::ConnectionClosed => {
                    info!(%event, "connection terminated by server");
                    if let Err(err) = conn.close().await {
                        debug!(error = %err, "close failed");
                    }
                    return Ok(());
                }
                Event::Data {
                    stream_id,
                    end_stream: false,
                    length,
                    ..
                } => {
                    ledger.record(*stream_id, *length);
                }
                _ => {
                    let Some(stream_id) = event.ends_stream() else {
                        return Err(unmet(
                            &[
                                ExpectedOutcome::StreamsClosed(ledger.open_ids()),
                                ExpectedOutcome::ConnectionError,
                                ExpectedOutcome::ConnectionClosed,
                            ],
                            &event,
                        ));
                    };
                    ledger.close(stream_id);
                    if ledger.is_empty() {
                        conn.close().await?;
                        return Ok(());
                    }
                }
            }
        }
    }
}
