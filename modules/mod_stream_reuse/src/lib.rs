//! CVE-2016-0150: requests that reuse a stream id which is already closed.

use async_trait::async_trait;
use h2sec_harness::{
    verify_stream_close_or_goaway, Check, CheckContext, CheckError, StreamIds, TestCase, TestGroup,
};
use h2sec_traits::{ErrorCode, HeadersParam};
use tracing::{debug, warn};

const REQUIREMENT: &str = "HTTP/2 stream represents one request-response cycle and once closed.";

pub fn group() -> TestGroup {
    let mut group = TestGroup::new("CVE-2016-0150", "Stream Reuse");
    group.add_case(TestCase::new(
        "Sends two requests with same stream ID",
        REQUIREMENT,
        SameStreamTwice,
    ));
    group.add_case(TestCase::new(
        "Sends multi requests which mixed same stream ID",
        REQUIREMENT,
        InterleavedReuse,
    ));
    group
}

/// Two complete requests on stream 5.
pub struct SameStreamTwice;

const REUSED_STREAM: u32 = 5;

#[async_trait]
impl Check for SameStreamTwice {
    async fn run(&self, ctx: CheckContext) -> Result<(), CheckError> {
        let mut conn = ctx.connect().await?;
        conn.handshake().await?;

        let headers = ctx.config.common_headers();
        for _ in 0..2 {
            let block = conn.encode_headers(&headers);
            conn.write_headers(HeadersParam {
                stream_id: REUSED_STREAM,
                end_stream: true,
                end_headers: true,
                block,
            })
            .await?;
        }

        verify_stream_close_or_goaway(&mut conn, ErrorCode::STREAM_CLOSED, &[REUSED_STREAM]).await
    }
}

/// Two passes over streams 1 to 9, so every id is reused once the first
/// pass closed it.
pub struct InterleavedReuse;

const INTERLEAVED_STREAMS: usize = 5;

#[async_trait]
impl Check for InterleavedReuse {
    async fn run(&self, ctx: CheckContext) -> Result<(), CheckError> {
        let mut conn = ctx.connect().await?;
        conn.handshake().await?;

        let headers = ctx.config.common_headers();
        let ids = StreamIds::first(INTERLEAVED_STREAMS);

        'passes: for pass in 0..2 {
            for &stream_id in &ids {
                let block = conn.encode_headers(&headers);
                let written = conn
                    .write_headers(HeadersParam {
                        stream_id,
                        end_stream: true,
                        end_headers: true,
                        block,
                    })
                    .await;
                if let Err(err) = written {
                    warn!(pass, stream_id, error = %err, "write failed, verifying");
                    break 'passes;
                }
            }
            debug!(pass, "pass written");
        }

        verify_stream_close_or_goaway(&mut conn, ErrorCode::STREAM_CLOSED, &ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cases_share_the_requirement() {
        let group = group();
        assert_eq!(group.title(), "CVE-2016-0150: Stream Reuse");
        assert_eq!(group.case_count(), 2);
        assert!(group.cases.iter().all(|c| c.requirement == REQUIREMENT));
    }
}
