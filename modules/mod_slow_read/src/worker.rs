use bytes::Bytes;
use h2sec_harness::verify::{unmet, ExpectedOutcome};
use h2sec_harness::{CheckError, Conn, StreamIds, StreamLedger, WriteLock};
use h2sec_traits::{ErrorCode, Event, Frame, HeaderField};
use tracing::{debug, info};

use crate::budget::{Share, WindowBudget};

/// Drives the requests of one connection and reads their responses one
/// window step at a time.
pub struct Worker {
    index: usize,
    conn: Conn,
    share: Share,
    budget: WindowBudget,
    headers: Vec<HeaderField>,
    ids: StreamIds,
    issued: usize,
    ledger: StreamLedger,
}

impl Worker {
    /// `conn` must already be handshaken with the reduced window in place.
    pub fn new(
        index: usize,
        conn: Conn,
        share: Share,
        budget: WindowBudget,
        headers: Vec<HeaderField>,
    ) -> Self {
        Self {
            index,
            conn,
            share,
            budget,
            headers,
            ids: StreamIds::new(),
            issued: 0,
            ledger: StreamLedger::new(),
        }
    }

    pub async fn run(mut self) -> Result<(), CheckError> {
        for _ in 0..self.share.concurrent {
            self.next_request().await?;
        }

        loop {
            let event = self.conn.wait_event().await;
            match &event {
                Event::WindowUpdate { .. }
                | Event::Headers {
                    end_stream: false, ..
                } => {}
                Event::GoAway {
                    error_code: ErrorCode::NO_ERROR,
                    ..
                } => debug!(connection = self.index, %event, "ignored"),
                Event::Data {
                    stream_id,
                    end_stream: false,
                    length,
                    flow_length,
                } => {
                    if self.ledger.record(*stream_id, *length) {
                        self.replenish(Some(*stream_id), *flow_length);
                    } else {
                        debug!(connection = self.index, %event, "data on untracked stream");
                    }
                }
                _ => {
                    let Some(stream_id) = event.ends_stream() else {
                        return Err(unmet(
                            &[
                                ExpectedOutcome::StreamsClosed(self.ledger.open_ids()),
                                ExpectedOutcome::GoAway(ErrorCode::NO_ERROR),
                            ],
                            &event,
                        ));
                    };
                    if let Event::Data { flow_length, .. } = &event {
                        if *flow_length > 0 {
                            self.replenish(None, *flow_length);
                        }
                    }
                    match self.ledger.close(stream_id) {
                        Some(received) => {
                            debug!(connection = self.index, stream_id, received, "stream done")
                        }
                        None => {
                            debug!(connection = self.index, %event, "untracked stream ended");
                            continue;
                        }
                    }
                    if self.issued < self.share.requests {
                        self.next_request().await?;
                    }
                    if self.ledger.is_empty() {
                        info!(
                            connection = self.index,
                            requests = self.issued,
                            "all streams completed"
                        );
                        self.conn.close().await?;
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn next_request(&mut self) -> anyhow::Result<()> {
        let stream_id = self.ids.next_id();
        let block = self.conn.encode_headers(&self.headers);
        write_request(&self.conn.write_lock(), stream_id, block).await?;
        self.ledger.open(stream_id);
        self.issued += 1;
        Ok(())
    }

    /// After the configured delay, gives back one step on `stream_id` and
    /// the consumed bytes on the connection window.
    fn replenish(&self, stream_id: Option<u32>, consumed: usize) {
        let lock = self.conn.write_lock();
        let budget = self.budget;
        let index = self.index;
        tokio::spawn(async move {
            tokio::time::sleep(budget.interval).await;
            if let Err(err) = write_credit(&lock, stream_id, budget.step, consumed).await {
                debug!(connection = index, error = %err, "window update not written");
            }
        });
    }
}

/// HEADERS without END_STREAM, then a short DATA body with it, back to back
/// under one hold of the lock.
pub async fn write_request(lock: &WriteLock, stream_id: u32, block: Bytes) -> anyhow::Result<()> {
    let mut writer = lock.lock().await;
    writer
        .write_frame(Frame::Headers {
            stream_id,
            end_stream: false,
            end_headers: true,
            block,
        })
        .await?;
    writer
        .write_frame(Frame::Data {
            stream_id,
            end_stream: true,
            payload: Bytes::from_static(b"test"),
        })
        .await
}

async fn write_credit(
    lock: &WriteLock,
    stream_id: Option<u32>,
    step: u32,
    consumed: usize,
) -> anyhow::Result<()> {
    let mut writer = lock.lock().await;
    if let Some(stream_id) = stream_id {
        writer
            .write_frame(Frame::WindowUpdate {
                stream_id,
                increment: step,
            })
            .await?;
    }
    if consumed > 0 {
        writer
            .write_frame(Frame::WindowUpdate {
                stream_id: 0,
                increment: consumed as u32,
            })
            .await?;
    }
    Ok(())
}
