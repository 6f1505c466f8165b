//! Shared event classification: waiting on a connection until one of a set
//! of acceptable terminal conditions shows up.

use h2sec_traits::{ErrorCode, Event};
use std::fmt;
use tracing::debug;

use crate::conn::Conn;
use crate::group::CheckError;
use crate::ledger::StreamLedger;

/// One acceptable way for a check to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedOutcome {
    /// Every listed stream closed by the server.
    StreamsClosed(Vec<u32>),
    GoAway(ErrorCode),
    /// GOAWAY with any code except NO_ERROR.
    ConnectionError,
    ConnectionClosed,
    SettingsAck,
}

impl fmt::Display for ExpectedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedOutcome::StreamsClosed(ids) => write!(f, "no more open stream: {:?}", ids),
            ExpectedOutcome::GoAway(code) => write!(f, "GOAWAY Frame (Error Code: {})", code),
            ExpectedOutcome::ConnectionError => {
                f.write_str("GOAWAY Frame (Error Code: any except NO_ERROR)")
            }
            ExpectedOutcome::ConnectionClosed => f.write_str("Connection closed"),
            ExpectedOutcome::SettingsAck => f.write_str("SETTINGS Frame (flags:0x01)"),
        }
    }
}

/// Builds the expected-vs-actual failure for a set of outcomes.
pub fn unmet(outcomes: &[ExpectedOutcome], actual: &Event) -> CheckError {
    CheckError::mismatch(outcomes.iter().map(ToString::to_string).collect(), actual)
}

/// Passes on the first of: every stream in `stream_ids` closed by the server,
/// a GOAWAY carrying `error_code`, or the connection closing (also when it was
/// already closed on entry). A timeout or a GOAWAY with another code fails;
/// every other event is ignored.
pub async fn verify_stream_close_or_goaway(
    conn: &mut Conn,
    error_code: ErrorCode,
    stream_ids: &[u32],
) -> Result<(), CheckError> {
    let mut ledger = StreamLedger::new();
    for &id in stream_ids {
        ledger.open(id);
    }

    while !conn.is_closed() {
        let event = conn.wait_event().await;
        match &event {
            Event::ConnectionClosed => {}
            Event::GoAway { error_code: code, .. } if *code == error_code => return Ok(()),
            Event::GoAway { .. } | Event::Timeout => {
                return Err(unmet(
                    &[
                        ExpectedOutcome::StreamsClosed(ledger.open_ids()),
                        ExpectedOutcome::GoAway(error_code),
                        ExpectedOutcome::ConnectionClosed,
                    ],
                    &event,
                ));
            }
            _ => match event.ends_stream() {
                Some(id) if ledger.close(id).is_some() => {
                    if ledger.is_empty() {
                        return Ok(());
                    }
                }
                _ => debug!(%event, "ignored"),
            },
        }
    }
    Ok(())
}

/// Waits for the server to acknowledge SETTINGS we just sent.
pub async fn verify_settings_ack(conn: &mut Conn) -> Result<(), CheckError> {
    loop {
        let event = conn.wait_event().await;
        match event {
            Event::SettingsAck => return Ok(()),
            Event::ConnectionClosed | Event::Timeout | Event::GoAway { .. } => {
                return Err(unmet(&[ExpectedOutcome::SettingsAck], &event));
            }
            _ => debug!(%event, "ignored while waiting for SETTINGS ACK"),
        }
    }
}
