//! Shared plumbing for the security checks: configuration, the connection
//! wrapper with its write lock, the HPACK encoder, stream bookkeeping, the
//! check tree and the common verifiers.

pub mod config;
pub mod conn;
pub mod group;
pub mod hpack;
pub mod ledger;
pub mod verify;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::Config;
pub use conn::{Conn, WriteLock};
pub use group::{Check, CheckContext, CheckError, TestCase, TestGroup};
pub use hpack::HpackEncoder;
pub use ledger::{StreamIds, StreamLedger};
pub use verify::{verify_settings_ack, verify_stream_close_or_goaway, ExpectedOutcome};
