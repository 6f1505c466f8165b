use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Default SETTINGS_MAX_FRAME_SIZE (RFC 7540 Section 6.5.2).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Largest legal stream id / window increment (31 bits).
pub const MAX_WINDOW_INCREMENT: u32 = 0x7fff_ffff;

/// The server endpoint the checks are driven against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Accept any certificate the server presents.
    pub insecure: bool,
    /// Silence on the wire longer than this surfaces as [`Event::Timeout`].
    pub read_timeout: Duration,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 80,
            tls: false,
            insecure: false,
            read_timeout: Duration::from_secs(2),
        }
    }
}

impl Target {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// HTTP/2 error code carried by RST_STREAM and GOAWAY.
///
/// Kept as a raw code so that values outside RFC 7540 Section 7 survive
/// decoding and still show up in failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const NO_ERROR: ErrorCode = ErrorCode(0x0);
    pub const PROTOCOL_ERROR: ErrorCode = ErrorCode(0x1);
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(0x2);
    pub const FLOW_CONTROL_ERROR: ErrorCode = ErrorCode(0x3);
    pub const SETTINGS_TIMEOUT: ErrorCode = ErrorCode(0x4);
    pub const STREAM_CLOSED: ErrorCode = ErrorCode(0x5);
    pub const FRAME_SIZE_ERROR: ErrorCode = ErrorCode(0x6);
    pub const REFUSED_STREAM: ErrorCode = ErrorCode(0x7);
    pub const CANCEL: ErrorCode = ErrorCode(0x8);
    pub const COMPRESSION_ERROR: ErrorCode = ErrorCode(0x9);
    pub const CONNECT_ERROR: ErrorCode = ErrorCode(0xa);
    pub const ENHANCE_YOUR_CALM: ErrorCode = ErrorCode(0xb);
    pub const INADEQUATE_SECURITY: ErrorCode = ErrorCode(0xc);
    pub const HTTP_1_1_REQUIRED: ErrorCode = ErrorCode(0xd);

    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            0x0 => "NO_ERROR",
            0x1 => "PROTOCOL_ERROR",
            0x2 => "INTERNAL_ERROR",
            0x3 => "FLOW_CONTROL_ERROR",
            0x4 => "SETTINGS_TIMEOUT",
            0x5 => "STREAM_CLOSED",
            0x6 => "FRAME_SIZE_ERROR",
            0x7 => "REFUSED_STREAM",
            0x8 => "CANCEL",
            0x9 => "COMPRESSION_ERROR",
            0xa => "CONNECT_ERROR",
            0xb => "ENHANCE_YOUR_CALM",
            0xc => "INADEQUATE_SECURITY",
            0xd => "HTTP_1_1_REQUIRED",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "unknown error code 0x{:x}", self.0),
        }
    }
}

/// SETTINGS parameter identifier (RFC 7540 Section 6.5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SettingId(pub u16);

impl SettingId {
    pub const HEADER_TABLE_SIZE: SettingId = SettingId(0x1);
    pub const ENABLE_PUSH: SettingId = SettingId(0x2);
    pub const MAX_CONCURRENT_STREAMS: SettingId = SettingId(0x3);
    pub const INITIAL_WINDOW_SIZE: SettingId = SettingId(0x4);
    pub const MAX_FRAME_SIZE: SettingId = SettingId(0x5);
    pub const MAX_HEADER_LIST_SIZE: SettingId = SettingId(0x6);
}

impl fmt::Display for SettingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0x1 => f.write_str("HEADER_TABLE_SIZE"),
            0x2 => f.write_str("ENABLE_PUSH"),
            0x3 => f.write_str("MAX_CONCURRENT_STREAMS"),
            0x4 => f.write_str("INITIAL_WINDOW_SIZE"),
            0x5 => f.write_str("MAX_FRAME_SIZE"),
            0x6 => f.write_str("MAX_HEADER_LIST_SIZE"),
            other => write!(f, "UNKNOWN_SETTING_{}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub id: SettingId,
    pub value: u32,
}

impl Setting {
    pub fn new(id: SettingId, value: u32) -> Self {
        Self { id, value }
    }
}

/// SETTINGS values announced by the server during the handshake.
#[derive(Debug, Clone, Default)]
pub struct PeerSettings {
    values: BTreeMap<SettingId, u32>,
}

impl PeerSettings {
    pub fn apply(&mut self, settings: &[Setting]) {
        for setting in settings {
            self.values.insert(setting.id, setting.value);
        }
    }

    pub fn get(&self, id: SettingId) -> Option<u32> {
        self.values.get(&id).copied()
    }

    /// `None` when the server left the limit unbounded.
    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.get(SettingId::MAX_CONCURRENT_STREAMS)
    }
}

/// A single header name-value pair, before HPACK encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Dynamic table accounting size (RFC 7541 Section 4.1).
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

/// Stream dependency carried by a PRIORITY frame.
///
/// `weight` is the raw wire byte, i.e. the effective weight minus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityParam {
    pub dependency: u32,
    pub exclusive: bool,
    pub weight: u8,
}

#[derive(Debug, Clone)]
pub struct HeadersParam {
    pub stream_id: u32,
    pub end_stream: bool,
    pub end_headers: bool,
    /// Already HPACK-encoded header block.
    pub block: Bytes,
}

/// Frames the client side emits.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Headers {
        stream_id: u32,
        end_stream: bool,
        end_headers: bool,
        block: Bytes,
    },
    Data {
        stream_id: u32,
        end_stream: bool,
        payload: Bytes,
    },
    Priority {
        stream_id: u32,
        priority: PriorityParam,
    },
    Settings(Vec<Setting>),
    SettingsAck,
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
}

impl From<HeadersParam> for Frame {
    fn from(p: HeadersParam) -> Self {
        Frame::Headers {
            stream_id: p.stream_id,
            end_stream: p.end_stream,
            end_headers: p.end_headers,
            block: p.block,
        }
    }
}

/// Everything the connection can report back to a check.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Headers {
        stream_id: u32,
        end_stream: bool,
        length: usize,
    },
    Data {
        stream_id: u32,
        end_stream: bool,
        /// Payload length without padding.
        length: usize,
        /// Whole frame payload, counted against flow control.
        flow_length: usize,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: String,
    },
    Settings(Vec<Setting>),
    SettingsAck,
    /// PING, PRIORITY, PUSH_PROMISE, CONTINUATION and unknown frame types.
    Other {
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        length: usize,
    },
    ConnectionClosed,
    Timeout,
}

impl Event {
    /// Stream id closed from the server side by this event, if any.
    pub fn ends_stream(&self) -> Option<u32> {
        match self {
            Event::Headers {
                stream_id,
                end_stream: true,
                ..
            }
            | Event::Data {
                stream_id,
                end_stream: true,
                ..
            } => Some(*stream_id),
            _ => None,
        }
    }
}

pub fn frame_type_name(frame_type: u8) -> &'static str {
    match frame_type {
        0x0 => "DATA",
        0x1 => "HEADERS",
        0x2 => "PRIORITY",
        0x3 => "RST_STREAM",
        0x4 => "SETTINGS",
        0x5 => "PUSH_PROMISE",
        0x6 => "PING",
        0x7 => "GOAWAY",
        0x8 => "WINDOW_UPDATE",
        0x9 => "CONTINUATION",
        _ => "UNKNOWN",
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Headers {
                stream_id,
                end_stream,
                length,
            } => write!(
                f,
                "HEADERS Frame (length:{}, end_stream:{}, stream_id:{})",
                length, end_stream, stream_id
            ),
            Event::Data {
                stream_id,
                end_stream,
                length,
                ..
            } => write!(
                f,
                "DATA Frame (length:{}, end_stream:{}, stream_id:{})",
                length, end_stream, stream_id
            ),
            Event::WindowUpdate {
                stream_id,
                increment,
            } => write!(
                f,
                "WINDOW_UPDATE Frame (stream_id:{}, window_size_increment:{})",
                stream_id, increment
            ),
            Event::RstStream {
                stream_id,
                error_code,
            } => write!(
                f,
                "RST_STREAM Frame (stream_id:{}, error_code:{})",
                stream_id, error_code
            ),
            Event::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                write!(
                    f,
                    "GOAWAY Frame (last_stream_id:{}, error_code:{}",
                    last_stream_id, error_code
                )?;
                if !debug_data.is_empty() {
                    write!(f, ", debug_data:{:?}", debug_data)?;
                }
                f.write_str(")")
            }
            Event::Settings(settings) => write!(
                f,
                "SETTINGS Frame (flags:0x00, parameters:{})",
                settings.len()
            ),
            Event::SettingsAck => f.write_str("SETTINGS Frame (flags:0x01)"),
            Event::Other {
                frame_type,
                flags,
                stream_id,
                length,
            } => write!(
                f,
                "{} Frame (length:{}, flags:0x{:02x}, stream_id:{})",
                frame_type_name(*frame_type),
                length,
                flags,
                stream_id
            ),
            Event::ConnectionClosed => f.write_str("Connection closed"),
            Event::Timeout => f.write_str("Timeout"),
        }
    }
}

/// Write half of an HTTP/2 connection.
#[async_trait]
pub trait FrameWriter: Send {
    /// Sends the client connection preface (RFC 7540 Section 3.5).
    async fn write_preface(&mut self) -> anyhow::Result<()>;

    async fn write_frame(&mut self, frame: Frame) -> anyhow::Result<()>;

    /// Closes the write direction. Later writes fail.
    async fn shutdown(&mut self) -> anyhow::Result<()>;
}

/// Read half of an HTTP/2 connection, surfaced as protocol events.
#[async_trait]
pub trait EventSource: Send {
    /// Resolves with [`Event::Timeout`] when the peer stays silent past the
    /// read timeout and with [`Event::ConnectionClosed`] once the peer is gone.
    async fn next_event(&mut self) -> Event;
}

/// A freshly connected transport, before the HTTP/2 handshake.
pub struct RawConnection {
    pub writer: Box<dyn FrameWriter>,
    pub events: Box<dyn EventSource>,
}

impl RawConnection {
    pub fn new(writer: impl FrameWriter + 'static, events: impl EventSource + 'static) -> Self {
        Self {
            writer: Box::new(writer),
            events: Box::new(events),
        }
    }
}

/// Opens new connections to the target.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> anyhow::Result<RawConnection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_error_code_keeps_raw_value() {
        assert_eq!(ErrorCode::STREAM_CLOSED.to_string(), "STREAM_CLOSED");
        assert_eq!(ErrorCode(0x42).to_string(), "unknown error code 0x42");
    }

    #[test]
    fn final_frames_end_their_stream() {
        let data = Event::Data {
            stream_id: 3,
            end_stream: true,
            length: 4,
            flow_length: 4,
        };
        let headers = Event::Headers {
            stream_id: 5,
            end_stream: false,
            length: 10,
        };
        assert_eq!(data.ends_stream(), Some(3));
        assert_eq!(headers.ends_stream(), None);
        assert_eq!(Event::ConnectionClosed.ends_stream(), None);
    }

    #[test]
    fn peer_settings_keep_last_value() {
        let mut settings = PeerSettings::default();
        assert_eq!(settings.max_concurrent_streams(), None);

        settings.apply(&[
            Setting::new(SettingId::MAX_CONCURRENT_STREAMS, 100),
            Setting::new(SettingId::MAX_CONCURRENT_STREAMS, 5),
        ]);
        assert_eq!(settings.max_concurrent_streams(), Some(5));
    }

    #[test]
    fn goaway_renders_code_name() {
        let event = Event::GoAway {
            last_stream_id: 7,
            error_code: ErrorCode::PROTOCOL_ERROR,
            debug_data: String::new(),
        };
        assert_eq!(
            event.to_string(),
            "GOAWAY Frame (last_stream_id:7, error_code:PROTOCOL_ERROR)"
        );
    }
}
