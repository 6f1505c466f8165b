//! HTTP/2 frame codec (RFC 7540 Section 4).
//!
//! Only the client side is covered: the frames a check writes are encoded,
//! and whatever the server sends is decoded straight into [`Event`]s. Header
//! blocks are never decoded; checks only look at frame-level fields.
//!
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                    |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+------...------+
//! |R|                 Stream Identifier (31)       |
//! +-+---------------------------------------------+
//! |                   Frame Payload ...            |
//! +-----------------------------------------------+
//! ```

use bytes::{Buf, BufMut, BytesMut};
use h2sec_traits::{ErrorCode, Event, Frame, Setting, SettingId};
use tracing::trace;

/// HTTP/2 connection preface (RFC 7540 Section 3.5).
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FRAME_HEADER_LEN: usize = 9;

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_PRIORITY: u8 = 0x2;
const FRAME_RST_STREAM: u8 = 0x3;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_GOAWAY: u8 = 0x7;
const FRAME_WINDOW_UPDATE: u8 = 0x8;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_ACK: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

const STREAM_ID_MASK: u32 = 0x7fff_ffff;

fn put_frame_header(buf: &mut BytesMut, length: usize, frame_type: u8, flags: u8, stream_id: u32) {
    buf.put_uint(length as u64, 3);
    buf.put_u8(frame_type);
    buf.put_u8(flags);
    buf.put_u32(stream_id & STREAM_ID_MASK);
}

/// Appends the wire form of `frame` to `buf`.
///
/// Header blocks longer than `max_frame_size` are split into a HEADERS frame
/// followed by CONTINUATION frames; END_HEADERS moves to the last of them.
pub fn encode_frame(frame: &Frame, max_frame_size: usize, buf: &mut BytesMut) {
    match frame {
        Frame::Headers {
            stream_id,
            end_stream,
            end_headers,
            block,
        } => {
            let mut chunks = block.chunks(max_frame_size.max(1)).peekable();
            let first = chunks.next().unwrap_or(&[]);
            let last = chunks.peek().is_none();

            let mut flags = if *end_stream { FLAG_END_STREAM } else { 0 };
            if *end_headers && last {
                flags |= FLAG_END_HEADERS;
            }
            put_frame_header(buf, first.len(), FRAME_HEADERS, flags, *stream_id);
            buf.put_slice(first);

            while let Some(chunk) = chunks.next() {
                let flags = if *end_headers && chunks.peek().is_none() {
                    FLAG_END_HEADERS
                } else {
                    0
                };
                put_frame_header(buf, chunk.len(), FRAME_CONTINUATION, flags, *stream_id);
                buf.put_slice(chunk);
            }
        }
        Frame::Data {
            stream_id,
            end_stream,
            payload,
        } => {
            let flags = if *end_stream { FLAG_END_STREAM } else { 0 };
            put_frame_header(buf, payload.len(), FRAME_DATA, flags, *stream_id);
            buf.put_slice(payload);
        }
        Frame::Priority {
            stream_id,
            priority,
        } => {
            put_frame_header(buf, 5, FRAME_PRIORITY, 0, *stream_id);
            let mut dependency = priority.dependency & STREAM_ID_MASK;
            if priority.exclusive {
                dependency |= 0x8000_0000;
            }
            buf.put_u32(dependency);
            buf.put_u8(priority.weight);
        }
        Frame::Settings(settings) => {
            put_frame_header(buf, settings.len() * 6, FRAME_SETTINGS, 0, 0);
            for setting in settings {
                buf.put_u16(setting.id.0);
                buf.put_u32(setting.value);
            }
        }
        Frame::SettingsAck => {
            put_frame_header(buf, 0, FRAME_SETTINGS, FLAG_ACK, 0);
        }
        Frame::WindowUpdate {
            stream_id,
            increment,
        } => {
            put_frame_header(buf, 4, FRAME_WINDOW_UPDATE, 0, *stream_id);
            buf.put_u32(increment & STREAM_ID_MASK);
        }
    }
}

/// A frame split off the read buffer, payload still undecoded.
struct RawFrame {
    frame_type: u8,
    flags: u8,
    stream_id: u32,
    payload: BytesMut,
}

/// Splits the next complete frame off the front of `buf`, or returns `None`
/// while it is incomplete.
fn split_frame(buf: &mut BytesMut) -> Option<RawFrame> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let length = ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | buf[2] as usize;
    if buf.len() < FRAME_HEADER_LEN + length {
        return None;
    }

    let frame_type = buf[3];
    let flags = buf[4];
    let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & STREAM_ID_MASK;
    buf.advance(FRAME_HEADER_LEN);
    Some(RawFrame {
        frame_type,
        flags,
        stream_id,
        payload: buf.split_to(length),
    })
}

/// Malformed payloads are reported as [`Event::Other`] rather than rejected,
/// since judging the server is up to the check.
fn frame_event(frame: &RawFrame) -> Event {
    let RawFrame {
        frame_type,
        flags,
        stream_id,
        payload,
    } = frame;
    let (frame_type, flags, stream_id) = (*frame_type, *flags, *stream_id);
    let length = payload.len();

    let other = Event::Other {
        frame_type,
        flags,
        stream_id,
        length,
    };

    match frame_type {
        FRAME_DATA => match unpadded_len(payload, flags) {
            Some(data_len) => Event::Data {
                stream_id,
                end_stream: flags & FLAG_END_STREAM != 0,
                length: data_len,
                flow_length: length,
            },
            None => other,
        },
        FRAME_HEADERS => {
            let priority_len = if flags & FLAG_PRIORITY != 0 { 5 } else { 0 };
            match unpadded_len(payload, flags).and_then(|n| n.checked_sub(priority_len)) {
                Some(block_len) => Event::Headers {
                    stream_id,
                    end_stream: flags & FLAG_END_STREAM != 0,
                    length: block_len,
                },
                None => other,
            }
        }
        FRAME_RST_STREAM if length == 4 => Event::RstStream {
            stream_id,
            error_code: ErrorCode(read_u32(&payload[0..4])),
        },
        FRAME_SETTINGS if flags & FLAG_ACK != 0 => Event::SettingsAck,
        FRAME_SETTINGS if length % 6 == 0 => Event::Settings(
            payload
                .chunks_exact(6)
                .map(|pair| {
                    Setting::new(
                        SettingId(u16::from_be_bytes([pair[0], pair[1]])),
                        read_u32(&pair[2..6]),
                    )
                })
                .collect(),
        ),
        FRAME_GOAWAY if length >= 8 => Event::GoAway {
            last_stream_id: read_u32(&payload[0..4]) & STREAM_ID_MASK,
            error_code: ErrorCode(read_u32(&payload[4..8])),
            debug_data: String::from_utf8_lossy(&payload[8..]).into_owned(),
        },
        FRAME_WINDOW_UPDATE if length == 4 => Event::WindowUpdate {
            stream_id,
            increment: read_u32(&payload[0..4]) & STREAM_ID_MASK,
        },
        _ => other,
    }
}

/// A header block still waiting for its END_HEADERS.
#[derive(Debug, Clone, Copy)]
struct PendingHeaders {
    stream_id: u32,
    end_stream: bool,
    length: usize,
}

/// Turns the bytes read from the server into [`Event`]s.
///
/// A HEADERS frame without END_HEADERS is held back and its CONTINUATION
/// frames are folded into it, so a header block always surfaces as one
/// [`Event::Headers`] (RFC 7540 Section 6.10).
#[derive(Debug, Default)]
pub struct EventDecoder {
    pending: Option<PendingHeaders>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the next event at the front of `buf`. Returns `None` while
    /// more bytes are needed; consumed bytes are removed from `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Option<Event> {
        loop {
            let frame = split_frame(buf)?;

            if let Some(mut pending) = self.pending.take() {
                if frame.frame_type == FRAME_CONTINUATION && frame.stream_id == pending.stream_id {
                    pending.length += frame.payload.len();
                    if frame.flags & FLAG_END_HEADERS != 0 {
                        return Some(Event::Headers {
                            stream_id: pending.stream_id,
                            end_stream: pending.end_stream,
                            length: pending.length,
                        });
                    }
                    self.pending = Some(pending);
                    continue;
                }
                // interrupted block: dropped, the interrupting frame is reported
                trace!(stream_id = pending.stream_id, "header block interrupted");
            }

            match frame_event(&frame) {
                Event::Headers {
                    stream_id,
                    end_stream,
                    length,
                } if frame.flags & FLAG_END_HEADERS == 0 => {
                    self.pending = Some(PendingHeaders {
                        stream_id,
                        end_stream,
                        length,
                    });
                }
                event => return Some(event),
            }
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Payload length with the pad length octet and padding removed.
fn unpadded_len(payload: &[u8], flags: u8) -> Option<usize> {
    if flags & FLAG_PADDED == 0 {
        return Some(payload.len());
    }
    let pad = *payload.first()? as usize;
    payload.len().checked_sub(1 + pad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use h2sec_traits::PriorityParam;

    fn decode_event(buf: &mut BytesMut) -> Option<Event> {
        EventDecoder::new().decode(buf)
    }

    fn encode(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(frame, 16_384, &mut buf);
        buf
    }

    #[test]
    fn priority_sets_exclusive_bit() {
        let buf = encode(&Frame::Priority {
            stream_id: 3,
            priority: PriorityParam {
                dependency: 7,
                exclusive: true,
                weight: 2,
            },
        });
        assert_eq!(
            &buf[..],
            &[0, 0, 5, FRAME_PRIORITY, 0, 0, 0, 0, 3, 0x80, 0, 0, 7, 2]
        );
    }

    #[test]
    fn window_update_layout() {
        let buf = encode(&Frame::WindowUpdate {
            stream_id: 1,
            increment: 10,
        });
        assert_eq!(
            &buf[..],
            &[0, 0, 4, FRAME_WINDOW_UPDATE, 0, 0, 0, 0, 1, 0, 0, 0, 10]
        );
    }

    #[test]
    fn oversized_header_block_spills_into_continuation() {
        let mut buf = BytesMut::new();
        encode_frame(
            &Frame::Headers {
                stream_id: 1,
                end_stream: true,
                end_headers: true,
                block: Bytes::from(vec![0xbe; 25]),
            },
            10,
            &mut buf,
        );

        // HEADERS(10) + CONTINUATION(10) + CONTINUATION(5)
        assert_eq!(buf.len(), 3 * FRAME_HEADER_LEN + 25);
        assert_eq!(buf[3], FRAME_HEADERS);
        assert_eq!(buf[4], FLAG_END_STREAM);
        let second = FRAME_HEADER_LEN + 10;
        assert_eq!(buf[second + 3], FRAME_CONTINUATION);
        assert_eq!(buf[second + 4], 0);
        let third = second + FRAME_HEADER_LEN + 10;
        assert_eq!(buf[third + 3], FRAME_CONTINUATION);
        assert_eq!(buf[third + 4], FLAG_END_HEADERS);
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let mut buf = BytesMut::from(&[0u8, 0, 8, FRAME_GOAWAY, 0, 0, 0, 0, 0, 0, 0, 0][..]);
        assert_eq!(decode_event(&mut buf), None);
        assert_eq!(buf.len(), 12);

        buf.extend_from_slice(&[3, 0, 0, 0, 5]);
        assert_eq!(
            decode_event(&mut buf),
            Some(Event::GoAway {
                last_stream_id: 3,
                error_code: ErrorCode::STREAM_CLOSED,
                debug_data: String::new(),
            })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_padded_data() {
        // pad length 2, data "ab", two bytes of padding
        let mut buf = BytesMut::from(
            &[0u8, 0, 5, FRAME_DATA, FLAG_PADDED | FLAG_END_STREAM, 0, 0, 0, 9, 2, b'a', b'b', 0, 0][..],
        );
        assert_eq!(
            decode_event(&mut buf),
            Some(Event::Data {
                stream_id: 9,
                end_stream: true,
                length: 2,
                flow_length: 5,
            })
        );
    }

    #[test]
    fn decodes_back_to_back_settings_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 6, FRAME_SETTINGS, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0, 100]);
        buf.extend_from_slice(&[0, 0, 0, FRAME_SETTINGS, FLAG_ACK, 0, 0, 0, 0]);

        assert_eq!(
            decode_event(&mut buf),
            Some(Event::Settings(vec![Setting::new(
                SettingId::MAX_CONCURRENT_STREAMS,
                100
            )]))
        );
        assert_eq!(decode_event(&mut buf), Some(Event::SettingsAck));
        assert_eq!(decode_event(&mut buf), None);
    }

    #[test]
    fn ping_is_reported_as_other() {
        let mut buf = BytesMut::from(&[0u8, 0, 8, 0x6, 0, 0, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8][..]);
        assert_eq!(
            decode_event(&mut buf),
            Some(Event::Other {
                frame_type: 0x6,
                flags: 0,
                stream_id: 0,
                length: 8,
            })
        );
    }

    #[test]
    fn continuation_is_folded_into_headers() {
        let mut decoder = EventDecoder::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 4, FRAME_HEADERS, FLAG_END_STREAM, 0, 0, 0, 3, 1, 2, 3, 4]);
        buf.extend_from_slice(&[0, 0, 2, FRAME_CONTINUATION, 0, 0, 0, 0, 3, 5, 6]);
        assert_eq!(decoder.decode(&mut buf), None);
        assert!(buf.is_empty());

        buf.extend_from_slice(&[0, 0, 3, FRAME_CONTINUATION, FLAG_END_HEADERS, 0, 0, 0, 3, 7, 8, 9]);
        buf.extend_from_slice(&[0, 0, 0, FRAME_SETTINGS, FLAG_ACK, 0, 0, 0, 0]);
        assert_eq!(
            decoder.decode(&mut buf),
            Some(Event::Headers {
                stream_id: 3,
                end_stream: true,
                length: 9,
            })
        );
        assert_eq!(decoder.decode(&mut buf), Some(Event::SettingsAck));
    }

    #[test]
    fn stray_continuation_is_reported_as_other() {
        let mut decoder = EventDecoder::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 1, FRAME_HEADERS, 0, 0, 0, 0, 1, 0x82]);
        buf.extend_from_slice(&[0, 0, 1, FRAME_CONTINUATION, FLAG_END_HEADERS, 0, 0, 0, 5, 0x84]);
        assert_eq!(
            decoder.decode(&mut buf),
            Some(Event::Other {
                frame_type: FRAME_CONTINUATION,
                flags: FLAG_END_HEADERS,
                stream_id: 5,
                length: 1,
            })
        );
    }
}
