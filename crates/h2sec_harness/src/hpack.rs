//! HPACK header block encoder (RFC 7541).
//!
//! Every field that is not already indexed is sent as a literal with
//! incremental indexing, so a field repeated within the table's reach costs a
//! single index byte the second time. Huffman coding is not used.

use bytes::{BufMut, Bytes, BytesMut};
use h2sec_traits::HeaderField;
use std::collections::VecDeque;

/// SETTINGS_HEADER_TABLE_SIZE default (RFC 7540 Section 6.5.2).
pub const DEFAULT_TABLE_SIZE: usize = 4096;

/// Static table (RFC 7541 Appendix A), indexed from 1.
const STATIC_TABLE: &[(&str, &str)] = &[
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

enum Lookup {
    Field(usize),
    Name(usize),
    Miss,
}

pub struct HpackEncoder {
    /// Newest entry first; entry `i` has HPACK index `STATIC_TABLE.len() + 1 + i`.
    table: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_SIZE)
    }
}

impl HpackEncoder {
    pub fn new(max_size: usize) -> Self {
        Self {
            table: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Encodes a whole header block.
    pub fn encode(&mut self, fields: &[HeaderField]) -> Bytes {
        let mut buf = BytesMut::new();
        for field in fields {
            self.encode_field(field, &mut buf);
        }
        buf.freeze()
    }

    /// Appends one field to a header block under construction.
    pub fn encode_field(&mut self, field: &HeaderField, buf: &mut BytesMut) {
        match self.lookup(field) {
            Lookup::Field(index) => encode_int(buf, index, 7, 0x80),
            Lookup::Name(index) => {
                encode_int(buf, index, 6, 0x40);
                encode_string(buf, &field.value);
                self.insert(field.clone());
            }
            Lookup::Miss => {
                buf.put_u8(0x40);
                encode_string(buf, &field.name);
                encode_string(buf, &field.value);
                self.insert(field.clone());
            }
        }
    }

    fn lookup(&self, field: &HeaderField) -> Lookup {
        let dynamic_base = STATIC_TABLE.len() + 1;
        let mut name_match = None;

        for (i, (name, value)) in STATIC_TABLE.iter().enumerate() {
            if *name == field.name {
                if *value == field.value {
                    return Lookup::Field(i + 1);
                }
                name_match.get_or_insert(i + 1);
            }
        }
        for (i, entry) in self.table.iter().enumerate() {
            if entry.name == field.name {
                if entry.value == field.value {
                    return Lookup::Field(dynamic_base + i);
                }
                name_match.get_or_insert(dynamic_base + i);
            }
        }

        name_match.map_or(Lookup::Miss, Lookup::Name)
    }

    /// RFC 7541 Section 4.4: evict from the oldest end until the new entry
    /// fits; an entry larger than the table empties it and is not added.
    fn insert(&mut self, field: HeaderField) {
        let entry_size = field.size();
        while self.size + entry_size > self.max_size {
            match self.table.pop_back() {
                Some(evicted) => self.size -= evicted.size(),
                None => break,
            }
        }
        if entry_size <= self.max_size {
            self.size += entry_size;
            self.table.push_front(field);
        }
    }
}

/// Prefix integer (RFC 7541 Section 5.1).
fn encode_int(buf: &mut BytesMut, value: usize, prefix_bits: u8, pattern: u8) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        buf.put_u8(pattern | value as u8);
        return;
    }
    buf.put_u8(pattern | max as u8);
    let mut remaining = value - max;
    while remaining >= 128 {
        buf.put_u8(0x80 | (remaining & 0x7f) as u8);
        remaining >>= 7;
    }
    buf.put_u8(remaining as u8);
}

fn encode_string(buf: &mut BytesMut, s: &str) {
    encode_int(buf, s.len(), 7, 0x00);
    buf.put_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_match_is_single_byte() {
        let mut encoder = HpackEncoder::default();
        let block = encoder.encode(&[HeaderField::new(":method", "GET")]);
        assert_eq!(&block[..], &[0x82]);

        // nothing was added to the dynamic table
        let block = encoder.encode(&[HeaderField::new("x-new", "1")]);
        assert_eq!(block[0], 0x40);
        let block = encoder.encode(&[HeaderField::new("x-new", "1")]);
        assert_eq!(&block[..], &[0x80 | 62]);
    }

    #[test]
    fn repeated_field_becomes_an_index() {
        let mut encoder = HpackEncoder::default();
        let field = HeaderField::new("bomb", "A".repeat(3910));

        let first = encoder.encode(&[field.clone()]);
        assert!(first.len() > 3910);

        // newest dynamic entry is index 62
        let second = encoder.encode(&[field]);
        assert_eq!(&second[..], &[0x80 | 62]);
    }

    #[test]
    fn static_name_with_new_value() {
        let mut encoder = HpackEncoder::default();
        let block = encoder.encode(&[HeaderField::new(":authority", "a:1")]);
        assert_eq!(&block[..], &[0x41, 3, b'a', b':', b'1']);

        let again = encoder.encode(&[HeaderField::new(":authority", "a:1")]);
        assert_eq!(&again[..], &[0x80 | 62]);
    }

    #[test]
    fn eviction_keeps_table_within_limit() {
        let mut encoder = HpackEncoder::new(100);
        encoder.encode(&[HeaderField::new("x-one", "1".repeat(40))]);
        encoder.encode(&[HeaderField::new("x-two", "2".repeat(40))]);

        // x-two stays indexed
        let block = encoder.encode(&[HeaderField::new("x-two", "2".repeat(40))]);
        assert_eq!(&block[..], &[0x80 | 62]);

        // x-one was evicted and is sent as a literal again
        let block = encoder.encode(&[HeaderField::new("x-one", "1".repeat(40))]);
        assert_eq!(block[0], 0x40);
    }

    #[test]
    fn long_integers_continue_in_following_bytes() {
        let mut buf = BytesMut::new();
        encode_int(&mut buf, 1337, 5, 0);
        assert_eq!(&buf[..], &[31, 154, 10]);
    }
}
