use std::collections::BTreeMap;
use std::fmt;

/// Hands out client stream ids: odd, strictly increasing, starting at 1.
#[derive(Debug, Clone)]
pub struct StreamIds {
    next: u32,
}

impl Default for StreamIds {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl StreamIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next += 2;
        id
    }

    /// The first `count` ids, in order.
    pub fn first(count: usize) -> Vec<u32> {
        let mut ids = Self::new();
        (0..count).map(|_| ids.next_id()).collect()
    }
}

/// Streams a scenario is still waiting on, with the bytes received on each.
///
/// Owned by a single worker. Only ids registered through
/// [`StreamLedger::open`] are ever tracked; events for other streams are
/// reported back as unknown and leave the ledger untouched.
#[derive(Debug, Default, Clone)]
pub struct StreamLedger {
    open: BTreeMap<u32, usize>,
}

impl StreamLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, stream_id: u32) {
        self.open.insert(stream_id, 0);
    }

    /// Adds received payload bytes to an open stream. Returns `false` for
    /// streams the ledger does not track.
    pub fn record(&mut self, stream_id: u32, bytes: usize) -> bool {
        match self.open.get_mut(&stream_id) {
            Some(received) => {
                *received += bytes;
                true
            }
            None => false,
        }
    }

    /// Removes a stream on recognized closure, returning its byte count.
    pub fn close(&mut self, stream_id: u32) -> Option<usize> {
        self.open.remove(&stream_id)
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    pub fn open_ids(&self) -> Vec<u32> {
        self.open.keys().copied().collect()
    }
}

/// Renders as `{1: 0, 3: 12}`, the form failure reports quote.
impl fmt::Display for StreamLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.open)
    }
}
