// src/session/backlog.rs

use std::collections::VecDeque;

use bytes::Bytes;

/// Bounded buffer of the most recent session output.
///
/// Once `capacity` is exceeded the oldest bytes are discarded.
#[derive(Debug, Clone)]
pub struct Backlog {
    buf: VecDeque<u8>,
    capacity: usize,
    total: u64,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            total: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.total += data.len() as u64;
        if self.capacity == 0 {
            return;
        }
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(data);
    }

    pub fn snapshot(&self) -> Bytes {
        let (a, b) = self.buf.as_slices();
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        Bytes::from(out)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes ever pushed, including discarded ones.
    pub fn total(&self) -> u64 {
        self.total
    }
}
