//! Owned buffer chains for `write_chain`.
//!
//! A chain hands the socket ownership of its buffers: the write path moves
//! them into the queued request without copying, and the request keeps them
//! alive until completion. Empty buffers are legal in a chain and are
//! dropped when the chain is materialised into write ops, so a chain with
//! empty elements produces the same wire bytes as a `writev` over its
//! non-empty elements.

use bytes::Bytes;

/// An ordered chain of owned byte buffers.
#[derive(Debug, Default, Clone)]
pub struct BufferChain {
    bufs: Vec<Bytes>,
}

impl BufferChain {
    /// An empty chain.
    pub fn new() -> Self {
        BufferChain { bufs: Vec::new() }
    }

    /// Append one buffer to the tail.
    pub fn append(&mut self, buf: Bytes) {
        self.bufs.push(buf);
    }

    /// Append every buffer of `other`, preserving order.
    pub fn append_chain(&mut self, other: BufferChain) {
        self.bufs.extend(other.bufs);
    }

    /// Total payload length across all buffers.
    pub fn len(&self) -> usize {
        self.bufs.iter().map(|b| b.len()).sum()
    }

    /// Whether the chain holds no payload bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of chain elements, counting empty ones.
    pub fn count_elements(&self) -> usize {
        self.bufs.len()
    }

    /// Materialise the chain into write ops, skipping empty buffers.
    pub(crate) fn into_ops(self) -> Vec<Bytes> {
        self.bufs.into_iter().filter(|b| !b.is_empty()).collect()
    }
}

impl From<Bytes> for BufferChain {
    fn from(buf: Bytes) -> Self {
        BufferChain { bufs: vec![buf] }
    }
}

impl From<Vec<u8>> for BufferChain {
    fn from(buf: Vec<u8>) -> Self {
        BufferChain {
            bufs: vec![Bytes::from(buf)],
        }
    }
}
