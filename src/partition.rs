//! Key prefix partitioner.

use crate::config::NodeId;
use crate::error::NetSortError;
use crate::record::{Record, KEY_SIZE};

/// Maps a record to its destination node using the leading `log2(N)` bits of the record key.
#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    num_nodes: usize,
    bits: u32,
}

impl Partitioner {
    /// Creates a partitioner for a cluster of `num_nodes` nodes.
    /// The node count must be a power of two, otherwise some node ids would never be addressed.
    pub fn new(num_nodes: usize) -> Result<Self, NetSortError> {
        if !num_nodes.is_power_of_two() {
            return Err(NetSortError::InvalidNodeCount(num_nodes));
        }

        let bits = num_nodes.trailing_zeros();
        if bits as usize > KEY_SIZE * 8 {
            return Err(NetSortError::InvalidNodeCount(num_nodes));
        }

        return Ok(Partitioner { num_nodes, bits });
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Number of key bits used to address a node.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Returns the id of the node the record belongs to.
    pub fn destination(&self, record: &Record) -> NodeId {
        key_prefix(record.key(), self.bits)
    }
}

/// Reads the leading `bits` bits of `key`, most significant bit first, as an unsigned integer.
pub fn key_prefix(key: &[u8], bits: u32) -> usize {
    let mut prefix = 0usize;
    let mut remaining = bits;

    for &byte in key {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(8);
        prefix = (prefix << take) | (byte >> (8 - take)) as usize;
        remaining -= take;
    }

    prefix
}
