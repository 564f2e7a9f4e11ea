//! Local bucket store.

use crate::config::NodeId;
use crate::error::NetSortError;
use crate::partition::Partitioner;
use crate::record::{Record, Records};

/// Records of the local input shard grouped by destination node.
/// Built once before the exchange starts and only read afterwards.
#[derive(Debug, Default)]
pub struct BucketStore {
    buckets: Vec<Vec<Record>>,
}

impl BucketStore {
    /// Distributes records over one bucket per node preserving scan order inside each bucket.
    pub fn build(records: impl IntoIterator<Item = Record>, partitioner: &Partitioner) -> Self {
        let mut buckets = vec![Vec::new(); partitioner.num_nodes()];
        for record in records {
            buckets[partitioner.destination(&record)].push(record);
        }

        BucketStore { buckets }
    }

    /// Builds buckets from a flat binary input buffer.
    ///
    /// # Arguments
    /// * `data` - Concatenated 100-byte records
    /// * `partitioner` - Partitioner agreed by the whole cluster
    /// * `strict` - Reject input with a trailing partial record instead of dropping it
    pub fn from_input(data: &[u8], partitioner: &Partitioner, strict: bool) -> Result<Self, NetSortError> {
        let records = Records::split(data, strict)?;
        let store = Self::build(records, partitioner);

        log::debug!("input partitioned into buckets of sizes {:?}", store.sizes());

        return Ok(store);
    }

    /// Returns the bucket addressed to `id`.
    pub fn bucket(&self, id: NodeId) -> Result<&[Record], NetSortError> {
        self.buckets
            .get(id)
            .map(Vec::as_slice)
            .ok_or(NetSortError::UnknownNode(id))
    }

    /// Moves the bucket addressed to `id` out of the store leaving it empty.
    pub fn take_bucket(&mut self, id: NodeId) -> Result<Vec<Record>, NetSortError> {
        self.buckets
            .get_mut(id)
            .map(std::mem::take)
            .ok_or(NetSortError::UnknownNode(id))
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Returns the number of records in each bucket.
    pub fn sizes(&self) -> Vec<usize> {
        self.buckets.iter().map(Vec::len).collect()
    }
}

#[cfg(test)]
mod test {
    use rand::Rng;
    use rstest::*;

    use super::BucketStore;
    use crate::error::NetSortError;
    use crate::partition::Partitioner;
    use crate::record::{Record, RECORD_SIZE};

    fn record(key_byte: u8, seq: u8) -> Record {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[0] = key_byte;
        bytes[RECORD_SIZE - 1] = seq;
        Record::new(bytes)
    }

    #[test]
    fn test_build_preserves_scan_order() {
        let partitioner = Partitioner::new(2).unwrap();
        let input = vec![record(0x80, 0), record(0x00, 1), record(0xff, 2), record(0x7f, 3), record(0x00, 4)];

        let store = BucketStore::build(input.clone(), &partitioner);

        assert_eq!(store.num_buckets(), 2);
        assert_eq!(store.bucket(0).unwrap(), &[input[1].clone(), input[3].clone(), input[4].clone()]);
        assert_eq!(store.bucket(1).unwrap(), &[input[0].clone(), input[2].clone()]);
        assert!(matches!(store.bucket(2), Err(NetSortError::UnknownNode(2))));
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(16)]
    fn test_from_input_conserves_records(#[case] num_nodes: usize) {
        let partitioner = Partitioner::new(num_nodes).unwrap();
        let mut data = vec![0u8; RECORD_SIZE * 64];
        rand::thread_rng().fill(&mut data[..]);

        let store = BucketStore::from_input(&data, &partitioner, true).unwrap();

        assert_eq!(store.sizes().iter().sum::<usize>(), 64);
        for id in 0..num_nodes {
            for rec in store.bucket(id).unwrap() {
                assert_eq!(partitioner.destination(rec), id);
            }
        }
    }

    #[test]
    fn test_take_bucket() {
        let partitioner = Partitioner::new(2).unwrap();
        let mut store = BucketStore::build(vec![record(0x00, 0), record(0x80, 1)], &partitioner);

        let own = store.take_bucket(1).unwrap();
        assert_eq!(own, vec![record(0x80, 1)]);
        assert!(store.bucket(1).unwrap().is_empty());
        assert_eq!(store.sizes(), vec![1, 0]);
    }
}
