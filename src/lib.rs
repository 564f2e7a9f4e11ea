//! `net-sort` is a peer-to-peer distributed sort of fixed-length records.
//!
//! A fixed cluster of N nodes (N a power of two) each holds a shard of an unsorted dataset of
//! 100-byte records whose first 10 bytes are the sort key. Every node partitions its shard by the
//! leading `log2(N)` key bits, exchanges partitions with every other node over direct TCP
//! connections and, once all transfers are done, sorts and saves the records it owns. Concatenating
//! the node outputs in node id order yields the whole dataset sorted by key.
//!
//! # Overview
//!
//! A run on a single node goes through the following stages:
//!
//! * **Partitioning:**
//!   the local shard is split into buckets, one per destination node ([`Partitioner`], [`BucketStore`]).
//! * **Exchange:**
//!   an [`ExchangeListener`] streams each peer its bucket while a [`PeerLink`] per peer fetches this
//!   node's records from that peer, all in parallel. Peers that are not listening yet are redialed.
//! * **Barrier:**
//!   the [`CompletionBarrier`] holds the sort back until every bucket has been served and every peer
//!   stream has been received.
//! * **Sorting:**
//!   received batches and the local bucket are stably sorted by key on a thread pool and merged
//!   ([`RunMerger`]), then written out.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use net_sort::{ClusterConfig, NodeSorterBuilder};
//!
//! fn main() {
//!     let cluster = ClusterConfig::load(Path::new("cluster.yaml")).unwrap();
//!     let sorter = NodeSorterBuilder::new().with_threads_number(4).build().unwrap();
//!
//!     let summary = sorter
//!         .run(0, &cluster, Path::new("input.bin"), Path::new("output.bin"))
//!         .unwrap();
//!     println!("{} records written", summary.written);
//! }
//! ```

pub mod barrier;
pub mod bucket;
pub mod config;
pub mod error;
pub mod listener;
pub mod merger;
pub mod output;
pub mod partition;
pub mod peer;
pub mod record;
pub mod sort;
pub mod wire;

pub use barrier::CompletionBarrier;
pub use bucket::BucketStore;
pub use config::{ClusterConfig, NodeDescriptor, NodeId};
pub use error::NetSortError;
pub use listener::ExchangeListener;
pub use merger::RunMerger;
pub use partition::Partitioner;
pub use peer::{PeerLink, ReceivedBatch, RetryPolicy};
pub use record::{Record, KEY_SIZE, RECORD_SIZE};
pub use sort::{NodeSorter, NodeSorterBuilder, RunSummary};
