//! Distributed node sorter.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel as channel;
use rayon::slice::ParallelSliceMut;

use crate::barrier::CompletionBarrier;
use crate::bucket::BucketStore;
use crate::config::{ClusterConfig, NodeId};
use crate::error::NetSortError;
use crate::listener::ExchangeListener;
use crate::merger::RunMerger;
use crate::output;
use crate::partition::Partitioner;
use crate::peer::{PeerLink, RetryPolicy};
use crate::record::{compare_keys, Record};

/// Per-node statistics of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Local node id.
    pub node: NodeId,
    /// Records read from the local input shard.
    pub scanned: usize,
    /// Local records that stayed on this node.
    pub kept: usize,
    /// Records served to each peer.
    pub sent: Vec<(NodeId, usize)>,
    /// Records received from each peer, in arrival order.
    pub received: Vec<(NodeId, usize)>,
    /// Records written to the output.
    pub written: u64,
}

impl RunSummary {
    /// Number of records this node owns after the exchange.
    pub fn owned(&self) -> usize {
        self.kept + self.received.iter().map(|(_, count)| count).sum::<usize>()
    }
}

/// Node sorter builder. Provides methods for [`NodeSorter`] initialization.
#[derive(Debug, Clone, Default)]
pub struct NodeSorterBuilder {
    /// Number of threads to be used to sort data in parallel.
    threads_number: Option<usize>,
    /// Peer connection retry policy.
    retry: RetryPolicy,
    /// Maximum time to wait for the exchange to complete.
    barrier_timeout: Option<Duration>,
    /// Reject input with a trailing partial record.
    strict_input: bool,
    /// Connection and output read/write buffer size.
    rw_buf_size: Option<usize>,
}

impl NodeSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        NodeSorterBuilder::default()
    }

    /// Builds a [`NodeSorter`] instance using provided configuration.
    pub fn build(self) -> Result<NodeSorter, NetSortError> {
        NodeSorter::new(
            self.threads_number,
            self.retry,
            self.barrier_timeout,
            self.strict_input,
            self.rw_buf_size,
        )
    }

    /// Sets number of threads to be used to sort data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> NodeSorterBuilder {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets pause between peer connection attempts.
    pub fn with_connect_backoff(mut self, backoff: Duration) -> NodeSorterBuilder {
        self.retry.backoff = backoff;
        return self;
    }

    /// Sets maximum time spent dialing a single peer. Peers are dialed indefinitely by default.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> NodeSorterBuilder {
        self.retry.deadline = Some(timeout);
        return self;
    }

    /// Sets maximum time to wait for all transfers to complete. Waits indefinitely by default.
    pub fn with_barrier_timeout(mut self, timeout: Duration) -> NodeSorterBuilder {
        self.barrier_timeout = Some(timeout);
        return self;
    }

    /// Makes a trailing partial input record an error instead of dropping it.
    pub fn with_strict_input(mut self, strict: bool) -> NodeSorterBuilder {
        self.strict_input = strict;
        return self;
    }

    /// Sets connection and output read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> NodeSorterBuilder {
        self.rw_buf_size = Some(buf_size);
        return self;
    }
}

/// Node sorter.
///
/// Partitions the local shard by key prefix, exchanges buckets with every peer, waits for the
/// exchange to complete and sorts the records this node owns.
pub struct NodeSorter {
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Peer connection retry policy.
    retry: RetryPolicy,
    /// Maximum time to wait for the exchange to complete.
    barrier_timeout: Option<Duration>,
    /// Reject input with a trailing partial record.
    strict_input: bool,
    /// Connection and output read/write buffer size.
    rw_buf_size: Option<usize>,
}

impl NodeSorter {
    /// Creates a new node sorter instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to sort data in parallel. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    /// * `retry` - Peer connection retry policy.
    /// * `barrier_timeout` - Maximum time to wait for the exchange. If the parameter is [`None`] waits indefinitely.
    /// * `strict_input` - Reject input with a trailing partial record.
    /// * `rw_buf_size` - Connection and output read/write buffer size.
    pub fn new(
        threads_number: Option<usize>,
        retry: RetryPolicy,
        barrier_timeout: Option<Duration>,
        strict_input: bool,
        rw_buf_size: Option<usize>,
    ) -> Result<Self, NetSortError> {
        return Ok(NodeSorter {
            thread_pool: Self::init_thread_pool(threads_number)?,
            retry,
            barrier_timeout,
            strict_input,
            rw_buf_size,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, NetSortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(NetSortError::ThreadPoolBuildError)?;

        return Ok(thread_pool);
    }

    /// Sorts the records node `local_id` owns and saves them to `output`.
    ///
    /// # Arguments
    /// * `local_id` - Id of this node
    /// * `cluster` - Cluster topology, identical on every node
    /// * `input` - Local input shard
    /// * `output` - Destination of the sorted records
    pub fn run(
        &self,
        local_id: NodeId,
        cluster: &ClusterConfig,
        input: &Path,
        output: &Path,
    ) -> Result<RunSummary, NetSortError> {
        let data = fs::read(input).map_err(NetSortError::Input)?;
        log::info!("node {} read {} bytes from {}", local_id, data.len(), input.display());

        let (sorted, mut summary) = self.sort_shard(local_id, cluster, &data, None)?;
        summary.written = output::write_records(output, sorted, self.rw_buf_size)?;

        return Ok(summary);
    }

    /// Exchanges the local shard with the cluster and returns the records this node owns in key order.
    ///
    /// # Arguments
    /// * `local_id` - Id of this node
    /// * `cluster` - Cluster topology, identical on every node
    /// * `input` - Local input shard, concatenated records
    /// * `listener` - Already bound listening endpoint. If [`None`] the endpoint is bound to the
    ///   address the cluster config lists for this node.
    pub fn sort_shard(
        &self,
        local_id: NodeId,
        cluster: &ClusterConfig,
        input: &[u8],
        listener: Option<ExchangeListener>,
    ) -> Result<(RunMerger, RunSummary), NetSortError> {
        let local = cluster.node(local_id)?;
        let partitioner = Partitioner::new(cluster.len())?;

        let mut store = BucketStore::from_input(input, &partitioner, self.strict_input)?;
        let sizes = store.sizes();
        let own = store.take_bucket(local_id)?;

        let peers: Vec<_> = cluster.peers_of(local_id).cloned().collect();
        let mut summary = RunSummary {
            node: local_id,
            scanned: sizes.iter().sum(),
            kept: own.len(),
            sent: peers.iter().map(|peer| (peer.id, sizes[peer.id])).collect(),
            ..RunSummary::default()
        };
        log::info!(
            "node {} partitioned {} records, {} stay local",
            local_id,
            summary.scanned,
            summary.kept
        );

        let barrier = Arc::new(CompletionBarrier::new(peers.len()));
        let mut workers = Vec::new();

        if !peers.is_empty() {
            let listener = match listener {
                Some(listener) => listener,
                None => ExchangeListener::bind(local.address(), local_id)?,
            };
            let acceptor = listener.serve(Arc::new(store), barrier.clone(), peers.len(), self.rw_buf_size)?;
            workers.push(acceptor);
        }

        let (sink, batches) = channel::unbounded();
        for peer in peers {
            let link = PeerLink::new(local_id, peer, self.retry, self.rw_buf_size);
            workers.push(link.spawn(sink.clone(), barrier.clone())?);
        }
        drop(sink);

        log::debug!("node {} waiting for {} peers", local_id, barrier.expected());
        barrier.wait(self.barrier_timeout)?;
        log::info!("node {} exchange complete", local_id);

        // links queue their batch before reporting completion, so every batch is queued by now
        let mut runs = vec![own];
        for batch in batches.try_iter() {
            summary.received.push((batch.peer, batch.records.len()));
            runs.push(batch.records);
        }

        for worker in workers {
            join_worker(worker)?;
        }

        log::info!("node {} sorting {} records", local_id, summary.owned());
        return Ok((self.sort_runs(runs), summary));
    }

    /// Sorts every run by key in parallel and merges them into one sorted sequence.
    /// Records with equal keys keep their order of appearance in the concatenation of the runs.
    pub fn sort_runs(&self, mut runs: Vec<Vec<Record>>) -> RunMerger {
        log::debug!("sorting {} runs ...", runs.len());
        self.thread_pool.install(|| {
            for run in runs.iter_mut() {
                run.par_sort_by(compare_keys);
            }
        });

        RunMerger::new(runs)
    }
}

fn join_worker(worker: thread::JoinHandle<()>) -> Result<(), NetSortError> {
    let name = worker.thread().name().unwrap_or("unnamed").to_string();
    worker.join().map_err(|_| NetSortError::WorkerPanicked(name))
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::fs;
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    use rand::seq::SliceRandom;
    use rand::Rng;
    use rstest::*;

    use super::{NodeSorter, NodeSorterBuilder};
    use crate::config::{ClusterConfig, NodeDescriptor};
    use crate::error::NetSortError;
    use crate::listener::ExchangeListener;
    use crate::partition::Partitioner;
    use crate::record::{compare_keys, Record, Records, RECORD_SIZE};

    fn record(key: &[u8], tag: u32) -> Record {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[..key.len()].copy_from_slice(key);
        bytes[RECORD_SIZE - 4..].copy_from_slice(&tag.to_be_bytes());
        Record::new(bytes)
    }

    fn concat(records: &[Record]) -> Vec<u8> {
        records.iter().flat_map(|r| r.as_bytes().to_vec()).collect()
    }

    fn random_shard(rng: &mut impl Rng, node: u32, len: u32) -> Vec<Record> {
        (0..len)
            .map(|i| {
                let mut key = [0u8; 10];
                rng.fill(&mut key[..]);
                record(&key, node << 16 | i)
            })
            .collect()
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn sorter() -> NodeSorter {
        NodeSorterBuilder::new()
            .with_threads_number(2)
            .with_barrier_timeout(Duration::from_secs(30))
            .build()
            .unwrap()
    }

    /// Runs a whole cluster in-process over loopback and returns the sorted output of every node.
    fn run_cluster(shards: Vec<Vec<Record>>) -> Vec<Vec<Record>> {
        let listeners: Vec<ExchangeListener> = (0..shards.len())
            .map(|id| ExchangeListener::bind("127.0.0.1:0", id).unwrap())
            .collect();
        let nodes = listeners
            .iter()
            .enumerate()
            .map(|(id, l)| NodeDescriptor::new(id, "127.0.0.1", l.local_addr().unwrap().port().to_string()))
            .collect();
        let cluster = ClusterConfig::new(nodes).unwrap();

        let handles: Vec<_> = listeners
            .into_iter()
            .zip(shards)
            .enumerate()
            .map(|(id, (listener, shard))| {
                let cluster = cluster.clone();
                thread::spawn(move || {
                    let (sorted, summary) = sorter()
                        .sort_shard(id, &cluster, &concat(&shard), Some(listener))
                        .unwrap();
                    let sorted: Vec<Record> = sorted.collect();
                    assert_eq!(summary.owned(), sorted.len());
                    sorted
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_single_node() {
        let mut shard = random_shard(&mut rand::thread_rng(), 0, 50);
        shard.push(record(&[0x10], 1000));
        shard.push(record(&[0x10], 999));

        let outputs = run_cluster(vec![shard.clone()]);

        let mut expected = shard;
        expected.sort_by(compare_keys);
        assert_eq!(outputs, vec![expected]);
    }

    #[test]
    fn test_two_nodes_by_leading_bit() {
        let shards = vec![
            vec![record(&[0xc0], 0), record(&[0x00], 1)],
            vec![record(&[0x40], 2), record(&[0x80], 3)],
        ];

        let outputs = run_cluster(shards);

        assert_eq!(outputs[0], vec![record(&[0x00], 1), record(&[0x40], 2)]);
        assert_eq!(outputs[1], vec![record(&[0x80], 3), record(&[0xc0], 0)]);
    }

    #[rstest]
    #[case(2)]
    #[case(4)]
    #[case(8)]
    fn test_cluster_properties(#[case] num_nodes: usize) {
        let mut rng = rand::thread_rng();
        let shards: Vec<Vec<Record>> = (0..num_nodes)
            .map(|node| {
                let len = rng.gen_range(0..120);
                random_shard(&mut rng, node as u32, len)
            })
            .collect();

        let outputs = run_cluster(shards.clone());
        let partitioner = Partitioner::new(num_nodes).unwrap();

        // conservation
        let mut input_all: Vec<Record> = shards.concat();
        let mut output_all: Vec<Record> = outputs.concat();
        input_all.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
        output_all.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
        assert_eq!(input_all, output_all);

        for (node, output) in outputs.iter().enumerate() {
            // partition correctness
            assert!(output.iter().all(|r| partitioner.destination(r) == node));
            // sortedness
            assert!(output.windows(2).all(|w| w[0].key() <= w[1].key()));
        }
    }

    #[test]
    fn test_stability_within_contributing_node() {
        let key = [0x42u8; 10];
        let shards = vec![
            (0..30).map(|i| record(&key, i)).collect::<Vec<_>>(),
            (100..130).map(|i| record(&key, i)).collect::<Vec<_>>(),
        ];

        let outputs = run_cluster(shards);
        assert!(outputs[1].is_empty());

        let tags: Vec<u32> = outputs[0]
            .iter()
            .map(|r| u32::from_be_bytes(r.as_bytes()[RECORD_SIZE - 4..].try_into().unwrap()))
            .collect();
        let from_node0: Vec<u32> = tags.iter().copied().filter(|t| *t < 100).collect();
        let from_node1: Vec<u32> = tags.iter().copied().filter(|t| *t >= 100).collect();
        assert_eq!(from_node0, (0..30).collect::<Vec<_>>());
        assert_eq!(from_node1, (100..130).collect::<Vec<_>>());
    }

    #[test]
    fn test_sort_runs_is_stable_over_concatenation() {
        let mut rng = rand::thread_rng();
        let mut all: Vec<Record> = (0..300).map(|i| record(&[rng.gen_range(0..8)], i)).collect();
        all.shuffle(&mut rng);
        let runs: Vec<Vec<Record>> = all.chunks(70).map(|c| c.to_vec()).collect();

        let actual: Vec<Record> = sorter().sort_runs(runs).collect();

        let mut expected = all;
        expected.sort_by(compare_keys);
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_late_peer() {
        let ports = [free_port(), free_port()];
        let nodes = ports
            .iter()
            .enumerate()
            .map(|(id, port)| NodeDescriptor::new(id, "127.0.0.1", port.to_string()))
            .collect();
        let cluster = ClusterConfig::new(nodes).unwrap();
        let shards = vec![vec![record(&[0x90], 0)], vec![record(&[0x10], 1)]];

        let started = Instant::now();
        let handles: Vec<_> = shards
            .into_iter()
            .enumerate()
            .map(|(id, shard)| {
                let cluster = cluster.clone();
                thread::spawn(move || {
                    if id == 1 {
                        thread::sleep(Duration::from_millis(200));
                    }
                    let (sorted, _) = sorter().sort_shard(id, &cluster, &concat(&shard), None).unwrap();
                    sorted.collect::<Vec<_>>()
                })
            })
            .collect();
        let outputs: Vec<Vec<Record>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outputs, vec![vec![record(&[0x10], 1)], vec![record(&[0x90], 0)]]);
    }

    #[test]
    fn test_unreachable_peer_with_deadline() {
        let nodes = vec![
            NodeDescriptor::new(0, "127.0.0.1", free_port().to_string()),
            NodeDescriptor::new(1, "127.0.0.1", free_port().to_string()),
        ];
        let cluster = ClusterConfig::new(nodes).unwrap();
        let sorter = NodeSorterBuilder::new()
            .with_connect_backoff(Duration::from_millis(5))
            .with_connect_timeout(Duration::from_millis(100))
            .build()
            .unwrap();

        let result = sorter.sort_shard(0, &cluster, &concat(&[record(&[1], 0)]), None);
        assert!(matches!(result, Err(NetSortError::ConnectTimeout(1))));
    }

    #[test]
    fn test_strict_input() {
        let cluster = ClusterConfig::new(vec![NodeDescriptor::new(0, "127.0.0.1", "0")]).unwrap();
        let mut input = concat(&[record(&[3], 0), record(&[1], 1)]);
        input.extend_from_slice(&[0xff; 10]);

        let lenient = sorter();
        let (sorted, summary) = lenient.sort_shard(0, &cluster, &input, None).unwrap();
        assert_eq!(summary.scanned, 2);
        assert_eq!(sorted.collect::<Vec<_>>(), vec![record(&[1], 1), record(&[3], 0)]);

        let strict = NodeSorterBuilder::new().with_strict_input(true).build().unwrap();
        assert!(matches!(
            strict.sort_shard(0, &cluster, &input, None),
            Err(NetSortError::MalformedInput { trailing: 10, .. })
        ));
    }

    #[test]
    fn test_unknown_local_node() {
        let cluster = ClusterConfig::new(vec![NodeDescriptor::new(0, "127.0.0.1", "0")]).unwrap();
        assert!(matches!(
            sorter().sort_shard(1, &cluster, &[], None),
            Err(NetSortError::UnknownNode(1))
        ));
    }

    #[test]
    fn test_run_with_files() {
        let dir = tempfile::tempdir_in("./").unwrap();
        let ports = [free_port(), free_port()];
        let nodes = ports
            .iter()
            .enumerate()
            .map(|(id, port)| NodeDescriptor::new(id, "127.0.0.1", port.to_string()))
            .collect();
        let cluster = ClusterConfig::new(nodes).unwrap();

        let mut rng = rand::thread_rng();
        let shards = vec![random_shard(&mut rng, 0, 40), random_shard(&mut rng, 1, 60)];
        for (id, shard) in shards.iter().enumerate() {
            fs::write(dir.path().join(format!("input-{}", id)), concat(shard)).unwrap();
        }

        let handles: Vec<_> = (0..2)
            .map(|id| {
                let cluster = cluster.clone();
                let input = dir.path().join(format!("input-{}", id));
                let output = dir.path().join(format!("output-{}", id));
                thread::spawn(move || sorter().run(id, &cluster, &input, &output).unwrap())
            })
            .collect();
        let summaries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let mut counts = HashMap::new();
        for (id, summary) in summaries.iter().enumerate() {
            let content = fs::read(dir.path().join(format!("output-{}", id))).unwrap();
            assert_eq!(content.len() as u64, summary.written * RECORD_SIZE as u64);
            assert_eq!(summary.written as usize, summary.owned());
            let records: Vec<Record> = Records::split(&content, true).unwrap().collect();
            assert!(records.windows(2).all(|w| w[0].key() <= w[1].key()));
            counts.insert(id, records.len());
        }
        assert_eq!(counts.values().sum::<usize>(), 100);
        assert_eq!(summaries[0].sent, vec![(1, summaries[1].received[0].1)]);
    }
}
