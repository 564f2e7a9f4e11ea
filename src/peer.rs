//! Peer link, the fetching side of the exchange.

use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as channel;

use crate::barrier::CompletionBarrier;
use crate::config::{NodeDescriptor, NodeId};
use crate::error::NetSortError;
use crate::record::Record;
use crate::wire::{self, EndOfStream, Frame, FrameReader};

/// Connection establishment policy.
/// Peers may start listening later than this node, so dialing is retried until it succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between connection attempts.
    pub backoff: Duration,
    /// Maximum total time spent dialing. [`None`] means no deadline.
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            backoff: Duration::from_millis(10),
            deadline: None,
        }
    }
}

/// Records a peer sent to this node.
#[derive(Debug)]
pub struct ReceivedBatch {
    pub peer: NodeId,
    pub records: Vec<Record>,
    pub end: EndOfStream,
}

/// Link fetching this node's share of records from a single peer.
pub struct PeerLink {
    local_id: NodeId,
    peer: NodeDescriptor,
    retry: RetryPolicy,
    rw_buf_size: Option<usize>,
}

impl PeerLink {
    /// Creates a link from node `local_id` to `peer`.
    ///
    /// # Arguments
    /// * `local_id` - Id announced to the peer
    /// * `peer` - Peer to fetch records from
    /// * `retry` - Connection retry policy
    /// * `rw_buf_size` - Connection read buffer size
    pub fn new(local_id: NodeId, peer: NodeDescriptor, retry: RetryPolicy, rw_buf_size: Option<usize>) -> Self {
        PeerLink {
            local_id,
            peer,
            retry,
            rw_buf_size,
        }
    }

    /// Dials the peer until the connection is established or the deadline expires.
    pub fn connect(&self) -> Result<TcpStream, NetSortError> {
        let started = Instant::now();
        let addr = self.peer.address();
        let mut attempts = 0u64;

        loop {
            attempts += 1;
            match TcpStream::connect(&addr) {
                Ok(stream) => {
                    log::info!("connected to {} after {} attempt(s)", self.peer, attempts);
                    return Ok(stream);
                }
                Err(err) => log::trace!("{} not reachable yet: {}", self.peer, err),
            }

            if let Some(deadline) = self.retry.deadline {
                if started.elapsed() + self.retry.backoff > deadline {
                    return Err(NetSortError::ConnectTimeout(self.peer.id));
                }
            }
            thread::sleep(self.retry.backoff);
        }
    }

    /// Connects to the peer, announces this node and reads records until the stream ends.
    pub fn fetch(&self) -> Result<ReceivedBatch, NetSortError> {
        let mut stream = self.connect()?;
        wire::write_handshake(&mut stream, self.local_id)?;

        let reader = match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, stream),
            None => io::BufReader::new(stream),
        };
        let mut frames = FrameReader::new(reader, self.peer.id);

        let mut records = Vec::new();
        let end = loop {
            match frames.next_frame()? {
                Frame::Record(record) => {
                    log::trace!("received {:?} from node {}", record, self.peer.id);
                    records.push(record);
                }
                Frame::End(end) => break end,
            }
        };

        if end == EndOfStream::Closed {
            log::warn!("{} closed the connection without an end-of-stream marker", self.peer);
        }
        log::info!("received {} records from node {}", records.len(), self.peer.id);

        return Ok(ReceivedBatch {
            peer: self.peer.id,
            records,
            end,
        });
    }

    /// Fetches in a background thread.
    /// The batch is handed to `sink` before the outbound completion is reported to `barrier`.
    pub fn spawn(
        self,
        sink: channel::Sender<ReceivedBatch>,
        barrier: Arc<CompletionBarrier>,
    ) -> Result<thread::JoinHandle<()>, NetSortError> {
        thread::Builder::new()
            .name(format!("peer-link-{}-{}", self.local_id, self.peer.id))
            .spawn(move || match self.fetch() {
                Ok(batch) => {
                    if sink.send(batch).is_err() {
                        log::warn!("result set closed, batch from {} discarded", self.peer);
                    }
                    barrier.outbound_done();
                }
                Err(err) => {
                    log::error!("fetching from {} failed: {}", self.peer, err);
                    barrier.fail(err);
                }
            })
            .map_err(NetSortError::Spawn)
    }
}
