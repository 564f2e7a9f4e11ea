//! Distributed sort errors.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;

use crate::config::NodeId;

/// Distributed sorting error.
#[derive(Debug)]
pub enum NetSortError {
    /// Cluster configuration file could not be read.
    ConfigRead(io::Error),
    /// Cluster configuration file could not be parsed.
    ConfigParse(serde_yaml::Error),
    /// Cluster configuration is inconsistent.
    InvalidConfig(String),
    /// Node count not supported by the prefix partitioning scheme.
    InvalidNodeCount(usize),
    /// Node id not present in the cluster.
    UnknownNode(NodeId),
    /// Input length is not a multiple of the record size.
    MalformedInput { len: usize, trailing: usize },
    /// Input data could not be read.
    Input(io::Error),
    /// Listening endpoint could not be bound.
    Bind(io::Error),
    /// Handshake I/O failed.
    HandshakeIO(io::Error),
    /// Handshake content is invalid.
    InvalidHandshake(String),
    /// Record stream from or to a peer failed.
    PeerStream { peer: NodeId, err: io::Error },
    /// Record stream violates the wire protocol.
    Protocol { peer: NodeId, reason: String },
    /// Peer did not come up before the connect deadline.
    ConnectTimeout(NodeId),
    /// Exchange did not complete before the barrier deadline.
    BarrierTimeout { inbound: usize, outbound: usize, expected: usize },
    /// Worker thread could not be spawned.
    Spawn(io::Error),
    /// Worker thread terminated abnormally.
    WorkerPanicked(String),
    /// Sorting thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Sorted output could not be persisted.
    Output(io::Error),
}

impl Error for NetSortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            NetSortError::ConfigRead(err) => Some(err),
            NetSortError::ConfigParse(err) => Some(err),
            NetSortError::Input(err) => Some(err),
            NetSortError::Bind(err) => Some(err),
            NetSortError::HandshakeIO(err) => Some(err),
            NetSortError::PeerStream { err, .. } => Some(err),
            NetSortError::Spawn(err) => Some(err),
            NetSortError::ThreadPoolBuildError(err) => Some(err),
            NetSortError::Output(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for NetSortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            NetSortError::ConfigRead(err) => write!(f, "cluster config not readable: {}", err),
            NetSortError::ConfigParse(err) => write!(f, "cluster config not parsable: {}", err),
            NetSortError::InvalidConfig(msg) => write!(f, "invalid cluster config: {}", msg),
            NetSortError::InvalidNodeCount(count) => {
                write!(f, "node count must be a non-zero power of two, got {}", count)
            }
            NetSortError::UnknownNode(id) => write!(f, "node {} is not part of the cluster", id),
            NetSortError::MalformedInput { len, trailing } => write!(
                f,
                "input length {} is not a multiple of the record size ({} trailing bytes)",
                len, trailing
            ),
            NetSortError::Input(err) => write!(f, "input data not readable: {}", err),
            NetSortError::Bind(err) => write!(f, "listening endpoint not bound: {}", err),
            NetSortError::HandshakeIO(err) => write!(f, "handshake failed: {}", err),
            NetSortError::InvalidHandshake(msg) => write!(f, "invalid handshake: {}", msg),
            NetSortError::PeerStream { peer, err } => write!(f, "record stream with node {} failed: {}", peer, err),
            NetSortError::Protocol { peer, reason } => write!(f, "protocol violation by node {}: {}", peer, reason),
            NetSortError::ConnectTimeout(peer) => write!(f, "node {} unreachable before connect deadline", peer),
            NetSortError::BarrierTimeout {
                inbound,
                outbound,
                expected,
            } => write!(
                f,
                "exchange incomplete at barrier deadline (inbound: {}/{}, outbound: {}/{})",
                inbound, expected, outbound, expected
            ),
            NetSortError::Spawn(err) => write!(f, "worker thread not spawned: {}", err),
            NetSortError::WorkerPanicked(name) => write!(f, "worker thread {} panicked", name),
            NetSortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            NetSortError::Output(err) => write!(f, "sorted output not saved: {}", err),
        }
    }
}

/// Checks whether an I/O error is worth retrying on the same stream.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
