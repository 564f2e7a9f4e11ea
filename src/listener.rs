//! Exchange listener, the serving side of the exchange.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crate::barrier::CompletionBarrier;
use crate::bucket::BucketStore;
use crate::config::NodeId;
use crate::error::NetSortError;
use crate::wire;

/// Listening endpoint accepting one connection per peer and streaming each peer its bucket.
pub struct ExchangeListener {
    listener: TcpListener,
    local_id: NodeId,
}

/// State shared by all connection handlers.
struct ServeContext {
    local_id: NodeId,
    store: Arc<BucketStore>,
    barrier: Arc<CompletionBarrier>,
    served: Mutex<Vec<bool>>,
    rw_buf_size: Option<usize>,
}

impl ExchangeListener {
    /// Binds the listening endpoint of node `local_id`.
    pub fn bind(addr: impl ToSocketAddrs, local_id: NodeId) -> Result<Self, NetSortError> {
        let listener = TcpListener::bind(addr).map_err(NetSortError::Bind)?;
        if let Ok(addr) = listener.local_addr() {
            log::info!("node {} listening on {}", local_id, addr);
        }

        return Ok(ExchangeListener { listener, local_id });
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Starts serving buckets in the background.
    /// Accepts exactly `num_peers` connections, handling each in its own thread, then stops
    /// accepting. Every served connection is reported to the barrier.
    ///
    /// # Arguments
    /// * `store` - Buckets to be served, read-only from now on
    /// * `barrier` - Barrier collecting inbound completions and failures
    /// * `num_peers` - Number of connections to accept
    /// * `rw_buf_size` - Connection write buffer size
    pub fn serve(
        self,
        store: Arc<BucketStore>,
        barrier: Arc<CompletionBarrier>,
        num_peers: usize,
        rw_buf_size: Option<usize>,
    ) -> Result<thread::JoinHandle<()>, NetSortError> {
        let ctx = Arc::new(ServeContext {
            local_id: self.local_id,
            served: Mutex::new(vec![false; store.num_buckets()]),
            store,
            barrier,
            rw_buf_size,
        });

        thread::Builder::new()
            .name(format!("exchange-accept-{}", self.local_id))
            .spawn(move || self.accept_loop(ctx, num_peers))
            .map_err(NetSortError::Spawn)
    }

    fn accept_loop(self, ctx: Arc<ServeContext>, num_peers: usize) {
        let mut accepted = 0;
        while accepted < num_peers {
            let (stream, addr) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(err) => {
                    log::warn!("connection not accepted, retrying: {}", err);
                    continue;
                }
            };
            accepted += 1;
            log::debug!("accepted connection {}/{} from {}", accepted, num_peers, addr);

            let handler_ctx = ctx.clone();
            let spawned = thread::Builder::new()
                .name(format!("exchange-serve-{}-{}", self.local_id, accepted))
                .spawn(move || match serve_connection(&handler_ctx, stream) {
                    Ok(()) => handler_ctx.barrier.inbound_done(),
                    Err(err) => {
                        log::error!("serving connection from {} failed: {}", addr, err);
                        handler_ctx.barrier.fail(err);
                    }
                });
            if let Err(err) = spawned {
                ctx.barrier.fail(NetSortError::Spawn(err));
                return;
            }
        }

        log::debug!("node {} accepted all {} peer connections", self.local_id, num_peers);
    }
}

fn serve_connection(ctx: &ServeContext, mut stream: TcpStream) -> Result<(), NetSortError> {
    let requester = wire::read_handshake(&mut stream)?;
    ctx.claim(requester)?;

    let bucket = ctx.store.bucket(requester)?;
    log::info!("sending {} records to node {}", bucket.len(), requester);

    let stream_err = |err: io::Error| NetSortError::PeerStream { peer: requester, err };
    {
        let mut writer = match ctx.rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, &stream),
            None => io::BufWriter::new(&stream),
        };
        for record in bucket {
            log::trace!("sending {:?} to node {}", record, requester);
            wire::write_record(&mut writer, record).map_err(stream_err)?;
        }
        wire::write_sentinel(&mut writer).map_err(stream_err)?;
    }

    if let Err(err) = stream.shutdown(Shutdown::Write) {
        log::debug!("connection to node {} not shut down cleanly: {}", requester, err);
    }
    log::debug!("all records sent to node {}", requester);

    return Ok(());
}

impl ServeContext {
    /// Checks that `requester` is a peer that has not been served yet.
    fn claim(&self, requester: NodeId) -> Result<(), NetSortError> {
        if requester == self.local_id {
            return Err(NetSortError::InvalidHandshake(format!(
                "node {} cannot request its own bucket",
                requester
            )));
        }

        let mut served = self.served.lock().unwrap_or_else(PoisonError::into_inner);
        match served.get_mut(requester) {
            None => Err(NetSortError::UnknownNode(requester)),
            Some(true) => Err(NetSortError::InvalidHandshake(format!(
                "node {} requested its bucket twice",
                requester
            ))),
            Some(flag) => {
                *flag = true;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::prelude::*;
    use std::net::{Shutdown, TcpStream};
    use std::sync::Arc;
    use std::time::Duration;

    use rstest::*;

    use super::ExchangeListener;
    use crate::barrier::CompletionBarrier;
    use crate::bucket::BucketStore;
    use crate::error::NetSortError;
    use crate::partition::Partitioner;
    use crate::record::{Record, RECORD_SIZE};
    use crate::wire::{self, EndOfStream, Frame, FrameReader};

    fn record(key_byte: u8) -> Record {
        let mut bytes = [key_byte; RECORD_SIZE];
        bytes[RECORD_SIZE - 1] = 0;
        Record::new(bytes)
    }

    #[fixture]
    fn store() -> Arc<BucketStore> {
        let partitioner = Partitioner::new(4).unwrap();
        let input = vec![record(0x00), record(0x41), record(0x42), record(0x80), record(0xc0), record(0x43)];
        Arc::new(BucketStore::build(input, &partitioner))
    }

    fn request(addr: std::net::SocketAddr, id: usize) -> (Vec<Record>, EndOfStream) {
        let mut stream = TcpStream::connect(addr).unwrap();
        wire::write_handshake(&mut stream, id).unwrap();

        let mut reader = FrameReader::new(stream, 0);
        let mut records = Vec::new();
        loop {
            match reader.next_frame().unwrap() {
                Frame::Record(rec) => records.push(rec),
                Frame::End(end) => return (records, end),
            }
        }
    }

    #[rstest]
    fn test_serves_each_peer_its_bucket(store: Arc<BucketStore>) {
        let listener = ExchangeListener::bind("127.0.0.1:0", 0).unwrap();
        let addr = listener.local_addr().unwrap();
        let barrier = Arc::new(CompletionBarrier::new(3));

        let acceptor = listener.serve(store, barrier.clone(), 3, None).unwrap();

        let (records, end) = request(addr, 1);
        assert_eq!(records, vec![record(0x41), record(0x42), record(0x43)]);
        assert_eq!(end, EndOfStream::Sentinel);

        let (records, _) = request(addr, 3);
        assert_eq!(records, vec![record(0xc0)]);

        let (records, end) = request(addr, 2);
        assert_eq!(records, vec![record(0x80)]);
        assert_eq!(end, EndOfStream::Sentinel);

        acceptor.join().unwrap();
        for _ in 0..3 {
            barrier.outbound_done();
        }
        barrier.wait(Some(Duration::from_secs(5))).unwrap();
    }

    #[rstest]
    #[case(b"0".to_vec())]
    #[case(b"9".to_vec())]
    #[case(b"zero".to_vec())]
    fn test_invalid_handshake_fails_barrier(store: Arc<BucketStore>, #[case] handshake: Vec<u8>) {
        let listener = ExchangeListener::bind("127.0.0.1:0", 0).unwrap();
        let addr = listener.local_addr().unwrap();
        let barrier = Arc::new(CompletionBarrier::new(1));

        let acceptor = listener.serve(store, barrier.clone(), 1, None).unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(&handshake).unwrap();
        stream.shutdown(Shutdown::Write).unwrap();

        acceptor.join().unwrap();
        assert!(matches!(
            barrier.wait(Some(Duration::from_secs(5))),
            Err(NetSortError::InvalidHandshake(_)) | Err(NetSortError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_bind_failure() {
        let taken = ExchangeListener::bind("127.0.0.1:0", 0).unwrap();
        let addr = taken.local_addr().unwrap();
        assert!(matches!(ExchangeListener::bind(addr, 1), Err(NetSortError::Bind(_))));
    }
}
