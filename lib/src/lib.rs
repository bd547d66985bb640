//! A peer-to-peer content-addressed replication library
//!
//! This crate enables a consumer to:
//!
//! - Run a node in a fixed mesh of peers connected over TCP.
//! - Persist `(key, data)` pairs in a hash-derived directory layout.
//! - Eagerly replicate an AES-256-CTR encrypted copy of every stored
//!     value to all connected peers.
//! - Retrieve a value by key from local storage, or from the first
//!     peer that still holds a replica.
//!
//! The library is broken up into two abstractions:
//!
//! - A higher level API, exposed via the `Node` struct, that wires the
//!     transport, store, and codec together
//! - Lower level building blocks (`protocol`, `transport`, `store`,
//!     `crypto`) if you need direct access to the framing or layout
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;


// Allow users to access errors
pub mod errors;
use errors::StashError;

pub mod crypto;
pub mod identity;
pub mod pathkey;
pub mod protocol;
pub mod store;
pub mod transport;

pub use identity::{NetKey, NodeId, SecretKey};
pub use pathkey::{PathKey, PathTransform};
pub use store::Store;
pub use transport::{Direction, HandshakeFn, Peer, TcpTransport, TransportConfig};

use crypto::NONCE_SIZE;
use protocol::{Frame, FramePayload, Message, STREAM_TAG};
use transport::{OnDropFn, OnPeerFn, PeerSink};

/**
 * Arbitrary port for the replication protocol
 */
pub const DEFAULT_PORT: u16 = 13499;

/**
 * Chunk size for streaming encryption and decryption
 */
pub const CHUNK_SIZE: usize = 32768;

/// Grace period for peers to process an announcement before the
/// stream body is pushed at them
const ANNOUNCE_SETTLE: Duration = Duration::from_millis(5);

/// How long a retrieval waits for peers to respond
const RETRIEVE_WAIT: Duration = Duration::from_millis(500);

/// Upper bound on the gap between an announcement and its stream tag
/// arriving on the same connection
const STREAM_ARRIVAL_WAIT: Duration = Duration::from_secs(5);

/// Poll interval at which the dispatch loop re-checks the quit flag
const DISPATCH_TICK: Duration = Duration::from_millis(200);

/// Startup options for a Node
pub struct NodeConfig {
    /// Endpoint the transport binds to
    pub listen_addr: String,

    /// Directory under which content is materialized
    pub storage_root: PathBuf,

    /// Mapping from key to on-disk layout
    pub path_transform: PathTransform,

    /// Remote addresses to dial at startup, best-effort
    pub bootstrap_nodes: Vec<String>,

    /// This node's symmetric key; generated when absent
    pub enc_key: Option<SecretKey>,

    /// This node's identity; generated when absent
    pub id: Option<NodeId>,

    /// Per-connection validator; accepts everything when absent
    pub handshake: Option<HandshakeFn>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            listen_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            storage_root: PathBuf::from("stash_data"),
            path_transform: PathTransform::default(),
            bootstrap_nodes: Vec::new(),
            enc_key: None,
            id: None,
            handshake: None,
        }
    }
}

type PeerMap = Arc<RwLock<HashMap<SocketAddr, Arc<Peer>>>>;

/**
 * The primary interface into the library. One Node owns its identity,
 * its symmetric key, the content store, the transport, and the set of
 * live peers.
 */
pub struct Node {
    id: NodeId,
    enc_key: SecretKey,
    store: Store,
    transport: Arc<TcpTransport>,
    bootstrap: Vec<String>,
    peers: PeerMap,
    quit: AtomicBool,

    // Number of broadcast retrieval requests issued, observable so
    // callers can verify that local hits stay off the network
    requests_sent: AtomicU64,
}

impl Node {
    /// Wire up a node from its configuration. The transport is bound
    /// lazily by `start`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use stash_lib::{Node, NodeConfig};
    ///
    /// let node = Node::new(NodeConfig {
    ///     listen_addr: "0.0.0.0:13499".to_string(),
    ///     bootstrap_nodes: vec!["10.0.0.2:13499".to_string()],
    ///     ..Default::default()
    /// });
    /// ```
    pub fn new(config: NodeConfig) -> Node {
        let id = config.id.unwrap_or_else(NodeId::generate);
        let enc_key = config.enc_key.unwrap_or_else(SecretKey::generate);
        let peers: PeerMap = Arc::new(RwLock::new(HashMap::new()));

        // The on-peer hook owns insertion into the peer set
        let on_peer: OnPeerFn = {
            let peers = Arc::clone(&peers);
            Arc::new(move |peer: Arc<Peer>| {
                info!(
                    "[{}] peer connected ({:?})",
                    peer.addr(),
                    peer.direction()
                );
                peers.write().unwrap().insert(peer.addr(), peer);
                Ok(())
            })
        };

        // Symmetric removal when a read loop exits
        let on_drop: OnDropFn = {
            let peers = Arc::clone(&peers);
            Arc::new(move |addr: SocketAddr| {
                if peers.write().unwrap().remove(&addr).is_some() {
                    info!("[{}] peer removed", addr);
                }
            })
        };

        let transport = TcpTransport::new(TransportConfig {
            listen_addr: config.listen_addr,
            handshake: config.handshake.unwrap_or_else(|| Arc::new(|_| Ok(()))),
            on_peer,
            on_drop,
        });

        Node {
            id,
            enc_key,
            store: Store::new(config.storage_root, config.path_transform),
            transport,
            bootstrap: config.bootstrap_nodes,
            peers,
            quit: AtomicBool::new(false),
            requests_sent: AtomicU64::new(0),
        }
    }

    /// This node's identity
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Address the transport actually bound to, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Number of live peer connections
    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    /// Number of broadcast retrieval requests issued so far
    pub fn request_count(&self) -> u64 {
        self.requests_sent.load(Ordering::SeqCst)
    }

    /// Listen, dial the bootstrap peers, and run the dispatch loop.
    /// Blocks until `stop` is called or the transport dies.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use stash_lib::{Node, NodeConfig};
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// let node = Arc::new(Node::new(NodeConfig::default()));
    ///
    /// // The dispatch loop blocks, so give it its own thread
    /// let runner = Arc::clone(&node);
    /// thread::spawn(move || runner.start());
    /// ```
    pub fn start(&self) -> Result<(), StashError> {
        let inbound = self.transport.consume()?;
        let addr = self.transport.listen_and_accept()?;
        info!("[{}] listening on {}", self.id, addr);

        // Dial failures must not prevent startup
        for target in self.bootstrap.iter().filter(|a| !a.is_empty()) {
            let transport = Arc::clone(&self.transport);
            let target = target.clone();
            thread::spawn(move || {
                if let Err(e) = transport.dial(&target) {
                    warn!("dial {} failed: {}", target, e);
                }
            });
        }

        loop {
            if self.quit.load(Ordering::SeqCst) {
                break;
            }
            match inbound.recv_timeout(DISPATCH_TICK) {
                Ok(frame) => self.dispatch(frame),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.transport.close();
        info!("[{}] stopped", self.id);
        Ok(())
    }

    /// Ask a running `start` to shut the node down
    pub fn stop(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    /// Persist `data` under `key` locally (in the clear) and push an
    /// encrypted replica to every connected peer. Returns the number
    /// of plaintext bytes stored.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use stash_lib::{Node, NodeConfig};
    ///
    /// let node = Node::new(NodeConfig::default());
    /// // ... start the node and let the mesh form ...
    ///
    /// let stored = node
    ///     .store(b"picture_0.png", &mut &b"my big data file here!"[..])
    ///     .unwrap();
    /// assert_eq!(stored, 22);
    /// ```
    pub fn store<R: Read>(&self, key: &[u8], data: &mut R) -> Result<u64, StashError> {
        // One pass writes the local copy and fills the replication
        // buffer
        let mut buffer = Vec::new();
        let plain_size = {
            let mut tee = TeeReader::new(data, &mut buffer);
            self.store.write(&self.id, key, &mut tee)?
        };

        let announce = Message::StoreAnnounce {
            owner: self.id,
            net_key: NetKey::digest(key),
            size: plain_size as i64 + NONCE_SIZE as i64,
        };

        // Snapshot the peer set in address order so two concurrent
        // stores acquire write locks in the same sequence
        let mut targets: Vec<Arc<Peer>> =
            self.peers.read().unwrap().values().cloned().collect();
        targets.sort_by_key(|p| p.addr());

        if targets.is_empty() {
            debug!("[{}] stored {} bytes, no peers to replicate to", self.id, plain_size);
            return Ok(plain_size);
        }

        // Hold every peer's write side for the whole announce + stream
        // pair so nothing can interleave on those connections
        let sinks: Vec<PeerSink> = targets.iter().map(|p| p.lock_writer()).collect();
        let mut fan = FanoutWriter::new(sinks);

        let mut announce_wire = vec![protocol::MSG_TAG];
        announce_wire.extend_from_slice(&announce.encode()?);
        fan.broadcast(&announce_wire);

        // Let the peers' dispatch loops reach their expecting-stream
        // state before the body lands
        thread::sleep(ANNOUNCE_SETTLE);

        fan.broadcast(&[STREAM_TAG]);
        crypto::encrypt_copy(&self.enc_key, &mut &buffer[..], &mut fan)?;

        info!(
            "[{}] stored {} bytes and replicated to {} peer(s)",
            self.id,
            plain_size,
            fan.live()
        );
        Ok(plain_size)
    }

    /// Retrieve the value for `key`, from local storage when present,
    /// otherwise from the first peer that responds with a replica.
    /// The caller is responsible for releasing the returned reader.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use stash_lib::{Node, NodeConfig};
    /// use std::io::Read;
    ///
    /// let node = Node::new(NodeConfig::default());
    /// // ... start the node and let the mesh form ...
    ///
    /// let (size, mut reader) = node.get(b"picture_0.png").unwrap();
    /// let mut data = Vec::new();
    /// reader.read_to_end(&mut data).unwrap();
    /// assert_eq!(size as usize, data.len());
    /// ```
    pub fn get(&self, key: &[u8]) -> Result<(u64, File), StashError> {
        if self.store.has(&self.id, key) {
            debug!("[{}] serving key from local storage", self.id);
            return self.store.read(&self.id, key);
        }

        let request = Message::GetRequest {
            owner: self.id,
            net_key: NetKey::digest(key),
        };
        self.requests_sent.fetch_add(1, Ordering::SeqCst);

        let targets: Vec<Arc<Peer>> =
            self.peers.read().unwrap().values().cloned().collect();
        for peer in &targets {
            if let Err(e) = peer.send_message(&request) {
                warn!("[{}] request broadcast failed: {}", peer.addr(), e);
            }
        }

        // Crude response deadline; peers that answer later are drained
        thread::sleep(RETRIEVE_WAIT);

        let mut fetched = false;
        for peer in &targets {
            if !peer.stream_pending() {
                continue;
            }
            let result = if fetched {
                self.drain_response(peer)
            } else {
                self.fetch_response(peer, key)
            };
            // Always release the gate so the read loop can resume or
            // observe the closed socket
            peer.close_stream();
            match result {
                Ok(()) => fetched = true,
                Err(e) => {
                    warn!("[{}] response failed: {}", peer.addr(), e);
                    peer.close();
                    if !fetched {
                        // A failed fetch may have left a partial file
                        let _ = self.store.delete(&self.id, key);
                    }
                }
            }
        }

        if !self.store.has(&self.id, key) {
            return Err(StashError::NotFound);
        }
        self.store.read(&self.id, key)
    }

    /// Whether this node holds `key` locally
    pub fn has(&self, key: &[u8]) -> bool {
        self.store.has(&self.id, key)
    }

    /// Remove the local copy of `key`. Replicas held by peers are
    /// untouched and remain retrievable.
    pub fn delete(&self, key: &[u8]) -> Result<(), StashError> {
        self.store.delete(&self.id, key)
    }

    /// Consume the size-prefixed ciphertext a peer streamed back and
    /// land it in local storage under the original key
    fn fetch_response(&self, peer: &Peer, key: &[u8]) -> Result<(), StashError> {
        let mut reader = peer.reader();
        let size = reader.read_i64::<LittleEndian>()?;
        if size < NONCE_SIZE as i64 {
            return Err(StashError::BadStreamSize(size));
        }

        let mut limited = reader.take(size as u64);
        let plain = self
            .store
            .write_decrypt(&self.enc_key, &self.id, key, &mut limited)?;
        if plain + NONCE_SIZE as u64 != size as u64 {
            return Err(StashError::ShortStream {
                want: size as u64,
                got: plain + NONCE_SIZE as u64,
            });
        }

        debug!(
            "[{}] fetched {} bytes from peer {}",
            self.id,
            plain,
            peer.addr()
        );
        Ok(())
    }

    /// A later responder lost the race; read its stream to length and
    /// discard the bytes so the connection stays framed
    fn drain_response(&self, peer: &Peer) -> Result<(), StashError> {
        let mut reader = peer.reader();
        let size = reader.read_i64::<LittleEndian>()?;
        if size < 0 {
            return Err(StashError::BadStreamSize(size));
        }
        io::copy(&mut reader.take(size as u64), &mut io::sink())?;
        debug!("[{}] drained duplicate response", peer.addr());
        Ok(())
    }

    /// Route one inbound frame. Runs on the dispatch thread; frames
    /// from the same peer arrive in receive order.
    fn dispatch(&self, frame: Frame) {
        match frame.payload {
            FramePayload::Message(Message::StoreAnnounce {
                owner,
                net_key,
                size,
            }) => {
                if let Err(e) = self.on_store_announce(frame.from, owner, net_key, size) {
                    warn!("[{}] announce handling failed: {}", frame.from, e);
                }
            }
            FramePayload::Message(Message::GetRequest { owner, net_key }) => {
                if let Err(e) = self.on_get_request(frame.from, owner, net_key) {
                    warn!("[{}] request handling failed: {}", frame.from, e);
                }
            }
            FramePayload::Stream => {
                // Body is consumed by the announce handler or by a
                // waiting retrieval, never by the dispatch loop
                trace!("[{}] stream frame", frame.from);
            }
        }
    }

    /// A peer is about to stream `size` bytes of ciphertext at us.
    /// Persist them verbatim; we do not hold the originator's key.
    fn on_store_announce(
        &self,
        from: SocketAddr,
        owner: NodeId,
        net_key: NetKey,
        size: i64,
    ) -> Result<(), StashError> {
        let peer = match self.peer(from) {
            Some(peer) => peer,
            None => return Ok(()),
        };
        if size < 0 {
            peer.close();
            return Err(StashError::BadStreamSize(size));
        }

        // The body read must not race the read loop for the stream
        // tag byte; wait until the decoder has parked on the gate
        if !peer.wait_stream(STREAM_ARRIVAL_WAIT) {
            peer.close();
            return Err(StashError::NoStream);
        }

        let mut limited = peer.reader().take(size as u64);
        let result = self
            .store
            .write(&owner, net_key.to_hex().as_bytes(), &mut limited);
        peer.close_stream();

        match result {
            Ok(got) if got == size as u64 => {
                info!(
                    "[{}] holding {} byte replica of {} for {}",
                    self.id, got, net_key, owner
                );
                Ok(())
            }
            Ok(got) => {
                // Fewer bytes than announced; the connection is no
                // longer framed and must go
                peer.close();
                Err(StashError::ShortStream {
                    want: size as u64,
                    got,
                })
            }
            Err(e) => {
                peer.close();
                Err(e)
            }
        }
    }

    /// A peer wants a file back. Respond only if we hold it; missing
    /// files are ignored without a reply.
    fn on_get_request(
        &self,
        from: SocketAddr,
        owner: NodeId,
        net_key: NetKey,
    ) -> Result<(), StashError> {
        let hex_key = net_key.to_hex();
        if !self.store.has(&owner, hex_key.as_bytes()) {
            debug!("[{}] no replica of {} for {}", self.id, net_key, owner);
            return Ok(());
        }
        let peer = match self.peer(from) {
            Some(peer) => peer,
            None => return Ok(()),
        };

        let (size, mut file) = self.store.read(&owner, hex_key.as_bytes())?;

        // Tag, little-endian size, then the raw file bytes, all under
        // the peer's write lock
        let mut sink = peer.lock_writer();
        sink.write_all(&[STREAM_TAG])?;
        sink.write_i64::<LittleEndian>(size as i64)?;
        io::copy(&mut file, &mut sink)?;
        sink.flush()?;

        info!(
            "[{}] served {} byte replica of {} to {}",
            self.id,
            size,
            net_key,
            peer.addr()
        );
        Ok(())
    }

    fn peer(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        self.peers.read().unwrap().get(&addr).cloned()
    }
}

/// Copies every byte read from the inner reader into a side buffer,
/// so one pass can feed both the local store and the replication
/// broadcast
struct TeeReader<'a, R> {
    inner: &'a mut R,
    copy: &'a mut Vec<u8>,
}

impl<'a, R: Read> TeeReader<'a, R> {
    fn new(inner: &'a mut R, copy: &'a mut Vec<u8>) -> Self {
        TeeReader { inner, copy }
    }
}

impl<'a, R: Read> Read for TeeReader<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.copy.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

/// Fans one byte stream out to every held peer sink. A peer that
/// fails a write is logged and dropped from the remainder of the
/// broadcast; it never aborts the other peers.
struct FanoutWriter<'a> {
    sinks: Vec<Option<PeerSink<'a>>>,
}

impl<'a> FanoutWriter<'a> {
    fn new(sinks: Vec<PeerSink<'a>>) -> Self {
        FanoutWriter {
            sinks: sinks.into_iter().map(Some).collect(),
        }
    }

    /// Peers still receiving the broadcast
    fn live(&self) -> usize {
        self.sinks.iter().filter(|s| s.is_some()).count()
    }

    fn broadcast(&mut self, buf: &[u8]) {
        for slot in self.sinks.iter_mut() {
            if let Some(sink) = slot {
                if let Err(e) = sink.write_all(buf) {
                    warn!("[{}] broadcast failed: {}", sink.peer().addr(), e);
                    *slot = None;
                }
            }
        }
    }
}

impl<'a> Write for FanoutWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.broadcast(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for slot in self.sinks.iter_mut() {
            if let Some(sink) = slot {
                if let Err(e) = sink.flush() {
                    warn!("[{}] broadcast flush failed: {}", sink.peer().addr(), e);
                    *slot = None;
                }
            }
        }
        Ok(())
    }
}
