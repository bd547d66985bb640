//! Provides the TCP transport
//!
//! One listening endpoint, any number of dialed connections, and one
//! dedicated read-loop thread per live connection. All decoded frames
//! from all peers funnel into a single inbound queue in per-peer
//! arrival order; order across peers is undefined. While a stream
//! frame is being consumed the connection's decoder is parked on the
//! peer's stream gate, which is what lets control messages and opaque
//! bodies share one connection without framing the bodies.
use crate::errors::StashError;
use crate::protocol::{self, Frame, FramePayload};
use log::{debug, warn};
use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

mod peer;
pub use peer::{Direction, Peer, PeerSink};

/// Per-connection validator run before the peer is surfaced.
/// The default accepts everything.
pub type HandshakeFn = Arc<dyn Fn(&Peer) -> Result<(), StashError> + Send + Sync>;

/// Invoked after a successful handshake; typically inserts the peer
/// into the owner's peer set. An error drops the connection.
pub type OnPeerFn = Arc<dyn Fn(Arc<Peer>) -> Result<(), StashError> + Send + Sync>;

/// Invoked when a connection's read loop exits for any reason, so
/// the owner can remove the peer from its set
pub type OnDropFn = Arc<dyn Fn(SocketAddr) + Send + Sync>;

pub struct TransportConfig {
    pub listen_addr: String,
    pub handshake: HandshakeFn,
    pub on_peer: OnPeerFn,
    pub on_drop: OnDropFn,
}

impl TransportConfig {
    /// Config with no-op hooks
    pub fn new<S: Into<String>>(listen_addr: S) -> TransportConfig {
        TransportConfig {
            listen_addr: listen_addr.into(),
            handshake: Arc::new(|_| Ok(())),
            on_peer: Arc::new(|_| Ok(())),
            on_drop: Arc::new(|_| ()),
        }
    }
}

pub struct TcpTransport {
    config: TransportConfig,
    inbound_tx: Mutex<Sender<Frame>>,
    inbound_rx: Mutex<Option<Receiver<Frame>>>,
    conns: Mutex<HashMap<SocketAddr, TcpStream>>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Arc<TcpTransport> {
        let (tx, rx) = channel();
        Arc::new(TcpTransport {
            config,
            inbound_tx: Mutex::new(tx),
            inbound_rx: Mutex::new(Some(rx)),
            conns: Mutex::new(HashMap::new()),
            local_addr: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Address the listener actually bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Take the single receiver carrying every decoded inbound frame.
    /// Can only be consumed once.
    pub fn consume(&self) -> Result<Receiver<Frame>, StashError> {
        self.inbound_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(StashError::AlreadyConsumed)
    }

    /// Bind the listener and start accepting connections on a
    /// background thread. Returns once bound.
    pub fn listen_and_accept(self: &Arc<Self>) -> Result<SocketAddr, StashError> {
        let listener = TcpListener::bind(&self.config.listen_addr)?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(addr);
        self.running.store(true, Ordering::SeqCst);

        let transport = Arc::clone(self);
        thread::spawn(move || transport.accept_loop(listener));
        Ok(addr)
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!("accept failed: {}", e);
                    continue;
                }
            };

            // close() wakes this thread with a throwaway connection
            if !self.running.load(Ordering::SeqCst) {
                let _ = stream.shutdown(Shutdown::Both);
                break;
            }

            debug!("[{}] accepted connection", addr);
            let transport = Arc::clone(&self);
            thread::spawn(move || transport.handle_connection(stream, Direction::Inbound));
        }
    }

    /// Initiate an outbound connection and hand it to the same
    /// per-connection handler as accepted ones
    pub fn dial(self: &Arc<Self>, addr: &str) -> Result<(), StashError> {
        let stream = TcpStream::connect(addr)?;
        debug!("[{}] dialed connection", addr);

        let transport = Arc::clone(self);
        thread::spawn(move || transport.handle_connection(stream, Direction::Outbound));
        Ok(())
    }

    /// Wrap, validate, surface, then decode frames until the
    /// connection dies
    fn handle_connection(self: Arc<Self>, stream: TcpStream, direction: Direction) {
        let addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("connection lost before wrap: {}", e);
                return;
            }
        };

        // Track the raw handle so close() can tear it down
        if let Ok(handle) = stream.try_clone() {
            self.conns.lock().unwrap().insert(addr, handle);
        }

        let peer = Arc::new(Peer::new(stream, addr, direction));

        if let Err(e) = (self.config.handshake)(&peer) {
            warn!("[{}] handshake failed: {}", addr, e);
            peer.close();
            self.conns.lock().unwrap().remove(&addr);
            return;
        }

        if let Err(e) = (self.config.on_peer)(Arc::clone(&peer)) {
            warn!("[{}] peer rejected: {}", addr, e);
            peer.close();
            self.conns.lock().unwrap().remove(&addr);
            return;
        }

        self.read_loop(&peer);

        peer.close();
        self.conns.lock().unwrap().remove(&addr);
        (self.config.on_drop)(addr);
        debug!("[{}] connection closed", addr);
    }

    fn read_loop(&self, peer: &Arc<Peer>) {
        let addr = peer.addr();
        let tx = self.inbound_tx.lock().unwrap().clone();

        loop {
            match protocol::read_frame(&mut peer.reader()) {
                Ok(FramePayload::Message(msg)) => {
                    // Stamp the sender address onto the frame
                    let frame = Frame {
                        from: addr,
                        payload: FramePayload::Message(msg),
                    };
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
                Ok(FramePayload::Stream) => {
                    // Suspend decoding for the duration of the body.
                    // The consumer signals completion through the gate.
                    peer.begin_stream();
                    let frame = Frame {
                        from: addr,
                        payload: FramePayload::Stream,
                    };
                    if tx.send(frame).is_err() {
                        peer.close_stream();
                        break;
                    }
                    peer.wait_stream_done();
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) && !e.is_disconnect() {
                        warn!("[{}] read loop terminated: {}", addr, e);
                    }
                    break;
                }
            }
        }
    }

    /// Stop accepting, close the listener, and close every live
    /// connection so the read loops observe the shutdown
    pub fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for (_, conn) in self.conns.lock().unwrap().drain() {
            let _ = conn.shutdown(Shutdown::Both);
        }

        // Unblock the accept thread; it sees running == false and exits
        if let Some(addr) = self.local_addr() {
            let _ = TcpStream::connect(addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_queue_consumed_once() {
        let transport = TcpTransport::new(TransportConfig::new("127.0.0.1:0"));
        assert!(transport.consume().is_ok());
        match transport.consume() {
            Err(StashError::AlreadyConsumed) => {}
            other => panic!("expected AlreadyConsumed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_dial_refused_is_an_error() {
        let transport = TcpTransport::new(TransportConfig::new("127.0.0.1:0"));
        // Nothing listens on the discard port
        assert!(transport.dial("127.0.0.1:9").is_err());
    }

    #[test]
    fn test_close_without_listen_is_a_noop() {
        let transport = TcpTransport::new(TransportConfig::new("127.0.0.1:0"));
        transport.close();
        transport.close();
    }

    #[test]
    fn test_listen_binds_an_ephemeral_port() {
        let transport = TcpTransport::new(TransportConfig::new("127.0.0.1:0"));
        assert!(transport.local_addr().is_none());
        let addr = transport.listen_and_accept().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(transport.local_addr(), Some(addr));
        transport.close();
    }
}
