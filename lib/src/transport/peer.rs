//! Provides the live connection wrapper
//!
use crate::errors::StashError;
use crate::protocol::{self, Message};
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// An enum to describe how each connection was established
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Direction {
    /// Accepted from the listener
    Inbound,
    /// Dialed by this node
    Outbound,
}

/// A one-shot signaling primitive used to suspend frame decoding
/// while a stream body is being consumed. The read loop raises the
/// gate when it sees a stream tag and parks until whoever consumed
/// the body releases it.
pub(crate) struct StreamGate {
    raised: Mutex<bool>,
    signal: Condvar,
}

impl StreamGate {
    fn new() -> Self {
        StreamGate {
            raised: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    fn raise(&self) {
        let mut raised = self.raised.lock().unwrap();
        *raised = true;
        self.signal.notify_all();
    }

    fn release(&self) {
        let mut raised = self.raised.lock().unwrap();
        *raised = false;
        self.signal.notify_all();
    }

    fn is_raised(&self) -> bool {
        *self.raised.lock().unwrap()
    }

    /// Block until the gate is raised. Returns false on timeout.
    fn wait_raised(&self, timeout: Duration) -> bool {
        let raised = self.raised.lock().unwrap();
        let (raised, res) = self
            .signal
            .wait_timeout_while(raised, timeout, |raised| !*raised)
            .unwrap();
        drop(raised);
        !res.timed_out()
    }

    /// Block until the gate is released
    fn wait_released(&self) {
        let mut raised = self.raised.lock().unwrap();
        while *raised {
            raised = self.signal.wait(raised).unwrap();
        }
    }
}

/// A live bidirectional byte-stream endpoint. The write side is
/// serialized by a per-peer lock; the read side belongs to the
/// connection's read loop, except while the stream gate is raised,
/// when the consumer of the pending stream borrows it.
pub struct Peer {
    addr: SocketAddr,
    direction: Direction,
    stream: TcpStream,
    write_lock: Mutex<()>,
    gate: StreamGate,
}

impl Peer {
    pub(crate) fn new(stream: TcpStream, addr: SocketAddr, direction: Direction) -> Peer {
        Peer {
            addr,
            direction,
            stream,
            write_lock: Mutex::new(()),
            gate: StreamGate::new(),
        }
    }

    /// Stable identifier used as the peer-set map key
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Write `bytes` atomically with respect to other senders on this
    /// peer
    pub fn send(&self, bytes: &[u8]) -> Result<(), StashError> {
        let _guard = self.write_lock.lock().unwrap();
        let mut writer = &self.stream;
        writer.write_all(bytes)?;
        Ok(())
    }

    /// Frame and send a single control message
    pub fn send_message(&self, msg: &Message) -> Result<usize, StashError> {
        let _guard = self.write_lock.lock().unwrap();
        protocol::write_message(&mut &self.stream, msg)
    }

    /// Hold the write side across a multi-write sequence, e.g. an
    /// announce followed by its stream body
    pub fn lock_writer(&self) -> PeerSink<'_> {
        PeerSink {
            peer: self,
            _guard: self.write_lock.lock().unwrap(),
        }
    }

    /// Raw byte source for consuming a pending stream body. Only
    /// valid while the read loop is parked on the gate.
    pub fn reader(&self) -> &TcpStream {
        &self.stream
    }

    /// Whether a stream body is waiting to be consumed
    pub fn stream_pending(&self) -> bool {
        self.gate.is_raised()
    }

    /// Signal that the pending stream body has been fully consumed,
    /// resuming frame decoding on this connection
    pub fn close_stream(&self) {
        self.gate.release();
    }

    /// Block until a stream body is pending on this connection.
    /// Returns false if none arrives within `timeout`.
    pub fn wait_stream(&self, timeout: Duration) -> bool {
        self.gate.wait_raised(timeout)
    }

    pub(crate) fn begin_stream(&self) {
        self.gate.raise();
    }

    pub(crate) fn wait_stream_done(&self) {
        self.gate.wait_released();
    }

    /// Tear down the underlying connection. The read loop observes
    /// the shutdown on its next read.
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Exclusive handle to a peer's write side
pub struct PeerSink<'a> {
    peer: &'a Peer,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> PeerSink<'a> {
    pub fn peer(&self) -> &Peer {
        self.peer
    }
}

impl<'a> Write for PeerSink<'a> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (&self.peer.stream).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        (&self.peer.stream).flush()
    }
}
