//! Provides the framed wire protocol
//!
//! Every peer connection carries two multiplexed channels behind a
//! one-byte tag: discrete control messages, and opaque byte streams
//! of a length declared by the preceding announcement. Stream bodies
//! are never framed themselves; the decoder hands the raw connection
//! back to the caller and pauses until the body has been consumed.
use crate::errors::StashError;
use crate::identity::{NetKey, NodeId};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::SocketAddr;

#[cfg(test)]
mod tests;

/// Channel tag preceding an encoded control message
pub const MSG_TAG: u8 = 0x01;

/// Channel tag preceding an opaque byte stream
pub const STREAM_TAG: u8 = 0x02;

/// Upper bound on an encoded control message. Anything larger is a
/// protocol error, not a bigger buffer.
pub const MAX_MESSAGE_SIZE: u64 = 1028;

/// The wrapped message type for every exchanged control message
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub enum Message {
    /// Announces that a stream of exactly `size` bytes of ciphertext
    /// (nonce included) follows on this connection
    StoreAnnounce {
        owner: NodeId,
        net_key: NetKey,
        size: i64,
    },

    /// Asks every peer holding the named file to stream it back
    GetRequest { owner: NodeId, net_key: NetKey },
}

/// One decoded unit off the wire, before the sender address is known
#[derive(Debug)]
pub enum FramePayload {
    /// A complete control message
    Message(Message),

    /// An opaque stream follows; no body bytes have been consumed
    Stream,
}

/// A decoded frame stamped with the address of the peer it came from
#[derive(Debug)]
pub struct Frame {
    pub from: SocketAddr,
    pub payload: FramePayload,
}

/// Bincode settings shared by both directions. The limit keeps a
/// malformed length field from allocating unbounded scratch.
fn wire_options() -> impl Options {
    bincode::options().with_limit(MAX_MESSAGE_SIZE)
}

impl Message {
    /// Serialize into the deterministic wire encoding
    pub fn encode(&self) -> Result<Vec<u8>, StashError> {
        Ok(wire_options().serialize(self)?)
    }

    /// Deserialize from existing data
    pub fn decode(data: &[u8]) -> Result<Self, StashError> {
        Ok(wire_options().deserialize(data)?)
    }
}

/// Read one frame from the connection. For a message frame the
/// encoded body is consumed in full; for a stream frame the reader is
/// left positioned at the first body byte, which the caller must
/// consume before decoding anything further.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<FramePayload, StashError> {
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag)?;

    match tag[0] {
        MSG_TAG => Ok(FramePayload::Message(
            wire_options().deserialize_from(reader)?,
        )),
        STREAM_TAG => Ok(FramePayload::Stream),
        other => Err(StashError::UnknownTag(other)),
    }
}

/// Emit a tagged control message as a single write
pub fn write_message<W: Write>(writer: &mut W, msg: &Message) -> Result<usize, StashError> {
    let mut buf = Vec::with_capacity(64);
    buf.push(MSG_TAG);
    buf.extend_from_slice(&msg.encode()?);
    writer.write_all(&buf)?;
    Ok(buf.len())
}
