use super::{read_frame, write_message, FramePayload, Message, MAX_MESSAGE_SIZE, MSG_TAG, STREAM_TAG};
use crate::errors::StashError;
use crate::identity::{NetKey, NodeId};
use mockstream::SyncMockStream;

macro_rules! assert_err {
    ($expression:expr, $($pattern:tt)+) => {
        match $expression {
            $($pattern)+ => (),
            ref e => panic!("expected `{}` but got `{:?}`", stringify!($($pattern)+), e),
        }
    }
}

fn sample_announce() -> Message {
    Message::StoreAnnounce {
        owner: NodeId::generate(),
        net_key: NetKey::digest(b"picture_0.png"),
        size: 38,
    }
}

fn sample_request() -> Message {
    Message::GetRequest {
        owner: NodeId::generate(),
        net_key: NetKey::digest(b"picture_0.png"),
    }
}

#[test]
fn test_message_roundtrip() {
    for msg in &[sample_announce(), sample_request()] {
        let encoded = msg.encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(&decoded, msg);
    }
}

#[test]
fn test_encoding_is_deterministic() {
    let msg = sample_announce();
    assert_eq!(msg.encode().unwrap(), msg.encode().unwrap());
}

#[test]
fn test_encoded_size_fits_scratch() {
    for msg in &[sample_announce(), sample_request()] {
        assert!((msg.encode().unwrap().len() as u64) < MAX_MESSAGE_SIZE);
    }
}

#[test]
fn test_read_message_frame() {
    let msg = sample_announce();

    let mut stream = SyncMockStream::new();
    let mut wire = vec![MSG_TAG];
    wire.extend_from_slice(&msg.encode().unwrap());
    stream.push_bytes_to_read(&wire);

    match read_frame(&mut stream).unwrap() {
        FramePayload::Message(decoded) => assert_eq!(decoded, msg),
        other => panic!("expected message frame, got {:?}", other),
    }
}

#[test]
fn test_stream_frame_consumes_only_tag() {
    let mut stream = SyncMockStream::new();
    let mut wire = vec![STREAM_TAG];
    wire.extend_from_slice(b"opaque body bytes");
    stream.push_bytes_to_read(&wire);

    match read_frame(&mut stream).unwrap() {
        FramePayload::Stream => {}
        other => panic!("expected stream frame, got {:?}", other),
    }

    // The body must still be on the wire for the caller
    use std::io::Read;
    let mut body = Vec::new();
    stream.read_to_end(&mut body).unwrap();
    assert_eq!(&body, b"opaque body bytes");
}

#[test]
fn test_unknown_tag_is_fatal() {
    let mut stream = SyncMockStream::new();
    stream.push_bytes_to_read(&[0x03, 0xff, 0xff]);
    assert_err!(read_frame(&mut stream), Err(StashError::UnknownTag(0x03)));
}

#[test]
fn test_truncated_message_is_error() {
    let msg = sample_request();
    let mut wire = vec![MSG_TAG];
    wire.extend_from_slice(&msg.encode().unwrap());
    wire.truncate(wire.len() - 5);

    let mut stream = SyncMockStream::new();
    stream.push_bytes_to_read(&wire);
    assert!(read_frame(&mut stream).is_err());
}

#[test]
fn test_write_message_frames_correctly() {
    let msg = sample_request();

    let mut stream = SyncMockStream::new();
    let written = write_message(&mut stream, &msg).unwrap();

    let wire = stream.pop_bytes_written();
    assert_eq!(wire.len(), written);
    assert_eq!(wire[0], MSG_TAG);
    assert_eq!(Message::decode(&wire[1..]).unwrap(), msg);
}

#[test]
fn test_back_to_back_messages() {
    let first = sample_announce();
    let second = sample_request();

    let mut stream = SyncMockStream::new();
    write_message(&mut stream, &first).unwrap();
    write_message(&mut stream, &second).unwrap();
    let wire = stream.pop_bytes_written();
    stream.push_bytes_to_read(&wire);

    for expected in &[first, second] {
        match read_frame(&mut stream).unwrap() {
            FramePayload::Message(m) => assert_eq!(&m, expected),
            other => panic!("expected message frame, got {:?}", other),
        }
    }
}
