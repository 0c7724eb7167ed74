//! Wire format.
//!
//! Peer messages are JSON objects. Stream transports carry them as frames:
//!   [4 bytes big-endian length][JSON payload]

use syncroom_types::PeerMessage;

use crate::error::ProtocolError;

/// Maximum frame payload size (1 MiB). Prevents allocation bombs.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Serialise a control message to its JSON payload.
pub fn encode_message(msg: &PeerMessage) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Decode a JSON payload into a known control message.
///
/// Anything that is not one of the [`PeerMessage`] variants is rejected here,
/// once, so handlers only ever see well-typed input.
pub fn decode_message(payload: &[u8]) -> Result<PeerMessage, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Prefix a payload with its big-endian length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = checked_len(payload.len())?;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Validate a received length header and return the payload size.
pub fn decode_frame_len(header: [u8; 4]) -> Result<usize, ProtocolError> {
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len as usize,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(len as usize)
}

fn checked_len(size: usize) -> Result<u32, ProtocolError> {
    match u32::try_from(size) {
        Ok(len) if len <= MAX_FRAME_SIZE => Ok(len),
        _ => Err(ProtocolError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncroom_types::UpstreamRecord;

    #[test]
    fn frame_prefix_matches_payload() {
        let payload = encode_message(&PeerMessage::ClockPing { t1: 12345 }).unwrap();
        let frame = encode_frame(&payload).unwrap();
        let header: [u8; 4] = frame[..4].try_into().unwrap();
        assert_eq!(decode_frame_len(header).unwrap(), frame.len() - 4);

        match decode_message(&frame[4..]).unwrap() {
            PeerMessage::ClockPing { t1 } => assert_eq!(t1, 12345),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn oversized_header_is_rejected() {
        let header = (MAX_FRAME_SIZE + 1).to_be_bytes();
        assert!(matches!(
            decode_frame_len(header),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn garbage_and_unknown_variants_fail_to_decode() {
        assert!(matches!(
            decode_message(b"not json"),
            Err(ProtocolError::Decode(_))
        ));
        assert!(matches!(
            decode_message(br#"{"__type":"selfDestruct"}"#),
            Err(ProtocolError::Decode(_))
        ));
        assert!(matches!(
            decode_message(br#"{"func":"selectSong"}"#),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn relay_survives_the_codec() {
        let msg = PeerMessage::Relay {
            record: UpstreamRecord::new("navigate").with("screen", "lobby"),
        };
        let decoded = decode_message(&encode_message(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }
}
