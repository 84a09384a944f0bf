//! Stateless message codec.
//!
//! A message is a JSON object; on a stream each message is preceded by its
//! length as a 4-byte big-endian integer.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::CoreError;
use crate::message::Message;

/// Largest accepted frame payload (1 MiB).
pub const MAX_FRAME_LEN: usize = 1 << 20;

const LEN_PREFIX: usize = 4;

/// Encode a message body (no length prefix).
pub fn encode(msg: &Message) -> Result<Vec<u8>, CoreError> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decode and validate a message body.
pub fn decode(bytes: &[u8]) -> Result<Message, CoreError> {
    let msg: Message = serde_json::from_slice(bytes)?;
    msg.validate()?;
    Ok(msg)
}

/// Append one length-prefixed frame to `dst`.
pub fn encode_frame(msg: &Message, dst: &mut BytesMut) -> Result<(), CoreError> {
    let body = encode(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(CoreError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    dst.reserve(LEN_PREFIX + body.len());
    dst.put_u32(body.len() as u32);
    dst.put_slice(&body);
    Ok(())
}

/// Try to take one complete frame off the front of `src`.
///
/// Returns `Ok(None)` when more bytes are needed. A frame whose declared
/// length exceeds [`MAX_FRAME_LEN`] is an error; the stream cannot be
/// resynchronised after that.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Message>, CoreError> {
    if src.len() < LEN_PREFIX {
        return Ok(None);
    }
    let mut prefix = [0u8; LEN_PREFIX];
    prefix.copy_from_slice(&src[..LEN_PREFIX]);
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CoreError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_LEN,
        });
    }
    if src.len() < LEN_PREFIX + len {
        src.reserve(LEN_PREFIX + len - src.len());
        return Ok(None);
    }
    src.advance(LEN_PREFIX);
    let body = src.split_to(len);
    decode(&body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DomainId;

    fn withdraw(seq: u64) -> Message {
        Message::Withdraw {
            dest_domain: DomainId::from("C"),
            seq,
        }
    }

    #[test]
    fn test_frame_roundtrip_multiple() {
        let mut buf = BytesMut::new();
        encode_frame(&withdraw(1), &mut buf).unwrap();
        encode_frame(&Message::Keepalive, &mut buf).unwrap();

        assert_eq!(decode_frame(&mut buf).unwrap(), Some(withdraw(1)));
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Message::Keepalive));
        assert_eq!(decode_frame(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut full = BytesMut::new();
        encode_frame(&withdraw(7), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert_eq!(decode_frame(&mut partial).unwrap(), None);

        partial.extend_from_slice(&full[full.len() - 3..]);
        assert_eq!(decode_frame(&mut partial).unwrap(), Some(withdraw(7)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(CoreError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_malformed_body() {
        assert!(matches!(
            decode(b"{\"type\":\"NOPE\"}"),
            Err(CoreError::Malformed(_))
        ));
        assert!(decode(b"not json").is_err());
    }

    #[test]
    fn test_decode_runs_validation() {
        let body = br#"{"type":"QUERY","destDomain":"C","amount":0,"asset":"USD","deadline":"2030-01-01T00:00:00Z"}"#;
        assert!(matches!(decode(body), Err(CoreError::InvalidAmount(_))));
    }
}
