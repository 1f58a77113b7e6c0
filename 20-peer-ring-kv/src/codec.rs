//! Wire format spoken on every peer-to-peer socket.
//!
//! Frames are `|`-joined ASCII tokens. Any string field (peer id, key, value) is
//! preceded by its byte length, and that length is authoritative: the decoder
//! slices exactly that many bytes, so keys and values may themselves contain `|`.
//!
//! Each frame travels in a fixed-size, zero-padded slot. Handshakes use
//! [`HANDSHAKE_SLOT`] bytes and everything on the data channel uses [`DATA_SLOT`]
//! bytes, so readers can `read_exact` one slot at a time regardless of how TCP
//! segments the stream. A frame that does not fit its slot is rejected with
//! [`CodecError::LengthExceeded`] instead of being truncated.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::directory::Priority;

/// Slot size for the identity handshake sent on a freshly dialed socket.
pub const HANDSHAKE_SLOT: usize = 40;

/// Slot size for Write, Delete and LeaderElection frames.
pub const DATA_SLOT: usize = 100;

/// Liveness ping written on heartbeat channels. Fixed length, no delimiter.
pub const HEARTBEAT_PING: &[u8; 5] = b"hello";

const DELIMITER: u8 = b'|';

const WRITE_TAG: &[u8] = b"Write";
const DELETE_TAG: &[u8] = b"Delete";
const ELECTION_TAG: &[u8] = b"LeaderElection";

/// A message carried on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Write { key: String, value: String },
    Delete { key: String },
    LeaderElection { priority: Priority },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("encoded frame needs {len} bytes but the slot holds {limit}")]
    LengthExceeded { len: usize, limit: usize },
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("bad length prefix {0:?}")]
    BadLengthPrefix(String),
    #[error("bad election priority {0:?}")]
    BadPriority(String),
    #[error("frame field is not valid utf-8")]
    InvalidUtf8,
}

impl Frame {
    /// Encodes the frame into a zero-padded [`DATA_SLOT`].
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let text = match self {
            Frame::Write { key, value } => {
                format!("Write|{}|{key}|{}|{value}", key.len(), value.len())
            }
            Frame::Delete { key } => format!("Delete|{}|{key}", key.len()),
            Frame::LeaderElection { priority } => format!("LeaderElection|{priority}"),
        };
        into_slot(text.into_bytes(), DATA_SLOT)
    }

    /// Decodes one data-channel slot.
    pub fn decode(slot: &[u8]) -> Result<Self, CodecError> {
        let mut fields = Fields::new(slot);
        let tag = fields.token()?;

        match tag {
            WRITE_TAG => {
                let key = fields.sized_string()?;
                fields.delimiter()?;
                let value = fields.sized_string()?;
                Ok(Frame::Write { key, value })
            }
            DELETE_TAG => {
                let key = fields.sized_string()?;
                Ok(Frame::Delete { key })
            }
            ELECTION_TAG => {
                let raw = fields.token()?;
                let text = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
                let priority = text
                    .parse()
                    .map_err(|_| CodecError::BadPriority(text.to_string()))?;
                Ok(Frame::LeaderElection { priority })
            }
            _ => Err(CodecError::MalformedFrame("unknown frame tag")),
        }
    }
}

/// Encodes the `<len(id)>|<id>` handshake into a [`HANDSHAKE_SLOT`].
pub fn encode_handshake(id: &str) -> Result<Vec<u8>, CodecError> {
    into_slot(format!("{}|{id}", id.len()).into_bytes(), HANDSHAKE_SLOT)
}

/// Extracts the sender's peer id from a handshake slot.
pub fn decode_handshake(slot: &[u8]) -> Result<String, CodecError> {
    Fields::new(slot).sized_string()
}

/// Reads exactly one slot of `size` bytes.
///
/// Returns `Ok(None)` when the peer closed the connection before a full slot arrived.
pub async fn read_slot<R>(reader: &mut R, size: usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut slot = vec![0u8; size];
    match reader.read_exact(&mut slot).await {
        Ok(_) => Ok(Some(slot)),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err),
    }
}

/// Writes the handshake slot identifying `id` and flushes it.
pub async fn write_handshake<W>(writer: &mut W, id: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let slot = encode_handshake(id).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    writer.write_all(&slot).await?;
    writer.flush().await
}

fn into_slot(mut bytes: Vec<u8>, limit: usize) -> Result<Vec<u8>, CodecError> {
    if bytes.len() > limit {
        return Err(CodecError::LengthExceeded {
            len: bytes.len(),
            limit,
        });
    }
    bytes.resize(limit, 0);
    Ok(bytes)
}

/// Cursor over the fields of one slot.
struct Fields<'a> {
    rest: &'a [u8],
}

impl<'a> Fields<'a> {
    fn new(slot: &'a [u8]) -> Self {
        Self { rest: slot }
    }

    /// Next `|`-terminated token, or the remaining bytes minus padding for the last one.
    fn token(&mut self) -> Result<&'a [u8], CodecError> {
        let body = strip_padding(self.rest);
        if body.is_empty() {
            return Err(CodecError::MalformedFrame("too few fields"));
        }

        match body.iter().position(|&byte| byte == DELIMITER) {
            Some(at) => {
                let token = &self.rest[..at];
                self.rest = &self.rest[at + 1..];
                Ok(token)
            }
            None => {
                self.rest = &[];
                Ok(body)
            }
        }
    }

    /// A length token followed by exactly that many bytes.
    fn sized_string(&mut self) -> Result<String, CodecError> {
        let raw = self.token()?;
        let len: usize = std::str::from_utf8(raw)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| CodecError::BadLengthPrefix(String::from_utf8_lossy(raw).into_owned()))?;

        if len > self.rest.len() {
            return Err(CodecError::BadLengthPrefix(len.to_string()));
        }
        let (field, rest) = self.rest.split_at(len);
        self.rest = rest;
        String::from_utf8(field.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn delimiter(&mut self) -> Result<(), CodecError> {
        match self.rest.split_first() {
            Some((&DELIMITER, rest)) => {
                self.rest = rest;
                Ok(())
            }
            Some(_) => Err(CodecError::MalformedFrame("field overruns its length prefix")),
            None => Err(CodecError::MalformedFrame("too few fields")),
        }
    }
}

fn strip_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|&byte| byte != 0)
        .map_or(0, |at| at + 1);
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_frame_keeps_delimiters_inside_key() {
        let frame = Frame::Write {
            key: "a|b".into(),
            value: "x".into(),
        };
        let slot = frame.encode().expect("encode");
        assert_eq!(slot.len(), DATA_SLOT);
        assert!(slot.starts_with(b"Write|3|a|b|1|x"));

        let decoded = Frame::decode(&slot).expect("decode");
        assert_eq!(
            decoded,
            Frame::Write {
                key: "a|b".into(),
                value: "x".into()
            }
        );
    }

    #[test]
    fn delete_and_election_frames_decode() {
        let delete = Frame::Delete { key: "k|".into() }.encode().expect("encode");
        assert_eq!(
            Frame::decode(&delete),
            Ok(Frame::Delete { key: "k|".into() })
        );

        let probe = Frame::LeaderElection { priority: 42 }
            .encode()
            .expect("encode");
        assert!(probe.starts_with(b"LeaderElection|42\0"));
        assert_eq!(
            Frame::decode(&probe),
            Ok(Frame::LeaderElection { priority: 42 })
        );
    }

    #[test]
    fn empty_key_and_value_are_legal() {
        let slot = Frame::Write {
            key: String::new(),
            value: String::new(),
        }
        .encode()
        .expect("encode");
        assert_eq!(
            Frame::decode(&slot),
            Ok(Frame::Write {
                key: String::new(),
                value: String::new()
            })
        );
    }

    #[test]
    fn oversized_write_is_rejected() {
        let frame = Frame::Write {
            key: "k".repeat(50),
            value: "v".repeat(50),
        };
        assert!(matches!(
            frame.encode(),
            Err(CodecError::LengthExceeded { limit: DATA_SLOT, .. })
        ));
    }

    #[test]
    fn frame_that_exactly_fills_the_slot_is_accepted() {
        // "Write|2|kk|86|" is 14 bytes, leaving 86 for the value.
        let frame = Frame::Write {
            key: "kk".into(),
            value: "v".repeat(86),
        };
        let slot = frame.encode().expect("fits exactly");
        assert_eq!(Frame::decode(&slot), Ok(frame));
    }

    #[test]
    fn too_few_fields_is_malformed() {
        let mut slot = b"Write|3".to_vec();
        slot.resize(DATA_SLOT, 0);
        assert!(matches!(
            Frame::decode(&slot),
            Err(CodecError::MalformedFrame(_))
        ));

        assert!(matches!(
            Frame::decode(&[0u8; DATA_SLOT]),
            Err(CodecError::MalformedFrame(_))
        ));
        assert!(matches!(
            Frame::decode(b"Gossip|1|a"),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn bad_length_prefixes_are_reported() {
        assert!(matches!(
            Frame::decode(b"Delete|x|key"),
            Err(CodecError::BadLengthPrefix(_))
        ));
        assert!(matches!(
            Frame::decode(b"Delete|99|key"),
            Err(CodecError::BadLengthPrefix(_))
        ));
        assert!(matches!(
            Frame::decode(b"Write|1|abc|1|v"),
            Err(CodecError::MalformedFrame(_))
        ));
        assert!(matches!(
            Frame::decode(b"LeaderElection|high"),
            Err(CodecError::BadPriority(_))
        ));
    }

    #[test]
    fn handshake_roundtrip() {
        let slot = encode_handshake("gamma").expect("encode");
        assert_eq!(slot.len(), HANDSHAKE_SLOT);
        assert!(slot.starts_with(b"5|gamma\0"));
        assert_eq!(decode_handshake(&slot), Ok("gamma".to_string()));

        assert!(encode_handshake(&"x".repeat(HANDSHAKE_SLOT)).is_err());
        assert!(decode_handshake(b"junk").is_err());
    }

    #[tokio::test]
    async fn read_slot_reassembles_split_writes() {
        let (mut writer, mut reader) = tokio::io::duplex(256);
        let slot = Frame::Delete { key: "k".into() }.encode().expect("encode");

        writer.write_all(&slot[..7]).await.expect("first half");
        writer.write_all(&slot[7..]).await.expect("second half");
        drop(writer);

        let first = read_slot(&mut reader, DATA_SLOT)
            .await
            .expect("read")
            .expect("slot");
        assert_eq!(Frame::decode(&first), Ok(Frame::Delete { key: "k".into() }));

        let eof = read_slot(&mut reader, DATA_SLOT).await.expect("read");
        assert!(eof.is_none());
    }
}
