//! Binary wire framing for Paxoi.
//!
//! Every connection in the system (replica mesh, client links, master
//! RPC) carries length-prefixed frames:
//!
//! ```text
//! ┌────────────────┬─────────────────────────┐
//! │ len: u32 LE    │ postcard payload (len)  │
//! └────────────────┴─────────────────────────┘
//! ```
//!
//! The payload encoding is postcard: little-endian integers with
//! varint collection counts, which round-trips every message type
//! byte-exactly. Zero-length collections are encoded explicitly, so
//! `Some(vec![])` and `None` survive a round trip as distinct values.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected as malformed.
///
/// A `Sync` snapshot of a full history ring stays well under this; a
/// larger length prefix means a corrupt or hostile peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Errors produced by the frame codec.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN}-byte limit")]
    FrameTooLarge(usize),

    #[error("malformed payload: {0}")]
    Codec(#[from] postcard::Error),
}

/// Encodes a value to its postcard payload bytes (no length prefix).
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, WireError> {
    Ok(Bytes::from(postcard::to_allocvec(value)?))
}

/// Decodes a postcard payload produced by [`encode`].
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, WireError> {
    Ok(postcard::from_bytes(payload)?)
}

/// Writes one framed value to `writer`.
///
/// Prefix and payload are assembled into one buffer so each frame
/// goes out in a single write.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = encode(value)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(payload.len()));
    }
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32_le(payload.len() as u32);
    frame.put_slice(&payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed value from `reader`.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = (&len_buf[..]).get_u32_le() as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await?;
    Ok(Some(decode(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use paxoi_types::{ClientId, CommandId, Dep, SHash, SeqNum};
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        dep: Dep,
        checksum: Option<Vec<SHash>>,
    }

    fn roundtrip<T: Serialize + serde::de::DeserializeOwned + PartialEq + std::fmt::Debug>(
        value: &T,
    ) -> T {
        decode(&encode(value).expect("encode")).expect("decode")
    }

    #[test]
    fn empty_checksum_is_not_absent_checksum() {
        let some_empty = Probe {
            dep: Dep::new(),
            checksum: Some(Vec::new()),
        };
        let none = Probe {
            dep: Dep::new(),
            checksum: None,
        };
        assert_eq!(roundtrip(&some_empty), some_empty);
        assert_eq!(roundtrip(&none), none);
        assert_ne!(
            encode(&some_empty).unwrap(),
            encode(&none).unwrap(),
        );
    }

    #[tokio::test]
    async fn framed_roundtrip_over_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let probe = Probe {
            dep: Dep::from_ids(vec![CommandId::new(ClientId::new(3), SeqNum::new(4))]),
            checksum: Some(vec![SHash::digest(b"dep")]),
        };

        write_frame(&mut a, &probe).await.expect("write");
        let got: Option<Probe> = read_frame(&mut b).await.expect("read");
        assert_eq!(got, Some(probe));

        drop(a);
        let eof: Option<Probe> = read_frame(&mut b).await.expect("eof read");
        assert!(eof.is_none());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let (mut a, mut b) = tokio::io::duplex(64);
            tokio::io::AsyncWriteExt::write_all(&mut a, &u32::MAX.to_le_bytes())
                .await
                .unwrap();
            let got: Result<Option<Probe>, _> = read_frame(&mut b).await;
            assert!(matches!(got, Err(WireError::FrameTooLarge(_))));
        });
    }

    proptest! {
        // Round-trip law over dependency lists of arbitrary shape.
        #[test]
        fn dep_roundtrips(ids in proptest::collection::vec((any::<i32>(), any::<i32>()), 0..24)) {
            let dep: Dep = ids
                .into_iter()
                .map(|(c, s)| CommandId::new(ClientId::new(c), SeqNum::new(s)))
                .collect();
            let probe = Probe { checksum: Some(dep.checksum_vec()), dep };
            prop_assert_eq!(roundtrip(&probe), probe);
        }
    }
}
