//! Frame codec for the length-prefixed echo protocol.
//!
//! Every message, in either direction, is a 4-byte big-endian length
//! followed by exactly that many payload bytes:
//!
//! ```text
//! [L: u32, big-endian][L bytes of payload]
//!
//! Example:
//! 00 00 00 05 68 65 6c 6c 6f    ("hello")
//! ```
//!
//! There is no magic number, version byte or checksum. Client and server
//! frames are structurally identical, so the same codec serves both the
//! load generator and the scripted servers used in tests.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Codec failures.
#[derive(Debug)]
pub enum FrameError {
    /// Payload does not fit in the 32-bit length field.
    TooLarge(usize),
    /// A received prefix declares more bytes than the reader accepts.
    Oversized { declared: usize, limit: usize },
    /// The stream closed part way through a frame.
    Truncated {
        /// Bytes the current read needed.
        expected: usize,
        /// Bytes that arrived before the close.
        received: usize,
    },
    /// Underlying transport error.
    Io(std::io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TooLarge(len) => {
                write!(f, "payload of {len} bytes exceeds the 32-bit length field")
            }
            FrameError::Oversized { declared, limit } => write!(
                f,
                "frame declares {declared} bytes, limit is {limit}"
            ),
            FrameError::Truncated { expected, received } => write!(
                f,
                "stream closed after {received} of {expected} expected bytes"
            ),
            FrameError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Total on-wire size of a frame carrying `payload_len` bytes.
pub fn frame_len(payload_len: usize) -> usize {
    HEADER_LEN + payload_len
}

/// Encode `payload` into a new frame.
pub fn encode(payload: &[u8]) -> Result<BytesMut, FrameError> {
    let mut dst = BytesMut::with_capacity(frame_len(payload.len()));
    encode_into(payload, &mut dst)?;
    Ok(dst)
}

/// Append a frame carrying `payload` to `dst`.
fn encode_into(payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge(payload.len()))?;
    dst.reserve(frame_len(payload.len()));
    dst.put_u32(length);
    dst.put_slice(payload);
    Ok(())
}

/// Read one length prefix.
///
/// Returns `Ok(None)` when the stream closes cleanly before any byte of
/// the frame arrives. A close after a partial prefix is `Truncated`.
async fn read_header<R>(reader: &mut R) -> Result<Option<u32>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;

    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated {
                expected: HEADER_LEN,
                received: filled,
            });
        }
        filled += n;
    }

    Ok(Some(u32::from_be_bytes(header)))
}

/// Read exactly `length` payload bytes.
async fn read_payload<R>(reader: &mut R, length: usize) -> Result<Bytes, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = BytesMut::zeroed(length);
    let mut filled = 0;

    while filled < length {
        let n = reader.read(&mut payload[filled..]).await?;
        if n == 0 {
            return Err(FrameError::Truncated {
                expected: length,
                received: filled,
            });
        }
        filled += n;
    }

    Ok(payload.freeze())
}

/// Read one complete frame and return its payload.
///
/// `Ok(None)` means the peer closed the stream between frames. A prefix
/// declaring more than `limit` bytes fails before any payload is read.
pub async fn decode<R>(reader: &mut R, limit: usize) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let length = match read_header(reader).await? {
        Some(length) => length as usize,
        None => return Ok(None),
    };
    if length > limit {
        return Err(FrameError::Oversized {
            declared: length,
            limit,
        });
    }
    read_payload(reader, length).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_encode_prefix() {
        let frame = encode(b"hello").unwrap();
        assert_eq!(&frame[..], b"\x00\x00\x00\x05hello");
    }

    #[test]
    fn test_encode_empty() {
        let frame = encode(b"").unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_prefix_matches_body_length() {
        for len in [0usize, 1, 100, 65_536, 100_000] {
            let payload = vec![b'x'; len];
            let frame = encode(&payload).unwrap();
            let prefix = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
            assert_eq!(prefix as usize, frame.len() - HEADER_LEN);
        }
    }

    #[test]
    fn test_encode_into_appends() {
        let mut buf = BytesMut::new();
        encode_into(b"ab", &mut buf).unwrap();
        encode_into(b"c", &mut buf).unwrap();
        assert_eq!(&buf[..], b"\x00\x00\x00\x02ab\x00\x00\x00\x01c");
    }

    #[tokio::test]
    async fn test_decode_split_reads() {
        let mut mock = Builder::new()
            .read(b"\x00\x00")
            .read(b"\x00\x04te")
            .read(b"st")
            .build();

        let payload = decode(&mut mock, usize::MAX).await.unwrap().unwrap();
        assert_eq!(&payload[..], b"test");
    }

    #[tokio::test]
    async fn test_decode_round_trip() {
        let sizes = [0usize, 1, 4, 100, 5000, 100_000];
        for len in sizes {
            let payload = crate::payload::random(len);
            let frame = encode(&payload).unwrap();
            let mut reader: &[u8] = &frame;
            let decoded = decode(&mut reader, usize::MAX).await.unwrap().unwrap();
            assert_eq!(&decoded[..], &payload[..]);
        }
    }

    #[tokio::test]
    async fn test_decode_limit() {
        let frame = encode(b"0123456789").unwrap();
        let mut reader: &[u8] = &frame;
        match decode(&mut reader, 4).await {
            Err(FrameError::Oversized {
                declared: 10,
                limit: 4,
            }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decode_clean_close() {
        let mut reader: &[u8] = b"";
        assert!(decode(&mut reader, usize::MAX).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_decode_truncated_header() {
        let mut reader: &[u8] = b"\x00\x00";
        match decode(&mut reader, usize::MAX).await {
            Err(FrameError::Truncated {
                expected: 4,
                received: 2,
            }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decode_truncated_payload() {
        let mut mock = Builder::new().read(b"\x00\x00\x00\x0ahello").build();
        match decode(&mut mock, usize::MAX).await {
            Err(FrameError::Truncated {
                expected: 10,
                received: 5,
            }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decode_io_error() {
        let mut mock = Builder::new()
            .read(b"\x00\x00\x00\x01")
            .read_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            ))
            .build();
        assert!(matches!(decode(&mut mock, usize::MAX).await, Err(FrameError::Io(_))));
    }
}
