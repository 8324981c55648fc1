//! Length-prefixed framing for byte-stream transports.
//!
//! Each payload is prefixed with a 4-byte big-endian length header.

use centi_types::TransportError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Prefix a payload with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or(TransportError::FrameTooLarge {
            size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            max: MAX_FRAME_SIZE,
        })?;
    let mut bytes = Vec::with_capacity(4 + payload.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Write one framed payload.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(payload)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed payload. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TransportError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_prefix() {
        let bytes = encode_frame(b"hello").unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        assert_eq!(&bytes[4..], b"hello");
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, &[]).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let mut reader = tokio_test::io::Builder::new()
            .read(&[0, 0])
            .read(&[0, 5, b'h', b'e'])
            .read(b"llo")
            .build();
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), b"hello");
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let mut reader = tokio_test::io::Builder::new()
            .read(&[0, 0, 0, 8])
            .read(b"abc")
            .build();
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(TransportError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_write_frame_bytes() {
        let mut writer = tokio_test::io::Builder::new()
            .write(&[0, 0, 0, 2, b'h', b'i'])
            .build();
        write_frame(&mut writer, b"hi").await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes()).await.unwrap();
        match read_frame(&mut b).await {
            Err(TransportError::FrameTooLarge { size, max }) => {
                assert_eq!(size, MAX_FRAME_SIZE + 1);
                assert_eq!(max, MAX_FRAME_SIZE);
            }
            other => panic!("Expected FrameTooLarge, got {other:?}"),
        }
    }
}
