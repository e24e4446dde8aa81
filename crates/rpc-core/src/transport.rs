//! Transport abstraction: "any reliable ordered bidirectional byte stream
//! with a maximum configured per-message length". `rpc-core`
//! never names a concrete transport; it only requires split halves that are
//! `AsyncRead`/`AsyncWrite`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProcessorError;

/// Half of a transport this side reads frames from.
pub trait TransportReader: AsyncRead + Unpin + Send + 'static {}
impl<T: AsyncRead + Unpin + Send + 'static> TransportReader for T {}

/// Half of a transport this side writes frames to.
pub trait TransportWriter: AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncWrite + Unpin + Send + 'static> TransportWriter for T {}

/// Reads exactly one length-prefixed frame. Returns `Ok(None)` on clean EOF
/// at a frame boundary (the peer closed the transport).
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_message_length: usize,
) -> Result<Option<Vec<u8>>, ProcessorError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ProcessorError::Transport(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_message_length {
        return Err(ProcessorError::MessageTooLarge {
            len,
            limit: max_message_length,
        });
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(ProcessorError::Transport)?;
    Ok(Some(body))
}

/// Writes one length-prefixed frame and optionally flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
    max_message_length: usize,
    flush: bool,
) -> Result<(), ProcessorError> {
    if bytes.len() > max_message_length {
        return Err(ProcessorError::MessageTooLarge {
            len: bytes.len(),
            limit: max_message_length,
        });
    }
    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(ProcessorError::Transport)?;
    writer
        .write_all(bytes)
        .await
        .map_err(ProcessorError::Transport)?;
    if flush {
        writer.flush().await.map_err(ProcessorError::Transport)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrips_over_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, b"hello", 1024, true).await.unwrap();
        let got = read_frame(&mut b, 1024).await.unwrap().unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected_on_write() {
        let (mut a, _b) = tokio::io::duplex(4096);
        let err = write_frame(&mut a, &vec![0u8; 100], 10, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::MessageTooLarge { .. }));
    }
}
