//! length prefixed framing shared by the tcp client and server

use std::io;

use derive_more::{Display, From};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::dns::buffer::CodecError;
use crate::dns::protocol::MAX_MESSAGE_SIZE;
use crate::dns::server::HandlerError;

#[derive(Debug, Display, From)]
pub enum TransportError {
    Io(io::Error),
    Codec(CodecError),
    #[display(fmt = "operation timed out")]
    Timeout,
    #[display(fmt = "operation cancelled")]
    Cancelled,
    #[display(fmt = "connection closed by peer")]
    ConnectionClosed,
    #[display(fmt = "no transit buffers available")]
    PoolExhausted,
    #[display(fmt = "message of {} bytes exceeds the maximum size", _0)]
    #[from(ignore)]
    MessageTooLarge(usize),
    #[display(fmt = "response needs {} bytes but only {} are available", needed, available)]
    #[from(ignore)]
    BufferTooSmall { needed: usize, available: usize },
    #[display(fmt = "transaction {} is already in flight on this connection", _0)]
    #[from(ignore)]
    DuplicateTransaction(u16),
    #[display(fmt = "request handler failed: {}", _0)]
    Handler(HandlerError),
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

/// The transaction id is the first two bytes of every message.
pub fn transaction_id(message: &[u8]) -> Option<u16> {
    match message {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

fn closed_on_eof(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        TransportError::ConnectionClosed
    } else {
        TransportError::Io(e)
    }
}

/// Reads the two byte length prefix. Returns `None` if the peer closed the
/// stream cleanly before sending anything.
pub async fn read_packet_length<R>(stream: &mut R) -> Result<Option<usize>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buffer = [0u8; 2];
    if stream.read(&mut len_buffer[..1]).await? == 0 {
        return Ok(None);
    }
    stream
        .read_exact(&mut len_buffer[1..])
        .await
        .map_err(closed_on_eof)?;

    Ok(Some(u16::from_be_bytes(len_buffer) as usize))
}

/// Reads exactly `buf.len()` bytes of message body.
pub async fn read_packet_body<R>(stream: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    stream.read_exact(buf).await.map_err(closed_on_eof)?;
    Ok(())
}

/// Reads one framed message into `buf`, returning its length, or `None` on
/// a clean close.
pub async fn read_packet<R>(stream: &mut R, buf: &mut [u8]) -> Result<Option<usize>>
where
    R: AsyncRead + Unpin,
{
    let len = match read_packet_length(stream).await? {
        Some(len) => len,
        None => return Ok(None),
    };
    if len > buf.len() {
        return Err(TransportError::MessageTooLarge(len));
    }

    read_packet_body(stream, &mut buf[..len]).await?;

    Ok(Some(len))
}

/// Like `read_packet`, for callers that need to own the frame.
pub async fn read_packet_vec<R>(stream: &mut R, max_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match read_packet_length(stream).await? {
        Some(len) => len,
        None => return Ok(None),
    };
    if len > max_size {
        return Err(TransportError::MessageTooLarge(len));
    }

    let mut frame = vec![0; len];
    read_packet_body(stream, &mut frame).await?;

    Ok(Some(frame))
}

pub async fn write_packet<W>(stream: &mut W, message: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if message.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge(message.len()));
    }

    let len_buffer = (message.len() as u16).to_be_bytes();
    stream.write_all(&len_buffer).await?;
    stream.write_all(message).await?;
    stream.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_transaction_id() {
        assert_eq!(Some(0xabcd), transaction_id(&[0xab, 0xcd, 0x01]));
        assert_eq!(Some(1), transaction_id(&[0, 1]));
        assert_eq!(None, transaction_id(&[0xab]));
    }

    #[tokio::test]
    async fn test_framing_roundtrip() {
        let mut wire = Vec::new();
        write_packet(&mut wire, b"hello").await.unwrap();
        write_packet(&mut wire, b"").await.unwrap();
        assert_eq!(b"\x00\x05hello\x00\x00", &wire[..]);

        let mut reader = &wire[..];
        let mut buf = [0u8; 16];
        assert_eq!(Some(5), read_packet(&mut reader, &mut buf).await.unwrap());
        assert_eq!(b"hello", &buf[..5]);
        assert_eq!(Some(Vec::new()), read_packet_vec(&mut reader, 16).await.unwrap());
        assert_eq!(None, read_packet(&mut reader, &mut buf).await.unwrap());
    }

    #[tokio::test]
    async fn test_truncated_frames() {
        let mut reader = &b"\x00"[..];
        assert!(matches!(
            read_packet_length(&mut reader).await,
            Err(TransportError::ConnectionClosed)
        ));

        let mut reader = &b"\x00\x04ab"[..];
        let mut buf = [0u8; 8];
        assert!(matches!(
            read_packet(&mut reader, &mut buf).await,
            Err(TransportError::ConnectionClosed)
        ));

        let mut reader = &b"\x00\x09123456789"[..];
        assert!(matches!(
            read_packet(&mut reader, &mut buf).await,
            Err(TransportError::MessageTooLarge(9))
        ));
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let mut wire = Vec::new();
        let big = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            write_packet(&mut wire, &big).await,
            Err(TransportError::MessageTooLarge(_))
        ));
        assert!(wire.is_empty());
    }
}
