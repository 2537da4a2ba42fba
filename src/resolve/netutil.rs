use std::net::SocketAddr;
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::errors::{ResolveError, Result};

pub async fn read_packet_length<R: AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<u16> {
    let mut len_buffer = [0; 2];
    stream.read_exact(&mut len_buffer).await?;
    Ok(((len_buffer[0] as u16) << 8) | (len_buffer[1] as u16))
}

pub async fn write_packet_length<W: AsyncWrite + Unpin>(
    stream: &mut W,
    len: usize,
) -> std::io::Result<()> {
    let len_buffer = [(len >> 8) as u8, (len & 0xFF) as u8];
    stream.write_all(&len_buffer).await?;
    Ok(())
}

/// One-shot TCP exchange: connect, send `msg` with the two-byte length
/// prefix, read one framed response. The whole round trip is bounded by
/// `timeout`.
pub async fn tcp_exchange(msg: &Message, addr: SocketAddr, timeout: Duration) -> Result<Message> {
    let wire = msg.to_vec()?;

    tokio::time::timeout(timeout, async move {
        let mut stream = TcpStream::connect(addr).await?;

        write_packet_length(&mut stream, wire.len()).await?;
        stream.write_all(&wire).await?;
        stream.flush().await?;

        let len = read_packet_length(&mut stream).await? as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;

        Ok(Message::from_vec(&body)?)
    })
    .await
    .map_err(|_| ResolveError::TimeOut)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_length_framing_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(64);

        write_packet_length(&mut a, 0x1234).await.unwrap();
        assert_eq!(0x1234, read_packet_length(&mut b).await.unwrap());

        write_packet_length(&mut a, 12).await.unwrap();
        assert_eq!(12, read_packet_length(&mut b).await.unwrap());
    }
}
