//! Async framing over a runner's stdio pipes.

use gatehouse_protocol::error::{ProtocolError, Result};
use gatehouse_protocol::{Header, Message, OpCode, HEADER_SIZE};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one frame. Returns `Ok(None)` when the peer closed the pipe between
/// frames.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut header_buf = [0u8; HEADER_SIZE];
    let read = read_full(reader, &mut header_buf).await?;
    if read == 0 {
        return Ok(None);
    }
    if read < HEADER_SIZE {
        return Err(ProtocolError::Truncated {
            expected: HEADER_SIZE,
            read,
        });
    }
    let header = Header::unpack(&header_buf)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    let read = read_full(reader, &mut payload).await?;
    if read < payload.len() {
        return Err(ProtocolError::Truncated {
            expected: payload.len(),
            read,
        });
    }
    Ok(Some(Message { header, payload }))
}

/// Write one frame and flush.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    writer.write_all(&msg.to_bytes()?).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode `value` as JSON and write it as one frame.
pub async fn send_json<W, T>(writer: &mut W, opcode: OpCode, seq: u64, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    write_message(writer, &Message::json(opcode, seq, value)?).await
}

async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
