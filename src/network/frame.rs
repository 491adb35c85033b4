//! Multi-part message framing.
//!
//! A message is one or more frames. Each frame is
//!
//! ```text
//! flags: u8 | len: u32 LE | payload: len bytes
//! ```
//!
//! Bit 0 of `flags` ([`FLAG_MORE`]) is set on every frame except the last of a
//! message. The other bits are reserved and must be zero.

use crate::error::{AppResult, PipelineError};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// More frames of the same message follow.
pub const FLAG_MORE: u8 = 0x01;

/// Largest payload accepted in one frame (1 GiB).
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Largest number of parts accepted in one message.
pub const MAX_PARTS: usize = 16;

const HEADER_LEN: usize = 5;

/// Writes `parts` as one message and flushes.
pub async fn write_message<W>(writer: &mut W, parts: &[&[u8]]) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    if parts.is_empty() || parts.len() > MAX_PARTS {
        return Err(PipelineError::Protocol(format!(
            "a message needs 1 to {MAX_PARTS} parts, got {}",
            parts.len()
        )));
    }

    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        if part.len() > MAX_FRAME_LEN {
            return Err(PipelineError::Protocol(format!(
                "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
                part.len()
            )));
        }
        let mut header = [0u8; HEADER_LEN];
        header[0] = if i < last { FLAG_MORE } else { 0 };
        header[1..].copy_from_slice(&(part.len() as u32).to_le_bytes());
        writer.write_all(&header).await?;
        writer.write_all(part).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Writes a single-part text message.
pub async fn write_text<W>(writer: &mut W, text: &str) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    write_message(writer, &[text.as_bytes()]).await
}

/// Reads one message. Returns `Ok(None)` on a clean end of stream before the
/// first frame.
pub async fn read_message<R>(reader: &mut R) -> AppResult<Option<Vec<Bytes>>>
where
    R: AsyncRead + Unpin,
{
    let mut parts = Vec::new();
    loop {
        let mut header = [0u8; HEADER_LEN];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && parts.is_empty() => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let flags = header[0];
        if flags & !FLAG_MORE != 0 {
            return Err(PipelineError::Protocol(format!(
                "reserved frame flags set: {flags:#04x}"
            )));
        }
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(PipelineError::Protocol(format!(
                "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
            )));
        }

        let mut payload = BytesMut::zeroed(len);
        reader.read_exact(&mut payload).await?;
        parts.push(payload.freeze());

        if flags & FLAG_MORE == 0 {
            return Ok(Some(parts));
        }
        if parts.len() == MAX_PARTS {
            return Err(PipelineError::Protocol(format!(
                "message has more than {MAX_PARTS} parts"
            )));
        }
    }
}

/// Reads a single-part UTF-8 message. End of stream is an error here.
pub async fn read_text<R>(reader: &mut R) -> AppResult<String>
where
    R: AsyncRead + Unpin,
{
    let parts = read_message(reader)
        .await?
        .ok_or_else(|| PipelineError::Protocol("connection closed by peer".to_string()))?;
    if parts.len() != 1 {
        return Err(PipelineError::Protocol(format!(
            "expected a single-part text message, got {} parts",
            parts.len()
        )));
    }
    String::from_utf8(parts[0].to_vec())
        .map_err(|e| PipelineError::Protocol(format!("text message is not UTF-8: {e}")))
}
