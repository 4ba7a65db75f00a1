/*!
 * Frame Codec
 *
 * Frame layout: `u32` big-endian body length, then a bincode body.
 * Bodies above `MAX_FRAME_BYTES` are rejected before allocation.
 */

use crate::core::errors::ExecError;
use crate::core::limits::MAX_FRAME_BYTES;
use crate::core::types::ExecResult;
use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Encode one frame into a contiguous buffer
pub fn encode_frame<T: Serialize>(frame: &T) -> ExecResult<BytesMut> {
    let body = bincode::serialize(frame)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(ExecError::Protocol(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_BYTES}",
            body.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Write one frame and flush
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> ExecResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = encode_frame(frame)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end of stream between frames
pub async fn read_frame<R, T>(reader: &mut R) -> ExecResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_BYTES {
        return Err(ExecError::Protocol(format!(
            "peer announced {len} byte frame, limit is {MAX_FRAME_BYTES}"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            ExecError::ConnectionInterrupted("stream ended inside a frame".into())
        } else {
            ExecError::from(e)
        }
    })?;

    Ok(Some(bincode::deserialize(&body)?))
}
