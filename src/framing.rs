//! Length-prefixed frames over QUIC streams: 4 bytes LE length, then the
//! bincode payload. One delivery per frame; frames above [`MAX_FRAME_LEN`]
//! are rejected before any allocation happens.

use anyhow::{bail, Result};
use iroh::endpoint::{RecvStream, SendStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upper bound for a single frame. Bounds what a peer can make us allocate;
/// a frame carries at most one message, so this also caps message size.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

pub async fn write_frame(stream: &mut SendStream, data: &[u8]) -> Result<()> {
    if data.len() > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds the {MAX_FRAME_LEN} byte cap", data.len());
    }
    let len = data.len() as u32;
    stream.write_u32_le(len).await?;
    stream.write_all(data).await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the stream ended cleanly before a frame
/// started.
pub async fn read_frame(stream: &mut RecvStream) -> Result<Option<Vec<u8>>> {
    let len = match stream.read_u32_le().await {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        bail!("peer announced a {len} byte frame, cap is {MAX_FRAME_LEN}");
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}
