//! Framing for the loopback transport.
//!
//! A frame is a length-prefixed JSON header followed by raw payload bytes:
//!
//! ```text
//! [u32 BE: total_len][u32 BE: header_len][header JSON][payload]
//! ```
//!
//! `total_len` counts everything after itself. The payload is never
//! JSON-encoded, so PUT data travels byte-for-byte.

use crate::config::IpcConfig;
use crate::error::status;
use crate::message::FrameHeader;
use crate::{Result, SvcError};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Serialize into wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(&self.header)?;
        let total = 4 + header.len() + self.payload.len();
        if total > IpcConfig::MAX_MESSAGE_SIZE {
            return Err(SvcError::Protocol {
                code: status::BAD_MESSAGE,
                message: format!(
                    "frame size {} exceeds maximum {}",
                    total,
                    IpcConfig::MAX_MESSAGE_SIZE
                ),
            });
        }

        let mut buf = Vec::with_capacity(4 + total);
        buf.extend_from_slice(&(total as u32).to_be_bytes());
        buf.extend_from_slice(&(header.len() as u32).to_be_bytes());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Read one frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed the connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let total = u32::from_be_bytes(len_buf) as usize;
    if total > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(SvcError::Protocol {
            code: status::BAD_MESSAGE,
            message: format!(
                "frame size {} exceeds maximum {}",
                total,
                IpcConfig::MAX_MESSAGE_SIZE
            ),
        });
    }
    if total < 4 {
        return Err(SvcError::Protocol {
            code: status::PARSE_ERROR,
            message: format!("frame size {} too small for a header length", total),
        });
    }

    let mut body = vec![0u8; total];
    reader.read_exact(&mut body).await?;

    let header_len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    if header_len > IpcConfig::MAX_HEADER_SIZE || 4 + header_len > total {
        return Err(SvcError::Protocol {
            code: status::PARSE_ERROR,
            message: format!("header length {} does not fit frame of {}", header_len, total),
        });
    }

    let header: FrameHeader = serde_json::from_slice(&body[4..4 + header_len])?;
    let mut body = Bytes::from(body);
    let payload = body.split_off(4 + header_len);

    Ok(Some(Frame { header, payload }))
}

/// Write one frame to an async writer and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
