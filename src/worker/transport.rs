//! Length-prefixed JSON framing.
//!
//! ```text
//! ┌──────────────┬──────────────────────────┐
//! │ len: u32 LE  │ JSON payload (len bytes) │
//! └──────────────┴──────────────────────────┘
//! ```

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{PdfiumError, Result};

/// Largest payload accepted in either direction
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Serialize `message` and write it as one frame, then flush
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(PdfiumError::Protocol(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one raw frame payload. `None` means the peer closed the channel.
pub fn read_frame_bytes<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(PdfiumError::Protocol(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            PdfiumError::Protocol(format!("channel closed inside a {len} byte frame"))
        } else {
            e.into()
        }
    })?;
    Ok(Some(payload))
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

/// Read and decode one frame
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    read_frame_bytes(reader)?.map(|payload| decode(&payload)).transpose()
}
