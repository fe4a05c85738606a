//! Parent <-> worker protocol for process-isolated streams.
//!
//! Requests (parent -> worker) are single bytes. Replies (worker -> parent)
//! are length-prefixed: `u32 LE` payload length, then a tag byte and body:
//!
//! - tag `0`: frame, `u32 LE width`, `u32 LE height`, `width * height * 3` RGB bytes
//! - tag `1`: error, UTF-8 message
//!
//! Exactly one request is outstanding at a time; the parent acknowledges each
//! frame before issuing the next request.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::io::{ErrorKind, Read, Write};

/// Upper bound on a single reply (8K RGB plus header).
pub const MAX_REPLY_BYTES: usize = 7680 * 4320 * 3 + 16;

const TAG_FRAME: u8 = 0;
const TAG_ERROR: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Request {
    Acknowledge = 0,
    RequestFrame = 1,
    Close = 2,
}

impl Request {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Acknowledge),
            1 => Ok(Self::RequestFrame),
            2 => Ok(Self::Close),
            other => Err(anyhow!("unknown worker request code {}", other)),
        }
    }
}

#[derive(Debug)]
pub enum Reply {
    Frame(RgbImage),
    Error(String),
}

pub fn write_request<W: Write>(writer: &mut W, request: Request) -> Result<()> {
    writer
        .write_all(&[request as u8])
        .context("write worker request")?;
    writer.flush().context("flush worker request")?;
    Ok(())
}

/// Reads the next request. `Ok(None)` means the parent closed the pipe.
pub fn read_request<R: Read>(reader: &mut R) -> Result<Option<Request>> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Request::from_byte(byte[0]).map(Some),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(anyhow::Error::new(err).context("read worker request")),
        }
    }
}

pub fn write_reply<W: Write>(writer: &mut W, reply: &Reply) -> Result<()> {
    match reply {
        Reply::Frame(image) => {
            let (width, height) = image.dimensions();
            let pixels = image.as_raw();
            let len = 1 + 8 + pixels.len();
            writer.write_all(&(len as u32).to_le_bytes())?;
            writer.write_all(&[TAG_FRAME])?;
            writer.write_all(&width.to_le_bytes())?;
            writer.write_all(&height.to_le_bytes())?;
            writer.write_all(pixels)?;
        }
        Reply::Error(message) => {
            let bytes = message.as_bytes();
            writer.write_all(&((1 + bytes.len()) as u32).to_le_bytes())?;
            writer.write_all(&[TAG_ERROR])?;
            writer.write_all(bytes)?;
        }
    }
    writer.flush().context("flush worker reply")?;
    Ok(())
}

/// Reads the next reply. `Ok(None)` means the worker closed its end cleanly.
pub fn read_reply<R: Read>(reader: &mut R) -> Result<Option<Reply>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(anyhow::Error::new(err).context("read worker reply length")),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_REPLY_BYTES {
        return Err(anyhow!("worker reply length {} out of range", len));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .context("read worker reply payload")?;

    match payload[0] {
        TAG_FRAME => {
            if payload.len() < 9 {
                return Err(anyhow!("worker frame reply truncated"));
            }
            let width = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
            let height = u32::from_le_bytes([payload[5], payload[6], payload[7], payload[8]]);
            payload.drain(..9);
            let image = RgbImage::from_raw(width, height, payload).ok_or_else(|| {
                anyhow!("worker frame reply does not match {}x{}", width, height)
            })?;
            Ok(Some(Reply::Frame(image)))
        }
        TAG_ERROR => Ok(Some(Reply::Error(
            String::from_utf8_lossy(&payload[1..]).into_owned(),
        ))),
        other => Err(anyhow!("unknown worker reply tag {}", other)),
    }
}
