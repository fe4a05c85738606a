//! Wire format of pushed frames.
//!
//! Each message is `u32 LE` body length followed by the body:
//! `u16 LE` sender-name length, the sender name (UTF-8), then the encoded
//! image (JPEG or PNG). Publishers write messages back to back on one TCP
//! connection; subscribers never reply.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::io::{Read, Write};

pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushedFrame {
    pub sender: String,
    pub encoded: Vec<u8>,
}

impl PushedFrame {
    pub fn decode(&self) -> Result<RgbImage> {
        Ok(image::load_from_memory(&self.encoded)
            .with_context(|| format!("decode frame pushed by {}", self.sender))?
            .into_rgb8())
    }
}

pub fn write_message<W: Write>(writer: &mut W, sender: &str, encoded: &[u8]) -> Result<()> {
    let name = sender.as_bytes();
    if name.len() > u16::MAX as usize {
        return Err(anyhow!("sender name too long"));
    }
    let body_len = 2 + name.len() + encoded.len();
    if body_len > MAX_MESSAGE_BYTES {
        return Err(anyhow!("pushed frame of {} bytes exceeds limit", body_len));
    }
    writer.write_all(&(body_len as u32).to_le_bytes())?;
    writer.write_all(&(name.len() as u16).to_le_bytes())?;
    writer.write_all(name)?;
    writer.write_all(encoded)?;
    writer.flush()?;
    Ok(())
}

pub fn read_message<R: Read>(reader: &mut R) -> std::io::Result<PushedFrame> {
    use std::io::{Error, ErrorKind};

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let body_len = u32::from_le_bytes(len_bytes) as usize;
    if !(2..=MAX_MESSAGE_BYTES).contains(&body_len) {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("pushed message length {} out of range", body_len),
        ));
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body)?;
    let name_len = u16::from_le_bytes([body[0], body[1]]) as usize;
    if 2 + name_len > body_len {
        return Err(Error::new(
            ErrorKind::InvalidData,
            "pushed message sender name overruns body",
        ));
    }
    let sender = String::from_utf8_lossy(&body[2..2 + name_len]).into_owned();
    body.drain(..2 + name_len);
    Ok(PushedFrame {
        sender,
        encoded: body,
    })
}

/// Parse one complete message from the front of `buffer`, removing it.
///
/// Returns `Ok(None)` when more bytes are needed. Used by readers whose socket
/// has a read timeout, where a timeout may land in the middle of a message.
pub fn take_message(buffer: &mut Vec<u8>) -> std::io::Result<Option<PushedFrame>> {
    if buffer.len() < 4 {
        return Ok(None);
    }
    let body_len = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if !(2..=MAX_MESSAGE_BYTES).contains(&body_len) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("pushed message length {} out of range", body_len),
        ));
    }
    if buffer.len() < 4 + body_len {
        return Ok(None);
    }
    let message: Vec<u8> = buffer.drain(..4 + body_len).collect();
    read_message(&mut message.as_slice()).map(Some)
}

/// PNG-encode an image for publishing (lossless; used by tests and tools).
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut out = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut out, image::ImageFormat::Png)
        .context("encode png")?;
    Ok(out.into_inner())
}

/// JPEG-encode an image for publishing.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(image)
        .context("encode jpeg")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::io::Cursor;

    #[test]
    fn message_carries_sender_and_image() -> Result<()> {
        let image = RgbImage::from_pixel(6, 4, Rgb([10, 200, 30]));
        let encoded = encode_png(&image)?;

        let mut buf = Vec::new();
        write_message(&mut buf, "rpi-court-2", &encoded)?;
        let message = read_message(&mut Cursor::new(buf))?;

        assert_eq!(message.sender, "rpi-court-2");
        assert_eq!(message.decode()?, image);
        Ok(())
    }

    #[test]
    fn truncated_message_is_an_io_error() {
        let mut buf = Vec::new();
        write_message(&mut buf, "pi", b"abcdef").expect("write");
        buf.truncate(buf.len() - 2);
        let err = read_message(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn take_message_waits_for_complete_body() -> Result<()> {
        let mut wire = Vec::new();
        write_message(&mut wire, "pi", b"first")?;
        write_message(&mut wire, "pi", b"second")?;

        let mut buffer = wire[..6].to_vec();
        assert!(take_message(&mut buffer)?.is_none());
        buffer.extend_from_slice(&wire[6..]);

        assert_eq!(take_message(&mut buffer)?.map(|m| m.encoded), Some(b"first".to_vec()));
        assert_eq!(take_message(&mut buffer)?.map(|m| m.encoded), Some(b"second".to_vec()));
        assert!(buffer.is_empty());
        Ok(())
    }

    #[test]
    fn bogus_length_is_rejected() {
        let buf = 1u32.to_le_bytes().to_vec();
        let err = read_message(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
