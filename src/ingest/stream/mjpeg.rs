//! MJPEG-over-HTTP decoding (multipart JPEG, as served by most IP cameras).

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::io::Read;

use super::decoder::StreamDecoder;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub(crate) struct MjpegDecoder {
    url: String,
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
    latest: Option<Vec<u8>>,
}

impl MjpegDecoder {
    pub(crate) fn open(url: &str) -> Result<Self> {
        let response = ureq::get(url)
            .call()
            .with_context(|| format!("connect to mjpeg stream {}", url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if !content_type.contains("multipart") {
            return Err(anyhow!(
                "{} is not a multipart MJPEG stream (content type '{}')",
                url,
                content_type
            ));
        }
        log::info!("StreamWorker: connected to {}", url);
        Ok(Self {
            url: url.to_string(),
            reader: response.into_reader(),
            buffer: Vec::with_capacity(64 * 1024),
            latest: None,
        })
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream {} ended", self.url));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

impl StreamDecoder for MjpegDecoder {
    fn grab(&mut self) -> Result<()> {
        self.latest = Some(self.read_next_jpeg()?);
        Ok(())
    }

    fn retrieve(&mut self) -> Result<RgbImage> {
        let jpeg = match self.latest.take() {
            Some(jpeg) => jpeg,
            None => self.read_next_jpeg()?,
        };
        Ok(image::load_from_memory(&jpeg)
            .context("decode mjpeg frame")?
            .into_rgb8())
    }

    fn release(&mut self) {
        self.buffer.clear();
        self.latest = None;
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_complete_jpeg_between_markers() {
        let buf = [0x00, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0x03];
        assert_eq!(find_jpeg_bounds(&buf), Some((1, 7)));
    }

    #[test]
    fn incomplete_jpeg_is_not_returned() {
        let buf = [0xFF, 0xD8, 0x01, 0x02];
        assert_eq!(find_jpeg_bounds(&buf), None);
    }
}
