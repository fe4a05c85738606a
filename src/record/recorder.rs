use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

use super::avi::AviWriter;
use super::RecordingSettings;
use crate::error::RecordError;

const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Writer lifecycle of one recording session.
///
/// The output file is created lazily by the first `append`, sized to that
/// frame. An existing file is never overwritten: if the name is taken the
/// recorder writes to `<stem>-1.avi`, `<stem>-2.avi` and so on. Every later frame must match those dimensions. `release` finalizes
/// the file exactly once; a released recorder rejects further frames.
pub struct Recorder {
    path: PathBuf,
    fps: u32,
    jpeg_quality: u8,
    writer: Option<AviWriter>,
    released: bool,
    encoded: Vec<u8>,
}

impl Recorder {
    pub fn new(path: PathBuf, settings: &RecordingSettings) -> Self {
        Self {
            path,
            fps: settings.fps,
            jpeg_quality: settings.jpeg_quality,
            writer: None,
            released: false,
            encoded: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fixed once the first frame has been appended.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.writer.as_ref().map(AviWriter::dimensions)
    }

    pub fn frames(&self) -> u32 {
        self.writer.as_ref().map_or(0, AviWriter::frames)
    }

    /// Must only be called from the thread that owns this recorder.
    pub fn append(&mut self, image: &RgbImage) -> Result<(), RecordError> {
        if self.released {
            return Err(RecordError::Released);
        }
        let (actual_width, actual_height) = image.dimensions();
        if let Some((width, height)) = self.dimensions() {
            if (width, height) != (actual_width, actual_height) {
                return Err(RecordError::DimensionMismatch {
                    width,
                    height,
                    actual_width,
                    actual_height,
                });
            }
        }

        self.encoded.clear();
        JpegEncoder::new_with_quality(&mut self.encoded, self.jpeg_quality).encode_image(image)?;

        if self.writer.is_none() {
            if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir).map_err(|err| RecordError::io(dir, err))?;
            }
            self.path = reserve_path(&self.path)?;
            let writer = match AviWriter::create(&self.path, actual_width, actual_height, self.fps)
            {
                Ok(writer) => writer,
                Err(err) => {
                    let _ = std::fs::remove_file(&self.path);
                    return Err(err);
                }
            };
            log::info!(
                "Recorder: writing {} ({}x{} @ {} fps)",
                self.path.display(),
                actual_width,
                actual_height,
                self.fps
            );
            self.writer = Some(writer);
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(RecordError::Released);
        };
        writer.write_jpeg(&self.encoded)
    }

    /// Flush and close the file. Returns the path if any frame was written.
    ///
    /// Safe to call more than once; later calls return `Ok(None)`.
    pub fn release(&mut self) -> Result<Option<PathBuf>, RecordError> {
        self.released = true;
        let Some(writer) = self.writer.take() else {
            return Ok(None);
        };
        let frames = writer.frames();
        let path = writer.finish()?;
        log::info!("recording saved: {} ({} frames)", path.display(), frames);
        Ok(Some(path))
    }
}

/// Claim `path`, or the first free `<stem>-N.<ext>` beside it, by creating it
/// exclusively.
fn reserve_path(path: &Path) -> Result<PathBuf, RecordError> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = if attempt == 0 {
            path.to_path_buf()
        } else {
            let name = match &extension {
                Some(ext) => format!("{}-{}.{}", stem, attempt, ext),
                None => format!("{}-{}", stem, attempt),
            };
            path.with_file_name(name)
        };
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(RecordError::io(candidate, err)),
        }
    }
    Err(RecordError::io(
        path,
        std::io::Error::new(ErrorKind::AlreadyExists, "no free recording file name"),
    ))
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(err) = self.release() {
                log::warn!("Recorder: failed to finalize {}: {}", self.path.display(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::avi::probe;
    use anyhow::Result;
    use image::Rgb;
    use tempfile::tempdir;

    fn settings(dir: &Path) -> RecordingSettings {
        RecordingSettings {
            video_dir: dir.to_path_buf(),
            ..RecordingSettings::default()
        }
    }

    #[test]
    fn file_is_created_on_first_frame_only() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("a.avi");
        let mut recorder = Recorder::new(path.clone(), &settings(dir.path()));
        assert!(!path.exists());

        recorder.append(&RgbImage::from_pixel(600, 400, Rgb([1, 2, 3])))?;
        assert!(path.exists());
        assert_eq!(recorder.dimensions(), Some((600, 400)));
        Ok(())
    }

    #[test]
    fn mismatched_frame_is_rejected_and_session_continues() -> Result<()> {
        let dir = tempdir()?;
        let mut recorder = Recorder::new(dir.path().join("b.avi"), &settings(dir.path()));
        recorder.append(&RgbImage::new(64, 48))?;
        match recorder.append(&RgbImage::new(64, 50)) {
            Err(RecordError::DimensionMismatch { actual_height, .. }) => {
                assert_eq!(actual_height, 50)
            }
            other => panic!("expected dimension mismatch, got {:?}", other),
        }
        recorder.append(&RgbImage::new(64, 48))?;

        let path = recorder.release()?.expect("path");
        assert_eq!(probe(&path)?.frame_count, 2);
        Ok(())
    }

    #[test]
    fn release_is_once_only() -> Result<()> {
        let dir = tempdir()?;
        let mut recorder = Recorder::new(dir.path().join("c.avi"), &settings(dir.path()));
        assert!(recorder.release()?.is_none());
        assert!(matches!(
            recorder.append(&RgbImage::new(8, 8)),
            Err(RecordError::Released)
        ));
        assert!(recorder.release()?.is_none());
        Ok(())
    }

    #[test]
    fn existing_file_is_never_overwritten() -> Result<()> {
        let dir = tempdir()?;
        let taken = dir.path().join("e.avi");
        std::fs::write(&taken, b"earlier session")?;
        std::fs::write(dir.path().join("e-1.avi"), b"earlier session")?;

        let mut recorder = Recorder::new(taken.clone(), &settings(dir.path()));
        recorder.append(&RgbImage::new(16, 16))?;
        let saved = recorder.release()?.expect("path");

        assert_eq!(saved, dir.path().join("e-2.avi"));
        assert_eq!(std::fs::read(&taken)?, b"earlier session");
        assert_eq!(probe(&saved)?.frame_count, 1);
        Ok(())
    }

    #[test]
    fn dropped_recorder_still_finalizes_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("d.avi");
        {
            let mut recorder = Recorder::new(path.clone(), &settings(dir.path()));
            recorder.append(&RgbImage::new(16, 16))?;
        }
        assert_eq!(probe(&path)?.frame_count, 1);
        Ok(())
    }
}
