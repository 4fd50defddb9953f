//! Raw RGB24 frame stream.

use std::io::{ErrorKind, Read};

use image::RgbImage;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("invalid frame size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads headerless, tightly packed RGB24 frames of a fixed size.
pub struct FrameReader<R> {
    reader: R,
    width: u32,
    height: u32,
    frames_read: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, width: u32, height: u32) -> Self {
        Self {
            reader,
            width,
            height,
            frames_read: 0,
        }
    }

    /// Bytes per frame (`width * height * 3`).
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Read the next frame. Returns `Ok(None)` when the stream ends cleanly
    /// on a frame boundary and an error when it ends mid-frame.
    pub fn read_frame(&mut self) -> Result<Option<RgbImage>, FrameError> {
        let expected = self.frame_len();
        if expected == 0 {
            return Err(FrameError::InvalidSize {
                width: self.width,
                height: self.height,
            });
        }

        let mut buf = vec![0u8; expected];
        let mut filled = 0;
        while filled < expected {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(FrameError::Io(e)),
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < expected {
            return Err(FrameError::Truncated {
                expected,
                actual: filled,
            });
        }

        let frame = RgbImage::from_raw(self.width, self.height, buf).ok_or(
            FrameError::InvalidSize {
                width: self.width,
                height: self.height,
            },
        )?;
        self.frames_read += 1;
        Ok(Some(frame))
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<RgbImage, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_frame().transpose()
    }
}
