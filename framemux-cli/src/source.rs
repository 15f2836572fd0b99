//! Frame sources feeding the encoder.
//!
//! Every source yields packed BGR24 frames of a fixed size. A source that
//! returns `Ok(None)` is exhausted.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};

use framemux_core::config::BGR_BYTES_PER_PIXEL;

use crate::config::{SourceConfig, SourceKind};

pub trait FrameSource: Send {
    /// Bytes in one frame.
    fn frame_len(&self) -> usize;

    /// Fill the next frame, or return `None` once the source is exhausted.
    fn next_frame(&mut self) -> io::Result<Option<&[u8]>>;
}

/// Build the source described by `config` for `width`×`height` frames.
pub fn open(config: &SourceConfig, width: u32, height: u32) -> io::Result<Box<dyn FrameSource>> {
    Ok(match config.kind {
        SourceKind::Synthetic => Box::new(SyntheticSource::new(width, height)),
        SourceKind::Raw if config.path.as_os_str() == "-" => {
            Box::new(RawSource::new(io::stdin(), width, height))
        }
        SourceKind::Raw => {
            let file = File::open(&config.path)?;
            Box::new(RawSource::new(BufReader::new(file), width, height))
        }
    })
}

// ── SyntheticSource ──────────────────────────────────────────────

/// Color bars drifting one column per frame, with a bright bar sweeping
/// down so motion is visible in both axes.
pub struct SyntheticSource {
    width: usize,
    height: usize,
    index: usize,
    frame: Vec<u8>,
}

const BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [0, 255, 255],
    [255, 255, 0],
    [0, 255, 0],
    [255, 0, 255],
    [0, 0, 255],
    [255, 0, 0],
    [0, 0, 0],
];

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        let (width, height) = (width as usize, height as usize);
        Self {
            width,
            height,
            index: 0,
            frame: vec![0; width * height * BGR_BYTES_PER_PIXEL],
        }
    }

    fn render(&mut self) {
        let bar_width = (self.width / BARS.len()).max(1);
        let sweep = if self.height == 0 { 0 } else { self.index % self.height };
        for (y, row) in self
            .frame
            .chunks_exact_mut(self.width * BGR_BYTES_PER_PIXEL)
            .enumerate()
        {
            for (x, px) in row.chunks_exact_mut(BGR_BYTES_PER_PIXEL).enumerate() {
                let color = if y == sweep {
                    [255, 255, 255]
                } else {
                    BARS[((x + self.index) / bar_width) % BARS.len()]
                };
                px.copy_from_slice(&color);
            }
        }
    }
}

impl FrameSource for SyntheticSource {
    fn frame_len(&self) -> usize {
        self.frame.len()
    }

    fn next_frame(&mut self) -> io::Result<Option<&[u8]>> {
        self.render();
        self.index += 1;
        Ok(Some(&self.frame))
    }
}

// ── RawSource ────────────────────────────────────────────────────

/// Back-to-back packed frames from any reader.
pub struct RawSource<R> {
    reader: R,
    frame: Vec<u8>,
}

impl<R: Read> RawSource<R> {
    pub fn new(reader: R, width: u32, height: u32) -> Self {
        Self {
            reader,
            frame: vec![0; width as usize * height as usize * BGR_BYTES_PER_PIXEL],
        }
    }
}

impl<R: Read + Send> FrameSource for RawSource<R> {
    fn frame_len(&self) -> usize {
        self.frame.len()
    }

    /// A trailing partial frame is dropped.
    fn next_frame(&mut self) -> io::Result<Option<&[u8]>> {
        match self.reader.read_exact(&mut self.frame) {
            Ok(()) => Ok(Some(&self.frame)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
