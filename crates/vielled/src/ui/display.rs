//! Display interface and shims.
//!
//! The pixel-level driver (fonts included) lives outside the control
//! plane; pages draw through this trait. [`MemoryDisplay`] backs tests
//! and the screenshot endpoint with a plain 1-byte-per-pixel buffer and
//! a log of text operations; [`FbDisplay`] pushes the same buffer to the
//! framebuffer device, mmapped where the hardware allows it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use memmap2::MmapMut;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Left,
    Center,
    Right,
}

pub trait Display: Send {
    fn width(&self) -> i32;
    fn height(&self) -> i32;

    /// Clear the whole screen or a rectangular region.
    fn clear(&mut self, region: Option<(i32, i32, i32, i32)>);

    fn line(&mut self, x1: i32, y1: i32, x2: i32, y2: i32);
    fn rect(&mut self, x1: i32, y1: i32, x2: i32, y2: i32, fill: bool);

    /// Select the font for subsequent text calls.
    fn font_size(&mut self, size: u8);

    fn puts(&mut self, x: i32, y: i32, text: &str) {
        self.puts_anchored(x, y, text, Anchor::Left);
    }

    fn puts_anchored(&mut self, x: i32, y: i32, text: &str, anchor: Anchor);

    /// Marquee text within a width; the driver animates it.
    fn scrolltext(&mut self, x: i32, y: i32, width: i32, text: &str);

    /// Copy raw 1-byte-per-pixel data into the buffer.
    fn blit(&mut self, x: i32, y: i32, width: i32, height: i32, data: &[u8]);

    /// Flush the buffer to the device.
    fn update(&mut self);

    /// Snapshot of the pixel buffer, one byte per pixel, row-major.
    fn snapshot(&self) -> (i32, i32, Vec<u8>);
}

/// Shared pixel buffer implementation used by both shims.
struct PixelBuffer {
    width: i32,
    height: i32,
    pixels: Vec<u8>,
}

impl PixelBuffer {
    fn new(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; (width * height) as usize],
        }
    }

    fn set(&mut self, x: i32, y: i32, color: u8) {
        if x >= 0 && x < self.width && y >= 0 && y < self.height {
            self.pixels[(y * self.width + x) as usize] = color;
        }
    }

    fn clear(&mut self, region: Option<(i32, i32, i32, i32)>) {
        match region {
            None => self.pixels.fill(0),
            Some((x1, y1, x2, y2)) => {
                for y in y1..=y2 {
                    for x in x1..=x2 {
                        self.set(x, y, 0);
                    }
                }
            }
        }
    }

    fn line(&mut self, x1: i32, y1: i32, x2: i32, y2: i32) {
        // Bresenham
        let (mut x, mut y) = (x1, y1);
        let dx = (x2 - x1).abs();
        let dy = -(y2 - y1).abs();
        let sx = if x1 < x2 { 1 } else { -1 };
        let sy = if y1 < y2 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            self.set(x, y, 1);
            if x == x2 && y == y2 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    fn rect(&mut self, x1: i32, y1: i32, x2: i32, y2: i32, fill: bool) {
        if fill {
            for y in y1..=y2 {
                for x in x1..=x2 {
                    self.set(x, y, 1);
                }
            }
        } else {
            self.line(x1, y1, x2, y1);
            self.line(x1, y2, x2, y2);
            self.line(x1, y1, x1, y2);
            self.line(x2, y1, x2, y2);
        }
    }

    fn blit(&mut self, x: i32, y: i32, width: i32, height: i32, data: &[u8]) {
        for row in 0..height {
            for col in 0..width {
                let idx = (row * width + col) as usize;
                if let Some(value) = data.get(idx) {
                    self.set(x + col, y + row, *value);
                }
            }
        }
    }
}

/// A recorded text operation, for assertions in tests.
#[derive(Debug, Clone, PartialEq)]
pub struct TextOp {
    pub x: i32,
    pub y: i32,
    pub text: String,
    pub font_size: u8,
    pub anchor: Anchor,
}

/// In-memory display: full pixel buffer, text calls recorded verbatim
/// (glyph rendering belongs to the native driver).
pub struct MemoryDisplay {
    buffer: PixelBuffer,
    font: u8,
    texts: Vec<TextOp>,
    updates: usize,
}

impl MemoryDisplay {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            buffer: PixelBuffer::new(width, height),
            font: 3,
            texts: Vec::new(),
            updates: 0,
        }
    }

    /// Text drawn since the last clear.
    pub fn texts(&self) -> &[TextOp] {
        &self.texts
    }

    pub fn contains_text(&self, needle: &str) -> bool {
        self.texts.iter().any(|op| op.text.contains(needle))
    }

    pub fn update_count(&self) -> usize {
        self.updates
    }
}

impl Display for MemoryDisplay {
    fn width(&self) -> i32 {
        self.buffer.width
    }

    fn height(&self) -> i32 {
        self.buffer.height
    }

    fn clear(&mut self, region: Option<(i32, i32, i32, i32)>) {
        self.buffer.clear(region);
        if region.is_none() {
            self.texts.clear();
        }
    }

    fn line(&mut self, x1: i32, y1: i32, x2: i32, y2: i32) {
        self.buffer.line(x1, y1, x2, y2);
    }

    fn rect(&mut self, x1: i32, y1: i32, x2: i32, y2: i32, fill: bool) {
        self.buffer.rect(x1, y1, x2, y2, fill);
    }

    fn font_size(&mut self, size: u8) {
        self.font = size;
    }

    fn puts_anchored(&mut self, x: i32, y: i32, text: &str, anchor: Anchor) {
        self.texts.push(TextOp {
            x,
            y,
            text: text.to_string(),
            font_size: self.font,
            anchor,
        });
    }

    fn scrolltext(&mut self, x: i32, y: i32, _width: i32, text: &str) {
        self.puts_anchored(x, y, text, Anchor::Left);
    }

    fn blit(&mut self, x: i32, y: i32, width: i32, height: i32, data: &[u8]) {
        self.buffer.blit(x, y, width, height, data);
    }

    fn update(&mut self) {
        self.updates += 1;
    }

    fn snapshot(&self) -> (i32, i32, Vec<u8>) {
        (
            self.buffer.width,
            self.buffer.height,
            self.buffer.pixels.clone(),
        )
    }
}

/// Framebuffer shim: the same pixel buffer, packed to 1bpp and flushed
/// to the display device on update.
pub struct FbDisplay {
    buffer: PixelBuffer,
    font: u8,
    device: std::path::PathBuf,
    mmap: Option<MmapMut>,
}

impl FbDisplay {
    pub fn open(width: i32, height: i32, device: &Path, use_mmap: bool) -> std::io::Result<Self> {
        let mmap = if use_mmap {
            let file = OpenOptions::new().read(true).write(true).open(device)?;
            let len = (width * height / 8) as usize;
            file.set_len(len as u64).ok();
            Some(unsafe { MmapMut::map_mut(&file)? })
        } else {
            None
        };
        Ok(Self {
            buffer: PixelBuffer::new(width, height),
            font: 3,
            device: device.to_path_buf(),
            mmap,
        })
    }

    fn packed(&self) -> Vec<u8> {
        let mut out = vec![0u8; (self.buffer.width * self.buffer.height / 8) as usize];
        for (idx, pixel) in self.buffer.pixels.iter().enumerate() {
            if *pixel != 0 {
                out[idx / 8] |= 0x80 >> (idx % 8);
            }
        }
        out
    }
}

impl Display for FbDisplay {
    fn width(&self) -> i32 {
        self.buffer.width
    }

    fn height(&self) -> i32 {
        self.buffer.height
    }

    fn clear(&mut self, region: Option<(i32, i32, i32, i32)>) {
        self.buffer.clear(region);
    }

    fn line(&mut self, x1: i32, y1: i32, x2: i32, y2: i32) {
        self.buffer.line(x1, y1, x2, y2);
    }

    fn rect(&mut self, x1: i32, y1: i32, x2: i32, y2: i32, fill: bool) {
        self.buffer.rect(x1, y1, x2, y2, fill);
    }

    fn font_size(&mut self, size: u8) {
        self.font = size;
    }

    fn puts_anchored(&mut self, _x: i32, _y: i32, _text: &str, _anchor: Anchor) {
        // glyph rendering happens in the native display driver
    }

    fn scrolltext(&mut self, _x: i32, _y: i32, _width: i32, _text: &str) {}

    fn blit(&mut self, x: i32, y: i32, width: i32, height: i32, data: &[u8]) {
        self.buffer.blit(x, y, width, height, data);
    }

    fn update(&mut self) {
        let packed = self.packed();
        match self.mmap.as_mut() {
            Some(mmap) => {
                let len = mmap.len().min(packed.len());
                mmap[..len].copy_from_slice(&packed[..len]);
                let _ = mmap.flush();
            }
            None => {
                let result = OpenOptions::new()
                    .write(true)
                    .open(&self.device)
                    .and_then(|mut f| f.write_all(&packed));
                if let Err(e) = result {
                    warn!("unable to write display buffer: {}", e);
                }
            }
        }
    }

    fn snapshot(&self) -> (i32, i32, Vec<u8>) {
        (
            self.buffer.width,
            self.buffer.height,
            self.buffer.pixels.clone(),
        )
    }
}
