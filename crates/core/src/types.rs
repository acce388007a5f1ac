use std::fmt;

use serde::{Deserialize, Serialize};

/// Decoded source image: three dense row-major byte planes plus an optional
/// alpha channel kept at its native bit depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    pub r: Vec<u8>,
    pub g: Vec<u8>,
    pub b: Vec<u8>,
    pub alpha: Option<AlphaChannel>,
}

/// Alpha samples stored at 8, 16 or 32 bits per component.
///
/// Samples are widened to `u32`; `bits` says how many of the low bits are
/// meaningful. Anything other than 8, 16 or 32 is rejected on extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlphaChannel {
    pub bits: u8,
    pub samples: Vec<u32>,
}

impl Image {
    /// Opaque image from an interleaved RGB24 buffer.
    pub fn from_rgb(width: usize, height: usize, rgb: &[u8]) -> Self {
        let pixels = width * height;
        let mut r = Vec::with_capacity(pixels);
        let mut g = Vec::with_capacity(pixels);
        let mut b = Vec::with_capacity(pixels);
        for px in rgb.chunks_exact(3).take(pixels) {
            r.push(px[0]);
            g.push(px[1]);
            b.push(px[2]);
        }
        Self {
            width,
            height,
            r,
            g,
            b,
            alpha: None,
        }
    }

    /// Image from an interleaved RGBA8 buffer. The alpha channel is kept even
    /// when fully opaque; opacity detection happens later in the pipeline.
    pub fn from_rgba(width: usize, height: usize, rgba: &[u8]) -> Self {
        let pixels = width * height;
        let mut r = Vec::with_capacity(pixels);
        let mut g = Vec::with_capacity(pixels);
        let mut b = Vec::with_capacity(pixels);
        let mut a = Vec::with_capacity(pixels);
        for px in rgba.chunks_exact(4).take(pixels) {
            r.push(px[0]);
            g.push(px[1]);
            b.push(px[2]);
            a.push(u32::from(px[3]));
        }
        Self {
            width,
            height,
            r,
            g,
            b,
            alpha: Some(AlphaChannel {
                bits: 8,
                samples: a,
            }),
        }
    }

    /// Single-color image, handy for tests and padding.
    pub fn solid(width: usize, height: usize, rgb: [u8; 3]) -> Self {
        let pixels = width * height;
        Self {
            width,
            height,
            r: vec![rgb[0]; pixels],
            g: vec![rgb[1]; pixels],
            b: vec![rgb[2]; pixels],
            alpha: None,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    pub fn planes(&self) -> [&[u8]; 3] {
        [&self.r, &self.g, &self.b]
    }

    pub(crate) fn check_planes(&self) -> Result<(), String> {
        let expected = self.pixel_count();
        if self.width == 0 || self.height == 0 {
            return Err(format!("empty image {}x{}", self.width, self.height));
        }
        for (name, plane) in [("r", &self.r), ("g", &self.g), ("b", &self.b)] {
            if plane.len() != expected {
                return Err(format!(
                    "{name} plane has {} samples, expected {expected}",
                    plane.len()
                ));
            }
        }
        if let Some(alpha) = &self.alpha {
            if alpha.samples.len() != expected {
                return Err(format!(
                    "alpha plane has {} samples, expected {expected}",
                    alpha.samples.len()
                ));
            }
        }
        Ok(())
    }
}

/// Square input tile in un-expanded source coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileRect {
    pub x: usize,
    pub y: usize,
    pub size: usize,
}

/// Axis-aligned rectangle, used for owned destination regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Region {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn intersects(&self, other: &Region) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }

    pub fn contains(&self, x: usize, y: usize) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }
}

/// Result of one `run` call: packed RGBA8 pixels, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waifu2xOutput {
    pub pixels: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub has_alpha: bool,
}

impl Waifu2xOutput {
    /// RGBA value at `(x, y)`.
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 4] {
        let offset = (y * self.width + x) * 4;
        [
            self.pixels[offset],
            self.pixels[offset + 1],
            self.pixels[offset + 2],
            self.pixels[offset + 3],
        ]
    }
}

/// Container written by the pixel sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
}

impl OutputFormat {
    pub fn from_str_lossy(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Self::Jpeg,
            _ => Self::Png,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Png => write!(f, "png"),
            Self::Jpeg => write!(f, "jpeg"),
        }
    }
}
