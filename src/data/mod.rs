//! Frame data and persistence.
//!
//! - [`pixel_format`] - raw payload layouts delivered by the camera and their unpacking
//! - [`png_codec`] - the bundled [`ImageCodec`](crate::hardware::capabilities::ImageCodec)
//!   that converts frames and writes them as grayscale PNG

pub mod pixel_format;
pub mod png_codec;

use serde::{Deserialize, Serialize};

pub use pixel_format::RawPixelFormat;
pub use png_codec::PngCodec;

/// Pixel format frames are converted to before they are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// 8-bit grayscale.
    #[serde(alias = "Mono8")]
    Mono8,
    /// 12-bit grayscale in 16-bit containers.
    #[default]
    #[serde(alias = "Mono12")]
    Mono12,
    /// 16-bit grayscale.
    #[serde(alias = "Mono16")]
    Mono16,
}

impl OutputFormat {
    /// Significant bits per pixel.
    pub fn bit_depth(self) -> u8 {
        match self {
            OutputFormat::Mono8 => 8,
            OutputFormat::Mono12 => 12,
            OutputFormat::Mono16 => 16,
        }
    }
}

/// Pixel storage of a decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Pixels {
    /// One byte per pixel.
    U8(Vec<u8>),
    /// One 16-bit container per pixel.
    U16(Vec<u16>),
}

impl Pixels {
    /// Number of pixels.
    pub fn len(&self) -> usize {
        match self {
            Pixels::U8(p) => p.len(),
            Pixels::U16(p) => p.len(),
        }
    }

    /// Whether the frame holds no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A decoded monochrome frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Significant bits per pixel.
    pub bit_depth: u8,
    /// Pixel values, row-major.
    pub pixels: Pixels,
}
