//! PNG frame codec.
//!
//! Decodes raw camera buffers, rescales them to the requested output bit
//! depth and writes grayscale PNG files through the `image` crate. 8-bit
//! output is written as `L8`, 12 and 16-bit output as `L16` (12-bit values
//! are stored unscaled in the 16-bit container).

use anyhow::{anyhow, Context, Result};
use image::{ImageBuffer, ImageFormat, Luma};
use std::path::Path;

use super::{Frame, OutputFormat, Pixels, RawPixelFormat};
use crate::hardware::capabilities::{FilledBuffer, ImageCodec};

/// Grayscale PNG implementation of [`ImageCodec`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PngCodec;

impl PngCodec {
    /// Create the codec.
    pub fn new() -> Self {
        Self
    }
}

fn rescale(value: u16, from_bits: u8, to_bits: u8) -> u16 {
    if from_bits >= to_bits {
        value >> (from_bits - to_bits)
    } else {
        value << (to_bits - from_bits)
    }
}

impl ImageCodec for PngCodec {
    fn buffer_to_image(&self, buffer: &FilledBuffer) -> Result<Frame> {
        let format = RawPixelFormat::from_name(&buffer.pixel_format)?;
        let pixels = (buffer.width as usize)
            .checked_mul(buffer.height as usize)
            .ok_or_else(|| anyhow!("Frame dimensions overflow"))?;
        let values = format
            .unpack(&buffer.payload, pixels)
            .with_context(|| format!("Failed to decode buffer {:?}", buffer.id))?;

        let pixels = if format == RawPixelFormat::Mono8 {
            Pixels::U8(values.into_iter().map(|v| v as u8).collect())
        } else {
            Pixels::U16(values)
        };

        Ok(Frame {
            width: buffer.width,
            height: buffer.height,
            bit_depth: format.bit_depth(),
            pixels,
        })
    }

    fn convert_to(&self, frame: &Frame, format: OutputFormat) -> Result<Frame> {
        let from = frame.bit_depth;
        let to = format.bit_depth();
        let pixels = match (&frame.pixels, format) {
            (Pixels::U8(p), OutputFormat::Mono8) => Pixels::U8(p.clone()),
            (Pixels::U8(p), _) => {
                Pixels::U16(p.iter().map(|&v| rescale(u16::from(v), from, to)).collect())
            }
            (Pixels::U16(p), OutputFormat::Mono8) => {
                Pixels::U8(p.iter().map(|&v| rescale(v, from, to) as u8).collect())
            }
            (Pixels::U16(p), _) => Pixels::U16(p.iter().map(|&v| rescale(v, from, to)).collect()),
        };

        Ok(Frame {
            width: frame.width,
            height: frame.height,
            bit_depth: to,
            pixels,
        })
    }

    fn write_image(&self, path: &Path, frame: &Frame) -> Result<()> {
        match &frame.pixels {
            Pixels::U8(p) => {
                let img: ImageBuffer<Luma<u8>, Vec<u8>> =
                    ImageBuffer::from_raw(frame.width, frame.height, p.clone())
                        .ok_or_else(|| anyhow!("Pixel count does not match frame size"))?;
                img.save_with_format(path, ImageFormat::Png)
            }
            Pixels::U16(p) => {
                let img: ImageBuffer<Luma<u16>, Vec<u16>> =
                    ImageBuffer::from_raw(frame.width, frame.height, p.clone())
                        .ok_or_else(|| anyhow!("Pixel count does not match frame size"))?;
                img.save_with_format(path, ImageFormat::Png)
            }
        }
        .with_context(|| format!("Failed to write PNG at {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::BufferId;

    fn mono12_packed_buffer(values: &[u16], width: u32, height: u32) -> FilledBuffer {
        FilledBuffer {
            id: BufferId(1),
            width,
            height,
            pixel_format: "Mono12g24IDS".to_string(),
            frame_id: 0,
            payload: RawPixelFormat::Mono12g24Ids.pack(values),
        }
    }

    #[test]
    fn test_decode_and_convert_to_mono8() {
        let codec = PngCodec::new();
        let buffer = mono12_packed_buffer(&[0, 0x0FFF, 0x0800, 0x0010], 2, 2);

        let frame = codec.buffer_to_image(&buffer).unwrap();
        assert_eq!(frame.bit_depth, 12);
        assert_eq!(frame.pixels, Pixels::U16(vec![0, 0x0FFF, 0x0800, 0x0010]));

        let mono8 = codec.convert_to(&frame, OutputFormat::Mono8).unwrap();
        assert_eq!(mono8.pixels, Pixels::U8(vec![0, 0xFF, 0x80, 0x01]));
    }

    #[test]
    fn test_convert_mono12_is_identity_for_12_bit_input() {
        let codec = PngCodec::new();
        let buffer = mono12_packed_buffer(&[1, 2, 3, 4, 5, 6], 3, 2);
        let frame = codec.buffer_to_image(&buffer).unwrap();
        let converted = codec.convert_to(&frame, OutputFormat::Mono12).unwrap();
        assert_eq!(converted, frame);
    }

    #[test]
    fn test_unsupported_format_fails_decode() {
        let codec = PngCodec::new();
        let mut buffer = mono12_packed_buffer(&[0, 0], 2, 1);
        buffer.pixel_format = "RGB8".to_string();
        assert!(codec.buffer_to_image(&buffer).is_err());
    }

    #[test]
    fn test_write_png_16_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let codec = PngCodec::new();
        let frame = Frame {
            width: 4,
            height: 2,
            bit_depth: 12,
            pixels: Pixels::U16((0..8).map(|i| i * 100).collect()),
        };

        codec.write_image(&path, &frame).unwrap();

        let decoded = image::open(&path).unwrap();
        assert_eq!(decoded.width(), 4);
        assert_eq!(decoded.height(), 2);
        let luma = decoded.into_luma16();
        assert_eq!(luma.get_pixel(3, 1).0[0], 700);
    }

    #[test]
    fn test_write_rejects_mismatched_size() {
        let dir = tempfile::tempdir().unwrap();
        let codec = PngCodec::new();
        let frame = Frame {
            width: 4,
            height: 4,
            bit_depth: 8,
            pixels: Pixels::U8(vec![0; 3]),
        };
        assert!(codec.write_image(&dir.path().join("bad.png"), &frame).is_err());
    }
}
