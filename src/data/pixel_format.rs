//! Raw camera payload layouts.
//!
//! Unpacked formats carry one pixel per byte (`Mono8`) or per little-endian
//! 16-bit word (`Mono10`, `Mono12`, `Mono16`). The two IDS grouped formats
//! pack several pixels together:
//!
//! - `Mono12g24IDS`: 2 pixels in 3 bytes. Byte 0 and 1 hold bits 11..4 of
//!   pixel 0 and 1; byte 2 holds bits 3..0 of pixel 0 (low nibble) and
//!   pixel 1 (high nibble).
//! - `Mono10g40IDS`: 4 pixels in 5 bytes. Bytes 0..3 hold bits 9..2 of
//!   pixels 0..3; byte 4 holds bits 1..0 of each pixel, pixel 0 in the two
//!   least significant bits.

use anyhow::{anyhow, bail, Result};

/// Payload layout named by the camera's `PixelFormat` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawPixelFormat {
    /// 8 bits, one byte per pixel.
    Mono8,
    /// 10 bits in 16-bit little-endian words.
    Mono10,
    /// 12 bits in 16-bit little-endian words.
    Mono12,
    /// 16 bits in 16-bit little-endian words.
    Mono16,
    /// 10 bits, 4 pixels packed in 5 bytes.
    Mono10g40Ids,
    /// 12 bits, 2 pixels packed in 3 bytes.
    Mono12g24Ids,
}

impl RawPixelFormat {
    /// Parse the node entry name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "Mono8" => Ok(Self::Mono8),
            "Mono10" => Ok(Self::Mono10),
            "Mono12" => Ok(Self::Mono12),
            "Mono16" => Ok(Self::Mono16),
            "Mono10g40IDS" => Ok(Self::Mono10g40Ids),
            "Mono12g24IDS" => Ok(Self::Mono12g24Ids),
            other => Err(anyhow!("Unsupported pixel format '{}'", other)),
        }
    }

    /// Node entry name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Mono8 => "Mono8",
            Self::Mono10 => "Mono10",
            Self::Mono12 => "Mono12",
            Self::Mono16 => "Mono16",
            Self::Mono10g40Ids => "Mono10g40IDS",
            Self::Mono12g24Ids => "Mono12g24IDS",
        }
    }

    /// Significant bits per pixel.
    pub fn bit_depth(self) -> u8 {
        match self {
            Self::Mono8 => 8,
            Self::Mono10 | Self::Mono10g40Ids => 10,
            Self::Mono12 | Self::Mono12g24Ids => 12,
            Self::Mono16 => 16,
        }
    }

    /// Payload bytes for `pixels` pixels.
    pub fn payload_len(self, pixels: usize) -> usize {
        match self {
            Self::Mono8 => pixels,
            Self::Mono10 | Self::Mono12 | Self::Mono16 => pixels * 2,
            Self::Mono10g40Ids => pixels.div_ceil(4) * 5,
            Self::Mono12g24Ids => pixels.div_ceil(2) * 3,
        }
    }

    /// Unpack `pixels` values from a raw payload.
    ///
    /// Extra trailing payload bytes (line padding) are ignored.
    pub fn unpack(self, payload: &[u8], pixels: usize) -> Result<Vec<u16>> {
        let needed = self.payload_len(pixels);
        if payload.len() < needed {
            bail!(
                "{} payload too short: {} bytes for {} pixels (need {})",
                self.name(),
                payload.len(),
                pixels,
                needed
            );
        }

        let mut out = Vec::with_capacity(pixels);
        match self {
            Self::Mono8 => out.extend(payload[..pixels].iter().map(|&b| u16::from(b))),
            Self::Mono10 | Self::Mono12 | Self::Mono16 => {
                let mask = if self.bit_depth() == 16 {
                    u16::MAX
                } else {
                    (1u16 << self.bit_depth()) - 1
                };
                out.extend(
                    payload[..needed]
                        .chunks_exact(2)
                        .map(|w| u16::from_le_bytes([w[0], w[1]]) & mask),
                );
            }
            Self::Mono12g24Ids => {
                for group in payload[..needed].chunks_exact(3) {
                    let low = group[2];
                    out.push((u16::from(group[0]) << 4) | u16::from(low & 0x0F));
                    out.push((u16::from(group[1]) << 4) | u16::from(low >> 4));
                }
            }
            Self::Mono10g40Ids => {
                for group in payload[..needed].chunks_exact(5) {
                    let low = group[4];
                    for (i, &high) in group[..4].iter().enumerate() {
                        let lsb = (low >> (2 * i)) & 0x03;
                        out.push((u16::from(high) << 2) | u16::from(lsb));
                    }
                }
            }
        }
        out.truncate(pixels);
        Ok(out)
    }

    /// Pack pixel values into this layout. Values are masked to the format's bit depth.
    pub fn pack(self, values: &[u16]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload_len(values.len()));
        match self {
            Self::Mono8 => out.extend(values.iter().map(|&v| (v & 0xFF) as u8)),
            Self::Mono10 | Self::Mono12 | Self::Mono16 => {
                let mask = if self.bit_depth() == 16 {
                    u16::MAX
                } else {
                    (1u16 << self.bit_depth()) - 1
                };
                for &v in values {
                    out.extend_from_slice(&(v & mask).to_le_bytes());
                }
            }
            Self::Mono12g24Ids => {
                for pair in values.chunks(2) {
                    let p0 = pair[0] & 0x0FFF;
                    let p1 = pair.get(1).copied().unwrap_or(0) & 0x0FFF;
                    out.push((p0 >> 4) as u8);
                    out.push((p1 >> 4) as u8);
                    out.push(((p0 & 0x0F) | ((p1 & 0x0F) << 4)) as u8);
                }
            }
            Self::Mono10g40Ids => {
                for quad in values.chunks(4) {
                    let mut low = 0u8;
                    for i in 0..4 {
                        let v = quad.get(i).copied().unwrap_or(0) & 0x03FF;
                        out.push((v >> 2) as u8);
                        low |= ((v & 0x03) as u8) << (2 * i);
                    }
                    out.push(low);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono12g24_unpacks_known_group() {
        // pixel 0 = 0xABC, pixel 1 = 0x123
        let payload = [0xAB, 0x12, 0x3C];
        let values = RawPixelFormat::Mono12g24Ids.unpack(&payload, 2).unwrap();
        assert_eq!(values, vec![0xABC, 0x123]);
    }

    #[test]
    fn test_mono10g40_unpacks_known_group() {
        // pixels 0x3FF, 0x000, 0x201, 0x102
        let payload = [0xFF, 0x00, 0x80, 0x40, 0b1001_0011];
        let values = RawPixelFormat::Mono10g40Ids.unpack(&payload, 4).unwrap();
        assert_eq!(values, vec![0x3FF, 0x000, 0x201, 0x102]);
    }

    #[test]
    fn test_pack_matches_unpack_for_odd_pixel_counts() {
        let values: Vec<u16> = (0..7).map(|i| i * 500).collect();
        let packed = RawPixelFormat::Mono12g24Ids.pack(&values);
        assert_eq!(packed.len(), RawPixelFormat::Mono12g24Ids.payload_len(7));
        let unpacked = RawPixelFormat::Mono12g24Ids.unpack(&packed, 7).unwrap();
        assert_eq!(unpacked, values);
    }

    #[test]
    fn test_short_payload_rejected() {
        let result = RawPixelFormat::Mono16.unpack(&[0u8; 3], 2);
        assert!(result.is_err());
    }

    #[test]
    fn test_mono12_masks_unused_bits() {
        let payload = 0xFFFFu16.to_le_bytes();
        let values = RawPixelFormat::Mono12.unpack(&payload, 1).unwrap();
        assert_eq!(values, vec![0x0FFF]);
    }

    #[test]
    fn test_unknown_format_name() {
        assert!(RawPixelFormat::from_name("BayerRG8").is_err());
        assert_eq!(
            RawPixelFormat::from_name("Mono12g24IDS").unwrap(),
            RawPixelFormat::Mono12g24Ids
        );
    }
}
