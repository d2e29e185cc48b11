//! Pixel format conversion for device buffers that are not already RGB24.

use anyhow::{anyhow, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeviceFormat {
    Rgb24,
    Yuyv,
    Nv12,
}

impl DeviceFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(Self::Rgb24),
            b"YUYV" => Some(Self::Yuyv),
            b"NV12" => Some(Self::Nv12),
            _ => None,
        }
    }
}

pub(crate) fn to_rgb24(pixels: &[u8], width: u32, height: u32, format: DeviceFormat) -> Result<Vec<u8>> {
    let (w, h) = (width as usize, height as usize);
    let area = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
    let expected = match format {
        DeviceFormat::Rgb24 => area * 3,
        DeviceFormat::Yuyv => area * 2,
        DeviceFormat::Nv12 => area + area / 2,
    };
    // Drivers may pad the final buffer; only short buffers are fatal.
    if pixels.len() < expected {
        return Err(anyhow!(
            "{:?} buffer too short: expected {}, got {}",
            format,
            expected,
            pixels.len()
        ));
    }
    let pixels = &pixels[..expected];
    let mut rgb = vec![0u8; area * 3];
    match format {
        DeviceFormat::Rgb24 => rgb.copy_from_slice(pixels),
        DeviceFormat::Yuyv => {
            for (pair, out) in pixels.chunks_exact(4).zip(rgb.chunks_exact_mut(6)) {
                let (u, v) = (pair[1], pair[3]);
                write_rgb(&mut out[..3], pair[0], u, v);
                write_rgb(&mut out[3..], pair[2], u, v);
            }
        }
        DeviceFormat::Nv12 => {
            for row in 0..h {
                for col in 0..w {
                    let uv = area + (row / 2) * w + (col / 2) * 2;
                    let offset = (row * w + col) * 3;
                    write_rgb(
                        &mut rgb[offset..offset + 3],
                        pixels[row * w + col],
                        pixels[uv],
                        pixels[uv + 1],
                    );
                }
            }
        }
    }
    Ok(rgb)
}

fn write_rgb(out: &mut [u8], y: u8, u: u8, v: u8) {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    out[0] = clamp_to_u8(y + 1.402 * v);
    out[1] = clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v);
    out[2] = clamp_to_u8(y + 1.772 * u);
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_chroma_is_gray() -> Result<()> {
        let yuyv = [128u8, 128, 128, 128];
        assert_eq!(to_rgb24(&yuyv, 2, 1, DeviceFormat::Yuyv)?, vec![128u8; 6]);
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        assert_eq!(to_rgb24(&nv12, 2, 2, DeviceFormat::Nv12)?, vec![128u8; 12]);
        Ok(())
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(to_rgb24(&[0u8; 5], 2, 1, DeviceFormat::Rgb24).is_err());
        assert_eq!(DeviceFormat::from_fourcc(b"MJPG"), None);
    }
}
