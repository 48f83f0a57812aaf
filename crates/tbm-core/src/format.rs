//! Image format definitions

use serde::{Deserialize, Serialize};

/// Pixel formats an image buffer pool can allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Packed 10-bit Bayer (4 pixels in 5 bytes)
    Raw10,
    /// 16-bit Bayer
    Raw16,
    /// Y plane plus interleaved half-resolution CbCr
    #[default]
    Nv12,
    /// 8-bit RGBA
    Rgba8888,
    /// Opaque byte blob, `width` is the byte count and `height` must be 1
    Blob,
}

impl PixelFormat {
    /// Bytes needed for one frame of `width` x `height`
    pub const fn frame_size(&self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        match self {
            PixelFormat::Raw10 => (w * 5).div_ceil(4) * h,
            PixelFormat::Raw16 => w * h * 2,
            PixelFormat::Nv12 => w * h + (w * h).div_ceil(2),
            PixelFormat::Rgba8888 => w * h * 4,
            PixelFormat::Blob => w * h,
        }
    }
}
