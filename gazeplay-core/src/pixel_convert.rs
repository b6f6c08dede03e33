// PIXEL CONVERT - Decoder output to display-ready ARGB
//
// Decoders hand back planar YUV (or the odd packed RGB stream).
// The display side wants one packed 32-bit layout, alpha first.
// This module converts between them at the same resolution.
//
// The converter is cached: building one means filling the lookup tables,
// so it is only rebuilt when the source format or dimensions change.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decode::RawFrame;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Cannot create conversion context {src:?} {width}x{height} -> ARGB32 {dst_width}x{dst_height}")]
    ContextCreation {
        src: PixelFormat,
        width: usize,
        height: usize,
        dst_width: usize,
        dst_height: usize,
    },
    #[error("Frame does not match conversion context: {0}")]
    FrameMismatch(String),
    #[error("Cannot allocate ARGB32 buffer for {width}x{height}")]
    Allocation { width: usize, height: usize },
}

// ============================================================================
// Pixel Formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    // YUV planar (software decoder output)
    Yuv420p,      // Y plane, U plane (quarter size), V plane (quarter size)
    Yuv444p,      // Y plane, U plane (full size), V plane (full size)

    // YUV semi-planar
    Nv12,         // Y plane, interleaved UV plane

    // Packed
    Rgb24,        // R, G, B
    Argb32,       // A, R, G, B (display format)
}

impl PixelFormat {
    pub fn plane_count(&self) -> usize {
        match self {
            Self::Yuv420p | Self::Yuv444p => 3,
            Self::Nv12 => 2,
            Self::Rgb24 | Self::Argb32 => 1,
        }
    }

    /// Width and height of plane `index` for a `width`x`height` picture, in samples.
    pub fn plane_size(&self, index: usize, width: usize, height: usize) -> (usize, usize) {
        let half = ((width + 1) / 2, (height + 1) / 2);
        match (self, index) {
            (Self::Yuv420p, 1 | 2) => half,
            (Self::Nv12, 1) => half,
            _ => (width, height),
        }
    }

    /// Bytes in one row of plane `index` without padding.
    pub fn plane_row_bytes(&self, index: usize, width: usize) -> usize {
        let (w, _) = self.plane_size(index, width, 1);
        match (self, index) {
            (Self::Nv12, 1) => w * 2,
            (Self::Rgb24, _) => w * 3,
            (Self::Argb32, _) => w * 4,
            _ => w,
        }
    }

    /// Tightly packed frame size in bytes, `None` if it does not fit a usize.
    pub fn buffer_size(&self, width: usize, height: usize) -> Option<usize> {
        (0..self.plane_count()).try_fold(0usize, |total, i| {
            let (_, h) = self.plane_size(i, width, height);
            self.plane_row_bytes(i, width).checked_mul(h)?.checked_add(total)
        })
    }
}

// ============================================================================
// Color Spaces
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    Bt601,    // SD
    Bt709,    // HD
    Bt2020,   // UHD
}

impl ColorSpace {
    /// Returns (Wr, Wb) where Wg = 1 - Wr - Wb
    pub fn coefficients(&self) -> (f32, f32) {
        match self {
            Self::Bt601 => (0.299, 0.114),
            Self::Bt709 => (0.2126, 0.0722),
            Self::Bt2020 => (0.2627, 0.0593),
        }
    }

    /// YUV to RGB matrix, rows R/G/B, columns Y/Cb/Cr
    pub fn yuv_to_rgb_matrix(&self) -> [[f32; 3]; 3] {
        let (wr, wb) = self.coefficients();
        let wg = 1.0 - wr - wb;

        // R = Y + 2*(1-Wr)*Cr
        // G = Y - 2*Wb*(1-Wb)/Wg*Cb - 2*Wr*(1-Wr)/Wg*Cr
        // B = Y + 2*(1-Wb)*Cb
        let cr_r = 2.0 * (1.0 - wr);
        let cb_g = -2.0 * wb * (1.0 - wb) / wg;
        let cr_g = -2.0 * wr * (1.0 - wr) / wg;
        let cb_b = 2.0 * (1.0 - wb);

        [
            [1.0, 0.0, cr_r],
            [1.0, cb_g, cr_g],
            [1.0, cb_b, 0.0],
        ]
    }
}

impl Default for ColorSpace {
    fn default() -> Self {
        ColorSpace::Bt601
    }
}

// ============================================================================
// Converted output
// ============================================================================

/// Packed ARGB32 output of the converter. Rows are `stride` bytes apart and
/// the stride is padded up to the configured alignment, so it is generally
/// larger than `width * 4`.
#[derive(Debug, Clone)]
pub struct ConvertedPlanes {
    pub data: Vec<u8>,
    pub stride: usize,
    pub width: usize,
    pub height: usize,
}

impl ConvertedPlanes {
    /// Zeroed buffer for `width`x`height`; fails instead of aborting when
    /// the size overflows or the allocator refuses it.
    pub fn new(width: usize, height: usize, row_alignment: usize) -> Result<Self, ConvertError> {
        let failed = || ConvertError::Allocation { width, height };
        let stride = width
            .checked_mul(4)
            .and_then(|row| align_up(row, row_alignment))
            .ok_or_else(failed)?;
        let total = stride.checked_mul(height).ok_or_else(failed)?;

        let mut data = Vec::new();
        data.try_reserve_exact(total).map_err(|_| failed())?;
        data.resize(total, 0);
        Ok(Self {
            data,
            stride,
            width,
            height,
        })
    }

    fn empty() -> Self {
        Self {
            data: Vec::new(),
            stride: 0,
            width: 0,
            height: 0,
        }
    }

    /// Pixel bytes of row `y`, without the padding.
    pub fn row(&self, y: usize) -> &[u8] {
        let start = y * self.stride;
        &self.data[start..start + self.width * 4]
    }

    fn row_mut(&mut self, y: usize) -> &mut [u8] {
        let start = y * self.stride;
        let len = self.width * 4;
        &mut self.data[start..start + len]
    }
}

pub(crate) fn align_up(value: usize, alignment: usize) -> Option<usize> {
    if alignment <= 1 {
        return Some(value);
    }
    Some(value.checked_add(alignment - 1)? / alignment * alignment)
}

// ============================================================================
// Converter
// ============================================================================

pub struct PixelConverter {
    src_format: PixelFormat,
    width: usize,
    height: usize,
    color_space: ColorSpace,
    // Lookup tables, values already in output units
    y_table: [i32; 256],
    u_table_g: [i32; 256],
    u_table_b: [i32; 256],
    v_table_r: [i32; 256],
    v_table_g: [i32; 256],
}

impl PixelConverter {
    /// Build a conversion context. Conversion is resolution preserving, so a
    /// destination size different from the source is refused, as is an empty
    /// picture.
    pub fn new(
        src_format: PixelFormat,
        width: usize,
        height: usize,
        dst_width: usize,
        dst_height: usize,
        color_space: ColorSpace,
    ) -> Result<Self, ConvertError> {
        if width == 0 || height == 0 || width != dst_width || height != dst_height {
            return Err(ConvertError::ContextCreation {
                src: src_format,
                width,
                height,
                dst_width,
                dst_height,
            });
        }

        let mut converter = Self {
            src_format,
            width,
            height,
            color_space,
            y_table: [0; 256],
            u_table_g: [0; 256],
            u_table_b: [0; 256],
            v_table_r: [0; 256],
            v_table_g: [0; 256],
        };
        converter.build_tables();
        Ok(converter)
    }

    fn build_tables(&mut self) {
        let matrix = self.color_space.yuv_to_rgb_matrix();
        // Limited range: chroma spans 16..240 around 128
        let chroma_scale = 255.0 / 224.0;

        for i in 0..256 {
            let y = (i as i32) - 16;
            let uv = ((i as i32) - 128) as f32 * chroma_scale;

            // 298/256 ≈ 255/219 stretches 16..235 to 0..255
            self.y_table[i] = (y * 298 + 128) >> 8;

            self.u_table_g[i] = (uv * matrix[1][1]).round() as i32;
            self.u_table_b[i] = (uv * matrix[2][1]).round() as i32;
            self.v_table_r[i] = (uv * matrix[0][2]).round() as i32;
            self.v_table_g[i] = (uv * matrix[1][2]).round() as i32;
        }
    }

    fn matches(&self, format: PixelFormat, width: usize, height: usize, color_space: ColorSpace) -> bool {
        self.src_format == format
            && self.width == width
            && self.height == height
            && self.color_space == color_space
    }

    /// Convert `src` into `dst`. Both must match the context dimensions.
    pub fn convert(&self, src: &RawFrame, dst: &mut ConvertedPlanes) -> Result<(), ConvertError> {
        if src.format != self.src_format {
            return Err(ConvertError::FrameMismatch(format!(
                "format {:?}, expected {:?}",
                src.format, self.src_format
            )));
        }
        if src.width != self.width || src.height != self.height {
            return Err(ConvertError::FrameMismatch(format!(
                "size {}x{}, expected {}x{}",
                src.width, src.height, self.width, self.height
            )));
        }
        if dst.width != self.width || dst.height != self.height {
            return Err(ConvertError::FrameMismatch(format!(
                "output {}x{}, expected {}x{}",
                dst.width, dst.height, self.width, self.height
            )));
        }
        src.validate().map_err(ConvertError::FrameMismatch)?;

        match self.src_format {
            PixelFormat::Yuv420p => self.planar_to_argb(src, dst, 1),
            PixelFormat::Yuv444p => self.planar_to_argb(src, dst, 0),
            PixelFormat::Nv12 => self.nv12_to_argb(src, dst),
            PixelFormat::Rgb24 => Self::rgb_to_argb(src, dst),
            PixelFormat::Argb32 => Self::copy_argb(src, dst),
        }

        Ok(())
    }

    #[inline]
    fn yuv_pixel(&self, y: u8, u: u8, v: u8, out: &mut [u8]) {
        let y_contrib = self.y_table[y as usize];
        let r = y_contrib + self.v_table_r[v as usize];
        let g = y_contrib + self.u_table_g[u as usize] + self.v_table_g[v as usize];
        let b = y_contrib + self.u_table_b[u as usize];

        out[0] = 255;
        out[1] = r.clamp(0, 255) as u8;
        out[2] = g.clamp(0, 255) as u8;
        out[3] = b.clamp(0, 255) as u8;
    }

    /// Yuv420p (`shift` = 1) and Yuv444p (`shift` = 0)
    fn planar_to_argb(&self, src: &RawFrame, dst: &mut ConvertedPlanes, shift: usize) {
        let (y_plane, y_stride) = src.plane(0);
        let (u_plane, u_stride) = src.plane(1);
        let (v_plane, v_stride) = src.plane(2);

        for row in 0..self.height {
            let y_row = &y_plane[row * y_stride..];
            let u_row = &u_plane[(row >> shift) * u_stride..];
            let v_row = &v_plane[(row >> shift) * v_stride..];
            let out = dst.row_mut(row);

            for x in 0..self.width {
                let cx = x >> shift;
                self.yuv_pixel(y_row[x], u_row[cx], v_row[cx], &mut out[x * 4..x * 4 + 4]);
            }
        }
    }

    fn nv12_to_argb(&self, src: &RawFrame, dst: &mut ConvertedPlanes) {
        let (y_plane, y_stride) = src.plane(0);
        let (uv_plane, uv_stride) = src.plane(1);

        for row in 0..self.height {
            let y_row = &y_plane[row * y_stride..];
            let uv_row = &uv_plane[(row / 2) * uv_stride..];
            let out = dst.row_mut(row);

            for x in 0..self.width {
                let uv_idx = (x / 2) * 2;
                self.yuv_pixel(y_row[x], uv_row[uv_idx], uv_row[uv_idx + 1], &mut out[x * 4..x * 4 + 4]);
            }
        }
    }

    fn rgb_to_argb(src: &RawFrame, dst: &mut ConvertedPlanes) {
        let (plane, stride) = src.plane(0);
        for row in 0..dst.height {
            let src_row = &plane[row * stride..row * stride + dst.width * 3];
            let out = dst.row_mut(row);
            for (px, rgb) in out.chunks_exact_mut(4).zip(src_row.chunks_exact(3)) {
                px[0] = 255;
                px[1..4].copy_from_slice(rgb);
            }
        }
    }

    fn copy_argb(src: &RawFrame, dst: &mut ConvertedPlanes) {
        let (plane, stride) = src.plane(0);
        let len = dst.width * 4;
        for row in 0..dst.height {
            dst.row_mut(row)
                .copy_from_slice(&plane[row * stride..row * stride + len]);
        }
    }
}

// ============================================================================
// Cached conversion context
// ============================================================================

/// Holds the current conversion context and the destination buffer it
/// writes into. `convert` is a cheap no-op lookup in steady state and only
/// rebuilds when the incoming frame's format or size changes.
pub struct ConverterCache {
    color_space: ColorSpace,
    row_alignment: usize,
    converter: Option<PixelConverter>,
    output: ConvertedPlanes,
    rebuilds: u64,
}

impl ConverterCache {
    pub fn new(color_space: ColorSpace, row_alignment: usize) -> Self {
        Self {
            color_space,
            row_alignment,
            converter: None,
            output: ConvertedPlanes::empty(),
            rebuilds: 0,
        }
    }

    /// Pre-size the destination buffer for a stream, so the first frame
    /// does not pay for the allocation.
    pub fn with_output_size(
        color_space: ColorSpace,
        row_alignment: usize,
        width: usize,
        height: usize,
    ) -> Result<Self, ConvertError> {
        let mut cache = Self::new(color_space, row_alignment);
        cache.output = ConvertedPlanes::new(width, height, row_alignment)?;
        Ok(cache)
    }

    /// Convert `frame` to ARGB32 at `dst_width`x`dst_height`.
    ///
    /// A `ContextCreation` error means the session cannot continue.
    pub fn convert(
        &mut self,
        frame: &RawFrame,
        dst_width: usize,
        dst_height: usize,
    ) -> Result<&ConvertedPlanes, ConvertError> {
        let reuse = self
            .converter
            .as_ref()
            .map(|c| c.matches(frame.format, frame.width, frame.height, self.color_space))
            .unwrap_or(false)
            && self.output.width == dst_width
            && self.output.height == dst_height;

        if !reuse {
            self.converter = None;
            let converter = PixelConverter::new(
                frame.format,
                frame.width,
                frame.height,
                dst_width,
                dst_height,
                self.color_space,
            )?;
            tracing::debug!(
                "Conversion context {:?} {}x{} -> ARGB32",
                frame.format,
                frame.width,
                frame.height
            );
            if self.output.width != dst_width || self.output.height != dst_height {
                self.output = ConvertedPlanes::new(dst_width, dst_height, self.row_alignment)?;
            }
            self.converter = Some(converter);
            self.rebuilds += 1;
        }

        if let Some(converter) = &self.converter {
            converter.convert(frame, &mut self.output)?;
        }
        Ok(&self.output)
    }

    /// Number of times a context has been (re)built.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
}
