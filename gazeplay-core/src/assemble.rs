//! Frame assembly: copy converted ARGB32 rows into a standalone image.

use bytes::Bytes;
use thiserror::Error;

use crate::pixel_convert::{align_up, ConvertedPlanes};

const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("Cannot allocate {bytes} bytes for output image")]
    Allocation { bytes: usize },
    #[error("Source row {row} needs {needed} bytes, buffer has {available}")]
    ShortSource { row: usize, needed: usize, available: usize },
}

/// Immutable ARGB32 picture (bytes A, R, G, B per pixel). Cloning shares the
/// pixel buffer; nothing else can write to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    width: usize,
    height: usize,
    stride: usize,
    data: Bytes,
}

impl Image {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Bytes between the starts of two rows
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Pixel bytes of row `y`, without padding
    pub fn row(&self, y: usize) -> &[u8] {
        let start = y * self.stride;
        &self.data[start..start + self.width * BYTES_PER_PIXEL]
    }

    /// `[a, r, g, b]` at (`x`, `y`)
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 4] {
        let row = self.row(y);
        let i = x * BYTES_PER_PIXEL;
        [row[i], row[i + 1], row[i + 2], row[i + 3]]
    }

    /// Tightly packed RGBA8, the layout image encoders expect
    pub fn to_rgba8(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.width * self.height * 4);
        for y in 0..self.height {
            for argb in self.row(y).chunks_exact(4) {
                out.extend_from_slice(&[argb[1], argb[2], argb[3], argb[0]]);
            }
        }
        out
    }
}

/// Copy `height` rows of `width` pixels out of `src` into a new image whose
/// rows are padded to `row_alignment` bytes.
pub fn assemble(src: &ConvertedPlanes, width: usize, height: usize, row_alignment: usize) -> Result<Image, AssembleError> {
    let dst_stride = width
        .checked_mul(BYTES_PER_PIXEL)
        .and_then(|row| align_up(row, row_alignment))
        .ok_or(AssembleError::Allocation { bytes: usize::MAX })?;
    assemble_with_stride(src, width, height, dst_stride)
}

/// Same as [`assemble`] with an explicit destination stride. A stride smaller
/// than one row of pixels is widened.
pub fn assemble_with_stride(
    src: &ConvertedPlanes,
    width: usize,
    height: usize,
    dst_stride: usize,
) -> Result<Image, AssembleError> {
    let row_bytes = width
        .checked_mul(BYTES_PER_PIXEL)
        .ok_or(AssembleError::Allocation { bytes: usize::MAX })?;
    let dst_stride = dst_stride.max(row_bytes);
    let total = dst_stride
        .checked_mul(height)
        .ok_or(AssembleError::Allocation { bytes: usize::MAX })?;

    let mut data: Vec<u8> = Vec::new();
    data.try_reserve_exact(total)
        .map_err(|_| AssembleError::Allocation { bytes: total })?;
    data.resize(total, 0);

    for y in 0..height {
        let start = y * src.stride;
        let row = src.data.get(start..start + row_bytes).ok_or(AssembleError::ShortSource {
            row: y,
            needed: start + row_bytes,
            available: src.data.len(),
        })?;
        data[y * dst_stride..y * dst_stride + row_bytes].copy_from_slice(row);
    }

    Ok(Image {
        width,
        height,
        stride: dst_stride,
        data: Bytes::from(data),
    })
}
