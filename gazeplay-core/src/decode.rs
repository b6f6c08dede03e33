//! # Video Decode Module
//!
//! Decoder contract used by the decode worker, plus the built-in software
//! decoders.
//!
//! ## Frame ownership
//! Decoded pictures live in a [`FrameArena`] owned by the decoder. A
//! successful [`VideoDecoder::decode`] hands back a [`FrameHandle`]; the
//! caller reads the picture through [`VideoDecoder::frame`], copies what it
//! needs, then gives the handle back with [`VideoDecoder::release`]. Slots are
//! recycled, so a caller that never releases grows the arena without bound.
//!
//! ## Partial consumption and flushing
//! `decode` reports how many bytes of the input it consumed. The caller
//! resubmits the remainder until the whole packet is gone. Submitting an
//! empty slice asks the decoder to drain pictures it is still holding.

use std::collections::VecDeque;

use thiserror::Error;

use crate::demuxer::{OpenError, StreamInfo};
use crate::pixel_convert::PixelFormat;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid bitstream: {0}")]
    InvalidData(String),
    #[error("Decoder backend error: {0}")]
    Backend(String),
}

// ============================================================================
// Raw frames and the arena
// ============================================================================

/// One plane of a decoded picture
#[derive(Debug, Clone, Default)]
pub struct Plane {
    pub data: Vec<u8>,
    /// Bytes between the starts of two rows
    pub stride: usize,
}

/// A decoded picture in the decoder's native layout
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub format: PixelFormat,
    pub width: usize,
    pub height: usize,
    pub planes: Vec<Plane>,
    /// Presentation timestamp in the stream time-base
    pub pts: Option<i64>,
}

impl RawFrame {
    pub fn empty() -> Self {
        Self {
            format: PixelFormat::Yuv420p,
            width: 0,
            height: 0,
            planes: Vec::new(),
            pts: None,
        }
    }

    /// Re-shape for a new picture, keeping the plane allocations.
    pub fn reset(&mut self, format: PixelFormat, width: usize, height: usize) {
        self.format = format;
        self.width = width;
        self.height = height;
        self.pts = None;
        self.planes.resize_with(format.plane_count(), Plane::default);
        for plane in &mut self.planes {
            plane.data.clear();
            plane.stride = 0;
        }
    }

    /// Plane data and stride. Panics on a plane index the format does not have.
    pub fn plane(&self, index: usize) -> (&[u8], usize) {
        let plane = &self.planes[index];
        (&plane.data, plane.stride)
    }

    /// Check every plane is large enough for the declared size.
    pub fn validate(&self) -> Result<(), String> {
        if self.planes.len() != self.format.plane_count() {
            return Err(format!(
                "{:?} needs {} planes, frame has {}",
                self.format,
                self.format.plane_count(),
                self.planes.len()
            ));
        }
        for (index, plane) in self.planes.iter().enumerate() {
            let (_, rows) = self.format.plane_size(index, self.width, self.height);
            let row_bytes = self.format.plane_row_bytes(index, self.width);
            if plane.stride < row_bytes {
                return Err(format!("plane {} stride {} < row size {}", index, plane.stride, row_bytes));
            }
            let needed = if rows == 0 { 0 } else { plane.stride * (rows - 1) + row_bytes };
            if plane.data.len() < needed {
                return Err(format!("plane {} holds {} bytes, needs {}", index, plane.data.len(), needed));
            }
        }
        Ok(())
    }
}

/// Ticket for a picture held in a decoder's arena. Not `Clone`: a handle is
/// released exactly once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "decoded frames must be released back to the decoder"]
pub struct FrameHandle {
    index: usize,
    generation: u64,
}

struct Slot {
    frame: RawFrame,
    generation: u64,
    in_use: bool,
}

/// Decoder-owned pool of picture buffers
pub struct FrameArena {
    slots: Vec<Slot>,
    next_generation: u64,
}

impl FrameArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            next_generation: 0,
        }
    }

    /// Take a free slot (or grow by one) and return it for filling.
    pub fn acquire(&mut self) -> (FrameHandle, &mut RawFrame) {
        let index = match self.slots.iter().position(|s| !s.in_use) {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    frame: RawFrame::empty(),
                    generation: 0,
                    in_use: false,
                });
                self.slots.len() - 1
            }
        };

        self.next_generation += 1;
        let slot = &mut self.slots[index];
        slot.in_use = true;
        slot.generation = self.next_generation;
        (
            FrameHandle {
                index,
                generation: slot.generation,
            },
            &mut slot.frame,
        )
    }

    pub fn get(&self, handle: &FrameHandle) -> Option<&RawFrame> {
        self.slots
            .get(handle.index)
            .filter(|s| s.in_use && s.generation == handle.generation)
            .map(|s| &s.frame)
    }

    /// Return a slot to the pool. A stale handle is ignored.
    pub fn release(&mut self, handle: FrameHandle) {
        match self.slots.get_mut(handle.index) {
            Some(slot) if slot.in_use && slot.generation == handle.generation => {
                slot.in_use = false;
                slot.frame.pts = None;
            }
            _ => tracing::warn!("Release of unknown frame handle {:?}", handle),
        }
    }

    /// Pictures handed out and not yet released (including any the decoder
    /// is holding for reordering).
    pub fn outstanding(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    /// Total slots ever allocated
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Default for FrameArena {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Decoder contract
// ============================================================================

/// Outcome of one `decode` call
#[derive(Debug)]
pub struct DecodeResult {
    /// Bytes of the submitted input used up by this call
    pub consumed: usize,
    /// Picture produced by this call, if any
    pub frame: Option<FrameHandle>,
}

impl DecodeResult {
    pub fn consumed(consumed: usize) -> Self {
        Self { consumed, frame: None }
    }

    pub fn with_frame(consumed: usize, frame: FrameHandle) -> Self {
        Self {
            consumed,
            frame: Some(frame),
        }
    }
}

/// Stateful decompressor bound to one stream
pub trait VideoDecoder: Send {
    /// Decoder name for logging
    fn name(&self) -> &str;

    /// Decode from `data`. An empty slice is a flush request: return one
    /// buffered picture, or no picture once nothing is left.
    fn decode(&mut self, data: &[u8], pts: Option<i64>) -> Result<DecodeResult, DecodeError>;

    /// Look at a picture returned by `decode`
    fn frame(&self, handle: &FrameHandle) -> Option<&RawFrame>;

    /// Hand a picture back
    fn release(&mut self, handle: FrameHandle);

    /// Pictures currently out of the pool
    fn outstanding_frames(&self) -> usize;
}

// ============================================================================
// Registry
// ============================================================================

type DecoderFactory = Box<dyn Fn(&StreamInfo) -> Result<Box<dyn VideoDecoder>, DecodeError> + Send + Sync>;

/// Maps codec ids (`"rawvideo"`, `"h264"`) to decoder constructors
pub struct DecoderRegistry {
    factories: Vec<(String, DecoderFactory)>,
}

impl DecoderRegistry {
    pub fn empty() -> Self {
        Self { factories: Vec::new() }
    }

    /// Registry with every decoder compiled in
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(RAWVIDEO, |stream| {
            Ok(Box::new(RawVideoDecoder::for_stream(stream)?) as Box<dyn VideoDecoder>)
        });
        #[cfg(feature = "software-decode")]
        registry.register(H264, |stream| {
            Ok(Box::new(OpenH264Decoder::new(&stream.extradata)?) as Box<dyn VideoDecoder>)
        });
        registry
    }

    /// Register (or replace) the factory for `codec_id`.
    pub fn register<F>(&mut self, codec_id: &str, factory: F)
    where
        F: Fn(&StreamInfo) -> Result<Box<dyn VideoDecoder>, DecodeError> + Send + Sync + 'static,
    {
        self.factories.retain(|(id, _)| id != codec_id);
        self.factories.push((codec_id.to_string(), Box::new(factory)));
    }

    pub fn supports(&self, codec_id: &str) -> bool {
        self.factories.iter().any(|(id, _)| id == codec_id)
    }

    /// Open a decoder for `stream`.
    pub fn create(&self, stream: &StreamInfo) -> Result<Box<dyn VideoDecoder>, OpenError> {
        let (_, factory) = self
            .factories
            .iter()
            .find(|(id, _)| *id == stream.codec_id)
            .ok_or_else(|| OpenError::UnsupportedCodec(stream.codec_id.clone()))?;

        factory(stream).map_err(|e| OpenError::DecoderInitFailed(e.to_string()))
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub const RAWVIDEO: &str = "rawvideo";
pub const H264: &str = "h264";

// ============================================================================
// Raw video "decoder"
// ============================================================================

/// Decoder for uncompressed pictures: each `format.buffer_size()` bytes of
/// input is one picture. A packet carrying several pictures is consumed one
/// picture per call.
///
/// `delay` holds that many pictures back before output, the way a reordering
/// codec would; they come out during the flush.
pub struct RawVideoDecoder {
    format: PixelFormat,
    width: usize,
    height: usize,
    picture_size: usize,
    delay: usize,
    pending: VecDeque<FrameHandle>,
    arena: FrameArena,
}

impl RawVideoDecoder {
    pub fn new(format: PixelFormat, width: usize, height: usize) -> Result<Self, DecodeError> {
        if width == 0 || height == 0 {
            return Err(DecodeError::InvalidData(format!("picture size {}x{}", width, height)));
        }
        let picture_size = format
            .buffer_size(width, height)
            .ok_or_else(|| DecodeError::InvalidData(format!("picture size {}x{} overflows", width, height)))?;
        Ok(Self {
            format,
            width,
            height,
            picture_size,
            delay: 0,
            pending: VecDeque::new(),
            arena: FrameArena::new(),
        })
    }

    pub fn for_stream(stream: &StreamInfo) -> Result<Self, DecodeError> {
        let format = stream
            .pixel_format
            .ok_or_else(|| DecodeError::InvalidData("raw stream without pixel format".into()))?;
        Self::new(format, stream.width as usize, stream.height as usize)
    }

    pub fn with_delay(mut self, delay: usize) -> Self {
        self.delay = delay;
        self
    }

    pub fn picture_size(&self) -> usize {
        self.picture_size
    }

    fn unpack(&mut self, data: &[u8], pts: Option<i64>) -> FrameHandle {
        let (format, width, height) = (self.format, self.width, self.height);
        let (handle, frame) = self.arena.acquire();
        frame.reset(format, width, height);
        frame.pts = pts;

        let mut offset = 0;
        for (index, plane) in frame.planes.iter_mut().enumerate() {
            let (_, rows) = format.plane_size(index, width, height);
            let row_bytes = format.plane_row_bytes(index, width);
            let len = row_bytes * rows;
            plane.data.extend_from_slice(&data[offset..offset + len]);
            plane.stride = row_bytes;
            offset += len;
        }
        handle
    }
}

impl VideoDecoder for RawVideoDecoder {
    fn name(&self) -> &str {
        "rawvideo"
    }

    fn decode(&mut self, data: &[u8], pts: Option<i64>) -> Result<DecodeResult, DecodeError> {
        if data.is_empty() {
            return Ok(match self.pending.pop_front() {
                Some(handle) => DecodeResult::with_frame(0, handle),
                None => DecodeResult::consumed(0),
            });
        }

        let size = self.picture_size();
        if data.len() < size {
            return Err(DecodeError::InvalidData(format!(
                "{} bytes left, picture needs {}",
                data.len(),
                size
            )));
        }

        let handle = self.unpack(&data[..size], pts);
        self.pending.push_back(handle);

        if self.pending.len() > self.delay {
            if let Some(out) = self.pending.pop_front() {
                return Ok(DecodeResult::with_frame(size, out));
            }
        }
        Ok(DecodeResult::consumed(size))
    }

    fn frame(&self, handle: &FrameHandle) -> Option<&RawFrame> {
        self.arena.get(handle)
    }

    fn release(&mut self, handle: FrameHandle) {
        self.arena.release(handle);
    }

    fn outstanding_frames(&self) -> usize {
        self.arena.outstanding()
    }
}

// ============================================================================
// OpenH264 Software Decoder
// ============================================================================

#[cfg(feature = "software-decode")]
pub use self::openh264_backend::OpenH264Decoder;

#[cfg(feature = "software-decode")]
mod openh264_backend {
    use openh264::formats::YUVSource;

    use super::{DecodeError, DecodeResult, FrameArena, FrameHandle, RawFrame, VideoDecoder};
    use crate::h264::{self, AvcConfig, Framing};
    use crate::pixel_convert::PixelFormat;

    /// H.264 through Cisco's openh264. Runs in no-delay mode, so it never
    /// holds pictures back and a flush produces nothing.
    pub struct OpenH264Decoder {
        decoder: openh264::decoder::Decoder,
        framing: Framing,
        arena: FrameArena,
    }

    impl OpenH264Decoder {
        /// `extradata` is the track's avcC record, or empty for Annex B streams.
        pub fn new(extradata: &[u8]) -> Result<Self, DecodeError> {
            let mut decoder = openh264::decoder::Decoder::new()
                .map_err(|e| DecodeError::Backend(format!("OpenH264 init: {:?}", e)))?;

            let framing = if extradata.is_empty() {
                Framing::Detect
            } else if let Some(config) = AvcConfig::parse(extradata) {
                decoder
                    .decode(&config.parameter_sets)
                    .map_err(|e| DecodeError::Backend(format!("SPS/PPS rejected: {:?}", e)))?;
                Framing::LengthPrefixed(config.nal_length_size)
            } else if h264::is_annexb(extradata) {
                decoder
                    .decode(extradata)
                    .map_err(|e| DecodeError::Backend(format!("SPS/PPS rejected: {:?}", e)))?;
                Framing::AnnexB
            } else {
                return Err(DecodeError::InvalidData("unrecognised H.264 codec private data".into()));
            };
            tracing::debug!("OpenH264 packet framing: {:?}", framing);

            Ok(Self {
                decoder,
                framing,
                arena: FrameArena::new(),
            })
        }
    }

    fn copy_plane(dst: &mut super::Plane, src: &[u8], stride: usize) {
        dst.data.extend_from_slice(src);
        dst.stride = stride;
    }

    impl VideoDecoder for OpenH264Decoder {
        fn name(&self) -> &str {
            "OpenH264"
        }

        fn decode(&mut self, data: &[u8], pts: Option<i64>) -> Result<DecodeResult, DecodeError> {
            if data.is_empty() {
                return Ok(DecodeResult::consumed(0));
            }

            let annexb = self.framing.to_annexb(data);
            let decoded = self
                .decoder
                .decode(&annexb)
                .map_err(|e| DecodeError::Backend(format!("{:?}", e)))?;

            let Some(yuv) = decoded else {
                return Ok(DecodeResult::consumed(data.len()));
            };

            let (width, height) = yuv.dimensions();
            let (y_stride, u_stride, v_stride) = yuv.strides();
            let (handle, frame): (FrameHandle, &mut RawFrame) = self.arena.acquire();
            frame.reset(PixelFormat::Yuv420p, width, height);
            frame.pts = pts;
            copy_plane(&mut frame.planes[0], yuv.y(), y_stride);
            copy_plane(&mut frame.planes[1], yuv.u(), u_stride);
            copy_plane(&mut frame.planes[2], yuv.v(), v_stride);

            Ok(DecodeResult::with_frame(data.len(), handle))
        }

        fn frame(&self, handle: &FrameHandle) -> Option<&RawFrame> {
            self.arena.get(handle)
        }

        fn release(&mut self, handle: FrameHandle) {
            self.arena.release(handle);
        }

        fn outstanding_frames(&self) -> usize {
            self.arena.outstanding()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
