//! Container demuxer facade.
//!
//! Opening a file goes through five steps, each with its own failure:
//! open the container, probe its streams, pick the video stream, open a
//! decoder for it, size the conversion buffers. The duration is reported to
//! the caller as soon as the probe knows it, before the decoder is opened.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;

use crate::decode::{DecoderRegistry, VideoDecoder};
use crate::mkv::MkvOpener;
use crate::pixel_convert::{ColorSpace, ConverterCache, PixelFormat};
use crate::timebase::Rational;
use crate::y4m::Y4mOpener;

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("Cannot open {path:?}: {reason}")]
    CannotOpenContainer { path: PathBuf, reason: String },
    #[error("Cannot read stream info: {0}")]
    NoStreamInfo(String),
    #[error("No video stream found")]
    NoVideoStream,
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("Decoder init failed: {0}")]
    DecoderInitFailed(String),
    #[error("Cannot allocate frame buffers: {0}")]
    BufferAllocation(String),
}

impl OpenError {
    pub(crate) fn cannot_open(path: &Path, reason: impl ToString) -> Self {
        OpenError::CannotOpenContainer {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

// ============================================================================
// Stream metadata and packets
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Other,
}

/// One elementary stream as the container describes it
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Stream id as it appears on packets
    pub index: u32,
    pub kind: StreamKind,
    /// Normalised codec id (`"h264"`, `"rawvideo"`), or the container's own
    /// id when it is not one we know
    pub codec_id: String,
    pub width: u32,
    pub height: u32,
    /// Known up front only for uncompressed streams
    pub pixel_format: Option<PixelFormat>,
    pub time_base: Rational,
    /// Codec private data (avcC for H.264)
    pub extradata: Vec<u8>,
}

/// Result of probing a container
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// Total duration in milliseconds, 0 when the container does not say
    pub duration_ms: i64,
    pub streams: Vec<StreamInfo>,
}

/// One unit of compressed data for one stream
#[derive(Debug, Clone)]
pub struct CompressedPacket {
    pub stream_index: u32,
    /// Presentation timestamp in the stream's time-base
    pub pts: Option<i64>,
    pub keyframe: bool,
    pub data: Bytes,
}

impl CompressedPacket {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// An opened container
pub trait Container: Send {
    fn format_name(&self) -> &str;

    /// Parse stream headers. Fails with `NoStreamInfo`.
    fn probe(&mut self) -> Result<ContainerInfo, OpenError>;

    /// Next packet of any stream; `None` at the end or on a read error.
    fn read_packet(&mut self) -> Option<CompressedPacket>;
}

/// Knows how to recognise and open one container format
pub trait ContainerOpener: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower-case file extensions, without the dot
    fn extensions(&self) -> &'static [&'static str];

    /// Whether the first bytes of a file belong to this format
    fn matches_signature(&self, header: &[u8]) -> bool;

    fn open(&self, path: &Path) -> Result<Box<dyn Container>, OpenError>;
}

// ============================================================================
// Container registry
// ============================================================================

const SIGNATURE_LEN: usize = 16;

pub struct ContainerRegistry {
    openers: Vec<Box<dyn ContainerOpener>>,
}

impl ContainerRegistry {
    pub fn empty() -> Self {
        Self { openers: Vec::new() }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Y4mOpener);
        registry.register(MkvOpener);
        registry
    }

    pub fn register(&mut self, opener: impl ContainerOpener + 'static) {
        self.openers.push(Box::new(opener));
    }

    /// Open `path` with the first format whose signature matches, falling
    /// back to the file extension.
    pub fn open(&self, path: &Path) -> Result<Box<dyn Container>, OpenError> {
        let mut header = Vec::with_capacity(SIGNATURE_LEN);
        File::open(path)
            .and_then(|f| f.take(SIGNATURE_LEN as u64).read_to_end(&mut header))
            .map_err(|e| OpenError::cannot_open(path, e))?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let opener = self
            .openers
            .iter()
            .find(|o| o.matches_signature(&header))
            .or_else(|| self.openers.iter().find(|o| o.extensions().contains(&ext.as_str())))
            .ok_or_else(|| OpenError::cannot_open(path, "unrecognised container format"))?;

        tracing::debug!("Opening {:?} as {}", path, opener.name());
        opener.open(path)
    }
}

impl Default for ContainerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// Media source
// ============================================================================

/// Settings for the conversion buffers allocated at open time
#[derive(Debug, Clone, Copy)]
pub struct SourceOptions {
    pub color_space: ColorSpace,
    pub row_alignment: usize,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            color_space: ColorSpace::default(),
            row_alignment: 32,
        }
    }
}

/// An opened container with its selected video stream, decoder and
/// conversion buffers. Width and height are fixed for its lifetime.
pub struct MediaSource {
    path: Option<PathBuf>,
    format_name: String,
    container: Box<dyn Container>,
    decoder: Box<dyn VideoDecoder>,
    converter: ConverterCache,
    info: ContainerInfo,
    video: usize,
    packets_read: u64,
    packets_skipped: u64,
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSource")
            .field("path", &self.path)
            .field("format", &self.format_name)
            .field("decoder", &self.decoder.name())
            .field("video", &self.info.streams[self.video])
            .field("duration_ms", &self.info.duration_ms)
            .finish()
    }
}

impl MediaSource {
    /// Open `path`. `on_duration` is called once with the duration in
    /// milliseconds, as soon as the container has been probed.
    pub fn open(
        path: &Path,
        containers: &ContainerRegistry,
        decoders: &DecoderRegistry,
        options: SourceOptions,
        on_duration: impl FnOnce(i64),
    ) -> Result<Self, OpenError> {
        let container = containers.open(path)?;
        let mut source = Self::from_container(container, decoders, options, on_duration)?;
        source.path = Some(path.to_path_buf());
        Ok(source)
    }

    /// Same as [`MediaSource::open`] for a container that is already open.
    pub fn from_container(
        mut container: Box<dyn Container>,
        decoders: &DecoderRegistry,
        options: SourceOptions,
        on_duration: impl FnOnce(i64),
    ) -> Result<Self, OpenError> {
        let info = container.probe()?;
        on_duration(info.duration_ms);

        let video = select_video_stream(&info.streams, decoders).ok_or(OpenError::NoVideoStream)?;
        let stream = &info.streams[video];
        if stream.width == 0 || stream.height == 0 {
            return Err(OpenError::NoStreamInfo(format!(
                "video stream {} has no picture size",
                stream.index
            )));
        }

        let decoder = decoders.create(stream)?;
        let converter = ConverterCache::with_output_size(
            options.color_space,
            options.row_alignment,
            stream.width as usize,
            stream.height as usize,
        )
        .map_err(|e| OpenError::BufferAllocation(e.to_string()))?;

        tracing::info!(
            "Opened {} video stream {}: {} {}x{}, time-base {}, duration {} ms, decoder {}",
            container.format_name(),
            stream.index,
            stream.codec_id,
            stream.width,
            stream.height,
            stream.time_base,
            info.duration_ms,
            decoder.name()
        );

        Ok(Self {
            path: None,
            format_name: container.format_name().to_string(),
            container,
            decoder,
            converter,
            info,
            video,
            packets_read: 0,
            packets_skipped: 0,
        })
    }

    /// Next packet of the video stream. Packets of other streams are dropped.
    pub fn next_packet(&mut self) -> Option<CompressedPacket> {
        let wanted = self.info.streams[self.video].index;
        loop {
            let packet = self.container.read_packet()?;
            if packet.stream_index == wanted {
                self.packets_read += 1;
                return Some(packet);
            }
            self.packets_skipped += 1;
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn format_name(&self) -> &str {
        &self.format_name
    }

    pub fn duration_ms(&self) -> i64 {
        self.info.duration_ms
    }

    pub fn video_stream(&self) -> &StreamInfo {
        &self.info.streams[self.video]
    }

    pub fn width(&self) -> u32 {
        self.video_stream().width
    }

    pub fn height(&self) -> u32 {
        self.video_stream().height
    }

    pub fn time_base(&self) -> Rational {
        self.video_stream().time_base
    }

    /// Video packets handed out so far
    pub fn packets_read(&self) -> u64 {
        self.packets_read
    }

    /// Packets of other streams that were dropped
    pub fn packets_skipped(&self) -> u64 {
        self.packets_skipped
    }

    pub fn decoder_name(&self) -> &str {
        self.decoder.name()
    }

    pub(crate) fn decoder_mut(&mut self) -> &mut dyn VideoDecoder {
        self.decoder.as_mut()
    }

    /// Decoder and converter together, for the convert step which reads
    /// from one and writes into the other.
    pub(crate) fn pipeline_mut(&mut self) -> (&mut dyn VideoDecoder, &mut ConverterCache) {
        (self.decoder.as_mut(), &mut self.converter)
    }
}

/// First video stream with a registered decoder, else the first video stream
/// at all (so opening reports the missing codec rather than no video).
fn select_video_stream(streams: &[StreamInfo], decoders: &DecoderRegistry) -> Option<usize> {
    let mut video = streams
        .iter()
        .enumerate()
        .filter(|(_, s)| s.kind == StreamKind::Video);

    let first = video.clone().next().map(|(i, _)| i);
    video
        .find(|(_, s)| decoders.supports(&s.codec_id))
        .map(|(i, _)| i)
        .or(first)
}
