// Y4M DEMUXER - YUV4MPEG2 stream reader and writer
//
// One text header line, then one "FRAME" line plus raw planar pixels per
// picture. No index and no compression, so every packet is exactly one
// picture for the rawvideo decoder.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;

use bytes::Bytes;

use crate::decode::RAWVIDEO;
use crate::demuxer::{CompressedPacket, Container, ContainerInfo, ContainerOpener, OpenError, StreamInfo, StreamKind};
use crate::pixel_convert::PixelFormat;
use crate::timebase::Rational;

const SIGNATURE: &[u8] = b"YUV4MPEG2 ";
const FRAME_TAG: &[u8] = b"FRAME";
const MAX_LINE: u64 = 4096;

// ============================================================================
// Header
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Y4mHeader {
    pub width: u32,
    pub height: u32,
    pub fps_num: i64,
    pub fps_den: i64,
    /// `None` for colour spaces we can't decode (mono, 4:2:2, high bit depth)
    pub format: Option<PixelFormat>,
    pub colorspace: String,
}

impl Y4mHeader {
    /// Parse the header line, with or without its trailing newline.
    pub fn parse(line: &[u8]) -> Result<Self, String> {
        let text = std::str::from_utf8(line).map_err(|_| "header is not ASCII".to_string())?;
        let params = text
            .trim_end()
            .strip_prefix("YUV4MPEG2")
            .ok_or_else(|| "missing YUV4MPEG2 signature".to_string())?;

        let mut width = None;
        let mut height = None;
        let (mut fps_num, mut fps_den) = (25, 1);
        let mut colorspace = String::from("420jpeg");

        for token in params.split_ascii_whitespace() {
            let Some(tag) = token.get(..1) else {
                continue;
            };
            let value = &token[1..];
            match tag {
                "W" => width = value.parse::<u32>().ok(),
                "H" => height = value.parse::<u32>().ok(),
                "F" => {
                    let (num, den) = value.split_once(':').ok_or_else(|| format!("bad frame rate {}", value))?;
                    fps_num = num.parse().map_err(|_| format!("bad frame rate {}", value))?;
                    fps_den = den.parse().map_err(|_| format!("bad frame rate {}", value))?;
                }
                "C" => colorspace = value.to_string(),
                // Interlacing, aspect ratio and extensions don't change the layout
                _ => {}
            }
        }

        let width = width.filter(|&w| w > 0).ok_or_else(|| "missing or zero width".to_string())?;
        let height = height.filter(|&h| h > 0).ok_or_else(|| "missing or zero height".to_string())?;
        if fps_num <= 0 || fps_den <= 0 {
            return Err(format!("bad frame rate {}:{}", fps_num, fps_den));
        }

        Ok(Self {
            width,
            height,
            fps_num,
            fps_den,
            format: format_for(&colorspace),
            colorspace,
        })
    }

    pub fn time_base(&self) -> Rational {
        Rational::from_frame_rate(self.fps_num, self.fps_den)
    }

    /// Bytes of pixel data per frame, 0 if the colour space is unknown or
    /// the size does not fit in memory
    pub fn frame_size(&self) -> usize {
        self.format
            .and_then(|f| f.buffer_size(self.width as usize, self.height as usize))
            .unwrap_or(0)
    }
}

fn format_for(colorspace: &str) -> Option<PixelFormat> {
    match colorspace {
        "420" | "420jpeg" | "420paldv" | "420mpeg2" => Some(PixelFormat::Yuv420p),
        "444" => Some(PixelFormat::Yuv444p),
        _ => None,
    }
}

fn colorspace_tag(format: PixelFormat) -> Option<&'static str> {
    match format {
        PixelFormat::Yuv420p => Some("420jpeg"),
        PixelFormat::Yuv444p => Some("444"),
        _ => None,
    }
}

// ============================================================================
// Opener / container
// ============================================================================

pub struct Y4mOpener;

impl ContainerOpener for Y4mOpener {
    fn name(&self) -> &'static str {
        "yuv4mpegpipe"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["y4m"]
    }

    fn matches_signature(&self, header: &[u8]) -> bool {
        header.starts_with(SIGNATURE)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Container>, OpenError> {
        let file = File::open(path).map_err(|e| OpenError::cannot_open(path, e))?;
        let file_len = file.metadata().map_err(|e| OpenError::cannot_open(path, e))?.len();
        let mut reader = BufReader::new(file);

        let header_line = read_line(&mut reader).map_err(|e| OpenError::cannot_open(path, e))?;
        if !header_line.starts_with(SIGNATURE) {
            return Err(OpenError::cannot_open(path, "not a YUV4MPEG2 stream"));
        }

        Ok(Box::new(Y4mContainer {
            reader,
            header_len: header_line.len() as u64,
            header_line,
            file_len,
            frame_size: 0,
            next_frame: 0,
        }))
    }
}

/// One `\n`-terminated line, capped at `MAX_LINE` bytes. Empty at EOF.
fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    reader.by_ref().take(MAX_LINE).read_until(b'\n', &mut line)?;
    Ok(line)
}

pub struct Y4mContainer {
    reader: BufReader<File>,
    header_line: Vec<u8>,
    header_len: u64,
    file_len: u64,
    frame_size: usize,
    next_frame: i64,
}

impl Container for Y4mContainer {
    fn format_name(&self) -> &str {
        "yuv4mpegpipe"
    }

    fn probe(&mut self) -> Result<ContainerInfo, OpenError> {
        let header = Y4mHeader::parse(&self.header_line).map_err(OpenError::NoStreamInfo)?;
        self.frame_size = header.frame_size();
        if self.frame_size == 0 && header.format.is_some() {
            return Err(OpenError::NoStreamInfo(format!(
                "{}x{} frames do not fit in memory",
                header.width, header.height
            )));
        }

        // Frames with parameters on their FRAME line make this an estimate
        let frame_bytes = (FRAME_TAG.len() + 1).saturating_add(self.frame_size) as u64;
        let frames = if self.frame_size == 0 {
            0
        } else {
            self.file_len.saturating_sub(self.header_len) / frame_bytes
        };
        let time_base = header.time_base();

        tracing::debug!(
            "Y4M {}x{} C{} at {}:{} fps, ~{} frames",
            header.width,
            header.height,
            header.colorspace,
            header.fps_num,
            header.fps_den,
            frames
        );

        Ok(ContainerInfo {
            duration_ms: time_base.ticks_to_ms(frames as i64),
            streams: vec![StreamInfo {
                index: 0,
                kind: StreamKind::Video,
                codec_id: RAWVIDEO.to_string(),
                width: header.width,
                height: header.height,
                pixel_format: header.format,
                time_base,
                extradata: Vec::new(),
            }],
        })
    }

    fn read_packet(&mut self) -> Option<CompressedPacket> {
        if self.frame_size == 0 {
            return None;
        }

        let line = match read_line(&mut self.reader) {
            Ok(line) if line.is_empty() => return None,
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Y4M read error: {}", e);
                return None;
            }
        };
        if !line.starts_with(FRAME_TAG) {
            tracing::warn!("Y4M frame {} has no FRAME marker", self.next_frame);
            return None;
        }

        let mut data = Vec::new();
        if data.try_reserve_exact(self.frame_size).is_err() {
            tracing::warn!("Y4M frame {}: cannot allocate {} bytes", self.next_frame, self.frame_size);
            return None;
        }
        data.resize(self.frame_size, 0);
        if let Err(e) = self.reader.read_exact(&mut data) {
            tracing::warn!("Y4M frame {} truncated: {}", self.next_frame, e);
            return None;
        }

        let pts = self.next_frame;
        self.next_frame += 1;
        Some(CompressedPacket {
            stream_index: 0,
            pts: Some(pts),
            keyframe: true,
            data: Bytes::from(data),
        })
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Writes planar YUV pictures as a YUV4MPEG2 stream
pub struct Y4mWriter<W: Write> {
    writer: W,
    frame_size: usize,
}

impl<W: Write> Y4mWriter<W> {
    pub fn new(mut writer: W, width: u32, height: u32, fps: (i64, i64), format: PixelFormat) -> io::Result<Self> {
        let tag = colorspace_tag(format)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("{:?} has no Y4M tag", format)))?;
        writeln!(writer, "YUV4MPEG2 W{} H{} F{}:{} Ip A1:1 C{}", width, height, fps.0, fps.1, tag)?;
        let frame_size = format
            .buffer_size(width as usize, height as usize)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "frame size overflows"))?;
        Ok(Self { writer, frame_size })
    }

    pub fn write_frame(&mut self, pixels: &[u8]) -> io::Result<()> {
        if pixels.len() != self.frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame is {} bytes, expected {}", pixels.len(), self.frame_size),
            ));
        }
        self.writer.write_all(b"FRAME\n")?;
        self.writer.write_all(pixels)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
