// MKV (Matroska/WebM) container using the matroska-demuxer crate
// Maps tracks to stream info and frames to compressed packets

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use bytes::Bytes;
use matroska_demuxer::{Frame, MatroskaFile, TrackEntry, TrackType};

use crate::decode::H264;
use crate::demuxer::{CompressedPacket, Container, ContainerInfo, ContainerOpener, OpenError, StreamInfo, StreamKind};
use crate::timebase::Rational;

const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];
/// Real EBML headers are a few dozen bytes
const MAX_EBML_HEADER: u64 = 4096;

// ============================================================================
// Opener
// ============================================================================

pub struct MkvOpener;

impl ContainerOpener for MkvOpener {
    fn name(&self) -> &'static str {
        "matroska"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["mkv", "webm"]
    }

    fn matches_signature(&self, header: &[u8]) -> bool {
        header.starts_with(&EBML_MAGIC)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Container>, OpenError> {
        let mut file = File::open(path).map_err(|e| OpenError::cannot_open(path, e))?;
        let file_len = file.metadata().map_err(|e| OpenError::cannot_open(path, e))?.len();

        let mut prefix = Vec::with_capacity(12);
        file.by_ref()
            .take(12)
            .read_to_end(&mut prefix)
            .map_err(|e| OpenError::cannot_open(path, e))?;
        check_ebml_header(&prefix, file_len).map_err(|reason| OpenError::cannot_open(path, reason))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| OpenError::cannot_open(path, e))?;

        // matroska-demuxer overflows on some malformed element sizes
        let opened = catch_unwind(AssertUnwindSafe(|| MatroskaFile::open(BufReader::new(file))));
        let mkv = match opened {
            Ok(Ok(mkv)) => mkv,
            Ok(Err(e)) => return Err(OpenError::cannot_open(path, format!("{:?}", e))),
            Err(_) => return Err(OpenError::cannot_open(path, "malformed Matroska element")),
        };
        Ok(Box::new(MkvContainer {
            mkv,
            frame: Frame::default(),
        }))
    }
}

/// Validate the size of the EBML header element that follows the magic.
fn check_ebml_header(prefix: &[u8], file_len: u64) -> Result<(), String> {
    if !prefix.starts_with(&EBML_MAGIC) {
        return Err("missing EBML magic".into());
    }
    let (size, size_len) = read_vint(&prefix[EBML_MAGIC.len()..]).ok_or("bad EBML header size")?;
    if size == 0 || size > MAX_EBML_HEADER {
        return Err(format!("EBML header of {} bytes", size));
    }
    let end = (EBML_MAGIC.len() + size_len) as u64 + size;
    if end > file_len {
        return Err(format!("EBML header ends at {}, file has {} bytes", end, file_len));
    }
    Ok(())
}

/// EBML variable-length size: the leading zero count gives the length.
/// Returns the value and its length; the all-ones "unknown" size is refused.
fn read_vint(bytes: &[u8]) -> Option<(u64, usize)> {
    let first = *bytes.first()?;
    if first == 0 {
        return None;
    }
    let len = first.leading_zeros() as usize + 1;
    let raw = bytes.get(..len)?;
    let marker = (0xFFu16 >> len) as u8;
    let value = raw[1..]
        .iter()
        .fold((first & marker) as u64, |acc, &b| (acc << 8) | b as u64);
    let unknown = (1u64 << (7 * len)) - 1;
    (value != unknown).then_some((value, len))
}

/// Normalise a Matroska codec id to a decoder registry id
fn codec_for(matroska_id: &str) -> String {
    match matroska_id {
        "V_MPEG4/ISO/AVC" => H264.to_string(),
        other => other.to_string(),
    }
}

fn stream_for(track: &TrackEntry) -> StreamInfo {
    let kind = match track.track_type() {
        TrackType::Video => StreamKind::Video,
        TrackType::Audio => StreamKind::Audio,
        TrackType::Subtitle => StreamKind::Subtitle,
        _ => StreamKind::Other,
    };
    let (width, height) = track
        .video()
        .map(|v| (v.pixel_width().get() as u32, v.pixel_height().get() as u32))
        .unwrap_or((0, 0));

    StreamInfo {
        index: track.track_number().get() as u32,
        kind,
        codec_id: codec_for(track.codec_id()),
        width,
        height,
        pixel_format: None,
        // Block timestamps come out of matroska-demuxer in nanoseconds
        time_base: Rational::NANOSECONDS,
        extradata: track.codec_private().map(|d| d.to_vec()).unwrap_or_default(),
    }
}

// ============================================================================
// Container
// ============================================================================

pub struct MkvContainer {
    mkv: MatroskaFile<BufReader<File>>,
    frame: Frame,
}

impl Container for MkvContainer {
    fn format_name(&self) -> &str {
        "matroska"
    }

    fn probe(&mut self) -> Result<ContainerInfo, OpenError> {
        let streams: Vec<StreamInfo> = self.mkv.tracks().iter().map(stream_for).collect();
        if streams.is_empty() {
            return Err(OpenError::NoStreamInfo("segment has no tracks".into()));
        }

        let duration_ns = self.mkv.info().duration().unwrap_or(0.0);
        let duration_ms = Rational::NANOSECONDS.ticks_to_ms(duration_ns as i64);

        Ok(ContainerInfo { duration_ms, streams })
    }

    fn read_packet(&mut self) -> Option<CompressedPacket> {
        let next = catch_unwind(AssertUnwindSafe(|| self.mkv.next_frame(&mut self.frame)));
        let Ok(next) = next else {
            tracing::warn!("MKV cluster is malformed, ending stream");
            return None;
        };
        match next {
            Ok(true) => Some(CompressedPacket {
                stream_index: self.frame.track as u32,
                pts: Some(self.frame.timestamp as i64),
                keyframe: self.frame.is_keyframe.unwrap_or(false),
                data: Bytes::from(std::mem::take(&mut self.frame.data)),
            }),
            Ok(false) => None,
            Err(e) => {
                tracing::warn!("MKV read error: {:?}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature() {
        let opener = MkvOpener;
        assert!(opener.matches_signature(&[0x1A, 0x45, 0xDF, 0xA3, 0x9F, 0x42]));
        assert!(!opener.matches_signature(b"YUV4MPEG2 W4 H2"));
        assert!(opener.extensions().contains(&"webm"));
    }

    #[test]
    fn test_codec_mapping() {
        assert_eq!(codec_for("V_MPEG4/ISO/AVC"), H264);
        assert_eq!(codec_for("V_VP9"), "V_VP9");
    }

    #[test]
    fn test_garbage_after_magic_cannot_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.mkv");
        let mut data = EBML_MAGIC.to_vec();
        data.extend_from_slice(&[0xFF; 12]);
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            MkvOpener.open(&path),
            Err(OpenError::CannotOpenContainer { .. })
        ));
    }

    #[test]
    fn test_ebml_header_size_checks() {
        assert_eq!(read_vint(&[0x9F]), Some((0x1F, 1)));
        assert_eq!(read_vint(&[0x40, 0x23]), Some((0x23, 2)));
        assert_eq!(read_vint(&[0x01, 0, 0, 0, 0, 0, 0, 0x2A]), Some((0x2A, 8)));
        assert_eq!(read_vint(&[0xFF]), None);
        assert_eq!(read_vint(&[0x00, 0x01]), None);
        assert_eq!(read_vint(&[0x40]), None);

        let mut prefix = EBML_MAGIC.to_vec();
        prefix.push(0x9F);
        assert!(check_ebml_header(&prefix, 40).is_ok());
        // Header claims more bytes than the file holds
        assert!(check_ebml_header(&prefix, 20).is_err());
        // Eight-byte size far past any real header
        let mut huge = EBML_MAGIC.to_vec();
        huge.extend_from_slice(&[0x01, 0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xF0]);
        assert!(check_ebml_header(&huge, u64::MAX).is_err());
    }

    #[test]
    fn test_garbage_inside_header_cannot_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.mkv");
        let mut data = EBML_MAGIC.to_vec();
        data.push(0x84);
        data.extend_from_slice(&[0xFF; 4]);
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            MkvOpener.open(&path),
            Err(OpenError::CannotOpenContainer { .. })
        ));
    }
}
