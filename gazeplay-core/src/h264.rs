//! H.264 bitstream framing
//!
//! Matroska stores H.264 as AVCC: every NAL unit carries a big-endian length
//! prefix and SPS/PPS live out of band in the track's codec private data
//! (an `avcC` record). openh264 only understands Annex B start codes, so
//! packets and parameter sets are rewritten before they reach the decoder.

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Decoder configuration pulled out of an `avcC` record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    /// Size of the NAL length prefix in packets (1, 2 or 4)
    pub nal_length_size: usize,
    /// SPS followed by PPS, each behind a start code
    pub parameter_sets: Vec<u8>,
}

impl AvcConfig {
    /// Parse an AVCDecoderConfigurationRecord.
    ///
    /// Layout: version(1) profile(1) compat(1) level(1)
    /// 0xFC|length_size_minus_one(1) 0xE0|num_sps(1) {len(2) sps}
    /// num_pps(1) {len(2) pps}
    pub fn parse(record: &[u8]) -> Option<Self> {
        if record.len() < 7 || record[0] != 1 {
            return None;
        }

        let nal_length_size = ((record[4] & 0x03) + 1) as usize;
        let mut parameter_sets = Vec::with_capacity(record.len() + 16);
        let mut cursor = 5;

        let num_sps = (record[cursor] & 0x1F) as usize;
        cursor += 1;
        cursor = copy_parameter_sets(record, cursor, num_sps, &mut parameter_sets)?;

        // Some muxers stop after the SPS list
        if let Some(&num_pps) = record.get(cursor) {
            copy_parameter_sets(record, cursor + 1, num_pps as usize, &mut parameter_sets)?;
        }

        Some(Self {
            nal_length_size,
            parameter_sets,
        })
    }
}

fn copy_parameter_sets(record: &[u8], mut cursor: usize, count: usize, out: &mut Vec<u8>) -> Option<usize> {
    for _ in 0..count {
        let len_bytes = record.get(cursor..cursor + 2)?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        cursor += 2;
        let nal = record.get(cursor..cursor + len)?;
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(nal);
        cursor += len;
    }
    Some(cursor)
}

/// True if `data` already starts with a 3- or 4-byte start code.
pub fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&START_CODE) || data.starts_with(&START_CODE[1..])
}

/// How NAL units are delimited inside a track's packets.
///
/// Fixed once per stream: a length prefix can look exactly like a start code
/// (`00 00 01 2C` announces a 300-byte NAL), so packets are never sniffed
/// when the codec private data already says which framing is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Start codes in band
    AnnexB,
    /// Big-endian length prefix of 1 to 4 bytes, from an `avcC` record
    LengthPrefixed(usize),
    /// No codec private data; each packet is inspected on its own
    Detect,
}

impl Framing {
    /// Rewrite `packet` as Annex B according to this framing
    pub fn to_annexb(self, packet: &[u8]) -> Vec<u8> {
        match self {
            Framing::AnnexB => packet.to_vec(),
            Framing::LengthPrefixed(size) => length_prefixed_to_annexb(packet, size),
            Framing::Detect if is_annexb(packet) => packet.to_vec(),
            Framing::Detect => length_prefixed_to_annexb(packet, 4),
        }
    }
}

/// Rewrite a length-prefixed packet as Annex B; a truncated trailing NAL is
/// dropped.
pub fn length_prefixed_to_annexb(packet: &[u8], nal_length_size: usize) -> Vec<u8> {
    if !(1..=4).contains(&nal_length_size) {
        return packet.to_vec();
    }

    let mut out = Vec::with_capacity(packet.len() + 16);
    let mut cursor = 0;
    while cursor + nal_length_size <= packet.len() {
        let len = packet[cursor..cursor + nal_length_size]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        cursor += nal_length_size;

        let Some(nal) = packet.get(cursor..cursor + len) else {
            tracing::warn!("Truncated NAL unit: {} bytes announced, {} left", len, packet.len() - cursor);
            break;
        };
        if !nal.is_empty() {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nal);
        }
        cursor += len;
    }
    out
}
