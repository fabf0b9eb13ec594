//! Stream format probing and the lightweight metadata scan.
//!
//! The probe answers two questions for the graph: what encoding a URI
//! carries, and what PCM format comes out the other end. It also scoops up
//! whatever artist/title metadata sits in the container header. Unknown
//! tags are skipped, never fatal.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use crate::il::{Encoding, IlError, PcmFormat};

/// The number of leading bytes the probe reads from a URI.
pub const PROBE_DEPTH: usize = 128 * 1024;

/// What the probe learned about a stream.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// The detected container/codec encoding.
    pub encoding: Encoding,
    /// The PCM format the decoded stream will carry.
    pub pcm: PcmFormat,
    /// Metadata scanned from the container (artist, title, ...).
    pub metadata: BTreeMap<String, String>,
    /// Estimated duration, when the header allows an estimate.
    pub duration: Option<Duration>,
}

/// A parsed WAV header.
#[derive(Debug, Clone)]
pub(crate) struct WavInfo {
    pub(crate) pcm: PcmFormat,
    /// Offset of the first sample byte.
    pub(crate) data_offset: usize,
    /// Length of the sample payload, if the header declared one.
    pub(crate) data_len: Option<u64>,
    pub(crate) metadata: BTreeMap<String, String>,
}

/// A parsed MP3 stream head.
#[derive(Debug, Clone)]
pub(crate) struct Mp3Info {
    pub(crate) pcm: PcmFormat,
    pub(crate) bitrate_kbps: u32,
    /// Offset of the first frame sync byte.
    pub(crate) data_offset: usize,
    pub(crate) metadata: BTreeMap<String, String>,
}

/// Sniffs the encoding from the first bytes of a stream.
pub fn sniff_encoding(bytes: &[u8]) -> Result<Encoding, IlError> {
    if bytes.len() < 4 {
        return Err(IlError::NotReady);
    }

    if &bytes[..4] == b"RIFF" {
        return Ok(Encoding::Pcm);
    }

    if &bytes[..3] == b"ID3" || (bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0) {
        return Ok(Encoding::Mp3);
    }

    if &bytes[..4] == b"OggS" {
        // The codec id sits in the first page payload.
        if find(bytes, b"OpusHead").is_some() {
            return Ok(Encoding::Opus);
        }
        if find(bytes, b"\x01vorbis").is_some() {
            return Ok(Encoding::Vorbis);
        }
        return Err(IlError::NotReady);
    }

    Err(IlError::StreamCorrupt("unrecognized stream".into()))
}

/// Probes a local URI: sniffs the encoding, parses the header, scans
/// metadata and estimates the duration.
pub fn probe_uri(uri: &str) -> Result<ProbeResult, IlError> {
    let path = uri.strip_prefix("file://").unwrap_or(uri);
    let mut file = std::fs::File::open(path)
        .map_err(|e| IlError::StreamCorrupt(format!("opening {path}: {e}")))?;
    let file_len = file
        .metadata()
        .map_err(|e| IlError::StreamCorrupt(format!("stat {path}: {e}")))?
        .len();

    let mut head = vec![0u8; PROBE_DEPTH.min(file_len as usize)];
    file.read_exact(&mut head)
        .map_err(|e| IlError::StreamCorrupt(format!("reading {path}: {e}")))?;

    probe_bytes(&head, Some(file_len))
}

/// Probes an in-memory stream head. `total_len` (when known) feeds the
/// duration estimate.
pub fn probe_bytes(head: &[u8], total_len: Option<u64>) -> Result<ProbeResult, IlError> {
    match sniff_encoding(head)? {
        Encoding::Pcm => {
            let info = parse_wav(head)?
                .ok_or_else(|| IlError::StreamCorrupt("truncated WAV header".into()))?;
            let payload = info
                .data_len
                .or_else(|| total_len.map(|l| l.saturating_sub(info.data_offset as u64)));
            let duration = payload.map(|bytes| {
                Duration::from_secs_f64(bytes as f64 / info.pcm.byte_rate() as f64)
            });

            Ok(ProbeResult {
                encoding: Encoding::Pcm,
                pcm: info.pcm,
                metadata: info.metadata,
                duration,
            })
        }
        Encoding::Mp3 => {
            let info = parse_mp3(head)?
                .ok_or_else(|| IlError::StreamCorrupt("no MP3 frame sync found".into()))?;
            let duration = total_len.map(|l| {
                let payload_bits = l.saturating_sub(info.data_offset as u64) * 8;
                Duration::from_secs_f64(payload_bits as f64 / (info.bitrate_kbps as f64 * 1000.0))
            });

            Ok(ProbeResult {
                encoding: Encoding::Mp3,
                pcm: info.pcm,
                metadata: info.metadata,
                duration,
            })
        }
        other => Ok(ProbeResult {
            encoding: other,
            pcm: PcmFormat::default(),
            metadata: BTreeMap::new(),
            duration: None,
        }),
    }
}

/// Parses a RIFF/WAVE header. Returns `None` when more bytes are needed
/// to finish the chunk walk.
pub(crate) fn parse_wav(bytes: &[u8]) -> Result<Option<WavInfo>, IlError> {
    if bytes.len() < 12 {
        return Ok(None);
    }

    if &bytes[..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(IlError::StreamCorrupt("not a RIFF/WAVE stream".into()));
    }

    let mut pcm = None;
    let mut metadata = BTreeMap::new();
    let mut pos = 12usize;

    loop {
        if bytes.len() < pos + 8 {
            return Ok(None);
        }

        let id = &bytes[pos..pos + 4];
        let size = LittleEndian::read_u32(&bytes[pos + 4..pos + 8]) as usize;
        let body = pos + 8;

        match id {
            b"fmt " => {
                if bytes.len() < body + 16 {
                    return Ok(None);
                }

                let mut c = Cursor::new(&bytes[body..body + 16]);
                let audio_format = c.read_u16::<LittleEndian>().map_err(io_corrupt)?;
                let channels = c.read_u16::<LittleEndian>().map_err(io_corrupt)?;
                let sample_rate = c.read_u32::<LittleEndian>().map_err(io_corrupt)?;
                let _byte_rate = c.read_u32::<LittleEndian>().map_err(io_corrupt)?;
                let _block_align = c.read_u16::<LittleEndian>().map_err(io_corrupt)?;
                let bits = c.read_u16::<LittleEndian>().map_err(io_corrupt)?;

                if audio_format != 1 {
                    return Err(IlError::StreamCorrupt(format!(
                        "WAV format {audio_format} is not integer PCM"
                    )));
                }

                pcm = Some(PcmFormat::new(sample_rate, channels as u8, bits as u8)?);
            }
            b"LIST" => {
                if bytes.len() >= body + size && size >= 4 && &bytes[body..body + 4] == b"INFO" {
                    scan_riff_info(&bytes[body + 4..body + size], &mut metadata);
                }
                // A truncated LIST is not worth waiting for.
            }
            b"data" => {
                let Some(pcm) = pcm else {
                    return Err(IlError::StreamCorrupt("WAV data before fmt".into()));
                };

                return Ok(Some(WavInfo {
                    pcm,
                    data_offset: body,
                    data_len: if size == 0 || size == 0xFFFF_FFFF {
                        None
                    } else {
                        Some(size as u64)
                    },
                    metadata,
                }));
            }
            _ => {}
        }

        // Chunks are word-aligned.
        pos = body + size + (size & 1);
    }
}

fn scan_riff_info(mut body: &[u8], metadata: &mut BTreeMap<String, String>) {
    while body.len() >= 8 {
        let id = &body[..4];
        let size = LittleEndian::read_u32(&body[4..8]) as usize;
        if body.len() < 8 + size {
            break;
        }

        let value = &body[8..8 + size];
        let value = value.split(|&b| b == 0).next().unwrap_or(&[]);
        if let Ok(text) = std::str::from_utf8(value) {
            let key = match id {
                b"IART" => Some("artist"),
                b"INAM" => Some("title"),
                b"IPRD" => Some("album"),
                b"ICRD" => Some("year"),
                b"ICMT" => Some("comment"),
                _ => None,
            };
            if let Some(key) = key {
                metadata.insert(key.to_string(), text.trim().to_string());
            }
        }

        body = &body[8 + size + (size & 1)..];
    }
}

const MP3_BITRATES_V1_L3: [u32; 16] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
];
const MP3_BITRATES_V2_L3: [u32; 16] =
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0];
const MP3_RATES_V1: [u32; 4] = [44100, 48000, 32000, 0];
const MP3_RATES_V2: [u32; 4] = [22050, 24000, 16000, 0];
const MP3_RATES_V25: [u32; 4] = [11025, 12000, 8000, 0];

/// Parses the head of an MP3 stream: an optional ID3v2 tag followed by the
/// first frame header. Returns `None` when more bytes are needed.
pub(crate) fn parse_mp3(bytes: &[u8]) -> Result<Option<Mp3Info>, IlError> {
    let mut metadata = BTreeMap::new();
    let mut pos = 0usize;

    if bytes.len() >= 10 && &bytes[..3] == b"ID3" {
        let size = syncsafe(&bytes[6..10]) as usize;
        let tag_end = 10 + size;
        if bytes.len() < tag_end {
            // Tag bigger than the probe window; give up on metadata but
            // keep looking for the sync past what we have.
            return Ok(None);
        }

        scan_id3v2(&bytes[..tag_end], &mut metadata);
        pos = tag_end;
    }

    // Hunt for the frame sync.
    while pos + 4 <= bytes.len() {
        if bytes[pos] == 0xFF && bytes[pos + 1] & 0xE0 == 0xE0 {
            let hdr = u32::from_be_bytes([
                bytes[pos],
                bytes[pos + 1],
                bytes[pos + 2],
                bytes[pos + 3],
            ]);

            if let Some((pcm, bitrate_kbps)) = decode_mp3_frame_header(hdr) {
                return Ok(Some(Mp3Info {
                    pcm,
                    bitrate_kbps,
                    data_offset: pos,
                    metadata,
                }));
            }
        }
        pos += 1;
    }

    Ok(None)
}

fn decode_mp3_frame_header(hdr: u32) -> Option<(PcmFormat, u32)> {
    let version = (hdr >> 19) & 0x3; // 0=2.5, 2=2, 3=1
    let layer = (hdr >> 17) & 0x3; // 1=III
    let bitrate_idx = ((hdr >> 12) & 0xF) as usize;
    let rate_idx = ((hdr >> 10) & 0x3) as usize;
    let mode = (hdr >> 6) & 0x3;

    if version == 1 || layer != 1 {
        return None;
    }

    let sample_rate = match version {
        3 => MP3_RATES_V1[rate_idx],
        2 => MP3_RATES_V2[rate_idx],
        _ => MP3_RATES_V25[rate_idx],
    };
    let bitrate = if version == 3 {
        MP3_BITRATES_V1_L3[bitrate_idx]
    } else {
        MP3_BITRATES_V2_L3[bitrate_idx]
    };

    if sample_rate == 0 || bitrate == 0 {
        return None;
    }

    let channels = if mode == 3 { 1 } else { 2 };
    let pcm = PcmFormat::new(sample_rate, channels, 16).ok()?;
    Some((pcm, bitrate))
}

fn scan_id3v2(tag: &[u8], metadata: &mut BTreeMap<String, String>) {
    let version = tag[3];
    let mut pos = 10usize;

    while pos + 10 <= tag.len() {
        let id = &tag[pos..pos + 4];
        if id.iter().all(|&b| b == 0) {
            break; // padding
        }

        let size = if version >= 4 {
            syncsafe(&tag[pos + 4..pos + 8]) as usize
        } else {
            u32::from_be_bytes([tag[pos + 4], tag[pos + 5], tag[pos + 6], tag[pos + 7]]) as usize
        };

        let body_start = pos + 10;
        if size == 0 || tag.len() < body_start + size {
            break;
        }

        let key = match id {
            b"TIT2" => Some("title"),
            b"TPE1" => Some("artist"),
            b"TALB" => Some("album"),
            b"TYER" | b"TDRC" => Some("year"),
            _ => None,
        };

        if let Some(key) = key {
            if let Some(text) = decode_id3_text(&tag[body_start..body_start + size]) {
                metadata.insert(key.to_string(), text);
            }
        }

        pos = body_start + size;
    }
}

fn decode_id3_text(body: &[u8]) -> Option<String> {
    let (enc, text) = body.split_first()?;
    let text = match enc {
        // Latin-1 and UTF-8 read fine as UTF-8 for the ASCII range we
        // care about; UTF-16 needs the BOM dance.
        0 | 3 => String::from_utf8_lossy(text).into_owned(),
        1 | 2 => {
            let be = *enc == 2 || text.starts_with(&[0xFE, 0xFF]);
            let chunk = text
                .strip_prefix(&[0xFF, 0xFE][..])
                .or_else(|| text.strip_prefix(&[0xFE, 0xFF][..]))
                .unwrap_or(text);
            let units: Vec<u16> = chunk
                .chunks_exact(2)
                .map(|c| {
                    if be {
                        u16::from_be_bytes([c[0], c[1]])
                    } else {
                        u16::from_le_bytes([c[0], c[1]])
                    }
                })
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => return None,
    };

    let trimmed = text.trim_matches('\0').trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn syncsafe(b: &[u8]) -> u32 {
    ((b[0] as u32 & 0x7F) << 21)
        | ((b[1] as u32 & 0x7F) << 14)
        | ((b[2] as u32 & 0x7F) << 7)
        | (b[3] as u32 & 0x7F)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn io_corrupt(e: std::io::Error) -> IlError {
    IlError::StreamCorrupt(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::wav_bytes;

    #[test]
    fn probes_a_wav_stream() {
        let bytes = wav_bytes(44100, 2, 1.0);
        let total = bytes.len() as u64;
        let result = probe_bytes(&bytes, Some(total)).unwrap();

        assert_eq!(result.encoding, Encoding::Pcm);
        assert_eq!(result.pcm, PcmFormat::new(44100, 2, 16).unwrap());

        let duration = result.duration.expect("wav declares a data length");
        assert!((duration.as_secs_f64() - 1.0).abs() < 0.01);
    }

    #[test]
    fn wav_header_walk_reports_need_more() {
        let bytes = wav_bytes(48000, 1, 0.1);
        assert!(parse_wav(&bytes[..8]).unwrap().is_none());
        assert!(parse_wav(&bytes[..20]).unwrap().is_none());
        assert!(parse_wav(&bytes).unwrap().is_some());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            sniff_encoding(b"garbage bytes here"),
            Err(IlError::StreamCorrupt(_))
        ));
        assert!(matches!(sniff_encoding(b"RI"), Err(IlError::NotReady)));
    }

    #[test]
    fn parses_an_mp3_header_behind_an_id3_tag() {
        // A minimal ID3v2.3 tag holding TIT2 "Hi", then one V1 Layer III
        // 128kbps 44.1kHz stereo frame header.
        let mut bytes = Vec::new();
        let frame_body = b"\x00Hi";
        let tag_body_len = 10 + frame_body.len(); // one frame header + body
        bytes.extend_from_slice(b"ID3\x03\x00\x00");
        bytes.extend_from_slice(&[
            ((tag_body_len >> 21) & 0x7F) as u8,
            ((tag_body_len >> 14) & 0x7F) as u8,
            ((tag_body_len >> 7) & 0x7F) as u8,
            (tag_body_len & 0x7F) as u8,
        ]);
        bytes.extend_from_slice(b"TIT2");
        bytes.extend_from_slice(&(frame_body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(frame_body);
        bytes.extend_from_slice(&[0xFF, 0xFB, 0x90, 0x00]); // sync, V1 L3, 128k, 44.1k
        bytes.extend_from_slice(&[0u8; 64]);

        let info = parse_mp3(&bytes).unwrap().expect("frame found");
        assert_eq!(info.pcm.sample_rate, 44100);
        assert_eq!(info.pcm.channels, 2);
        assert_eq!(info.bitrate_kbps, 128);
        assert_eq!(info.metadata.get("title").map(String::as_str), Some("Hi"));
    }

    #[test]
    fn scans_riff_info_metadata() {
        let mut bytes = wav_bytes(44100, 2, 0.05);
        // Splice a LIST INFO chunk in front of the data chunk.
        let data_pos = bytes.windows(4).position(|w| w == b"data").unwrap();
        let mut list = Vec::new();
        list.extend_from_slice(b"LIST");
        let body = b"INFOIART\x06\x00\x00\x00Someb\x00INAM\x05\x00\x00\x00Tune\x00\x00";
        list.extend_from_slice(&(body.len() as u32).to_le_bytes());
        list.extend_from_slice(body);
        bytes.splice(data_pos..data_pos, list);

        let info = parse_wav(&bytes).unwrap().unwrap();
        assert_eq!(info.metadata.get("artist").map(String::as_str), Some("Someb"));
        assert_eq!(info.metadata.get("title").map(String::as_str), Some("Tune"));
    }
}
