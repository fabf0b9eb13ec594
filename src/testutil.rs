//! Shared fixtures for the test suites: synthesized WAV streams and
//! throwaway files.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

/// Synthesizes an in-memory 16-bit WAV stream of the given shape. The
/// sample values are a deterministic ramp, so content can be compared
/// byte for byte.
pub(crate) fn wav_bytes(rate: u32, channels: u16, seconds: f64) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let frames = (rate as f64 * seconds) as u32;
        for i in 0..frames {
            let v = ((i % 100) as i16) - 50;
            for _ in 0..channels {
                writer.write_sample(v).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    cursor.into_inner()
}

/// The PCM payload (sans header) of the stream `wav_bytes` builds.
pub(crate) fn wav_payload(rate: u32, channels: u16, seconds: f64) -> Vec<u8> {
    let frames = (rate as f64 * seconds) as u32;
    let mut out = Vec::with_capacity(frames as usize * channels as usize * 2);
    for i in 0..frames {
        let v = ((i % 100) as i16) - 50;
        for _ in 0..channels {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

fn unique_path(stem: &str) -> PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "adagio-test-{}-{n}-{stem}.wav",
        std::process::id()
    ))
}

/// Writes a WAV stream to a throwaway file and returns its path.
pub(crate) fn wav_file(stem: &str, rate: u32, channels: u16, seconds: f64) -> PathBuf {
    let path = unique_path(stem);
    std::fs::write(&path, wav_bytes(rate, channels, seconds)).unwrap();
    path
}

/// Writes several back-to-back WAV segments to one file: the fixture for
/// mid-stream format changes.
pub(crate) fn concat_wav_file(stem: &str, segments: &[(u32, u16, f64)]) -> PathBuf {
    let path = unique_path(stem);
    let mut data = Vec::new();
    for &(rate, channels, seconds) in segments {
        data.extend_from_slice(&wav_bytes(rate, channels, seconds));
    }
    std::fs::write(&path, data).unwrap();
    path
}

/// Writes arbitrary bytes to a throwaway file.
pub(crate) fn byte_file(stem: &str, data: &[u8]) -> PathBuf {
    let path = unique_path(stem);
    std::fs::write(&path, data).unwrap();
    path
}
