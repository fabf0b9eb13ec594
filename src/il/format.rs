//! Port domains, stream encodings, and the PCM format description.

use enum_primitive_derive::Primitive;

use super::error::IlError;

/// Maximum number of interleaved channels.
pub const CHANNELS_MAX: u8 = 32;

const RATE_MAX: u32 = 48000 * 8;

/// The broad class of data a port carries.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive, Default)]
pub enum Domain {
    /// Audio samples or compressed audio.
    #[default]
    Audio = 0,
    /// Video frames.
    Video = 1,
    /// Still images.
    Image = 2,
    /// Anything else (clock, metadata).
    Other = 3,
}

/// The encoding of the data crossing a port.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive, Default)]
pub enum Encoding {
    /// Format not yet known.
    #[default]
    Unknown = 0,
    /// The port sniffs the stream and publishes the detected format.
    Autodetect = 1,
    /// Raw interleaved PCM.
    Pcm = 2,
    /// MPEG-1/2 layer III.
    Mp3 = 3,
    /// Opus in Ogg framing.
    Opus = 4,
    /// Vorbis in Ogg framing.
    Vorbis = 5,
}

/// A PCM format that fully describes the samples crossing a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    /// Samples per second, per channel.
    pub sample_rate: u32,
    /// Number of interleaved channels. At least 1.
    pub channels: u8,
    /// Bits per sample. 8, 16, 24 or 32.
    pub bits_per_sample: u8,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            bits_per_sample: 16,
        }
    }
}

impl PcmFormat {
    /// Creates a new PCM format description.
    pub fn new(sample_rate: u32, channels: u8, bits_per_sample: u8) -> Result<Self, IlError> {
        if channels == 0 || channels > CHANNELS_MAX {
            return Err(IlError::BadParameter(format!(
                "invalid channel count {} (must be between 1 and {})",
                channels, CHANNELS_MAX
            )));
        }

        if sample_rate == 0 || sample_rate > RATE_MAX {
            return Err(IlError::BadParameter(format!(
                "invalid sample rate {} (must be between 1 and {})",
                sample_rate, RATE_MAX
            )));
        }

        if !matches!(bits_per_sample, 8 | 16 | 24 | 32) {
            return Err(IlError::BadParameter(format!(
                "invalid bit depth {} (must be 8, 16, 24 or 32)",
                bits_per_sample
            )));
        }

        Ok(Self {
            sample_rate,
            channels,
            bits_per_sample,
        })
    }

    /// Bytes per interleaved frame (one sample for every channel).
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    /// Bytes per second of audio in this format.
    pub fn byte_rate(&self) -> u64 {
        self.sample_rate as u64 * self.frame_bytes() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_formats() {
        assert!(PcmFormat::new(44100, 0, 16).is_err());
        assert!(PcmFormat::new(44100, 33, 16).is_err());
        assert!(PcmFormat::new(0, 2, 16).is_err());
        assert!(PcmFormat::new(RATE_MAX + 1, 2, 16).is_err());
        assert!(PcmFormat::new(44100, 2, 12).is_err());
    }

    #[test]
    fn frame_geometry() {
        let fmt = PcmFormat::new(48000, 2, 16).unwrap();
        assert_eq!(fmt.frame_bytes(), 4);
        assert_eq!(fmt.byte_rate(), 192_000);
    }
}
