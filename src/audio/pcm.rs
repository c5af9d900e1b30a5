use std::time::Duration;
use thiserror::Error;

pub const SPEECH_SAMPLE_RATE: u32 = 24_000;
pub const SPEECH_CHANNELS: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("PCM payload has an odd number of bytes ({0})")]
    OddLength(usize),
}

/// Decoded mono audio, samples in [-1.0, 1.0].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = (self.samples.len() / (self.channels as usize)) as u64;
        Duration::from_micros((frames * 1_000_000) / (self.sample_rate as u64))
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Little-endian signed 16-bit PCM, 24 kHz mono, as returned by the speech
/// service. Each sample is divided by 32768.
pub fn decode_pcm16(bytes: &[u8]) -> Result<AudioBuffer, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|chunk| (i16::from_le_bytes([chunk[0], chunk[1]]) as f32) / 32768.0)
        .collect();
    Ok(AudioBuffer {
        samples,
        sample_rate: SPEECH_SAMPLE_RATE,
        channels: SPEECH_CHANNELS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_zero_and_minimum() {
        let buffer = decode_pcm16(&[0x00, 0x00, 0x00, 0x80]).unwrap();
        assert_eq!(buffer.samples, vec![0.0, -1.0]);
        assert_eq!(buffer.sample_rate, 24_000);
        assert_eq!(buffer.channels, 1);
    }

    #[test]
    fn maximum_stays_below_one() {
        let buffer = decode_pcm16(&[0xff, 0x7f]).unwrap();
        assert!(buffer.samples[0] < 1.0);
        assert!(buffer.samples[0] > 0.9999);
    }

    #[test]
    fn odd_length_is_rejected() {
        assert_eq!(decode_pcm16(&[0x00, 0x00, 0x01]), Err(DecodeError::OddLength(3)));
    }

    #[test]
    fn duration_follows_sample_rate() {
        let buffer = decode_pcm16(&vec![0u8; 48_000]).unwrap();
        assert_eq!(buffer.duration(), Duration::from_secs(1));
        assert!(decode_pcm16(&[]).unwrap().is_empty());
    }
}
