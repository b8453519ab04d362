//! # Audio Wire Codec
//!
//! Stateless conversion between what the audio devices speak (normalised `f32`
//! samples in `[-1.0, 1.0]`) and what the live endpoint speaks (base64 text of
//! little-endian signed 16-bit PCM).
//!
//! ## Wire format:
//! - **Bit depth**: 16-bit signed PCM, little-endian
//! - **Scale**: `sample * 32768`, clamped to the `i16` range
//! - **Transport**: standard base64 (with padding) so the bytes fit inside JSON
//! - **Channels**: interleaved; sample `i` of channel `c` sits at `i * channels + c`

use crate::error::DecodeError;
use base64::{engine::general_purpose::STANDARD, Engine};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Scale factor between normalised floats and 16-bit integers.
pub const PCM16_SCALE: f32 = 32768.0;

/// Fixed PCM format of one direction of the stream.
///
/// The rate and channel count are decided when a session opens and never
/// change while it is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl WireFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self { sample_rate, channels }
    }

    /// Mono PCM at the given rate.
    pub fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1)
    }

    /// MIME type announced next to every outbound chunk, e.g. `audio/pcm;rate=16000`.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Encode normalised samples into a wire payload.
    pub fn encode(&self, samples: &[f32]) -> String {
        to_wire(samples)
    }

    /// Decode a wire payload into a de-interleaved buffer in this format.
    pub fn decode(&self, data: &str) -> Result<AudioBuffer, DecodeError> {
        AudioBuffer::from_interleaved(&from_wire(data)?, self.sample_rate, self.channels)
    }
}

/// Decoded audio ready to be scheduled on an output device.
///
/// Mirrors a browser `AudioBuffer`: one `Vec<f32>` per channel, all the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Wrap already de-interleaved channel data.
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self { sample_rate, channels }
    }

    /// Split interleaved samples into per-channel data.
    pub fn from_interleaved(
        samples: &[f32],
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self, DecodeError> {
        let channel_count = usize::from(channels.max(1));
        if samples.len() % channel_count != 0 {
            return Err(DecodeError::PartialFrame {
                samples: samples.len(),
                channels,
            });
        }

        let frames = samples.len() / channel_count;
        let data = (0..channel_count)
            .map(|channel| {
                (0..frames)
                    .map(|i| samples[i * channel_count + channel])
                    .collect()
            })
            .collect();

        Ok(Self::new(sample_rate, data))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }
}

/// Convert normalised floats to 16-bit PCM.
///
/// Values outside `[-1.0, 1.0]` are clamped instead of wrapping around.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| (sample * PCM16_SCALE).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Convert 16-bit PCM back to normalised floats.
pub fn pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / PCM16_SCALE).collect()
}

/// Pack samples little-endian, two bytes each.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail.
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Reinterpret little-endian bytes as signed 16-bit samples.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| DecodeError::InvalidEncoding(e.to_string()))
}

/// Normalised samples -> text-safe wire payload.
pub fn to_wire(samples: &[f32]) -> String {
    encode_base64(&pcm16_to_bytes(&float_to_pcm16(samples)))
}

/// Text-safe wire payload -> normalised samples (interleaved if the payload was).
pub fn from_wire(data: &str) -> Result<Vec<f32>, DecodeError> {
    let bytes = decode_base64(data)?;
    Ok(pcm16_to_float(&bytes_to_pcm16(&bytes)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const STEP: f32 = 1.0 / PCM16_SCALE;

    #[test]
    fn test_silence_encodes_to_zero_bytes() {
        // 100 ms at 16 kHz
        let silence = vec![0.0f32; 1600];
        let bytes = pcm16_to_bytes(&float_to_pcm16(&silence));
        assert_eq!(bytes.len(), 1600 * 2);
        assert!(bytes.iter().all(|&b| b == 0));

        let decoded = from_wire(&to_wire(&silence)).unwrap();
        assert_eq!(decoded.len(), 1600);
        assert!(decoded.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_little_endian_packing() {
        assert_eq!(pcm16_to_bytes(&[1, -2, 0x1234]), vec![0x01, 0x00, 0xFE, 0xFF, 0x34, 0x12]);
        assert_eq!(bytes_to_pcm16(&[0x34, 0x12, 0x00, 0x80]).unwrap(), vec![0x1234, i16::MIN]);
    }

    #[test]
    fn test_full_scale_is_clamped() {
        assert_eq!(float_to_pcm16(&[1.0, -1.0, 1.5, -3.0]), vec![32767, -32768, 32767, -32768]);
    }

    #[test]
    fn test_odd_length_is_rejected() {
        let payload = encode_base64(&[0u8, 1, 2]);
        assert_eq!(from_wire(&payload), Err(DecodeError::OddLength(3)));
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        assert!(matches!(from_wire("not base64!"), Err(DecodeError::InvalidEncoding(_))));
    }

    #[test]
    fn test_stereo_payload_is_deinterleaved() {
        let interleaved = [100i16, -100, 200, -200, 300, -300];
        let payload = encode_base64(&pcm16_to_bytes(&interleaved));

        let buffer = WireFormat::new(24000, 2).decode(&payload).unwrap();
        assert_eq!(buffer.channel_count(), 2);
        assert_eq!(buffer.frames(), 3);
        assert_eq!(buffer.channel(0), &[100.0 / PCM16_SCALE, 200.0 / PCM16_SCALE, 300.0 / PCM16_SCALE]);
        assert_eq!(buffer.channel(1), &[-100.0 / PCM16_SCALE, -200.0 / PCM16_SCALE, -300.0 / PCM16_SCALE]);
    }

    #[test]
    fn test_partial_frame_is_rejected() {
        let payload = encode_base64(&pcm16_to_bytes(&[1, 2, 3]));
        let err = WireFormat::new(24000, 2).decode(&payload).unwrap_err();
        assert_eq!(err, DecodeError::PartialFrame { samples: 3, channels: 2 });
    }

    #[test]
    fn test_buffer_duration() {
        let buffer = WireFormat::mono(24000)
            .decode(&to_wire(&vec![0.25; 12000]))
            .unwrap();
        assert_eq!(buffer.frames(), 12000);
        assert!((buffer.duration() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_mime_type() {
        assert_eq!(WireFormat::mono(16000).mime_type(), "audio/pcm;rate=16000");
    }

    proptest! {
        #[test]
        fn prop_round_trip_within_one_step(samples in prop::collection::vec(-1.0f32..=1.0f32, 0..512)) {
            let restored = from_wire(&to_wire(&samples)).unwrap();
            prop_assert_eq!(restored.len(), samples.len());
            for (original, restored) in samples.iter().zip(restored.iter()) {
                prop_assert!((original - restored).abs() <= STEP + f32::EPSILON);
            }
        }
    }
}
