//! # Telephony Audio Conversion
//!
//! The media stream carries G.711 mu-law at 8kHz mono. The STT backends want
//! uncompressed 16-bit PCM (wrapped in WAV for batch requests) and the TTS
//! backend answers with WAV of whatever rate and channel count it likes.
//!
//! ## Conversions:
//! - **wire -> WAV**: mu-law 8kHz -> PCM16 -> resample to backend rate -> WAV (batch STT)
//! - **wire -> PCM**: mu-law 8kHz -> PCM16 LE at backend rate (streaming STT)
//! - **WAV -> wire**: any WAV -> mono -> resample to 8kHz -> mu-law (playback)

use crate::error::GatewayError;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Cursor;

/// Converts between the telephony wire format and the backends' formats.
///
/// Implementations are pure functions of their input.
pub trait CodecAdapter: Send + Sync {
    /// Wire audio to a WAV file for batch transcription.
    fn wire_to_wav(&self, wire: &[u8]) -> Result<Vec<u8>, GatewayError>;

    /// Wire audio to raw little-endian PCM16 for streaming transcription.
    fn wire_to_pcm(&self, wire: &[u8]) -> Vec<u8>;

    /// Synthesized WAV to wire audio for playback.
    fn wav_to_wire(&self, wav: &[u8]) -> Result<Vec<u8>, GatewayError>;
}

/// G.711 mu-law codec with linear resampling between the wire and backend rates.
#[derive(Debug, Clone)]
pub struct TelephonyCodec {
    wire_rate: u32,
    backend_rate: u32,
}

impl TelephonyCodec {
    pub fn new(wire_rate: u32, backend_rate: u32) -> Self {
        Self {
            wire_rate,
            backend_rate,
        }
    }

    fn wire_to_samples(&self, wire: &[u8]) -> Vec<i16> {
        let pcm: Vec<i16> = wire.iter().map(|&b| ulaw_to_linear(b)).collect();
        resample_linear(&pcm, self.wire_rate, self.backend_rate)
    }
}

impl CodecAdapter for TelephonyCodec {
    fn wire_to_wav(&self, wire: &[u8]) -> Result<Vec<u8>, GatewayError> {
        encode_wav(&self.wire_to_samples(wire), self.backend_rate)
    }

    fn wire_to_pcm(&self, wire: &[u8]) -> Vec<u8> {
        samples_to_le_bytes(&self.wire_to_samples(wire))
    }

    fn wav_to_wire(&self, wav: &[u8]) -> Result<Vec<u8>, GatewayError> {
        let (samples, rate) = decode_wav_mono(wav)?;
        let resampled = resample_linear(&samples, rate, self.wire_rate);
        Ok(resampled.into_iter().map(linear_to_ulaw).collect())
    }
}

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

/// ITU-T G.711 mu-law decode of one byte.
pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// ITU-T G.711 mu-law encode of one sample.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    // Position of the highest set bit among bits 7..=14
    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Linear-interpolation resampler, mono.
pub fn resample_linear(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() || from_rate == 0 || to_rate == 0 {
        return input.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).round().max(1.0) as usize;
    let last = input.len() - 1;

    (0..out_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = (position.floor() as usize).min(last);
            let next = (index + 1).min(last);
            let fraction = position - index as f64;
            let a = input[index] as f64;
            let b = input[next] as f64;
            (a + (b - a) * fraction)
                .round()
                .clamp(i16::MIN as f64, i16::MAX as f64) as i16
        })
        .collect()
}

pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Wrap mono PCM16 samples in a WAV container.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, GatewayError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| GatewayError::Codec(format!("Failed to start WAV: {}", e)))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| GatewayError::Codec(format!("Failed to write WAV sample: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| GatewayError::Codec(format!("Failed to finalize WAV: {}", e)))?;
    }
    Ok(cursor.into_inner())
}

/// Parse a WAV file into mono PCM16 samples and its sample rate.
pub fn decode_wav_mono(wav: &[u8]) -> Result<(Vec<i16>, u32), GatewayError> {
    let mut reader = hound::WavReader::new(Cursor::new(wav))
        .map_err(|e| GatewayError::Codec(format!("Failed to parse WAV: {}", e)))?;
    let spec = reader.spec();

    let interleaved: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let shift = spec.bits_per_sample as i32 - 16;
            reader
                .samples::<i32>()
                .map(|s| {
                    s.map(|v| {
                        if shift >= 0 {
                            (v >> shift) as i16
                        } else {
                            (v << -shift) as i16
                        }
                    })
                })
                .collect::<Result<_, _>>()
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<Result<_, _>>(),
    }
    .map_err(|e| GatewayError::Codec(format!("Failed to read WAV samples: {}", e)))?;

    let channels = spec.channels.max(1) as usize;
    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| (frame.iter().map(|&s| s as i32).sum::<i32>() / channels as i32) as i16)
            .collect()
    };

    Ok((mono, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_wav(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_ulaw_silence_decodes_to_zero() {
        assert_eq!(ulaw_to_linear(0xFF), 0);
        assert_eq!(linear_to_ulaw(0), 0xFF);
    }

    #[test]
    fn test_ulaw_roundtrip_stays_within_quantization_step() {
        for &sample in &[-32000i16, -8000, -1000, -100, 50, 1000, 8000, 32000] {
            let decoded = ulaw_to_linear(linear_to_ulaw(sample));
            let error = (decoded as i32 - sample as i32).abs();
            let tolerance = (sample as i32).abs() / 16 + 16;
            assert!(
                error <= tolerance,
                "sample {} decoded as {} (error {})",
                sample,
                decoded,
                error
            );
            assert_eq!(decoded.signum(), sample.signum());
        }
    }

    #[test]
    fn test_resample_doubles_length_from_8k_to_16k() {
        let input: Vec<i16> = (0..80).map(|x| x * 10).collect();
        let output = resample_linear(&input, 8000, 16000);
        assert_eq!(output.len(), 160);
        assert_eq!(output[0], 0);
        // Midpoint between the first two samples
        assert_eq!(output[1], 5);
    }

    #[test]
    fn test_wire_to_wav_produces_backend_rate_wav() {
        let codec = TelephonyCodec::new(8000, 16000);
        let wire = vec![0xFFu8; 160];
        let wav = codec.wire_to_wav(&wire).unwrap();

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len(), 320);
    }

    #[test]
    fn test_wire_to_pcm_is_little_endian_pcm16() {
        let codec = TelephonyCodec::new(8000, 8000);
        let pcm = codec.wire_to_pcm(&[linear_to_ulaw(1000), 0xFF]);
        assert_eq!(pcm.len(), 4);
        let first = i16::from_le_bytes([pcm[0], pcm[1]]);
        assert!((first - 1000).abs() < 64);
        assert_eq!(&pcm[2..], &[0, 0]);
    }

    #[test]
    fn test_wav_to_wire_downmixes_and_resamples() {
        // 22.05kHz stereo, 0.1s
        let frames = 2205;
        let mut samples = Vec::with_capacity(frames * 2);
        for _ in 0..frames {
            samples.push(1000);
            samples.push(3000);
        }
        let wav = make_wav(22050, 2, &samples);

        let codec = TelephonyCodec::new(8000, 16000);
        let wire = codec.wav_to_wire(&wav).unwrap();
        assert_eq!(wire.len(), 800);
        let decoded = ulaw_to_linear(wire[400]);
        assert!((decoded - 2000).abs() < 128);
    }

    #[test]
    fn test_wav_to_wire_rejects_garbage() {
        let codec = TelephonyCodec::new(8000, 16000);
        let err = codec.wav_to_wire(b"definitely not a wav file").unwrap_err();
        assert!(matches!(err, GatewayError::Codec(_)));
    }
}
