//! Frame codec
//!
//! Raw PCM bytes travel as standard base64 text inside JSON messages.
//! No compression is applied; `decode(encode(b)) == b` for every byte buffer.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::{Error, Result};

/// Encode raw audio bytes into transport-safe text
#[must_use]
pub fn encode(raw: &[u8]) -> String {
    STANDARD.encode(raw)
}

/// Decode transport text back into raw audio bytes
///
/// # Errors
///
/// Returns `Error::Codec` if the text is not valid base64
pub fn decode(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text)
        .map_err(|e| Error::Codec(format!("invalid base64 payload: {e}")))
}

/// Convert f32 samples in [-1.0, 1.0] to little-endian PCM16 bytes
#[must_use]
pub fn f32_to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Convert little-endian PCM16 bytes to f32 samples
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn pcm16_bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

/// Convert f32 samples to WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Codec(e.to_string()))?;

        for pair in f32_to_pcm16_bytes(samples).chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| Error::Codec(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Codec(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
