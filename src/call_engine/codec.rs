//! Opus-Codec mit festen Parametern
//!
//! 8 kHz, Mono, 60 ms Frames (480 Samples), 16 kbit/s, VoIP-Modus.
//! Jeder Aufruf verarbeitet genau einen Frame.

use super::audio::{CHANNELS, FRAME_SIZE, SAMPLE_RATE};
use opus::{Application, Bitrate, Channels, Decoder, Encoder};
use thiserror::Error;

/// Ziel-Bitrate in bit/s
pub const OPUS_BITRATE: i32 = 16_000;

/// Obergrenze für ein kodiertes Paket
pub const MAX_PACKET_SIZE: usize = 1024;

/// Größter Frame, den Opus bei 8 kHz liefern kann (120 ms)
const MAX_DECODED_SAMPLES: usize = 960;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid frame size: expected {expected} samples, got {got}")]
    InvalidFrameSize { expected: usize, got: usize },

    #[error("Empty packet")]
    EmptyPacket,

    #[error("Opus error: {0}")]
    Opus(#[from] opus::Error),
}

/// Encoder und Decoder eines Anrufs
pub struct VoiceCodec {
    encoder: Encoder,
    decoder: Decoder,
    packet_buffer: Vec<u8>,
    decode_buffer: Vec<i16>,
}

impl VoiceCodec {
    pub fn new() -> Result<Self, CodecError> {
        debug_assert_eq!(CHANNELS, 1);

        let mut encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)?;
        encoder.set_bitrate(Bitrate::Bits(OPUS_BITRATE))?;

        let decoder = Decoder::new(SAMPLE_RATE, Channels::Mono)?;

        Ok(Self {
            encoder,
            decoder,
            packet_buffer: vec![0u8; MAX_PACKET_SIZE],
            decode_buffer: vec![0i16; MAX_DECODED_SAMPLES],
        })
    }

    /// Kodiert genau einen PCM-Frame
    pub fn encode(&mut self, pcm: &[i16]) -> Result<&[u8], CodecError> {
        if pcm.len() != FRAME_SIZE {
            return Err(CodecError::InvalidFrameSize {
                expected: FRAME_SIZE,
                got: pcm.len(),
            });
        }

        let len = self.encoder.encode(pcm, &mut self.packet_buffer)?;
        Ok(&self.packet_buffer[..len])
    }

    /// Dekodiert ein Paket in `out` (genau [`FRAME_SIZE`] Samples)
    ///
    /// Bei einem Fehler bleibt `out` unverändert.
    pub fn decode(&mut self, packet: &[u8], out: &mut [i16]) -> Result<(), CodecError> {
        if out.len() != FRAME_SIZE {
            return Err(CodecError::InvalidFrameSize {
                expected: FRAME_SIZE,
                got: out.len(),
            });
        }
        // Leere Pakete würden als Paketverlust interpretiert
        if packet.is_empty() {
            return Err(CodecError::EmptyPacket);
        }

        let samples = self
            .decoder
            .decode(packet, &mut self.decode_buffer, false)?;
        if samples != FRAME_SIZE {
            return Err(CodecError::InvalidFrameSize {
                expected: FRAME_SIZE,
                got: samples,
            });
        }

        out.copy_from_slice(&self.decode_buffer[..FRAME_SIZE]);
        Ok(())
    }
}

impl std::fmt::Debug for VoiceCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceCodec")
            .field("sample_rate", &SAMPLE_RATE)
            .field("bitrate", &OPUS_BITRATE)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_frame() -> Vec<i16> {
        (0..FRAME_SIZE)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16
            })
            .collect()
    }

    #[test]
    fn test_roundtrip_keeps_frame_length() {
        let mut codec = VoiceCodec::new().unwrap();
        let packet = codec.encode(&sine_frame()).unwrap().to_vec();
        assert!(!packet.is_empty());
        assert!(packet.len() <= MAX_PACKET_SIZE);

        let mut out = vec![0i16; FRAME_SIZE];
        codec.decode(&packet, &mut out).unwrap();
        assert_eq!(out.len(), FRAME_SIZE);
    }

    #[test]
    fn test_encode_rejects_wrong_sample_count() {
        let mut codec = VoiceCodec::new().unwrap();
        assert!(matches!(
            codec.encode(&[0i16; 100]),
            Err(CodecError::InvalidFrameSize { got: 100, .. })
        ));
    }

    #[test]
    fn test_decode_failure_leaves_buffer_untouched() {
        let mut codec = VoiceCodec::new().unwrap();
        let mut out = vec![7i16; FRAME_SIZE];

        assert!(matches!(
            codec.decode(&[], &mut out),
            Err(CodecError::EmptyPacket)
        ));
        // TOC code 3 mit 63 Frames ist kein gültiges Paket
        assert!(codec.decode(&[0xff, 0xff, 0xff], &mut out).is_err());
        assert!(out.iter().all(|&s| s == 7));
    }
}
