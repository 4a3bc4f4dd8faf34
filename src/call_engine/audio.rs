//! Audio Pipeline - Mikrofon Capture und Playback
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Pro Tick (60 ms) wird
//! genau ein Frame dekodiert und abgespielt und ein Frame aufgenommen und
//! kodiert. Der Callback wartet höchstens [`PLAYBACK_WAIT`] auf Netzwerkdaten
//! und nimmt keine Locks.

use super::codec::{CodecError, VoiceCodec};
use super::engine::{CallEngine, CallError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (8 kHz reicht für Sprache)
pub const SAMPLE_RATE: u32 = 8000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (60ms @ 8kHz = 480 samples)
pub const FRAME_SIZE: usize = 480;

/// Dauer eines Ticks
pub const TICK_PERIOD: Duration = Duration::from_millis(60);

/// Maximale Wartezeit auf einen eingehenden Frame pro Tick
pub const PLAYBACK_WAIT: Duration = Duration::from_millis(2);

/// Kapazität von Incoming- und Outgoing-Buffer (in Frames)
pub const QUEUE_CAPACITY: usize = 50;

/// Ring-Buffer zwischen Input- und Output-Stream
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Codec initialisation failed: {0}")]
    Codec(#[from] CodecError),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// FRAME QUEUES
// ============================================================================

/// Begrenzte Warteschlangen zwischen Netzwerk und Audio
pub struct FrameQueues {
    pub incoming_tx: Sender<Vec<u8>>,
    pub incoming_rx: Receiver<Vec<u8>>,
    pub outgoing_tx: Sender<Vec<u8>>,
    pub outgoing_rx: Receiver<Vec<u8>>,
}

impl FrameQueues {
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = crossbeam_channel::bounded(QUEUE_CAPACITY);
        let (outgoing_tx, outgoing_rx) = crossbeam_channel::bounded(QUEUE_CAPACITY);
        Self {
            incoming_tx,
            incoming_rx,
            outgoing_tx,
            outgoing_rx,
        }
    }
}

impl Default for FrameQueues {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// AUDIO PIPELINE
// ============================================================================

/// Zähler für Statusanzeige und Tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub ticks: u64,
    pub underruns: u64,
    pub decode_errors: u64,
    pub encode_errors: u64,
    pub dropped_outgoing: u64,
}

/// Geräteunabhängige Verarbeitung eines Ticks
pub struct AudioPipeline {
    codec: VoiceCodec,
    incoming: Receiver<Vec<u8>>,
    outgoing: Sender<Vec<u8>>,
    playback_wait: Duration,
    stats: PipelineStats,
}

impl AudioPipeline {
    pub fn new(
        incoming: Receiver<Vec<u8>>,
        outgoing: Sender<Vec<u8>>,
        playback_wait: Duration,
    ) -> Result<Self, AudioError> {
        Ok(Self {
            codec: VoiceCodec::new()?,
            incoming,
            outgoing,
            playback_wait,
            stats: PipelineStats::default(),
        })
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Ein Tick: erst Playback, dann Capture
    pub fn process_tick(&mut self, input: &[i16], output: &mut [i16]) {
        self.stats.ticks += 1;
        self.playback(output);
        self.capture(input);
    }

    fn playback(&mut self, output: &mut [i16]) {
        match self.incoming.recv_timeout(self.playback_wait) {
            Ok(packet) => {
                if let Err(e) = self.codec.decode(&packet, output) {
                    self.stats.decode_errors += 1;
                    tracing::warn!("Dropping undecodable frame: {}", e);
                    output.fill(0);
                }
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                // Underrun: Stille statt Warten
                self.stats.underruns += 1;
                output.fill(0);
            }
        }
    }

    fn capture(&mut self, input: &[i16]) {
        let packet = match self.codec.encode(input) {
            Ok(packet) => packet.to_vec(),
            Err(e) => {
                self.stats.encode_errors += 1;
                tracing::warn!("Skipping tick: {}", e);
                return;
            }
        };

        match self.outgoing.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.stats.dropped_outgoing += 1;
                tracing::trace!("Outgoing buffer full, frame dropped");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

// ============================================================================
// AUDIO DEVICE
// ============================================================================

/// Hält die laufenden cpal-Streams
///
/// Streams sind nicht Send; das Gerät bleibt auf dem Thread, der es öffnet.
/// Drop stoppt beide Streams.
pub struct AudioDevice {
    _input_stream: Stream,
    _output_stream: Stream,
}

impl AudioDevice {
    /// Öffnet Standard-Ein- und Ausgabe und startet die Pipeline
    ///
    /// Der Output-Callback treibt die Ticks: sobald sein Block aufgebraucht
    /// ist, holt er 480 aufgenommene Samples aus dem Ring-Buffer und lässt
    /// die Pipeline einen Tick rechnen.
    pub fn start(mut pipeline: AudioPipeline) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let input_device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;
        let output_device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;

        let config = StreamConfig {
            channels: CHANNELS,
            sample_rate: SampleRate(SAMPLE_RATE),
            buffer_size: BufferSize::Fixed(FRAME_SIZE as u32),
        };

        tracing::info!(
            "Starting audio: {} Hz, {} channel(s), {} samples per tick",
            SAMPLE_RATE,
            CHANNELS,
            FRAME_SIZE
        );

        let (mut capture_producer, mut capture_consumer) =
            HeapRb::<i16>::new(RING_BUFFER_SIZE).split();

        let input_stream = input_device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for &sample in data {
                        // Bei vollem Ring wird verworfen
                        let _ = capture_producer.try_push(f32_to_i16(sample));
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        let mut input_block = vec![0i16; FRAME_SIZE];
        let mut output_block = vec![0i16; FRAME_SIZE];
        let mut cursor = FRAME_SIZE;

        let output_stream = output_device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        if cursor == FRAME_SIZE {
                            let captured = capture_consumer.pop_slice(&mut input_block);
                            input_block[captured..].fill(0);
                            pipeline.process_tick(&input_block, &mut output_block);
                            cursor = 0;
                        }
                        *sample = i16_to_f32(output_block[cursor]);
                        cursor += 1;
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        input_stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
        output_stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Self {
            _input_stream: input_stream,
            _output_stream: output_stream,
        })
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

// ============================================================================
// FRAME SENDER
// ============================================================================

/// Startet den Sender-Thread für ausgehende Frames
///
/// Blockiert auf dem Outgoing-Buffer und verschickt jeden Frame über die
/// Engine. Ohne aktive Gegenstelle werden Frames verworfen. Der Thread
/// endet, wenn alle Sender des Buffers weg sind.
pub fn spawn_frame_sender(
    engine: Arc<CallEngine>,
    outgoing: Receiver<Vec<u8>>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("frame-sender".to_string())
        .spawn(move || {
            for frame in outgoing.iter() {
                match engine.send_frame(&frame) {
                    Ok(_) => {}
                    Err(CallError::Transport(e)) => {
                        tracing::warn!("Error sending frame: {}", e);
                    }
                    Err(e) => tracing::debug!("Frame not sent: {}", e),
                }
            }
            tracing::debug!("Frame sender stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn pipeline() -> (AudioPipeline, FrameQueues) {
        let queues = FrameQueues::new();
        let pipeline = AudioPipeline::new(
            queues.incoming_rx.clone(),
            queues.outgoing_tx.clone(),
            PLAYBACK_WAIT,
        )
        .unwrap();
        (pipeline, queues)
    }

    #[test]
    fn test_underrun_plays_silence_within_deadline() {
        let (mut pipeline, _queues) = pipeline();
        let input = vec![0i16; FRAME_SIZE];
        let mut output = vec![123i16; FRAME_SIZE];

        let started = Instant::now();
        pipeline.process_tick(&input, &mut output);
        let elapsed = started.elapsed();

        assert!(output.iter().all(|&s| s == 0));
        assert_eq!(pipeline.stats().underruns, 1);
        // Weit unter der Tick-Periode
        assert!(elapsed < TICK_PERIOD, "tick took {:?}", elapsed);
    }

    #[test]
    fn test_capture_enqueues_encoded_frame() {
        let (mut pipeline, queues) = pipeline();
        let input: Vec<i16> = (0..FRAME_SIZE).map(|i| (i as i16 % 64) * 100).collect();
        let mut output = vec![0i16; FRAME_SIZE];

        pipeline.process_tick(&input, &mut output);

        let mut reference = VoiceCodec::new().unwrap();
        let expected = reference.encode(&input).unwrap().to_vec();
        assert_eq!(queues.outgoing_rx.try_recv().unwrap(), expected);
    }

    #[test]
    fn test_playback_decodes_incoming_frame() {
        let (mut pipeline, queues) = pipeline();
        let mut codec = VoiceCodec::new().unwrap();
        let packet = codec.encode(&vec![1000i16; FRAME_SIZE]).unwrap().to_vec();
        queues.incoming_tx.send(packet).unwrap();

        let mut output = vec![0i16; FRAME_SIZE];
        pipeline.process_tick(&vec![0i16; FRAME_SIZE], &mut output);

        assert_eq!(pipeline.stats().underruns, 0);
        assert_eq!(pipeline.stats().decode_errors, 0);
    }

    #[test]
    fn test_bad_frame_becomes_silence() {
        let (mut pipeline, queues) = pipeline();
        queues.incoming_tx.send(vec![0xff, 0xff, 0xff]).unwrap();

        let mut output = vec![55i16; FRAME_SIZE];
        pipeline.process_tick(&vec![0i16; FRAME_SIZE], &mut output);

        assert!(output.iter().all(|&s| s == 0));
        assert_eq!(pipeline.stats().decode_errors, 1);
    }

    #[test]
    fn test_wrong_capture_size_skips_tick() {
        let (mut pipeline, queues) = pipeline();
        let mut output = vec![0i16; FRAME_SIZE];

        pipeline.process_tick(&[0i16; 100], &mut output);

        assert_eq!(pipeline.stats().encode_errors, 1);
        assert!(queues.outgoing_rx.try_recv().is_err());
    }

    #[test]
    fn test_full_outgoing_buffer_drops_without_blocking() {
        let (mut pipeline, queues) = pipeline();
        for _ in 0..QUEUE_CAPACITY {
            queues.outgoing_tx.send(vec![1]).unwrap();
        }

        let mut output = vec![0i16; FRAME_SIZE];
        pipeline.process_tick(&vec![0i16; FRAME_SIZE], &mut output);

        assert_eq!(pipeline.stats().dropped_outgoing, 1);
        assert_eq!(queues.outgoing_rx.len(), QUEUE_CAPACITY);
    }

    #[test]
    fn test_sample_conversion_clamps() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
        assert!((i16_to_f32(i16::MAX) - 1.0).abs() < f32::EPSILON);
    }
}
