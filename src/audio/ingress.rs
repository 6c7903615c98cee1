//! Audio ingress: binary frames off the socket, PCM into the ASR adapter.
//!
//! The queue is bounded at 100 frames and the socket reader blocks when it
//! fills; nothing is dropped on the floor. Decode failures fall back to
//! passing the raw frame onward so the ASR adapter can still salvage it.

use anyhow::Result;
use std::sync::{Arc, Mutex as StdMutex};

use crate::asr::AsrAdapter;
use crate::audio::codec::OpusStreamDecoder;
use crate::protocol::AudioParams;
use crate::queue::BoundedQueue;
use crate::session::SessionState;

/// Uplink frame queue capacity.
pub const INGRESS_QUEUE_SIZE: usize = 100;

/// Holds the uplink decoder state. Reconfigured on every client hello;
/// reconfiguration with unchanged parameters is a no-op.
pub struct AudioIngress {
    decoder: StdMutex<Option<OpusStreamDecoder>>,
}

impl Default for AudioIngress {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioIngress {
    pub fn new() -> Self {
        Self {
            decoder: StdMutex::new(None),
        }
    }

    /// Apply the negotiated uplink parameters. Opus gets a stateful decoder;
    /// PCM passes through untouched. A failed decoder init logs and leaves
    /// the session in pass-through mode.
    pub fn configure(&self, params: &AudioParams) -> Result<()> {
        let mut slot = self.decoder.lock().expect("decoder lock poisoned");
        if !params.format.eq_ignore_ascii_case("opus") {
            *slot = None;
            return Ok(());
        }
        if let Some(existing) = slot.as_ref() {
            if existing.matches(params.sample_rate, params.channels) {
                return Ok(());
            }
        }
        match OpusStreamDecoder::new(params.sample_rate, params.channels) {
            Ok(decoder) => {
                *slot = Some(decoder);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    sample_rate = params.sample_rate,
                    channels = params.channels,
                    error = %e,
                    "opus decoder init failed, falling back to pass-through"
                );
                *slot = None;
                Ok(())
            }
        }
    }

    /// Decode one uplink frame to PCM bytes. Raw frames (PCM mode, or a
    /// failed decode) come back unchanged.
    pub fn decode(&self, frame: Vec<u8>) -> Vec<u8> {
        let mut slot = self.decoder.lock().expect("decoder lock poisoned");
        match slot.as_mut() {
            Some(decoder) => match decoder.decode(&frame) {
                Ok(pcm) => pcm,
                Err(e) => {
                    tracing::debug!(error = %e, len = frame.len(), "opus decode failed, passing raw frame");
                    frame
                }
            },
            None => frame,
        }
    }
}

/// The audio consumer task: pops frames, decodes, feeds the ASR adapter.
/// Exits when the queue closes.
pub async fn run_audio_ingress(
    state: Arc<SessionState>,
    ingress: Arc<AudioIngress>,
    queue: Arc<BoundedQueue<Vec<u8>>>,
    asr: Arc<AsrAdapter>,
) {
    while let Some(frame) = queue.pop().await {
        let pcm = ingress.decode(frame);
        if let Err(e) = asr.add_audio(pcm).await {
            tracing::warn!(
                session_id = %state.session_id,
                device_id = %state.device_id,
                error = %e,
                "asr add_audio failed"
            );
        }
    }
    tracing::debug!(session_id = %state.session_id, "audio ingress stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{bytes_to_pcm, encode_frames, FrameEncoding};

    #[test]
    fn test_pcm_mode_passes_through() {
        let ingress = AudioIngress::new();
        ingress
            .configure(&AudioParams {
                format: "pcm".to_string(),
                sample_rate: 16000,
                channels: 1,
                frame_duration: 60,
            })
            .unwrap();
        let frame = vec![1, 2, 3, 4];
        assert_eq!(ingress.decode(frame.clone()), frame);
    }

    #[test]
    fn test_opus_frames_decode_to_pcm() {
        let ingress = AudioIngress::new();
        ingress
            .configure(&AudioParams {
                format: "opus".to_string(),
                sample_rate: 16000,
                channels: 1,
                frame_duration: 60,
            })
            .unwrap();

        let samples: Vec<i16> = (0..1920)
            .map(|i| ((i as f32 * 0.1).sin() * 5000.0) as i16)
            .collect();
        let packets = encode_frames(&samples, 16000, 60, FrameEncoding::Opus).unwrap();
        let pcm = ingress.decode(packets[0].clone());
        // 60 ms at 16 kHz mono
        assert_eq!(bytes_to_pcm(&pcm).len(), 960);
    }

    #[test]
    fn test_unsupported_rate_falls_back_to_pass_through() {
        let ingress = AudioIngress::new();
        // 44.1 kHz is not a valid Opus rate; init fails and frames pass raw
        ingress
            .configure(&AudioParams {
                format: "opus".to_string(),
                sample_rate: 44100,
                channels: 1,
                frame_duration: 60,
            })
            .unwrap();
        let frame = vec![0xde, 0xad, 0xbe, 0xef];
        assert_eq!(ingress.decode(frame.clone()), frame);
    }

    #[test]
    fn test_reconfigure_same_params_is_idempotent() {
        let ingress = AudioIngress::new();
        let params = AudioParams {
            format: "opus".to_string(),
            sample_rate: 16000,
            channels: 1,
            frame_duration: 60,
        };
        ingress.configure(&params).unwrap();
        ingress.configure(&params).unwrap();
        assert!(ingress.decoder.lock().unwrap().is_some());
    }
}
