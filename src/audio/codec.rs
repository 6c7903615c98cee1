//! Codec helpers: audio-file decode (symphonia), Opus packet codecs, and
//! the sample-rate conversion used when a TTS file does not match the
//! negotiated downlink rate.

use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Decoded mono PCM at the file's native rate.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// Decode an audio file (mp3 or wav) to mono 16-bit PCM.
pub fn decode_audio_file(path: &Path) -> Result<DecodedAudio> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open audio file {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .with_context(|| format!("unrecognized audio container {}", path.display()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("no decodable track in {}", path.display()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("track missing sample rate"))?;
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count())
        .unwrap_or(1)
        .max(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("failed to build audio decoder")?;

    let mut samples: Vec<i16> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(anyhow!("demux error in {}: {e}", path.display())),
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let mut buf = SampleBuffer::<i16>::new(decoded.capacity() as u64, *decoded.spec());
                buf.copy_interleaved_ref(decoded);
                downmix_into(&mut samples, buf.samples(), channels);
            }
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!(error = %e, "skipping undecodable packet");
            }
            Err(e) => return Err(anyhow!("decode error in {}: {e}", path.display())),
        }
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

fn downmix_into(out: &mut Vec<i16>, interleaved: &[i16], channels: usize) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    for frame in interleaved.chunks_exact(channels) {
        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
        out.push((sum / channels as i32) as i16);
    }
}

/// Linear-interpolation resampler. Voice content at these rates does not
/// warrant a polyphase filter.
pub fn resample_linear(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let a = input[idx] as f64;
        let b = input[(idx + 1).min(input.len() - 1)] as f64;
        out.push((a + (b - a) * frac).round() as i16);
    }
    out
}

pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

pub fn bytes_to_pcm(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Downlink frame encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEncoding {
    Opus,
    Pcm,
}

impl FrameEncoding {
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("pcm") {
            Self::Pcm
        } else {
            Self::Opus
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Opus => "opus",
            Self::Pcm => "pcm",
        }
    }
}

/// Split mono PCM into fixed-duration downlink frames, Opus-encoding them
/// when the negotiated format asks for it. The final partial frame is
/// zero-padded to keep every packet the same duration.
pub fn encode_frames(
    samples: &[i16],
    sample_rate: u32,
    frame_duration_ms: u32,
    encoding: FrameEncoding,
) -> Result<Vec<Vec<u8>>> {
    let frame_samples = (sample_rate as usize * frame_duration_ms as usize) / 1000;
    if frame_samples == 0 {
        bail!("frame duration too small: {frame_duration_ms}ms at {sample_rate}Hz");
    }

    let mut encoder = match encoding {
        FrameEncoding::Opus => Some(
            opus::Encoder::new(sample_rate, opus::Channels::Mono, opus::Application::Voip)
                .context("failed to create opus encoder")?,
        ),
        FrameEncoding::Pcm => None,
    };

    let mut frames = Vec::with_capacity(samples.len() / frame_samples + 1);
    let mut padded;
    for chunk in samples.chunks(frame_samples) {
        let chunk = if chunk.len() == frame_samples {
            chunk
        } else {
            padded = chunk.to_vec();
            padded.resize(frame_samples, 0);
            &padded
        };
        let frame = match encoder.as_mut() {
            Some(encoder) => encoder
                .encode_vec(chunk, 4000)
                .context("opus encode failed")?,
            None => pcm_to_bytes(chunk),
        };
        frames.push(frame);
    }
    Ok(frames)
}

/// Stateful Opus decoder for the uplink. Rebuilt whenever the client
/// renegotiates audio parameters in a hello.
pub struct OpusStreamDecoder {
    decoder: opus::Decoder,
    sample_rate: u32,
    channels: u8,
}

impl OpusStreamDecoder {
    pub fn new(sample_rate: u32, channels: u8) -> Result<Self> {
        let opus_channels = match channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            n => bail!("unsupported channel count {n}"),
        };
        let decoder = opus::Decoder::new(sample_rate, opus_channels)
            .context("failed to create opus decoder")?;
        Ok(Self {
            decoder,
            sample_rate,
            channels,
        })
    }

    pub fn matches(&self, sample_rate: u32, channels: u8) -> bool {
        self.sample_rate == sample_rate && self.channels == channels
    }

    /// Decode one Opus packet to 16-bit LE PCM bytes.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        // 120 ms is the longest frame Opus allows
        let max_samples = (self.sample_rate as usize * 120 / 1000) * self.channels as usize;
        let mut pcm = vec![0i16; max_samples];
        let decoded = self
            .decoder
            .decode(packet, &mut pcm, false)
            .context("opus decode failed")?;
        pcm.truncate(decoded * self.channels as usize);
        Ok(pcm_to_bytes(&pcm))
    }
}
