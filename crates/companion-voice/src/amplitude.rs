//! Amplitude extraction for lip-sync.
//!
//! Decodes a complete response clip and reduces it to a fixed-rate sequence of
//! normalized loudness samples (the viseme track), one sample per 50 ms window.

use crate::error::DecodeError;
use rodio::{Decoder, Source};
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

/// Width of one viseme window (20 samples per second).
pub const FRAME_INTERVAL: Duration = Duration::from_millis(50);

/// Empirical speech-RMS scaling; typical voice RMS sits around 0.05..0.2.
const RMS_GAIN: f32 = 5.0;

/// Normalized loudness samples, one per `FRAME_INTERVAL`, each in `0.0..=1.0`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisemeTrack {
    samples: Vec<f32>,
}

impl VisemeTrack {
    pub fn from_samples(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Sample for an animation frame. Indices past the end wrap around so a late
    /// frame still reads a valid value.
    pub fn at(&self, frame_index: usize) -> Option<f32> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples[frame_index % self.samples.len()])
    }
}

/// Decode an encoded clip (WAV, MP3, FLAC, Vorbis) and compute its viseme track.
///
/// Zero-length input yields an empty track, not an error.
pub fn analyze(encoded_audio: &[u8]) -> Result<VisemeTrack, DecodeError> {
    if encoded_audio.is_empty() {
        return Ok(VisemeTrack::default());
    }

    let decoder = Decoder::new(Cursor::new(encoded_audio.to_vec()))?;
    let channels = decoder.channels().max(1) as usize;
    let sample_rate = decoder.sample_rate();

    // First channel only; interleaved frames are stepped over.
    let pcm: Vec<f32> = decoder
        .convert_samples::<f32>()
        .step_by(channels)
        .collect();

    let track = analyze_pcm(&pcm, sample_rate);
    debug!(
        sample_rate,
        channels,
        pcm_samples = pcm.len(),
        frames = track.len(),
        "Computed viseme track"
    );
    Ok(track)
}

/// Decode on the blocking pool so message handling keeps running meanwhile.
/// The clip comes back alongside its track, ready for playback. If the decode task
/// itself dies the clip is lost and an empty buffer is returned.
pub async fn analyze_async(encoded_audio: Vec<u8>) -> (Vec<u8>, Result<VisemeTrack, DecodeError>) {
    let decode = tokio::task::spawn_blocking(move || {
        let track = analyze(&encoded_audio);
        (encoded_audio, track)
    });
    match decode.await {
        Ok(decoded) => decoded,
        Err(e) => (Vec::new(), Err(DecodeError(format!("decode task failed: {}", e)))),
    }
}

/// RMS over non-overlapping windows of `round(sample_rate * 0.05)` samples.
/// The final window may be shorter; it still produces a sample.
pub fn analyze_pcm(pcm: &[f32], sample_rate: u32) -> VisemeTrack {
    let samples_per_frame = samples_per_frame(sample_rate);
    let samples = pcm
        .chunks(samples_per_frame)
        .map(|window| {
            let sum_sq: f32 = window.iter().map(|s| s * s).sum();
            let rms = (sum_sq / window.len() as f32).sqrt();
            (rms * RMS_GAIN).min(1.0)
        })
        .collect();
    VisemeTrack::from_samples(samples)
}

fn samples_per_frame(sample_rate: u32) -> usize {
    ((sample_rate as f64 * FRAME_INTERVAL.as_secs_f64()).round() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn frame_count_is_ceil_of_duration() {
        // 16 kHz => 800 samples per frame; 1_000 samples => 2 frames (800 + 200).
        let pcm = vec![0.1f32; 1_000];
        assert_eq!(analyze_pcm(&pcm, 16_000).len(), 2);

        let pcm = vec![0.1f32; 1_600];
        assert_eq!(analyze_pcm(&pcm, 16_000).len(), 2);

        let pcm = vec![0.1f32; 1_601];
        assert_eq!(analyze_pcm(&pcm, 16_000).len(), 3);
    }

    #[test]
    fn rms_is_scaled_and_clamped() {
        // Constant 0.1 => RMS 0.1 => 0.5 after gain.
        let track = analyze_pcm(&[0.1f32; 800], 16_000);
        assert!((track.samples()[0] - 0.5).abs() < 1e-5);

        // Full-scale square wave saturates at 1.0.
        let loud: Vec<f32> = (0..800).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert_eq!(analyze_pcm(&loud, 16_000).samples()[0], 1.0);

        let silent = analyze_pcm(&[0.0f32; 800], 16_000);
        assert_eq!(silent.samples()[0], 0.0);
    }

    #[test]
    fn samples_stay_in_unit_range() {
        let pcm: Vec<f32> = (0..44_100)
            .map(|i| ((i as f32) * 0.01).sin() * ((i % 7) as f32 / 7.0))
            .collect();
        let track = analyze_pcm(&pcm, 44_100);
        assert!(track.samples().iter().all(|s| (0.0..=1.0).contains(s)));
    }

    #[test]
    fn odd_sample_rate_rounds_window() {
        // 22_050 * 0.05 = 1102.5 -> 1103 samples per window.
        assert_eq!(samples_per_frame(22_050), 1_103);
        assert_eq!(samples_per_frame(0), 1);
    }

    #[test]
    fn empty_input_is_empty_track() {
        assert!(analyze(&[]).unwrap().is_empty());
        assert!(analyze_pcm(&[], 16_000).is_empty());
    }

    #[test]
    fn garbage_input_is_decode_error() {
        let result = analyze(b"definitely not audio");
        assert!(result.is_err());
    }

    #[test]
    fn decodes_wav_clip() {
        // One second of 16 kHz mono at a quarter scale.
        let wav = wav_bytes(&vec![8_192i16; 16_000], 16_000, 1);
        let track = analyze(&wav).unwrap();
        assert_eq!(track.len(), 20);
        assert!(track.samples().iter().all(|s| (s - 1.0).abs() < 1e-3));
    }

    #[test]
    fn stereo_uses_first_channel() {
        // Left loud, right silent; 0.5 s at 8 kHz stereo.
        let mut interleaved = Vec::new();
        for _ in 0..4_000 {
            interleaved.push(3_277i16);
            interleaved.push(0i16);
        }
        let track = analyze(&wav_bytes(&interleaved, 8_000, 2)).unwrap();
        assert_eq!(track.len(), 10);
        assert!(track.samples().iter().all(|s| *s > 0.4));
    }

    #[tokio::test]
    async fn async_analysis_hands_clip_back() {
        let clip = wav_bytes(&vec![3_277i16; 8_000], 8_000, 1);
        let (audio, track) = analyze_async(clip.clone()).await;
        assert_eq!(audio, clip);
        assert_eq!(track.unwrap().len(), 20);

        let (audio, track) = analyze_async(b"not audio".to_vec()).await;
        assert_eq!(audio, b"not audio".to_vec());
        assert!(track.is_err());
    }

    #[test]
    fn wraps_frame_index() {
        let track = VisemeTrack::from_samples(vec![0.1, 0.2, 0.3]);
        assert_eq!(track.at(4), Some(0.2));
        assert_eq!(VisemeTrack::default().at(0), None);
    }
}
