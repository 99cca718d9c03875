//! # Software Audio Devices
//!
//! Device backends that need no sound hardware. They keep the real timing
//! behaviour (a monotonic clock, chunks that finish when their audio would
//! have finished) and move the audio through WAV files instead of speakers
//! and microphones.
//!
//! ## Components:
//! - **SoftwareContext**: capture-side context with suspend / resume / close
//! - **SoftwarePlayback**: playback context rendering scheduled chunks into a
//!   timeline, optionally written to a WAV file on close
//! - **SoftwareMicrophone**: streams a WAV file (then silence), or silence only,
//!   at real-time pace
//! - **SoftwareDevices**: [`AudioDevices`] factory built from [`DevicesConfig`]

use crate::audio::codec::AudioFrame;
use crate::audio::device::{
    AudioContext, AudioDevices, ChunkId, CompletionSender, ContextState, MediaTrack, Microphone,
    MicrophoneStream, OutputClock, PlaybackDevice, SampleBlock,
};
use crate::config::DevicesConfig;
use crate::error::DeviceError;
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// WAV format tag for integer PCM.
const WAV_FORMAT_PCM: u16 = 1;

/// Microphone block length in milliseconds.
const MIC_BLOCK_MS: u64 = 64;

/// Nearest sample to `position`. Chunk durations are truncated to whole
/// nanoseconds, so back-to-back starts land a fraction of a nanosecond early.
fn sample_index(position: Duration, sample_rate: u32) -> usize {
    ((position.as_nanos() * sample_rate as u128 + 500_000_000) / 1_000_000_000) as usize
}

// ── Capture context ──────────────────────────────────────────────

/// Capture-side device context.
pub struct SoftwareContext {
    sample_rate: u32,
    state: Mutex<ContextState>,
}

impl SoftwareContext {
    pub fn new(sample_rate: u32, start_suspended: bool) -> Self {
        let state = if start_suspended {
            ContextState::Suspended
        } else {
            ContextState::Running
        };
        Self {
            sample_rate,
            state: Mutex::new(state),
        }
    }
}

#[async_trait]
impl AudioContext for SoftwareContext {
    fn state(&self) -> ContextState {
        *self.state.lock()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn resume(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        match *state {
            ContextState::Closed => Err(DeviceError::Closed),
            _ => {
                *state = ContextState::Running;
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<(), DeviceError> {
        *self.state.lock() = ContextState::Closed;
        Ok(())
    }
}

// ── Playback context ─────────────────────────────────────────────

struct ActiveChunk {
    start: usize,
    end: usize,
    task: JoinHandle<()>,
}

struct PlaybackInner {
    sample_rate: u32,
    origin: Instant,
    state: Mutex<ContextState>,
    /// Everything scheduled so far, indexed by clock position in samples
    timeline: Mutex<Vec<f32>>,
    chunks: Mutex<HashMap<ChunkId, ActiveChunk>>,
}

/// Playback context driven by a monotonic tokio clock.
///
/// Chunks are rendered into a sample timeline at their scheduled offsets, so
/// gapless scheduling produces a seamless recording. A stopped chunk has its
/// unplayed tail erased.
pub struct SoftwarePlayback {
    inner: Arc<PlaybackInner>,
    output_path: Option<PathBuf>,
}

impl SoftwarePlayback {
    pub fn new(sample_rate: u32, start_suspended: bool, output_path: Option<PathBuf>) -> Self {
        let state = if start_suspended {
            ContextState::Suspended
        } else {
            ContextState::Running
        };
        Self {
            inner: Arc::new(PlaybackInner {
                sample_rate,
                origin: Instant::now(),
                state: Mutex::new(state),
                timeline: Mutex::new(Vec::new()),
                chunks: Mutex::new(HashMap::new()),
            }),
            output_path,
        }
    }

    /// Copy of everything rendered so far.
    pub fn rendered(&self) -> Vec<f32> {
        self.inner.timeline.lock().clone()
    }

    /// Number of chunks scheduled or playing on the device.
    pub fn active_chunks(&self) -> usize {
        self.inner.chunks.lock().len()
    }
}

#[async_trait]
impl AudioContext for SoftwarePlayback {
    fn state(&self) -> ContextState {
        *self.inner.state.lock()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    async fn resume(&self) -> Result<(), DeviceError> {
        let mut state = self.inner.state.lock();
        match *state {
            ContextState::Closed => Err(DeviceError::Closed),
            _ => {
                *state = ContextState::Running;
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<(), DeviceError> {
        {
            let mut state = self.inner.state.lock();
            if *state == ContextState::Closed {
                return Ok(());
            }
            *state = ContextState::Closed;
        }

        for (_, chunk) in self.inner.chunks.lock().drain() {
            chunk.task.abort();
        }

        let Some(path) = self.output_path.clone() else {
            return Ok(());
        };
        let samples = self.rendered();
        let sample_rate = self.inner.sample_rate;
        tokio::task::spawn_blocking(move || write_wav(&path, &samples, sample_rate))
            .await
            .map_err(|e| DeviceError::Other(e.to_string()))?
    }
}

impl OutputClock for SoftwarePlayback {
    fn current_time(&self) -> Duration {
        self.inner.origin.elapsed()
    }
}

impl PlaybackDevice for SoftwarePlayback {
    fn start_chunk(
        &self,
        id: ChunkId,
        frame: &AudioFrame,
        start_at: Duration,
        ended: CompletionSender,
    ) -> Result<(), DeviceError> {
        match self.state() {
            ContextState::Closed => return Err(DeviceError::Closed),
            ContextState::Suspended => {
                return Err(DeviceError::Other("playback context is suspended".into()))
            }
            ContextState::Running => {}
        }

        let start = sample_index(start_at, self.inner.sample_rate);
        let end = start + frame.len();
        {
            let mut timeline = self.inner.timeline.lock();
            if timeline.len() < end {
                timeline.resize(end, 0.0);
            }
            timeline[start..end].copy_from_slice(&frame.samples[..frame.len()]);
        }

        let inner = Arc::clone(&self.inner);
        let finish_at = self.inner.origin + start_at + frame.duration();

        // Held across the spawn so the task cannot look the chunk up before it is registered
        let mut chunks = self.inner.chunks.lock();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(finish_at).await;
            if inner.chunks.lock().remove(&id).is_some() {
                let _ = ended.send(id);
            }
        });
        chunks.insert(id, ActiveChunk { start, end, task });
        Ok(())
    }

    fn stop_chunk(&self, id: ChunkId) {
        let Some(chunk) = self.inner.chunks.lock().remove(&id) else {
            return;
        };
        chunk.task.abort();

        let now = sample_index(self.current_time(), self.inner.sample_rate);
        let from = now.max(chunk.start).min(chunk.end);
        let mut timeline = self.inner.timeline.lock();
        let to = chunk.end.min(timeline.len());
        if from < to {
            timeline[from..to].iter_mut().for_each(|s| *s = 0.0);
        }
        // Drop the silent tail so the next chunk can start at "now"
        if to == timeline.len() {
            timeline.truncate(from);
        }
    }
}

fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), DeviceError> {
    let pcm: Vec<i16> = samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i16)
        .collect();
    let header = wav::Header::new(WAV_FORMAT_PCM, 1, sample_rate, 16);
    let mut file = File::create(path).map_err(|e| DeviceError::Other(e.to_string()))?;
    wav::write(header, &wav::BitDepth::Sixteen(pcm), &mut file)
        .map_err(|e| DeviceError::Other(e.to_string()))?;
    info!(path = %path.display(), samples = samples.len(), "Wrote playback recording");
    Ok(())
}

// ── Microphone ───────────────────────────────────────────────────

/// Track of a software microphone; stopping it ends the sample stream.
#[derive(Debug, Default)]
pub struct SoftwareTrack {
    stopped: AtomicBool,
}

impl MediaTrack for SoftwareTrack {
    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Microphone track stopped");
        }
    }

    fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }
}

/// Microphone fed from a WAV file (followed by silence) or silence only.
#[derive(Debug, Clone, Default)]
pub struct SoftwareMicrophone {
    source: Option<PathBuf>,
}

impl SoftwareMicrophone {
    pub fn silence() -> Self {
        Self { source: None }
    }

    pub fn from_wav(path: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(path.into()),
        }
    }
}

#[async_trait]
impl Microphone for SoftwareMicrophone {
    async fn request_access(&self, sample_rate: u32) -> Result<MicrophoneStream, DeviceError> {
        let prerecorded = match &self.source {
            Some(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || read_wav_mono(&path, sample_rate))
                    .await
                    .map_err(|e| DeviceError::Other(e.to_string()))??
            }
            None => Vec::new(),
        };

        let track = Arc::new(SoftwareTrack::default());
        let (tx, rx) = mpsc::channel::<SampleBlock>(32);
        tokio::spawn(stream_samples(prerecorded, sample_rate, Arc::clone(&track), tx));

        Ok(MicrophoneStream {
            samples: ReceiverStream::new(rx).boxed(),
            track,
            sample_rate,
        })
    }
}

async fn stream_samples(
    prerecorded: Vec<f32>,
    sample_rate: u32,
    track: Arc<SoftwareTrack>,
    tx: mpsc::Sender<SampleBlock>,
) {
    let block_len = (sample_rate as u64 * MIC_BLOCK_MS / 1000).max(1) as usize;
    let mut interval = tokio::time::interval(Duration::from_millis(MIC_BLOCK_MS));
    let mut offset = 0;

    loop {
        interval.tick().await;
        if !track.is_live() {
            break;
        }

        let mut block = vec![0.0; block_len];
        if offset < prerecorded.len() {
            let take = block_len.min(prerecorded.len() - offset);
            block[..take].copy_from_slice(&prerecorded[offset..offset + take]);
            offset += take;
        }

        if tx.send(Ok(block)).await.is_err() {
            break;
        }
    }
}

/// Read a WAV file as mono `f32` samples at `target_rate`.
fn read_wav_mono(path: &Path, target_rate: u32) -> Result<Vec<f32>, DeviceError> {
    let mut file = File::open(path)
        .map_err(|e| DeviceError::Unavailable(format!("{}: {e}", path.display())))?;
    let (header, data) = wav::read(&mut file).map_err(|e| DeviceError::Other(e.to_string()))?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(v) => v.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
        wav::BitDepth::Sixteen(v) => v.iter().map(|&s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(v) => v.iter().map(|&s| s as f32 / 8_388_608.0).collect(),
        wav::BitDepth::ThirtyTwoFloat(v) => v,
        wav::BitDepth::Empty => Vec::new(),
    };

    let channels = header.channel_count.max(1) as usize;
    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|c| c.iter().sum::<f32>() / c.len() as f32)
        .collect();

    if header.sampling_rate != target_rate {
        warn!(
            from = header.sampling_rate,
            to = target_rate,
            "Resampling microphone input"
        );
    }
    Ok(resample_linear(&mono, header.sampling_rate, target_rate))
}

/// Linear-interpolation resampler, good enough for speech test material.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

// ── Factory ──────────────────────────────────────────────────────

/// Device factory backed by the software devices above.
#[derive(Debug, Clone)]
pub struct SoftwareDevices {
    config: DevicesConfig,
}

impl SoftwareDevices {
    pub fn new(config: DevicesConfig) -> Self {
        Self { config }
    }
}

impl AudioDevices for SoftwareDevices {
    fn capture_context(&self, sample_rate: u32) -> Result<Arc<dyn AudioContext>, DeviceError> {
        Ok(Arc::new(SoftwareContext::new(
            sample_rate,
            self.config.start_suspended,
        )))
    }

    fn playback_context(&self, sample_rate: u32) -> Result<Arc<dyn PlaybackDevice>, DeviceError> {
        Ok(Arc::new(SoftwarePlayback::new(
            sample_rate,
            self.config.start_suspended,
            self.config.output_wav.clone().map(PathBuf::from),
        )))
    }

    fn microphone(&self) -> Arc<dyn Microphone> {
        match &self.config.input_wav {
            Some(path) => Arc::new(SoftwareMicrophone::from_wav(path)),
            None => Arc::new(SoftwareMicrophone::silence()),
        }
    }
}
