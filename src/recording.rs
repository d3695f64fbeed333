//! Session archive to dated WAV files.
//!
//! Each channel owns one [`ChannelDiskWriter`] with one or more named
//! streams, each capturing audio at a different point of the filter chain.
//! Streams buffer a whole session in memory and are written when the session
//! finishes, off the ingest path.

use crate::dsp::frame::{Frame, to_pcm16};
use crate::error::{RelayError, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Buffer for one stream variant during one session.
#[derive(Debug)]
pub struct StreamDiskWriter {
    variant: Option<String>,
    sample_rate: u32,
    samples: Vec<f32>,
}

impl StreamDiskWriter {
    pub fn new(variant: Option<String>, sample_rate: u32) -> Self {
        Self {
            variant,
            sample_rate,
            samples: Vec::new(),
        }
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    /// Copies `samples` into the session buffer.
    pub fn add_samples(&mut self, samples: &[f32]) {
        self.samples.extend_from_slice(samples);
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    fn take(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.samples)
    }
}

/// A drained stream waiting to be written.
struct PendingWrite {
    path: PathBuf,
    sample_rate: u32,
    samples: Vec<f32>,
}

/// All archive streams of one channel.
pub struct ChannelDiskWriter {
    channel_id: String,
    data_store: PathBuf,
    sample_rate: u32,
    minimum_record_secs: f64,
    streams: Vec<StreamDiskWriter>,
    started_at: Option<DateTime<Local>>,
}

impl ChannelDiskWriter {
    pub fn new(
        channel_id: impl Into<String>,
        data_store: impl Into<PathBuf>,
        sample_rate: u32,
        minimum_record_secs: f64,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            data_store: data_store.into(),
            sample_rate,
            minimum_record_secs,
            streams: Vec::new(),
            started_at: None,
        }
    }

    /// Adds a stream. `None` is the unsuffixed main stream. Adding an
    /// existing variant again is a no-op.
    pub fn add_stream(&mut self, variant: Option<&str>) {
        if self.has_stream(variant) {
            return;
        }
        self.streams
            .push(StreamDiskWriter::new(variant.map(str::to_string), self.sample_rate));
    }

    pub fn has_stream(&self, variant: Option<&str>) -> bool {
        self.streams.iter().any(|s| s.variant() == variant)
    }

    pub fn streams(&self) -> &[StreamDiskWriter] {
        &self.streams
    }

    /// Copies a frame's samples into the named stream.
    pub fn add_frame(&mut self, frame: &Frame, variant: Option<&str>) -> Result<()> {
        self.add_samples(&frame.samples, variant)
    }

    /// Copies samples into the named stream. The caller keeps its buffer.
    pub fn add_samples(&mut self, samples: &[f32], variant: Option<&str>) -> Result<()> {
        let stream = self
            .streams
            .iter_mut()
            .find(|s| s.variant() == variant)
            .ok_or_else(|| RelayError::UnknownStream {
                variant: variant.unwrap_or("output").to_string(),
            })?;
        stream.add_samples(samples);
        Ok(())
    }

    /// Records the session start used for the folder and file names.
    pub fn start_event(&mut self, started_at: DateTime<Local>) {
        self.started_at = Some(started_at);
    }

    /// Drains every stream and writes the long enough ones in the background.
    ///
    /// Buffers are empty when this returns, so the next session starts
    /// clean. The handle resolves to the paths actually written; write
    /// failures are logged per stream and leave the other streams unaffected.
    pub fn finish_event(&mut self) -> JoinHandle<Vec<PathBuf>> {
        let started_at = self.started_at.take().unwrap_or_else(|| {
            warn!(channel = %self.channel_id, "Session finished without a start time");
            Local::now()
        });
        let dir = event_dir(&self.data_store, &started_at);

        let mut pending = Vec::new();
        for stream in &mut self.streams {
            let duration = stream.duration_secs();
            let samples = stream.take();
            if duration < self.minimum_record_secs {
                info!(
                    channel = %self.channel_id,
                    stream = stream.variant().unwrap_or("output"),
                    "Stream of {:.1} secs ignored",
                    duration
                );
                continue;
            }
            let name = event_file_name(&self.channel_id, &started_at, stream.variant());
            pending.push(PendingWrite {
                path: dir.join(name),
                sample_rate: stream.sample_rate,
                samples,
            });
        }

        let channel_id = self.channel_id.clone();
        tokio::task::spawn_blocking(move || write_all(&channel_id, &dir, pending))
    }
}

fn write_all(channel_id: &str, dir: &Path, pending: Vec<PendingWrite>) -> Vec<PathBuf> {
    if pending.is_empty() {
        return Vec::new();
    }

    let mut written = Vec::with_capacity(pending.len());
    for write in pending {
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!(channel = %channel_id, path = %dir.display(), error = %e, "Failed to create archive folder");
            continue;
        }
        match write_wav(&write.path, write.sample_rate, &write.samples) {
            Ok(()) => {
                debug!(channel = %channel_id, path = %write.path.display(), "Wrote stream");
                written.push(write.path);
            }
            Err(e) => {
                error!(channel = %channel_id, path = %write.path.display(), error = %e, "Failed to write stream");
            }
        }
    }
    info!(channel = %channel_id, files = written.len(), "Done writes");
    written
}

/// Writes float samples as mono PCM16LE WAV.
pub fn write_wav(path: &Path, sample_rate: u32, samples: &[f32]) -> Result<()> {
    write_wav_pcm16(path, sample_rate, &to_pcm16(samples))
}

/// Writes mono PCM16LE WAV.
pub fn write_wav_pcm16(path: &Path, sample_rate: u32, samples: &[i16]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

/// `data_store/YYYY/MM/DD` for a session start.
pub fn event_dir(data_store: &Path, started_at: &DateTime<Local>) -> PathBuf {
    data_store
        .join(started_at.format("%Y").to_string())
        .join(started_at.format("%m").to_string())
        .join(started_at.format("%d").to_string())
}

/// `{channel_id}_{YYYYMMDDTHHMMSS}[_{variant}].wav`
pub fn event_file_name(
    channel_id: &str,
    started_at: &DateTime<Local>,
    variant: Option<&str>,
) -> String {
    let timestamp = started_at.format("%Y%m%dT%H%M%S");
    match variant {
        Some(variant) => format!("{}_{}_{}.wav", channel_id, timestamp, variant),
        None => format!("{}_{}.wav", channel_id, timestamp),
    }
}
