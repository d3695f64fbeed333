//! Session-aware forwarding of channel audio to a voice backend.
//!
//! [`Forwarder`] lives on the channel's ingest path and only does in-memory
//! work: gain, resampling to the backend rate, PCM16 conversion. Delivery
//! happens on [`ForwarderTask`], fed through an unbounded queue so a slow
//! backend never stalls ingest.

use crate::dsp::frame::{Frame, to_pcm16};
use crate::dsp::resample::{ResamplerFactory, StreamResampler};
use crate::error::Result;
use crate::forward::backend::VoiceBackend;
use crate::recording::{event_dir, event_file_name, write_wav_pcm16};
use crate::session::Session;
use chrono::{DateTime, Local};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Work item for the forwarding task.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardItem {
    Samples(Vec<i16>),
    SessionEnd {
        session_id: u64,
        started_at: DateTime<Local>,
    },
    /// End of stream; the task drains everything before it and exits.
    Stop,
}

/// Ingest-side half of a forwarder.
pub struct Forwarder {
    label: String,
    backend_rate: u32,
    gain: f32,
    factory: ResamplerFactory,
    resampler: Option<Box<dyn StreamResampler>>,
    last_session: Option<u64>,
    queue: mpsc::UnboundedSender<ForwardItem>,
}

impl Forwarder {
    /// Creates a forwarder and the task that delivers its output.
    pub fn new(
        label: impl Into<String>,
        backend_rate: u32,
        gain: f32,
        factory: ResamplerFactory,
    ) -> (Self, ForwarderTask) {
        let label = label.into();
        let (queue, rx) = mpsc::unbounded_channel();
        let task = ForwarderTask {
            label: label.clone(),
            backend_rate,
            rx,
            capture: None,
        };
        let forwarder = Self {
            label,
            backend_rate,
            gain,
            factory,
            resampler: None,
            last_session: None,
            queue,
        };
        (forwarder, task)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn backend_rate(&self) -> u32 {
        self.backend_rate
    }

    /// Converts a frame for the backend and queues it.
    ///
    /// A frame from a different session than the previous one resets the
    /// resampler before any of its samples are processed.
    pub fn add_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.last_session != Some(frame.session_id()) {
            if let Some(resampler) = self.resampler.as_mut() {
                resampler.reset();
                debug!(forwarder = %self.label, session_id = frame.session_id(), "New session, resampler reset");
            }
            self.last_session = Some(frame.session_id());
        }

        let samples = if frame.sample_rate() != self.backend_rate {
            self.resample(frame.sample_rate(), &frame.samples)?
        } else {
            frame.samples.clone()
        };
        self.enqueue_samples(samples);
        Ok(())
    }

    /// Flushes the resampler tail, then tells the backend the transmission
    /// is over.
    pub fn on_session_end(&mut self, session: &Session) {
        if let Some(resampler) = self.resampler.as_mut() {
            match resampler.flush() {
                Ok(tail) => self.enqueue_samples(tail),
                Err(e) => {
                    warn!(forwarder = %self.label, session_id = session.id, error = %e, "Resampler flush failed")
                }
            }
        }
        self.enqueue(ForwardItem::SessionEnd {
            session_id: session.id,
            started_at: session.started_at,
        });
    }

    /// Queues the end-of-stream sentinel.
    pub fn stop(&self) {
        self.enqueue(ForwardItem::Stop);
    }

    fn enqueue_samples(&self, mut samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }
        if self.gain != 1.0 {
            samples.iter_mut().for_each(|s| *s *= self.gain);
        }
        self.enqueue(ForwardItem::Samples(to_pcm16(&samples)));
    }

    fn resample(&mut self, rate_in: u32, samples: &[f32]) -> Result<Vec<f32>> {
        let resampler = match self.resampler.take() {
            Some(resampler) if resampler.rate_in() == rate_in => resampler,
            _ => {
                debug!(forwarder = %self.label, rate_in, rate_out = self.backend_rate, "Creating resampler");
                (self.factory)(rate_in, self.backend_rate)?
            }
        };
        self.resampler.insert(resampler).process(samples)
    }

    fn enqueue(&self, item: ForwardItem) {
        if self.queue.send(item).is_err() {
            warn!(forwarder = %self.label, "Forwarding task is gone, dropping audio");
        }
    }
}

/// Counters reported when a forwarding task ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwarderStats {
    pub chunks: u64,
    pub samples: u64,
    pub transmissions: u64,
    pub errors: u64,
}

struct DebugCapture {
    data_store: PathBuf,
    channel_id: String,
    samples: Vec<i16>,
}

/// Delivery half of a forwarder.
pub struct ForwarderTask {
    label: String,
    backend_rate: u32,
    rx: mpsc::UnboundedReceiver<ForwardItem>,
    capture: Option<DebugCapture>,
}

impl ForwarderTask {
    /// Also archive the delivered PCM per session as `*_backend.wav`.
    pub fn with_debug_capture(
        mut self,
        data_store: impl Into<PathBuf>,
        channel_id: impl Into<String>,
    ) -> Self {
        self.capture = Some(DebugCapture {
            data_store: data_store.into(),
            channel_id: channel_id.into(),
            samples: Vec::new(),
        });
        self
    }

    /// Delivers queued items until the stop sentinel or until every
    /// [`Forwarder`] handle is gone.
    pub async fn run(mut self, mut backend: Box<dyn VoiceBackend>) -> ForwarderStats {
        info!(forwarder = %self.label, backend = backend.name(), "Forwarding started");
        let mut stats = ForwarderStats::default();

        while let Some(item) = self.rx.recv().await {
            match item {
                ForwardItem::Samples(pcm) => {
                    if let Some(capture) = self.capture.as_mut() {
                        capture.samples.extend_from_slice(&pcm);
                    }
                    stats.chunks += 1;
                    stats.samples += pcm.len() as u64;
                    if let Err(e) = backend.add_samples(&pcm).await {
                        stats.errors += 1;
                        warn!(forwarder = %self.label, error = %e, "Backend rejected samples");
                    }
                }
                ForwardItem::SessionEnd {
                    session_id,
                    started_at,
                } => {
                    stats.transmissions += 1;
                    if let Err(e) = backend.end_transmission().await {
                        stats.errors += 1;
                        warn!(forwarder = %self.label, session_id, error = %e, "Backend failed to end transmission");
                    }
                    self.flush_capture(started_at).await;
                }
                ForwardItem::Stop => break,
            }
        }

        info!(forwarder = %self.label, chunks = stats.chunks, errors = stats.errors, "Forwarding stopped");
        stats
    }

    async fn flush_capture(&mut self, started_at: DateTime<Local>) {
        let Some(capture) = self.capture.as_mut() else {
            return;
        };
        if capture.samples.is_empty() {
            return;
        }

        let samples = std::mem::take(&mut capture.samples);
        let dir = event_dir(&capture.data_store, &started_at);
        let path = dir.join(event_file_name(
            &capture.channel_id,
            &started_at,
            Some("backend"),
        ));
        let rate = self.backend_rate;

        let result = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir)?;
            write_wav_pcm16(&path, rate, &samples)?;
            Ok::<_, crate::error::RelayError>(path)
        })
        .await;

        match result {
            Ok(Ok(path)) => debug!(forwarder = %self.label, path = %path.display(), "Wrote backend capture"),
            Ok(Err(e)) => error!(forwarder = %self.label, error = %e, "Failed to write backend capture"),
            Err(e) => error!(forwarder = %self.label, error = %e, "Backend capture task failed"),
        }
    }
}
