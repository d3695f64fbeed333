//! Per-channel processing: UDP ingest, sessions, filtering, archive, forwarding.

use crate::config::{AppConfig, ResolvedChannel};
use crate::defaults;
use crate::dsp::chain::{FilterChain, TapPoint};
use crate::dsp::frame::Frame;
use crate::error::{RelayError, Result};
use crate::forward::Forwarder;
use crate::recording::ChannelDiskWriter;
use crate::session::{Clock, Session, SessionTracker, SystemClock};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Session transitions published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started(Session),
    Ended(Session),
}

/// Orchestrates one radio channel.
///
/// [`on_datagram`](Self::on_datagram) never suspends and never touches disk
/// or network: it updates the session state, filters the frame and hands
/// copies to the archive buffers and forwarder queues.
pub struct ChannelProcessor<C: Clock = SystemClock> {
    channel: ResolvedChannel,
    listen_address: String,
    sample_rate: u32,
    tracker: SessionTracker<C>,
    chain: FilterChain,
    disk: Option<ChannelDiskWriter>,
    taps: Vec<TapPoint>,
    forwarders: Vec<Forwarder>,
    pending: VecDeque<Frame>,
    writes: Vec<JoinHandle<Vec<PathBuf>>>,
    // Paths from writes reaped before the next flush.
    written: Vec<PathBuf>,
    events: broadcast::Sender<SessionEvent>,
}

impl ChannelProcessor<SystemClock> {
    pub fn new(channel: ResolvedChannel, config: &AppConfig) -> Result<Self> {
        Self::with_clock(channel, config, SystemClock)
    }
}

impl<C: Clock> ChannelProcessor<C> {
    pub fn with_clock(channel: ResolvedChannel, config: &AppConfig, clock: C) -> Result<Self> {
        let chain = FilterChain::voice(config.sample_rate, &config.filters, channel.ctcss)?;

        let mut taps = Vec::new();
        let disk = if config.disk_writer.enabled {
            let mut writer = ChannelDiskWriter::new(
                channel.id.clone(),
                config.data_store_path.clone(),
                config.sample_rate,
                config.disk_writer.minimum_record_secs,
            );
            for name in &config.disk_writer.streams {
                let point = TapPoint::parse(name).ok_or_else(|| RelayError::ConfigInvalidValue {
                    key: "disk_writer.streams".to_string(),
                    message: format!("unknown stream '{}'", name),
                })?;
                if let TapPoint::After(role) = point
                    && !chain.has_stage(role)
                {
                    debug!(channel = %channel.id, stream = %name, "No such filter stage, stream skipped");
                    continue;
                }
                writer.add_stream(point.variant());
                if !taps.contains(&point) {
                    taps.push(point);
                }
            }
            Some(writer)
        } else {
            None
        };

        let (events, _) = broadcast::channel(16);
        Ok(Self {
            listen_address: config.listen_address.clone(),
            sample_rate: config.sample_rate,
            tracker: SessionTracker::with_clock(config.ptt_timeout(), clock),
            chain,
            disk,
            taps,
            forwarders: Vec::new(),
            pending: VecDeque::new(),
            writes: Vec::new(),
            written: Vec::new(),
            events,
            channel,
        })
    }

    pub fn add_forwarder(&mut self, forwarder: Forwarder) {
        self.forwarders.push(forwarder);
    }

    pub fn id(&self) -> &str {
        &self.channel.id
    }

    pub fn channel(&self) -> &ResolvedChannel {
        &self.channel
    }

    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    pub fn disk_writer(&self) -> Option<&ChannelDiskWriter> {
        self.disk.as_ref()
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.tracker.active()
    }

    /// Receives session start/end notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// When the active session times out, if one is active.
    pub fn deadline(&self) -> Option<Instant> {
        self.tracker.deadline()
    }

    /// Handles one datagram of little-endian f32 samples.
    ///
    /// A length that is not a multiple of 4 means the stream cannot be
    /// parsed and is returned as an error.
    pub fn on_datagram(&mut self, data: &[u8]) -> Result<()> {
        if data.len() % 4 != 0 {
            return Err(RelayError::MalformedDatagram {
                channel: self.channel.id.clone(),
                len: data.len(),
            });
        }
        if data.len() != defaults::EXPECTED_DATAGRAM_BYTES {
            trace!(channel = %self.channel.id, len = data.len(), "Unexpected datagram size");
        }

        if let Some(session) = self.tracker.on_datagram() {
            self.start_session(session);
        }

        let session_id = self.tracker.current_id();
        let frame = Frame::from_le_bytes(session_id, self.sample_rate, data).ok_or_else(|| {
            RelayError::MalformedDatagram {
                channel: self.channel.id.clone(),
                len: data.len(),
            }
        })?;
        self.pending.push_back(frame);
        self.process_pending();
        Ok(())
    }

    /// Ends the active session if it has timed out.
    pub fn poll_timeout(&mut self) -> Option<Session> {
        let ended = self.tracker.poll_timeout()?;
        self.finish_session(&ended);
        Some(ended)
    }

    /// Ends the active session now. Logs a warning if none is active.
    pub fn end_session(&mut self) -> Option<Session> {
        let ended = self.tracker.end_session()?;
        self.finish_session(&ended);
        Some(ended)
    }

    /// Waits for outstanding archive writes and returns the written paths.
    pub async fn flush_writes(&mut self) -> Vec<PathBuf> {
        let mut written = std::mem::take(&mut self.written);
        for handle in self.writes.drain(..) {
            match handle.await {
                Ok(paths) => written.extend(paths),
                Err(e) => error!(channel = %self.channel.id, error = %e, "Archive write task failed"),
            }
        }
        written
    }

    /// Closes the active session, stops the forwarders and waits for
    /// pending archive writes.
    pub async fn shutdown(&mut self) -> Vec<PathBuf> {
        if self.tracker.active().is_some() {
            self.end_session();
        }
        for forwarder in &self.forwarders {
            forwarder.stop();
        }
        self.flush_writes().await
    }

    fn start_session(&mut self, session: Session) {
        info!(channel = %self.channel.id, label = %self.channel.label, session_id = session.id, "Transmission started");
        if let Some(disk) = self.disk.as_mut() {
            disk.start_event(session.started_at);
        }
        self.publish(SessionEvent::Started(session));
    }

    fn finish_session(&mut self, ended: &Session) {
        info!(channel = %self.channel.id, session_id = ended.id, "Transmission ended");

        // Frames are processed as they arrive, so nothing is left queued here.
        debug_assert!(self.pending.is_empty());

        if let Some(disk) = self.disk.as_mut() {
            let handle = disk.finish_event();
            self.reap_writes();
            self.writes.push(handle);
        }
        self.chain.reset();
        for forwarder in &mut self.forwarders {
            forwarder.on_session_end(ended);
        }
        self.publish(SessionEvent::Ended(ended.clone()));
    }

    /// Collects archive writes that already completed, without waiting.
    fn reap_writes(&mut self) {
        let mut cx = Context::from_waker(Waker::noop());
        let channel = &self.channel.id;
        let written = &mut self.written;
        self.writes.retain_mut(|handle| {
            if !handle.is_finished() {
                return true;
            }
            match Pin::new(handle).poll(&mut cx) {
                Poll::Ready(Ok(paths)) => written.extend(paths),
                Poll::Ready(Err(e)) => error!(channel = %channel, error = %e, "Archive write task failed"),
                Poll::Pending => return true,
            }
            false
        });
    }

    fn publish(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!(channel = %self.channel.id, "No session event subscribers");
        }
    }

    fn process_pending(&mut self) {
        while let Some(mut frame) = self.pending.pop_front() {
            let taps = &self.taps;
            let disk = &mut self.disk;
            let channel_id = &self.channel.id;
            self.chain.process(&mut frame.samples, |point, samples| {
                if !taps.contains(&point) {
                    return;
                }
                if let Some(disk) = disk.as_mut()
                    && let Err(e) = disk.add_samples(samples, point.variant())
                {
                    warn!(channel = %channel_id, error = %e, "Archive tap failed");
                }
            });

            for forwarder in &mut self.forwarders {
                if let Err(e) = forwarder.add_frame(&frame) {
                    warn!(channel = %self.channel.id, forwarder = forwarder.label(), error = %e, "Forwarding failed");
                }
            }
        }
    }
}

impl ChannelProcessor<SystemClock> {
    /// Binds the channel's UDP socket.
    pub async fn bind(self) -> Result<BoundChannel> {
        let address = format!("{}:{}", self.listen_address, self.channel.udp_port);
        let socket = UdpSocket::bind(&address)
            .await
            .map_err(|e| RelayError::UdpBind {
                address: address.clone(),
                message: e.to_string(),
            })?;
        Ok(BoundChannel {
            processor: self,
            socket,
        })
    }
}

/// A channel with its UDP socket bound, ready to run.
pub struct BoundChannel {
    processor: ChannelProcessor<SystemClock>,
    socket: UdpSocket,
}

impl BoundChannel {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn processor(&self) -> &ChannelProcessor<SystemClock> {
        &self.processor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.processor.subscribe()
    }

    /// Receives datagrams and times out sessions until `shutdown` turns
    /// true or the stream turns out to be malformed.
    ///
    /// Either way the active session is closed, the forwarders are stopped
    /// and archive writes finish before this returns.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let id = self.processor.id().to_string();
        match self.socket.local_addr() {
            Ok(addr) => info!(channel = %id, "Listening on udp/{}", addr.port()),
            Err(e) => warn!(channel = %id, error = %e, "Listening on unknown address"),
        }

        let mut buf = vec![0u8; 65536];
        let result = loop {
            if *shutdown.borrow_and_update() {
                break Ok(());
            }
            let deadline = self.processor.deadline();
            let sleep_target = deadline
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(tokio::time::Instant::now);

            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, _peer)) => {
                        if let Err(e) = self.processor.on_datagram(&buf[..len]) {
                            error!(channel = %id, error = %e, "Channel stream is unusable");
                            break Err(e);
                        }
                    }
                    Err(e) => warn!(channel = %id, error = %e, "UDP receive failed"),
                },
                _ = tokio::time::sleep_until(sleep_target), if deadline.is_some() => {
                    self.processor.poll_timeout();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        let written = self.processor.shutdown().await;
        debug!(channel = %id, files = written.len(), "Channel stopped");
        result
    }
}
