//! Startup sequencing and supervision of channelizers, channels and forwarders.

use crate::channel::ChannelProcessor;
use crate::config::{AppConfig, BackendConfig, ResolvedChannel};
use crate::dsp::resample::{ResamplerFactory, sinc_factory};
use crate::error::{RelayError, Result};
use crate::forward::{Forwarder, ForwarderStats, UdpPcmBackend};
use crate::process::channelizer::spawn_event_logger;
use crate::process::{Channelizer, ProcessEventKind, ProcessEvents};
use std::future::Future;
use std::net::SocketAddr;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Owns the configuration and brings the relay up in order: channelizers
/// first, each confirmed ready, then the channel listeners.
pub struct ChannelManager {
    config: AppConfig,
    channels: Vec<ResolvedChannel>,
    factory: ResamplerFactory,
}

impl ChannelManager {
    /// Validates the configuration and resolves channel ids and ports.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let channels = config.resolve_channels()?;
        Ok(Self {
            config,
            channels,
            factory: sinc_factory(),
        })
    }

    pub fn with_resampler_factory(mut self, factory: ResamplerFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn channels(&self) -> &[ResolvedChannel] {
        &self.channels
    }

    /// One line per channel: frequency, label, id and port.
    pub fn configuration_summary(&self) -> String {
        let mut summary = format!(
            "{} channel(s), {} channelizer(s), data store {}",
            self.channels.len(),
            self.config.channelizers.len(),
            self.config.data_store_path.display()
        );
        for channel in &self.channels {
            summary.push('\n');
            summary.push_str(&channel.summary_line());
        }
        summary
    }

    /// Starts every channelizer and waits for each to report ready, then
    /// binds the channels and starts forwarding.
    ///
    /// Any channelizer whose first lifecycle event is not `READY` aborts the
    /// whole startup: already started channelizers are stopped and no UDP
    /// socket is bound.
    pub async fn start(&self) -> Result<RunningRelay> {
        for line in self.configuration_summary().lines() {
            info!("{}", line);
        }

        let mut channelizers = Vec::with_capacity(self.config.channelizers.len());
        let mut loggers = Vec::new();
        for config in &self.config.channelizers {
            let (mut channelizer, mut events) = Channelizer::new(config.clone())?;
            info!(channelizer = channelizer.name(), program = %config.program, "Starting channelizer");

            let ready = match channelizer.start() {
                Ok(()) => wait_ready(&channelizer, &mut events).await,
                Err(e) => Err(e),
            };
            if let Err(e) = ready {
                channelizer.stop();
                channelizer.wait_exit().await;
                stop_all(&channelizers).await;
                return Err(e);
            }

            loggers.push(spawn_event_logger(channelizer.name().to_string(), events));
            channelizers.push(channelizer);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut relay = RunningRelay {
            channelizers,
            loggers,
            channel_tasks: JoinSet::new(),
            forwarder_tasks: JoinSet::new(),
            addresses: Vec::new(),
            shutdown,
        };

        for channel in &self.channels {
            if let Err(e) = self.start_channel(channel, &mut relay, &shutdown_rx).await {
                error!(channel = %channel.id, error = %e, "Channel failed to start");
                relay.shutdown().await;
                return Err(e);
            }
        }

        info!(channels = relay.addresses.len(), "Relay running");
        Ok(relay)
    }

    /// Runs until `shutdown` resolves or every channel has stopped, then
    /// shuts down cleanly.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut relay = self.start().await?;
        tokio::select! {
            _ = shutdown => info!("Shutdown requested"),
            _ = relay.wait_channels() => warn!("Every channel has stopped"),
        }
        relay.shutdown().await;
        Ok(())
    }

    async fn start_channel(
        &self,
        channel: &ResolvedChannel,
        relay: &mut RunningRelay,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        let mut processor = ChannelProcessor::new(channel.clone(), &self.config)?;

        if channel.forward
            && let Some(backend) = self.config.backend.as_ref()
        {
            let forwarder = self.start_forwarder(channel, backend, relay).await?;
            processor.add_forwarder(forwarder);
        }

        let bound = processor.bind().await?;
        let address = bound.local_addr()?;
        relay.addresses.push((channel.id.clone(), address));

        let id = channel.id.clone();
        let shutdown = shutdown.clone();
        relay
            .channel_tasks
            .spawn(async move { (id, bound.run(shutdown).await) });
        Ok(())
    }

    async fn start_forwarder(
        &self,
        channel: &ResolvedChannel,
        backend: &BackendConfig,
        relay: &mut RunningRelay,
    ) -> Result<Forwarder> {
        let udp = UdpPcmBackend::connect(&backend.remote_host, backend.remote_port).await?;
        let gain = channel.output_gain();
        debug!(channel = %channel.id, gain, remote = %udp.target(), "Forwarding channel");

        let (forwarder, mut task) = Forwarder::new(
            channel.id.clone(),
            backend.sample_rate,
            gain,
            self.factory.clone(),
        );
        if backend.debug_capture {
            task = task.with_debug_capture(self.config.data_store_path.clone(), channel.id.clone());
        }
        relay.forwarder_tasks.spawn(task.run(Box::new(udp)));
        Ok(forwarder)
    }
}

/// Handles to everything [`ChannelManager::start`] launched.
pub struct RunningRelay {
    channelizers: Vec<Channelizer>,
    loggers: Vec<JoinHandle<()>>,
    channel_tasks: JoinSet<(String, Result<()>)>,
    forwarder_tasks: JoinSet<ForwarderStats>,
    addresses: Vec<(String, SocketAddr)>,
    shutdown: watch::Sender<bool>,
}

impl RunningRelay {
    /// Bound UDP address of each channel, by channel id.
    pub fn channel_addrs(&self) -> &[(String, SocketAddr)] {
        &self.addresses
    }

    pub fn channel_addr(&self, id: &str) -> Option<SocketAddr> {
        self.addresses
            .iter()
            .find(|(channel, _)| channel == id)
            .map(|(_, addr)| *addr)
    }

    pub fn channelizers(&self) -> &[Channelizer] {
        &self.channelizers
    }

    /// Waits until every channel task has finished. A channel stopping on
    /// its own is logged and does not affect the others.
    pub async fn wait_channels(&mut self) {
        while let Some(joined) = self.channel_tasks.join_next().await {
            log_channel_exit(joined);
        }
    }

    /// Stops the listeners, drains the forwarders and stops the channelizers.
    pub async fn shutdown(mut self) {
        self.shutdown.send_replace(true);
        self.wait_channels().await;

        while let Some(joined) = self.forwarder_tasks.join_next().await {
            match joined {
                Ok(stats) => debug!(
                    transmissions = stats.transmissions,
                    samples = stats.samples,
                    errors = stats.errors,
                    "Forwarder drained"
                ),
                Err(e) => error!(error = %e, "Forwarder task failed"),
            }
        }

        stop_all(&self.channelizers).await;
        for logger in self.loggers.drain(..) {
            if let Err(e) = logger.await {
                warn!(error = %e, "Channelizer event logger failed");
            }
        }
        info!("Relay stopped");
    }
}

/// Waits for the first lifecycle event and requires it to be `READY`.
async fn wait_ready(channelizer: &Channelizer, events: &mut ProcessEvents) -> Result<()> {
    let name = channelizer.name().to_string();
    match events.next().await {
        Some(event) if event.kind == ProcessEventKind::Ready => {
            info!(channelizer = %name, event = %event, "Channelizer ready");
            Ok(())
        }
        Some(event) => {
            error!(channelizer = %name, event = %event, "Channelizer not ready");
            Err(RelayError::UpstreamNotReady {
                name,
                reason: event.to_string(),
            })
        }
        None => Err(RelayError::UpstreamNotReady {
            name,
            reason: "event queue closed".to_string(),
        }),
    }
}

async fn stop_all(channelizers: &[Channelizer]) {
    for channelizer in channelizers {
        channelizer.stop();
    }
    for channelizer in channelizers {
        channelizer.wait_exit().await;
        debug!(channelizer = channelizer.name(), "Channelizer stopped");
    }
}

fn log_channel_exit(joined: std::result::Result<(String, Result<()>), tokio::task::JoinError>) {
    match joined {
        Ok((id, Ok(()))) => debug!(channel = %id, "Channel stopped"),
        Ok((id, Err(e))) => error!(channel = %id, error = %e, "Channel failed"),
        Err(e) => error!(error = %e, "Channel task panicked"),
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Received SIGINT");
        }
        res = wait_for_sigterm() => {
            if let Err(e) = res {
                error!(error = %e, "Failed to register SIGTERM handler");
            }
            info!("Received SIGTERM");
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| RelayError::Other(format!("Failed to register SIGTERM handler: {}", e)))?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}
