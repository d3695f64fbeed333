//! The SDR channelizer program that feeds the channel UDP streams.

use crate::config::ChannelizerConfig;
use crate::error::Result;
use crate::process::event::{OutputLine, OutputStream, ProcessEventKind, ProcessEvents};
use crate::process::readiness::RegexReadinessDetector;
use crate::process::supervisor::ProcessSupervisor;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Argument list for a channelizer: the configured override, or
/// `-F -c <config_file>` (foreground, explicit config).
pub fn command_args(config: &ChannelizerConfig) -> Vec<String> {
    match &config.args {
        Some(args) => args.clone(),
        None => vec![
            "-F".to_string(),
            "-c".to_string(),
            config.config_file.display().to_string(),
        ],
    }
}

/// A supervised channelizer process.
pub struct Channelizer {
    config: ChannelizerConfig,
    supervisor: ProcessSupervisor,
    output: Option<mpsc::UnboundedReceiver<OutputLine>>,
}

impl Channelizer {
    /// Prepares the supervisor. Nothing is spawned until [`start`](Self::start).
    pub fn new(config: ChannelizerConfig) -> Result<(Self, ProcessEvents)> {
        let detector = RegexReadinessDetector::new(config.ready_patterns.as_slice())?;
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (supervisor, events) =
            ProcessSupervisor::with_output(config.display_name(), detector, output_tx);
        let supervisor = supervisor.with_ready_timeout(config.ready_timeout());

        Ok((
            Self {
                config,
                supervisor,
                output: Some(output_rx),
            },
            events,
        ))
    }

    pub fn name(&self) -> &str {
        self.supervisor.name()
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Spawns the program and a task logging its output.
    pub fn start(&mut self) -> Result<()> {
        let args = command_args(&self.config);
        self.supervisor.spawn(&self.config.program, &args)?;
        if let Some(output) = self.output.take() {
            tokio::spawn(log_output(self.name().to_string(), output));
        }
        Ok(())
    }

    /// Kills the program. Idempotent.
    pub fn stop(&self) {
        self.supervisor.stop();
    }

    pub async fn wait_exit(&self) {
        self.supervisor.wait_exit().await;
    }
}

async fn log_output(name: String, mut output: mpsc::UnboundedReceiver<OutputLine>) {
    while let Some(line) = output.recv().await {
        match line.stream {
            OutputStream::Stdout => {
                debug!(target: "airband_relay::channelizer", channelizer = %name, "{}", line.line)
            }
            OutputStream::Stderr => {
                info!(target: "airband_relay::channelizer", channelizer = %name, "{}", line.line)
            }
        }
    }
}

/// Logs the remaining lifecycle events of a channelizer until its queue closes.
pub fn spawn_event_logger(name: String, mut events: ProcessEvents) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event.kind {
                ProcessEventKind::Ready => info!(channelizer = %name, event = %event, "Channelizer ready"),
                ProcessEventKind::ReadyTimeout => warn!(channelizer = %name, event = %event, "Channelizer readiness timed out"),
                ProcessEventKind::Exception => error!(channelizer = %name, event = %event, "Channelizer error"),
                ProcessEventKind::Exit => {
                    match event.return_code() {
                        Some(0) => info!(channelizer = %name, "Channelizer exited"),
                        _ => warn!(channelizer = %name, event = %event, "Channelizer exited abnormally"),
                    }
                    break;
                }
            }
        }
    })
}
