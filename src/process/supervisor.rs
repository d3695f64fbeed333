//! Supervision of one long-running external process.
//!
//! The supervisor spawns the program with both output pipes captured, reads
//! them line by line on separate tasks, and reports lifecycle transitions
//! through a single ordered [`ProcessEvents`] queue:
//!
//! - `READY` once, on the first line any readiness pattern accepts
//! - `READY_TIMEOUT` if nothing matched within the ready timeout (the
//!   process keeps running)
//! - `EXCEPTION` when a pipe cannot be read; only that reader stops
//! - `EXIT` exactly once, with the exit code, after the readers finish or
//!   a short drain period has passed

use crate::defaults;
use crate::error::{RelayError, Result};
use crate::process::event::{OutputLine, OutputStream, ProcessEvent, ProcessEvents};
use crate::process::readiness::ReadinessDetector;
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Coarse process state. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Ready,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Pending,
    TimedOut,
    Ready,
}

struct Shared {
    name: String,
    detector: Box<dyn ReadinessDetector>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    output: Option<mpsc::UnboundedSender<OutputLine>>,
    // Held while emitting READY/READY_TIMEOUT so the queue order matches the
    // order of the state changes.
    readiness: Mutex<Readiness>,
    lifecycle: watch::Sender<Lifecycle>,
    stop: watch::Sender<bool>,
    started_at: OnceLock<Instant>,
}

impl Shared {
    fn emit(&self, event: ProcessEvent) {
        debug!(process = %self.name, event = %event, "Process event");
        if self.events.send(event).is_err() {
            trace!(process = %self.name, "Event receiver dropped");
        }
    }

    fn readiness(&self) -> std::sync::MutexGuard<'_, Readiness> {
        self.readiness
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_ready(&self) -> bool {
        *self.readiness() == Readiness::Ready
    }

    fn check_ready(&self, line: &str, stream: OutputStream) {
        let mut state = self.readiness();
        if *state == Readiness::Ready {
            return;
        }
        if let Some(matched) = self.detector.detect(line) {
            *state = Readiness::Ready;
            self.emit(ProcessEvent::ready(line, stream, &matched));
            self.lifecycle.send_if_modified(|s| {
                if *s == Lifecycle::Starting {
                    *s = Lifecycle::Ready;
                    true
                } else {
                    false
                }
            });
        }
    }

    fn ready_timed_out(&self, timeout: Duration) {
        let mut state = self.readiness();
        if *state == Readiness::Pending {
            *state = Readiness::TimedOut;
            warn!(process = %self.name, timeout = %humantime::format_duration(timeout), "Process not ready in time");
            self.emit(ProcessEvent::ready_timeout(timeout));
        }
    }

    fn forward_line(&self, stream: OutputStream, line: String) {
        match &self.output {
            Some(output) => {
                if output.send(OutputLine { stream, line }).is_err() {
                    trace!(process = %self.name, "Output receiver dropped");
                }
            }
            None => trace!(process = %self.name, stream = stream.as_str(), "{}", line),
        }
    }
}

/// Launches and monitors one external process.
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    ready_timeout: Option<Duration>,
}

impl ProcessSupervisor {
    /// Creates a supervisor and the receiver for its lifecycle events.
    pub fn new(
        name: impl Into<String>,
        detector: impl ReadinessDetector + 'static,
    ) -> (Self, ProcessEvents) {
        Self::build(name.into(), Box::new(detector), None)
    }

    /// Like [`new`](Self::new), also forwarding every output line to `output`.
    pub fn with_output(
        name: impl Into<String>,
        detector: impl ReadinessDetector + 'static,
        output: mpsc::UnboundedSender<OutputLine>,
    ) -> (Self, ProcessEvents) {
        Self::build(name.into(), Box::new(detector), Some(output))
    }

    fn build(
        name: String,
        detector: Box<dyn ReadinessDetector>,
        output: Option<mpsc::UnboundedSender<OutputLine>>,
    ) -> (Self, ProcessEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = watch::channel(Lifecycle::Starting);
        let (stop, _) = watch::channel(false);
        let supervisor = Self {
            shared: Arc::new(Shared {
                name,
                detector,
                events: events_tx,
                output,
                readiness: Mutex::new(Readiness::Pending),
                lifecycle,
                stop,
                started_at: OnceLock::new(),
            }),
            ready_timeout: None,
        };
        (supervisor, ProcessEvents::new(events_rx))
    }

    /// Emit `READY_TIMEOUT` if not ready this long after spawn.
    pub fn with_ready_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Spawns the process and its reader and monitor tasks, then returns.
    ///
    /// A spawn failure is returned to the caller. A supervisor runs one
    /// process instance; spawning twice is an error.
    pub fn spawn(&self, program: &str, args: &[String]) -> Result<()> {
        if self.shared.started_at.get().is_some() {
            return Err(RelayError::ProcessSpawn {
                program: program.to_string(),
                message: "supervisor already started a process".to_string(),
            });
        }

        debug!(process = %self.shared.name, "Command: {} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::ProcessSpawn {
                program: program.to_string(),
                message: e.to_string(),
            })?;
        self.shared.started_at.get_or_init(Instant::now);
        info!(process = %self.shared.name, pid = ?child.id(), "Process started");

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_stream(
                stdout,
                OutputStream::Stdout,
                Arc::clone(&self.shared),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_stream(
                stderr,
                OutputStream::Stderr,
                Arc::clone(&self.shared),
            )));
        }

        tokio::spawn(monitor(
            child,
            readers,
            Arc::clone(&self.shared),
            self.ready_timeout,
        ));
        Ok(())
    }

    /// Spawns the process and waits until it is ready or has exited.
    pub async fn run(&self, program: &str, args: &[String]) -> Result<Lifecycle> {
        self.spawn(program, args)?;
        Ok(self.wait_for(|state| state != Lifecycle::Starting).await)
    }

    /// Waits for the process to exit. Returns immediately if never spawned.
    pub async fn wait_exit(&self) {
        if self.shared.started_at.get().is_none() {
            return;
        }
        self.wait_for(|state| state == Lifecycle::Exited).await;
    }

    async fn wait_for(&self, accept: impl Fn(Lifecycle) -> bool) -> Lifecycle {
        let mut rx = self.shared.lifecycle.subscribe();
        match rx.wait_for(|state| accept(*state)).await {
            Ok(state) => *state,
            Err(_) => Lifecycle::Exited,
        }
    }

    /// Requests termination. Safe to call repeatedly, before spawn or after
    /// the process has exited.
    pub fn stop(&self) {
        self.shared.stop.send_modify(|stop| *stop = true);
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.shared.lifecycle.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    /// Time since the process was spawned.
    pub fn runtime(&self) -> Option<Duration> {
        self.shared.started_at.get().map(Instant::elapsed)
    }
}

async fn read_stream<R>(pipe: R, stream: OutputStream, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).split(b'\n');
    let mut stop = shared.stop.subscribe();

    loop {
        if *stop.borrow_and_update() {
            break;
        }
        let segment = tokio::select! {
            segment = lines.next_segment() => segment,
            _ = stop.changed() => continue,
        };
        match segment {
            Ok(Some(bytes)) => {
                let line = String::from_utf8_lossy(&bytes).trim().to_string();
                shared.check_ready(&line, stream);
                shared.forward_line(stream, line);
            }
            Ok(None) => break,
            Err(e) => {
                error!(process = %shared.name, stream = stream.as_str(), error = %e, "Failed to read process output");
                shared.emit(ProcessEvent::exception(
                    format!("failed to read {}: {}", stream.as_str(), e),
                    Some(stream),
                ));
                break;
            }
        }
    }
    trace!(process = %shared.name, stream = stream.as_str(), "Reader finished");
}

async fn monitor(
    mut child: Child,
    mut readers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    ready_timeout: Option<Duration>,
) {
    let mut stop = shared.stop.subscribe();
    let ready_deadline = ready_timeout.map(|t| tokio::time::Instant::now() + t);
    let mut timer_armed = ready_deadline.is_some();
    let mut kill_sent = false;

    let status = loop {
        if !kill_sent && *stop.borrow_and_update() {
            kill_sent = true;
            debug!(process = %shared.name, "Stop requested, killing process");
            if let Err(e) = child.start_kill() {
                warn!(process = %shared.name, error = %e, "Failed to kill process");
            }
        }

        tokio::select! {
            status = child.wait() => break status,
            _ = tokio::time::sleep_until(ready_deadline.unwrap_or_else(tokio::time::Instant::now)), if timer_armed => {
                timer_armed = false;
                if let Some(timeout) = ready_timeout {
                    shared.ready_timed_out(timeout);
                }
            }
            changed = stop.changed(), if !kill_sent => {
                if changed.is_err() {
                    kill_sent = true;
                }
            }
        }
    };

    // Output of a background child keeps the pipes open past our exit.
    let drained =
        tokio::time::timeout(defaults::OUTPUT_DRAIN_TIMEOUT, join_readers(&mut readers, &shared))
            .await;
    if drained.is_err() {
        warn!(process = %shared.name, "Output pipes still open after exit, abandoning readers");
        for reader in &readers {
            reader.abort();
        }
    }

    let code = match status {
        Ok(status) => {
            info!(process = %shared.name, status = %status, "Process exited");
            status.code()
        }
        Err(e) => {
            error!(process = %shared.name, error = %e, "Failed to wait for process");
            shared.emit(ProcessEvent::exception(
                format!("failed to wait for process: {}", e),
                None,
            ));
            None
        }
    };

    shared.emit(ProcessEvent::exit(code));
    shared.lifecycle.send_replace(Lifecycle::Exited);
}

async fn join_readers(readers: &mut [JoinHandle<()>], shared: &Shared) {
    for reader in readers.iter_mut() {
        if let Err(e) = reader.await {
            error!(process = %shared.name, error = %e, "Output reader task failed");
        }
    }
}
