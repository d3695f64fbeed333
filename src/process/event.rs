//! Lifecycle events reported by a supervised process.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEventKind {
    Ready,
    ReadyTimeout,
    Exception,
    Exit,
}

impl fmt::Display for ProcessEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessEventKind::Ready => "READY",
            ProcessEventKind::ReadyTimeout => "READY_TIMEOUT",
            ProcessEventKind::Exception => "EXCEPTION",
            ProcessEventKind::Exit => "EXIT",
        };
        f.write_str(s)
    }
}

/// Which output pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// One line of process output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// A lifecycle transition. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEvent {
    pub kind: ProcessEventKind,
    pub message: Option<String>,
    pub args: BTreeMap<String, String>,
}

impl ProcessEvent {
    fn new(kind: ProcessEventKind, message: Option<String>) -> Self {
        Self {
            kind,
            message,
            args: BTreeMap::new(),
        }
    }

    fn with_arg(mut self, key: &str, value: impl ToString) -> Self {
        self.args.insert(key.to_string(), value.to_string());
        self
    }

    /// Readiness matched on `line`.
    pub fn ready(line: &str, stream: OutputStream, matched: &str) -> Self {
        Self::new(ProcessEventKind::Ready, Some(line.to_string()))
            .with_arg("stream", stream.as_str())
            .with_arg("pattern", matched)
    }

    pub fn ready_timeout(timeout: Duration) -> Self {
        Self::new(
            ProcessEventKind::ReadyTimeout,
            Some(format!(
                "no readiness pattern matched within {}",
                humantime::format_duration(timeout)
            )),
        )
        .with_arg("timeout_secs", timeout.as_secs_f64())
    }

    pub fn exception(message: impl Into<String>, stream: Option<OutputStream>) -> Self {
        let event = Self::new(ProcessEventKind::Exception, Some(message.into()));
        match stream {
            Some(stream) => event.with_arg("stream", stream.as_str()),
            None => event,
        }
    }

    /// Process exited. `code` is `None` when it was killed by a signal.
    pub fn exit(code: Option<i32>) -> Self {
        match code {
            Some(code) => Self::new(ProcessEventKind::Exit, None).with_arg("return_code", code),
            None => Self::new(
                ProcessEventKind::Exit,
                Some("terminated by signal".to_string()),
            ),
        }
    }

    pub fn return_code(&self) -> Option<i32> {
        self.args.get("return_code").and_then(|c| c.parse().ok())
    }
}

impl fmt::Display for ProcessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        for (key, value) in &self.args {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Ordered receiver for a supervisor's lifecycle events.
pub struct ProcessEvents {
    rx: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl ProcessEvents {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<ProcessEvent>) -> Self {
        Self { rx }
    }

    /// Waits for the next event. `None` once the supervisor is gone and the
    /// queue is drained.
    pub async fn next(&mut self) -> Option<ProcessEvent> {
        self.rx.recv().await
    }

    /// Returns an already queued event without waiting.
    pub fn try_next(&mut self) -> Option<ProcessEvent> {
        self.rx.try_recv().ok()
    }
}
