//! airband-relay - Push-to-talk radio channel relay
//!
//! Receives channelized radio audio over UDP, splits it into transmissions,
//! filters it, archives each transmission as WAV and forwards it to a voice
//! backend.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod channel;
pub mod cli;
pub mod config;
pub mod defaults;
pub mod dsp;
pub mod error;
pub mod forward;
pub mod manager;
pub mod process;
pub mod radio;
pub mod recording;
pub mod session;

// Channel pipeline
pub use channel::{BoundChannel, ChannelProcessor, SessionEvent};
pub use manager::{ChannelManager, RunningRelay};
pub use session::{Clock, Session, SessionTracker, SystemClock};

// Processing
pub use dsp::{FilterChain, Frame, StreamResampler, StreamingFilter, TapPoint};
pub use forward::{CollectorBackend, Forwarder, UdpPcmBackend, VoiceBackend};
pub use recording::ChannelDiskWriter;

// Upstream processes
pub use process::{Channelizer, ProcessEvent, ProcessEventKind, ProcessSupervisor, ReadinessDetector};

// Error handling
pub use error::{RelayError, Result};

// Config
pub use config::{AppConfig, ResolvedChannel};

/// Build version string with optional git commit hash.
///
/// Returns `"0.2.3+abc1234"` when git hash is available, `"0.2.3"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
