//! Forwarding of processed channel audio to the voice backend.

pub mod backend;
pub mod forwarder;

pub use backend::{CollectorBackend, UdpPcmBackend, VoiceBackend};
pub use forwarder::{ForwardItem, Forwarder, ForwarderStats, ForwarderTask};
