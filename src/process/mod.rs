//! External process supervision.

pub mod channelizer;
pub mod event;
pub mod readiness;
pub mod supervisor;

pub use channelizer::Channelizer;
pub use event::{OutputLine, OutputStream, ProcessEvent, ProcessEventKind, ProcessEvents};
pub use readiness::{ReadinessDetector, RegexReadinessDetector};
pub use supervisor::{Lifecycle, ProcessSupervisor};
