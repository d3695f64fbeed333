//! Signal processing for channel audio.

pub mod chain;
pub mod filter;
pub mod frame;
pub mod resample;

pub use chain::{FilterChain, FilterRole, TapPoint};
pub use filter::{FilterKind, StreamingFilter};
pub use frame::Frame;
pub use resample::{ResamplerFactory, SincResampler, StreamResampler};
