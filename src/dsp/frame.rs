//! Frame type moving through the channel pipeline.

/// A chunk of mono f32 samples tagged with the session it belongs to.
///
/// `session_id` and `sample_rate` are fixed at creation. `samples` is
/// rewritten by each filter stage, so any consumer that keeps a frame past
/// the current processing step must copy it (see [`Frame::clone`]).
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    session_id: u64,
    sample_rate: u32,
    pub samples: Vec<f32>,
}

impl Frame {
    /// Creates a new frame.
    pub fn new(session_id: u64, sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            session_id,
            sample_rate,
            samples,
        }
    }

    /// Decodes a datagram of little-endian f32 samples.
    ///
    /// Returns `None` if the byte length is not a multiple of 4.
    pub fn from_le_bytes(session_id: u64, sample_rate: u32, data: &[u8]) -> Option<Self> {
        if data.len() % 4 != 0 {
            return None;
        }
        let samples = data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Some(Self::new(session_id, sample_rate, samples))
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// Duration of the frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Converts float samples to 16-bit PCM as `sample * 32767`.
///
/// Values are not clamped to [-1, 1] first; the float-to-int cast saturates
/// at the i16 range.
pub fn to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| (s * 32767.0) as i16).collect()
}

/// Serializes PCM samples as little-endian bytes.
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
