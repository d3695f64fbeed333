//! Boundary to the downstream voice backend.

use crate::dsp::frame::pcm16_to_le_bytes;
use crate::error::{RelayError, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tracing::debug;

/// Upper bound on samples per datagram (40 ms at 48 kHz).
const MAX_DATAGRAM_SAMPLES: usize = 1920;

/// Consumer of forwarded PCM16 mono audio at the backend's sample rate.
///
/// The voice protocol behind it is the implementation's business; the relay
/// only hands over correctly resampled samples and transmission boundaries.
#[async_trait::async_trait]
pub trait VoiceBackend: Send {
    async fn add_samples(&mut self, pcm: &[i16]) -> Result<()>;

    /// The current transmission is over.
    async fn end_transmission(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Sends PCM16LE chunks as UDP datagrams, with an empty datagram marking
/// the end of each transmission.
pub struct UdpPcmBackend {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpPcmBackend {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let target = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| RelayError::Backend {
                message: format!("cannot resolve {}:{}: {}", host, port, e),
            })?
            .next()
            .ok_or_else(|| RelayError::Backend {
                message: format!("no address for {}:{}", host, port),
            })?;

        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| RelayError::UdpBind {
                address: local.to_string(),
                message: e.to_string(),
            })?;
        socket.connect(target).await?;
        debug!(remote = %target, "Voice backend socket ready");

        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

#[async_trait::async_trait]
impl VoiceBackend for UdpPcmBackend {
    async fn add_samples(&mut self, pcm: &[i16]) -> Result<()> {
        for chunk in pcm.chunks(MAX_DATAGRAM_SAMPLES) {
            self.socket
                .send(&pcm16_to_le_bytes(chunk))
                .await
                .map_err(|e| RelayError::Backend {
                    message: format!("send to {} failed: {}", self.target, e),
                })?;
        }
        Ok(())
    }

    async fn end_transmission(&mut self) -> Result<()> {
        self.socket
            .send(&[])
            .await
            .map_err(|e| RelayError::Backend {
                message: format!("send to {} failed: {}", self.target, e),
            })?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "udp-pcm"
    }
}

/// What a [`CollectorBackend`] has received.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Collected {
    pub samples: Vec<i16>,
    pub chunks: usize,
    pub transmissions: usize,
}

/// Collects forwarded audio in memory, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct CollectorBackend {
    collected: Arc<Mutex<Collected>>,
}

impl CollectorBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything received so far. Clones share the same store.
    pub fn collected(&self) -> Collected {
        self.collected
            .lock()
            .map(|c| c.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait::async_trait]
impl VoiceBackend for CollectorBackend {
    async fn add_samples(&mut self, pcm: &[i16]) -> Result<()> {
        let mut collected = self
            .collected
            .lock()
            .map_err(|_| RelayError::Backend {
                message: "collector lock poisoned".to_string(),
            })?;
        collected.samples.extend_from_slice(pcm);
        collected.chunks += 1;
        Ok(())
    }

    async fn end_transmission(&mut self) -> Result<()> {
        let mut collected = self
            .collected
            .lock()
            .map_err(|_| RelayError::Backend {
                message: "collector lock poisoned".to_string(),
            })?;
        collected.transmissions += 1;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "collector"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_backend_is_object_safe() {
        let _backend: Box<dyn VoiceBackend> = Box::new(CollectorBackend::new());
    }

    #[tokio::test]
    async fn collector_records_samples_and_boundaries() {
        let collector = CollectorBackend::new();
        let mut backend = collector.clone();

        backend.add_samples(&[1, 2, 3]).await.unwrap();
        backend.add_samples(&[4]).await.unwrap();
        backend.end_transmission().await.unwrap();

        let collected = collector.collected();
        assert_eq!(collected.samples, vec![1, 2, 3, 4]);
        assert_eq!(collected.chunks, 2);
        assert_eq!(collected.transmissions, 1);
    }

    #[tokio::test]
    async fn udp_backend_sends_le_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let mut backend = UdpPcmBackend::connect("127.0.0.1", port).await.unwrap();
        assert_eq!(backend.name(), "udp-pcm");

        backend.add_samples(&[1, -2]).await.unwrap();
        backend.end_transmission().await.unwrap();

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x01, 0x00, 0xFE, 0xFF]);
        let n = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn udp_backend_splits_long_chunks() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let mut backend = UdpPcmBackend::connect("127.0.0.1", port).await.unwrap();

        backend
            .add_samples(&vec![0i16; MAX_DATAGRAM_SAMPLES + 10])
            .await
            .unwrap();

        let mut buf = vec![0u8; 8192];
        assert_eq!(receiver.recv(&mut buf).await.unwrap(), MAX_DATAGRAM_SAMPLES * 2);
        assert_eq!(receiver.recv(&mut buf).await.unwrap(), 20);
    }
}
