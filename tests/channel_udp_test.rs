//! End-to-end relay over loopback UDP: datagrams in, WAV archive and
//! backend PCM out.

use airband_relay::config::{AppConfig, BackendConfig, ChannelConfig};
use airband_relay::manager::ChannelManager;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UdpSocket;

const RATE: u32 = 16000;

fn tone(len: usize, amplitude: f32) -> Vec<f32> {
    (0..len)
        .map(|i| (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / RATE as f32).sin() * amplitude)
        .collect()
}

fn datagram(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn wav_files(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                dirs.push(path);
            } else if path.extension().is_some_and(|e| e == "wav") {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

/// Receives PCM16 datagrams until the empty end-of-transmission datagram.
async fn receive_transmission(backend: &UdpSocket) -> Vec<i16> {
    let mut buf = vec![0u8; 65536];
    let mut pcm = Vec::new();
    loop {
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), backend.recv_from(&mut buf))
            .await
            .expect("backend timed out")
            .unwrap();
        if len == 0 {
            return pcm;
        }
        pcm.extend(
            buf[..len]
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]])),
        );
    }
}

fn config(store: &TempDir, backend: SocketAddr, backend_rate: u32) -> AppConfig {
    let mut config = AppConfig::default();
    config.data_store_path = store.path().to_path_buf();
    config.ptt_timeout_ms = 60;
    config.disk_writer.minimum_record_secs = 0.1;
    config.backend = Some(BackendConfig {
        remote_host: backend.ip().to_string(),
        remote_port: backend.port(),
        sample_rate: backend_rate,
        debug_capture: false,
    });
    config
}

fn channel(freq: f64, designator: Option<&str>) -> ChannelConfig {
    let mut channel = ChannelConfig::new(freq);
    channel.mode = Some("fm".to_string());
    channel.udp_port = Some(0);
    channel.designator = designator.map(str::to_string);
    channel
}

#[tokio::test]
async fn transmission_is_archived_and_forwarded_with_gain() {
    let store = TempDir::new().unwrap();
    let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = config(&store, backend.local_addr().unwrap(), RATE);
    config.channels = vec![channel(154.43, Some("16K0F3E"))];

    let manager = ChannelManager::from_config(config).unwrap();
    let relay = manager.start().await.unwrap();
    let addr = relay.channel_addr("fm_154430").unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let input = tone(8000, 0.3);
    for chunk in input.chunks(2000) {
        sender.send_to(&datagram(chunk), addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let forwarded = receive_transmission(&backend).await;
    relay.shutdown().await;

    let files = wav_files(store.path());
    assert_eq!(files.len(), 1, "expected one archive file, got {:?}", files);
    let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("fm_154430_") && name.ends_with(".wav"));

    let reader = hound::WavReader::open(&files[0]).unwrap();
    assert_eq!(reader.spec().sample_rate, RATE);
    let archived: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(archived.len(), 8000);
    assert_eq!(forwarded.len(), 8000);

    // 16K0F3E forwards at 1.5x; the archive stays at unity gain.
    let peak_archived = archived.iter().map(|s| s.unsigned_abs()).max().unwrap() as f32;
    let peak_forwarded = forwarded.iter().map(|s| s.unsigned_abs()).max().unwrap() as f32;
    let ratio = peak_forwarded / peak_archived;
    assert!((ratio - 1.5).abs() < 0.01, "gain ratio {}", ratio);
}

#[tokio::test]
async fn forwarded_audio_is_resampled_to_backend_rate() {
    let store = TempDir::new().unwrap();
    let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = config(&store, backend.local_addr().unwrap(), 48000);
    config.disk_writer.enabled = false;
    config.channels = vec![channel(460.1, None)];

    let manager = ChannelManager::from_config(config).unwrap();
    let relay = manager.start().await.unwrap();
    let addr = relay.channel_addr("fm_460100").unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for chunk in tone(8000, 0.3).chunks(2000) {
        sender.send_to(&datagram(chunk), addr).await.unwrap();
    }

    let forwarded = receive_transmission(&backend).await;
    relay.shutdown().await;

    // The resampler is flushed at session end, so nothing is cut off.
    assert_eq!(forwarded.len(), 24000);
    assert!(wav_files(store.path()).is_empty());
}

#[tokio::test]
async fn short_transmission_is_forwarded_but_not_archived() {
    let store = TempDir::new().unwrap();
    let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = config(&store, backend.local_addr().unwrap(), RATE);
    config.disk_writer.minimum_record_secs = 1.0;
    config.channels = vec![channel(154.43, None)];

    let manager = ChannelManager::from_config(config).unwrap();
    let relay = manager.start().await.unwrap();
    let addr = relay.channel_addr("fm_154430").unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(&datagram(&tone(2000, 0.3)), addr).await.unwrap();

    let forwarded = receive_transmission(&backend).await;
    relay.shutdown().await;

    assert_eq!(forwarded.len(), 2000);
    assert!(wav_files(store.path()).is_empty());
}

#[tokio::test]
async fn malformed_datagram_stops_only_its_channel() {
    let store = TempDir::new().unwrap();
    let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = config(&store, backend.local_addr().unwrap(), RATE);
    config.disk_writer.enabled = false;
    config.channels = vec![channel(154.43, None), channel(155.01, None)];

    let manager = ChannelManager::from_config(config).unwrap();
    let relay = manager.start().await.unwrap();
    let broken = relay.channel_addr("fm_154430").unwrap();
    let healthy = relay.channel_addr("fm_155010").unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(&[0u8; 10], broken).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    sender.send_to(&datagram(&tone(1000, 0.3)), healthy).await.unwrap();

    let forwarded = receive_transmission(&backend).await;
    relay.shutdown().await;

    assert_eq!(forwarded.len(), 1000);
}
