//! UDP listener feeding head-tracker poses into the player's gaze channel.

use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use serde::Deserialize;
use skull_sync_core::GazeChannel;

const READ_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
struct GazePacket {
    #[serde(default)]
    mode: String,
    neck: Option<NeckAngles>,
}

#[derive(Debug, Deserialize)]
struct NeckAngles {
    yaw_deg: f64,
    #[serde(default)]
    pitch_deg: f64,
}

/// Background listener; stops and joins when dropped.
pub struct GazeListener {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GazeListener {
    pub fn spawn(addr: SocketAddr, gaze: GazeChannel) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        tracing::info!(%addr, "gaze listener bound");

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("gaze-udp".into())
            .spawn(move || listen(socket, gaze, flag))?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }
}

impl Drop for GazeListener {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn listen(socket: UdpSocket, gaze: GazeChannel, running: Arc<AtomicBool>) {
    let mut buf = [0u8; 2048];
    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, _)) => {
                apply_packet(&buf[..len], &gaze);
            }
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(err) => {
                tracing::warn!(error = %err, "gaze socket error");
                thread::sleep(READ_TIMEOUT);
            }
        }
    }
}

/// Publishes the pose carried by `payload`. Returns whether it was used.
fn apply_packet(payload: &[u8], gaze: &GazeChannel) -> bool {
    let packet: GazePacket = match serde_json::from_slice(payload) {
        Ok(packet) => packet,
        Err(err) => {
            tracing::debug!(error = %err, "ignoring malformed gaze packet");
            return false;
        }
    };
    if packet.mode != "track" {
        return false;
    }
    let Some(neck) = packet.neck else {
        return false;
    };
    gaze.publish(neck.yaw_deg, neck.pitch_deg);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_packets_publish_a_pose() {
        let gaze = GazeChannel::default();
        let packet = br#"{"ts": 1700000000.5, "mode": "track", "neck": {"yaw_deg": -12.5, "pitch_deg": 3}}"#;

        assert!(apply_packet(packet, &gaze));
        let pose = gaze.current_pose().unwrap();
        assert_eq!(pose.pan_degrees, -12.5);
        assert_eq!(pose.tilt_degrees, 3.0);
    }

    #[test]
    fn other_modes_and_garbage_are_ignored() {
        let gaze = GazeChannel::default();
        assert!(!apply_packet(br#"{"mode": "idle", "neck": {"yaw_deg": 5}}"#, &gaze));
        assert!(!apply_packet(br#"{"mode": "track"}"#, &gaze));
        assert!(!apply_packet(b"not json", &gaze));
        assert!(gaze.latest().is_none());
    }
}
