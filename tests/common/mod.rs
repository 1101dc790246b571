#![allow(dead_code)]

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use nettally::attribution::{ConnectionEnumerator, SocketOwner};
use nettally::capture::source::FrameReader;
use nettally::models::flow::{ProcessIdentity, Protocol, RawPacket};
use nettally::utils::error::CaptureError;

pub const LOCAL: [u8; 4] = [192, 168, 1, 10];
pub const REMOTE: [u8; 4] = [93, 184, 216, 34];

/// Ethernet + IPv4 + TCP/UDP frame, zero padded to `len` bytes
pub fn ipv4_frame(src: [u8; 4], dst: [u8; 4], proto: u8, sport: u16, dport: u16, len: usize) -> Vec<u8> {
    let mut frame = vec![0u8; 12];
    frame.extend_from_slice(&[0x08, 0x00]);
    frame.extend_from_slice(&[0x45, 0, 0, 40, 0, 0, 0x40, 0, 64, proto, 0, 0]);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&dst);
    frame.extend_from_slice(&sport.to_be_bytes());
    frame.extend_from_slice(&dport.to_be_bytes());
    frame.extend_from_slice(&[0u8; 16]);
    if frame.len() < len {
        frame.resize(len, 0);
    }
    frame
}

pub fn outbound_tcp(len: usize) -> RawPacket {
    RawPacket::new(ipv4_frame(LOCAL, REMOTE, 6, 40000, 443, len))
}

/// Frames pushed by the test through a channel; silence reads as a timeout
pub struct ChannelReader {
    rx: Receiver<RawPacket>,
    timeout: Duration,
}

impl FrameReader for ChannelReader {
    fn read_frame(&mut self) -> Result<Option<RawPacket>, CaptureError> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(packet) => Ok(Some(packet)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::HandleClosed),
        }
    }

    fn link_type(&self) -> i32 {
        1
    }
}

pub fn channel_reader(timeout: Duration) -> (Sender<RawPacket>, ChannelReader) {
    let (tx, rx) = mpsc::channel();
    (tx, ChannelReader { rx, timeout })
}

/// Delivers frames for a while, then every read fails as if the device vanished
pub struct VanishingReader {
    pub frames_left: usize,
}

impl FrameReader for VanishingReader {
    fn read_frame(&mut self) -> Result<Option<RawPacket>, CaptureError> {
        if self.frames_left == 0 {
            std::thread::sleep(Duration::from_millis(5));
            return Err(CaptureError::Read("The interface went down".to_string()));
        }
        self.frames_left -= 1;
        Ok(Some(outbound_tcp(100)))
    }

    fn link_type(&self) -> i32 {
        1
    }
}

/// Always reports the same sockets
pub struct FixedSockets(pub Vec<SocketOwner>);

impl ConnectionEnumerator for FixedSockets {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn enumerate(&self) -> anyhow::Result<Vec<SocketOwner>> {
        Ok(self.0.clone())
    }
}

pub fn socket(addr: [u8; 4], port: u16, pid: u32, name: &str) -> SocketOwner {
    SocketOwner {
        local_addr: addr.into(),
        local_port: port,
        protocol: Protocol::Tcp,
        process: ProcessIdentity {
            pid,
            name: name.to_string(),
        },
    }
}
