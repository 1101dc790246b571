use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use pcap::{Active, Capture, Device, Linktype};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::models::flow::RawPacket;
use crate::utils::error::CaptureError;

/// Something that hands out captured frames one at a time
///
/// `Ok(None)` means the read timed out with nothing to deliver; the caller
/// decides whether to keep waiting.
pub trait FrameReader: Send {
    fn read_frame(&mut self) -> Result<Option<RawPacket>, CaptureError>;

    /// pcap DLT_* code of the frames
    fn link_type(&self) -> i32;
}

impl FrameReader for Capture<Active> {
    fn read_frame(&mut self) -> Result<Option<RawPacket>, CaptureError> {
        match self.next_packet() {
            Ok(packet) => {
                let header = *packet.header;
                if header.caplen as usize != packet.data.len() {
                    trace!(
                        "Packet length mismatch: header says {} but data is {} bytes",
                        header.caplen,
                        packet.data.len()
                    );
                }

                let timestamp = DateTime::<Utc>::from_timestamp(
                    header.ts.tv_sec as i64,
                    (header.ts.tv_usec as u32).saturating_mul(1000),
                )
                .unwrap_or_else(Utc::now);

                Ok(Some(RawPacket {
                    data: packet.data.to_vec(),
                    wire_len: header.len as usize,
                    timestamp,
                }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(pcap::Error::NoMorePackets) => Err(CaptureError::HandleClosed),
            Err(e) => Err(CaptureError::Read(e.to_string())),
        }
    }

    fn link_type(&self) -> i32 {
        self.get_datalink().0
    }
}

/// What one `read_next` produced
#[derive(Debug)]
pub enum ReadOutcome {
    Packet(RawPacket),
    /// The source was closed; reported exactly once
    EndOfCapture,
}

/// Cross-thread handle that closes a [`PacketSource`]
///
/// The blocked reader notices within one read timeout.
#[derive(Debug, Clone, Default)]
pub struct SourceCloser {
    closed: Arc<AtomicBool>,
}

impl SourceCloser {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// An open capture handle with cooperative close
pub struct PacketSource<R: FrameReader = Capture<Active>> {
    reader: Option<R>,
    closer: SourceCloser,
    interface: String,
    link_type: i32,
}

impl PacketSource<Capture<Active>> {
    /// Open `interface`, install `filter` if given, and start capturing
    pub fn open(
        interface: &str,
        filter: Option<&str>,
        snaplen: i32,
        timeout_ms: i32,
        promiscuous: bool,
    ) -> Result<Self, CaptureError> {
        info!(
            "Opening capture on {} (snaplen {}, timeout {}ms, promiscuous {})",
            interface, snaplen, timeout_ms, promiscuous
        );

        let mut capture = Capture::from_device(interface)
            .map_err(|e| open_error(interface, e))?
            .promisc(promiscuous)
            .snaplen(snaplen)
            .timeout(timeout_ms)
            .open()
            .map_err(|e| open_error(interface, e))?;

        if let Some(expr) = filter.map(str::trim).filter(|f| !f.is_empty()) {
            capture
                .filter(expr, true)
                .map_err(|e| CaptureError::FilterSyntax(e.to_string()))?;
            info!("Filter applied successfully: {}", expr);
        }

        Ok(Self::from_reader(interface, capture))
    }
}

impl<R: FrameReader> PacketSource<R> {
    /// Wrap an already open reader
    pub fn from_reader(interface: impl Into<String>, reader: R) -> Self {
        let link_type = reader.link_type();
        Self {
            reader: Some(reader),
            closer: SourceCloser::default(),
            interface: interface.into(),
            link_type,
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn link_type(&self) -> i32 {
        self.link_type
    }

    /// Handle for closing this source from another thread
    pub fn closer(&self) -> SourceCloser {
        self.closer.clone()
    }

    /// Block until a packet arrives or the source is closed
    ///
    /// After `EndOfCapture` has been returned every further call fails with
    /// [`CaptureError::HandleClosed`].
    pub fn read_next(&mut self) -> Result<ReadOutcome, CaptureError> {
        loop {
            if self.closer.is_closed() {
                return match self.reader.take() {
                    Some(_) => {
                        debug!("Capture handle on {} closed", self.interface);
                        Ok(ReadOutcome::EndOfCapture)
                    }
                    None => Err(CaptureError::HandleClosed),
                };
            }

            let reader = self.reader.as_mut().ok_or(CaptureError::HandleClosed)?;
            match reader.read_frame() {
                Ok(Some(packet)) => return Ok(ReadOutcome::Packet(packet)),
                Ok(None) => continue,
                // A savefile or driver running dry is the same as being closed
                Err(CaptureError::HandleClosed) => self.closer.close(),
                Err(e) => return Err(e),
            }
        }
    }

    /// Close from the owning thread
    pub fn close(&mut self) {
        self.closer.close();
        self.reader = None;
    }
}

/// Check that `expr` compiles before a session is started
///
/// A short-lived handle on any available interface gets the filter installed;
/// when no interface can be opened the expression is compiled against a dead
/// Ethernet handle instead.
pub async fn validate_filter(expr: &str) -> Result<(), CaptureError> {
    let expr = expr.trim().to_string();
    if expr.is_empty() {
        return Ok(());
    }

    tokio::task::spawn_blocking(move || validate_filter_blocking(&expr))
        .await
        .map_err(|e| CaptureError::Read(format!("filter validation task failed: {}", e)))?
}

fn validate_filter_blocking(expr: &str) -> Result<(), CaptureError> {
    let live = Device::lookup().ok().flatten().and_then(|device| {
        let name = device.name.clone();
        Capture::from_device(device)
            .and_then(|c| c.snaplen(256).timeout(10).open())
            .map_err(|e| debug!("Throwaway capture on {} unavailable: {}", name, e))
            .ok()
    });

    let result = match live {
        Some(mut capture) => capture.filter(expr, true),
        None => Capture::dead(Linktype::ETHERNET).and_then(|dead| dead.compile(expr, true).map(|_| ())),
    };

    result.map_err(|e| {
        warn!("Filter '{}' rejected: {}", expr, e);
        CaptureError::FilterSyntax(e.to_string())
    })
}

/// Classify an open failure by what libpcap reported
fn open_error(interface: &str, err: pcap::Error) -> CaptureError {
    let message = err.to_string();
    let lower = message.to_lowercase();

    if lower.contains("permission") || lower.contains("not permitted") || lower.contains("access is denied") {
        CaptureError::PermissionDenied(format!("{} ({})", interface, message))
    } else if lower.contains("no such device")
        || lower.contains("doesn't exist")
        || lower.contains("does not exist")
        || lower.contains("not found")
    {
        CaptureError::NotFound(interface.to_string())
    } else {
        CaptureError::Pcap(err)
    }
}
