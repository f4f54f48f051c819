//! Virtual Interface Adapter
//!
//! Wraps the host's TUN descriptor as a packet device. Outbound packets
//! (tunnel -> host) can be redirected through a caller-supplied
//! [`PacketSink`] instead of the raw descriptor; inbound packets
//! (host -> tunnel) are read from the descriptor or, in queued mode, from a
//! bounded [`PacketQueue`] the host fills.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, trace};

/// Host-side writer for packets leaving the tunnel
///
/// Delivery failures are the sink's own concern; they never tear the
/// tunnel down.
pub trait PacketSink: Send + Sync {
    /// Deliver one IP packet to the host interface
    fn write_packet(&self, packet: &[u8]);
}

/// Host descriptor for the virtual interface
///
/// The bridge takes ownership only when a start succeeds; until then the
/// descriptor stays the caller's to close.
#[derive(Debug)]
pub struct TunHandle {
    fd: RawFd,
}

impl TunHandle {
    /// Wrap a raw descriptor received from the host.
    ///
    /// # Safety
    ///
    /// `fd` must be an open descriptor the caller is willing to hand over:
    /// once a start using this handle succeeds, the bridge closes it at
    /// teardown and nothing else may close or reuse it meanwhile.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    /// The wrapped descriptor number
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Take ownership of the descriptor
    pub(crate) fn attach(self) -> io::Result<File> {
        if self.fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid TUN descriptor {}", self.fd),
            ));
        }
        // SAFETY: the constructor's contract hands ownership of `fd` to us.
        Ok(unsafe { File::from_raw_fd(self.fd) })
    }
}

/// Where inbound packets come from
enum Inbound {
    /// Blocking reads on the descriptor
    Handle,
    /// Packets pushed by the host through a [`PacketQueue`]
    Queue(Receiver<Vec<u8>>),
}

/// Packet-oriented view of the host TUN descriptor
pub struct TunDevice {
    /// Underlying descriptor, `None` once closed. In-flight calls hold
    /// their own clone, so the fd closes when the last of them returns.
    file: RwLock<Option<Arc<File>>>,
    /// Largest packet read in one call
    mtu: usize,
    /// Inbound packet source
    inbound: Inbound,
    /// Optional outbound redirection
    sink: Option<Arc<dyn PacketSink>>,
    /// Set by the first close
    closed: AtomicBool,
}

impl TunDevice {
    /// Wrap an open descriptor
    pub fn new(file: File, mtu: usize, sink: Option<Arc<dyn PacketSink>>) -> Self {
        Self {
            file: RwLock::new(Some(Arc::new(file))),
            mtu,
            inbound: Inbound::Handle,
            sink,
            closed: AtomicBool::new(false),
        }
    }

    /// Read inbound packets from a host-filled queue instead of the descriptor
    pub fn with_inbound_queue(mut self, rx: Receiver<Vec<u8>>) -> Self {
        self.inbound = Inbound::Queue(rx);
        self
    }

    /// Configured MTU
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Whether outbound packets go through a sink
    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Block until one packet is available and copy it into `buf`.
    ///
    /// Reads at most `min(buf.len(), mtu)` bytes and returns the exact count.
    /// Any error is fatal for the current run.
    pub fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let limit = buf.len().min(self.mtu);

        match &self.inbound {
            Inbound::Queue(rx) => {
                let packet = rx.recv().map_err(|_| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "inbound queue closed")
                })?;
                let n = packet.len().min(limit);
                buf[..n].copy_from_slice(&packet[..n]);
                trace!("Read {} bytes from inbound queue", n);
                Ok(n)
            }
            Inbound::Handle => {
                let file = self.file()?;
                let n = (&*file).read(&mut buf[..limit])?;
                if n == 0 && limit > 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "TUN descriptor closed by host",
                    ));
                }
                trace!("Read {} bytes from TUN", n);
                Ok(n)
            }
        }
    }

    /// Deliver one packet to the host.
    ///
    /// With a sink, the sink gets the packet and this always succeeds;
    /// otherwise the packet is written to the descriptor.
    pub fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }

        if let Some(sink) = &self.sink {
            sink.write_packet(packet);
            return Ok(());
        }

        let file = self.file()?;
        (&*file).write_all(packet)
    }

    /// Clone of the descriptor, taken without holding the lock across I/O
    fn file(&self) -> io::Result<Arc<File>> {
        self.file
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(closed_error)
    }

    /// Close the descriptor. Later calls are no-ops.
    ///
    /// Never waits for I/O in progress on other threads; a read blocked at
    /// this point keeps the fd open until it returns.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let file = self
            .file
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(file);
        debug!("TUN device closed");
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("mtu", &self.mtu)
            .field("queued_inbound", &matches!(self.inbound, Inbound::Queue(_)))
            .field("sink", &self.sink.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "TUN device is closed")
}

/// Bounded host -> tunnel packet queue
///
/// Pushing never blocks: when the queue is full the new packet is dropped
/// so the host's I/O thread keeps running.
#[derive(Debug)]
pub struct PacketQueue {
    tx: Sender<Vec<u8>>,
    dropped: AtomicU64,
}

impl PacketQueue {
    /// Create a queue and its receiving end
    pub fn bounded(capacity: usize) -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Enqueue a packet; returns `false` if it was dropped
    pub fn push(&self, packet: Vec<u8>) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Packets dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Packets currently waiting
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    /// Whether no packets are waiting
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}
