//! Shared-region transport between the client and the game host.
//!
//! A session needs two primitives: a byte region both sides can see, and a
//! one-byte handshake channel that orders access to it. [`SharedRegion`]
//! abstracts over the two ways we get them: a real memory-mapped section plus
//! named pipe on Windows (see the `windows` module), and [`InProcessRegion`]
//! for tests and simulations, which pairs a region with a [`HostEndpoint`]
//! driven from another thread in the same process.

use std::io;
use std::sync::Arc;
use std::sync::mpsc;

use parking_lot::Mutex;

use crate::data::{SNAPSHOT_SIZE, Snapshot, SnapshotMut};
use crate::error::{ClientError, Result};

/// Handshake code the client sends after it has finished with a frame.
pub const CODE_CLIENT_READY: u8 = 1;
/// Handshake code the host sends when a new frame is published.
pub const CODE_FRAME_READY: u8 = 2;

/// A byte region shared with the game host, plus the handshake channel that
/// serializes access to it.
///
/// The protocol guarantees the host never touches the region between sending
/// [`CODE_FRAME_READY`] and receiving [`CODE_CLIENT_READY`], so `read` and
/// `write` are race-free as long as the caller respects the handshake.
pub trait SharedRegion: Send {
    /// Region size in bytes. Always at least [`SNAPSHOT_SIZE`].
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` over the region's current contents.
    fn read(&self, f: &mut dyn FnMut(&[u8]));

    /// Runs `f` over the region's contents mutably.
    fn write(&mut self, f: &mut dyn FnMut(&mut [u8]));

    /// Sends one handshake code to the host.
    fn send(&mut self, code: u8) -> Result<()>;

    /// Blocks for the next handshake code from the host.
    fn recv(&mut self) -> Result<u8>;
}

/// In-process [`SharedRegion`]: a locked buffer and a pair of byte channels.
///
/// Created with [`InProcessRegion::pair`]; the matching [`HostEndpoint`] plays
/// the host from another thread.
pub struct InProcessRegion {
    buffer: Arc<Mutex<Box<[u8]>>>,
    to_host: mpsc::Sender<u8>,
    from_host: mpsc::Receiver<u8>,
}

impl InProcessRegion {
    /// Builds a connected region/host pair backed by a zeroed snapshot-sized
    /// buffer.
    pub fn pair() -> (Self, HostEndpoint) {
        let buffer: Arc<Mutex<Box<[u8]>>> =
            Arc::new(Mutex::new(vec![0u8; SNAPSHOT_SIZE].into_boxed_slice()));
        let (to_host, host_rx) = mpsc::channel();
        let (host_tx, from_host) = mpsc::channel();

        let region = Self { buffer: Arc::clone(&buffer), to_host, from_host };
        let host = HostEndpoint { buffer, rx: host_rx, tx: host_tx };
        (region, host)
    }
}

impl SharedRegion for InProcessRegion {
    fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    fn read(&self, f: &mut dyn FnMut(&[u8])) {
        f(&self.buffer.lock());
    }

    fn write(&mut self, f: &mut dyn FnMut(&mut [u8])) {
        f(&mut self.buffer.lock());
    }

    fn send(&mut self, code: u8) -> Result<()> {
        self.to_host
            .send(code)
            .map_err(|_| ClientError::channel("send", disconnected("host endpoint dropped")))
    }

    fn recv(&mut self) -> Result<u8> {
        self.from_host
            .recv()
            .map_err(|_| ClientError::channel("recv", disconnected("host endpoint dropped")))
    }
}

/// The host half of an [`InProcessRegion`] pair.
///
/// Integration tests script a fake game on top of this: write a snapshot,
/// announce it, wait for the client to hand the region back.
pub struct HostEndpoint {
    buffer: Arc<Mutex<Box<[u8]>>>,
    rx: mpsc::Receiver<u8>,
    tx: mpsc::Sender<u8>,
}

impl HostEndpoint {
    /// Runs `f` over a read view of the shared snapshot.
    pub fn with_snapshot<R>(&self, f: impl FnOnce(Snapshot<'_>) -> R) -> R {
        let buffer = self.buffer.lock();
        f(Snapshot::new(&buffer))
    }

    /// Runs `f` over a write view of the shared snapshot.
    pub fn with_snapshot_mut<R>(&self, f: impl FnOnce(SnapshotMut<'_>) -> R) -> R {
        let mut buffer = self.buffer.lock();
        f(SnapshotMut::new(&mut buffer))
    }

    /// Announces a published frame to the client.
    pub fn send(&self, code: u8) -> Result<()> {
        self.tx
            .send(code)
            .map_err(|_| ClientError::channel("send", disconnected("client endpoint dropped")))
    }

    /// Blocks for the client's next handshake code.
    pub fn recv(&self) -> Result<u8> {
        self.rx
            .recv()
            .map_err(|_| ClientError::channel("recv", disconnected("client endpoint dropped")))
    }

    /// Drops the host's sender, which surfaces as a channel error on the
    /// client's next `recv`. Simulates the host process exiting.
    pub fn disconnect(self) {}
}

fn disconnected(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, reason.to_string())
}
