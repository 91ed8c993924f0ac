//! Handshake client over a shared region.
//!
//! [`ChannelClient`] owns the region for one session and enforces the
//! ownership protocol: the client may touch the snapshot only between
//! receiving the frame-ready code and sending the client-ready code back.
//! One [`update`] is exactly one round trip, and therefore one game tick.
//!
//! [`update`]: ChannelClient::update

use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::data::{Command, Event, Shape, Snapshot, SnapshotMut, UnitCommand};
use crate::error::{ClientError, Result};
use crate::region::{CODE_CLIENT_READY, CODE_FRAME_READY, SharedRegion};

/// Protocol versions this client can talk to.
pub const SUPPORTED_CLIENT_VERSIONS: &[i32] = &[10003];

/// Copies the live snapshot into a frame-buffer slot.
///
/// The default is a plain slice copy; a platform backend can substitute a
/// wider copy primitive without the buffer layer knowing.
pub trait SnapshotCopier: Send + Sync {
    fn copy(&self, src: &[u8], dest: &mut [u8]);
}

/// Default [`SnapshotCopier`]: `copy_from_slice` over the full snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct BufferedCopier;

impl SnapshotCopier for BufferedCopier {
    fn copy(&self, src: &[u8], dest: &mut [u8]) {
        let n = src.len().min(dest.len());
        dest[..n].copy_from_slice(&src[..n]);
    }
}

/// One client session against a game host.
pub struct ChannelClient {
    region: Box<dyn SharedRegion>,
    copier: Arc<dyn SnapshotCopier>,
}

impl ChannelClient {
    /// Connects to a running game host via the discovery table.
    ///
    /// Fails with [`ClientError::NoOpenGame`] when every table record is
    /// empty or already claimed. Connection errors are retryable; version
    /// mismatch is not.
    #[cfg(windows)]
    pub fn connect() -> Result<Self> {
        let region = crate::windows::open_session()?;
        Self::from_region(Box::new(region))
    }

    /// Wraps an already-established region, verifying the host's protocol
    /// version against [`SUPPORTED_CLIENT_VERSIONS`].
    pub fn from_region(region: Box<dyn SharedRegion>) -> Result<Self> {
        if region.len() < crate::data::SNAPSHOT_SIZE {
            return Err(ClientError::connection_failed(format!(
                "shared region too small: {} bytes",
                region.len()
            )));
        }

        let client = Self { region, copier: Arc::new(BufferedCopier) };
        let version = client.client_version();
        if !SUPPORTED_CLIENT_VERSIONS.contains(&version) {
            return Err(ClientError::Version { supported: SUPPORTED_CLIENT_VERSIONS, found: version });
        }

        info!(version, revision = %client.revision(), "connected to game host");
        Ok(client)
    }

    /// Replaces the snapshot copier used by [`copy_snapshot_into`].
    ///
    /// [`copy_snapshot_into`]: Self::copy_snapshot_into
    pub fn with_copier(mut self, copier: Arc<dyn SnapshotCopier>) -> Self {
        self.copier = copier;
        self
    }

    /// Completes one frame round trip: hands the region back to the host,
    /// blocks until the next frame is published.
    pub fn update(&mut self) -> Result<()> {
        self.update_with(|_, _| {})
    }

    /// Like [`update`], then dispatches every event in the new frame in
    /// array order. The callback gets the event record plus a read view for
    /// resolving string and unit references.
    ///
    /// [`update`]: Self::update
    pub fn update_with(&mut self, mut on_event: impl FnMut(Event, &Snapshot<'_>)) -> Result<()> {
        self.region.send(CODE_CLIENT_READY)?;
        loop {
            // The host may emit other codes before announcing the frame.
            match self.region.recv()? {
                CODE_FRAME_READY => break,
                other => trace!(code = other, "ignoring handshake code"),
            }
        }

        self.region.read(&mut |bytes| {
            let snapshot = Snapshot::new(bytes);
            trace!(
                frame = snapshot.frame_count(),
                events = snapshot.event_count(),
                "frame received"
            );
            for event in snapshot.events() {
                on_event(event, &snapshot);
            }
        });
        Ok(())
    }

    /// Appends to the outgoing strings array, returning the new index.
    pub fn add_string(&mut self, s: &str) -> Result<usize> {
        let s = s.to_owned();
        self.with_snapshot_mut(move |mut view| view.push_string(&s))
    }

    /// Appends a draw command, returning the new index.
    pub fn add_shape(&mut self, shape: Shape) -> Result<usize> {
        self.with_snapshot_mut(move |mut view| view.push_shape(shape))
    }

    /// Appends a game-level command, returning the new index.
    pub fn add_command(&mut self, command: Command) -> Result<usize> {
        self.with_snapshot_mut(move |mut view| view.push_command(command))
    }

    /// Appends a unit command, returning the new index.
    pub fn add_unit_command(&mut self, command: UnitCommand) -> Result<usize> {
        self.with_snapshot_mut(move |mut view| view.push_unit_command(command))
    }

    pub fn client_version(&self) -> i32 {
        self.with_snapshot(|s| s.client_version())
    }

    pub fn revision(&self) -> String {
        self.with_snapshot(|s| s.revision().into_owned())
    }

    pub fn frame_count(&self) -> i32 {
        self.with_snapshot(|s| s.frame_count())
    }

    pub fn in_game(&self) -> bool {
        self.with_snapshot(|s| s.in_game())
    }

    pub fn map_file_name(&self) -> String {
        self.with_snapshot(|s| s.map_file_name().into_owned())
    }

    /// Runs `f` over a read view of the live snapshot.
    pub fn with_snapshot<R>(&self, f: impl FnOnce(Snapshot<'_>) -> R) -> R {
        let mut f = Some(f);
        let mut out = None;
        self.region.read(&mut |bytes| {
            if let Some(f) = f.take() {
                out = Some(f(Snapshot::new(bytes)));
            }
        });
        out.expect("SharedRegion::read invokes the closure")
    }

    /// Runs `f` over a write view of the live snapshot.
    pub fn with_snapshot_mut<R>(&mut self, f: impl FnOnce(SnapshotMut<'_>) -> R) -> R {
        let mut f = Some(f);
        let mut out = None;
        self.region.write(&mut |bytes| {
            if let Some(f) = f.take() {
                out = Some(f(SnapshotMut::new(bytes)));
            }
        });
        out.expect("SharedRegion::write invokes the closure")
    }

    /// Copies the live snapshot into `dest` through the configured copier.
    pub fn copy_snapshot_into(&self, dest: &mut [u8]) {
        let copier = Arc::clone(&self.copier);
        self.region.read(&mut |bytes| copier.copy(bytes, dest));
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        debug!("client session closed");
    }
}

impl std::fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClient")
            .field("region_len", &self.region.len())
            .finish_non_exhaustive()
    }
}
