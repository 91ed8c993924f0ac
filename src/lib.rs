//! Frame-synchronized client for BWAPI shared-memory game hosts.
//!
//! A running host publishes one state snapshot per game tick into shared
//! memory and pauses until the connected client hands the region back over a
//! one-byte handshake pipe. This crate owns that protocol end to end:
//!
//! - [`ChannelClient`] claims an open game and performs the per-tick
//!   handshake round trip.
//! - [`Driver`] turns round trips into a frame loop for a
//!   [`FrameConsumer`] — lock-step, or buffered on a second thread with a
//!   [`FrameBuffer`] ring so a briefly slow bot does not stall the host.
//! - [`PerformanceMetrics`] reports where each frame's budget went.
//!
//! Connecting is a single attempt; retry policy belongs to the caller:
//!
//! ```no_run
//! # #[cfg(windows)]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::time::Duration;
//!
//! use bwlink::{BoxError, ChannelClient, Configuration, Driver, FrameContext};
//!
//! let mut client = loop {
//!     match ChannelClient::connect() {
//!         Ok(client) => break client,
//!         Err(e) if e.is_retryable() => std::thread::sleep(Duration::from_secs(1)),
//!         Err(e) => return Err(e.into()),
//!     }
//! };
//!
//! let mut driver = Driver::new(Configuration { asynchronous: true, ..Default::default() })?;
//! driver.run(&mut client, &mut |frame: &mut FrameContext<'_>| -> Result<(), BoxError> {
//!     if frame.frame() % 100 == 0 {
//!         frame.send_text(format!("frame {}", frame.frame()));
//!     }
//!     Ok(())
//! })?;
//!
//! println!("{}", driver.metrics());
//! # Ok(())
//! # }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```
//!
//! Off Windows the live transport is unavailable, but the whole pipeline
//! runs against [`InProcessRegion`], which is how the crate's own test suite
//! scripts a host.

pub mod client;
pub mod data;
pub mod driver;
pub mod error;
pub mod frame_buffer;
pub mod metrics;
pub mod region;
pub mod windows;

pub use client::{BufferedCopier, ChannelClient, SUPPORTED_CLIENT_VERSIONS, SnapshotCopier};
pub use data::{
    Command, CommandType, CoordinateType, Event, EventType, GameInstance, MAX_COUNT, SNAPSHOT_SIZE,
    Shape, ShapeType, Snapshot, SnapshotMut, UnitCommand,
};
pub use driver::{CommandSink, Configuration, Driver, FrameConsumer, FrameContext};
pub use error::{BoxError, ClientError, Result};
pub use frame_buffer::{FrameBuffer, FrameRef};
pub use metrics::{MetricSummary, PerformanceMetric, PerformanceMetrics};
pub use region::{CODE_CLIENT_READY, CODE_FRAME_READY, HostEndpoint, InProcessRegion, SharedRegion};
#[cfg(windows)]
pub use windows::MappedRegion;
