//! Frame-synchronization driver.
//!
//! [`Driver::run`] owns one session: it repeats the handshake round trip on
//! the calling thread and dispatches every frame to a [`FrameConsumer`], in
//! one of two modes.
//!
//! **Synchronous**: the consumer runs on the calling thread between receive
//! and hand-back, so the host waits out every callback. Simple, and the
//! consumer always sees the live frame.
//!
//! **Asynchronous**: the calling thread becomes the producer, copying each
//! frame into a [`FrameBuffer`](crate::FrameBuffer) and handing the region
//! back early, while a scoped consumer thread works through the buffered
//! copies. The producer paces itself with `max_frame_duration` so a briefly
//! slow consumer borrows time from later frames instead of stalling the
//! host.
//!
//! Either way a consumer error or panic tears the whole session down and
//! surfaces from `run`; nothing is retried or swallowed.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::ChannelClient;
use crate::data::{Command, CommandType, Shape, Snapshot, UnitCommand};
use crate::error::{BoxError, ClientError, Result};
use crate::frame_buffer::FrameBuffer;
use crate::metrics::PerformanceMetrics;

/// Session tuning. The defaults match the host's stock cadence: lock-step,
/// and when asynchronous mode is switched on, up to 10 buffered frames at a
/// 40 ms frame budget with an unbounded frame zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Run the consumer on its own thread against buffered frame copies.
    pub asynchronous: bool,
    /// Frames the producer may run ahead of the consumer. Only used in
    /// asynchronous mode; the ring allocates one spare slot beyond it.
    pub frame_buffer_capacity: usize,
    /// Producer-side budget per frame in asynchronous mode. Once the buffer
    /// is non-empty past this deadline, the producer moves on and lets the
    /// consumer fall behind.
    pub max_frame_duration: Duration,
    /// Exempt frame zero from pacing. Bots front-load their expensive setup
    /// there, and the host tolerates a long first frame.
    pub unlimited_frame_zero: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            asynchronous: false,
            frame_buffer_capacity: 10,
            max_frame_duration: Duration::from_millis(40),
            unlimited_frame_zero: true,
        }
    }
}

impl Configuration {
    pub fn validate(&self) -> Result<()> {
        if self.asynchronous {
            if self.frame_buffer_capacity < 2 {
                return Err(ClientError::configuration(
                    "frame buffer capacity must be at least 2 in asynchronous mode",
                ));
            }
            if self.max_frame_duration.is_zero() {
                return Err(ClientError::configuration(
                    "max frame duration must be positive in asynchronous mode",
                ));
            }
        }
        Ok(())
    }
}

/// Receives each frame of a session. Implemented for
/// `FnMut(&mut FrameContext) -> Result<(), BoxError>` closures.
pub trait FrameConsumer {
    /// Called once per frame, in frame order. Returning an error ends the
    /// session; the error surfaces from [`Driver::run`] wrapped in
    /// [`ClientError::Consumer`].
    fn on_frame(&mut self, frame: &mut FrameContext<'_>) -> Result<(), BoxError>;
}

impl<F> FrameConsumer for F
where
    F: FnMut(&mut FrameContext<'_>) -> Result<(), BoxError>,
{
    fn on_frame(&mut self, frame: &mut FrameContext<'_>) -> Result<(), BoxError> {
        self(frame)
    }
}

pub(crate) enum Outbound {
    Text(String),
    Shape(Shape),
    Command(Command),
    UnitCommand(UnitCommand),
}

/// Queues outgoing commands from the consumer.
///
/// In asynchronous mode the consumer never touches the shared region; queued
/// entries are applied to the live snapshot by the producer right before the
/// next hand-back, which can be several frames after the one the consumer
/// was reacting to.
pub struct CommandSink {
    tx: mpsc::Sender<Outbound>,
}

impl CommandSink {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    /// Queues a chat message.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.tx.send(Outbound::Text(text.into()));
    }

    /// Queues a draw command for the host's overlay.
    pub fn draw_shape(&self, shape: Shape) {
        let _ = self.tx.send(Outbound::Shape(shape));
    }

    /// Queues a game-level command.
    pub fn queue_command(&self, command: Command) {
        let _ = self.tx.send(Outbound::Command(command));
    }

    /// Queues an order for a unit.
    pub fn queue_unit_command(&self, command: UnitCommand) {
        let _ = self.tx.send(Outbound::UnitCommand(command));
    }
}

/// Everything a consumer can see and do while handling one frame.
pub struct FrameContext<'a> {
    snapshot: Snapshot<'a>,
    live_frame: &'a AtomicI32,
    metrics: &'a PerformanceMetrics,
    sink: &'a CommandSink,
}

impl<'a> FrameContext<'a> {
    /// Read view of the frame under consumption.
    pub fn snapshot(&self) -> &Snapshot<'a> {
        &self.snapshot
    }

    /// Frame number of the frame under consumption.
    pub fn frame(&self) -> i32 {
        self.snapshot.frame_count()
    }

    /// How many frames the host has run ahead of this one. Always 0 in
    /// synchronous mode.
    pub fn frames_behind(&self) -> i32 {
        (self.live_frame.load(Ordering::SeqCst) - self.frame()).max(0)
    }

    /// Live metrics for the running session.
    pub fn metrics(&self) -> &PerformanceMetrics {
        self.metrics
    }

    /// Outgoing command queue.
    pub fn commands(&self) -> &CommandSink {
        self.sink
    }

    /// Queues a chat message. Shorthand for `commands().send_text(..)`.
    pub fn send_text(&self, text: impl Into<String>) {
        self.sink.send_text(text);
    }
}

/// Runs frame-synchronized sessions against a connected client.
///
/// A driver outlives its sessions; the frame buffer and metrics are reused
/// across consecutive [`run`] calls without reallocation.
///
/// [`run`]: Self::run
#[derive(Debug)]
pub struct Driver {
    config: Configuration,
    metrics: Arc<PerformanceMetrics>,
    frame_buffer: Option<FrameBuffer>,
}

impl Driver {
    pub fn new(config: Configuration) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, metrics: Arc::new(PerformanceMetrics::new()), frame_buffer: None })
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// Metrics for the current (or most recent) session. Reset at the start
    /// of every [`run`].
    ///
    /// [`run`]: Self::run
    pub fn metrics(&self) -> Arc<PerformanceMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Runs one session to completion: dispatches every frame the host
    /// publishes, in order, until the host leaves the game or an error ends
    /// the session early.
    pub fn run<C>(&mut self, client: &mut ChannelClient, consumer: &mut C) -> Result<()>
    where
        C: FrameConsumer + Send,
    {
        self.metrics.reset(self.config.unlimited_frame_zero);
        info!(
            asynchronous = self.config.asynchronous,
            capacity = self.config.frame_buffer_capacity,
            "session starting"
        );

        let result = if self.config.asynchronous {
            self.run_buffered(client, consumer)
        } else {
            self.run_lock_step(client, consumer)
        };

        match &result {
            Ok(()) => debug!("session finished"),
            Err(error) => warn!(%error, "session failed"),
        }
        result
    }

    fn run_lock_step<C>(&mut self, client: &mut ChannelClient, consumer: &mut C) -> Result<()>
    where
        C: FrameConsumer,
    {
        let metrics = Arc::clone(&self.metrics);
        let (sink, outbound) = CommandSink::channel();
        let live_frame = AtomicI32::new(0);

        loop {
            flush_outbound(client, &outbound)?;
            metrics.bwapi_response.time(|| client.update())?;
            metrics.total_frame_duration.start_timing();

            let (frame, in_game, outcome) = client.with_snapshot(|snapshot| {
                let frame = snapshot.frame_count();
                let in_game = snapshot.in_game();
                live_frame.store(frame, Ordering::SeqCst);
                // Nothing is ever buffered in lock-step mode; the gauges are
                // sampled anyway so the metrics surface reads the same in
                // both modes.
                metrics.frame_buffer_size.record(0.0);
                metrics.frames_behind.record(0.0);

                let mut context = FrameContext {
                    snapshot,
                    live_frame: &live_frame,
                    metrics: &metrics,
                    sink: &sink,
                };
                // The terminal frame is dispatched (end-of-game events) but
                // not timed; bot_response measures in-game work.
                let caught = if in_game {
                    metrics.bot_response.time(|| {
                        catch_unwind(AssertUnwindSafe(|| consumer.on_frame(&mut context)))
                    })
                } else {
                    catch_unwind(AssertUnwindSafe(|| consumer.on_frame(&mut context)))
                };
                (frame, in_game, flatten_outcome(caught))
            });
            metrics.total_frame_duration.stop_timing();

            if let Err(source) = outcome {
                return Err(ClientError::Consumer { frame, source });
            }
            if !in_game {
                return Ok(());
            }
        }
    }

    fn run_buffered<C>(&mut self, client: &mut ChannelClient, consumer: &mut C) -> Result<()>
    where
        C: FrameConsumer + Send,
    {
        let config = self.config.clone();
        let metrics = Arc::clone(&self.metrics);
        let buffer = self.frame_buffer.get_or_insert_with(|| {
            FrameBuffer::new(
                config.frame_buffer_capacity,
                crate::data::SNAPSHOT_SIZE,
                Arc::clone(&metrics),
            )
        });
        buffer.reset();

        let live_frame = AtomicI32::new(0);
        let failed = AtomicBool::new(false);
        let failure: Mutex<Option<ClientError>> = Mutex::new(None);
        let (sink, outbound) = CommandSink::channel();

        thread::scope(|scope| {
            let consumer_thread = scope.spawn(|| {
                consume_buffered(buffer, &live_frame, &metrics, &failed, &failure, &sink, consumer);
            });

            produce_buffered(
                client, buffer, &config, &live_frame, &metrics, &failed, &failure, outbound,
            );

            if consumer_thread.join().is_err() {
                // The consumer loop catches callback panics; anything that
                // still escapes is a pipeline bug.
                record_failure(
                    &failed,
                    &failure,
                    ClientError::Consumer { frame: -1, source: "consumer thread panicked".into() },
                );
            }
        });

        match failure.into_inner() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Producer side of buffered mode, on the caller's thread.
#[allow(clippy::too_many_arguments)]
fn produce_buffered(
    client: &mut ChannelClient,
    buffer: &FrameBuffer,
    config: &Configuration,
    live_frame: &AtomicI32,
    metrics: &PerformanceMetrics,
    failed: &AtomicBool,
    failure: &Mutex<Option<ClientError>>,
    outbound: mpsc::Receiver<Outbound>,
) {
    loop {
        if failed.load(Ordering::SeqCst) {
            return;
        }

        let tick_result = flush_outbound(client, &outbound)
            .and_then(|()| metrics.bwapi_response.time(|| client.update()));
        if let Err(error) = tick_result {
            record_failure(failed, failure, error);
            // Wake a consumer blocked on an empty buffer so it can observe
            // the failure. The frame content is never dispatched.
            buffer.enqueue_frame(|_| {});
            return;
        }
        let tick_start = Instant::now();
        metrics.total_frame_duration.start_timing();

        let frame = client.frame_count();
        let in_game = client.in_game();
        live_frame.store(frame, Ordering::SeqCst);
        buffer.enqueue_frame(|slot| client.copy_snapshot_into(slot));

        if !in_game {
            // Terminal frame: the consumer exits after dispatching it.
            debug!(frame, "host left the game");
            return;
        }

        // Frame zero may hold the host for as long as the bot needs; after
        // that the host gets the region back within the frame budget.
        let deadline = if config.unlimited_frame_zero && buffer.frames_consumed() == 0 {
            None
        } else {
            Some(tick_start + config.max_frame_duration)
        };
        buffer.wait_drained(deadline);
        metrics.total_frame_duration.stop_timing();
    }
}

/// Consumer side of buffered mode, on the scoped thread.
fn consume_buffered<C>(
    buffer: &FrameBuffer,
    live_frame: &AtomicI32,
    metrics: &PerformanceMetrics,
    failed: &AtomicBool,
    failure: &Mutex<Option<ClientError>>,
    sink: &CommandSink,
    consumer: &mut C,
) where
    C: FrameConsumer,
{
    loop {
        let frame_ref = metrics.bot_idle.time(|| buffer.peek());
        if failed.load(Ordering::SeqCst) {
            drop(frame_ref);
            buffer.dequeue();
            return;
        }

        metrics.frame_buffer_size.record(buffer.frames_buffered() as f64);
        let snapshot = Snapshot::new(&frame_ref);
        let frame = snapshot.frame_count();
        let in_game = snapshot.in_game();
        metrics
            .frames_behind
            .record((live_frame.load(Ordering::SeqCst) - frame).max(0) as f64);

        let mut context = FrameContext { snapshot, live_frame, metrics, sink };
        // The terminal frame is dispatched but not timed, as in lock-step
        // mode.
        let caught = if in_game {
            metrics
                .bot_response
                .time(|| catch_unwind(AssertUnwindSafe(|| consumer.on_frame(&mut context))))
        } else {
            catch_unwind(AssertUnwindSafe(|| consumer.on_frame(&mut context)))
        };
        drop(context);
        drop(frame_ref);
        // Always consume the frame, even on failure: the producer may be
        // blocked on buffer space or on the drain wait.
        buffer.dequeue();

        if let Err(source) = flatten_outcome(caught) {
            record_failure(failed, failure, ClientError::Consumer { frame, source });
            return;
        }
        if !in_game {
            return;
        }
    }
}

/// Applies every queued outgoing command to the live snapshot.
fn flush_outbound(client: &mut ChannelClient, outbound: &mpsc::Receiver<Outbound>) -> Result<()> {
    for item in outbound.try_iter() {
        match item {
            Outbound::Text(text) => {
                let index = client.add_string(&text)? as i32;
                client.add_command(Command::new(CommandType::SendText, index, 0))?;
            }
            Outbound::Shape(shape) => {
                client.add_shape(shape)?;
            }
            Outbound::Command(command) => {
                client.add_command(command)?;
            }
            Outbound::UnitCommand(command) => {
                client.add_unit_command(command)?;
            }
        }
    }
    Ok(())
}

fn record_failure(failed: &AtomicBool, failure: &Mutex<Option<ClientError>>, error: ClientError) {
    warn!(%error, "session failure recorded");
    let mut slot = failure.lock();
    // First failure wins; later ones are consequences of the teardown.
    if slot.is_none() {
        *slot = Some(error);
    }
    failed.store(true, Ordering::SeqCst);
}

fn flatten_outcome(
    caught: std::thread::Result<Result<(), BoxError>>,
) -> Result<(), BoxError> {
    match caught {
        Ok(outcome) => outcome,
        Err(payload) => Err(panic_message(payload)),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> BoxError {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("consumer panicked: {message}").into()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("consumer panicked: {message}").into()
    } else {
        "consumer panicked".into()
    }
}
