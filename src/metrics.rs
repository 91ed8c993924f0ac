//! Performance instrumentation for the synchronization pipeline.
//!
//! Every stage of the frame loop is timed so a bot author can see where a
//! tick's budget goes: copying into the buffer, waiting on the host, running
//! the callback. Metrics are sampled on the producer and consumer threads and
//! read from anywhere, so the running statistics sit behind a `parking_lot`
//! mutex. Locks are held only for the handful of arithmetic operations per
//! sample.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, Default)]
struct State {
    started: Option<Instant>,
    skip_next: bool,
    samples: u64,
    min: f64,
    max: f64,
    avg: f64,
    last: f64,
}

/// Point-in-time statistics for one metric. Values are milliseconds for
/// timing metrics and raw counts for gauge-style metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSummary {
    pub samples: u64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub last: f64,
}

/// One tracked quantity with running min/max/mean and the latest sample.
pub struct PerformanceMetric {
    name: &'static str,
    state: Mutex<State>,
}

impl PerformanceMetric {
    pub(crate) fn new(name: &'static str) -> Self {
        Self { name, state: Mutex::new(State::default()) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Records one sample. The running mean is updated incrementally, so no
    /// sample history is kept.
    pub fn record(&self, value: f64) {
        let mut state = self.state.lock();
        if state.skip_next {
            // An excluded sample still shows up as `last` so the caller can
            // see what happened, but it does not pollute the statistics.
            state.skip_next = false;
            state.last = value;
            return;
        }
        state.samples += 1;
        state.last = value;
        if state.samples == 1 {
            state.min = value;
            state.max = value;
            state.avg = value;
        } else {
            state.min = state.min.min(value);
            state.max = state.max.max(value);
            state.avg += (value - state.avg) / state.samples as f64;
        }
    }

    /// Records a duration sample in milliseconds.
    pub fn record_duration(&self, duration: Duration) {
        self.record(duration.as_secs_f64() * 1000.0);
    }

    /// Starts the wall-clock timer. A second call before [`stop_timing`]
    /// is a no-op, so nested sections attribute to the outermost start.
    ///
    /// [`stop_timing`]: Self::stop_timing
    pub fn start_timing(&self) {
        let mut state = self.state.lock();
        if state.started.is_none() {
            state.started = Some(Instant::now());
        }
    }

    /// Stops the timer and records the elapsed time. Does nothing if the
    /// timer was never started.
    pub fn stop_timing(&self) {
        let elapsed = {
            let mut state = self.state.lock();
            state.started.take().map(|t| t.elapsed())
        };
        if let Some(elapsed) = elapsed {
            self.record_duration(elapsed);
        }
    }

    /// Times one closure invocation.
    pub fn time<R>(&self, f: impl FnOnce() -> R) -> R {
        self.start_timing();
        let out = f();
        self.stop_timing();
        out
    }

    /// Marks the next sample as excluded from min/max/avg. Used for frame
    /// zero when its duration is intentionally unbounded.
    pub(crate) fn exclude_next_sample(&self) {
        self.state.lock().skip_next = true;
    }

    pub fn summary(&self) -> MetricSummary {
        let state = self.state.lock();
        MetricSummary {
            samples: state.samples,
            min: state.min,
            max: state.max,
            avg: state.avg,
            last: state.last,
        }
    }

    pub(crate) fn reset(&self) {
        *self.state.lock() = State::default();
    }
}

impl fmt::Display for PerformanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.summary();
        if s.samples == 0 {
            return write!(f, "{}: no samples", self.name);
        }
        write!(
            f,
            "{}: avg {:.2} [{:.2} .. {:.2}], last {:.2}, {} samples",
            self.name, s.avg, s.min, s.max, s.last, s.samples
        )
    }
}

impl fmt::Debug for PerformanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceMetric")
            .field("name", &self.name)
            .field("summary", &self.summary())
            .finish()
    }
}

/// The full set of pipeline metrics for one driver.
///
/// Timing metrics are milliseconds; `frame_buffer_size` and `frames_behind`
/// are gauges sampled once per consumed frame.
pub struct PerformanceMetrics {
    /// Time the producer spends copying a snapshot into a buffer slot.
    pub copying_to_buffer: PerformanceMetric,
    /// Time one consumer callback takes.
    pub bot_response: PerformanceMetric,
    /// Time from sending the client-ready code to receiving the next frame.
    pub bwapi_response: PerformanceMetric,
    /// Frames sitting in the buffer when the consumer picks one up.
    pub frame_buffer_size: PerformanceMetric,
    /// How far the host's live frame is ahead of the frame being consumed.
    pub frames_behind: PerformanceMetric,
    /// Time the producer spends blocked waiting for buffer space.
    pub intentionally_blocking: PerformanceMetric,
    /// Time the consumer spends waiting for a frame to arrive.
    pub bot_idle: PerformanceMetric,
    /// Full producer-side duration of one frame, receive to handoff.
    pub total_frame_duration: PerformanceMetric,
}

impl PerformanceMetrics {
    pub(crate) fn new() -> Self {
        Self {
            copying_to_buffer: PerformanceMetric::new("copying_to_buffer"),
            bot_response: PerformanceMetric::new("bot_response"),
            bwapi_response: PerformanceMetric::new("bwapi_response"),
            frame_buffer_size: PerformanceMetric::new("frame_buffer_size"),
            frames_behind: PerformanceMetric::new("frames_behind"),
            intentionally_blocking: PerformanceMetric::new("intentionally_blocking"),
            bot_idle: PerformanceMetric::new("bot_idle"),
            total_frame_duration: PerformanceMetric::new("total_frame_duration"),
        }
    }

    /// Clears all samples. When `unlimited_frame_zero` is set, the metrics
    /// that would absorb frame zero's unbounded duration exclude their first
    /// sample.
    pub(crate) fn reset(&self, unlimited_frame_zero: bool) {
        for metric in self.all() {
            metric.reset();
        }
        if unlimited_frame_zero {
            self.bot_response.exclude_next_sample();
            self.total_frame_duration.exclude_next_sample();
        }
    }

    fn all(&self) -> [&PerformanceMetric; 8] {
        [
            &self.copying_to_buffer,
            &self.bot_response,
            &self.bwapi_response,
            &self.frame_buffer_size,
            &self.frames_behind,
            &self.intentionally_blocking,
            &self.bot_idle,
            &self.total_frame_duration,
        ]
    }
}

impl fmt::Display for PerformanceMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for metric in self.all() {
            writeln!(f, "{metric}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PerformanceMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceMetrics").finish_non_exhaustive()
    }
}
