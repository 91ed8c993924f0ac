//! End-to-end sessions against a scripted in-process host.
//!
//! The host thread plays `total_frames` in-game frames over a
//! [`HostEndpoint`], then republishes a terminal not-in-game frame and stops.
//! Tests hang per-frame hooks on the consumer to observe the pipeline from
//! the inside (frames behind, metric state) while it runs.
//!
//! Timing assertions use generous margins; the scenarios are built so the
//! states they assert on are stable for tens of milliseconds around the
//! sampling point.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

use bwlink::{
    BoxError, CODE_CLIENT_READY, CODE_FRAME_READY, ChannelClient, ClientError, Configuration,
    Driver, FrameContext, HostEndpoint, InProcessRegion, PerformanceMetrics,
    SUPPORTED_CLIENT_VERSIONS,
};

/// Leeway for noisy timing measurements, in milliseconds.
const MS_MARGIN: f64 = 15.0;

/// Honors `RUST_LOG` when debugging a scenario; silent by default.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn sleep_ms(value: u64) {
    thread::sleep(ms(value));
}

fn assert_within(label: &str, expected: f64, actual: f64, margin: f64) {
    assert!(
        (expected - actual).abs() <= margin,
        "{label}: expected {expected} == {actual} +/- {margin}"
    );
}

fn async_config(capacity: usize, max_frame_ms: u64, unlimited_frame_zero: bool) -> Configuration {
    Configuration {
        asynchronous: true,
        frame_buffer_capacity: capacity,
        max_frame_duration: ms(max_frame_ms),
        unlimited_frame_zero,
    }
}

type Hook = Box<dyn FnMut(&mut FrameContext<'_>) -> Result<(), BoxError> + Send>;

/// One scripted session: a fake host plus a hook-driven consumer.
struct Environment {
    config: Configuration,
    host_delay: Duration,
    hooks: HashMap<i32, Hook>,
    each_frame: Option<Hook>,
}

impl Environment {
    fn new(config: Configuration) -> Self {
        Self { config, host_delay: Duration::ZERO, hooks: HashMap::new(), each_frame: None }
    }

    /// Simulated host work per tick, between receiving the client-ready code
    /// and publishing the next frame.
    fn host_delay(mut self, delay: Duration) -> Self {
        self.host_delay = delay;
        self
    }

    /// Installs a hook for one specific in-game frame.
    fn on_frame(
        mut self,
        frame: i32,
        hook: impl FnMut(&mut FrameContext<'_>) -> Result<(), BoxError> + Send + 'static,
    ) -> Self {
        self.hooks.insert(frame, Box::new(hook));
        self
    }

    /// Installs a hook that runs for every in-game frame, before any
    /// per-frame hook.
    fn on_each_frame(
        mut self,
        hook: impl FnMut(&mut FrameContext<'_>) -> Result<(), BoxError> + Send + 'static,
    ) -> Self {
        self.each_frame = Some(Box::new(hook));
        self
    }

    /// Plays frames `0..total_frames` plus the terminal frame. Returns the
    /// session outcome, the session metrics, and every chat line the host
    /// received.
    fn run(self, total_frames: i32) -> (bwlink::Result<()>, Arc<PerformanceMetrics>, Vec<String>) {
        init_tracing();
        let (region, host) = InProcessRegion::pair();
        host.with_snapshot_mut(|mut s| {
            s.set_client_version(SUPPORTED_CLIENT_VERSIONS[0]);
            s.set_revision("test-host");
        });
        let mut client = ChannelClient::from_region(Box::new(region)).unwrap();

        let host_delay = self.host_delay;
        let game = thread::spawn(move || scripted_host(host, total_frames, host_delay));

        let mut hooks = self.hooks;
        let mut each_frame = self.each_frame;
        let mut consumer = move |context: &mut FrameContext<'_>| -> Result<(), BoxError> {
            if !context.snapshot().in_game() {
                return Ok(());
            }
            if let Some(hook) = each_frame.as_mut() {
                hook(context)?;
            }
            match hooks.get_mut(&context.frame()) {
                Some(hook) => hook(context),
                None => Ok(()),
            }
        };

        let mut driver = Driver::new(self.config).unwrap();
        let result = driver.run(&mut client, &mut consumer);
        let metrics = driver.metrics();

        // Unblock the host if the session ended early.
        drop(client);
        let texts = game.join().unwrap();
        (result, metrics, texts)
    }
}

/// Publishes frames `0..total_frames` (in game), then one terminal frame
/// numbered `total_frames` with `in_game` cleared. Collects chat commands.
fn scripted_host(host: HostEndpoint, total_frames: i32, delay: Duration) -> Vec<String> {
    let mut texts = Vec::new();
    for frame in 0..=total_frames {
        if host.recv().map(|code| code != CODE_CLIENT_READY).unwrap_or(true) {
            return texts;
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        host.with_snapshot(|s| {
            for i in 0..s.command_count() {
                let command = s.command(i);
                if command.kind == bwlink::CommandType::SendText as i32 {
                    texts.push(s.string(command.value1 as usize).into_owned());
                }
            }
        });
        host.with_snapshot_mut(|mut s| {
            s.reset_counts();
            s.set_frame_count(frame);
            s.set_in_game(frame < total_frames);
        });
        if host.send(CODE_FRAME_READY).is_err() {
            return texts;
        }
    }
    texts
}

#[test]
fn sync_delayed_consumer_never_buffers() {
    let mut environment = Environment::new(Configuration::default());
    for frame in 0..5 {
        environment = environment.on_frame(frame, move |context| {
            sleep_ms(5);
            assert_eq!(context.frames_behind(), 0);
            assert_eq!(context.frame(), frame);
            Ok(())
        });
    }
    let (result, metrics, _) = environment.run(5);
    result.unwrap();

    // Lock-step still samples the occupancy gauges, pinned at zero.
    let buffered = metrics.frame_buffer_size.summary();
    let behind = metrics.frames_behind.summary();
    assert!(buffered.samples >= 5, "only {} occupancy samples", buffered.samples);
    assert_eq!(buffered.max, 0.0);
    assert!(behind.samples >= 5, "only {} lag samples", behind.samples);
    assert_eq!(behind.max, 0.0);
}

#[test]
fn async_consumer_error_fails_the_run() {
    let (result, _, _) = Environment::new(async_config(3, 40, true))
        .on_frame(0, |_| Err("simulated bot failure".into()))
        .run(10);

    match result.unwrap_err() {
        ClientError::Consumer { frame: 0, source } => {
            assert!(source.to_string().contains("simulated bot failure"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn async_consumer_panic_fails_the_run() {
    let (result, _, _) = Environment::new(async_config(3, 40, true))
        .on_frame(1, |_| panic!("simulated bot panic"))
        .run(10);

    match result.unwrap_err() {
        ClientError::Consumer { frame: 1, source } => {
            assert!(source.to_string().contains("simulated bot panic"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn async_delayed_consumer_lets_the_host_run_ahead() {
    // Capacity 4 at a 10 ms budget: while the consumer sits on frame 1 for
    // 50 ms, the producer buffers frames 2 through 4, publishes frame 5, and
    // then blocks on buffer space. That state is stable until the consumer
    // wakes.
    let (result, _, _) = Environment::new(async_config(4, 10, true))
        .on_frame(1, |context| {
            sleep_ms(50);
            assert_eq!(context.frame(), 1, "consumer should still observe the old frame");
            assert_eq!(context.frames_behind(), 4, "host should be as far ahead as capacity allows");
            Ok(())
        })
        .on_frame(6, |context| {
            assert_eq!(context.frames_behind(), 0, "consumer should have caught up");
            Ok(())
        })
        .run(12);
    result.unwrap();
}

#[test]
fn async_pacing_slows_the_host_to_one_frame_per_budget() {
    // Capacity 5 at a 50 ms budget: the producer publishes one frame per
    // budget while the consumer stalls, so frames behind grows by one per
    // 50 ms, sampled mid-interval.
    let (result, _, _) = Environment::new(async_config(5, 50, true))
        .on_frame(1, |context| {
            sleep_ms(125);
            assert_eq!(context.frame(), 1);
            assert_eq!(context.frames_behind(), 2);
            sleep_ms(50);
            assert_eq!(context.frames_behind(), 3);
            sleep_ms(50);
            assert_eq!(context.frames_behind(), 4);
            Ok(())
        })
        .run(10);
    result.unwrap();
}

#[test]
fn async_unlimited_frame_zero_holds_the_host() {
    let (result, _, _) = Environment::new(async_config(2, 5, true))
        .on_frame(0, |context| {
            sleep_ms(50);
            assert_eq!(context.frame(), 0);
            assert_eq!(context.frames_behind(), 0, "host must not advance past frame zero");
            Ok(())
        })
        .run(5);
    result.unwrap();
}

#[test]
fn async_limited_frame_zero_buffers_immediately() {
    let (result, _, _) = Environment::new(async_config(2, 5, false))
        .on_frame(0, |context| {
            sleep_ms(50);
            assert_eq!(context.frame(), 0);
            assert_eq!(context.frames_behind(), 2, "host should run ahead up to capacity");
            Ok(())
        })
        .run(5);
    result.unwrap();
}

#[test]
fn async_frames_arrive_exactly_once_in_order() {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let (result, metrics, _) = Environment::new(async_config(3, 5, true))
        .on_each_frame(move |context| {
            recorder.lock().push(context.frame());
            Ok(())
        })
        .run(30);
    result.unwrap();

    assert_eq!(*seen.lock(), (0..30).collect::<Vec<_>>());

    // Buffer occupancy and lag never exceed the configured capacity.
    assert!(metrics.frame_buffer_size.summary().max <= 3.0);
    assert!(metrics.frames_behind.summary().max <= 3.0);
}

#[test]
fn async_queued_commands_reach_the_host() {
    let (result, _, texts) = Environment::new(async_config(3, 10, true))
        .on_frame(1, |context| {
            context.send_text("hello from frame 1");
            Ok(())
        })
        .run(10);
    result.unwrap();
    assert!(texts.contains(&"hello from frame 1".to_owned()), "host saw: {texts:?}");
}

#[test]
fn host_disconnect_surfaces_as_channel_error() {
    let (region, host) = InProcessRegion::pair();
    host.with_snapshot_mut(|mut s| s.set_client_version(SUPPORTED_CLIENT_VERSIONS[0]));
    let mut client = ChannelClient::from_region(Box::new(region)).unwrap();

    // Three frames, then the host process dies without a terminal frame.
    let game = thread::spawn(move || {
        for frame in 0..3 {
            if host.recv().is_err() {
                return;
            }
            host.with_snapshot_mut(|mut s| {
                s.set_frame_count(frame);
                s.set_in_game(true);
            });
            if host.send(CODE_FRAME_READY).is_err() {
                return;
            }
        }
        host.disconnect();
    });

    let mut driver = Driver::new(async_config(3, 20, true)).unwrap();
    let last_seen = AtomicI32::new(-1);
    let mut consumer = |context: &mut FrameContext<'_>| -> Result<(), BoxError> {
        last_seen.store(context.frame(), Ordering::SeqCst);
        Ok(())
    };
    let err = driver.run(&mut client, &mut consumer).unwrap_err();

    assert!(matches!(err, ClientError::Channel { .. }));
    assert!(!err.is_retryable());
    // Every frame published before the disconnect was still dispatched.
    assert_eq!(last_seen.load(Ordering::SeqCst), 2);
    game.join().unwrap();
}

#[test]
fn metrics_bot_response_tracks_callback_time() {
    // Frame zero is excluded from the statistics (unlimited_frame_zero), so
    // the samples are exactly the 100/300/200 ms sleeps.
    let (result, metrics, _) = Environment::new(Configuration::default())
        .on_frame(1, |_| {
            sleep_ms(100);
            Ok(())
        })
        .on_frame(2, |context| {
            let response = context.metrics().bot_response.summary();
            assert_within("2: bot response average", 100.0, response.avg, MS_MARGIN);
            assert_within("2: bot response minimum", 100.0, response.min, MS_MARGIN);
            assert_within("2: bot response maximum", 100.0, response.max, MS_MARGIN);
            assert_within("2: bot response previous", 100.0, response.last, MS_MARGIN);
            sleep_ms(300);
            Ok(())
        })
        .on_frame(3, |context| {
            let response = context.metrics().bot_response.summary();
            assert_within("3: bot response average", 200.0, response.avg, MS_MARGIN);
            assert_within("3: bot response maximum", 300.0, response.max, MS_MARGIN);
            assert_within("3: bot response previous", 300.0, response.last, MS_MARGIN);
            sleep_ms(200);
            Ok(())
        })
        .run(4);
    result.unwrap();

    let response = metrics.bot_response.summary();
    assert_within("final: bot response average", 200.0, response.avg, MS_MARGIN);
    assert_within("final: bot response minimum", 100.0, response.min, MS_MARGIN);
    assert_within("final: bot response maximum", 300.0, response.max, MS_MARGIN);
    assert_within("final: bot response previous", 200.0, response.last, MS_MARGIN);
}

#[test]
fn metrics_bwapi_response_tracks_host_time() {
    let (result, metrics, _) = Environment::new(Configuration::default())
        .host_delay(ms(50))
        .run(5);
    result.unwrap();
    assert_within("bwapi response average", 50.0, metrics.bwapi_response.summary().avg, MS_MARGIN);
}

#[test]
fn metrics_total_frame_duration_is_copy_plus_consumer_time() {
    let frame_sleep = 20;
    let mut environment = Environment::new(async_config(10, frame_sleep + 20, true));
    for frame in 0..10 {
        environment = environment.on_frame(frame, move |_| {
            sleep_ms(frame_sleep);
            Ok(())
        });
    }
    let (result, metrics, _) = environment.run(10);
    result.unwrap();

    let copy = metrics.copying_to_buffer.summary().avg;
    let total = metrics.total_frame_duration.summary().avg;
    assert_within("total frame duration average", copy + frame_sleep as f64, total, MS_MARGIN);
}

#[test]
fn metrics_copying_to_buffer_reports_sane_values() {
    let (result, metrics, _) = Environment::new(async_config(10, 40, true)).run(20);
    result.unwrap();

    let copy = metrics.copying_to_buffer.summary();
    // One copy per published frame, terminal frame included.
    assert!(copy.samples >= 20, "only {} copy samples", copy.samples);
    assert!(copy.min >= 0.0);
    assert!(copy.max < 100.0, "copy max {} ms", copy.max);
}

#[test]
fn metrics_bot_idle_is_host_time_plus_copy() {
    let host_delay = 10;
    let (result, metrics, _) = Environment::new(async_config(3, 40, true))
        .host_delay(ms(host_delay))
        .run(10);
    result.unwrap();

    let expected = metrics.copying_to_buffer.summary().avg + host_delay as f64;
    assert_within("bot idle average", expected, metrics.bot_idle.summary().avg, MS_MARGIN);
}

#[test]
fn metrics_intentionally_blocking_accrues_when_the_buffer_is_full() {
    // Capacity 2 at a 20 ms budget with a 100 ms consumer: after spending
    // two budgets buffering, the producer blocks for the remaining ~60 ms of
    // the consumer's frame 1.
    let (result, _, _) = Environment::new(async_config(2, 20, true))
        .on_frame(1, |_| {
            sleep_ms(100);
            Ok(())
        })
        .on_frame(2, |context| {
            // Let the producer finish recording the stall it just woke from.
            sleep_ms(20);
            let blocking = context.metrics().intentionally_blocking.summary();
            assert_within("intentionally blocking previous", 60.0, blocking.last, MS_MARGIN);
            Ok(())
        })
        .run(3);
    result.unwrap();
}
