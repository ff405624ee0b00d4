use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use super::*;
use crate::adapter::{ParameterSets, PassthroughParser};
use crate::device::loopback::DeviceCall;
use crate::device::{
    registry, Capabilities, DeviceError, LoopbackConfig, LoopbackDevice, LoopbackFactory,
    OutputDescriptor, OutputEvent, StartFormat, StartParams,
};
use crate::media::{AudioSample, Codec, FramePayload, UnitFlags, VideoFrame};
use crate::utils::init_test_logging;

const WAIT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Collected {
    frames: Vec<VideoFrame>,
    samples: Vec<AudioSample>,
    fatal: Vec<EngineError>,
}

/// Keeps everything it receives, zero-copy frames included
#[derive(Default)]
struct CollectSink {
    collected: Mutex<Collected>,
    cond: Condvar,
}

impl CollectSink {
    fn wait_until(&self, done: impl Fn(&Collected) -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        let mut collected = self.collected.lock();
        while !done(&collected) {
            if self.cond.wait_until(&mut collected, deadline).timed_out() {
                return done(&collected);
            }
        }
        true
    }

    fn wait_frames(&self, count: usize) -> Vec<i64> {
        self.wait_until(|c| c.frames.len() >= count);
        self.frame_pts()
    }

    fn frame_pts(&self) -> Vec<i64> {
        self.collected.lock().frames.iter().map(|f| f.pts).collect()
    }

    fn fatal_count(&self) -> usize {
        self.collected.lock().fatal.len()
    }

    fn clear_frames(&self) {
        self.collected.lock().frames.clear();
    }
}

impl FrameSink for CollectSink {
    fn queue_video_frame(&self, frame: VideoFrame) {
        self.collected.lock().frames.push(frame);
        self.cond.notify_all();
    }

    fn queue_audio_sample(&self, sample: AudioSample) {
        self.collected.lock().samples.push(sample);
        self.cond.notify_all();
    }

    fn on_fatal_error(&self, error: &EngineError) {
        self.collected.lock().fatal.push(error.clone());
        self.cond.notify_all();
    }
}

/// Splits `|`-separated parameter sets; a first set starting with `wide`
/// announces a 128x64 picture
struct SplitParser;

impl ParameterSetParser for SplitParser {
    fn parse_extradata(&mut self, extradata: &[u8]) -> Option<ParameterSets> {
        let blobs: Vec<Bytes> = extradata
            .split(|b| *b == b'|')
            .filter(|b| !b.is_empty())
            .map(Bytes::copy_from_slice)
            .collect();
        let (width, height) = if extradata.starts_with(b"wide") {
            (128, 64)
        } else {
            (0, 0)
        };
        Some(ParameterSets {
            blobs,
            width,
            height,
        })
    }

    fn inspect(&mut self, unit: &CompressedUnit) -> Option<ParameterSets> {
        if !unit.flags.codec_config {
            return None;
        }
        self.parse_extradata(&unit.data)
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        stall_invalidate_after_ms: 50,
        stall_abort_after_ms: 200,
        stop_timeout_ms: 500,
        ..Default::default()
    }
}

struct Harness {
    engine: Arc<DecodeEngine>,
    device: Arc<LoopbackDevice>,
    sink: Arc<CollectSink>,
}

fn harness(
    format: StreamFormat,
    parser: Box<dyn ParameterSetParser>,
    device: LoopbackConfig,
    config: EngineConfig,
) -> Harness {
    init_test_logging();
    let device = Arc::new(LoopbackDevice::new(device));
    let sink = Arc::new(CollectSink::default());
    let engine = DecodeEngine::new(device.clone(), format, parser, sink.clone(), config).unwrap();
    Harness {
        engine: Arc::new(engine),
        device,
        sink,
    }
}

fn hevc_harness(device: LoopbackConfig, config: EngineConfig) -> Harness {
    harness(
        StreamFormat::video(Codec::Hevc, 64, 32),
        Box::new(PassthroughParser),
        device,
        config,
    )
}

fn h264_harness(device: LoopbackConfig) -> Harness {
    harness(
        StreamFormat::video(Codec::H264, 64, 32).with_extradata(&b"sps|pps"[..]),
        Box::new(SplitParser),
        device,
        test_config(),
    )
}

fn unit(data: &'static [u8], pts: i64) -> CompressedUnit {
    CompressedUnit::new(data).with_pts(pts)
}

fn config_unit(data: &'static [u8]) -> CompressedUnit {
    CompressedUnit::new(data).with_flags(UnitFlags {
        codec_config: true,
        ..Default::default()
    })
}

fn accept(engine: &DecodeEngine, unit: CompressedUnit) {
    let status = engine.submit(unit).unwrap();
    assert!(matches!(status, SubmitStatus::Accepted), "{:?}", status);
}

fn payloads(device: &LoopbackDevice) -> Vec<(Vec<u8>, bool)> {
    device
        .queued_inputs()
        .into_iter()
        .map(|(data, is_config)| (data.to_vec(), is_config))
        .collect()
}

#[test]
fn test_csd_then_units_in_timestamp_order() {
    let h = h264_harness(LoopbackConfig {
        reorder_depth: 2,
        ..Default::default()
    });
    assert_eq!(h.engine.start().unwrap(), StartOutcome::Started);

    // decode order I P B
    accept(&h.engine, unit(b"i", 0));
    accept(&h.engine, unit(b"p", 66_000));
    accept(&h.engine, unit(b"b", 33_000));
    h.engine.drain().unwrap();

    assert_eq!(h.sink.wait_frames(3), vec![0, 33_000, 66_000]);
    let queued = payloads(&h.device);
    assert_eq!(queued[0], (b"sps".to_vec(), true));
    assert_eq!(queued[1], (b"pps".to_vec(), true));
    assert_eq!(queued[2], (b"i".to_vec(), false));
    assert_eq!(h.engine.stats().frames_delivered, 3);
}

#[test]
fn test_discontinuity_flushes_before_next_unit() {
    let h = h264_harness(LoopbackConfig {
        reorder_depth: 3,
        ..Default::default()
    });
    h.engine.start().unwrap();
    accept(&h.engine, unit(b"a", 0));
    accept(&h.engine, unit(b"b", 33_000));
    accept(&h.engine, unit(b"c", 66_000));
    assert_eq!(h.engine.shared.inner.lock().timestamps.len(), 3);

    let jump = unit(b"d", 500_000).with_flags(UnitFlags {
        discontinuity: true,
        ..Default::default()
    });
    accept(&h.engine, jump);

    // the flush emptied the FIFO; only the new unit is tracked
    assert_eq!(h.engine.shared.inner.lock().timestamps.len(), 1);

    let calls = h.device.calls();
    let flush_at = calls
        .iter()
        .position(|c| matches!(c, DeviceCall::Flush))
        .expect("device flushed");
    let after: Vec<(Vec<u8>, bool)> = calls[flush_at..]
        .iter()
        .filter_map(|c| match c {
            DeviceCall::QueueInput {
                data, is_config, ..
            } => Some((data.to_vec(), *is_config)),
            _ => None,
        })
        .collect();
    assert_eq!(
        after,
        vec![
            (b"sps".to_vec(), true),
            (b"pps".to_vec(), true),
            (b"d".to_vec(), false),
        ]
    );
}

#[test]
fn test_corrupted_unit_is_dropped_after_flush() {
    let h = hevc_harness(LoopbackConfig::default(), test_config());
    h.engine.start().unwrap();
    accept(&h.engine, unit(b"a", 0));
    h.sink.wait_frames(1);

    let bad = unit(b"bad", 33_000).with_flags(UnitFlags {
        corrupted: true,
        ..Default::default()
    });
    assert!(matches!(h.engine.submit(bad).unwrap(), SubmitStatus::Dropped));
    assert_eq!(h.device.flush_count(), 1);
    assert!(!payloads(&h.device).iter().any(|(d, _)| d == b"bad"));
}

#[test]
fn test_stall_invalidates_then_aborts() {
    let h = hevc_harness(
        LoopbackConfig {
            output_slots: 2,
            ..Default::default()
        },
        EngineConfig {
            direct_rendering: true,
            ..test_config()
        },
    );
    h.engine.start().unwrap();
    accept(&h.engine, unit(b"a", 0));
    accept(&h.engine, unit(b"b", 33_000));
    h.sink.wait_frames(2);
    assert_eq!(h.engine.inflight_count(), 2);

    h.device.set_input_stalled(true);
    h.device.clear_calls();
    let started = Instant::now();
    let result = h.engine.submit(unit(b"c", 66_000));
    assert!(matches!(result, Err(EngineError::Stalled(_))), "{:?}", result);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(h.engine.state(), EngineState::Aborted);

    // held pictures were handed back exactly once, without rendering
    let releases: Vec<DeviceCall> = h
        .device
        .calls()
        .into_iter()
        .filter(|c| matches!(c, DeviceCall::ReleaseOutput { .. }))
        .collect();
    assert_eq!(releases.len(), 2);
    assert!(releases
        .iter()
        .all(|c| matches!(c, DeviceCall::ReleaseOutput { render: false, .. })));
    assert_eq!(h.engine.inflight_count(), 0);
    for frame in &h.sink.collected.lock().frames {
        let FramePayload::Direct(buffer) = &frame.payload else {
            panic!("expected a zero-copy frame");
        };
        assert!(!buffer.is_valid());
        assert!(!buffer.render());
    }

    assert_eq!(h.sink.fatal_count(), 1);
    assert!(matches!(h.engine.submit(unit(b"d", 99_000)), Err(EngineError::Aborted)));
    assert!(matches!(h.engine.flush(), Err(EngineError::Aborted)));
    assert_eq!(h.sink.fatal_count(), 1);
}

#[test]
fn test_stall_recovers_after_invalidation() {
    let h = hevc_harness(
        LoopbackConfig {
            output_slots: 2,
            ..Default::default()
        },
        EngineConfig {
            direct_rendering: true,
            ..test_config()
        },
    );
    h.engine.start().unwrap();
    accept(&h.engine, unit(b"a", 0));
    accept(&h.engine, unit(b"b", 33_000));
    h.sink.wait_frames(2);

    // the sink still holds both slots; releasing them unblocks input
    accept(&h.engine, unit(b"c", 66_000));
    assert_eq!(h.engine.state(), EngineState::Running);
    assert_eq!(h.sink.wait_frames(3), vec![0, 33_000, 66_000]);
    assert_eq!(h.sink.fatal_count(), 0);
}

#[test]
fn test_identical_csd_does_not_restart() {
    let h = h264_harness(LoopbackConfig::default());
    h.engine.start().unwrap();
    accept(&h.engine, unit(b"a", 0));

    let status = h.engine.submit(config_unit(b"sps|pps")).unwrap();
    assert!(matches!(status, SubmitStatus::Dropped));
    assert_eq!(h.device.start_count(), 1);
    assert_eq!(h.device.flush_count(), 0);
    assert_eq!(h.engine.stats().restarts, 0);
    assert_eq!(h.engine.shared.inner.lock().csd.cursor(), 2);
}

#[test]
fn test_changed_csd_flushes_and_redelivers() {
    let h = h264_harness(LoopbackConfig::default());
    h.engine.start().unwrap();
    accept(&h.engine, unit(b"a", 0));
    h.sink.wait_frames(1);

    h.engine.submit(config_unit(b"sps2|pps")).unwrap();
    assert_eq!(h.device.flush_count(), 1);
    assert_eq!(h.device.start_count(), 1);

    accept(&h.engine, unit(b"b", 33_000));
    let queued = payloads(&h.device);
    let tail = &queued[queued.len() - 3..];
    assert_eq!(tail[0], (b"sps2".to_vec(), true));
    assert_eq!(tail[1], (b"pps".to_vec(), true));
    assert_eq!(tail[2], (b"b".to_vec(), false));
}

#[test]
fn test_size_change_restarts_device() {
    let h = h264_harness(LoopbackConfig::default());
    h.engine.start().unwrap();
    accept(&h.engine, unit(b"a", 0));
    h.sink.wait_frames(1);

    h.engine.submit(config_unit(b"wide-sps|pps")).unwrap();
    assert_eq!(h.device.start_count(), 2);
    assert_eq!(h.engine.stats().restarts, 1);
    assert_eq!(h.engine.state(), EngineState::Running);

    let last_start = h
        .device
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            DeviceCall::Start(params) => Some(params),
            _ => None,
        })
        .last()
        .unwrap();
    assert!(matches!(
        last_start.format,
        StartFormat::Video {
            width: 128,
            height: 64,
            ..
        }
    ));

    accept(&h.engine, unit(b"b", 33_000));
    h.sink.wait_until(|c| c.frames.iter().any(|f| f.width == 128));
}

#[test]
fn test_stop_interrupts_blocked_flush() {
    let h = hevc_harness(LoopbackConfig::default(), test_config());
    h.engine.start().unwrap();
    accept(&h.engine, unit(b"a", 0));
    h.sink.wait_frames(1);
    // let the output thread block in dequeue_output again
    std::thread::sleep(Duration::from_millis(50));

    h.device.set_flush_wakes_output(false);
    let flusher = {
        let engine = h.engine.clone();
        std::thread::spawn(move || engine.flush())
    };
    std::thread::sleep(Duration::from_millis(50));
    assert!(!flusher.is_finished());

    let started = Instant::now();
    h.engine.stop();
    assert!(started.elapsed() < WAIT);
    assert_eq!(flusher.join().unwrap(), Err(EngineError::Stopped));
    assert_eq!(h.engine.state(), EngineState::Stopped);
    assert!(!h.device.is_started());
    assert!(h.engine.shared.inner.lock().output_thread.is_none());
}

type Hook = Box<dyn FnOnce() + Send>;

/// Loopback wrapper that lingers in `dequeue_output` after a device stop,
/// and can run a hook when the first output buffer comes out
struct HookedDevice {
    device: Arc<LoopbackDevice>,
    exit_delay: Duration,
    on_buffer: Mutex<Option<Hook>>,
}

impl HookedDevice {
    fn new(device: Arc<LoopbackDevice>, exit_delay: Duration) -> Self {
        Self {
            device,
            exit_delay,
            on_buffer: Mutex::new(None),
        }
    }
}

impl DeviceBinding for HookedDevice {
    fn name(&self) -> &str {
        self.device.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.device.capabilities()
    }

    fn start(&self, params: &StartParams) -> Result<(), DeviceError> {
        self.device.start(params)
    }

    fn stop(&self) -> Result<(), DeviceError> {
        self.device.stop()
    }

    fn flush(&self) -> Result<(), DeviceError> {
        self.device.flush()
    }

    fn dequeue_input(&self, timeout: Duration) -> Result<InputSlot, DeviceError> {
        self.device.dequeue_input(timeout)
    }

    fn queue_input(&self, index: usize, buffer: InputBuffer<'_>) -> Result<(), DeviceError> {
        self.device.queue_input(index, buffer)
    }

    fn dequeue_output(&self, timeout: Option<Duration>) -> Result<OutputEvent, DeviceError> {
        let result = self.device.dequeue_output(timeout);
        if !self.device.is_started() {
            std::thread::sleep(self.exit_delay);
        }
        if matches!(result, Ok(OutputEvent::Buffer(_))) {
            if let Some(hook) = self.on_buffer.lock().take() {
                hook();
            }
        }
        result
    }

    fn get_output(&self, event: &OutputEvent) -> Result<Option<OutputDescriptor>, DeviceError> {
        self.device.get_output(event)
    }

    fn release_output(&self, index: usize, render: bool) -> Result<(), DeviceError> {
        self.device.release_output(index, render)
    }
}

#[test]
fn test_stop_during_restart_keeps_device_stopped() {
    init_test_logging();
    let device = Arc::new(LoopbackDevice::new(LoopbackConfig::default()));
    let binding = Arc::new(HookedDevice::new(device.clone(), Duration::from_millis(300)));
    let sink = Arc::new(CollectSink::default());
    let engine = Arc::new(
        DecodeEngine::new(
            binding,
            StreamFormat::video(Codec::H264, 64, 32).with_extradata(&b"sps|pps"[..]),
            Box::new(SplitParser),
            sink.clone(),
            test_config(),
        )
        .unwrap(),
    );
    engine.start().unwrap();
    accept(&engine, unit(b"a", 0));
    sink.wait_frames(1);

    // a size change restarts; stop lands while the old session winds down
    let submitter = {
        let engine = engine.clone();
        std::thread::spawn(move || engine.submit(config_unit(b"wide-sps|pps")))
    };
    std::thread::sleep(Duration::from_millis(100));
    engine.stop();
    assert_eq!(engine.state(), EngineState::Stopped);

    let result = submitter.join().unwrap();
    assert!(matches!(result, Err(EngineError::Stopped)), "{:?}", result);
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(!device.is_started());
    assert_eq!(device.start_count(), 1);
    let inner = engine.shared.inner.lock();
    assert!(!inner.output_running);
    assert!(inner.output_thread.is_none());
}

#[test]
fn test_cancelled_output_thread_returns_its_buffer() {
    init_test_logging();
    let device = Arc::new(LoopbackDevice::new(LoopbackConfig::default()));
    let binding = Arc::new(HookedDevice::new(device.clone(), Duration::ZERO));
    let sink = Arc::new(CollectSink::default());
    let engine = Arc::new(
        DecodeEngine::new(
            binding.clone(),
            StreamFormat::video(Codec::Hevc, 64, 32),
            Box::new(PassthroughParser),
            sink.clone(),
            EngineConfig {
                stop_timeout_ms: 100,
                ..test_config()
            },
        )
        .unwrap(),
    );

    // the session moves on while the output thread is inside dequeue_output
    let weak = Arc::downgrade(&engine);
    *binding.on_buffer.lock() = Some(Box::new(move || {
        if let Some(engine) = weak.upgrade() {
            engine.shared.inner.lock().session += 1;
        }
    }));
    engine.start().unwrap();
    accept(&engine, unit(b"a", 0));

    let released = || {
        device
            .calls()
            .iter()
            .any(|c| matches!(c, DeviceCall::ReleaseOutput { render: false, .. }))
    };
    let deadline = Instant::now() + WAIT;
    while !released() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(released());
    assert!(sink.frame_pts().is_empty());
    engine.stop();
}

#[test]
fn test_submit_during_stop_is_refused() {
    let h = hevc_harness(LoopbackConfig::default(), test_config());
    h.engine.start().unwrap();
    accept(&h.engine, unit(b"a", 0));

    // as seen by a caller while stop() waits for the output thread
    h.engine.shared.inner.lock().stop_requested = true;
    assert!(matches!(h.engine.submit(unit(b"b", 1)), Err(EngineError::Stopped)));
    assert!(matches!(h.engine.flush(), Err(EngineError::Stopped)));
    assert_eq!(h.device.flush_count(), 0);
    h.engine.stop();
    assert_eq!(h.engine.state(), EngineState::Stopped);
}

/// Panics on the first video frame
struct PanickingSink;

impl FrameSink for PanickingSink {
    fn queue_video_frame(&self, _frame: VideoFrame) {
        panic!("sink failure");
    }

    fn queue_audio_sample(&self, _sample: AudioSample) {}
}

#[test]
fn test_output_thread_panic_aborts() {
    init_test_logging();
    let device = Arc::new(LoopbackDevice::new(LoopbackConfig::default()));
    let engine = DecodeEngine::new(
        device.clone(),
        StreamFormat::video(Codec::Hevc, 64, 32),
        Box::new(PassthroughParser),
        Arc::new(PanickingSink),
        test_config(),
    )
    .unwrap();
    engine.start().unwrap();
    accept(&engine, unit(b"a", 0));

    let deadline = Instant::now() + WAIT;
    while engine.state() != EngineState::Aborted && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(engine.state(), EngineState::Aborted);
    assert!(!engine.shared.inner.lock().output_running);

    let started = Instant::now();
    assert!(matches!(engine.flush(), Err(EngineError::Aborted)));
    assert!(started.elapsed() < WAIT);

    engine.stop();
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(!device.is_started());
    assert!(engine.shared.inner.lock().output_thread.is_none());
}

#[test]
fn test_flush_is_idempotent() {
    let h = hevc_harness(LoopbackConfig::default(), test_config());
    h.engine.start().unwrap();
    accept(&h.engine, unit(b"a", 0));
    h.sink.wait_frames(1);

    h.engine.flush().unwrap();
    h.engine.flush().unwrap();
    assert_eq!(h.device.flush_count(), 1);
    assert_eq!(h.engine.stats().flushes, 1);
}

#[test]
fn test_flush_rewinds_csd() {
    let h = h264_harness(LoopbackConfig::default());
    h.engine.start().unwrap();
    accept(&h.engine, unit(b"a", 0));
    assert_eq!(h.engine.shared.inner.lock().csd.cursor(), 2);

    h.engine.flush().unwrap();
    let inner = h.engine.shared.inner.lock();
    assert_eq!(inner.csd.cursor(), 0);
    assert_eq!(inner.csd.len(), 2);
    assert!(inner.timestamps.is_empty());
}

#[test]
fn test_flush_failure_aborts() {
    let h = hevc_harness(LoopbackConfig::default(), test_config());
    h.engine.start().unwrap();
    accept(&h.engine, unit(b"a", 0));
    h.device.fail_next_flush(DeviceError::Failure("flush".into()));

    assert!(matches!(h.engine.flush(), Err(EngineError::Device(_))));
    assert_eq!(h.engine.state(), EngineState::Aborted);
    assert_eq!(h.sink.fatal_count(), 1);
}

#[test]
fn test_deferred_start_until_csd_arrives() {
    let h = harness(
        StreamFormat::video(Codec::H264, 64, 32),
        Box::new(PassthroughParser),
        LoopbackConfig::default(),
        test_config(),
    );
    assert_eq!(h.engine.start().unwrap(), StartOutcome::Deferred);
    assert!(h.engine.is_deferred());

    assert!(matches!(
        h.engine.submit(unit(b"early", 0)).unwrap(),
        SubmitStatus::Deferred
    ));
    assert!(!h.device.is_started());

    assert!(matches!(
        h.engine.submit(config_unit(b"avcc")).unwrap(),
        SubmitStatus::Dropped
    ));
    assert_eq!(h.engine.state(), EngineState::Running);
    assert!(!h.engine.is_deferred());

    accept(&h.engine, unit(b"a", 33_000));
    assert_eq!(
        payloads(&h.device),
        vec![(b"avcc".to_vec(), true), (b"a".to_vec(), false)]
    );
    assert_eq!(h.sink.wait_frames(1), vec![33_000]);
}

#[test]
fn test_submit_requires_start() {
    let h = hevc_harness(LoopbackConfig::default(), test_config());
    assert!(matches!(h.engine.submit(unit(b"a", 0)), Err(EngineError::NotStarted)));
}

#[test]
fn test_dts_only_units_get_fifo_timestamps() {
    let h = hevc_harness(
        LoopbackConfig {
            zero_timestamps: true,
            ..Default::default()
        },
        test_config(),
    );
    h.engine.start().unwrap();
    accept(&h.engine, CompressedUnit::new(&b"a"[..]).with_dts(1_000));
    accept(&h.engine, CompressedUnit::new(&b"b"[..]).with_dts(2_000));
    assert_eq!(h.sink.wait_frames(2), vec![1_000, 2_000]);
}

#[test]
fn test_preroll_outputs_are_dropped() {
    let h = hevc_harness(LoopbackConfig::default(), test_config());
    h.engine.start().unwrap();
    let preroll = unit(b"a", 0).with_flags(UnitFlags {
        preroll: true,
        ..Default::default()
    });
    accept(&h.engine, preroll);
    accept(&h.engine, unit(b"b", 33_000));

    assert_eq!(h.sink.wait_frames(1), vec![33_000]);
    h.engine.drain().unwrap();
    assert_eq!(h.sink.frame_pts(), vec![33_000]);
    assert_eq!(h.engine.stats().outputs_dropped, 1);
}

#[test]
fn test_drain_then_reuse() {
    let h = hevc_harness(LoopbackConfig::default(), test_config());
    h.engine.start().unwrap();
    // nothing queued yet
    h.engine.drain().unwrap();

    accept(&h.engine, unit(b"a", 0));
    accept(&h.engine, unit(b"b", 33_000));
    h.engine.drain().unwrap();
    assert_eq!(h.sink.frame_pts(), vec![0, 33_000]);
    assert_eq!(h.engine.state(), EngineState::Running);

    accept(&h.engine, unit(b"c", 66_000));
    assert_eq!(h.sink.wait_frames(3), vec![0, 33_000, 66_000]);
}

#[test]
fn test_submit_reports_busy() {
    let h = hevc_harness(LoopbackConfig::default(), test_config());
    h.engine.start().unwrap();

    let _input = h.engine.input.lock();
    match h.engine.submit(unit(b"a", 7)).unwrap() {
        SubmitStatus::Busy(unit) => {
            assert_eq!(unit.pts, Some(7));
            assert_eq!(unit.data.as_ref(), b"a");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_stop_is_idempotent() {
    let h = hevc_harness(LoopbackConfig::default(), test_config());
    h.engine.stop();
    h.engine.start().unwrap();
    accept(&h.engine, unit(b"a", 0));
    h.engine.stop();
    h.engine.stop();

    assert_eq!(h.engine.state(), EngineState::Stopped);
    let stops = h
        .device
        .calls()
        .iter()
        .filter(|c| matches!(c, DeviceCall::Stop))
        .count();
    assert_eq!(stops, 1);
    assert!(h.engine.output_format().is_none());
}

#[test]
fn test_stop_releases_held_pictures() {
    let h = hevc_harness(
        LoopbackConfig::default(),
        EngineConfig {
            direct_rendering: true,
            ..test_config()
        },
    );
    h.engine.start().unwrap();
    accept(&h.engine, unit(b"a", 0));
    h.sink.wait_frames(1);
    assert_eq!(h.engine.inflight_count(), 1);

    h.engine.stop();
    assert_eq!(h.engine.inflight_count(), 0);
    // a late release from the consumer does not reach the device
    h.device.clear_calls();
    h.sink.clear_frames();
    assert!(h.device.calls().is_empty());
}

#[test]
fn test_output_error_aborts_once_per_session() {
    let h = hevc_harness(LoopbackConfig::default(), test_config());
    h.engine.start().unwrap();
    h.device.fail_next_output(DeviceError::Failure("boom".into()));
    accept(&h.engine, unit(b"a", 0));

    assert!(h.sink.wait_until(|c| !c.fatal.is_empty()));
    assert_eq!(
        h.sink.collected.lock().fatal[0],
        EngineError::Device(DeviceError::Failure("boom".into()))
    );
    assert!(matches!(h.engine.submit(unit(b"b", 1)), Err(EngineError::Aborted)));

    // a fresh session may report again
    h.engine.stop();
    assert_eq!(h.engine.start().unwrap(), StartOutcome::Started);
    h.device.fail_next_output(DeviceError::Failure("again".into()));
    accept(&h.engine, unit(b"c", 2));
    assert!(h.sink.wait_until(|c| c.fatal.len() == 2));
}

#[test]
fn test_output_format_is_cached() {
    let h = hevc_harness(LoopbackConfig::default(), test_config());
    assert!(h.engine.output_format().is_none());
    h.engine.start().unwrap();
    accept(&h.engine, unit(b"a", 0));
    h.sink.wait_frames(1);

    match h.engine.output_format() {
        Some(OutputFormat::Video(v)) => assert_eq!((v.width, v.height), (64, 32)),
        other => panic!("unexpected {:?}", other),
    }
    let frame_width = h.sink.collected.lock().frames[0].width;
    assert_eq!(frame_width, 64);
}

#[test]
fn test_audio_requires_opt_in() {
    init_test_logging();
    let device = Arc::new(LoopbackDevice::new(LoopbackConfig::default()));
    let result = DecodeEngine::new(
        device,
        StreamFormat::audio(Codec::Opus, 48_000, 2),
        Box::new(PassthroughParser),
        Arc::new(CollectSink::default()),
        test_config(),
    );
    assert!(matches!(result, Err(EngineError::Unsupported(_))));
}

#[test]
fn test_audio_samples_follow_clock() {
    let h = harness(
        StreamFormat::audio(Codec::Opus, 48_000, 2),
        Box::new(PassthroughParser),
        LoopbackConfig::default(),
        EngineConfig {
            enable_audio: true,
            ..test_config()
        },
    );
    h.engine.start().unwrap();
    // 480 stereo frames, 10 ms
    let pcm = Bytes::from(vec![0u8; 480 * 4]);
    accept(&h.engine, CompressedUnit::new(pcm.clone()).with_pts(0));
    accept(&h.engine, CompressedUnit::new(pcm).with_pts(10_000));

    assert!(h.sink.wait_until(|c| c.samples.len() == 2));
    let collected = h.sink.collected.lock();
    let pts: Vec<i64> = collected.samples.iter().map(|s| s.pts).collect();
    assert_eq!(pts, vec![0, 10_000]);
    assert!(collected.samples.iter().all(|s| s.frames == 480 && s.channels == 2));
    assert!(h.engine.shared.inner.lock().timestamps.is_empty());
}

#[test]
fn test_open_uses_registry() {
    init_test_logging();
    registry::register(Arc::new(LoopbackFactory::new(
        "test.engine.wmv3",
        &[Codec::Wmv3.mime()],
        LoopbackConfig::default(),
    )));
    let sink = Arc::new(CollectSink::default());
    let engine = DecodeEngine::open(
        StreamFormat::video(Codec::Wmv3, 64, 32),
        Box::new(PassthroughParser),
        sink.clone(),
        test_config(),
    )
    .unwrap();
    assert_eq!(engine.device().name(), "test.engine.wmv3");
    engine.start().unwrap();
    accept(&engine, unit(b"a", 0));
    assert_eq!(sink.wait_frames(1), vec![0]);
    registry::unregister("test.engine.wmv3");
}

#[test]
fn test_interlaced_rejected_without_support() {
    let h = hevc_harness(LoopbackConfig::default(), test_config());
    h.engine.start().unwrap();
    let field = unit(b"a", 0).with_flags(UnitFlags {
        interlaced: true,
        ..Default::default()
    });
    assert!(matches!(h.engine.submit(field), Err(EngineError::Unsupported(_))));
    assert_eq!(h.engine.state(), EngineState::Running);
}
