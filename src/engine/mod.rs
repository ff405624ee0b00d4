//! Decode Engine
//!
//! Drives one device binding on behalf of one elementary stream.
//!
//! Callers feed compressed units through [`DecodeEngine::submit`]; a
//! dedicated output thread dequeues decoded buffers and hands them to the
//! sink. Both sides share one engine lock and condition variable:
//!
//! - the submit path blocks in `dequeue_input` and the output thread blocks
//!   in `dequeue_output`, each with the engine lock released
//! - a flush clears engine-side state, flushes the device (which wakes the
//!   output thread) and waits until the output thread acknowledges
//! - stop interrupts everything, including a flush waiting for its
//!   acknowledgment, and never waits longer than the configured timeout for
//!   the output thread
//!
//! Held zero-copy pictures live in the inflight table, behind its own lock,
//! so consumers can release them from any thread.

mod error;
mod output;
mod stall;

#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use stall::{StallAction, StallPolicy};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::adapter::{self, InputContext, ParameterSetParser, StartDecision, StreamAdapter, StreamFormat};
use crate::config::EngineConfig;
use crate::device::{registry, DeviceBinding, InputBuffer, InputSlot, OutputFormat};
use crate::media::{CompressedUnit, CsdQueue, FrameSink, InflightTable, StreamKind, TimestampFifo};
use crate::utils::StallTimer;

/// Lifecycle state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Flushing,
    /// Terminal until stop()
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Device start postponed until the stream supplies what is missing
    Deferred,
}

/// Outcome of a submit
#[derive(Debug)]
pub enum SubmitStatus {
    /// Unit was queued to the device
    Accepted,
    /// Unit was consumed without reaching the device
    Dropped,
    /// Unit was consumed while the device start is still deferred
    Deferred,
    /// Another input-side operation is in progress; resubmit unchanged
    Busy(CompressedUnit),
}

/// Counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub units_accepted: u64,
    pub units_dropped: u64,
    pub frames_delivered: u64,
    pub samples_delivered: u64,
    pub outputs_dropped: u64,
    pub flushes: u64,
    pub restarts: u64,
}

#[derive(Debug, Default)]
struct Stats {
    units_accepted: AtomicU64,
    units_dropped: AtomicU64,
    frames_delivered: AtomicU64,
    samples_delivered: AtomicU64,
    outputs_dropped: AtomicU64,
    flushes: AtomicU64,
    restarts: AtomicU64,
}

impl Stats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            units_accepted: self.units_accepted.load(Ordering::Relaxed),
            units_dropped: self.units_dropped.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            samples_delivered: self.samples_delivered.load(Ordering::Relaxed),
            outputs_dropped: self.outputs_dropped.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

/// State guarded by the engine lock
struct Inner {
    state: EngineState,
    /// Start postponed, retried on each submit
    deferred: bool,
    csd: CsdQueue,
    timestamps: TimestampFifo,
    adapter: Box<dyn StreamAdapter>,
    direct_rendering: bool,
    /// An input was queued since start/flush
    output_ready: bool,
    /// An input slot was dequeued since start/flush
    input_dequeued: bool,
    flush_requested: bool,
    stop_requested: bool,
    /// Bumped by every user stop; a restart in progress gives up when it moves
    stop_generation: u64,
    /// Incremented per device session; output threads exit when it moves on
    session: u64,
    output_running: bool,
    output_thread: Option<JoinHandle<()>>,
    format: Option<OutputFormat>,
    preroll_end: Option<i64>,
    eos_reached: bool,
}

struct Shared {
    device: Arc<dyn DeviceBinding>,
    inner: Mutex<Inner>,
    cond: Condvar,
    sink: Arc<dyn FrameSink>,
    inflight: Arc<InflightTable>,
    config: EngineConfig,
    stall: StallPolicy,
    stats: Stats,
    fatal_reported: AtomicBool,
}

type Guard<'a> = MutexGuard<'a, Inner>;

/// Decoder front end for one stream
pub struct DecodeEngine {
    shared: Arc<Shared>,
    /// Serializes submit, drain and flush callers. stop() does not take it.
    input: Mutex<()>,
}

impl DecodeEngine {
    /// Create an engine around an existing binding. The device is not started.
    pub fn new(
        device: Arc<dyn DeviceBinding>,
        format: StreamFormat,
        parser: Box<dyn ParameterSetParser>,
        sink: Arc<dyn FrameSink>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        if format.codec.kind() == StreamKind::Audio && !config.enable_audio {
            return Err(EngineError::Unsupported("audio decoding is disabled".into()));
        }

        info!("Creating decode engine for {} on {}", format.codec, device.name());
        let adapter = adapter::for_stream(format, device.name(), parser);
        let inner = Inner {
            state: EngineState::Stopped,
            deferred: false,
            csd: CsdQueue::new(),
            timestamps: TimestampFifo::new(config.timestamp_fifo_capacity),
            adapter,
            direct_rendering: false,
            output_ready: false,
            input_dequeued: false,
            flush_requested: false,
            stop_requested: false,
            stop_generation: 0,
            session: 0,
            output_running: false,
            output_thread: None,
            format: None,
            preroll_end: None,
            eos_reached: false,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                inflight: InflightTable::new(device.clone()),
                device,
                inner: Mutex::new(inner),
                cond: Condvar::new(),
                sink,
                stall: StallPolicy::from_config(&config),
                config,
                stats: Stats::default(),
                fatal_reported: AtomicBool::new(false),
            }),
            input: Mutex::new(()),
        })
    }

    /// Create an engine on the first registered decoder for the stream's codec
    pub fn open(
        format: StreamFormat,
        parser: Box<dyn ParameterSetParser>,
        sink: Arc<dyn FrameSink>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let device = registry::create_decoder(format.codec)?;
        Self::new(device, format, parser, sink, config)
    }

    /// Start the device, or defer until the stream provides what it needs
    pub fn start(&self) -> Result<StartOutcome, EngineError> {
        let _input = self.input.lock();
        let mut inner = self.shared.inner.lock();
        match inner.state {
            EngineState::Aborted => Err(EngineError::Aborted),
            EngineState::Running | EngineState::Flushing => Ok(StartOutcome::Started),
            EngineState::Stopped | EngineState::Starting => self.shared.start_locked(&mut inner),
        }
    }

    /// Submit one compressed unit.
    ///
    /// Returns `Busy` with the unit untouched when a flush or drain is in
    /// progress on another thread.
    pub fn submit(&self, mut unit: CompressedUnit) -> Result<SubmitStatus, EngineError> {
        let Some(_input) = self.input.try_lock() else {
            return Ok(SubmitStatus::Busy(unit));
        };
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        shared.check_usable(&inner)?;

        if unit.flags.discontinuity || unit.flags.corrupted {
            shared.flush_locked(&mut inner)?;
            if unit.flags.corrupted {
                debug!("Dropping corrupted unit");
                Stats::bump(&shared.stats.units_dropped);
                return Ok(SubmitStatus::Dropped);
            }
        }

        let started = inner.state == EngineState::Running;
        let capabilities = shared.device.capabilities();
        let action = {
            let Inner { adapter, csd, .. } = &mut *inner;
            let mut ctx = InputContext {
                csd,
                started,
                capabilities,
            };
            adapter.on_new_input(&mut unit, &mut ctx)?
        };

        let mut start_attempted = false;
        if action.restart {
            shared.restart_locked(&mut inner)?;
            start_attempted = true;
        } else if action.flush && started {
            shared.flush_locked(&mut inner)?;
        }

        if action.drop {
            Stats::bump(&shared.stats.units_dropped);
            return Ok(SubmitStatus::Dropped);
        }

        if inner.state != EngineState::Running {
            if !start_attempted {
                shared.start_locked(&mut inner)?;
            }
            if inner.state != EngineState::Running {
                Stats::bump(&shared.stats.units_dropped);
                return Ok(SubmitStatus::Deferred);
            }
        }

        if unit.flags.preroll {
            if let Some(ts) = unit.timestamp() {
                inner.preroll_end = Some(inner.preroll_end.map_or(ts, |end| end.max(ts)));
            }
        }

        shared.queue_locked(&mut inner, Some(&unit))?;
        Stats::bump(&shared.stats.units_accepted);
        Ok(SubmitStatus::Accepted)
    }

    /// Signal end of stream and wait until every queued unit came out.
    /// The device is flushed afterwards so new input can follow.
    pub fn drain(&self) -> Result<(), EngineError> {
        let _input = self.input.lock();
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        shared.check_usable(&inner)?;
        if inner.state != EngineState::Running || !inner.output_ready {
            return Ok(());
        }

        shared.queue_locked(&mut inner, None)?;
        while !inner.eos_reached
            && inner.state != EngineState::Aborted
            && !inner.stop_requested
        {
            shared.cond.wait(&mut inner);
        }
        shared.check_interrupted(&inner)?;
        debug!("Drain complete");
        shared.flush_locked(&mut inner)
    }

    /// Discard everything in flight. Returns once the output thread has
    /// stood down, so no stale output reaches the sink afterwards.
    pub fn flush(&self) -> Result<(), EngineError> {
        let _input = self.input.lock();
        let mut inner = self.shared.inner.lock();
        if inner.state == EngineState::Aborted {
            return Err(EngineError::Aborted);
        }
        self.shared.flush_locked(&mut inner)
    }

    /// Stop the device and the output thread. Safe from any state and from
    /// any thread, including while a flush is waiting.
    pub fn stop(&self) {
        let mut inner = self.shared.inner.lock();
        inner.stop_generation += 1;
        self.shared.stop_locked(&mut inner);
    }

    pub fn state(&self) -> EngineState {
        self.shared.inner.lock().state
    }

    /// Start is waiting for stream data
    pub fn is_deferred(&self) -> bool {
        self.shared.inner.lock().deferred
    }

    /// Last output format reported by the device
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.shared.inner.lock().format
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.stats.snapshot()
    }

    /// Zero-copy pictures currently held by consumers
    pub fn inflight_count(&self) -> usize {
        self.shared.inflight.len()
    }

    pub fn device(&self) -> &Arc<dyn DeviceBinding> {
        &self.shared.device
    }
}

impl Drop for DecodeEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn check_usable(&self, inner: &Inner) -> Result<(), EngineError> {
        match inner.state {
            EngineState::Aborted => Err(EngineError::Aborted),
            EngineState::Stopped if !inner.deferred => Err(EngineError::NotStarted),
            // a stop is still waiting for the output thread
            _ if inner.stop_requested => Err(EngineError::Stopped),
            _ => Ok(()),
        }
    }

    /// Error for a wait cut short by stop or abort
    fn check_interrupted(&self, inner: &Inner) -> Result<(), EngineError> {
        if inner.stop_requested {
            Err(EngineError::Stopped)
        } else if inner.state == EngineState::Aborted {
            Err(EngineError::Aborted)
        } else {
            Ok(())
        }
    }

    fn start_locked(self: &Arc<Self>, inner: &mut Guard<'_>) -> Result<StartOutcome, EngineError> {
        inner.state = EngineState::Starting;
        inner.stop_requested = false;
        let direct_rendering = self.config.direct_rendering
            && self.device.capabilities().direct_rendering
            && inner.adapter.kind() == StreamKind::Video;

        let decision = {
            let Inner { adapter, csd, .. } = &mut **inner;
            adapter.start_params(csd, direct_rendering)
        };
        let params = match decision {
            Ok(StartDecision::Ready(params)) => params,
            Ok(StartDecision::Defer(reason)) => {
                if !inner.deferred {
                    warn!("Deferring decoder start: {}", reason);
                }
                inner.state = EngineState::Stopped;
                inner.deferred = true;
                return Ok(StartOutcome::Deferred);
            }
            Err(e) => {
                inner.state = EngineState::Stopped;
                inner.deferred = false;
                return Err(e);
            }
        };

        if let Err(e) = self.device.start(&params) {
            error!("Failed to start {}: {}", self.device.name(), e);
            inner.state = EngineState::Stopped;
            inner.deferred = false;
            return Err(e.into());
        }

        inner.session += 1;
        self.fatal_reported.store(false, Ordering::Release);
        inner.direct_rendering = direct_rendering;
        inner.csd.rewind();
        inner.timestamps.clear();
        inner.output_ready = false;
        inner.input_dequeued = false;
        inner.flush_requested = false;
        inner.format = None;
        inner.preroll_end = None;
        inner.eos_reached = false;

        if let Err(e) = self.spawn_output_locked(inner) {
            let _ = self.device.stop();
            inner.state = EngineState::Stopped;
            inner.deferred = false;
            return Err(e);
        }

        inner.state = EngineState::Running;
        inner.deferred = false;
        info!(
            "Started {} for {} (direct rendering: {})",
            self.device.name(),
            params.mime,
            direct_rendering
        );
        Ok(StartOutcome::Started)
    }

    fn spawn_output_locked(self: &Arc<Self>, inner: &mut Guard<'_>) -> Result<(), EngineError> {
        let shared = self.clone();
        let session = inner.session;
        let handle = std::thread::Builder::new()
            .name("hwcodec-output".into())
            .spawn(move || output::run(shared, session))
            .map_err(|e| EngineError::Configuration(format!("failed to spawn output thread: {}", e)))?;
        inner.output_running = true;
        inner.output_thread = Some(handle);
        Ok(())
    }

    /// Stop the session and start a new one with the current CSD
    fn restart_locked(self: &Arc<Self>, inner: &mut Guard<'_>) -> Result<StartOutcome, EngineError> {
        if inner.state == EngineState::Running {
            info!("Restarting decoder");
            Stats::bump(&self.stats.restarts);
            let generation = inner.stop_generation;
            self.stop_locked(inner);
            if inner.stop_generation != generation {
                info!("Stopped during restart, not starting again");
                return Err(EngineError::Stopped);
            }
        }
        self.start_locked(inner)
    }

    fn flush_locked(self: &Arc<Self>, inner: &mut Guard<'_>) -> Result<(), EngineError> {
        match inner.state {
            EngineState::Aborted => return Err(EngineError::Aborted),
            EngineState::Stopped | EngineState::Starting => {
                inner.csd.rewind();
                return Ok(());
            }
            EngineState::Running | EngineState::Flushing if inner.stop_requested => {
                return Err(EngineError::Stopped);
            }
            EngineState::Running | EngineState::Flushing => {}
        }

        // nothing went in since the last start/flush
        if !inner.input_dequeued && !inner.output_ready && inner.output_running {
            inner.csd.rewind();
            return Ok(());
        }

        inner.state = EngineState::Flushing;
        inner.flush_requested = true;
        let input_dequeued = inner.input_dequeued;
        inner.input_dequeued = false;
        inner.output_ready = false;
        inner.timestamps.clear();
        inner.csd.rewind();
        inner.preroll_end = None;
        inner.eos_reached = false;
        inner.adapter.on_flush(&self.inflight);

        if input_dequeued {
            if let Err(e) = self.device.flush() {
                return Err(self.abort_locked(inner, e.into()));
            }
        }
        Stats::bump(&self.stats.flushes);

        if !inner.output_running {
            // output thread ended at end of stream
            inner.flush_requested = false;
            if let Some(handle) = inner.output_thread.take() {
                if MutexGuard::unlocked(inner, || handle.join()).is_err() {
                    warn!("Output thread panicked before the flush");
                }
                // stop() may have run while joining
                self.check_interrupted(inner)?;
            }
            if let Err(e) = self.spawn_output_locked(inner) {
                return Err(self.abort_locked(inner, e));
            }
            inner.state = EngineState::Running;
            return Ok(());
        }

        self.cond.notify_all();
        while inner.flush_requested
            && inner.state != EngineState::Aborted
            && !inner.stop_requested
        {
            self.cond.wait(inner);
        }
        self.check_interrupted(inner)?;

        inner.state = EngineState::Running;
        debug!("Flush acknowledged");
        Ok(())
    }

    /// Send pending CSD and then `unit` (or end of stream when `None`)
    fn queue_locked(&self, inner: &mut Guard<'_>, unit: Option<&CompressedUnit>) -> Result<(), EngineError> {
        let timeout = self.config.input_dequeue_timeout();
        let mut timer = StallTimer::new();
        let mut invalidated = false;
        let mut unit_sent = false;

        loop {
            let (data, pts, is_config) = match inner.csd.next_pending() {
                Some(entry) => (entry.data().clone(), None, true),
                None if unit_sent => return Ok(()),
                None => match unit {
                    Some(unit) => (unit.data.clone(), unit.timestamp(), false),
                    None => (Bytes::new(), None, false),
                },
            };
            let eos = unit.is_none() && !is_config;

            let device = self.device.clone();
            let slot = MutexGuard::unlocked(inner, || device.dequeue_input(timeout));
            self.check_interrupted(inner)?;

            let index = match slot {
                Ok(InputSlot::Index(index)) => index,
                Ok(InputSlot::TryAgain) => {
                    let elapsed = timer.tick();
                    match self.stall.decide(elapsed, invalidated) {
                        StallAction::Wait => {}
                        StallAction::InvalidateInflight => {
                            warn!(
                                "No input slot for {:?}, releasing {} held pictures",
                                elapsed,
                                self.inflight.len()
                            );
                            self.inflight.invalidate_all();
                            invalidated = true;
                        }
                        StallAction::Fatal => {
                            error!("No input slot after {} attempts", timer.attempts());
                            return Err(self.abort_locked(inner, EngineError::Stalled(elapsed)));
                        }
                    }
                    continue;
                }
                Err(e) => return Err(self.abort_locked(inner, e.into())),
            };
            timer.reset();
            invalidated = false;
            inner.input_dequeued = true;

            let buffer = InputBuffer {
                data: &data,
                pts,
                is_config,
                eos,
            };
            if let Err(e) = self.device.queue_input(index, buffer) {
                return Err(self.abort_locked(inner, e.into()));
            }

            if is_config {
                inner.csd.mark_sent();
            } else {
                unit_sent = true;
                if let Some(unit) = unit {
                    if inner.adapter.tracks_timestamps() {
                        // the device already carries a real pts; only dts-stamped units need correcting
                        let ts = if unit.pts.is_some() { None } else { unit.dts };
                        inner.timestamps.put(ts);
                    }
                }
            }
            inner.output_ready = true;
            self.cond.notify_all();
        }
    }

    /// Move to `Aborted` and report once. Returns the error for the caller.
    fn abort_locked(&self, inner: &mut Guard<'_>, error: EngineError) -> EngineError {
        if inner.state == EngineState::Aborted {
            return EngineError::Aborted;
        }
        error!("Decoder {} aborted: {}", self.device.name(), error);
        inner.state = EngineState::Aborted;
        self.cond.notify_all();
        if !self.fatal_reported.swap(true, Ordering::AcqRel) {
            let sink = self.sink.clone();
            MutexGuard::unlocked(inner, || sink.on_fatal_error(&error));
        }
        error
    }

    fn stop_locked(&self, inner: &mut Guard<'_>) {
        if !Self::is_active(inner) && !inner.output_running && inner.output_thread.is_none() {
            inner.state = EngineState::Stopped;
            inner.deferred = false;
            return;
        }

        // waits below drop the lock, so a new session may appear meanwhile
        loop {
            let session = inner.session;
            self.stop_session_locked(inner, session);
            if inner.session == session {
                break;
            }
            warn!("Session {} started while stopping, stopping it too", inner.session);
        }

        inner.state = EngineState::Stopped;
        inner.deferred = false;
        inner.flush_requested = false;
        inner.output_ready = false;
        inner.input_dequeued = false;
        inner.format = None;
        inner.timestamps.clear();
        self.cond.notify_all();
        info!("Stopped {}", self.device.name());
    }

    fn is_active(inner: &Inner) -> bool {
        matches!(
            inner.state,
            EngineState::Running | EngineState::Flushing | EngineState::Aborted
        )
    }

    fn stop_session_locked(&self, inner: &mut Guard<'_>, session: u64) {
        inner.stop_requested = true;
        self.cond.notify_all();

        // an aborted device gets its slots back through stop alone
        let released = if inner.state == EngineState::Aborted {
            self.inflight.detach_all()
        } else {
            self.inflight.invalidate_all()
        };
        if released > 0 {
            debug!("Released {} held pictures on stop", released);
        }
        if Self::is_active(inner) {
            if let Err(e) = self.device.stop() {
                warn!("Device stop failed: {}", e);
            }
        }

        let deadline = Instant::now() + self.config.stop_timeout();
        while inner.output_running && inner.session == session {
            if self.cond.wait_until(inner, deadline).timed_out() {
                break;
            }
        }
        if inner.session != session {
            return;
        }
        match inner.output_thread.take() {
            Some(handle) if !inner.output_running => {
                if MutexGuard::unlocked(inner, || handle.join()).is_err() {
                    warn!("Output thread of session {} panicked", session);
                }
            }
            Some(_) => {
                warn!(
                    "Output thread did not exit within {:?}, detaching it",
                    self.config.stop_timeout()
                );
                inner.output_running = false;
            }
            None => {}
        }
    }

    /// Adopt a format reported by the device
    fn apply_format_locked(&self, inner: &mut Guard<'_>, format: OutputFormat) -> Result<(), EngineError> {
        inner.adapter.on_format(&format)?;
        inner.format = Some(format);
        Ok(())
    }
}
