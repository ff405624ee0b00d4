//! Loopback device
//!
//! In-process binding that echoes each queued input unit back as one output
//! buffer. It decodes nothing but behaves like a stateful decoder: slots
//! are bounded, the output format is announced before the first buffer,
//! frames can be held back and reordered by timestamp, and flush/stop wake
//! a blocked output dequeue. Waits are real condition-variable waits.
//!
//! Fault knobs let tests stall input, fail output, or keep `dequeue_output`
//! blocked across a flush.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use super::registry::DeviceFactory;
use super::{
    AudioOutputFormat, Capabilities, DeviceBinding, DeviceError, InputBuffer, InputSlot,
    OutputBuffer, OutputDescriptor, OutputEvent, OutputFormat, StartFormat, StartParams,
    VideoOutputFormat,
};

/// Loopback device settings
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub name: String,
    pub input_slots: usize,
    /// Frames in flight between queue_input and release_output
    pub output_slots: usize,
    /// Largest accepted input payload
    pub input_capacity: usize,
    /// Frames held back before the lowest timestamp is emitted
    pub reorder_depth: usize,
    /// Report 0 instead of the queued timestamp
    pub zero_timestamps: bool,
    pub direct_rendering: bool,
    pub interlaced: bool,
    /// Video shape to announce instead of one derived from the start size
    pub video_format: Option<VideoOutputFormat>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            name: "loopback".to_string(),
            input_slots: 4,
            output_slots: 8,
            input_capacity: 1 << 20,
            reorder_depth: 0,
            zero_timestamps: false,
            direct_rendering: true,
            interlaced: false,
            video_format: None,
        }
    }
}

/// Recorded binding call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Start(StartParams),
    Stop,
    Flush,
    QueueInput {
        index: usize,
        data: Bytes,
        pts: Option<i64>,
        is_config: bool,
        eos: bool,
    },
    ReleaseOutput {
        index: usize,
        render: bool,
    },
}

struct Frame {
    pts: i64,
    data: Bytes,
    eos: bool,
}

#[derive(Default)]
struct State {
    started: bool,
    params: Option<StartParams>,
    format: Option<OutputFormat>,
    format_pending: bool,
    free_inputs: VecDeque<usize>,
    dequeued_inputs: HashSet<usize>,
    free_outputs: VecDeque<usize>,
    /// Queued frames not yet assigned an output slot
    pending: Vec<Frame>,
    ready: VecDeque<(usize, Frame)>,
    held: Vec<Option<Frame>>,
    eos_queued: bool,
    /// Set by flush; the current or next `dequeue_output` returns try-again
    wake_output: bool,
    stall_input: bool,
    flush_wakes_output: bool,
    fail_output: Option<DeviceError>,
    fail_flush: Option<DeviceError>,
}

impl State {
    fn in_flight(&self) -> usize {
        self.pending.len() + self.ready.len() + self.held.iter().filter(|h| h.is_some()).count()
    }

    fn reset_slots(&mut self, config: &LoopbackConfig) {
        self.free_inputs = (0..config.input_slots).collect();
        self.dequeued_inputs.clear();
        self.free_outputs = (0..config.output_slots).collect();
        self.pending.clear();
        self.ready.clear();
        self.held = (0..config.output_slots).map(|_| None).collect();
        self.eos_queued = false;
        self.wake_output = false;
    }

    /// Move frames from the reorder buffer into output slots
    fn promote(&mut self, reorder_depth: usize) {
        loop {
            let drain_all = self.eos_queued;
            if self.pending.is_empty() || (!drain_all && self.pending.len() <= reorder_depth) {
                return;
            }
            let Some(index) = self.free_outputs.pop_front() else {
                return;
            };
            // lowest timestamp first, the EOS marker always last
            let pos = self
                .pending
                .iter()
                .enumerate()
                .min_by_key(|(_, f)| (f.eos, f.pts))
                .map(|(i, _)| i)
                .unwrap_or(0);
            let frame = self.pending.remove(pos);
            self.ready.push_back((index, frame));
        }
    }
}

pub struct LoopbackDevice {
    config: LoopbackConfig,
    state: Mutex<State>,
    cond: Condvar,
    calls: Mutex<Vec<DeviceCall>>,
}

impl LoopbackDevice {
    pub fn new(mut config: LoopbackConfig) -> Self {
        config.input_slots = config.input_slots.max(1);
        config.output_slots = config.output_slots.max(1);
        // a reorder buffer as large as the slot pool could never emit
        config.reorder_depth = config.reorder_depth.min(config.output_slots - 1);
        let state = State {
            flush_wakes_output: true,
            ..Default::default()
        };
        Self {
            config,
            state: Mutex::new(state),
            cond: Condvar::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, call: DeviceCall) {
        self.calls.lock().push(call);
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn flush_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, DeviceCall::Flush))
            .count()
    }

    pub fn start_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, DeviceCall::Start(_)))
            .count()
    }

    /// Payloads queued as input, config and ordinary alike
    pub fn queued_inputs(&self) -> Vec<(Bytes, bool)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                DeviceCall::QueueInput { data, is_config, .. } => Some((data.clone(), *is_config)),
                _ => None,
            })
            .collect()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Refuse every input slot while set
    pub fn set_input_stalled(&self, stalled: bool) {
        self.state.lock().stall_input = stalled;
        self.cond.notify_all();
    }

    /// When false, a flush does not wake a blocked `dequeue_output`; only stop does
    pub fn set_flush_wakes_output(&self, wakes: bool) {
        self.state.lock().flush_wakes_output = wakes;
    }

    /// Make the next `dequeue_output` fail
    pub fn fail_next_output(&self, error: DeviceError) {
        self.state.lock().fail_output = Some(error);
        self.cond.notify_all();
    }

    /// Make the next `flush` fail
    pub fn fail_next_flush(&self, error: DeviceError) {
        self.state.lock().fail_flush = Some(error);
    }

    fn initial_format(&self, params: &StartParams) -> OutputFormat {
        match params.format {
            StartFormat::Video { width, height, .. } => {
                let format = self.config.video_format.unwrap_or(VideoOutputFormat {
                    width: width as i32,
                    height: height as i32,
                    stride: width as i32,
                    slice_height: height as i32,
                    color_format: 21,
                    crop_left: 0,
                    crop_top: 0,
                    crop_right: width as i32 - 1,
                    crop_bottom: height as i32 - 1,
                });
                OutputFormat::Video(format)
            }
            StartFormat::Audio {
                sample_rate,
                channels,
            } => OutputFormat::Audio(AudioOutputFormat {
                channels: channels as i32,
                channel_mask: 0,
                sample_rate: sample_rate as i32,
            }),
        }
    }

    fn direct_output(&self, state: &State) -> bool {
        matches!(
            state.params.as_ref().map(|p| &p.format),
            Some(StartFormat::Video {
                direct_rendering: true,
                ..
            })
        ) && self.config.direct_rendering
    }
}

impl DeviceBinding for LoopbackDevice {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            direct_rendering: self.config.direct_rendering,
            interlaced: self.config.interlaced,
        }
    }

    fn start(&self, params: &StartParams) -> Result<(), DeviceError> {
        self.record(DeviceCall::Start(params.clone()));
        let mut state = self.state.lock();
        if state.started {
            return Err(DeviceError::Configure("already started".into()));
        }
        if let StartFormat::Video { width, height, .. } = params.format {
            if width == 0 || height == 0 {
                return Err(DeviceError::Configure(format!(
                    "invalid video size {}x{}",
                    width, height
                )));
            }
        }
        state.reset_slots(&self.config);
        state.format = Some(self.initial_format(params));
        state.format_pending = true;
        state.params = Some(params.clone());
        state.started = true;
        info!("Loopback device {} started for {}", self.config.name, params.mime);
        Ok(())
    }

    fn stop(&self) -> Result<(), DeviceError> {
        self.record(DeviceCall::Stop);
        let mut state = self.state.lock();
        if !state.started {
            return Ok(());
        }
        state.reset_slots(&self.config);
        state.started = false;
        state.params = None;
        self.cond.notify_all();
        debug!("Loopback device {} stopped", self.config.name);
        Ok(())
    }

    fn flush(&self) -> Result<(), DeviceError> {
        self.record(DeviceCall::Flush);
        let mut state = self.state.lock();
        if !state.started {
            return Err(DeviceError::NotStarted);
        }
        if let Some(error) = state.fail_flush.take() {
            return Err(error);
        }
        state.reset_slots(&self.config);
        state.wake_output = state.flush_wakes_output;
        self.cond.notify_all();
        Ok(())
    }

    fn dequeue_input(&self, timeout: Duration) -> Result<InputSlot, DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if !state.started {
                return Err(DeviceError::NotStarted);
            }
            if !state.stall_input
                && !state.free_inputs.is_empty()
                && state.in_flight() < self.config.output_slots
            {
                if let Some(index) = state.free_inputs.pop_front() {
                    state.dequeued_inputs.insert(index);
                    return Ok(InputSlot::Index(index));
                }
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return Ok(InputSlot::TryAgain);
            }
        }
    }

    fn queue_input(&self, index: usize, buffer: InputBuffer<'_>) -> Result<(), DeviceError> {
        let data = Bytes::copy_from_slice(buffer.data);
        self.record(DeviceCall::QueueInput {
            index,
            data: data.clone(),
            pts: buffer.pts,
            is_config: buffer.is_config,
            eos: buffer.eos,
        });

        let mut state = self.state.lock();
        if !state.started {
            return Err(DeviceError::NotStarted);
        }
        if !state.dequeued_inputs.remove(&index) {
            return Err(DeviceError::InvalidIndex(index));
        }
        state.free_inputs.push_back(index);
        if data.len() > self.config.input_capacity {
            return Err(DeviceError::BufferTooSmall {
                size: data.len(),
                capacity: self.config.input_capacity,
            });
        }

        if !buffer.is_config {
            let pts = if self.config.zero_timestamps {
                0
            } else {
                buffer.pts.unwrap_or(0)
            };
            if buffer.eos {
                state.eos_queued = true;
            }
            state.pending.push(Frame {
                pts,
                data,
                eos: buffer.eos,
            });
            state.promote(self.config.reorder_depth);
        }
        self.cond.notify_all();
        Ok(())
    }

    fn dequeue_output(&self, timeout: Option<Duration>) -> Result<OutputEvent, DeviceError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if !state.started {
                return Err(DeviceError::NotStarted);
            }
            if let Some(error) = state.fail_output.take() {
                return Err(error);
            }
            if std::mem::take(&mut state.wake_output) {
                return Ok(OutputEvent::TryAgain);
            }
            if state.format_pending && !state.ready.is_empty() {
                state.format_pending = false;
                return Ok(OutputEvent::FormatChanged);
            }
            if let Some((index, frame)) = state.ready.pop_front() {
                state.held[index] = Some(frame);
                return Ok(OutputEvent::Buffer(index));
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return Ok(OutputEvent::TryAgain);
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    fn get_output(&self, event: &OutputEvent) -> Result<Option<OutputDescriptor>, DeviceError> {
        let state = self.state.lock();
        match *event {
            OutputEvent::Buffer(index) => {
                let frame = state
                    .held
                    .get(index)
                    .and_then(|h| h.as_ref())
                    .ok_or(DeviceError::InvalidIndex(index))?;
                let data = if self.direct_output(&state) {
                    None
                } else {
                    Some(frame.data.clone())
                };
                Ok(Some(OutputDescriptor::Buffer(OutputBuffer {
                    index,
                    pts: frame.pts,
                    data,
                    eos: frame.eos,
                })))
            }
            OutputEvent::FormatChanged => Ok(state.format.map(OutputDescriptor::Format)),
            OutputEvent::TryAgain | OutputEvent::BuffersChanged => Ok(None),
        }
    }

    fn release_output(&self, index: usize, render: bool) -> Result<(), DeviceError> {
        self.record(DeviceCall::ReleaseOutput { index, render });
        let mut state = self.state.lock();
        match state.held.get_mut(index).and_then(|h| h.take()) {
            Some(_) => {
                state.free_outputs.push_back(index);
                state.promote(self.config.reorder_depth);
                self.cond.notify_all();
                Ok(())
            }
            None => Err(DeviceError::InvalidIndex(index)),
        }
    }
}

/// Registry factory producing loopback devices for a fixed MIME list
pub struct LoopbackFactory {
    name: String,
    mimes: Vec<String>,
    config: LoopbackConfig,
}

impl LoopbackFactory {
    pub fn new(name: &str, mimes: &[&str], config: LoopbackConfig) -> Self {
        Self {
            name: name.to_string(),
            mimes: mimes.iter().map(|m| m.to_string()).collect(),
            config,
        }
    }
}

impl DeviceFactory for LoopbackFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, mime: &str) -> bool {
        self.mimes.iter().any(|m| m == mime)
    }

    fn create(&self) -> Result<Arc<dyn DeviceBinding>, DeviceError> {
        let config = LoopbackConfig {
            name: self.name.clone(),
            ..self.config.clone()
        };
        Ok(Arc::new(LoopbackDevice::new(config)))
    }
}
