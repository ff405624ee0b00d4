//! Output-draining thread
//!
//! The only caller of the device's blocking `dequeue_output`. Acknowledges
//! flushes, keeps the cached output format current and delivers decoded
//! output to the sink outside the engine lock.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::MutexGuard;

use super::{EngineState, Guard, Inner, Shared, Stats};
use crate::adapter::{Decoded, OutputContext};
use crate::device::{OutputDescriptor, OutputEvent};
use crate::media::FrameSink;

pub(super) fn run(shared: Arc<Shared>, session: u64) {
    debug!("Output thread started (session {})", session);
    let _exit = ExitGuard {
        shared: shared.clone(),
        session,
    };
    let mut inner = shared.inner.lock();

    while wait_for_work(&shared, &mut inner, session) {
        let device = shared.device.clone();
        let timeout = shared.config.output_dequeue_timeout();
        let result = MutexGuard::unlocked(&mut inner, || device.dequeue_output(timeout));

        if is_cancelled(&inner, session) {
            if let Ok(OutputEvent::Buffer(index)) = result {
                if let Err(e) = device.release_output(index, false) {
                    debug!("Output buffer {} not released on exit: {}", index, e);
                }
            }
            break;
        }

        let event = match result {
            Ok(event) => event,
            Err(e) => {
                shared.abort_locked(&mut inner, e.into());
                break;
            }
        };

        if inner.flush_requested {
            // anything dequeued before the flush is stale, except format news
            match event {
                OutputEvent::Buffer(index) => {
                    if let Err(e) = shared.device.release_output(index, false) {
                        debug!("Stale output buffer {} not released: {}", index, e);
                    }
                }
                OutputEvent::FormatChanged => {
                    if !handle_format(&shared, &mut inner, &event) {
                        break;
                    }
                }
                OutputEvent::TryAgain | OutputEvent::BuffersChanged => {}
            }
            acknowledge_flush(&shared, &mut inner);
            continue;
        }

        match event {
            OutputEvent::TryAgain | OutputEvent::BuffersChanged => {}
            OutputEvent::FormatChanged => {
                if !handle_format(&shared, &mut inner, &event) {
                    break;
                }
            }
            OutputEvent::Buffer(_) => match handle_buffer(&shared, &mut inner, &event) {
                Flow::Continue => {}
                Flow::Stop => break,
            },
        }
    }
}

/// Marks the thread gone however it ends. A panic, typically from the sink,
/// aborts the engine.
struct ExitGuard {
    shared: Arc<Shared>,
    session: u64,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        // a thread detached by stop no longer owns the flag
        if inner.session == self.session && inner.output_running {
            if std::thread::panicking() && inner.state != EngineState::Aborted {
                // the sink is not called back, it may be what panicked
                error!("Output thread panicked (session {}), aborting", self.session);
                inner.state = EngineState::Aborted;
                self.shared.fatal_reported.store(true, Ordering::Release);
            }
            inner.output_running = false;
        }
        self.shared.cond.notify_all();
        debug!("Output thread stopped (session {})", self.session);
    }
}

enum Flow {
    Continue,
    Stop,
}

fn is_cancelled(inner: &Inner, session: u64) -> bool {
    inner.session != session || inner.stop_requested || inner.state == EngineState::Aborted
}

fn acknowledge_flush(shared: &Shared, inner: &mut Guard<'_>) {
    inner.flush_requested = false;
    shared.cond.notify_all();
}

/// Block until input was queued. Returns false when the thread must exit.
fn wait_for_work(shared: &Shared, inner: &mut Guard<'_>, session: u64) -> bool {
    loop {
        if is_cancelled(inner, session) {
            return false;
        }
        if inner.flush_requested {
            acknowledge_flush(shared, inner);
            continue;
        }
        if inner.output_ready {
            return true;
        }
        shared.cond.wait(inner);
    }
}

/// Returns false if the format was rejected and the engine aborted
fn handle_format(shared: &Shared, inner: &mut Guard<'_>, event: &OutputEvent) -> bool {
    let format = match shared.device.get_output(event) {
        Ok(Some(OutputDescriptor::Format(format))) => format,
        Ok(_) => {
            warn!("Format change without a format");
            return true;
        }
        Err(e) => {
            shared.abort_locked(inner, e.into());
            return false;
        }
    };
    match shared.apply_format_locked(inner, format) {
        Ok(()) => true,
        Err(e) => {
            shared.abort_locked(inner, e);
            false
        }
    }
}

fn handle_buffer(shared: &Shared, inner: &mut Guard<'_>, event: &OutputEvent) -> Flow {
    let buffer = match shared.device.get_output(event) {
        Ok(Some(OutputDescriptor::Buffer(buffer))) => buffer,
        Ok(Some(OutputDescriptor::Format(format))) => {
            // some bindings report the format through a buffer index
            return match shared.apply_format_locked(inner, format) {
                Ok(()) => Flow::Continue,
                Err(e) => {
                    shared.abort_locked(inner, e);
                    Flow::Stop
                }
            };
        }
        Ok(None) => return Flow::Continue,
        Err(e) => {
            shared.abort_locked(inner, e.into());
            return Flow::Stop;
        }
    };

    // end of stream arrives as an empty marker buffer
    if buffer.eos {
        if let Err(e) = shared.device.release_output(buffer.index, false) {
            debug!("EOS buffer {} not released: {}", buffer.index, e);
        }
        info!("End of stream reached");
        inner.eos_reached = true;
        inner.output_ready = false;
        shared.cond.notify_all();
        return Flow::Stop;
    }

    let result = {
        let Inner {
            adapter,
            timestamps,
            preroll_end,
            direct_rendering,
            ..
        } = &mut **inner;
        let mut ctx = OutputContext {
            timestamps,
            preroll_end: *preroll_end,
            device: shared.device.as_ref(),
            inflight: &shared.inflight,
            direct_rendering: *direct_rendering,
        };
        adapter.process_output(buffer, &mut ctx)
    };

    match result {
        Ok(Some(decoded)) => {
            let sink = shared.sink.clone();
            MutexGuard::unlocked(inner, || deliver(shared, sink.as_ref(), decoded));
            Flow::Continue
        }
        Ok(None) => {
            Stats::bump(&shared.stats.outputs_dropped);
            Flow::Continue
        }
        Err(e) => {
            shared.abort_locked(inner, e);
            Flow::Stop
        }
    }
}

fn deliver(shared: &Shared, sink: &dyn FrameSink, decoded: Decoded) {
    match decoded {
        Decoded::Video(frame) => {
            Stats::bump(&shared.stats.frames_delivered);
            sink.queue_video_frame(frame);
        }
        Decoded::Audio(sample) => {
            Stats::bump(&shared.stats.samples_delivered);
            sink.queue_audio_sample(sample);
        }
    }
}
