//! Output Sinks
//!
//! Where decoded frames and samples go once the output thread has produced
//! them. Sinks are called from the output thread without any engine lock
//! held and must not block for long.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{AudioSample, FramePayload, VideoFrame};
use crate::engine::EngineError;

/// Receiver of decoded output
pub trait FrameSink: Send + Sync {
    fn queue_video_frame(&self, frame: VideoFrame);

    fn queue_audio_sample(&self, sample: AudioSample);

    /// Called once when the engine aborts
    fn on_fatal_error(&self, error: &EngineError) {
        error!("Decoder aborted: {}", error);
    }
}

/// Decoded output as carried over a channel
#[derive(Debug)]
pub enum DecodedOutput {
    Video(VideoFrame),
    Audio(AudioSample),
    Fatal(String),
}

/// Sink that forwards output to an async consumer.
///
/// Uses `try_send` so the output thread never waits on the consumer;
/// output is dropped when the channel is full.
pub struct ChannelSink {
    tx: mpsc::Sender<DecodedOutput>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DecodedOutput>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Output discarded because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send(&self, output: DecodedOutput) {
        if self.tx.try_send(output).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 100 == 1 {
                debug!("Output channel full or closed, {} items dropped", dropped);
            }
        }
    }
}

impl FrameSink for ChannelSink {
    fn queue_video_frame(&self, frame: VideoFrame) {
        self.send(DecodedOutput::Video(frame));
    }

    fn queue_audio_sample(&self, sample: AudioSample) {
        self.send(DecodedOutput::Audio(sample));
    }

    fn on_fatal_error(&self, error: &EngineError) {
        error!("Decoder aborted: {}", error);
        self.send(DecodedOutput::Fatal(error.to_string()));
    }
}

/// Single-slot mailbox for render loops that poll.
///
/// A newer frame always replaces an unread one. The replaced frame is
/// discarded on the spot, so a zero-copy picture goes back to the device
/// even if the consumer still holds a clone of its handle. Audio is ignored.
#[derive(Default)]
pub struct LatestFrame {
    slot: Mutex<Option<VideoFrame>>,
    replaced: AtomicU64,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn take(&self) -> Option<VideoFrame> {
        self.slot.lock().take()
    }

    /// Frames overwritten before anyone took them
    pub fn replaced(&self) -> u64 {
        self.replaced.load(Ordering::Relaxed)
    }
}

impl FrameSink for LatestFrame {
    fn queue_video_frame(&self, frame: VideoFrame) {
        let Some(stale) = self.slot.lock().replace(frame) else {
            return;
        };
        self.replaced.fetch_add(1, Ordering::Relaxed);
        if let FramePayload::Direct(buffer) = &stale.payload {
            buffer.discard();
        }
    }

    fn queue_audio_sample(&self, _sample: AudioSample) {}
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::loopback::DeviceCall;
    use crate::device::{LoopbackConfig, LoopbackDevice};
    use crate::media::{InflightTable, PixelFormat};

    fn frame(pts: i64) -> VideoFrame {
        VideoFrame {
            width: 2,
            height: 2,
            pts,
            format: PixelFormat::NV12,
            payload: FramePayload::Copied {
                data: vec![0; 6],
                stride: 2,
                slice_height: 2,
            },
        }
    }

    #[test]
    fn test_latest_frame_keeps_newest() {
        let latest = LatestFrame::new();
        assert!(latest.take().is_none());
        latest.queue_video_frame(frame(1));
        latest.queue_video_frame(frame(2));
        assert!(latest.is_pending());
        assert_eq!(latest.take().unwrap().pts, 2);
        assert!(latest.take().is_none());
        assert_eq!(latest.replaced(), 1);
    }

    #[test]
    fn test_latest_frame_discards_replaced_picture() {
        let device = Arc::new(LoopbackDevice::new(LoopbackConfig::default()));
        let table = InflightTable::new(device.clone());
        let direct = |index, pts| VideoFrame {
            payload: FramePayload::Direct(table.insert(index)),
            ..frame(pts)
        };

        let latest = LatestFrame::new();
        let first = direct(0, 1);
        let FramePayload::Direct(held) = first.payload.clone() else {
            unreachable!()
        };
        latest.queue_video_frame(first);
        latest.queue_video_frame(direct(1, 2));

        // the consumer's clone no longer owns slot 0
        assert!(!held.is_valid());
        assert!(!table.contains(0));
        assert!(table.contains(1));
        assert!(device
            .calls()
            .contains(&DeviceCall::ReleaseOutput { index: 0, render: false }));
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.queue_video_frame(frame(1));
        sink.queue_video_frame(frame(2));
        assert_eq!(sink.dropped(), 1);

        match rx.try_recv() {
            Ok(DecodedOutput::Video(f)) => assert_eq!(f.pts, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_channel_sink_reports_fatal() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.on_fatal_error(&EngineError::Aborted);
        match rx.recv().await {
            Some(DecodedOutput::Fatal(msg)) => assert!(msg.contains("aborted")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
