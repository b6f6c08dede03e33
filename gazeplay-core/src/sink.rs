//! Frame sink: where published frames and playback notifications go.
//!
//! Duration arrives on the thread that opened the file; everything else
//! arrives on the decode thread. A sink that keeps frames must drop or
//! [`VideoFrame::release`] each one eventually, or the decoder stalls once
//! the gate is full.

use crossbeam_channel::{Receiver, Sender};

use crate::assemble::Image;
use crate::gate::GatePermit;
use crate::session::SessionError;

/// A published frame. Owns one gate slot until released or dropped.
#[derive(Debug)]
pub struct VideoFrame {
    pub image: Image,
    /// 0, 1, 2, ... per opened source
    pub sequence: u64,
    /// Presentation time, when the stream carries one
    pub pts_ms: Option<i64>,
    permit: GatePermit,
}

impl VideoFrame {
    pub(crate) fn new(image: Image, sequence: u64, pts_ms: Option<i64>, permit: GatePermit) -> Self {
        Self {
            image,
            sequence,
            pts_ms,
            permit,
        }
    }

    /// Give the gate slot back and keep the pixels.
    pub fn release(self) -> Image {
        self.permit.release();
        self.image
    }
}

/// How a started session ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// Stream exhausted and decoder drained
    Finished { frames: u64 },
    /// Stopped by `abort()`
    Aborted { frames: u64 },
    /// Stopped by an unrecoverable conversion or allocation error
    Failed { frames: u64, error: SessionError },
}

impl SessionOutcome {
    pub fn frames(&self) -> u64 {
        match self {
            SessionOutcome::Finished { frames }
            | SessionOutcome::Aborted { frames }
            | SessionOutcome::Failed { frames, .. } => *frames,
        }
    }
}

/// Receiver of everything the decoder publishes
pub trait FrameSink: Send + Sync {
    fn on_duration_changed(&self, duration_ms: i64);

    fn on_position_changed(&self, position_ms: i64);

    fn on_frame_ready(&self, frame: VideoFrame);

    /// Last call of every started session
    fn on_session_ended(&self, _outcome: SessionOutcome) {}
}

/// Notification as a value
#[derive(Debug)]
pub enum DecoderEvent {
    DurationChanged(i64),
    PositionChanged(i64),
    FrameReady(VideoFrame),
    SessionEnded(SessionOutcome),
}

/// Forwards notifications over a channel, for hosts that poll from their
/// own thread. Events sent after the receiver is gone are dropped, which
/// releases their frames.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<DecoderEvent>,
}

impl ChannelSink {
    pub fn new(tx: Sender<DecoderEvent>) -> Self {
        Self { tx }
    }

    /// A sink and the unbounded receiver for its events. The gate bounds
    /// how many frames can pile up in the channel.
    pub fn unbounded() -> (Self, Receiver<DecoderEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self::new(tx), rx)
    }

    fn send(&self, event: DecoderEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event receiver gone, dropping event");
        }
    }
}

impl FrameSink for ChannelSink {
    fn on_duration_changed(&self, duration_ms: i64) {
        self.send(DecoderEvent::DurationChanged(duration_ms));
    }

    fn on_position_changed(&self, position_ms: i64) {
        self.send(DecoderEvent::PositionChanged(position_ms));
    }

    fn on_frame_ready(&self, frame: VideoFrame) {
        self.send(DecoderEvent::FrameReady(frame));
    }

    fn on_session_ended(&self, outcome: SessionOutcome) {
        self.send(DecoderEvent::SessionEnded(outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::assemble;
    use crate::gate::FrameGate;
    use crate::pixel_convert::ConvertedPlanes;

    fn frame(gate: &FrameGate, sequence: u64) -> VideoFrame {
        let image = assemble(&ConvertedPlanes::new(2, 2, 1).unwrap(), 2, 2, 4).unwrap();
        VideoFrame::new(image, sequence, Some(sequence as i64 * 40), gate.try_acquire().unwrap())
    }

    #[test]
    fn test_release_frees_gate_slot() {
        let gate = FrameGate::new(2);
        let f = frame(&gate, 0);
        assert_eq!(gate.in_flight(), 1);
        let image = f.release();
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(image.width(), 2);
    }

    #[test]
    fn test_channel_sink_forwards_in_order() {
        let gate = FrameGate::new(4);
        let (sink, rx) = ChannelSink::unbounded();
        sink.on_duration_changed(1_000);
        sink.on_position_changed(40);
        sink.on_frame_ready(frame(&gate, 1));
        sink.on_session_ended(SessionOutcome::Finished { frames: 2 });

        assert!(matches!(rx.recv().unwrap(), DecoderEvent::DurationChanged(1_000)));
        assert!(matches!(rx.recv().unwrap(), DecoderEvent::PositionChanged(40)));
        match rx.recv().unwrap() {
            DecoderEvent::FrameReady(f) => assert_eq!((f.sequence, f.pts_ms), (1, Some(40))),
            other => panic!("unexpected {:?}", other),
        }
        match rx.recv().unwrap() {
            DecoderEvent::SessionEnded(outcome) => assert_eq!(outcome.frames(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_closed_channel_releases_frames() {
        let gate = FrameGate::new(1);
        let (sink, rx) = ChannelSink::unbounded();
        drop(rx);
        sink.on_frame_ready(frame(&gate, 0));
        assert_eq!(gate.in_flight(), 0);
    }
}
