//! # Decode Session
//!
//! The body of the decode thread: read a packet, decode it (possibly over
//! several calls), convert, assemble and publish every frame it yields, then
//! drain the decoder once the container runs dry.
//!
//! The cancel flag is checked before each packet read and each flush call,
//! never during a decode. Waiting on a full gate also gives up when the flag
//! is set.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::assemble::{assemble, AssembleError};
use crate::config::DecoderConfig;
use crate::decode::FrameHandle;
use crate::demuxer::MediaSource;
use crate::gate::FrameGate;
use crate::pixel_convert::ConvertError;
use crate::sink::{FrameSink, SessionOutcome, VideoFrame};
use crate::timebase::Rational;
use crate::worker::{Monitor, WorkerState};

/// Errors that end a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Pixel conversion failed: {0}")]
    Convert(#[from] ConvertError),
    #[error("Frame assembly failed: {0}")]
    Assemble(#[from] AssembleError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    EndOfStream,
    Cancelled,
}

pub struct DecodeSession<'a> {
    source: &'a mut MediaSource,
    sink: &'a dyn FrameSink,
    gate: &'a FrameGate,
    cancel: &'a AtomicBool,
    monitor: &'a Monitor,
    width: usize,
    height: usize,
    time_base: Rational,
    image_row_alignment: usize,
    flush_limit: usize,
    sequence: u64,
}

impl<'a> DecodeSession<'a> {
    pub(crate) fn new(
        source: &'a mut MediaSource,
        sink: &'a dyn FrameSink,
        gate: &'a FrameGate,
        cancel: &'a AtomicBool,
        monitor: &'a Monitor,
        config: &DecoderConfig,
    ) -> Self {
        let width = source.width() as usize;
        let height = source.height() as usize;
        let time_base = source.time_base();
        Self {
            source,
            sink,
            gate,
            cancel,
            monitor,
            width,
            height,
            time_base,
            image_row_alignment: config.image_row_alignment,
            flush_limit: config.flush_limit,
            sequence: 0,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Run to completion. Ends with exactly one `on_session_ended` call and
    /// returns the terminal state.
    pub fn run(mut self) -> WorkerState {
        self.monitor.set_state(WorkerState::Running);

        let result = match self.read_packets() {
            Ok(Flow::EndOfStream) => {
                self.monitor.set_state(WorkerState::Draining);
                tracing::debug!("End of stream after {} frames, draining decoder", self.sequence);
                self.drain()
            }
            other => other,
        };

        let frames = self.sequence;
        let (state, outcome) = match result {
            Ok(Flow::Cancelled) => {
                tracing::info!("Decode session aborted after {} frames", frames);
                (WorkerState::Aborted, SessionOutcome::Aborted { frames })
            }
            Ok(_) => {
                tracing::info!("Decode session finished: {} frames", frames);
                (WorkerState::Stopped, SessionOutcome::Finished { frames })
            }
            Err(error) => {
                tracing::error!("Decode session failed after {} frames: {}", frames, error);
                (WorkerState::Failed, SessionOutcome::Failed { frames, error })
            }
        };

        self.monitor.set_state(state);
        self.sink.on_session_ended(outcome);
        state
    }

    fn read_packets(&mut self) -> Result<Flow, SessionError> {
        loop {
            if self.cancelled() {
                return Ok(Flow::Cancelled);
            }

            let packet = self.source.next_packet();
            self.monitor.record_packets(self.source.packets_read(), self.source.packets_skipped());
            let Some(packet) = packet else {
                return Ok(Flow::EndOfStream);
            };

            let mut offset = 0;
            while offset < packet.len() {
                self.monitor.decode_calls.fetch_add(1, Ordering::Relaxed);
                let result = match self.source.decoder_mut().decode(&packet.data[offset..], packet.pts) {
                    Ok(result) => result,
                    Err(e) => {
                        self.monitor.decode_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Dropping packet pts {:?}: {}", packet.pts, e);
                        break;
                    }
                };

                let produced = result.frame.is_some();
                if let Some(handle) = result.frame {
                    if self.publish(handle, packet.pts)? == Flow::Cancelled {
                        return Ok(Flow::Cancelled);
                    }
                }

                if result.consumed == 0 && !produced {
                    tracing::warn!(
                        "Decoder made no progress on packet pts {:?}, {} bytes left",
                        packet.pts,
                        packet.len() - offset
                    );
                    break;
                }
                offset += result.consumed;
            }
        }
    }

    fn drain(&mut self) -> Result<Flow, SessionError> {
        for _ in 0..self.flush_limit {
            if self.cancelled() {
                return Ok(Flow::Cancelled);
            }

            self.monitor.decode_calls.fetch_add(1, Ordering::Relaxed);
            match self.source.decoder_mut().decode(&[], None) {
                Ok(result) => match result.frame {
                    Some(handle) => {
                        if self.publish(handle, None)? == Flow::Cancelled {
                            return Ok(Flow::Cancelled);
                        }
                    }
                    None => return Ok(Flow::EndOfStream),
                },
                Err(e) => {
                    self.monitor.decode_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Flush failed: {}", e);
                    return Ok(Flow::EndOfStream);
                }
            }
        }

        tracing::warn!("Decoder still producing after {} flush calls, giving up", self.flush_limit);
        Ok(Flow::EndOfStream)
    }

    /// Convert and assemble the frame behind `handle`, hand the handle back
    /// to the decoder, then publish through the gate.
    fn publish(&mut self, handle: FrameHandle, packet_pts: Option<i64>) -> Result<Flow, SessionError> {
        let (width, height, alignment) = (self.width, self.height, self.image_row_alignment);
        let (decoder, converter) = self.source.pipeline_mut();

        let assembled = match decoder.frame(&handle) {
            Some(frame) => {
                let pts = frame.pts.or(packet_pts);
                converter
                    .convert(frame, width, height)
                    .map_err(SessionError::from)
                    .and_then(|planes| assemble(planes, width, height, alignment).map_err(SessionError::from))
                    .map(|image| Some((image, pts)))
            }
            None => Ok(None),
        };
        decoder.release(handle);

        let (image, pts) = match assembled {
            Ok(Some(done)) => done,
            Ok(None) => {
                tracing::warn!("Decoder returned a frame it does not hold");
                return Ok(Flow::Continue);
            }
            Err(SessionError::Convert(ConvertError::FrameMismatch(reason))) => {
                self.monitor.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping malformed frame: {}", reason);
                return Ok(Flow::Continue);
            }
            Err(e) => return Err(e),
        };

        let Some(permit) = self.gate.acquire(self.cancel) else {
            return Ok(Flow::Cancelled);
        };

        let pts_ms = pts.map(|ticks| self.time_base.ticks_to_ms(ticks));
        if let Some(ms) = pts_ms {
            self.sink.on_position_changed(ms);
        }

        let sequence = self.sequence;
        self.sequence += 1;
        self.monitor.frames_published.fetch_add(1, Ordering::Relaxed);
        self.sink.on_frame_ready(VideoFrame::new(image, sequence, pts_ms, permit));
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{DecodeError, DecodeResult, DecoderRegistry, FrameArena, RawFrame, VideoDecoder};
    use crate::demuxer::{CompressedPacket, Container, ContainerInfo, OpenError, SourceOptions, StreamInfo, StreamKind};
    use crate::pixel_convert::PixelFormat;
    use crate::sink::{ChannelSink, DecoderEvent};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const STUB: &str = "stub";

    // ------------------------------------------------------------------
    // Stubs
    // ------------------------------------------------------------------

    struct StubContainer {
        duration_ms: i64,
        width: u32,
        height: u32,
        packets: VecDeque<CompressedPacket>,
        reads: Arc<AtomicUsize>,
    }

    impl StubContainer {
        /// `count` video packets of `len` bytes at 100 ms intervals
        fn new(count: i64, len: usize) -> Self {
            let packets = (0..count)
                .map(|pts| CompressedPacket {
                    stream_index: 1,
                    pts: Some(pts),
                    keyframe: true,
                    data: Bytes::from(vec![pts as u8; len]),
                })
                .collect();
            Self {
                duration_ms: 2_000,
                width: 4,
                height: 2,
                packets,
                reads: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Container for StubContainer {
        fn format_name(&self) -> &str {
            "stub"
        }

        fn probe(&mut self) -> Result<ContainerInfo, OpenError> {
            Ok(ContainerInfo {
                duration_ms: self.duration_ms,
                streams: vec![StreamInfo {
                    index: 1,
                    kind: StreamKind::Video,
                    codec_id: STUB.into(),
                    width: self.width,
                    height: self.height,
                    pixel_format: None,
                    time_base: Rational::from_frame_rate(10, 1),
                    extradata: Vec::new(),
                }],
            })
        }

        fn read_packet(&mut self) -> Option<CompressedPacket> {
            let packet = self.packets.pop_front()?;
            self.reads.fetch_add(1, Ordering::SeqCst);
            Some(packet)
        }
    }

    #[derive(Default, Clone)]
    struct StubBehaviour {
        /// Bytes consumed per call, whole packet if `None`
        chunk: Option<usize>,
        /// Packet pts that fails to decode
        fail_on: Option<i64>,
        /// Extra frames released only by flushing
        buffered: usize,
        /// Frame size the decoder claims, stream size if `None`
        frame_size: Option<(usize, usize)>,
    }

    /// One RGB24 frame per call, every pixel set to the first input byte
    struct StubDecoder {
        behaviour: StubBehaviour,
        width: usize,
        height: usize,
        arena: FrameArena,
        calls: Arc<AtomicUsize>,
        flushed: i64,
    }

    impl StubDecoder {
        fn emit(&mut self, value: u8, pts: Option<i64>) -> FrameHandle {
            let (width, height) = self.behaviour.frame_size.unwrap_or((self.width, self.height));
            let (handle, frame): (FrameHandle, &mut RawFrame) = self.arena.acquire();
            frame.reset(PixelFormat::Rgb24, width, height);
            frame.planes[0].data = vec![value; width * height * 3];
            frame.planes[0].stride = width * 3;
            frame.pts = pts;
            handle
        }
    }

    impl VideoDecoder for StubDecoder {
        fn name(&self) -> &str {
            "stub"
        }

        fn decode(&mut self, data: &[u8], pts: Option<i64>) -> Result<DecodeResult, DecodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if data.is_empty() {
                if self.behaviour.buffered == 0 {
                    return Ok(DecodeResult::consumed(0));
                }
                self.behaviour.buffered -= 1;
                self.flushed += 1;
                let handle = self.emit(200, Some(100 + self.flushed));
                return Ok(DecodeResult::with_frame(0, handle));
            }
            if pts.is_some() && pts == self.behaviour.fail_on {
                return Err(DecodeError::InvalidData("forced failure".into()));
            }
            let consumed = self.behaviour.chunk.unwrap_or(data.len()).min(data.len());
            let handle = self.emit(data[0], pts);
            Ok(DecodeResult::with_frame(consumed, handle))
        }

        fn frame(&self, handle: &FrameHandle) -> Option<&RawFrame> {
            self.arena.get(handle)
        }

        fn release(&mut self, handle: FrameHandle) {
            self.arena.release(handle);
        }

        fn outstanding_frames(&self) -> usize {
            self.arena.outstanding()
        }
    }

    struct Harness {
        source: MediaSource,
        calls: Arc<AtomicUsize>,
        reads: Arc<AtomicUsize>,
    }

    fn harness(container: StubContainer, behaviour: StubBehaviour) -> Harness {
        harness_with(container, behaviour, |_| {})
    }

    fn harness_with(container: StubContainer, behaviour: StubBehaviour, on_duration: impl FnOnce(i64)) -> Harness {
        let calls = Arc::new(AtomicUsize::new(0));
        let reads = Arc::clone(&container.reads);
        let mut decoders = DecoderRegistry::empty();
        let factory_calls = Arc::clone(&calls);
        decoders.register(STUB, move |stream| {
            Ok(Box::new(StubDecoder {
                behaviour: behaviour.clone(),
                width: stream.width as usize,
                height: stream.height as usize,
                arena: FrameArena::new(),
                calls: Arc::clone(&factory_calls),
                flushed: 0,
            }) as Box<dyn VideoDecoder>)
        });

        let source =
            MediaSource::from_container(Box::new(container), &decoders, SourceOptions::default(), on_duration).unwrap();
        Harness { source, calls, reads }
    }

    /// Records every notification; frames are released on arrival
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
        sequences: Mutex<Vec<u64>>,
        cancel_after: Option<(u64, Arc<AtomicBool>)>,
    }

    impl FrameSink for RecordingSink {
        fn on_duration_changed(&self, duration_ms: i64) {
            self.events.lock().push(format!("duration {}", duration_ms));
        }

        fn on_position_changed(&self, position_ms: i64) {
            self.events.lock().push(format!("position {}", position_ms));
        }

        fn on_frame_ready(&self, frame: VideoFrame) {
            self.events.lock().push(format!("frame {}", frame.sequence));
            self.sequences.lock().push(frame.sequence);
            if let Some((after, cancel)) = &self.cancel_after {
                if frame.sequence == *after {
                    cancel.store(true, Ordering::Release);
                }
            }
        }

        fn on_session_ended(&self, outcome: SessionOutcome) {
            let name = match outcome {
                SessionOutcome::Finished { .. } => "finished",
                SessionOutcome::Aborted { .. } => "aborted",
                SessionOutcome::Failed { .. } => "failed",
            };
            self.events.lock().push(format!("ended {} {}", name, outcome.frames()));
        }
    }

    /// Run a session with a sink that releases frames as they arrive
    fn run(h: &mut Harness, sink: &dyn FrameSink, cancel: &AtomicBool) -> (WorkerState, Monitor) {
        let (state, monitor, gate) = run_holding(h, sink, cancel);
        assert_eq!(gate.in_flight(), 0);
        (state, monitor)
    }

    /// Run a session whose sink may still hold frames when it returns
    fn run_holding(h: &mut Harness, sink: &dyn FrameSink, cancel: &AtomicBool) -> (WorkerState, Monitor, FrameGate) {
        let gate = FrameGate::new(64);
        let monitor = Monitor::default();
        let config = DecoderConfig::default();
        let state = DecodeSession::new(&mut h.source, sink, &gate, cancel, &monitor, &config).run();
        (state, monitor, gate)
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[test]
    fn test_ten_frames_at_100ms() {
        let sink = RecordingSink::default();
        let mut h = harness_with(StubContainer::new(10, 12), StubBehaviour::default(), |ms| {
            sink.on_duration_changed(ms)
        });
        let (state, monitor) = run(&mut h, &sink, &AtomicBool::new(false));

        assert_eq!(state, WorkerState::Stopped);
        let mut expected = vec!["duration 2000".to_string()];
        for i in 0..10 {
            expected.push(format!("position {}", i * 100));
            expected.push(format!("frame {}", i));
        }
        expected.push("ended finished 10".to_string());
        assert_eq!(*sink.events.lock(), expected);

        let stats = monitor.snapshot();
        assert_eq!(stats.packets_read, 10);
        assert_eq!(stats.frames_published, 10);
        // One call per packet plus the empty flush
        assert_eq!(stats.decode_calls, 11);
        assert_eq!(h.source.decoder_mut().outstanding_frames(), 0);
    }

    #[test]
    fn test_partial_consumption_gives_two_frames() {
        let behaviour = StubBehaviour {
            chunk: Some(6),
            ..Default::default()
        };
        let mut h = harness(StubContainer::new(1, 12), behaviour);
        let sink = RecordingSink::default();
        run(&mut h, &sink, &AtomicBool::new(false));

        // Two calls for the packet, one empty flush
        assert_eq!(h.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*sink.sequences.lock(), vec![0, 1]);
    }

    #[test]
    fn test_flush_drains_buffered_frames() {
        let behaviour = StubBehaviour {
            buffered: 3,
            ..Default::default()
        };
        let mut h = harness(StubContainer::new(2, 12), behaviour);
        let sink = RecordingSink::default();
        let (state, _) = run(&mut h, &sink, &AtomicBool::new(false));

        assert_eq!(state, WorkerState::Stopped);
        assert_eq!(*sink.sequences.lock(), vec![0, 1, 2, 3, 4]);
        // Flushed frames report their own pts: ticks 101..103 at 10 fps
        let events = sink.events.lock();
        assert!(events.contains(&"position 10100".to_string()));
        assert_eq!(events.last().unwrap(), "ended finished 5");
    }

    #[test]
    fn test_cancel_between_packets() {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut h = harness(StubContainer::new(10, 12), StubBehaviour { buffered: 2, ..Default::default() });
        let sink = RecordingSink {
            cancel_after: Some((3, Arc::clone(&cancel))),
            ..Default::default()
        };
        let (state, _) = run(&mut h, &sink, &cancel);

        assert_eq!(state, WorkerState::Aborted);
        // Packet 3 was in flight when the flag went up; packet 4 is never read
        assert_eq!(h.reads.load(Ordering::SeqCst), 4);
        assert_eq!(*sink.sequences.lock(), vec![0, 1, 2, 3]);
        // No draining after an abort
        assert_eq!(h.calls.load(Ordering::SeqCst), 4);
        assert_eq!(sink.events.lock().last().unwrap(), "ended aborted 4");
    }

    #[test]
    fn test_decode_error_skips_only_that_packet() {
        let behaviour = StubBehaviour {
            fail_on: Some(2),
            ..Default::default()
        };
        let mut h = harness(StubContainer::new(5, 12), behaviour);
        let sink = RecordingSink::default();
        let (state, monitor) = run(&mut h, &sink, &AtomicBool::new(false));

        assert_eq!(state, WorkerState::Stopped);
        assert_eq!(h.reads.load(Ordering::SeqCst), 5);
        assert_eq!(*sink.sequences.lock(), vec![0, 1, 2, 3]);
        assert!(!sink.events.lock().contains(&"position 200".to_string()));
        assert_eq!(monitor.snapshot().decode_errors, 1);
    }

    #[test]
    fn test_size_change_is_fatal() {
        let behaviour = StubBehaviour {
            frame_size: Some((8, 8)),
            ..Default::default()
        };
        let mut h = harness(StubContainer::new(3, 12), behaviour);
        let sink = RecordingSink::default();
        let (state, _) = run(&mut h, &sink, &AtomicBool::new(false));

        assert_eq!(state, WorkerState::Failed);
        assert_eq!(h.reads.load(Ordering::SeqCst), 1);
        assert_eq!(*sink.events.lock(), vec!["ended failed 0".to_string()]);
        assert_eq!(h.source.decoder_mut().outstanding_frames(), 0);
    }

    #[test]
    fn test_published_image_content() {
        let mut h = harness(StubContainer::new(2, 12), StubBehaviour::default());
        let (sink, rx) = ChannelSink::unbounded();
        let (state, _, gate) = run_holding(&mut h, &sink, &AtomicBool::new(false));

        assert_eq!(state, WorkerState::Stopped);
        // Both frames still sit in the channel holding their slots
        assert_eq!(gate.in_flight(), 2);
        let images: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                DecoderEvent::FrameReady(frame) => Some(frame.release()),
                _ => None,
            })
            .collect();
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(images.len(), 2);
        assert_eq!(images[1].pixel(3, 1), [255, 1, 1, 1]);
        assert_eq!(images[0].stride(), 16);
    }

    #[test]
    fn test_gate_bounds_frames_in_flight() {
        let mut h = harness(StubContainer::new(40, 12), StubBehaviour::default());
        let (sink, rx) = ChannelSink::unbounded();
        let gate = FrameGate::new(4);
        let cancel = AtomicBool::new(false);
        let monitor = Monitor::default();
        let config = DecoderConfig::default();

        thread::scope(|scope| {
            let decode = scope.spawn(|| DecodeSession::new(&mut h.source, &sink, &gate, &cancel, &monitor, &config).run());

            // Hold everything: the decoder has to stop at the gate
            thread::sleep(Duration::from_millis(100));
            assert_eq!(monitor.snapshot().frames_published, 4);
            assert_eq!(gate.in_flight(), 4);

            let mut seen = 0;
            let mut held = Vec::new();
            while seen < 40 {
                match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                    DecoderEvent::FrameReady(frame) => {
                        assert!(gate.in_flight() <= 4);
                        seen += 1;
                        held.push(frame);
                        if held.len() == 2 {
                            held.clear();
                        }
                    }
                    DecoderEvent::SessionEnded(_) => break,
                    _ => {}
                }
            }
            drop(held);
            assert_eq!(seen, 40);
            assert_eq!(decode.join().unwrap(), WorkerState::Stopped);
        });
        assert_eq!(gate.in_flight(), 0);
    }
}
