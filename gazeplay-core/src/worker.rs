//! # Decode Worker
//!
//! Owns the media source and the decode thread. `open_video` runs on the
//! caller's thread; `start` moves the source onto a new thread running a
//! [`DecodeSession`]; `abort` raises the cancel flag and waits a bounded
//! time for that thread to leave.
//!
//! ```text
//! Idle ──open_video──► Ready ──start──► Running ──EOF──► Draining ──► Stopped
//!   ▲                    │                 │                 │
//!   └── failed open ─────┘                 └──── abort ──────┴──► Aborted
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::config::DecoderConfig;
use crate::decode::DecoderRegistry;
use crate::demuxer::{ContainerRegistry, MediaSource, OpenError};
use crate::gate::FrameGate;
use crate::session::DecodeSession;
use crate::sink::FrameSink;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("No video opened")]
    NotOpened,
    #[error("Decode thread already running")]
    AlreadyRunning,
    #[error("Cannot spawn decode thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum WorkerState {
    /// Nothing loaded
    #[default]
    Idle,
    /// Inside `open_video`
    Opening,
    /// Source open, thread not started
    Ready,
    Running,
    Draining,
    Stopped,
    Aborted,
    /// Session ended on a conversion or allocation error
    Failed,
}

/// Counters for the current (or last) session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub packets_read: u64,
    /// Packets of other streams thrown away
    pub packets_skipped: u64,
    pub decode_calls: u64,
    pub decode_errors: u64,
    pub frames_published: u64,
}

/// State and counters shared between the worker handle and its thread
#[derive(Debug, Default)]
pub(crate) struct Monitor {
    state: Mutex<WorkerState>,
    packets_read: AtomicU64,
    packets_skipped: AtomicU64,
    pub(crate) decode_calls: AtomicU64,
    pub(crate) decode_errors: AtomicU64,
    pub(crate) frames_published: AtomicU64,
}

impl Monitor {
    pub(crate) fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!("Worker state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    pub(crate) fn record_packets(&self, read: u64, skipped: u64) {
        self.packets_read.store(read, Ordering::Relaxed);
        self.packets_skipped.store(skipped, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            packets_read: self.packets_read.load(Ordering::Relaxed),
            packets_skipped: self.packets_skipped.load(Ordering::Relaxed),
            decode_calls: self.decode_calls.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            frames_published: self.frames_published.load(Ordering::Relaxed),
        }
    }

    fn reset_counters(&self) {
        for counter in [
            &self.packets_read,
            &self.packets_skipped,
            &self.decode_calls,
            &self.decode_errors,
            &self.frames_published,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A started session: the thread plus what is needed to stop it
struct RunningSession {
    handle: JoinHandle<()>,
    /// Disconnects when the thread exits
    exited: Receiver<()>,
    cancel: Arc<AtomicBool>,
}

pub struct DecoderThread {
    config: DecoderConfig,
    containers: ContainerRegistry,
    decoders: DecoderRegistry,
    sink: Arc<dyn FrameSink>,
    gate: FrameGate,
    monitor: Arc<Monitor>,
    source: Option<MediaSource>,
    running: Option<RunningSession>,
}

impl DecoderThread {
    /// Worker with every built-in container and decoder.
    pub fn new(config: DecoderConfig, sink: Arc<dyn FrameSink>) -> Self {
        Self::with_registries(config, sink, ContainerRegistry::with_defaults(), DecoderRegistry::with_defaults())
    }

    pub fn with_registries(
        config: DecoderConfig,
        sink: Arc<dyn FrameSink>,
        containers: ContainerRegistry,
        decoders: DecoderRegistry,
    ) -> Self {
        let gate = FrameGate::new(config.max_frames_in_queue);
        Self {
            config,
            containers,
            decoders,
            sink,
            gate,
            monitor: Arc::new(Monitor::default()),
            source: None,
            running: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.monitor.state()
    }

    pub fn stats(&self) -> WorkerStats {
        self.monitor.snapshot()
    }

    /// The gate frames are published through
    pub fn gate(&self) -> &FrameGate {
        &self.gate
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Source waiting for `start`, if any
    pub fn source(&self) -> Option<&MediaSource> {
        self.source.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.handle.is_finished())
    }

    /// Open `path` on this thread. Returns false on any open error.
    pub fn open_video(&mut self, path: impl AsRef<Path>) -> bool {
        self.try_open(path.as_ref()).is_ok()
    }

    /// Like [`DecoderThread::open_video`] but with the reason for failure.
    /// A running session is aborted first; the duration reaches the sink
    /// before this returns.
    pub fn try_open(&mut self, path: &Path) -> Result<(), OpenError> {
        if self.running.is_some() {
            self.abort();
        }
        self.source = None;
        self.monitor.set_state(WorkerState::Opening);

        let sink = Arc::clone(&self.sink);
        let opened = MediaSource::open(
            path,
            &self.containers,
            &self.decoders,
            self.config.source_options(),
            |duration_ms| sink.on_duration_changed(duration_ms),
        );

        match opened {
            Ok(source) => {
                self.monitor.reset_counters();
                self.monitor.set_state(WorkerState::Ready);
                self.source = Some(source);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to open {:?}: {}", path, e);
                self.monitor.set_state(WorkerState::Idle);
                Err(e)
            }
        }
    }

    /// Start decoding the opened source on a new thread.
    pub fn start(&mut self) -> Result<(), WorkerError> {
        if self.is_running() {
            return Err(WorkerError::AlreadyRunning);
        }
        self.reap();

        let mut source = self.source.take().ok_or(WorkerError::NotOpened)?;
        let cancel = Arc::new(AtomicBool::new(false));
        let (exit_tx, exited) = crossbeam_channel::bounded::<()>(0);

        let sink = Arc::clone(&self.sink);
        let gate = self.gate.clone();
        let monitor = Arc::clone(&self.monitor);
        let config = self.config.clone();
        let thread_cancel = Arc::clone(&cancel);

        // Running before the thread exists, so a caller never sees Ready
        // after a successful start
        monitor.set_state(WorkerState::Running);
        let spawned = thread::Builder::new()
            .name("gazeplay-decode".into())
            .spawn(move || {
                let _exit = exit_tx;
                tracing::info!(
                    "Decode thread started: {}x{} {} via {}",
                    source.width(),
                    source.height(),
                    source.video_stream().codec_id,
                    source.decoder_name()
                );
                let state =
                    DecodeSession::new(&mut source, sink.as_ref(), &gate, &thread_cancel, &monitor, &config).run();
                tracing::info!("Decode thread finished ({:?})", state);
            });

        match spawned {
            Ok(handle) => {
                self.running = Some(RunningSession { handle, exited, cancel });
                Ok(())
            }
            Err(e) => {
                self.monitor.set_state(WorkerState::Idle);
                Err(WorkerError::Spawn(e))
            }
        }
    }

    /// Ask the decode thread to stop and wait up to the configured timeout.
    /// Safe to call any number of times, with or without a running thread.
    pub fn abort(&mut self) {
        let Some(session) = self.running.take() else {
            return;
        };

        session.cancel.store(true, Ordering::Release);
        self.gate.wake_all();

        let timeout = self.config.abort_timeout();
        match session.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if session.handle.join().is_err() {
                    tracing::error!("Decode thread panicked");
                    self.monitor.set_state(WorkerState::Failed);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("Decode thread did not stop within {:?}, detaching it", timeout);
                self.monitor.set_state(WorkerState::Aborted);
            }
        }
    }

    /// Join a thread that has already finished on its own.
    fn reap(&mut self) {
        if let Some(session) = self.running.take() {
            if session.handle.join().is_err() {
                tracing::error!("Decode thread panicked");
                self.monitor.set_state(WorkerState::Failed);
            }
        }
    }
}

impl Drop for DecoderThread {
    fn drop(&mut self) {
        self.abort();
    }
}

impl std::fmt::Debug for DecoderThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderThread")
            .field("state", &self.state())
            .field("gate", &self.gate)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel_convert::PixelFormat;
    use crate::sink::{ChannelSink, DecoderEvent, SessionOutcome};
    use crate::y4m::Y4mWriter;
    use std::fs::File;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;

    fn write_clip(dir: &Path, name: &str, frames: u8, width: u32, height: u32) -> PathBuf {
        let path = dir.join(name);
        let mut writer =
            Y4mWriter::new(File::create(&path).unwrap(), width, height, (10, 1), PixelFormat::Yuv420p).unwrap();
        let size = PixelFormat::Yuv420p.buffer_size(width as usize, height as usize).unwrap();
        for i in 0..frames {
            writer.write_frame(&vec![16 + i; size]).unwrap();
        }
        writer.into_inner().flush().unwrap();
        path
    }

    fn worker(config: DecoderConfig) -> (DecoderThread, crossbeam_channel::Receiver<DecoderEvent>) {
        let (sink, rx) = ChannelSink::unbounded();
        (DecoderThread::new(config, Arc::new(sink)), rx)
    }

    /// Collect events until the session ends; frames are released as they come.
    fn drain_events(rx: &crossbeam_channel::Receiver<DecoderEvent>) -> (Vec<i64>, Vec<u64>, SessionOutcome) {
        let mut positions = Vec::new();
        let mut sequences = Vec::new();
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                DecoderEvent::PositionChanged(ms) => positions.push(ms),
                DecoderEvent::FrameReady(frame) => {
                    sequences.push(frame.sequence);
                    frame.release();
                }
                DecoderEvent::SessionEnded(outcome) => return (positions, sequences, outcome),
                DecoderEvent::DurationChanged(ms) => panic!("duration {} after open", ms),
            }
        }
    }

    #[test]
    fn test_y4m_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_clip(dir.path(), "clip.y4m", 10, 8, 4);
        let (mut worker, rx) = worker(DecoderConfig::default());

        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(worker.open_video(&path));
        assert_eq!(worker.state(), WorkerState::Ready);
        assert!(matches!(rx.try_recv().unwrap(), DecoderEvent::DurationChanged(1_000)));

        worker.start().unwrap();
        let (positions, sequences, outcome) = drain_events(&rx);
        assert_eq!(positions, (0..10).map(|i| i * 100).collect::<Vec<_>>());
        assert_eq!(sequences, (0..10).collect::<Vec<_>>());
        assert!(matches!(outcome, SessionOutcome::Finished { frames: 10 }));

        worker.abort();
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(worker.stats().frames_published, 10);
        assert_eq!(worker.stats().packets_read, 10);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_failed_open_stays_idle() {
        let dir = tempfile::tempdir().unwrap();
        let (mut worker, rx) = worker(DecoderConfig::default());

        assert!(!worker.open_video(dir.path().join("missing.y4m")));
        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(matches!(worker.start(), Err(WorkerError::NotOpened)));

        let bad = dir.path().join("bad.y4m");
        std::fs::write(&bad, b"YUV4MPEG2 W8\n").unwrap();
        assert!(matches!(worker.try_open(&bad), Err(OpenError::NoStreamInfo(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reopen_resets_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_clip(dir.path(), "a.y4m", 3, 4, 2);
        let second = write_clip(dir.path(), "b.y4m", 2, 6, 2);
        let (mut worker, rx) = worker(DecoderConfig::default());

        assert!(worker.open_video(&first));
        worker.start().unwrap();
        let _ = rx.recv().unwrap();
        let (_, sequences, _) = drain_events(&rx);
        assert_eq!(sequences, vec![0, 1, 2]);

        assert!(worker.open_video(&second));
        assert!(matches!(rx.recv().unwrap(), DecoderEvent::DurationChanged(200)));
        worker.start().unwrap();
        let (_, sequences, _) = drain_events(&rx);
        assert_eq!(sequences, vec![0, 1]);
        assert_eq!(worker.stats().frames_published, 2);
    }

    #[test]
    fn test_abort_blocked_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_clip(dir.path(), "long.y4m", 50, 4, 2);
        let config = DecoderConfig {
            max_frames_in_queue: 2,
            ..Default::default()
        };
        let (mut worker, rx) = worker(config);

        assert!(worker.open_video(&path));
        assert!(matches!(worker.start(), Ok(())));
        assert!(matches!(worker.start(), Err(WorkerError::AlreadyRunning)));

        // Nobody releases: the thread parks on the gate after two frames
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(worker.gate().in_flight(), 2);
        assert_eq!(worker.state(), WorkerState::Running);

        worker.abort();
        worker.abort();
        assert_eq!(worker.state(), WorkerState::Aborted);
        assert_eq!(worker.stats().frames_published, 2);
        assert!(worker.stats().packets_read < 50);

        let ended = rx
            .try_iter()
            .find_map(|e| match e {
                DecoderEvent::SessionEnded(outcome) => Some(outcome),
                _ => None,
            })
            .unwrap();
        assert!(matches!(ended, SessionOutcome::Aborted { frames: 2 }));
        assert_eq!(worker.gate().in_flight(), 0);
    }

    #[test]
    fn test_abort_without_thread_is_noop() {
        let (mut worker, _rx) = worker(DecoderConfig::default());
        worker.abort();
        assert_eq!(worker.state(), WorkerState::Idle);
    }
}
