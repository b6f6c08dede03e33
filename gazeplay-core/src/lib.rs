//! # GazePlay Core
//!
//! Background video decode pipeline: demux, decode, convert to ARGB32 and
//! publish frames to a sink under backpressure, with cooperative abort.

// ============================================================================
// Containers
// ============================================================================
pub mod demuxer;
pub mod y4m;
pub mod mkv;
pub mod timebase;

// ============================================================================
// Decoders
// ============================================================================
pub mod decode;
pub mod h264;

// ============================================================================
// Frame Processing
// ============================================================================
pub mod pixel_convert;
pub mod assemble;

// ============================================================================
// Worker
// ============================================================================
pub mod gate;
pub mod sink;
pub mod session;
pub mod worker;
pub mod config;

pub use assemble::Image;
pub use config::{ConfigError, DecoderConfig};
pub use demuxer::{ContainerRegistry, MediaSource, OpenError};
pub use decode::DecoderRegistry;
pub use gate::{FrameGate, GatePermit};
pub use sink::{ChannelSink, DecoderEvent, FrameSink, SessionOutcome, VideoFrame};
pub use worker::{DecoderThread, WorkerError, WorkerState, WorkerStats};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
