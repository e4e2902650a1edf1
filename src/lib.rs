//! `avc-demux` turns MP4 (ISO-BMFF) files into an ordered stream of
//! AVCC-framed H.264 samples plus the decoder configuration (SPS/PPS) needed
//! to initialise an external video decoder.
//!
//! This crate provides:
//! - A synchronous iterator-based demuxer (good for scripts and simple pipelines).
//! - A Tokio-based async `Stream` wrapper (enabled by default) for easy integration with async apps.
//!
//! Samples are yielded in `(track, sample index)` order with `(value,
//! timescale)` presentation timestamps. Video samples are validated against
//! their AVCC framing before handoff; everything else is passed through as
//! opaque bytes.
//!
//! ## Quick start (sync)
//! - Open a file and iterate samples:
//!   - Use [`demuxer_from_path`] and iterate the returned [`Mp4Demuxer`].
//!
//! ## Quick start (async)
//! - Use [`stream_from_path`] to get a Tokio `Stream` of samples.
//!
//! ## Features
//! - `async` (default): enables Tokio stream helpers.

pub mod error;

mod bits;
mod boxes;
mod trace;

pub mod demux;
pub mod h264;

#[cfg(feature = "async")]
pub mod stream;

pub use demux::{
    demuxer_from_path, demuxer_from_reader, demuxer_from_reader_with_trace, MediaTime, Mp4Demuxer,
    Sample, Track, TrackKind,
};

pub use error::Error;
pub use trace::Trace;

#[cfg(feature = "async")]
pub use stream::{stream_from_path, stream_from_reader};
