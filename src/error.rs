use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Passthrough for IO errors (open/read/seek).
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Reading a sample's payload failed partway through the file.
    #[error("read of {size} bytes at offset {offset} failed: {source}")]
    SampleRead {
        offset: u64,
        size: u32,
        source: io::Error,
    },

    /// A box header is truncated, has an impossible size, or escapes its parent.
    #[error("mp4 parse error in {context}: box {box_type} at offset {offset}: {message}")]
    InvalidBox {
        context: String,
        box_type: String,
        offset: u64,
        message: String,
    },

    /// A required box is absent from the tree.
    #[error("mp4 missing required box: {box_type}")]
    MissingBox { box_type: &'static str },

    /// A sample table's declared counts or lengths don't agree with its payload.
    #[error("mp4 invalid {box_type} table: {message}")]
    InvalidTable {
        box_type: &'static str,
        message: String,
    },

    /// Chunk-offset and sample-size tables disagree.
    ///
    /// This demuxer maps one sample per chunk, so the two tables must have the
    /// same number of entries.
    #[error(
        "mp4 inconsistent sample tables for track {track_id}: stsz count={sample_count} stco entries={chunk_offsets}"
    )]
    InconsistentSampleTables {
        track_id: u32,
        sample_count: usize,
        chunk_offsets: usize,
    },

    /// An SPS or PPS entry in the decoder configuration is out of range.
    #[error("invalid {kind} in decoder configuration: {message}")]
    InvalidParameterSet {
        kind: &'static str,
        message: String,
    },

    /// The bitstream ended before a field could be read in full.
    #[error("bitstream truncated: needed {needed} more bits, {available} available")]
    TruncatedBitstream { needed: u32, available: usize },

    /// An Exp-Golomb codeword declared more than 31 leading zeros.
    #[error("exp-golomb codeword too long")]
    ExpGolombOverflow,

    /// The file uses a container feature outside this demuxer's profile.
    #[error("unsupported input: {feature}")]
    Unsupported { feature: String },

    /// AVCC validation of a video sample failed. The demuxer stays usable;
    /// the caller decides whether to skip the sample or stop.
    #[error("bad sample {sample_index} on track {track_id}: {message}")]
    BadSample {
        track_id: u32,
        sample_index: usize,
        message: String,
    },
}
