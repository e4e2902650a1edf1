#![cfg(feature = "async")]

use std::io::{Read, Seek};
use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::demux::{demuxer_from_path, demuxer_from_reader, Sample};
use crate::Error;

/// Create a Tokio `Stream` of demuxed samples from an MP4 file on disk.
///
/// This API is enabled by default (crate feature `async`).
///
/// Implementation detail: demuxing requires `Seek`, so this function runs the
/// synchronous demuxer on a blocking thread (`tokio::task::spawn_blocking`)
/// and forwards samples over a bounded channel. An open failure arrives as
/// the stream's first (and only) item.
///
/// `buffer` controls the channel capacity. Larger buffers can improve
/// throughput if the consumer occasionally stalls.
pub fn stream_from_path(
    path: impl Into<PathBuf>,
    buffer: usize,
) -> ReceiverStream<Result<Sample, Error>> {
    let path = path.into();
    let (tx, rx) = mpsc::channel(buffer.max(1));

    tokio::task::spawn_blocking(move || {
        let mut demuxer = match demuxer_from_path(&path) {
            Ok(d) => d,
            Err(err) => {
                let _ = tx.blocking_send(Err(err));
                return;
            }
        };

        for item in &mut demuxer {
            if tx.blocking_send(item).is_err() {
                break;
            }
        }
    });

    ReceiverStream::new(rx)
}

/// Create a Tokio `Stream` of demuxed samples from any seekable reader.
///
/// This is useful for integration into other Rust projects that already
/// manage IO.
///
/// The reader must be `Send + 'static` because demuxing runs in
/// `spawn_blocking`.
pub fn stream_from_reader<R>(reader: R, buffer: usize) -> ReceiverStream<Result<Sample, Error>>
where
    R: Read + Seek + Send + 'static,
{
    let (tx, rx) = mpsc::channel(buffer.max(1));

    tokio::task::spawn_blocking(move || {
        let mut demuxer = match demuxer_from_reader(reader) {
            Ok(d) => d,
            Err(err) => {
                let _ = tx.blocking_send(Err(err));
                return;
            }
        };

        for item in &mut demuxer {
            if tx.blocking_send(item).is_err() {
                break;
            }
        }
    });

    ReceiverStream::new(rx)
}
