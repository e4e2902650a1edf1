use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::boxes::{BoxKind, BoxTree};
use crate::h264::{self, H264Params};
use crate::trace::Trace;
use crate::Error;

/// Media stream classification, from the track's `hdlr` handler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
    Unknown,
}

impl TrackKind {
    fn from_handler(handler: [u8; 4]) -> Self {
        match &handler {
            b"vide" => TrackKind::Video,
            b"soun" => TrackKind::Audio,
            _ => TrackKind::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
            TrackKind::Unknown => "unknown",
        }
    }
}

/// A presentation timestamp as a `(value, timescale)` rational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaTime {
    pub value: u64,
    /// Ticks per second for this track's timeline.
    pub timescale: u32,
}

impl MediaTime {
    pub fn as_secs_f64(&self) -> f64 {
        if self.timescale == 0 {
            return 0.0;
        }
        self.value as f64 / self.timescale as f64
    }
}

/// Per-track metadata and sample tables, populated during open and immutable
/// during iteration.
#[derive(Debug, Clone)]
pub struct Track {
    /// Sequential id starting at 1, in `trak` discovery order.
    pub track_id: u32,
    pub kind: TrackKind,
    pub timescale: u32,
    pub(crate) sample_sizes: Vec<u32>,
    pub(crate) sample_offsets: Vec<u64>,
    pub(crate) h264: Option<H264Params>,
}

impl Track {
    pub fn sample_count(&self) -> usize {
        self.sample_sizes.len()
    }

    /// Decoder initialisation parameters; present on AVC video tracks.
    pub fn h264_params(&self) -> Option<&H264Params> {
        self.h264.as_ref()
    }

    /// Coded width in pixels, 0 for non-video tracks.
    pub fn width(&self) -> u32 {
        self.h264.as_ref().map_or(0, |p| p.width)
    }

    /// Coded height in pixels, 0 for non-video tracks.
    pub fn height(&self) -> u32 {
        self.h264.as_ref().map_or(0, |p| p.height)
    }
}

/// One sample as read from the file. The buffer is owned by the caller once
/// yielded.
#[derive(Debug, Clone)]
pub struct Sample {
    pub track_id: u32,
    pub kind: TrackKind,
    /// `value` is the sample's index within its track.
    pub timestamp: MediaTime,
    pub data: Vec<u8>,
}

impl Sample {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Forward-only demuxer over a seekable MP4 input.
///
/// Opening parses all track metadata up front; iteration then seeks and reads
/// one sample at a time, in `(track, sample index)` order: all of track 1,
/// then all of track 2, and so on. It implements
/// `Iterator<Item = Result<Sample, Error>>`.
///
/// Iteration is single-pass: to read the file again, re-open it. Dropping the
/// demuxer releases the reader and every table.
pub struct Mp4Demuxer<R: Read + Seek> {
    reader: R,
    file_len: u64,
    tracks: Vec<Track>,
    trace: Trace,

    track_cursor: usize,
    sample_cursor: usize,
}

/// Open an MP4 file on disk.
pub fn demuxer_from_path(path: impl AsRef<Path>) -> Result<Mp4Demuxer<File>, Error> {
    let file = File::open(path)?;
    demuxer_from_reader(file)
}

/// Open any seekable reader, tracing per the `AVC_DEMUX_TRACE` environment
/// variable.
pub fn demuxer_from_reader<R: Read + Seek>(reader: R) -> Result<Mp4Demuxer<R>, Error> {
    demuxer_from_reader_with_trace(reader, Trace::from_env())
}

/// Open any seekable reader with an injected trace setting. This is the
/// entry point for embedders that manage their own diagnostics.
pub fn demuxer_from_reader_with_trace<R: Read + Seek>(
    mut reader: R,
    trace: Trace,
) -> Result<Mp4Demuxer<R>, Error> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    let tree = BoxTree::scan(&mut reader, file_len, &trace)?;

    if tree.find(BoxKind::Moof).is_some() {
        return Err(Error::Unsupported {
            feature: "fragmented MP4 (moof)".to_string(),
        });
    }

    let moov = tree.find(BoxKind::Moov).ok_or(Error::MissingBox { box_type: "moov" })?;

    let mut tracks = Vec::new();
    let mut trak = tree.find_in(moov, BoxKind::Trak);
    if trak.is_none() {
        return Err(Error::MissingBox { box_type: "trak" });
    }
    while let Some(id) = trak {
        let track_id = tracks.len() as u32 + 1;
        tracks.push(read_track(&mut reader, &tree, id, track_id, file_len, &trace)?);
        trak = tree.find_after(id, BoxKind::Trak);
    }

    Ok(Mp4Demuxer {
        reader,
        file_len,
        tracks,
        trace,
        track_cursor: 0,
        sample_cursor: 0,
    })
}

impl<R: Read + Seek> Mp4Demuxer<R> {
    /// Track summaries, in `trak` discovery order.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Number of samples the iterator will yield across all tracks.
    pub fn total_samples(&self) -> usize {
        self.tracks.iter().map(Track::sample_count).sum()
    }

    /// Pull the next sample (convenience wrapper around `Iterator::next`).
    pub fn next_sample(&mut self) -> Result<Option<Sample>, Error> {
        self.next().transpose()
    }

    fn read_sample(&mut self, track_index: usize, sample_index: usize) -> Result<Sample, Error> {
        let track = &self.tracks[track_index];
        let offset = track.sample_offsets[sample_index];
        let size = track.sample_sizes[sample_index];

        if self.trace.enabled {
            eprintln!(
                "[demux] track {} sample {}/{}: offset={offset} size={size}",
                track.track_id,
                sample_index + 1,
                track.sample_count()
            );
        }

        // Check the range before allocating: a corrupt table must not force
        // a buffer larger than the file itself.
        if offset.checked_add(size as u64).is_none_or(|end| end > self.file_len) {
            return Err(Error::SampleRead {
                offset,
                size,
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "sample extends past end of file",
                ),
            });
        }

        let mut data = vec![0u8; size as usize];
        self.reader
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.reader.read_exact(&mut data))
            .map_err(|source| Error::SampleRead { offset, size, source })?;

        if track.kind == TrackKind::Video {
            if let Some(params) = &track.h264 {
                h264::check_avcc_framing(&data, params.nal_length_size, &self.trace).map_err(
                    |message| Error::BadSample {
                        track_id: track.track_id,
                        sample_index,
                        message,
                    },
                )?;
            }
        }

        Ok(Sample {
            track_id: track.track_id,
            kind: track.kind,
            timestamp: MediaTime {
                value: sample_index as u64,
                timescale: track.timescale,
            },
            data,
        })
    }
}

impl<R: Read + Seek> Iterator for Mp4Demuxer<R> {
    type Item = Result<Sample, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.track_cursor < self.tracks.len()
            && self.sample_cursor >= self.tracks[self.track_cursor].sample_count()
        {
            self.track_cursor += 1;
            self.sample_cursor = 0;
        }
        if self.track_cursor >= self.tracks.len() {
            return None;
        }

        let (track_index, sample_index) = (self.track_cursor, self.sample_cursor);
        // Advance before reading so a failed sample can be skipped by simply
        // calling next() again.
        self.sample_cursor += 1;

        Some(self.read_sample(track_index, sample_index))
    }
}

// -----------------------------
// Track metadata (hdlr/mdhd/stsd/stsz/stco)
// -----------------------------

fn read_u8_at<R: Read + Seek>(r: &mut R, offset: u64) -> io::Result<u8> {
    r.seek(SeekFrom::Start(offset))?;
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_be_u16_at<R: Read + Seek>(r: &mut R, offset: u64) -> io::Result<u16> {
    r.seek(SeekFrom::Start(offset))?;
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

fn read_be_u32_at<R: Read + Seek>(r: &mut R, offset: u64) -> io::Result<u32> {
    r.seek(SeekFrom::Start(offset))?;
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_track<R: Read + Seek>(
    reader: &mut R,
    tree: &BoxTree,
    trak: usize,
    track_id: u32,
    file_len: u64,
    trace: &Trace,
) -> Result<Track, Error> {
    if tree.find_in(trak, BoxKind::Edts).is_some() {
        return Err(Error::Unsupported {
            feature: "edit lists (edts)".to_string(),
        });
    }

    let mdia = tree
        .find_in(trak, BoxKind::Mdia)
        .ok_or(Error::MissingBox { box_type: "mdia" })?;

    // hdlr payload: version/flags (4) + pre_defined (4) + handler_type (4).
    let hdlr = tree
        .find_in(mdia, BoxKind::Hdlr)
        .ok_or(Error::MissingBox { box_type: "hdlr" })?;
    let mut handler = [0u8; 4];
    reader.seek(SeekFrom::Start(tree.node(hdlr).payload_start() + 8))?;
    reader.read_exact(&mut handler)?;
    let kind = TrackKind::from_handler(handler);

    let mdhd = tree
        .find_in(mdia, BoxKind::Mdhd)
        .ok_or(Error::MissingBox { box_type: "mdhd" })?;
    let mdhd_payload = tree.node(mdhd).payload_start();
    let version = read_u8_at(reader, mdhd_payload)?;
    // v0 stores 32-bit creation/modification times, v1 64-bit ones; the
    // timescale is a u32 either way.
    let timescale = match version {
        0 => read_be_u32_at(reader, mdhd_payload + 12)?,
        1 => read_be_u32_at(reader, mdhd_payload + 20)?,
        v => {
            return Err(Error::InvalidTable {
                box_type: "mdhd",
                message: format!("unknown version {v}"),
            })
        }
    };

    let stbl = tree
        .find_in(mdia, BoxKind::Stbl)
        .ok_or(Error::MissingBox { box_type: "stbl" })?;
    if tree.find_in(stbl, BoxKind::Co64).is_some() {
        return Err(Error::Unsupported {
            feature: "64-bit chunk offsets (co64)".to_string(),
        });
    }

    let h264 = if kind == TrackKind::Video {
        Some(read_video_config(reader, tree, stbl, trace)?)
    } else {
        None
    };

    let sample_sizes = read_stsz(reader, tree, stbl, file_len)?;
    let sample_offsets = read_stco(reader, tree, stbl)?;

    if sample_offsets.len() != sample_sizes.len() {
        // One sample per chunk is assumed throughout; anything else would
        // need the stsc run mapping, which is out of profile here.
        return Err(Error::InconsistentSampleTables {
            track_id,
            sample_count: sample_sizes.len(),
            chunk_offsets: sample_offsets.len(),
        });
    }

    if trace.enabled {
        eprintln!(
            "[demux] track {track_id}: kind={} timescale={timescale} samples={}",
            kind.name(),
            sample_sizes.len()
        );
    }

    Ok(Track {
        track_id,
        kind,
        timescale,
        sample_sizes,
        sample_offsets,
        h264,
    })
}

fn read_video_config<R: Read + Seek>(
    reader: &mut R,
    tree: &BoxTree,
    stbl: usize,
    trace: &Trace,
) -> Result<H264Params, Error> {
    let stsd = tree
        .find_in(stbl, BoxKind::Stsd)
        .ok_or(Error::MissingBox { box_type: "stsd" })?;

    let entry = tree
        .first_child(stsd)
        .ok_or(Error::MissingBox { box_type: "avc1" })?;
    let entry_node = tree.node(entry);
    if entry_node.kind != BoxKind::Avc1 {
        return Err(Error::Unsupported {
            feature: format!(
                "video sample entry '{}' (only avc1 is handled)",
                entry_node.kind.name()
            ),
        });
    }

    // Coded dimensions as stored in the sample entry itself; used when the
    // SPS cannot be parsed.
    let entry_payload = entry_node.payload_start();
    let entry_width = read_be_u16_at(reader, entry_payload + 24)? as u32;
    let entry_height = read_be_u16_at(reader, entry_payload + 26)? as u32;

    let avcc = tree
        .find_in(entry, BoxKind::AvcC)
        .ok_or(Error::MissingBox { box_type: "avcC" })?;
    let avcc_node = tree.node(avcc);
    let mut payload = vec![0u8; avcc_node.payload_len() as usize];
    reader.seek(SeekFrom::Start(avcc_node.payload_start()))?;
    reader.read_exact(&mut payload)?;

    let mut params = h264::parse_avcc(&payload)?;

    if params.sps().is_empty() {
        params.width = entry_width;
        params.height = entry_height;
        return Ok(params);
    }

    match h264::parse_sps(params.sps()) {
        Ok(info) => {
            params.profile_idc = info.profile_idc;
            params.level_idc = info.level_idc;
            params.width = info.width;
            params.height = info.height;
        }
        Err(e) => {
            // Fall back to the sample entry's own u16 dimensions.
            if trace.enabled {
                eprintln!("[demux] SPS parse failed ({e}); using avc1 dimensions");
            }
            params.width = entry_width;
            params.height = entry_height;
        }
    }

    Ok(params)
}

fn read_stsz<R: Read + Seek>(
    reader: &mut R,
    tree: &BoxTree,
    stbl: usize,
    file_len: u64,
) -> Result<Vec<u32>, Error> {
    let stsz = tree
        .find_in(stbl, BoxKind::Stsz)
        .ok_or(Error::MissingBox { box_type: "stsz" })?;
    let node = tree.node(stsz);

    // Payload: version/flags, default sample_size, sample_count.
    let _version_flags = read_be_u32_at(reader, node.payload_start())?;
    let mut b = [0u8; 4];
    reader.read_exact(&mut b)?;
    let sample_size = u32::from_be_bytes(b);
    reader.read_exact(&mut b)?;
    let sample_count = u32::from_be_bytes(b);

    if sample_size != 0 {
        // Fixed-size tracks carry no per-sample table; bound the count by
        // what the file could possibly hold.
        if (sample_count as u64).saturating_mul(sample_size as u64) > file_len {
            return Err(Error::InvalidTable {
                box_type: "stsz",
                message: format!(
                    "{sample_count} samples of {sample_size} bytes exceed the file size"
                ),
            });
        }
        return Ok(vec![sample_size; sample_count as usize]);
    }

    let table_len = node.payload_len().saturating_sub(12);
    if sample_count as u64 * 4 > table_len {
        return Err(Error::InvalidTable {
            box_type: "stsz",
            message: format!("declares {sample_count} sizes but holds {table_len} table bytes"),
        });
    }

    let mut sizes = Vec::with_capacity(sample_count as usize);
    let mut b = [0u8; 4];
    for _ in 0..sample_count {
        reader.read_exact(&mut b)?;
        sizes.push(u32::from_be_bytes(b));
    }
    Ok(sizes)
}

fn read_stco<R: Read + Seek>(
    reader: &mut R,
    tree: &BoxTree,
    stbl: usize,
) -> Result<Vec<u64>, Error> {
    let stco = tree
        .find_in(stbl, BoxKind::Stco)
        .ok_or(Error::MissingBox { box_type: "stco" })?;
    let node = tree.node(stco);

    // Payload: version/flags, entry_count.
    let _version_flags = read_be_u32_at(reader, node.payload_start())?;
    let mut b = [0u8; 4];
    reader.read_exact(&mut b)?;
    let entry_count = u32::from_be_bytes(b);

    let table_len = node.payload_len().saturating_sub(8);
    if entry_count as u64 * 4 > table_len {
        return Err(Error::InvalidTable {
            box_type: "stco",
            message: format!("declares {entry_count} entries but holds {table_len} table bytes"),
        });
    }

    let mut offsets = Vec::with_capacity(entry_count as usize);
    let mut b = [0u8; 4];
    for _ in 0..entry_count {
        reader.read_exact(&mut b)?;
        offsets.push(u32::from_be_bytes(b) as u64);
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // Minimal Baseline SPS declaring 16x16 (see the h264 module tests for
    // the bit layout).
    const SPS_16X16: [u8; 6] = [0x67, 0x42, 0x00, 0x0A, 0xFB, 0xC0];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

    fn bx(typ: &str, payload: &[u8]) -> Vec<u8> {
        let mut v = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        v.extend_from_slice(typ.as_bytes());
        v.extend_from_slice(payload);
        v
    }

    fn avcc_box(sps: &[u8], pps: &[u8]) -> Vec<u8> {
        let mut p = vec![1, 0x42, 0x00, 0x1E, 0xFF, 0xE1];
        p.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        p.extend_from_slice(sps);
        p.push(1);
        p.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        p.extend_from_slice(pps);
        bx("avcC", &p)
    }

    fn avc1_box(width: u16, height: u16, avcc: &[u8]) -> Vec<u8> {
        let mut p = vec![0u8; 6]; // reserved
        p.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
        p.extend_from_slice(&[0u8; 16]); // pre_defined + reserved
        p.extend_from_slice(&width.to_be_bytes());
        p.extend_from_slice(&height.to_be_bytes());
        p.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // horizresolution
        p.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // vertresolution
        p.extend_from_slice(&[0u8; 4]); // reserved
        p.extend_from_slice(&1u16.to_be_bytes()); // frame_count
        p.extend_from_slice(&[0u8; 32]); // compressorname
        p.extend_from_slice(&24u16.to_be_bytes()); // depth
        p.extend_from_slice(&0xFFFFu16.to_be_bytes()); // pre_defined
        p.extend_from_slice(avcc);
        bx("avc1", &p)
    }

    fn stsd_box(entry: &[u8]) -> Vec<u8> {
        let mut p = vec![0u8; 4];
        p.extend_from_slice(&1u32.to_be_bytes());
        p.extend_from_slice(entry);
        bx("stsd", &p)
    }

    fn stsz_box(fixed_size: u32, sizes: &[u32]) -> Vec<u8> {
        let mut p = vec![0u8; 4];
        p.extend_from_slice(&fixed_size.to_be_bytes());
        p.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
        if fixed_size == 0 {
            for s in sizes {
                p.extend_from_slice(&s.to_be_bytes());
            }
        }
        bx("stsz", &p)
    }

    fn stco_box(offsets: &[u32]) -> Vec<u8> {
        let mut p = vec![0u8; 4];
        p.extend_from_slice(&(offsets.len() as u32).to_be_bytes());
        for o in offsets {
            p.extend_from_slice(&o.to_be_bytes());
        }
        bx("stco", &p)
    }

    fn hdlr_box(handler: &[u8; 4]) -> Vec<u8> {
        let mut p = vec![0u8; 8]; // version/flags + pre_defined
        p.extend_from_slice(handler);
        p.extend_from_slice(&[0u8; 12]); // reserved
        p.extend_from_slice(b"hdl\0");
        bx("hdlr", &p)
    }

    fn mdhd_v0_box(timescale: u32) -> Vec<u8> {
        let mut p = vec![0u8; 4]; // version 0 + flags
        p.extend_from_slice(&[0u8; 8]); // creation + modification
        p.extend_from_slice(&timescale.to_be_bytes());
        p.extend_from_slice(&[0u8; 4]); // duration
        p.extend_from_slice(&[0x55, 0xC4, 0, 0]); // language + pre_defined
        bx("mdhd", &p)
    }

    fn mdhd_v1_box(timescale: u32) -> Vec<u8> {
        let mut p = vec![1, 0, 0, 0];
        p.extend_from_slice(&[0u8; 16]); // 64-bit creation + modification
        p.extend_from_slice(&timescale.to_be_bytes());
        p.extend_from_slice(&[0u8; 8]); // 64-bit duration
        p.extend_from_slice(&[0x55, 0xC4, 0, 0]);
        bx("mdhd", &p)
    }

    fn video_trak(mdhd: Vec<u8>, stsd: Vec<u8>, stsz: Vec<u8>, stco: Vec<u8>) -> Vec<u8> {
        let mut stbl_payload = stsd;
        stbl_payload.extend_from_slice(&stsz);
        stbl_payload.extend_from_slice(&stco);
        let minf = bx("minf", &bx("stbl", &stbl_payload));
        let mut mdia_payload = mdhd;
        mdia_payload.extend_from_slice(&hdlr_box(b"vide"));
        mdia_payload.extend_from_slice(&minf);
        bx("trak", &bx("mdia", &mdia_payload))
    }

    fn audio_trak(timescale: u32, stsz: Vec<u8>, stco: Vec<u8>) -> Vec<u8> {
        let mut stbl_payload = stsz;
        stbl_payload.extend_from_slice(&stco);
        let minf = bx("minf", &bx("stbl", &stbl_payload));
        let mut mdia_payload = mdhd_v0_box(timescale);
        mdia_payload.extend_from_slice(&hdlr_box(b"soun"));
        mdia_payload.extend_from_slice(&minf);
        bx("trak", &bx("mdia", &mdia_payload))
    }

    /// A 100-byte AVCC sample: one 96-byte IDR NAL behind a 4-byte length.
    fn idr_sample_100() -> Vec<u8> {
        let mut s = 96u32.to_be_bytes().to_vec();
        s.push(0x65);
        s.extend_from_slice(&[0xAA; 95]);
        s
    }

    /// Assemble `ftyp` + `moov` + an `mdat` that spans up to `file_len`,
    /// then drop `samples` at their absolute offsets.
    fn build_file(traks: Vec<Vec<u8>>, samples: &[(u64, Vec<u8>)], file_len: usize) -> Vec<u8> {
        let mut moov_payload = Vec::new();
        for t in traks {
            moov_payload.extend_from_slice(&t);
        }
        let mut data = bx("ftyp", &[]);
        data.extend_from_slice(&bx("moov", &moov_payload));

        let mdat_start = data.len();
        assert!(mdat_start + 8 <= file_len, "header grew past the sample area");
        data.extend_from_slice(&((file_len - mdat_start) as u32).to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.resize(file_len, 0);

        for (offset, bytes) in samples {
            let offset = *offset as usize;
            assert!(offset >= mdat_start + 8 && offset + bytes.len() <= file_len);
            data[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        data
    }

    fn simple_video_file() -> Vec<u8> {
        let trak = video_trak(
            mdhd_v0_box(90_000),
            stsd_box(&avc1_box(16, 16, &avcc_box(&SPS_16X16, &PPS))),
            stsz_box(100, &[0; 3]),
            stco_box(&[1000, 1100, 1200]),
        );
        let sample = idr_sample_100();
        build_file(
            vec![trak],
            &[(1000, sample.clone()), (1100, sample.clone()), (1200, sample)],
            1300,
        )
    }

    #[test]
    fn opens_and_yields_three_fixed_size_samples() {
        let mut demuxer = demuxer_from_reader(Cursor::new(simple_video_file())).unwrap();

        assert_eq!(demuxer.tracks().len(), 1);
        let track = &demuxer.tracks()[0];
        assert_eq!(track.track_id, 1);
        assert_eq!(track.kind, TrackKind::Video);
        assert_eq!(track.timescale, 90_000);
        assert_eq!(track.sample_count(), 3);
        assert_eq!(track.width(), 16);
        assert_eq!(track.height(), 16);
        let params = track.h264_params().unwrap();
        assert_eq!(params.nal_length_size, 4);
        assert_eq!(params.sps(), &SPS_16X16);
        assert_eq!(params.pps(), &PPS);
        assert_eq!(demuxer.total_samples(), 3);

        for expected in 0u64..3 {
            let sample = demuxer.next_sample().unwrap().unwrap();
            assert_eq!(sample.track_id, 1);
            assert_eq!(sample.size(), 100);
            assert_eq!(sample.data[4], 0x65);
            assert_eq!(
                sample.timestamp,
                MediaTime {
                    value: expected,
                    timescale: 90_000
                }
            );
        }
        assert!(demuxer.next_sample().unwrap().is_none());
    }

    #[test]
    fn table_count_mismatch_fails_open() {
        let trak = video_trak(
            mdhd_v0_box(90_000),
            stsd_box(&avc1_box(16, 16, &avcc_box(&SPS_16X16, &PPS))),
            stsz_box(100, &[0; 3]),
            stco_box(&[1000, 1100]),
        );
        let data = build_file(vec![trak], &[], 1300);
        assert!(matches!(
            demuxer_from_reader(Cursor::new(data)),
            Err(Error::InconsistentSampleTables {
                track_id: 1,
                sample_count: 3,
                chunk_offsets: 2
            })
        ));
    }

    #[test]
    fn merged_stream_orders_by_track_then_sample() {
        let video = video_trak(
            mdhd_v0_box(90_000),
            stsd_box(&avc1_box(16, 16, &avcc_box(&SPS_16X16, &PPS))),
            stsz_box(100, &[0; 2]),
            stco_box(&[1000, 1100]),
        );
        let audio = audio_trak(44_100, stsz_box(50, &[0; 2]), stco_box(&[1210, 1260]));
        let sample = idr_sample_100();
        let data = build_file(
            vec![video, audio],
            &[(1000, sample.clone()), (1100, sample)],
            1400,
        );

        let demuxer = demuxer_from_reader(Cursor::new(data)).unwrap();
        assert_eq!(demuxer.tracks()[1].kind, TrackKind::Audio);
        assert_eq!(demuxer.tracks()[1].timescale, 44_100);
        assert_eq!(demuxer.tracks()[1].width(), 0);

        let yielded: Vec<(u32, u64)> = demuxer
            .map(|s| {
                let s = s.unwrap();
                (s.track_id, s.timestamp.value)
            })
            .collect();
        assert_eq!(yielded, vec![(1, 0), (1, 1), (2, 0), (2, 1)]);
    }

    #[test]
    fn mdhd_version_1_timescale_is_read() {
        let trak = video_trak(
            mdhd_v1_box(24_000),
            stsd_box(&avc1_box(16, 16, &avcc_box(&SPS_16X16, &PPS))),
            stsz_box(0, &[100]),
            stco_box(&[1000]),
        );
        let data = build_file(vec![trak], &[(1000, idr_sample_100())], 1300);
        let demuxer = demuxer_from_reader(Cursor::new(data)).unwrap();
        assert_eq!(demuxer.tracks()[0].timescale, 24_000);
    }

    #[test]
    fn falls_back_to_avc1_dimensions_when_sps_is_opaque() {
        // Two-byte SPS: stored verbatim but too short to parse.
        let stub_sps = [0x67, 0x42];
        let trak = video_trak(
            mdhd_v0_box(90_000),
            stsd_box(&avc1_box(1280, 720, &avcc_box(&stub_sps, &PPS))),
            stsz_box(100, &[0; 1]),
            stco_box(&[1000]),
        );
        let data = build_file(vec![trak], &[(1000, idr_sample_100())], 1300);
        let demuxer = demuxer_from_reader(Cursor::new(data)).unwrap();

        let track = &demuxer.tracks()[0];
        assert_eq!(track.width(), 1280);
        assert_eq!(track.height(), 720);
        assert_eq!(track.h264_params().unwrap().sps(), &stub_sps);
    }

    #[test]
    fn bad_sample_is_reported_without_poisoning_iteration() {
        // First sample declares a NAL that overruns; second is valid.
        let mut bad = 0xFFu32.to_be_bytes().to_vec();
        bad.push(0x65);
        bad.resize(100, 0xAA);

        let trak = video_trak(
            mdhd_v0_box(90_000),
            stsd_box(&avc1_box(16, 16, &avcc_box(&SPS_16X16, &PPS))),
            stsz_box(100, &[0; 2]),
            stco_box(&[1000, 1100]),
        );
        let data = build_file(vec![trak], &[(1000, bad), (1100, idr_sample_100())], 1300);
        let mut demuxer = demuxer_from_reader(Cursor::new(data)).unwrap();

        assert!(matches!(
            demuxer.next(),
            Some(Err(Error::BadSample {
                track_id: 1,
                sample_index: 0,
                ..
            }))
        ));
        let second = demuxer.next().unwrap().unwrap();
        assert_eq!(second.timestamp.value, 1);
        assert!(demuxer.next().is_none());
    }

    #[test]
    fn sample_past_end_of_file_is_io_error() {
        let trak = video_trak(
            mdhd_v0_box(90_000),
            stsd_box(&avc1_box(16, 16, &avcc_box(&SPS_16X16, &PPS))),
            stsz_box(100, &[0; 1]),
            stco_box(&[100_000]),
        );
        let data = build_file(vec![trak], &[], 1300);
        let mut demuxer = demuxer_from_reader(Cursor::new(data)).unwrap();
        assert!(matches!(
            demuxer.next(),
            Some(Err(Error::SampleRead { offset: 100_000, .. }))
        ));
    }

    #[test]
    fn missing_moov_fails_open() {
        let data = bx("ftyp", &[]);
        assert!(matches!(
            demuxer_from_reader(Cursor::new(data)),
            Err(Error::MissingBox { box_type: "moov" })
        ));
    }

    #[test]
    fn missing_stco_fails_open() {
        let trak = video_trak(
            mdhd_v0_box(90_000),
            stsd_box(&avc1_box(16, 16, &avcc_box(&SPS_16X16, &PPS))),
            stsz_box(100, &[0; 1]),
            Vec::new(),
        );
        let data = build_file(vec![trak], &[], 1300);
        assert!(matches!(
            demuxer_from_reader(Cursor::new(data)),
            Err(Error::MissingBox { box_type: "stco" })
        ));
    }

    #[test]
    fn missing_avcc_fails_open() {
        let trak = video_trak(
            mdhd_v0_box(90_000),
            stsd_box(&avc1_box(16, 16, &[])),
            stsz_box(100, &[0; 1]),
            stco_box(&[1000]),
        );
        let data = build_file(vec![trak], &[], 1300);
        assert!(matches!(
            demuxer_from_reader(Cursor::new(data)),
            Err(Error::MissingBox { box_type: "avcC" })
        ));
    }

    #[test]
    fn fragmented_input_is_unsupported() {
        let mut data = simple_video_file();
        data.extend_from_slice(&bx("moof", &[]));
        assert!(matches!(
            demuxer_from_reader(Cursor::new(data)),
            Err(Error::Unsupported { .. })
        ));
    }

    #[test]
    fn co64_is_unsupported() {
        let mut co64_payload = vec![0u8; 4];
        co64_payload.extend_from_slice(&0u32.to_be_bytes());
        let trak = video_trak(
            mdhd_v0_box(90_000),
            stsd_box(&avc1_box(16, 16, &avcc_box(&SPS_16X16, &PPS))),
            stsz_box(100, &[0; 1]),
            bx("co64", &co64_payload),
        );
        let data = build_file(vec![trak], &[], 1300);
        assert!(matches!(
            demuxer_from_reader(Cursor::new(data)),
            Err(Error::Unsupported { .. })
        ));
    }

    #[test]
    fn edit_lists_are_unsupported() {
        let mut trak = video_trak(
            mdhd_v0_box(90_000),
            stsd_box(&avc1_box(16, 16, &avcc_box(&SPS_16X16, &PPS))),
            stsz_box(100, &[0; 1]),
            stco_box(&[1000]),
        );
        // Splice an empty edts into the trak payload.
        let edts = bx("edts", &[]);
        let mut patched = trak[..8].to_vec();
        patched.extend_from_slice(&edts);
        patched.extend_from_slice(&trak[8..]);
        let new_size = (patched.len() as u32).to_be_bytes();
        patched[..4].copy_from_slice(&new_size);
        trak = patched;

        let data = build_file(vec![trak], &[], 1300);
        assert!(matches!(
            demuxer_from_reader(Cursor::new(data)),
            Err(Error::Unsupported { .. })
        ));
    }

    #[test]
    fn non_avc_sample_entry_is_unsupported() {
        let mut avc1 = avc1_box(16, 16, &avcc_box(&SPS_16X16, &PPS));
        avc1[4..8].copy_from_slice(b"hvc1");
        let trak = video_trak(
            mdhd_v0_box(90_000),
            stsd_box(&avc1),
            stsz_box(100, &[0; 1]),
            stco_box(&[1000]),
        );
        let data = build_file(vec![trak], &[], 1300);
        assert!(matches!(
            demuxer_from_reader(Cursor::new(data)),
            Err(Error::Unsupported { .. })
        ));
    }

    #[test]
    fn stsz_table_larger_than_box_fails() {
        // Declares 4 sizes but the table region only holds 1.
        let mut p = vec![0u8; 4];
        p.extend_from_slice(&0u32.to_be_bytes());
        p.extend_from_slice(&4u32.to_be_bytes());
        p.extend_from_slice(&100u32.to_be_bytes());
        let trak = video_trak(
            mdhd_v0_box(90_000),
            stsd_box(&avc1_box(16, 16, &avcc_box(&SPS_16X16, &PPS))),
            bx("stsz", &p),
            stco_box(&[1000]),
        );
        let data = build_file(vec![trak], &[], 1300);
        assert!(matches!(
            demuxer_from_reader(Cursor::new(data)),
            Err(Error::InvalidTable { box_type: "stsz", .. })
        ));
    }

    #[test]
    fn fixed_size_count_bounded_by_file_size() {
        let trak = video_trak(
            mdhd_v0_box(90_000),
            stsd_box(&avc1_box(16, 16, &avcc_box(&SPS_16X16, &PPS))),
            stsz_box(u32::MAX, &[0; 3]),
            stco_box(&[1000, 1100, 1200]),
        );
        let data = build_file(vec![trak], &[], 1300);
        assert!(matches!(
            demuxer_from_reader(Cursor::new(data)),
            Err(Error::InvalidTable { box_type: "stsz", .. })
        ));
    }
}
