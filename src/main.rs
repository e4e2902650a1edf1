use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use avc_demux::h264;
use avc_demux::{demuxer_from_path, Error, Sample, Track, TrackKind};

#[derive(Debug, Serialize)]
struct TrackRecord {
    track_id: u32,
    kind: &'static str,
    width: u32,
    height: u32,
    timescale: u32,
    sample_count: usize,
    sps_len: usize,
    pps_len: usize,
}

impl From<&Track> for TrackRecord {
    fn from(t: &Track) -> Self {
        TrackRecord {
            track_id: t.track_id,
            kind: t.kind.name(),
            width: t.width(),
            height: t.height(),
            timescale: t.timescale,
            sample_count: t.sample_count(),
            sps_len: t.h264_params().map_or(0, |p| p.sps().len()),
            pps_len: t.h264_params().map_or(0, |p| p.pps().len()),
        }
    }
}

#[derive(Debug, Serialize)]
struct SampleRecord {
    track_id: u32,
    kind: &'static str,
    index: u64,
    size: usize,
    pts_value: u64,
    pts_timescale: u32,
    seconds: f64,
}

impl From<&Sample> for SampleRecord {
    fn from(s: &Sample) -> Self {
        SampleRecord {
            track_id: s.track_id,
            kind: s.kind.name(),
            index: s.timestamp.value,
            size: s.size(),
            pts_value: s.timestamp.value,
            pts_timescale: s.timestamp.timescale,
            seconds: s.timestamp.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Csv,
}

fn sample_csv_header() -> &'static str {
    "track_id,kind,index,size,pts_value,pts_timescale,seconds"
}

#[derive(Parser, Debug)]
#[command(name = "avc-demux")]
#[command(about = "Demultiplex an MP4 file into H.264 samples", long_about = None)]
struct Cli {
    /// Input MP4 file
    #[arg(value_name = "INPUT.mp4")]
    input: PathBuf,

    /// Output file path (use '-' for stdout)
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<PathBuf>,

    /// Output format
    #[arg(long = "format", value_enum, default_value_t = OutputFormat::Text, conflicts_with_all = ["csv", "json"])]
    format: OutputFormat,

    /// Alias for `--format csv`
    #[arg(long, conflicts_with_all = ["json", "format"], action = clap::ArgAction::SetTrue)]
    csv: bool,

    /// Alias for `--format json`
    #[arg(long, conflicts_with_all = ["csv", "format"], action = clap::ArgAction::SetTrue)]
    json: bool,

    /// Stop after this many samples
    #[arg(short = 'n', long = "limit", value_name = "COUNT")]
    limit: Option<usize>,

    /// Abort on the first sample that fails AVCC validation
    /// (default: warn and keep going)
    #[arg(long, action = clap::ArgAction::SetTrue)]
    strict: bool,
}

fn resolve_format(cli: &Cli) -> OutputFormat {
    if cli.csv {
        OutputFormat::Csv
    } else if cli.json {
        OutputFormat::Json
    } else {
        cli.format
    }
}

fn should_write_to_stdout(output: &Option<PathBuf>) -> bool {
    match output {
        None => true,
        Some(p) => p.as_os_str() == "-",
    }
}

fn leading_bytes_hex(data: &[u8]) -> String {
    data.iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn nal_summary(sample: &Sample, nal_length_size: Option<usize>) -> String {
    let Some(len_size) = nal_length_size else {
        return String::new();
    };
    let kinds: Vec<&'static str> = h264::nal_units(&sample.data, len_size)
        .iter()
        .map(|n| n.kind.name())
        .collect();
    format!(" nals=[{}]", kinds.join(","))
}

fn write_track_summary(tracks: &[Track], out: &mut dyn Write) -> io::Result<()> {
    for t in tracks {
        match t.h264_params() {
            Some(p) => writeln!(
                out,
                "track {}: {} {}x{} timescale={} samples={} nal_len={} sps={}B pps={}B",
                t.track_id,
                t.kind.name(),
                p.width,
                p.height,
                t.timescale,
                t.sample_count(),
                p.nal_length_size,
                p.sps().len(),
                p.pps().len()
            )?,
            None => writeln!(
                out,
                "track {}: {} timescale={} samples={}",
                t.track_id,
                t.kind.name(),
                t.timescale,
                t.sample_count()
            )?,
        }
    }
    Ok(())
}

fn run_with_writer(
    input: &PathBuf,
    format: OutputFormat,
    limit: Option<usize>,
    strict: bool,
    out: &mut dyn Write,
) -> Result<(), Error> {
    let mut demuxer = demuxer_from_path(input)?;

    // Per-track NAL length sizes, fetched up front so the iteration below
    // can own the demuxer mutably.
    let nal_length_sizes: Vec<(u32, Option<usize>)> = demuxer
        .tracks()
        .iter()
        .map(|t| (t.track_id, t.h264_params().map(|p| p.nal_length_size)))
        .collect();

    let track_records: Vec<TrackRecord> = demuxer.tracks().iter().map(Into::into).collect();
    if format == OutputFormat::Text {
        write_track_summary(demuxer.tracks(), out)?;
    }
    if format == OutputFormat::Csv {
        writeln!(out, "{}", sample_csv_header())?;
    }

    let mut sample_records: Vec<SampleRecord> = Vec::new();
    let mut processed = 0usize;
    let mut video_samples = 0usize;
    let mut audio_samples = 0usize;
    let mut bad_samples = 0usize;
    let mut total_bytes = 0usize;

    while limit.is_none_or(|n| processed < n) {
        let sample = match demuxer.next_sample() {
            Ok(Some(sample)) => sample,
            Ok(None) => break,
            Err(e @ Error::BadSample { .. }) if !strict => {
                eprintln!("warning: skipping {e}");
                bad_samples += 1;
                processed += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        processed += 1;
        total_bytes += sample.size();
        match sample.kind {
            TrackKind::Video => video_samples += 1,
            TrackKind::Audio => audio_samples += 1,
            TrackKind::Unknown => {}
        }

        match format {
            OutputFormat::Text => {
                let nal_len = nal_length_sizes
                    .iter()
                    .find(|(id, _)| *id == sample.track_id)
                    .and_then(|(_, n)| *n);
                writeln!(
                    out,
                    "sample: track={} kind={} index={} size={} pts={}/{} ({:.3}s) bytes=[{}]{}",
                    sample.track_id,
                    sample.kind.name(),
                    sample.timestamp.value,
                    sample.size(),
                    sample.timestamp.value,
                    sample.timestamp.timescale,
                    sample.timestamp.as_secs_f64(),
                    leading_bytes_hex(&sample.data),
                    nal_summary(&sample, nal_len)
                )?;
            }
            OutputFormat::Json => sample_records.push((&sample).into()),
            OutputFormat::Csv => {
                let r = SampleRecord::from(&sample);
                // Write rows as we go (lower memory, easy to stream).
                writeln!(
                    out,
                    "{},{},{},{},{},{},{:.6}",
                    r.track_id, r.kind, r.index, r.size, r.pts_value, r.pts_timescale, r.seconds
                )?;
            }
        }
    }

    match format {
        OutputFormat::Text => {
            writeln!(out)?;
            writeln!(out, "processed {processed} samples")?;
            writeln!(out, "  video: {video_samples}")?;
            writeln!(out, "  audio: {audio_samples}")?;
            if bad_samples > 0 {
                writeln!(out, "  failed validation: {bad_samples}")?;
            }
            writeln!(out, "  bytes: {total_bytes}")?;
        }
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct Report {
                tracks: Vec<TrackRecord>,
                samples: Vec<SampleRecord>,
            }
            let report = Report {
                tracks: track_records,
                samples: sample_records,
            };
            let json = serde_json::to_string_pretty(&report).unwrap();
            writeln!(out, "{json}")?;
        }
        OutputFormat::Csv => {}
    }

    Ok(())
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    let format = resolve_format(&cli);

    if should_write_to_stdout(&cli.output) {
        let stdout = io::stdout();
        let mut out = BufWriter::new(stdout.lock());
        run_with_writer(&cli.input, format, cli.limit, cli.strict, &mut out)?;
        out.flush()?;
    } else {
        let path = cli.output.as_ref().unwrap();
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        run_with_writer(&cli.input, format, cli.limit, cli.strict, &mut out)?;
        out.flush()?;
    }

    Ok(())
}
