use std::io::{Read, Seek, SeekFrom};

use crate::trace::Trace;
use crate::Error;

// -----------------------------
// ISO-BMFF box tree (minimal, read-only)
// -----------------------------

// Defence against pathological inputs: no sibling list may grow past this.
const MAX_BOXES_PER_LEVEL: usize = 1000;

// VisualSampleEntry fixed fields between the avc1 header and its child boxes:
// 6 reserved + 2 data_reference_index + 16 pre_defined/reserved + 2 width +
// 2 height + 50 resolution/frame_count/compressorname/depth fields.
const VISUAL_SAMPLE_ENTRY_LEN: u64 = 78;

pub(crate) fn fourcc_to_string(t: [u8; 4]) -> String {
    // Best-effort display for diagnostics.
    t.iter()
        .map(|&c| if c.is_ascii_graphic() { c as char } else { '.' })
        .collect()
}

/// Box type dispatch. Everything the demuxer does not interpret stays
/// `Other` and is kept as an opaque leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoxKind {
    Moov,
    Trak,
    Mdia,
    Minf,
    Stbl,
    Stsd,
    Avc1,
    AvcC,
    Hdlr,
    Mdhd,
    Stsz,
    Stco,
    Co64,
    Moof,
    Edts,
    Other([u8; 4]),
}

impl BoxKind {
    fn from_fourcc(t: [u8; 4]) -> Self {
        match &t {
            b"moov" => BoxKind::Moov,
            b"trak" => BoxKind::Trak,
            b"mdia" => BoxKind::Mdia,
            b"minf" => BoxKind::Minf,
            b"stbl" => BoxKind::Stbl,
            b"stsd" => BoxKind::Stsd,
            b"avc1" => BoxKind::Avc1,
            b"avcC" => BoxKind::AvcC,
            b"hdlr" => BoxKind::Hdlr,
            b"mdhd" => BoxKind::Mdhd,
            b"stsz" => BoxKind::Stsz,
            b"stco" => BoxKind::Stco,
            b"co64" => BoxKind::Co64,
            b"moof" => BoxKind::Moof,
            b"edts" => BoxKind::Edts,
            _ => BoxKind::Other(t),
        }
    }

    pub(crate) fn name(&self) -> String {
        let t = match self {
            BoxKind::Moov => *b"moov",
            BoxKind::Trak => *b"trak",
            BoxKind::Mdia => *b"mdia",
            BoxKind::Minf => *b"minf",
            BoxKind::Stbl => *b"stbl",
            BoxKind::Stsd => *b"stsd",
            BoxKind::Avc1 => *b"avc1",
            BoxKind::AvcC => *b"avcC",
            BoxKind::Hdlr => *b"hdlr",
            BoxKind::Mdhd => *b"mdhd",
            BoxKind::Stsz => *b"stsz",
            BoxKind::Stco => *b"stco",
            BoxKind::Co64 => *b"co64",
            BoxKind::Moof => *b"moof",
            BoxKind::Edts => *b"edts",
            BoxKind::Other(t) => *t,
        };
        fourcc_to_string(t)
    }

    // Containers whose payload is a plain list of child boxes.
    fn is_plain_container(&self) -> bool {
        matches!(
            self,
            BoxKind::Moov
                | BoxKind::Trak
                | BoxKind::Mdia
                | BoxKind::Minf
                | BoxKind::Stbl
        )
    }
}

/// One node of the scanned tree. Nodes are stored in pre-order, so a node's
/// descendants occupy the ids directly after it, all with offsets inside
/// `[payload, end)`.
#[derive(Debug, Clone)]
pub(crate) struct BoxNode {
    pub(crate) kind: BoxKind,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) header_len: u64,
}

impl BoxNode {
    pub(crate) fn payload_start(&self) -> u64 {
        self.offset + self.header_len
    }

    pub(crate) fn payload_len(&self) -> u64 {
        self.size - self.header_len
    }

    pub(crate) fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Flat pre-order arena of scanned boxes. Built once per open, dropped as
/// soon as the track tables exist.
#[derive(Debug)]
pub(crate) struct BoxTree {
    nodes: Vec<BoxNode>,
}

struct BoxHeader {
    kind: BoxKind,
    typ: [u8; 4],
    size: u64,
    header_len: u64,
}

fn read_be_u32<R: Read>(r: &mut R) -> std::io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_be_u64<R: Read>(r: &mut R) -> std::io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

impl BoxTree {
    /// Scan `[0, file_len)` of `reader` into a tree. Only box headers are
    /// read; payloads stay on disk.
    pub(crate) fn scan<R: Read + Seek>(
        reader: &mut R,
        file_len: u64,
        trace: &Trace,
    ) -> Result<Self, Error> {
        let mut nodes = Vec::new();
        scan_range(reader, 0, file_len, "top", &mut nodes, trace)?;
        Ok(Self { nodes })
    }

    pub(crate) fn node(&self, id: usize) -> &BoxNode {
        &self.nodes[id]
    }

    /// First box of `kind` anywhere in the tree, in document order.
    pub(crate) fn find(&self, kind: BoxKind) -> Option<usize> {
        self.nodes.iter().position(|n| n.kind == kind)
    }

    /// First descendant of `parent` with the given kind, in document order.
    pub(crate) fn find_in(&self, parent: usize, kind: BoxKind) -> Option<usize> {
        let end = self.nodes[parent].end();
        self.nodes[parent + 1..]
            .iter()
            .take_while(|n| n.offset < end)
            .position(|n| n.kind == kind)
            .map(|i| parent + 1 + i)
    }

    /// Next box of `kind` after `current` in document order, anywhere in the
    /// tree. Used to step from one `trak` to the next.
    pub(crate) fn find_after(&self, current: usize, kind: BoxKind) -> Option<usize> {
        let end = self.nodes[current].end();
        self.nodes[current + 1..]
            .iter()
            .position(|n| n.offset >= end && n.kind == kind)
            .map(|i| current + 1 + i)
    }

    /// First child of `parent`, regardless of kind. In pre-order that is the
    /// very next node, when its offset still falls inside the parent.
    pub(crate) fn first_child(&self, parent: usize) -> Option<usize> {
        let next = parent + 1;
        if next < self.nodes.len() && self.nodes[next].offset < self.nodes[parent].end() {
            Some(next)
        } else {
            None
        }
    }
}

fn read_box_header<R: Read + Seek>(
    reader: &mut R,
    ctx: &str,
    start: u64,
    limit: u64,
) -> Result<BoxHeader, Error> {
    if start + 8 > limit {
        return Err(Error::InvalidBox {
            context: ctx.to_string(),
            box_type: "????".to_string(),
            offset: start,
            message: format!("truncated header ({} bytes left)", limit - start),
        });
    }

    reader.seek(SeekFrom::Start(start))?;
    let size32 = read_be_u32(reader)? as u64;
    let mut typ = [0u8; 4];
    reader.read_exact(&mut typ)?;
    let kind = BoxKind::from_fourcc(typ);

    let (size, header_len) = if size32 == 1 {
        if start + 16 > limit {
            return Err(Error::InvalidBox {
                context: ctx.to_string(),
                box_type: fourcc_to_string(typ),
                offset: start,
                message: "truncated 64-bit size".to_string(),
            });
        }
        (read_be_u64(reader)?, 16)
    } else if size32 == 0 {
        // Box extends to the end of its container.
        (limit - start, 8)
    } else {
        (size32, 8)
    };

    if size < header_len {
        return Err(Error::InvalidBox {
            context: ctx.to_string(),
            box_type: fourcc_to_string(typ),
            offset: start,
            message: format!("size {size} < header length {header_len}"),
        });
    }
    if start + size > limit {
        return Err(Error::InvalidBox {
            context: ctx.to_string(),
            box_type: fourcc_to_string(typ),
            offset: start,
            message: format!("box end {} escapes container end {limit}", start + size),
        });
    }

    Ok(BoxHeader {
        kind,
        typ,
        size,
        header_len,
    })
}

fn scan_range<R: Read + Seek>(
    reader: &mut R,
    mut pos: u64,
    end: u64,
    ctx: &str,
    nodes: &mut Vec<BoxNode>,
    trace: &Trace,
) -> Result<(), Error> {
    let mut siblings = 0usize;

    while pos < end {
        let hdr = read_box_header(reader, ctx, pos, end)?;

        siblings += 1;
        if siblings > MAX_BOXES_PER_LEVEL {
            return Err(Error::InvalidBox {
                context: ctx.to_string(),
                box_type: fourcc_to_string(hdr.typ),
                offset: pos,
                message: format!("more than {MAX_BOXES_PER_LEVEL} sibling boxes"),
            });
        }

        if trace.enabled {
            eprintln!(
                "[mp4] {ctx}: pos={pos} typ={} size={} header={} limit={end}",
                fourcc_to_string(hdr.typ),
                hdr.size,
                hdr.header_len
            );
        }

        let box_end = pos + hdr.size;
        nodes.push(BoxNode {
            kind: hdr.kind,
            offset: pos,
            size: hdr.size,
            header_len: hdr.header_len,
        });

        // Container payloads are scanned recursively; everything else is an
        // opaque leaf parsed later, if at all, by offset.
        if hdr.kind.is_plain_container() {
            scan_range(reader, pos + hdr.header_len, box_end, &hdr.kind.name(), nodes, trace)?;
        } else if hdr.kind == BoxKind::Stsd {
            // stsd payload: version/flags (4) + entry_count (4), then the
            // sample-description entries.
            let child_start = pos + hdr.header_len + 8;
            if child_start > box_end {
                return Err(Error::InvalidBox {
                    context: ctx.to_string(),
                    box_type: fourcc_to_string(hdr.typ),
                    offset: pos,
                    message: "stsd too small for its entry header".to_string(),
                });
            }
            scan_range(reader, child_start, box_end, "stsd", nodes, trace)?;
        } else if hdr.kind == BoxKind::Avc1 {
            // avc1 sample entries carry the fixed VisualSampleEntry fields
            // before their child boxes. Only avc1 gets this treatment; other
            // sample-entry FourCCs are left opaque and rejected downstream.
            let child_start = pos + hdr.header_len + VISUAL_SAMPLE_ENTRY_LEN;
            if child_start > box_end {
                return Err(Error::InvalidBox {
                    context: ctx.to_string(),
                    box_type: fourcc_to_string(hdr.typ),
                    offset: pos,
                    message: "sample entry too small for its fixed fields".to_string(),
                });
            }
            scan_range(reader, child_start, box_end, "avc1", nodes, trace)?;
        }

        pos = box_end;
    }

    Ok(())
}
