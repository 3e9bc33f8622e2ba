// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `.mp4` virtual file serving.
//!
//! This module builds virtual files representing ISO/IEC 14496-12 (ISO base
//! media format / MPEG-4 / `.mp4`) video. These can be constructed from one
//! or more recordings and are suitable for HTTP range serving or download.
//!
//! The virtual file is an ordered list of slices (see the `slices` module):
//! static bytestrings, a buffer of freshly-generated box headers, per-segment
//! sample tables generated on first access, and memory-mapped ranges of the
//! on-disk sample files. The total size, etag, and last-modified time are
//! computed eagerly at build time, so a file can be served incrementally and
//! repeatedly with byte-range requests.

use crate::mmapfile;
use crate::resource;
use crate::slices::{clip_to_range, ContextWriter, Slices};
use base::{bail_t, Error, ErrorKind, ResultExt};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use db::recording::{self, TIME_UNITS_PER_SEC};
use db::{dir, VideoSampleEntry};
use openssl::hash;
use std::cmp;
use std::io::{self, Write};
use std::mem;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// This value should be incremented any time a change is made to this file
/// that causes different bytes to be output for a particular set of
/// `Mp4FileBuilder` options. Incrementing this value will cause the etag to
/// change as well, so clients won't splice ranges from different versions of
/// the encoding into one file.
const FORMAT_VERSION: [u8; 1] = [0x01];

/// An `ftyp` (ISO/IEC 14496-12 section 4.3 `FileType`) box.
#[rustfmt::skip]
const FTYP_BOX: &[u8] = &[
    0x00, 0x00, 0x00, 0x20,  // length = 32, sizeof(FTYP_BOX)
    b'f', b't', b'y', b'p',  // type
    b'i', b's', b'o', b'm',  // major_brand
    0x00, 0x00, 0x02, 0x00,  // minor_version
    b'i', b's', b'o', b'm',  // compatible_brands[0]
    b'i', b's', b'o', b'2',  // compatible_brands[1]
    b'a', b'v', b'c', b'1',  // compatible_brands[2]
    b'm', b'p', b'4', b'1',  // compatible_brands[3]
];

/// An `hdlr` (ISO/IEC 14496-12 section 8.4.3 `HandlerBox`) box suitable for
/// a video track.
#[rustfmt::skip]
const VIDEO_HDLR_BOX: &[u8] = &[
    0x00, 0x00, 0x00, 0x21,  // length == sizeof(kHdlrBox)
    b'h', b'd', b'l', b'r',  // type == hdlr, ISO/IEC 14496-12 section 8.4.3.
    0x00, 0x00, 0x00, 0x00,  // version + flags
    0x00, 0x00, 0x00, 0x00,  // pre_defined
    b'v', b'i', b'd', b'e',  // handler = vide
    0x00, 0x00, 0x00, 0x00,  // reserved[0]
    0x00, 0x00, 0x00, 0x00,  // reserved[1]
    0x00, 0x00, 0x00, 0x00,  // reserved[2]
    0x00,                    // name, zero-terminated (empty)
];

/// An `hdlr` (ISO/IEC 14496-12 section 8.4.3 `HandlerBox`) box suitable for
/// a subtitle track.
#[rustfmt::skip]
const SUBTITLE_HDLR_BOX: &[u8] = &[
    0x00, 0x00, 0x00, 0x21,  // length == sizeof(kHdlrBox)
    b'h', b'd', b'l', b'r',  // type == hdlr, ISO/IEC 14496-12 section 8.4.3.
    0x00, 0x00, 0x00, 0x00,  // version + flags
    0x00, 0x00, 0x00, 0x00,  // pre_defined
    b's', b'b', b't', b'l',  // handler = sbtl
    0x00, 0x00, 0x00, 0x00,  // reserved[0]
    0x00, 0x00, 0x00, 0x00,  // reserved[1]
    0x00, 0x00, 0x00, 0x00,  // reserved[2]
    0x00,                    // name, zero-terminated (empty)
];

/// Part of an `mvhd` (`MovieHeaderBox` version 0, ISO/IEC 14496-12 section
/// 8.2.2), used from `append_mvhd`.
#[rustfmt::skip]
const MVHD_JUNK: &[u8] = &[
    0x00, 0x01, 0x00, 0x00,  // rate
    0x01, 0x00,              // volume
    0x00, 0x00,              // reserved
    0x00, 0x00, 0x00, 0x00,  // reserved
    0x00, 0x00, 0x00, 0x00,  // reserved
    0x00, 0x01, 0x00, 0x00,  // matrix[0]
    0x00, 0x00, 0x00, 0x00,  // matrix[1]
    0x00, 0x00, 0x00, 0x00,  // matrix[2]
    0x00, 0x00, 0x00, 0x00,  // matrix[3]
    0x00, 0x01, 0x00, 0x00,  // matrix[4]
    0x00, 0x00, 0x00, 0x00,  // matrix[5]
    0x00, 0x00, 0x00, 0x00,  // matrix[6]
    0x00, 0x00, 0x00, 0x00,  // matrix[7]
    0x40, 0x00, 0x00, 0x00,  // matrix[8]
    0x00, 0x00, 0x00, 0x00,  // pre_defined[0]
    0x00, 0x00, 0x00, 0x00,  // pre_defined[1]
    0x00, 0x00, 0x00, 0x00,  // pre_defined[2]
    0x00, 0x00, 0x00, 0x00,  // pre_defined[3]
    0x00, 0x00, 0x00, 0x00,  // pre_defined[4]
    0x00, 0x00, 0x00, 0x00,  // pre_defined[5]
];

/// Part of a `tkhd` (`TrackHeaderBox` version 0, ISO/IEC 14496-12 section
/// 8.3.2), used from `append_video_tkhd` and `append_subtitle_tkhd`.
#[rustfmt::skip]
const TKHD_JUNK: &[u8] = &[
    0x00, 0x00, 0x00, 0x00,  // reserved
    0x00, 0x00, 0x00, 0x00,  // reserved
    0x00, 0x00, 0x00, 0x00,  // layer + alternate_group
    0x00, 0x00, 0x00, 0x00,  // volume + reserved
    0x00, 0x01, 0x00, 0x00,  // matrix[0]
    0x00, 0x00, 0x00, 0x00,  // matrix[1]
    0x00, 0x00, 0x00, 0x00,  // matrix[2]
    0x00, 0x00, 0x00, 0x00,  // matrix[3]
    0x00, 0x01, 0x00, 0x00,  // matrix[4]
    0x00, 0x00, 0x00, 0x00,  // matrix[5]
    0x00, 0x00, 0x00, 0x00,  // matrix[6]
    0x00, 0x00, 0x00, 0x00,  // matrix[7]
    0x40, 0x00, 0x00, 0x00,  // matrix[8]
];

/// Part of a `minf` (`MediaInformationBox`, ISO/IEC 14496-12 section 8.4.4),
/// used from `append_video_minf`.
#[rustfmt::skip]
const VIDEO_MINF_JUNK: &[u8] = &[
    b'm', b'i', b'n', b'f',  // type = minf, ISO/IEC 14496-12 section 8.4.4.
    // A vmhd box; the "graphicsmode" and "opcolor" values don't have any
    // meaningful use.
    0x00, 0x00, 0x00, 0x14,  // length == sizeof(kVmhdBox)
    b'v', b'm', b'h', b'd',  // type = vmhd, ISO/IEC 14496-12 section 12.1.2.
    0x00, 0x00, 0x00, 0x01,  // version + flags(1)
    0x00, 0x00, 0x00, 0x00,  // graphicsmode (copy), opcolor[0]
    0x00, 0x00, 0x00, 0x00,  // opcolor[1], opcolor[2]

    // A dinf box suitable for a "self-contained" .mp4 file (no URL/URN
    // references to external data).
    0x00, 0x00, 0x00, 0x24,  // length == sizeof(kDinfBox)
    b'd', b'i', b'n', b'f',  // type = dinf, ISO/IEC 14496-12 section 8.7.1.
    0x00, 0x00, 0x00, 0x1c,  // length
    b'd', b'r', b'e', b'f',  // type = dref, ISO/IEC 14496-12 section 8.7.2.
    0x00, 0x00, 0x00, 0x00,  // version and flags
    0x00, 0x00, 0x00, 0x01,  // entry_count
    0x00, 0x00, 0x00, 0x0c,  // length
    b'u', b'r', b'l', b' ',  // type = url, ISO/IEC 14496-12 section 8.7.2.
    0x00, 0x00, 0x00, 0x01,  // version=0, flags=self-contained
];

/// Part of a `minf` (`MediaInformationBox`, ISO/IEC 14496-12 section 8.4.4),
/// used from `append_subtitle_minf`.
#[rustfmt::skip]
const SUBTITLE_MINF_JUNK: &[u8] = &[
    b'm', b'i', b'n', b'f',  // type = minf, ISO/IEC 14496-12 section 8.4.4.
    // A nmhd box.
    0x00, 0x00, 0x00, 0x0c,  // length == sizeof(kNmhdBox)
    b'n', b'm', b'h', b'd',  // type = nmhd, ISO/IEC 14496-12 section 12.1.2.
    0x00, 0x00, 0x00, 0x01,  // version + flags(1)

    // A dinf box suitable for a "self-contained" .mp4 file (no URL/URN
    // references to external data).
    0x00, 0x00, 0x00, 0x24,  // length == sizeof(kDinfBox)
    b'd', b'i', b'n', b'f',  // type = dinf, ISO/IEC 14496-12 section 8.7.1.
    0x00, 0x00, 0x00, 0x1c,  // length
    b'd', b'r', b'e', b'f',  // type = dref, ISO/IEC 14496-12 section 8.7.2.
    0x00, 0x00, 0x00, 0x00,  // version and flags
    0x00, 0x00, 0x00, 0x01,  // entry_count
    0x00, 0x00, 0x00, 0x0c,  // length
    b'u', b'r', b'l', b' ',  // type = url, ISO/IEC 14496-12 section 8.7.2.
    0x00, 0x00, 0x00, 0x01,  // version=0, flags=self-contained
];

/// Part of a `stbl` (`SampleTableBox`, ISO/IEC 14496 section 8.5.1) used
/// from `append_subtitle_stbl`.
#[rustfmt::skip]
const SUBTITLE_STBL_JUNK: &[u8] = &[
    b's', b't', b'b', b'l',  // type = stbl, ISO/IEC 14496-12 section 8.5.1.

    // A stsd box.
    0x00, 0x00, 0x00, 0x54,  // length
    b's', b't', b's', b'd',  // type == stsd, ISO/IEC 14496-12 section 8.5.2.
    0x00, 0x00, 0x00, 0x00,  // version + flags
    0x00, 0x00, 0x00, 0x01,  // entry_count == 1

    // SampleEntry, ISO/IEC 14496-12 section 8.5.2.2.
    0x00, 0x00, 0x00, 0x44,  // length
    b't', b'x', b'3', b'g',  // type == tx3g, 3GPP TS 26.245 section 5.16.
    0x00, 0x00, 0x00, 0x00,  // reserved
    0x00, 0x00, 0x00, 0x01,  // reserved, data_reference_index == 1

    // TextSampleEntry
    0x00, 0x00, 0x00, 0x00,  // displayFlags == none
    0x00,                    // horizontal-justification == left
    0x00,                    // vertical-justification == top
    0x00, 0x00, 0x00, 0x00,  // background-color-rgba == transparent

    // TextSampleEntry.BoxRecord
    0x00, 0x00,  // top
    0x00, 0x00,  // left
    0x00, 0x00,  // bottom
    0x00, 0x00,  // right

    // TextSampleEntry.StyleRecord
    0x00, 0x00,              // startChar
    0x00, 0x00,              // endChar
    0x00, 0x01,              // font-ID
    0x00,                    // face-style-flags
    0x12,                    // font-size == 18 px
    0xff, 0xff, 0xff, 0xff,  // text-color-rgba == opaque white

    // TextSampleEntry.FontTableBox
    0x00, 0x00, 0x00, 0x16,  // length
    b'f', b't', b'a', b'b',  // type == ftab, section 5.16
    0x00, 0x01,              // entry-count == 1
    0x00, 0x01,              // font-ID == 1
    0x09,                    // font-name-length == 9
    b'M', b'o', b'n', b'o', b's', b'p', b'a', b'c', b'e',
];

/// Pointers to each static bytestring.
/// The order here must match the `StaticBytestring` enum.
const STATIC_BYTESTRINGS: [&[u8]; 8] = [
    FTYP_BOX,
    VIDEO_HDLR_BOX,
    SUBTITLE_HDLR_BOX,
    MVHD_JUNK,
    TKHD_JUNK,
    VIDEO_MINF_JUNK,
    SUBTITLE_MINF_JUNK,
    SUBTITLE_STBL_JUNK,
];

/// Enumeration of the static bytestrings. The order here must match the
/// `STATIC_BYTESTRINGS` array. The advantage of this enum over direct
/// pointers to the relevant strings is that it fits into a u32, allowing a
/// `Mp4FileSlice` to fit into 8 bytes.
#[derive(Copy, Clone, Debug)]
enum StaticBytestring {
    FtypBox,
    VideoHdlrBox,
    SubtitleHdlrBox,
    MvhdJunk,
    TkhdJunk,
    VideoMinfJunk,
    SubtitleMinfJunk,
    SubtitleStblJunk,
}

/// The template fed into strftime for a timestamp subtitle. This must
/// produce fixed-length output (see `SUBTITLE_LENGTH`) to allow quick
/// calculation of the total size of the subtitles for a given time range.
const SUBTITLE_TEMPLATE: &str = "%Y-%m-%d %H:%M:%S %z";

/// The length of the output of `SUBTITLE_TEMPLATE`.
const SUBTITLE_LENGTH: usize = 25; // "2015-07-02 17:10:00 -0700".len();

/// Holds the generated sample tables for a given video segment: `stts`,
/// `stsz`, and `stss` contents, concatenated into one buffer.
struct Mp4SegmentIndex {
    /// `&buf[.. stsz_start]` is stts; `&buf[stsz_start .. stss_start]` is
    /// stsz; `&buf[stss_start ..]` is stss.
    buf: Box<[u8]>,
    stsz_start: usize,
    stss_start: usize,
}

impl Mp4SegmentIndex {
    fn stts(&self) -> &[u8] {
        &self.buf[..self.stsz_start]
    }
    fn stsz(&self) -> &[u8] {
        &self.buf[self.stsz_start..self.stss_start]
    }
    fn stss(&self) -> &[u8] {
        &self.buf[self.stss_start..]
    }
}

struct Mp4Segment {
    s: recording::Segment,

    /// The sha1 of the segment's entire sample file, used in the etag.
    sample_file_sha1: [u8; 20],

    /// Holds the `stts`, `stsz`, and `stss` if they've been generated.
    /// Access only through `with_index`.
    index: Mutex<Option<Mp4SegmentIndex>>,

    /// The 1-indexed sample number in the `Mp4File` of the first sample in
    /// this segment.
    first_frame_num: u32,
    num_subtitle_samples: u32,
}

impl Mp4Segment {
    fn with_index<F, R>(&self, db: &db::Database, f: F) -> Result<R, Error>
    where
        F: FnOnce(&Mp4SegmentIndex) -> Result<R, Error>,
    {
        let mut i = self.index.lock().unwrap();
        if i.is_none() {
            *i = Some(self.build_index(db)?);
        }
        f(i.as_ref().expect("index was just built"))
    }

    fn build_index(&self, db: &db::Database) -> Result<Mp4SegmentIndex, Error> {
        let s = &self.s;
        let stts_len = mem::size_of::<u32>() * 2 * (s.frames as usize);
        let stsz_len = mem::size_of::<u32>() * s.frames as usize;
        let stss_len = mem::size_of::<u32>() * s.key_frames as usize;
        let len = stts_len + stsz_len + stss_len;
        let mut buf = vec![0u8; len].into_boxed_slice();
        {
            let (stts, rest) = buf.split_at_mut(stts_len);
            let (stsz, stss) = rest.split_at_mut(stsz_len);
            let mut frame = 0;
            let mut key_frame = 0;
            let mut last_start_and_dur = None;
            db.lock().with_recording_playback(s.recording_id, |playback| {
                s.foreach(playback, |it| {
                    last_start_and_dur = Some((it.start_90k, it.duration_90k));
                    BigEndian::write_u32(&mut stts[8 * frame..8 * frame + 4], 1);
                    BigEndian::write_u32(&mut stts[8 * frame + 4..8 * frame + 8], it.duration_90k as u32);
                    BigEndian::write_u32(&mut stsz[4 * frame..4 * frame + 4], it.bytes as u32);
                    if it.is_key() {
                        BigEndian::write_u32(
                            &mut stss[4 * key_frame..4 * key_frame + 4],
                            self.first_frame_num + (frame as u32),
                        );
                        key_frame += 1;
                    }
                    frame += 1;
                    Ok(())
                })
            })?;
            assert_eq!(s.frames, frame as i32);
            assert_eq!(s.key_frames, key_frame as i32);

            // Fix up the final frame's duration.
            // Doing this after the fact is more efficient than having a
            // condition on every iteration.
            if let Some((last_start, dur)) = last_start_and_dur {
                BigEndian::write_u32(
                    &mut stts[8 * frame - 4..],
                    cmp::min(s.desired_range_90k.end - last_start, dur) as u32,
                );
            }
        }
        Ok(Mp4SegmentIndex {
            buf,
            stsz_start: stts_len,
            stss_start: stts_len + stsz_len,
        })
    }
}

pub struct Mp4FileBuilder {
    /// Segments of video: one per `recording` table row as they should
    /// appear in the file.
    segments: Vec<Mp4Segment>,
    video_sample_entry: Option<Arc<VideoSampleEntry>>,
    next_frame_num: u32,
    duration_90k: u32,
    num_subtitle_samples: u32,
    subtitle_co64_pos: Option<usize>,
    body: BodyState,
    include_timestamp_subtitle_track: bool,
}

/// The portion of `Mp4FileBuilder` which is mutated while building the body
/// of the file. This is separated out from the rest so that it can be
/// borrowed in a loop over `Mp4FileBuilder::segments`.
struct BodyState {
    slices: Slices<Mp4FileSlice, Mp4File>,

    /// `buf[unflushed_buf_pos .. buf.len()]` holds bytes that should be
    /// appended to `slices` before any other slice. See `flush_buf()`.
    unflushed_buf_pos: usize,
    buf: Vec<u8>,
}

#[derive(Debug)]
enum Mp4FileSlice {
    Static(StaticBytestring), // index into STATIC_BYTESTRINGS
    Buf(u32),                 // index into m.buf
    VideoSampleEntry,
    Stts(u32), // index into m.segments
    Stsz(u32), // index into m.segments
    Co64,
    Stss(u32),                // index into m.segments
    VideoSampleData(u32),     // index into m.segments
    SubtitleSampleData(u32),  // index into m.segments
}

impl ContextWriter<Mp4File> for Mp4FileSlice {
    fn write_to(&self, f: &Mp4File, r: Range<u64>, l: u64, out: &mut Vec<u8>) -> Result<(), Error> {
        match *self {
            Mp4FileSlice::Static(off) => {
                let s = STATIC_BYTESTRINGS[off as usize];
                out.extend_from_slice(&s[r.start as usize..r.end as usize]);
                Ok(())
            }
            Mp4FileSlice::Buf(off) => {
                let off = off as usize;
                out.extend_from_slice(&f.buf[off + r.start as usize..off + r.end as usize]);
                Ok(())
            }
            Mp4FileSlice::VideoSampleEntry => {
                let e = &f.video_sample_entry;
                out.extend_from_slice(&e.data[r.start as usize..r.end as usize]);
                Ok(())
            }
            Mp4FileSlice::Stts(i) => f.write_stts(i as usize, r, l, out),
            Mp4FileSlice::Stsz(i) => f.write_stsz(i as usize, r, l, out),
            Mp4FileSlice::Co64 => f.write_co64(r, l, out),
            Mp4FileSlice::Stss(i) => f.write_stss(i as usize, r, l, out),
            Mp4FileSlice::VideoSampleData(i) => f.write_video_sample_data(i as usize, r, out),
            Mp4FileSlice::SubtitleSampleData(i) => f.write_subtitle_sample_data(i as usize, r, l, out),
        }
    }

    fn is_lazy(&self) -> bool {
        matches!(
            self,
            Mp4FileSlice::VideoSampleData(_) | Mp4FileSlice::SubtitleSampleData(_)
        )
    }
}

/// Converts from 90 kHz units since 1970-01-01 00:00:00 UTC to seconds since
/// 1904-01-01 00:00:00 UTC.
fn to_iso14496_timestamp(t: recording::Time) -> u32 {
    (t.unix_seconds() + 24107 * 86400) as u32
}

/// Used only within `Mp4FileBuilder::build` (and methods it calls
/// internally). Writes a box length for everything appended in the supplied
/// scope.
macro_rules! write_length {
    ($_self:ident, $b:block) => {{
        let len_pos = $_self.body.buf.len();
        let len_start = $_self.body.slices.len() + $_self.body.buf.len() as u64
            - $_self.body.unflushed_buf_pos as u64;
        $_self.body.append_u32(0); // placeholder.
        {
            $b;
        }
        let len_end = $_self.body.slices.len() + $_self.body.buf.len() as u64
            - $_self.body.unflushed_buf_pos as u64;
        BigEndian::write_u32(
            &mut $_self.body.buf[len_pos..len_pos + 4],
            (len_end - len_start) as u32,
        );
    }};
}

impl Mp4FileBuilder {
    pub fn new() -> Self {
        Mp4FileBuilder {
            segments: Vec::new(),
            video_sample_entry: None,
            next_frame_num: 1,
            duration_90k: 0,
            num_subtitle_samples: 0,
            subtitle_co64_pos: None,
            body: BodyState {
                slices: Slices::new(),
                buf: Vec::new(),
                unflushed_buf_pos: 0,
            },
            include_timestamp_subtitle_track: false,
        }
    }

    pub fn include_timestamp_subtitle_track(&mut self, b: bool) {
        self.include_timestamp_subtitle_track = b;
    }

    pub fn reserve(&mut self, additional: usize) {
        self.segments.reserve(additional);
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Appends a segment for (a subset of) the given recording.
    pub fn append(
        &mut self,
        db: &db::LockedDatabase,
        row: db::ListRecordingsRow,
        rel_range_90k: Range<i32>,
    ) -> Result<(), Error> {
        match self.video_sample_entry {
            None => self.video_sample_entry = Some(row.video_sample_entry.clone()),
            Some(ref e) if e.id == row.video_sample_entry.id => {}
            Some(ref e) => bail_t!(
                InvalidArgument,
                "inconsistent video sample entries: {} vs {}",
                e.id,
                row.video_sample_entry.id
            ),
        }
        let s = recording::Segment::new(db, &row, rel_range_90k)?;
        let first_frame_num = self.next_frame_num;
        self.next_frame_num += s.frames as u32;
        self.segments.push(Mp4Segment {
            s,
            sample_file_sha1: row.sample_file_sha1,
            index: Mutex::new(None),
            first_frame_num,
            num_subtitle_samples: 0,
        });
        Ok(())
    }

    pub fn build(
        mut self,
        db: Arc<db::Database>,
        dir: Arc<dir::SampleFileDir>,
    ) -> Result<Mp4File, Error> {
        if self.segments.is_empty() {
            bail_t!(InvalidArgument, "no segments!");
        }
        let mut max_end = None;
        let mut etag = hash::Hasher::new(hash::MessageDigest::sha1()).err_kind(ErrorKind::Internal)?;
        etag.update(&FORMAT_VERSION[..]).err_kind(ErrorKind::Internal)?;
        if self.include_timestamp_subtitle_track {
            etag.update(b":ts:").err_kind(ErrorKind::Internal)?;
        }
        let include_subtitles = self.include_timestamp_subtitle_track;
        for s in &mut self.segments {
            let d = &s.s.desired_range_90k;
            self.duration_90k += (d.end - d.start) as u32;
            let end = s.s.start + recording::Duration(i64::from(d.end));
            max_end = match max_end {
                None => Some(end),
                Some(v) => Some(cmp::max(v, end)),
            };

            if include_subtitles {
                // Calculate the number of subtitle samples: starting to
                // ending time, rounding up.
                let start_sec = (s.s.start + recording::Duration(i64::from(d.start))).unix_seconds();
                let end_sec = (s.s.start
                    + recording::Duration(i64::from(d.end) + TIME_UNITS_PER_SEC - 1))
                .unix_seconds();
                s.num_subtitle_samples = (end_sec - start_sec) as u32;
                self.num_subtitle_samples += s.num_subtitle_samples;
            }

            // Update the etag to reflect this segment. Any change to the
            // bytes a given description produces must be accompanied by a
            // FORMAT_VERSION bump instead.
            let mut data = [0u8; 36];
            {
                let mut cursor = io::Cursor::new(&mut data[..]);
                cursor.write_u64::<BigEndian>(d.start as u64).err_kind(ErrorKind::Internal)?;
                cursor.write_u64::<BigEndian>(d.end as u64).err_kind(ErrorKind::Internal)?;
                cursor.write_all(&s.sample_file_sha1[..]).err_kind(ErrorKind::Internal)?;
            }
            etag.update(&data[..]).err_kind(ErrorKind::Internal)?;
        }
        let max_end = max_end.expect("nonempty segments have a max end");
        let creation_ts = to_iso14496_timestamp(max_end);
        let mut est_slices = 16 + 4 * self.segments.len();
        if include_subtitles {
            est_slices += 16 + self.segments.len();
        }
        self.body.slices.reserve(est_slices);
        const EST_BUF_LEN: usize = 2048;
        self.body.buf.reserve(EST_BUF_LEN);
        self.body.append_static(StaticBytestring::FtypBox);
        self.append_moov(creation_ts)?;

        // Write the mdat header. Use the large format to support files over
        // 2^32-1 bytes long. Write zeroes for the length as a placeholder;
        // fill it in after it's known. It'd be nice to use the until-EOF
        // form, but some players don't support it.
        self.body
            .buf
            .extend_from_slice(b"\x00\x00\x00\x01mdat\x00\x00\x00\x00\x00\x00\x00\x00");
        let mdat_len_pos = self.body.buf.len() - 8;
        self.body.flush_buf();
        let initial_sample_byte_pos = self.body.slices.len();
        for (i, s) in self.segments.iter().enumerate() {
            let r = s.s.sample_file_range();
            self.body
                .slices
                .append(r.end - r.start, Mp4FileSlice::VideoSampleData(i as u32));
        }
        if let Some(p) = self.subtitle_co64_pos {
            BigEndian::write_u64(&mut self.body.buf[p..p + 8], self.body.slices.len());
            for (i, s) in self.segments.iter().enumerate() {
                self.body.slices.append(
                    u64::from(s.num_subtitle_samples)
                        * (mem::size_of::<u16>() + SUBTITLE_LENGTH) as u64,
                    Mp4FileSlice::SubtitleSampleData(i as u32),
                );
            }
        }
        // Fill in the length left as a placeholder above. Note the 16 here
        // is the length of the mdat header.
        BigEndian::write_u64(
            &mut self.body.buf[mdat_len_pos..mdat_len_pos + 8],
            16 + self.body.slices.len() - initial_sample_byte_pos,
        );
        if est_slices < self.body.slices.num() {
            warn!(
                "Estimated {} slices; actually were {} slices",
                est_slices,
                self.body.slices.num()
            );
        }
        debug!("slices: {:?}", self.body.slices);
        Ok(Mp4File {
            db,
            dir,
            segments: self.segments,
            slices: self.body.slices,
            buf: self.body.buf,
            video_sample_entry: self.video_sample_entry.expect("segments imply an entry"),
            initial_sample_byte_pos,
            last_modified: time::Timespec::new(max_end.unix_seconds(), 0),
            etag: format!("\"{}\"", base::strutil::hex(&etag.finish().err_kind(ErrorKind::Internal)?)),
        })
    }

    /// Appends a `MovieBox` (ISO/IEC 14496-12 section 8.2.1).
    fn append_moov(&mut self, creation_ts: u32) -> Result<(), Error> {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"moov");
            self.append_mvhd(creation_ts);
            self.append_video_trak(creation_ts)?;
            if self.include_timestamp_subtitle_track {
                self.append_subtitle_trak(creation_ts);
            }
        });
        Ok(())
    }

    /// Appends a `MovieHeaderBox` version 0 (ISO/IEC 14496-12 section 8.2.2).
    fn append_mvhd(&mut self, creation_ts: u32) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"mvhd\x00\x00\x00\x00");
            self.body.append_u32(creation_ts);
            self.body.append_u32(creation_ts);
            self.body.append_u32(TIME_UNITS_PER_SEC as u32);
            self.body.append_u32(self.duration_90k);
            self.body.append_static(StaticBytestring::MvhdJunk);
            let next_track_id = if self.include_timestamp_subtitle_track { 3 } else { 2 };
            self.body.append_u32(next_track_id);
        });
    }

    /// Appends a `TrackBox` (ISO/IEC 14496-12 section 8.3.1) suitable for
    /// video.
    fn append_video_trak(&mut self, creation_ts: u32) -> Result<(), Error> {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"trak");
            self.append_video_tkhd(creation_ts);
            self.maybe_append_video_edts()?;
            self.append_video_mdia(creation_ts);
        });
        Ok(())
    }

    /// Appends a `TrackBox` (ISO/IEC 14496-12 section 8.3.1) suitable for
    /// subtitles.
    fn append_subtitle_trak(&mut self, creation_ts: u32) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"trak");
            self.append_subtitle_tkhd(creation_ts);
            self.append_subtitle_mdia(creation_ts);
        });
    }

    /// Appends a `TrackHeaderBox` (ISO/IEC 14496-12 section 8.3.2) suitable
    /// for video.
    fn append_video_tkhd(&mut self, creation_ts: u32) {
        write_length!(self, {
            // flags 7: track_enabled | track_in_movie | track_in_preview
            self.body.buf.extend_from_slice(b"tkhd\x00\x00\x00\x07");
            self.body.append_u32(creation_ts);
            self.body.append_u32(creation_ts);
            self.body.append_u32(1); // track_id
            self.body.append_u32(0); // reserved
            self.body.append_u32(self.duration_90k);
            self.body.append_static(StaticBytestring::TkhdJunk);
            let e = self.video_sample_entry.as_ref().expect("append sets the entry");
            let width = u32::from(e.width);
            let height = u32::from(e.height);
            self.body.append_u32(width << 16); // 16.16 fixed point
            self.body.append_u32(height << 16);
        });
    }

    /// Appends a `TrackHeaderBox` (ISO/IEC 14496-12 section 8.3.2) suitable
    /// for subtitles.
    fn append_subtitle_tkhd(&mut self, creation_ts: u32) {
        write_length!(self, {
            // flags 7: track_enabled | track_in_movie | track_in_preview
            self.body.buf.extend_from_slice(b"tkhd\x00\x00\x00\x07");
            self.body.append_u32(creation_ts);
            self.body.append_u32(creation_ts);
            self.body.append_u32(2); // track_id
            self.body.append_u32(0); // reserved
            self.body.append_u32(self.duration_90k);
            self.body.append_static(StaticBytestring::TkhdJunk);
            self.body.append_u32(0); // width, unused.
            self.body.append_u32(0); // height, unused.
        });
    }

    /// Appends an `EditBox` (ISO/IEC 14496-12 section 8.6.5) suitable for
    /// video, if necessary.
    ///
    /// Each segment may have a "skip", the gap between the key frame the
    /// segment must start at and the desired start of presentation. An edit
    /// list maps the presentation timeline onto the media timeline past
    /// these skips. Consecutive segments with contiguous media times
    /// coalesce into a single entry; if everything coalesces into an entry
    /// starting at media time 0, the implicit one-to-one mapping suffices
    /// and no box is emitted.
    fn maybe_append_video_edts(&mut self) -> Result<(), Error> {
        #[derive(Debug, Default)]
        struct Entry {
            segment_duration: u64,
            media_time: u64,
        }
        let mut flushed: Vec<Entry> = Vec::new();
        let mut unflushed: Entry = Default::default();
        let mut cur_media_time: u64 = 0;
        for s in &self.segments {
            // The actual range may start before the desired range because it
            // can only start on a key frame. This relationship should hold:
            // actual start <= desired start < desired end
            let actual = s.s.actual_time_90k();
            let skip = s.s.desired_range_90k.start - actual.start;
            let keep = s.s.desired_range_90k.end - s.s.desired_range_90k.start;
            if skip < 0 || keep <= 0 {
                bail_t!(
                    Internal,
                    "skip={} keep={} on segment {:?}",
                    skip,
                    keep,
                    s.s.desired_range_90k
                );
            }
            cur_media_time += skip as u64;
            if unflushed.segment_duration + unflushed.media_time == cur_media_time {
                unflushed.segment_duration += keep as u64;
            } else {
                if unflushed.segment_duration > 0 {
                    flushed.push(unflushed);
                }
                unflushed = Entry {
                    segment_duration: keep as u64,
                    media_time: cur_media_time,
                };
            }
            cur_media_time += keep as u64;
        }

        if flushed.is_empty() && unflushed.media_time == 0 {
            return Ok(()); // use the implicit one-to-one mapping.
        }

        flushed.push(unflushed);
        debug!("Using edit list: {:?}", flushed);
        write_length!(self, {
            self.body.buf.extend_from_slice(b"edts");
            write_length!(self, {
                // Use version 1 for 64-bit times.
                self.body.buf.extend_from_slice(b"elst\x01\x00\x00\x00");
                self.body.append_u32(flushed.len() as u32);
                for e in &flushed {
                    self.body.append_u64(e.segment_duration);
                    self.body.append_u64(e.media_time);

                    // media_rate_integer + media_rate_fraction: fixed at 1.0
                    self.body.buf.extend_from_slice(b"\x00\x01\x00\x00");
                }
            });
        });
        Ok(())
    }

    /// Appends a `MediaBox` (ISO/IEC 14496-12 section 8.4.1) suitable for
    /// video.
    fn append_video_mdia(&mut self, creation_ts: u32) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"mdia");
            self.append_mdhd(creation_ts);
            self.body.append_static(StaticBytestring::VideoHdlrBox);
            self.append_video_minf();
        });
    }

    /// Appends a `MediaBox` (ISO/IEC 14496-12 section 8.4.1) suitable for
    /// subtitles.
    fn append_subtitle_mdia(&mut self, creation_ts: u32) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"mdia");
            self.append_mdhd(creation_ts);
            self.body.append_static(StaticBytestring::SubtitleHdlrBox);
            self.append_subtitle_minf();
        });
    }

    /// Appends a `MediaHeaderBox` (ISO/IEC 14496-12 section 8.4.2) suitable
    /// for either the video or subtitle track.
    fn append_mdhd(&mut self, creation_ts: u32) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"mdhd\x00\x00\x00\x00");
            self.body.append_u32(creation_ts);
            self.body.append_u32(creation_ts);
            self.body.append_u32(TIME_UNITS_PER_SEC as u32);
            self.body.append_u32(self.duration_90k);
            self.body.append_u32(0x55c40000); // language=und + pre_defined
        });
    }

    /// Appends a `MediaInformationBox` (ISO/IEC 14496-12 section 8.4.4)
    /// suitable for video.
    fn append_video_minf(&mut self) {
        write_length!(self, {
            self.body.append_static(StaticBytestring::VideoMinfJunk);
            self.append_video_stbl();
        });
    }

    /// Appends a `MediaInformationBox` (ISO/IEC 14496-12 section 8.4.4)
    /// suitable for subtitles.
    fn append_subtitle_minf(&mut self) {
        write_length!(self, {
            self.body.append_static(StaticBytestring::SubtitleMinfJunk);
            self.append_subtitle_stbl();
        });
    }

    /// Appends a `SampleTableBox` (ISO/IEC 14496-12 section 8.5.1) suitable
    /// for video.
    fn append_video_stbl(&mut self) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"stbl");
            self.append_video_stsd();
            self.append_video_stts();
            self.append_video_stsc();
            self.append_video_stsz();
            self.append_video_co64();
            self.append_video_stss();
        });
    }

    /// Appends a `SampleTableBox` (ISO/IEC 14496-12 section 8.5.1) suitable
    /// for subtitles.
    fn append_subtitle_stbl(&mut self) {
        write_length!(self, {
            self.body.append_static(StaticBytestring::SubtitleStblJunk);
            self.append_subtitle_stts();
            self.append_subtitle_stsc();
            self.append_subtitle_stsz();
            self.append_subtitle_co64();
        });
    }

    /// Appends a `SampleDescriptionBox` (ISO/IEC 14496-12 section 8.5.2)
    /// suitable for video.
    fn append_video_stsd(&mut self) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"stsd\x00\x00\x00\x00");
            self.body.append_u32(1); // entry_count
            self.body.flush_buf();
            let len = self
                .video_sample_entry
                .as_ref()
                .expect("append sets the entry")
                .data
                .len() as u64;
            self.body.slices.append(len, Mp4FileSlice::VideoSampleEntry);
        });
    }

    /// Appends a `TimeToSampleBox` (ISO/IEC 14496-12 section 8.6.1.2) for
    /// video: one run of length 1 per sample, durations drawn from each
    /// segment's index.
    fn append_video_stts(&mut self) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"stts\x00\x00\x00\x00");
            let mut entry_count = 0;
            for s in &self.segments {
                entry_count += s.s.frames as u32;
            }
            self.body.append_u32(entry_count);
            self.body.flush_buf();
            for (i, s) in self.segments.iter().enumerate() {
                self.body.slices.append(
                    2 * (mem::size_of::<u32>() as u64) * (s.s.frames as u64),
                    Mp4FileSlice::Stts(i as u32),
                );
            }
        });
    }

    /// Appends a `TimeToSampleBox` (ISO/IEC 14496-12 section 8.6.1.2) for
    /// subtitles: one sample per wall-clock second covered by the movie,
    /// with the first and last clipped to the movie's boundaries.
    fn append_subtitle_stts(&mut self) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"stts\x00\x00\x00\x00");

            let entry_count_pos = self.body.buf.len();
            self.body.append_u32(0); // placeholder for entry_count

            let mut entry_count = 0;
            for s in &self.segments {
                let r = &s.s.desired_range_90k;
                let start = s.s.start + recording::Duration(i64::from(r.start));
                let end = s.s.start + recording::Duration(i64::from(r.end));
                let start_next_sec = recording::Time(
                    start.0 + TIME_UNITS_PER_SEC - (start.0 % TIME_UNITS_PER_SEC),
                );
                if end <= start_next_sec {
                    // Segment doesn't last past the next second.
                    entry_count += 1;
                    self.body.append_u32(1); // count
                    self.body.append_u32((end - start).0 as u32); // duration
                } else {
                    // The first subtitle lasts until the next second.
                    entry_count += 1;
                    self.body.append_u32(1); // count
                    self.body.append_u32((start_next_sec - start).0 as u32); // duration

                    // Then there are zero or more "interior" subtitles, one
                    // second each.
                    let end_prev_sec = recording::Time(end.0 - (end.0 % TIME_UNITS_PER_SEC));
                    if start_next_sec < end_prev_sec {
                        entry_count += 1;
                        let interior = (end_prev_sec - start_next_sec).0 / TIME_UNITS_PER_SEC;
                        self.body.append_u32(interior as u32); // count
                        self.body.append_u32(TIME_UNITS_PER_SEC as u32); // duration
                    }

                    // Then there's a final subtitle for the remaining
                    // fraction of a second.
                    if end_prev_sec < end {
                        entry_count += 1;
                        self.body.append_u32(1); // count
                        self.body.append_u32((end - end_prev_sec).0 as u32); // duration
                    }
                }
            }
            BigEndian::write_u32(
                &mut self.body.buf[entry_count_pos..entry_count_pos + 4],
                entry_count,
            );
        });
    }

    /// Appends a `SampleToChunkBox` (ISO/IEC 14496-12 section 8.7.4) for
    /// video: one chunk per segment.
    fn append_video_stsc(&mut self) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"stsc\x00\x00\x00\x00");
            self.body.append_u32(self.segments.len() as u32);
            for (i, s) in self.segments.iter().enumerate() {
                self.body.append_u32((i + 1) as u32); // first_chunk
                self.body.append_u32(s.s.frames as u32); // samples_per_chunk
                self.body.append_u32(1); // sample_description_index
            }
        });
    }

    /// Appends a `SampleToChunkBox` (ISO/IEC 14496-12 section 8.7.4) for
    /// subtitles: all samples in one chunk.
    fn append_subtitle_stsc(&mut self) {
        write_length!(self, {
            self.body
                .buf
                .extend_from_slice(b"stsc\x00\x00\x00\x00\x00\x00\x00\x01\x00\x00\x00\x01");
            self.body.append_u32(self.num_subtitle_samples);
            self.body.append_u32(1);
        });
    }

    /// Appends a `SampleSizeBox` (ISO/IEC 14496-12 section 8.7.3) for video.
    fn append_video_stsz(&mut self) {
        write_length!(self, {
            self.body
                .buf
                .extend_from_slice(b"stsz\x00\x00\x00\x00\x00\x00\x00\x00");
            let mut entry_count = 0;
            for s in &self.segments {
                entry_count += s.s.frames as u32;
            }
            self.body.append_u32(entry_count);
            self.body.flush_buf();
            for (i, s) in self.segments.iter().enumerate() {
                self.body.slices.append(
                    (mem::size_of::<u32>()) as u64 * (s.s.frames as u64),
                    Mp4FileSlice::Stsz(i as u32),
                );
            }
        });
    }

    /// Appends a `SampleSizeBox` (ISO/IEC 14496-12 section 8.7.3) for
    /// subtitles: fixed-size samples.
    fn append_subtitle_stsz(&mut self) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"stsz\x00\x00\x00\x00");
            self.body
                .append_u32((mem::size_of::<u16>() + SUBTITLE_LENGTH) as u32);
            self.body.append_u32(self.num_subtitle_samples);
        });
    }

    /// Appends a `ChunkLargeOffsetBox` (ISO/IEC 14496-12 section 8.7.5) for
    /// video: one 64-bit entry per segment.
    fn append_video_co64(&mut self) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"co64\x00\x00\x00\x00");
            self.body.append_u32(self.segments.len() as u32);
            self.body.flush_buf();
            self.body.slices.append(
                (mem::size_of::<u64>()) as u64 * (self.segments.len() as u64),
                Mp4FileSlice::Co64,
            );
        });
    }

    /// Appends a `ChunkLargeOffsetBox` (ISO/IEC 14496-12 section 8.7.5) for
    /// subtitles: a single chunk whose position isn't known until the mdat
    /// is laid out, so a placeholder is backpatched in `build`.
    fn append_subtitle_co64(&mut self) {
        write_length!(self, {
            self.body.buf.extend_from_slice(
                b"co64\x00\x00\x00\x00\x00\x00\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00",
            );
            self.subtitle_co64_pos = Some(self.body.buf.len() - 8);
        });
    }

    /// Appends a `SyncSampleBox` (ISO/IEC 14496-12 section 8.6.2) for video.
    fn append_video_stss(&mut self) {
        write_length!(self, {
            self.body.buf.extend_from_slice(b"stss\x00\x00\x00\x00");
            let mut entry_count = 0;
            for s in &self.segments {
                entry_count += s.s.key_frames as u32;
            }
            self.body.append_u32(entry_count);
            self.body.flush_buf();
            for (i, s) in self.segments.iter().enumerate() {
                self.body.slices.append(
                    (mem::size_of::<u32>() as u64) * (s.s.key_frames as u64),
                    Mp4FileSlice::Stss(i as u32),
                );
            }
        });
    }
}

impl BodyState {
    fn append_u32(&mut self, v: u32) {
        self.buf
            .write_u32::<BigEndian>(v)
            .expect("Vec write shouldn't fail");
    }

    fn append_u64(&mut self, v: u64) {
        self.buf
            .write_u64::<BigEndian>(v)
            .expect("Vec write shouldn't fail");
    }

    /// Flushes any unflushed portion of `buf` to `slices` so that a
    /// non-buffer slice can be appended in order.
    fn flush_buf(&mut self) {
        let len = self.buf.len();
        if self.unflushed_buf_pos < len {
            self.slices.append(
                (len - self.unflushed_buf_pos) as u64,
                Mp4FileSlice::Buf(self.unflushed_buf_pos as u32),
            );
            self.unflushed_buf_pos = len;
        }
    }

    fn append_static(&mut self, which: StaticBytestring) {
        self.flush_buf();
        let s = STATIC_BYTESTRINGS[which as usize];
        self.slices.append(s.len() as u64, Mp4FileSlice::Static(which));
    }
}

pub struct Mp4File {
    db: Arc<db::Database>,
    dir: Arc<dir::SampleFileDir>,
    segments: Vec<Mp4Segment>,
    slices: Slices<Mp4FileSlice, Mp4File>,
    buf: Vec<u8>,
    video_sample_entry: Arc<VideoSampleEntry>,
    initial_sample_byte_pos: u64,
    last_modified: time::Timespec,
    etag: String,
}

impl Mp4File {
    fn write_stts(&self, i: usize, r: Range<u64>, _l: u64, out: &mut Vec<u8>) -> Result<(), Error> {
        self.segments[i].with_index(&self.db, |idx| {
            out.extend_from_slice(&idx.stts()[r.start as usize..r.end as usize]);
            Ok(())
        })
    }

    fn write_stsz(&self, i: usize, r: Range<u64>, _l: u64, out: &mut Vec<u8>) -> Result<(), Error> {
        self.segments[i].with_index(&self.db, |idx| {
            out.extend_from_slice(&idx.stsz()[r.start as usize..r.end as usize]);
            Ok(())
        })
    }

    fn write_stss(&self, i: usize, r: Range<u64>, _l: u64, out: &mut Vec<u8>) -> Result<(), Error> {
        self.segments[i].with_index(&self.db, |idx| {
            out.extend_from_slice(&idx.stss()[r.start as usize..r.end as usize]);
            Ok(())
        })
    }

    fn write_co64(&self, r: Range<u64>, l: u64, out: &mut Vec<u8>) -> Result<(), Error> {
        clip_to_range(r, l, out, |buf| {
            let mut pos = self.initial_sample_byte_pos;
            for s in &self.segments {
                buf.write_u64::<BigEndian>(pos).err_kind(ErrorKind::Internal)?;
                let r = s.s.sample_file_range();
                pos += r.end - r.start;
            }
            Ok(())
        })
    }

    fn write_video_sample_data(&self, i: usize, r: Range<u64>, out: &mut Vec<u8>) -> Result<(), Error> {
        let s = &self.segments[i];
        let uuid = self
            .db
            .lock()
            .with_recording_playback(s.s.recording_id, |p| Ok(p.sample_file_uuid))?;
        let f = self.dir.open_sample_file(uuid).err_kind(ErrorKind::Internal)?;
        mmapfile::MmapFileSlice::new(f, s.s.sample_file_range()).write_to(r, out)
    }

    fn write_subtitle_sample_data(
        &self,
        i: usize,
        r: Range<u64>,
        l: u64,
        out: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let s = &self.segments[i];
        let d = &s.s.desired_range_90k;
        let start_sec = (s.s.start + recording::Duration(i64::from(d.start))).unix_seconds();
        let end_sec =
            (s.s.start + recording::Duration(i64::from(d.end) + TIME_UNITS_PER_SEC - 1)).unix_seconds();
        clip_to_range(r, l, out, |buf| {
            for ts in start_sec..end_sec {
                buf.write_u16::<BigEndian>(SUBTITLE_LENGTH as u16)
                    .err_kind(ErrorKind::Internal)?;
                let tm = time::at(time::Timespec { sec: ts, nsec: 0 });
                let entry = tm.strftime(SUBTITLE_TEMPLATE).err_kind(ErrorKind::Internal)?;
                write!(buf, "{entry}").err_kind(ErrorKind::Internal)?;
            }
            Ok(())
        })
    }
}

impl resource::Entity for Mp4File {
    fn len(&self) -> u64 {
        self.slices.len()
    }

    fn add_range(&self, range: Range<u64>, out: &mut Vec<u8>) -> Result<u64, Error> {
        self.slices.write_range(self, range, out)
    }

    fn etag(&self) -> Option<&str> {
        Some(&self.etag)
    }

    fn last_modified(&self) -> Option<time::Timespec> {
        Some(self.last_modified)
    }

    fn content_type(&self) -> &'static str {
        "video/mp4"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264;
    use crate::resource::Entity;
    use byteorder::ReadBytesExt;
    use db::recording::{Duration, Time};
    use db::testutil::{self, TestDb, TEST_CAMERA_ID};
    use std::io::Cursor;

    const START_TIME: Time = Time(1430006400i64 * TIME_UNITS_PER_SEC);

    /// Writes a sample file containing the given (duration, bytes, is_key)
    /// samples and inserts a matching recording row, using a real `avc1`
    /// sample entry so the result is parseable by other tools.
    fn add_recording(
        tdb: &TestDb,
        start: Time,
        samples: &[(i32, usize, bool)],
    ) -> (db::ListRecordingsRow, Vec<Vec<u8>>) {
        let uuid = {
            let mut l = tdb.db.lock();
            let mut tx = l.tx().unwrap();
            let u = tx.reserve_sample_file().unwrap();
            tx.commit().unwrap();
            u
        };
        let mut payloads = Vec::new();
        let mut w = tdb.dir.create_writer(uuid).unwrap();
        let mut e = recording::SampleIndexEncoder::new();
        for (i, &(duration, bytes, is_key)) in samples.iter().enumerate() {
            let payload: Vec<u8> = (0..bytes).map(|j| ((i * 31 + j) % 251) as u8).collect();
            w.write(&payload).unwrap();
            e.add_sample(duration, bytes as i32, is_key);
            payloads.push(payload);
        }
        let (sha1, _len) = w.close().unwrap();
        tdb.dir.sync().unwrap();

        let extra = h264::ExtraData::parse(
            &h264::testdata::AVC_DECODER_CONFIG_TEST_INPUT,
            1280,
            720,
        )
        .unwrap();
        let mut l = tdb.db.lock();
        let vse_id = l
            .insert_video_sample_entry(extra.width, extra.height, extra.sample_entry, extra.rfc6381_codec)
            .unwrap();
        let mut tx = l.tx().unwrap();
        let id = tx
            .insert_recording(&db::RecordingToInsert {
                camera_id: TEST_CAMERA_ID,
                sample_file_bytes: e.sample_file_bytes,
                time: start..start + Duration(i64::from(e.total_duration_90k)),
                local_time_delta: Duration(0),
                video_samples: e.video_samples,
                video_sync_samples: e.video_sync_samples,
                video_sample_entry_id: vse_id,
                sample_file_uuid: uuid,
                video_index: e.video_index,
                sample_file_sha1: sha1,
            })
            .unwrap();
        tx.commit().unwrap();
        drop(l);

        let mut row = None;
        let all_time = Time(i64::min_value())..Time(i64::max_value());
        tdb.db
            .lock()
            .list_recordings(TEST_CAMERA_ID, &all_time, |r| {
                if r.id == id {
                    row = Some(r);
                }
                Ok(())
            })
            .unwrap();
        (row.unwrap(), payloads)
    }

    /// Drives `add_range` like the serving loop does, collecting the whole
    /// file and verifying that exactly `len()` bytes are produced.
    fn file_bytes(f: &Mp4File) -> Vec<u8> {
        let len = f.len();
        let mut out = Vec::with_capacity(len as usize);
        let mut pos = 0;
        while pos < len {
            let added = f.add_range(pos..len, &mut out).unwrap();
            assert!(added > 0);
            pos += added;
        }
        assert_eq!(len, out.len() as u64);
        out
    }

    fn build_mp4(
        tdb: &TestDb,
        rows: &[(db::ListRecordingsRow, Range<i32>)],
        include_subtitles: bool,
    ) -> Mp4File {
        let mut builder = Mp4FileBuilder::new();
        builder.include_timestamp_subtitle_track(include_subtitles);
        {
            let l = tdb.db.lock();
            for (row, range) in rows {
                builder.append(&l, row.clone(), range.clone()).unwrap();
            }
        }
        builder.build(tdb.db.clone(), tdb.dir.clone()).unwrap()
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    /// Builds a single-segment file covering a whole recording and re-demuxes
    /// it, comparing the samples against the originals.
    #[test]
    fn test_round_trip() {
        testutil::init();
        let tdb = TestDb::new();
        let samples: &[(i32, usize, bool)] = &[
            (90000, 1000, true),
            (90000, 60, false),
            (90000, 70, false),
            (90000, 1050, true),
            (90000, 64, false),
            (90000, 57, false),
        ];
        let (row, payloads) = add_recording(&tdb, START_TIME, samples);
        let duration = row.duration_90k;
        let f = build_mp4(&tdb, &[(row, 0..duration)], false);
        let bytes = file_bytes(&f);

        let len = bytes.len() as u64;
        let reader = mp4::Mp4Reader::read_header(Cursor::new(bytes), len).unwrap();
        assert_eq!(u64::from(6 * 90000u32), reader.moov.mvhd.duration);
        assert_eq!(1, reader.tracks().len());
        let track = reader.tracks().values().next().unwrap();
        let track_id = track.track_id();
        assert_eq!(6, reader.sample_count(track_id).unwrap());

        let mut reader = reader;
        for i in 0..6 {
            let sample = reader.read_sample(track_id, i + 1).unwrap().unwrap();
            assert_eq!(&payloads[i as usize][..], &sample.bytes[..], "sample {i}");
            assert_eq!(90000, sample.duration, "sample {i}");
            assert_eq!(samples[i as usize].2, sample.is_sync, "sample {i}");
        }
    }

    /// Etags and bytes must be stable across a database close and re-open,
    /// so that a client resuming a download doesn't splice together
    /// mismatched bytes.
    #[test]
    fn test_etag_stability_under_reopen() {
        testutil::init();
        let tdb = TestDb::new();
        let samples: &[(i32, usize, bool)] = &[(90000, 500, true), (90000, 30, false), (90000, 25, false)];
        let (row, _) = add_recording(&tdb, START_TIME, samples);
        let duration = row.duration_90k;

        let f1 = build_mp4(&tdb, &[(row.clone(), 0..duration)], false);
        let etag1 = f1.etag().unwrap().to_owned();
        let bytes1 = file_bytes(&f1);
        drop(f1);

        // Re-open the database and build the same file again.
        let TestDb { db, dir, tmpdir } = tdb;
        let conn = Arc::try_unwrap(db).map_err(|_| ()).unwrap().close();
        let db = Arc::new(db::Database::new(conn).unwrap());
        let mut row2 = None;
        let all_time = Time(i64::min_value())..Time(i64::max_value());
        db.lock()
            .list_recordings(TEST_CAMERA_ID, &all_time, |r| {
                row2 = Some(r);
                Ok(())
            })
            .unwrap();
        let row2 = row2.unwrap();
        let mut builder = Mp4FileBuilder::new();
        builder
            .append(&db.lock(), row2.clone(), 0..duration)
            .unwrap();
        let f2 = builder.build(db.clone(), dir.clone()).unwrap();
        assert_eq!(etag1, f2.etag().unwrap());
        assert_eq!(bytes1, file_bytes(&f2));

        // A different time range or subtitle flag must produce a different
        // etag.
        let mut builder = Mp4FileBuilder::new();
        builder.append(&db.lock(), row2.clone(), 0..duration - 1).unwrap();
        let f3 = builder.build(db.clone(), dir.clone()).unwrap();
        assert_ne!(etag1, f3.etag().unwrap());

        let mut builder = Mp4FileBuilder::new();
        builder.include_timestamp_subtitle_track(true);
        builder.append(&db.lock(), row2, 0..duration).unwrap();
        let f4 = builder.build(db, dir).unwrap();
        assert_ne!(etag1, f4.etag().unwrap());
        drop(tmpdir);
    }

    /// Two trimmed segments produce an edit list with media times past each
    /// segment's in-recording skip; a single whole-recording segment
    /// produces none.
    #[test]
    fn test_edit_list() {
        testutil::init();
        let tdb = TestDb::new();
        // Ten 1-second samples; key frames at 0s and 5s.
        let samples: Vec<(i32, usize, bool)> = (0..10)
            .map(|i| (90000, 100 + i, i % 5 == 0))
            .collect();
        let (row, _) = add_recording(&tdb, START_TIME, &samples);

        let sec = TIME_UNITS_PER_SEC as i32;
        let f = build_mp4(
            &tdb,
            &[(row.clone(), 2 * sec..5 * sec), (row.clone(), 7 * sec..9 * sec)],
            false,
        );
        let bytes = file_bytes(&f);
        let mdat_pos = find(&bytes, b"mdat").unwrap();
        let elst_pos = find(&bytes[..mdat_pos], b"elst").unwrap();
        let mut r = Cursor::new(&bytes[elst_pos + 4..]);
        assert_eq!(0x0100_0000, r.read_u32::<BigEndian>().unwrap()); // version 1
        assert_eq!(2, r.read_u32::<BigEndian>().unwrap()); // entry_count
        assert_eq!(u64::from(3 * 90000u32), r.read_u64::<BigEndian>().unwrap());
        assert_eq!(u64::from(2 * 90000u32), r.read_u64::<BigEndian>().unwrap());
        assert_eq!(0x0001_0000, r.read_u32::<BigEndian>().unwrap()); // rate 1.0
        assert_eq!(u64::from(2 * 90000u32), r.read_u64::<BigEndian>().unwrap());
        assert_eq!(u64::from(7 * 90000u32), r.read_u64::<BigEndian>().unwrap());

        // A whole-recording segment has no skip and thus no edit list.
        let f = build_mp4(&tdb, &[(row.clone(), 0..row.duration_90k)], false);
        let bytes = file_bytes(&f);
        let mdat_pos = find(&bytes, b"mdat").unwrap();
        assert_eq!(None, find(&bytes[..mdat_pos], b"elst"));
    }

    /// The sync-sample table numbers samples across segments, not per
    /// segment.
    #[test]
    fn test_stss_numbering_across_segments() {
        testutil::init();
        let tdb = TestDb::new();
        let samples: Vec<(i32, usize, bool)> = (0..10)
            .map(|i| (90000, 100 + i, i % 5 == 0))
            .collect();
        let (row, _) = add_recording(&tdb, START_TIME, &samples);

        let sec = TIME_UNITS_PER_SEC as i32;
        // Segment 1: starts at the key frame at 0s, covers samples 0..5.
        // Segment 2: starts at the key frame at 5s, covers samples 5..9.
        let f = build_mp4(
            &tdb,
            &[(row.clone(), 2 * sec..5 * sec), (row, 7 * sec..9 * sec)],
            false,
        );
        let bytes = file_bytes(&f);
        let mdat_pos = find(&bytes, b"mdat").unwrap();
        let stss_pos = find(&bytes[..mdat_pos], b"stss").unwrap();
        let mut r = Cursor::new(&bytes[stss_pos + 4..]);
        assert_eq!(0, r.read_u32::<BigEndian>().unwrap()); // version + flags
        assert_eq!(2, r.read_u32::<BigEndian>().unwrap()); // entry_count
        assert_eq!(1, r.read_u32::<BigEndian>().unwrap()); // segment 1's key
        assert_eq!(6, r.read_u32::<BigEndian>().unwrap()); // segment 2's key
    }

    /// Subtitle tracks add one sample per wall-clock second, with the fixed
    /// 27-byte sample size and timestamps rendered in the local zone.
    #[test]
    fn test_subtitles() {
        testutil::init();
        let tdb = TestDb::new();
        let samples: &[(i32, usize, bool)] = &[(90000, 200, true), (90000, 30, false), (90000, 40, false)];
        let (row, payloads) = add_recording(&tdb, START_TIME, samples);
        let duration = row.duration_90k;
        let f = build_mp4(&tdb, &[(row, 0..duration)], true);
        let bytes = file_bytes(&f);

        let mdat_pos = find(&bytes, b"mdat").unwrap();
        assert!(find(&bytes[..mdat_pos], b"tx3g").is_some());
        assert!(find(&bytes[..mdat_pos], b"sbtl").is_some());

        // The subtitle payload follows the video sample data at the end of
        // the file: three samples, each a u16 length plus 25 bytes.
        let video_bytes: usize = payloads.iter().map(|p| p.len()).sum();
        let subtitle_bytes = 3 * (2 + SUBTITLE_LENGTH);
        assert_eq!(bytes.len(), mdat_pos + 4 + 8 + video_bytes + subtitle_bytes);
        let mut pos = bytes.len() - subtitle_bytes;
        for i in 0..3 {
            let len = BigEndian::read_u16(&bytes[pos..pos + 2]);
            assert_eq!(SUBTITLE_LENGTH as u16, len);
            pos += 2;
            let tm = time::at(time::Timespec {
                sec: START_TIME.unix_seconds() + i,
                nsec: 0,
            });
            let expected = tm.strftime(SUBTITLE_TEMPLATE).unwrap().to_string();
            assert_eq!(
                expected.as_bytes(),
                &bytes[pos..pos + SUBTITLE_LENGTH],
                "subtitle {i}"
            );
            pos += SUBTITLE_LENGTH;
        }
    }

    /// Serving a virtual file in small ranges yields the same bytes as one
    /// big read.
    #[test]
    fn test_random_access_consistency() {
        testutil::init();
        let tdb = TestDb::new();
        let samples: &[(i32, usize, bool)] = &[(90000, 500, true), (90000, 30, false)];
        let (row, _) = add_recording(&tdb, START_TIME, samples);
        let duration = row.duration_90k;
        let f = build_mp4(&tdb, &[(row, 0..duration)], false);
        let whole = file_bytes(&f);

        for &(start, end) in &[(0u64, 10u64), (3, 100), (500, 600)] {
            let end = cmp::min(end, whole.len() as u64);
            let mut out = Vec::new();
            let mut pos = start;
            while pos < end {
                let added = f.add_range(pos..end, &mut out).unwrap();
                assert!(added > 0);
                pos += added;
            }
            assert_eq!(&whole[start as usize..end as usize], &out[..]);
        }
    }

    /// The mdat's contents must line up with co64: the first chunk offset
    /// points just past the mdat header.
    #[test]
    fn test_co64_offsets() {
        testutil::init();
        let tdb = TestDb::new();
        let (row1, payloads1) = add_recording(&tdb, START_TIME, &[(90000, 110, true), (90000, 20, false)]);
        let (row2, _) = add_recording(
            &tdb,
            START_TIME + Duration(2 * TIME_UNITS_PER_SEC),
            &[(90000, 120, true), (90000, 21, false)],
        );
        let d1 = row1.duration_90k;
        let d2 = row2.duration_90k;
        let f = build_mp4(&tdb, &[(row1, 0..d1), (row2, 0..d2)], false);
        let bytes = file_bytes(&f);

        let mdat_pos = find(&bytes, b"mdat").unwrap();
        let co64_pos = find(&bytes[..mdat_pos], b"co64").unwrap();
        let mut r = Cursor::new(&bytes[co64_pos + 4..]);
        assert_eq!(0, r.read_u32::<BigEndian>().unwrap()); // version + flags
        assert_eq!(2, r.read_u32::<BigEndian>().unwrap()); // entry_count
        let chunk1 = r.read_u64::<BigEndian>().unwrap();
        let chunk2 = r.read_u64::<BigEndian>().unwrap();
        assert_eq!(chunk1, (mdat_pos + 4 + 8) as u64);
        let seg1_bytes: usize = payloads1.iter().map(|p| p.len()).sum();
        assert_eq!(chunk2, chunk1 + seg1_bytes as u64);
    }
}
