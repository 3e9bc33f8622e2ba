// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Sample index encoding/decoding and in-recording segments.
//!
//! Each recording row carries a `video_index` blob describing every sample in
//! its flat sample file: duration, byte length, and whether it's a sync
//! (key) sample. The index is a delta+zigzag+varint encoding designed to be
//! compact on disk yet cheap to scan forward when assembling `.mp4` files.

use base::{bail_t, Error};
use crate::coding::{append_varint32, decode_varint32, unzigzag32, zigzag32, DecodeError};
use crate::db;
use std::ops::Range;
use tracing::trace;

pub use base::time::{Duration, Time, TIME_UNITS_PER_SEC};

/// The desired duration of a recording before rotating to a new file.
pub const DESIRED_RECORDING_DURATION: i64 = 60 * TIME_UNITS_PER_SEC;

/// An upper bound on a single recording's duration. Queries over a time range
/// rely on this to use the `(camera_id, start_time_90k)` index: a recording
/// overlapping `[start, end)` must itself start within
/// `[start - MAX_RECORDING_DURATION, end)`.
pub const MAX_RECORDING_DURATION: i64 = 5 * 60 * TIME_UNITS_PER_SEC;

/// A forward cursor over an encoded sample index.
/// Initially invalid; call `next()` before each read.
#[derive(Clone, Copy, Debug)]
pub struct SampleIndexIterator {
    /// The index byte position of the next sample to read (low 31 bits) and
    /// whether the current sample is a key frame (high bit).
    i_and_is_key: u32,

    /// The starting byte position of this sample within the sample file.
    pub pos: i32,

    /// The starting time of this sample within the recording (90 kHz units).
    pub start_90k: i32,

    /// The duration of this sample (90 kHz units).
    pub duration_90k: i32,

    /// The byte length of this sample.
    pub bytes: i32,

    /// The byte length of the most recent sample of the "other" kind: if this
    /// one is key, the last non-key; if this one is non-key, the last key.
    /// Byte deltas are tracked separately per kind because the two cluster
    /// around very different sizes.
    bytes_other: i32,
}

impl SampleIndexIterator {
    pub fn new() -> Self {
        SampleIndexIterator {
            i_and_is_key: 0,
            pos: 0,
            start_90k: 0,
            duration_90k: 0,
            bytes: 0,
            bytes_other: 0,
        }
    }

    /// Advances to the next sample, returning false at the end of the index.
    pub fn next(&mut self, data: &[u8]) -> Result<bool, Error> {
        self.pos += self.bytes;
        self.start_90k += self.duration_90k;
        let i = (self.i_and_is_key & 0x7FFF_FFFF) as usize;
        if i == data.len() {
            return Ok(false);
        }
        let (raw1, i1) = match decode_varint32(data, i) {
            Ok(tuple) => tuple,
            Err(DecodeError::BufferUnderrun) => {
                bail_t!(DataLoss, "buffer underrun in varint 1 at offset {}", i)
            }
            Err(DecodeError::IntegerOverflow) => {
                bail_t!(DataLoss, "integer overflow in varint 1 at offset {}", i)
            }
        };
        let (raw2, i2) = match decode_varint32(data, i1) {
            Ok(tuple) => tuple,
            Err(DecodeError::BufferUnderrun) => {
                bail_t!(DataLoss, "buffer underrun in varint 2 at offset {}", i1)
            }
            Err(DecodeError::IntegerOverflow) => {
                bail_t!(DataLoss, "integer overflow in varint 2 at offset {}", i1)
            }
        };
        let duration_90k_delta = unzigzag32(raw1 >> 1);
        self.duration_90k += duration_90k_delta;
        if self.duration_90k < 0 {
            bail_t!(
                DataLoss,
                "negative duration {} after applying delta {}",
                self.duration_90k,
                duration_90k_delta
            );
        }
        if self.duration_90k == 0 && data.len() > i2 {
            bail_t!(
                DataLoss,
                "zero duration only allowed at end; have {} bytes left",
                data.len() - i2
            );
        }
        let (prev_bytes_key, prev_bytes_nonkey) = match self.is_key() {
            true => (self.bytes, self.bytes_other),
            false => (self.bytes_other, self.bytes),
        };
        self.i_and_is_key = (i2 as u32) | ((raw1 & 1) << 31);
        let bytes_delta = unzigzag32(raw2);
        if self.is_key() {
            self.bytes = prev_bytes_key + bytes_delta;
            self.bytes_other = prev_bytes_nonkey;
        } else {
            self.bytes = prev_bytes_nonkey + bytes_delta;
            self.bytes_other = prev_bytes_key;
        }
        if self.bytes <= 0 {
            bail_t!(
                DataLoss,
                "non-positive bytes {} after applying delta {} to key={} frame at ts {}",
                self.bytes,
                bytes_delta,
                self.is_key(),
                self.start_90k
            );
        }
        Ok(true)
    }

    pub fn uninitialized(&self) -> bool {
        self.i_and_is_key == 0
    }

    pub fn is_key(&self) -> bool {
        (self.i_and_is_key & 0x8000_0000) != 0
    }

    pub fn end_90k(&self) -> i32 {
        self.start_90k + self.duration_90k
    }
}

/// Encodes a sample index, accumulating the aggregates that eventually land
/// in the recording row.
#[derive(Debug, Default)]
pub struct SampleIndexEncoder {
    prev_duration_90k: i32,
    prev_bytes_key: i32,
    prev_bytes_nonkey: i32,

    pub sample_file_bytes: i32,
    pub total_duration_90k: i32,
    pub video_samples: i32,
    pub video_sync_samples: i32,
    pub video_index: Vec<u8>,
}

impl SampleIndexEncoder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_sample(&mut self, duration_90k: i32, bytes: i32, is_key: bool) {
        let duration_delta = duration_90k - self.prev_duration_90k;
        self.prev_duration_90k = duration_90k;
        self.total_duration_90k += duration_90k;
        self.sample_file_bytes += bytes;
        self.video_samples += 1;
        let bytes_delta = bytes
            - if is_key {
                let prev = self.prev_bytes_key;
                self.video_sync_samples += 1;
                self.prev_bytes_key = bytes;
                prev
            } else {
                let prev = self.prev_bytes_nonkey;
                self.prev_bytes_nonkey = bytes;
                prev
            };
        append_varint32((zigzag32(duration_delta) << 1) | (is_key as u32), &mut self.video_index);
        append_varint32(zigzag32(bytes_delta), &mut self.video_index);
    }

    /// True if the most recent sample has unknown (zero) duration, as when
    /// a recording is closed without knowing the following sample's pts.
    pub fn has_trailing_zero(&self) -> bool {
        self.prev_duration_90k == 0
    }
}

/// A view of some or all of a single recording, starting from a key frame.
/// Used by the `.mp4` builder to splice recordings into one virtual file.
pub struct Segment {
    pub camera_id: i32,
    pub recording_id: i64,
    pub start: Time,

    /// An iterator positioned at the segment's first sample, or
    /// uninitialized (at the recording's start) if the whole recording is
    /// wanted.
    begin: SampleIndexIterator,

    pub file_end: i32,
    pub desired_range_90k: Range<i32>,
    actual_end_90k: i32,
    pub frames: i32,
    pub key_frames: i32,
    pub video_sample_entry_id: i32,
}

impl Segment {
    /// Creates a segment.
    ///
    /// `desired_range_90k` is the desired range of the segment relative to
    /// the start of the recording. The actual range will start at the first
    /// key frame at or before the desired start time. (The caller is
    /// responsible for creating an edit list to skip the undesired portion.)
    /// It will end at the first frame after the desired range (unless the
    /// desired range extends beyond the recording).
    pub fn new(
        db: &db::LockedDatabase,
        recording: &db::ListRecordingsRow,
        desired_range_90k: Range<i32>,
    ) -> Result<Segment, Error> {
        let mut self_ = Segment {
            camera_id: recording.camera_id,
            recording_id: recording.id,
            start: recording.start,
            begin: SampleIndexIterator::new(),
            file_end: recording.sample_file_bytes,
            desired_range_90k,
            actual_end_90k: recording.duration_90k,
            frames: recording.video_samples,
            key_frames: recording.video_sync_samples,
            video_sample_entry_id: recording.video_sample_entry.id,
        };

        if self_.desired_range_90k.start > self_.desired_range_90k.end
            || self_.desired_range_90k.end > self_.actual_end_90k
        {
            bail_t!(
                OutOfRange,
                "desired range [{}, {}) invalid for recording of length {}",
                self_.desired_range_90k.start,
                self_.desired_range_90k.end,
                self_.actual_end_90k
            );
        }

        if self_.desired_range_90k.start == 0 && self_.desired_range_90k.end == self_.actual_end_90k
        {
            // Fast path. The whole recording is wanted, so the recording
            // row's aggregates already describe the segment.
            return Ok(self_);
        }

        // Slow path. Scan the index for the included range.
        db.with_recording_playback(self_.recording_id, |playback| {
            let data = &playback.video_index;
            let mut it = SampleIndexIterator::new();
            if !it.next(data)? {
                bail_t!(DataLoss, "recording {}/{}: no index", self_.camera_id, self_.recording_id);
            }
            if !it.is_key() {
                bail_t!(
                    DataLoss,
                    "recording {}/{}: doesn't start with key frame",
                    self_.camera_id,
                    self_.recording_id
                );
            }

            // Stop when hitting a frame with the desired end start time.
            // Going until the end of the recording is special-cased because
            // there can be a trailing frame of zero duration, which should be
            // included no matter which form the request takes.
            let end_90k = if self_.desired_range_90k.end == self_.actual_end_90k {
                i32::max_value()
            } else {
                self_.desired_range_90k.end
            };

            loop {
                if it.start_90k <= self_.desired_range_90k.start && it.is_key() {
                    // new start candidate.
                    self_.begin = it;
                    self_.frames = 0;
                    self_.key_frames = 0;
                }
                if it.start_90k >= end_90k {
                    break;
                }
                self_.frames += 1;
                self_.key_frames += it.is_key() as i32;
                if !it.next(data)? {
                    break;
                }
            }
            self_.file_end = it.pos;
            self_.actual_end_90k = it.start_90k;
            Ok(self_)
        })
    }

    /// Returns the byte range within the sample file associated with this
    /// segment.
    pub fn sample_file_range(&self) -> Range<u64> {
        self.begin.pos as u64..self.file_end as u64
    }

    /// Returns the actual time range as described in `new`.
    pub fn actual_time_90k(&self) -> Range<i32> {
        self.begin.start_90k..self.actual_end_90k
    }

    /// Iterates through each sample in the segment.
    /// Must be called without the database lock held; the caller supplies
    /// the playback row.
    pub fn foreach<F>(&self, playback: &db::RecordingPlayback, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&SampleIndexIterator) -> Result<(), Error>,
    {
        trace!(
            "foreach on recording {}/{}: {} frames, actual_time_90k: {:?}",
            self.camera_id,
            self.recording_id,
            self.frames,
            self.actual_time_90k()
        );
        let data = &playback.video_index;
        let mut it = self.begin;
        if it.uninitialized() {
            if !it.next(data)? {
                bail_t!(DataLoss, "recording {}/{}: no frames", self.camera_id, self.recording_id);
            }
            if !it.is_key() {
                bail_t!(
                    DataLoss,
                    "recording {}/{}: doesn't start with key frame",
                    self.camera_id,
                    self.recording_id
                );
            }
        }
        let mut have_frame = true;
        let mut key_frame = 0;
        for i in 0..self.frames {
            if !have_frame {
                bail_t!(
                    DataLoss,
                    "recording {}/{}: expected {} frames, found only {}",
                    self.camera_id,
                    self.recording_id,
                    self.frames,
                    i + 1
                );
            }
            if it.is_key() {
                key_frame += 1;
                if key_frame > self.key_frames {
                    bail_t!(
                        DataLoss,
                        "recording {}/{}: more than expected {} key frames",
                        self.camera_id,
                        self.recording_id,
                        self.key_frames
                    );
                }
            }
            f(&it)?;
            have_frame = it.next(data)?;
        }
        if key_frame < self.key_frames {
            bail_t!(
                DataLoss,
                "recording {}/{}: expected {} key frames, found only {}",
                self.camera_id,
                self.recording_id,
                self.key_frames,
                key_frame
            );
        }
        Ok(())
    }
}
