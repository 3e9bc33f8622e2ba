// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Database access logic for the Kestrel NVR SQLite schema.
//!
//! The SQLite schema includes everything except the actual video samples (see
//! the `dir` module for management of those). See `schema.sql` for a more
//! detailed description.
//!
//! The `Database` struct caches data in RAM, making the assumption that only
//! one process is accessing the database at a time. Performance and efficiency
//! notes:
//!
//!   * several query operations here feature row callbacks. The callback is
//!     invoked with the database lock held, so it shouldn't perform
//!     long-running operations.
//!
//!   * startup may be slow, as it scans the entire index for the recording
//!     table. This seems acceptable.
//!
//!   * the database lock may be held for longer than is acceptable for the
//!     critical path of recording frames. The caller should reserve sample
//!     file uuids and such in advance to avoid database operations in these
//!     paths.
//!
//!   * the `Transaction` interface allows callers to batch write operations
//!     to reduce latency and SSD write cycles.

use base::{bail_t, Error, ErrorKind, ResultExt};
use crate::recording::{Duration, Time, MAX_RECORDING_DURATION, TIME_UNITS_PER_SEC};
use fnv::FnvHashMap;
use lru_cache::LruCache;
use openssl::hash;
use rusqlite::{named_params, params};
use std::cell::RefCell;
use std::cmp;
use std::collections::BTreeMap;
use std::io::Write;
use std::ops::Range;
use std::str;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, trace, warn};
use uuid::Uuid;

const GET_RECORDING_PLAYBACK_SQL: &str = r#"
    select sample_file_uuid, video_index from recording where id = :id
"#;

const DELETE_RESERVATION_SQL: &str = "delete from reserved_sample_files where uuid = :uuid";

const INSERT_RESERVATION_SQL: &str = r#"
    insert into reserved_sample_files (uuid,  state)
                               values (:uuid, :state)
"#;

const INSERT_VIDEO_SAMPLE_ENTRY_SQL: &str = r#"
    insert into video_sample_entry (sha1,  width,  height,  rfc6381_codec, data)
                            values (:sha1, :width, :height, :rfc6381_codec, :data)
"#;

const INSERT_RECORDING_SQL: &str = r#"
    insert into recording (camera_id, sample_file_bytes, start_time_90k,
                           duration_90k, local_time_delta_90k, video_samples,
                           video_sync_samples, video_sample_entry_id,
                           sample_file_uuid, sample_file_sha1, video_index)
                   values (:camera_id, :sample_file_bytes, :start_time_90k,
                           :duration_90k, :local_time_delta_90k,
                           :video_samples, :video_sync_samples,
                           :video_sample_entry_id, :sample_file_uuid,
                           :sample_file_sha1, :video_index)
"#;

const LIST_OLDEST_SAMPLE_FILES_SQL: &str = r#"
    select
      id,
      sample_file_uuid,
      start_time_90k,
      duration_90k,
      sample_file_bytes
    from
      recording
    where
      camera_id = :camera_id
    order by
      start_time_90k
"#;

const DELETE_RECORDING_SQL: &str = "delete from recording where id = :recording_id";

const CAMERA_MIN_START_SQL: &str = r#"
    select
      start_time_90k
    from
      recording
    where
      camera_id = :camera_id
    order by start_time_90k limit 1
"#;

const CAMERA_MAX_START_SQL: &str = r#"
    select
      start_time_90k,
      duration_90k
    from
      recording
    where
      camera_id = :camera_id
    order by start_time_90k desc
"#;

/// Valid values for the `state` column in the `reserved_sample_files` table.
enum ReservationState {
    /// This uuid has not yet been added to the `recording` table. The file
    /// may be unwritten, partially written, or fully written.
    Writing = 0,

    /// This uuid was previously in the `recording` table. The file may be
    /// fully written or unlinked.
    Deleting = 1,
}

/// A concrete box derived from a ISO/IEC 14496-12 section 8.5.2
/// VisualSampleEntry box. Describes the codec, width, height, etc.
#[derive(Debug)]
pub struct VideoSampleEntry {
    pub id: i32,
    pub width: u16,
    pub height: u16,
    pub sha1: [u8; 20],
    pub rfc6381_codec: String,
    pub data: Vec<u8>,
}

/// A row used in `list_recordings` and `list_camera_recordings`.
#[derive(Clone, Debug)]
pub struct ListRecordingsRow {
    pub id: i64,
    pub camera_id: i32,
    pub start: Time,

    /// This is a recording::Duration, but a single recording's duration fits
    /// into an i32.
    pub duration_90k: i32,
    pub sample_file_bytes: i32,
    pub video_samples: i32,
    pub video_sync_samples: i32,
    pub sample_file_sha1: [u8; 20],
    pub video_sample_entry: Arc<VideoSampleEntry>,
}

/// Extra data about a recording, beyond what is returned by
/// `ListRecordingsRow`. Retrieve with `with_recording_playback`.
#[derive(Debug)]
pub struct RecordingPlayback {
    pub sample_file_uuid: Uuid,
    pub video_index: Vec<u8>,
}

/// A recording to pass to `insert_recording`.
#[derive(Clone, Debug)]
pub struct RecordingToInsert {
    pub camera_id: i32,
    pub sample_file_bytes: i32,
    pub time: Range<Time>,

    /// Difference between the local clock at the recording's start and
    /// `time.start` itself.
    pub local_time_delta: Duration,
    pub video_samples: i32,
    pub video_sync_samples: i32,
    pub video_sample_entry_id: i32,
    pub sample_file_uuid: Uuid,
    pub video_index: Vec<u8>,
    pub sample_file_sha1: [u8; 20],
}

/// A row used in `list_oldest_sample_files`.
#[derive(Clone, Debug)]
pub struct ListOldestSampleFilesRow {
    pub uuid: Uuid,
    pub camera_id: i32,
    pub recording_id: i64,
    pub time: Range<Time>,
    pub sample_file_bytes: i32,
}

/// A calendar day in `YYYY-mm-dd` format.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct CameraDayKey([u8; 10]);

impl CameraDayKey {
    fn new(tm: time::Tm) -> Result<Self, Error> {
        let mut s = CameraDayKey([0u8; 10]);
        let day = tm.strftime("%Y-%m-%d").err_kind(ErrorKind::Internal)?;
        write!(&mut s.0[..], "{day}").err_kind(ErrorKind::Internal)?;
        Ok(s)
    }

    /// Returns the bounds of this day in the local time zone.
    pub fn bounds(&self) -> Range<Time> {
        let mut my_tm = time::strptime(self.as_ref(), "%Y-%m-%d").expect("day keys must be parseable");
        // To the time crate, a non-zero tm_utcoff means "local time"; it calls
        // mktime rather than timegm.
        my_tm.tm_utcoff = 1;
        my_tm.tm_isdst = -1;
        let start = Time(my_tm.to_timespec().sec * TIME_UNITS_PER_SEC);
        my_tm.tm_hour = 0;
        my_tm.tm_min = 0;
        my_tm.tm_sec = 0;
        my_tm.tm_mday += 1;
        let end = Time(my_tm.to_timespec().sec * TIME_UNITS_PER_SEC);
        start..end
    }
}

impl AsRef<str> for CameraDayKey {
    fn as_ref(&self) -> &str {
        str::from_utf8(&self.0[..]).expect("days are always UTF-8")
    }
}

/// In-memory state about a particular camera on a particular day.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CameraDayValue {
    /// The number of recordings that overlap with this day. Note that
    /// `adjust_day` automatically prunes days with 0 recordings.
    pub recordings: i64,

    /// The total duration recorded on this day. This can be 0; because
    /// frames' durations are taken from the time of the next frame, a
    /// recording that ends unexpectedly after a single frame will have 0
    /// duration of that frame and thus the whole recording.
    pub duration: Duration,
}

/// In-memory state about a camera.
#[derive(Debug)]
pub struct Camera {
    pub id: i32,
    pub uuid: Uuid,
    pub short_name: String,
    pub description: String,
    pub host: String,
    pub username: String,
    pub password: String,
    pub main_rtsp_path: String,
    pub sub_rtsp_path: String,
    pub retain_bytes: i64,

    /// The time range of recorded data associated with this camera (minimum
    /// start time and maximum end time). `None` iff there are no recordings.
    pub range: Option<Range<Time>>,
    pub sample_file_bytes: i64,

    /// The total duration of recorded data. This may not be
    /// `range.end - range.start` due to gaps and overlap.
    pub duration: Duration,

    /// Mapping of calendar day (in the server's time zone) to a summary of
    /// recordings on that day.
    pub days: BTreeMap<CameraDayKey, CameraDayValue>,
}

/// Adds `delta` to the day represented by `day` in the map `m`.
/// Inserts a map entry if absent; removes the entry if it has 0 entries on
/// exit.
fn adjust_day(
    day: CameraDayKey,
    delta: CameraDayValue,
    m: &mut BTreeMap<CameraDayKey, CameraDayValue>,
) {
    enum Do {
        Insert,
        Remove,
        Nothing,
    }
    let what_to_do = match m.get_mut(&day) {
        None => Do::Insert,
        Some(v) => {
            v.recordings += delta.recordings;
            v.duration += delta.duration;
            if v.recordings == 0 {
                Do::Remove
            } else {
                Do::Nothing
            }
        }
    };
    match what_to_do {
        Do::Insert => {
            m.insert(day, delta);
        }
        Do::Remove => {
            m.remove(&day);
        }
        Do::Nothing => {}
    }
}

/// Adjusts the day map `m` to reflect the range of the given recording.
/// The specified range may span two days. It will never span more because
/// the maximum length of a recording entry is less than a day (even a
/// 23-hour "spring forward" day).
///
/// This function swallows/logs date formatting errors because they shouldn't
/// happen and there's not much that can be done about them. (The database
/// operation has already gone through.)
fn adjust_days(r: Range<Time>, sign: i64, m: &mut BTreeMap<CameraDayKey, CameraDayValue>) {
    // Find the first day key.
    let mut my_tm = time::at(time::Timespec {
        sec: r.start.unix_seconds(),
        nsec: 0,
    });
    let day = match CameraDayKey::new(my_tm) {
        Ok(d) => d,
        Err(ref e) => {
            warn!("Unable to fill first day key from {:?}: {}; will ignore.", my_tm, e);
            return;
        }
    };

    // Determine the start of the next day.
    // Use my_tm to hold a non-normalized representation of the boundary.
    my_tm.tm_isdst = -1;
    my_tm.tm_hour = 0;
    my_tm.tm_min = 0;
    my_tm.tm_sec = 0;
    my_tm.tm_mday += 1;
    let boundary = my_tm.to_timespec();
    let boundary_90k = boundary.sec * TIME_UNITS_PER_SEC;

    // Adjust the first day.
    let first_day_delta = CameraDayValue {
        recordings: sign,
        duration: Duration(sign * (cmp::min(r.end.0, boundary_90k) - r.start.0)),
    };
    adjust_day(day, first_day_delta, m);

    if r.end.0 <= boundary_90k {
        return;
    }

    // Fill in the second day. This requires a normalized representation, so
    // recalculate. (mktime(3) already normalized for us once, but
    // .to_timespec() discarded that result.)
    let my_tm = time::at(boundary);
    let day = match CameraDayKey::new(my_tm) {
        Ok(d) => d,
        Err(ref e) => {
            warn!("Unable to fill second day key from {:?}: {}; will ignore.", my_tm, e);
            return;
        }
    };
    let second_day_delta = CameraDayValue {
        recordings: sign,
        duration: Duration(sign * (r.end.0 - boundary_90k)),
    };
    adjust_day(day, second_day_delta, m);
}

impl Camera {
    /// Adds a single recording with the given properties to the in-memory
    /// state.
    fn add_recording(&mut self, r: Range<Time>, sample_file_bytes: i32) {
        self.range = Some(match self.range {
            Some(ref e) => cmp::min(e.start, r.start)..cmp::max(e.end, r.end),
            None => r.start..r.end,
        });
        self.duration += r.end - r.start;
        self.sample_file_bytes += i64::from(sample_file_bytes);
        adjust_days(r, 1, &mut self.days);
    }
}

/// Gets a uuid from the given SQLite row and column index.
fn get_uuid<I: rusqlite::RowIndex>(row: &rusqlite::Row, i: I) -> Result<Uuid, Error> {
    let b: Vec<u8> = row.get(i).err_kind(ErrorKind::Internal)?;
    Uuid::from_slice(&b).err_kind(ErrorKind::DataLoss)
}

/// Gets a 20-byte sha1 from the given SQLite row and column index.
fn get_sha1<I: rusqlite::RowIndex>(row: &rusqlite::Row, i: I) -> Result<[u8; 20], Error> {
    let sha1_vec: Vec<u8> = row.get(i).err_kind(ErrorKind::Internal)?;
    if sha1_vec.len() != 20 {
        bail_t!(DataLoss, "sha1 has invalid length {}", sha1_vec.len());
    }
    let mut sha1 = [0u8; 20];
    sha1.copy_from_slice(&sha1_vec);
    Ok(sha1)
}

/// Initializes the recordings associated with the given camera.
fn init_recordings(
    conn: &mut rusqlite::Connection,
    camera_id: i32,
    camera: &mut Camera,
) -> Result<(), Error> {
    info!("Loading recordings for camera {}", camera.short_name);
    let mut stmt = conn.prepare(
        r#"
        select
          recording.start_time_90k,
          recording.duration_90k,
          recording.sample_file_bytes
        from
          recording
        where
          camera_id = :camera_id
        "#,
    ).err_kind(ErrorKind::Internal)?;
    let mut rows = stmt.query(named_params! {":camera_id": camera_id}).err_kind(ErrorKind::Internal)?;
    let mut i = 0;
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        let start = Time(row.get(0).err_kind(ErrorKind::Internal)?);
        let duration = Duration(row.get(1).err_kind(ErrorKind::Internal)?);
        let bytes = row.get(2).err_kind(ErrorKind::Internal)?;
        camera.add_recording(start..start + duration, bytes);
        i += 1;
    }
    info!("Loaded {} recordings for camera {}", i, camera.short_name);
    Ok(())
}

pub struct LockedDatabase {
    conn: rusqlite::Connection,
    state: State,
}

/// In-memory state from the database.
/// This is separated out of `LockedDatabase` so that `Transaction` can
/// mutably borrow `state` while its underlying `rusqlite::Transaction` is
/// borrowing `conn`.
struct State {
    cameras_by_id: BTreeMap<i32, Camera>,
    cameras_by_uuid: BTreeMap<Uuid, i32>,
    video_sample_entries: BTreeMap<i32, Arc<VideoSampleEntry>>,
    list_recordings_sql: String,
    list_camera_recordings_sql: String,
    playback_cache: RefCell<LruCache<i64, Arc<RecordingPlayback>, fnv::FnvBuildHasher>>,
}

/// A high-level transaction. This manages the SQLite transaction and the
/// matching modification to be applied to the in-memory state on successful
/// commit.
pub struct Transaction<'a> {
    state: &'a mut State,
    mods_by_camera: FnvHashMap<i32, CameraModification>,
    tx: rusqlite::Transaction<'a>,

    /// True if due to an earlier error the transaction must be rolled back
    /// rather than committed. Insert and delete are two-part, requiring a
    /// delete from the `reserved_sample_files` table and an insert to the
    /// `recording` table (or vice versa). If the latter half fails, the
    /// former should be aborted as well.
    must_rollback: bool,

    /// Normally sample file uuids must be reserved prior to a recording
    /// being inserted. It's convenient in tests though to allow the same
    /// segment to be inserted into the database many times, so this safety
    /// check can be disabled.
    pub bypass_reservation_for_testing: bool,
}

/// A modification to be done to a `Camera` after a `Transaction` is
/// committed.
struct CameraModification {
    /// Add this to `camera.duration`. Thus, positive values indicate a net
    /// addition; negative values indicate a net subtraction.
    duration: Duration,

    /// Add this to `camera.sample_file_bytes`.
    sample_file_bytes: i64,

    /// Add this to `camera.days`.
    days: BTreeMap<CameraDayKey, CameraDayValue>,

    /// Reset the camera range to this value. This is populated immediately
    /// prior to the commit.
    range: Option<Range<Time>>,
}

impl<'a> Transaction<'a> {
    /// Reserves a new, randomly generated UUID to be used as a sample file.
    pub fn reserve_sample_file(&mut self) -> Result<Uuid, Error> {
        let mut stmt = self.tx.prepare_cached(INSERT_RESERVATION_SQL).err_kind(ErrorKind::Internal)?;
        let uuid = Uuid::new_v4();
        let uuid_bytes = &uuid.as_bytes()[..];
        stmt.execute(named_params! {
            ":uuid": uuid_bytes,
            ":state": ReservationState::Writing as i64,
        }).err_kind(ErrorKind::Internal)?;
        info!("reserved {}", uuid);
        Ok(uuid)
    }

    /// Deletes the given recordings from the `recording` table.
    /// Note they are not fully removed from the database; the uuids are
    /// transferred to the `reserved_sample_files` table. The caller should
    /// `unlink` the files, then remove the reservation.
    pub fn delete_recordings(&mut self, rows: &[ListOldestSampleFilesRow]) -> Result<(), Error> {
        let mut del = self.tx.prepare_cached(DELETE_RECORDING_SQL).err_kind(ErrorKind::Internal)?;
        let mut insert = self.tx.prepare_cached(INSERT_RESERVATION_SQL).err_kind(ErrorKind::Internal)?;

        self.check_must_rollback()?;
        self.must_rollback = true;
        for row in rows {
            let changes = del.execute(named_params! {":recording_id": row.recording_id}).err_kind(ErrorKind::Internal)?;
            if changes != 1 {
                bail_t!(
                    NotFound,
                    "no such recording {} (camera {}, uuid {})",
                    row.recording_id,
                    row.camera_id,
                    row.uuid
                );
            }
            let uuid_bytes = &row.uuid.as_bytes()[..];
            insert.execute(named_params! {
                ":uuid": uuid_bytes,
                ":state": ReservationState::Deleting as i64,
            }).err_kind(ErrorKind::Internal)?;
            let m = Transaction::get_mods_by_camera(&mut self.mods_by_camera, row.camera_id);
            m.duration -= row.time.end - row.time.start;
            m.sample_file_bytes -= i64::from(row.sample_file_bytes);
            adjust_days(row.time.clone(), -1, &mut m.days);
        }
        self.must_rollback = false;
        Ok(())
    }

    /// Marks the given sample file uuids as deleted. Accepts uuids in either
    /// `ReservationState`. This shouldn't be called until the files have
    /// been `unlink()`ed and the parent directory `fsync()`ed.
    pub fn mark_sample_files_deleted(&mut self, uuids: &[Uuid]) -> Result<(), Error> {
        if uuids.is_empty() {
            return Ok(());
        }
        let mut stmt = self.tx.prepare_cached(DELETE_RESERVATION_SQL).err_kind(ErrorKind::Internal)?;
        for uuid in uuids {
            let uuid_bytes = &uuid.as_bytes()[..];
            let changes = stmt.execute(named_params! {":uuid": uuid_bytes}).err_kind(ErrorKind::Internal)?;
            if changes != 1 {
                bail_t!(NotFound, "no reservation for {}", uuid);
            }
        }
        Ok(())
    }

    /// Inserts the specified recording, returning its row id.
    /// The sample file uuid must have been previously reserved. (Although
    /// this can be bypassed for testing; see the
    /// `bypass_reservation_for_testing` field.)
    pub fn insert_recording(&mut self, r: &RecordingToInsert) -> Result<i64, Error> {
        self.check_must_rollback()?;

        if r.time.end < r.time.start {
            bail_t!(InvalidArgument, "end time {} must be >= start time {}", r.time.end, r.time.start);
        }
        let duration = r.time.end.0 - r.time.start.0;
        if duration > MAX_RECORDING_DURATION {
            bail_t!(InvalidArgument, "duration {} exceeds maximum recording duration", duration);
        }

        // Unreserve the sample file uuid and insert the recording row.
        if self.state.cameras_by_id.get_mut(&r.camera_id).is_none() {
            bail_t!(NotFound, "no such camera id {}", r.camera_id);
        }
        let uuid_bytes = &r.sample_file_uuid.as_bytes()[..];
        {
            let mut stmt = self.tx.prepare_cached(DELETE_RESERVATION_SQL).err_kind(ErrorKind::Internal)?;
            let changes = stmt.execute(named_params! {":uuid": uuid_bytes}).err_kind(ErrorKind::Internal)?;
            if changes != 1 && !self.bypass_reservation_for_testing {
                bail_t!(FailedPrecondition, "uuid {} is not reserved", r.sample_file_uuid);
            }
        }
        self.must_rollback = true;
        {
            let mut stmt = self.tx.prepare_cached(INSERT_RECORDING_SQL).err_kind(ErrorKind::Internal)?;
            stmt.execute(named_params! {
                ":camera_id": i64::from(r.camera_id),
                ":sample_file_bytes": r.sample_file_bytes,
                ":start_time_90k": r.time.start.0,
                ":duration_90k": duration,
                ":local_time_delta_90k": r.local_time_delta.0,
                ":video_samples": r.video_samples,
                ":video_sync_samples": r.video_sync_samples,
                ":video_sample_entry_id": r.video_sample_entry_id,
                ":sample_file_uuid": uuid_bytes,
                ":sample_file_sha1": &r.sample_file_sha1[..],
                ":video_index": r.video_index,
            }).err_kind(ErrorKind::Internal)?;
        }
        self.must_rollback = false;
        let id = self.tx.last_insert_rowid();
        let m = Transaction::get_mods_by_camera(&mut self.mods_by_camera, r.camera_id);
        m.duration += r.time.end - r.time.start;
        m.sample_file_bytes += i64::from(r.sample_file_bytes);
        adjust_days(r.time.clone(), 1, &mut m.days);
        Ok(id)
    }

    /// Commits these changes, consuming the Transaction.
    pub fn commit(mut self) -> Result<(), Error> {
        self.check_must_rollback()?;
        self.precommit()?;
        self.tx.commit().err_kind(ErrorKind::Internal)?;
        for (&camera_id, m) in &self.mods_by_camera {
            let camera = self
                .state
                .cameras_by_id
                .get_mut(&camera_id)
                .expect("modified camera must exist");
            camera.duration += m.duration;
            camera.sample_file_bytes += m.sample_file_bytes;
            for (k, v) in &m.days {
                adjust_day(*k, *v, &mut camera.days);
            }
            camera.range = m.range.clone();
        }
        Ok(())
    }

    /// Raises an error if `must_rollback` is true. To be used on commit and
    /// in modifications.
    fn check_must_rollback(&self) -> Result<(), Error> {
        if self.must_rollback {
            bail_t!(FailedPrecondition, "failing due to previous error");
        }
        Ok(())
    }

    /// Looks up an existing entry in `mods` for a given camera or
    /// makes+inserts an identity entry.
    fn get_mods_by_camera(
        mods: &mut FnvHashMap<i32, CameraModification>,
        camera_id: i32,
    ) -> &mut CameraModification {
        mods.entry(camera_id).or_insert_with(|| CameraModification {
            duration: Duration(0),
            sample_file_bytes: 0,
            range: None,
            days: BTreeMap::new(),
        })
    }

    /// Fills the `range` of each `CameraModification`. This is done prior to
    /// the commit so that if the commit succeeds, there's no possibility
    /// that the correct state can't be retrieved.
    fn precommit(&mut self) -> Result<(), Error> {
        // Recompute start and end times for each camera.
        for (&camera_id, m) in &mut self.mods_by_camera {
            // The minimum is straightforward, taking advantage of the
            // start_time_90k index.
            let mut stmt = self.tx.prepare_cached(CAMERA_MIN_START_SQL).err_kind(ErrorKind::Internal)?;
            let mut rows = stmt.query(named_params! {":camera_id": camera_id}).err_kind(ErrorKind::Internal)?;
            let min_start = match rows.next().err_kind(ErrorKind::Internal)? {
                Some(row) => Time(row.get(0).err_kind(ErrorKind::Internal)?),
                None => continue, // no data; leave m.range alone.
            };

            // There was a minimum, so there should be a maximum too.
            // Calculating it is less straightforward because recordings could
            // overlap. All recordings starting in the last
            // MAX_RECORDING_DURATION must be examined in order to take
            // advantage of the start_time_90k index.
            let mut stmt = self.tx.prepare_cached(CAMERA_MAX_START_SQL).err_kind(ErrorKind::Internal)?;
            let mut rows = stmt.query(named_params! {":camera_id": camera_id}).err_kind(ErrorKind::Internal)?;
            let mut maxes_opt = None;
            while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
                let row_start = Time(row.get(0).err_kind(ErrorKind::Internal)?);
                let row_duration: i64 = row.get(1).err_kind(ErrorKind::Internal)?;
                let row_end = Time(row_start.0 + row_duration);
                let maxes = match maxes_opt {
                    None => row_start..row_end,
                    Some(Range { start: s, end: e }) => s..cmp::max(e, row_end),
                };
                if row_start.0 <= maxes.start.0 - MAX_RECORDING_DURATION {
                    break;
                }
                maxes_opt = Some(maxes);
            }
            let max_end = match maxes_opt {
                Some(Range { end: e, .. }) => e,
                None => bail_t!(Internal, "missing max for camera {} which had min {}", camera_id, min_start),
            };
            m.range = Some(min_start..max_end);
        }
        Ok(())
    }
}

impl LockedDatabase {
    /// Returns an immutable view of the cameras by id.
    pub fn cameras_by_id(&self) -> &BTreeMap<i32, Camera> {
        &self.state.cameras_by_id
    }

    /// Starts a transaction for a write operation.
    /// Note transactions are not needed for read operations; this process
    /// holds a lock on the database directory, and the connection is locked
    /// within the process, so having a `LockedDatabase` is sufficient to
    /// ensure a consistent view.
    pub fn tx(&mut self) -> Result<Transaction, Error> {
        Ok(Transaction {
            state: &mut self.state,
            mods_by_camera: FnvHashMap::default(),
            tx: self.conn.transaction().err_kind(ErrorKind::Internal)?,
            must_rollback: false,
            bypass_reservation_for_testing: false,
        })
    }

    /// Gets a given camera by uuid.
    pub fn get_camera(&self, uuid: Uuid) -> Option<&Camera> {
        self.state
            .cameras_by_uuid
            .get(&uuid)
            .map(|id| self.state.cameras_by_id.get(id).expect("uuid->id requires id->cam"))
    }

    /// Lists recordings overlapping the given time range in ascending order,
    /// passing them to a supplied function. Given that the function is
    /// called with the database lock held, it should be quick.
    ///
    /// This is the query which feeds `.mp4` file assembly.
    pub fn list_recordings<F>(
        &self,
        camera_id: i32,
        desired_time: &Range<Time>,
        f: F,
    ) -> Result<(), Error>
    where
        F: FnMut(ListRecordingsRow) -> Result<(), Error>,
    {
        self.list_recordings_inner(&self.state.list_recordings_sql, camera_id, desired_time, f)
    }

    /// As `list_recordings`, but in descending order by start time, for
    /// newest-first display of a camera's recordings.
    pub fn list_camera_recordings<F>(
        &self,
        camera_id: i32,
        desired_time: &Range<Time>,
        f: F,
    ) -> Result<(), Error>
    where
        F: FnMut(ListRecordingsRow) -> Result<(), Error>,
    {
        self.list_recordings_inner(
            &self.state.list_camera_recordings_sql,
            camera_id,
            desired_time,
            f,
        )
    }

    fn list_recordings_inner<F>(
        &self,
        sql: &str,
        camera_id: i32,
        desired_time: &Range<Time>,
        mut f: F,
    ) -> Result<(), Error>
    where
        F: FnMut(ListRecordingsRow) -> Result<(), Error>,
    {
        let mut stmt = self.conn.prepare_cached(sql).err_kind(ErrorKind::Internal)?;
        let mut rows = stmt.query(named_params! {
            ":camera_id": camera_id,
            ":start_time_90k": desired_time.start.0,
            ":end_time_90k": desired_time.end.0,
        }).err_kind(ErrorKind::Internal)?;
        while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
            let id: i64 = row.get(0).err_kind(ErrorKind::Internal)?;
            let vse_id: i32 = row.get(7).err_kind(ErrorKind::Internal)?;
            let video_sample_entry = match self.state.video_sample_entries.get(&vse_id) {
                Some(v) => v,
                None => bail_t!(Internal, "recording {} references nonexistent video_sample_entry {}", id, vse_id),
            };
            let out = ListRecordingsRow {
                id,
                camera_id,
                start: Time(row.get(1).err_kind(ErrorKind::Internal)?),
                duration_90k: row.get(2).err_kind(ErrorKind::Internal)?,
                sample_file_bytes: row.get(3).err_kind(ErrorKind::Internal)?,
                video_samples: row.get(4).err_kind(ErrorKind::Internal)?,
                video_sync_samples: row.get(5).err_kind(ErrorKind::Internal)?,
                sample_file_sha1: get_sha1(row, 6)?,
                video_sample_entry: video_sample_entry.clone(),
            };
            f(out)?;
        }
        Ok(())
    }

    /// Calls `f` with the uuid and video index of a single recording.
    /// This uses a LRU cache to reduce the number of retrievals from the
    /// database.
    pub fn with_recording_playback<F, R>(&self, recording_id: i64, f: F) -> Result<R, Error>
    where
        F: FnOnce(&RecordingPlayback) -> Result<R, Error>,
    {
        let mut cache = self.state.playback_cache.borrow_mut();
        if let Some(r) = cache.get_mut(&recording_id) {
            trace!("cache hit for recording {}", recording_id);
            let r = r.clone();
            drop(cache);
            return f(&r);
        }
        trace!("cache miss for recording {}", recording_id);
        let mut stmt = self.conn.prepare_cached(GET_RECORDING_PLAYBACK_SQL).err_kind(ErrorKind::Internal)?;
        let mut rows = stmt.query(named_params! {":id": recording_id}).err_kind(ErrorKind::Internal)?;
        if let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
            let r = Arc::new(RecordingPlayback {
                sample_file_uuid: get_uuid(row, 0)?,
                video_index: row.get(1).err_kind(ErrorKind::Internal)?,
            });
            cache.insert(recording_id, r.clone());
            drop(cache);
            return f(&r);
        }
        bail_t!(NotFound, "no such recording {}", recording_id);
    }

    /// Lists all reserved sample files.
    pub fn list_reserved_sample_files(&self) -> Result<Vec<Uuid>, Error> {
        let mut reserved = Vec::new();
        let mut stmt = self.conn.prepare_cached("select uuid from reserved_sample_files").err_kind(ErrorKind::Internal)?;
        let mut rows = stmt.query(params![]).err_kind(ErrorKind::Internal)?;
        while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
            reserved.push(get_uuid(row, 0)?);
        }
        Ok(reserved)
    }

    /// Lists the oldest sample files (to delete to free room).
    /// `f` should return true as long as further rows are desired.
    pub fn list_oldest_sample_files<F>(&self, camera_id: i32, mut f: F) -> Result<(), Error>
    where
        F: FnMut(ListOldestSampleFilesRow) -> bool,
    {
        let mut stmt = self.conn.prepare_cached(LIST_OLDEST_SAMPLE_FILES_SQL).err_kind(ErrorKind::Internal)?;
        let mut rows = stmt.query(named_params! {":camera_id": i64::from(camera_id)}).err_kind(ErrorKind::Internal)?;
        while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
            let start = Time(row.get(2).err_kind(ErrorKind::Internal)?);
            let duration = Duration(row.get(3).err_kind(ErrorKind::Internal)?);
            let should_continue = f(ListOldestSampleFilesRow {
                recording_id: row.get(0).err_kind(ErrorKind::Internal)?,
                uuid: get_uuid(row, 1)?,
                camera_id,
                time: start..start + duration,
                sample_file_bytes: row.get(4).err_kind(ErrorKind::Internal)?,
            });
            if !should_continue {
                break;
            }
        }
        Ok(())
    }

    /// Initializes the video_sample_entries. To be called during
    /// construction.
    fn init_video_sample_entries(&mut self) -> Result<(), Error> {
        info!("Loading video sample entries");
        let mut stmt = self.conn.prepare(
            r#"
            select
                id,
                sha1,
                width,
                height,
                rfc6381_codec,
                data
            from
                video_sample_entry
            "#,
        ).err_kind(ErrorKind::Internal)?;
        let mut rows = stmt.query(params![]).err_kind(ErrorKind::Internal)?;
        while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
            let id = row.get(0).err_kind(ErrorKind::Internal)?;
            self.state.video_sample_entries.insert(
                id,
                Arc::new(VideoSampleEntry {
                    id,
                    sha1: get_sha1(row, 1)?,
                    width: row.get::<_, i32>(2).err_kind(ErrorKind::Internal)? as u16,
                    height: row.get::<_, i32>(3).err_kind(ErrorKind::Internal)? as u16,
                    rfc6381_codec: row.get(4).err_kind(ErrorKind::Internal)?,
                    data: row.get(5).err_kind(ErrorKind::Internal)?,
                }),
            );
        }
        info!("Loaded {} video sample entries", self.state.video_sample_entries.len());
        Ok(())
    }

    /// Initializes the cameras, but not their matching recordings.
    /// To be called during construction.
    fn init_cameras(&mut self) -> Result<(), Error> {
        info!("Loading cameras");
        let mut stmt = self.conn.prepare(
            r#"
            select
              id,
              uuid,
              short_name,
              description,
              host,
              username,
              password,
              main_rtsp_path,
              sub_rtsp_path,
              retain_bytes
            from
              camera
            "#,
        ).err_kind(ErrorKind::Internal)?;
        let mut rows = stmt.query(params![]).err_kind(ErrorKind::Internal)?;
        while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
            let id = row.get(0).err_kind(ErrorKind::Internal)?;
            let uuid = get_uuid(row, 1)?;
            self.state.cameras_by_id.insert(
                id,
                Camera {
                    id,
                    uuid,
                    short_name: row.get(2).err_kind(ErrorKind::Internal)?,
                    description: row.get(3).err_kind(ErrorKind::Internal)?,
                    host: row.get(4).err_kind(ErrorKind::Internal)?,
                    username: row.get(5).err_kind(ErrorKind::Internal)?,
                    password: row.get(6).err_kind(ErrorKind::Internal)?,
                    main_rtsp_path: row.get(7).err_kind(ErrorKind::Internal)?,
                    sub_rtsp_path: row.get(8).err_kind(ErrorKind::Internal)?,
                    retain_bytes: row.get(9).err_kind(ErrorKind::Internal)?,
                    range: None,
                    sample_file_bytes: 0,
                    duration: Duration(0),
                    days: BTreeMap::new(),
                },
            );
            self.state.cameras_by_uuid.insert(uuid, id);
        }
        info!("Loaded {} cameras", self.state.cameras_by_id.len());
        Ok(())
    }

    /// Inserts the specified video sample entry if absent.
    /// On success, returns the id of a new or existing row.
    pub fn insert_video_sample_entry(
        &mut self,
        width: u16,
        height: u16,
        data: Vec<u8>,
        rfc6381_codec: String,
    ) -> Result<i32, Error> {
        let sha1 = hash::hash(hash::MessageDigest::sha1(), &data).err_kind(ErrorKind::Internal)?;
        let mut sha1_bytes = [0u8; 20];
        sha1_bytes.copy_from_slice(&sha1);

        // Check if it already exists.
        // There shouldn't be too many entries, so it's fine to enumerate
        // everything.
        for (&id, v) in &self.state.video_sample_entries {
            if v.sha1 == sha1_bytes {
                // The width and height should match given that they're also
                // specified within data and thus included in the just-compared
                // hash.
                if v.width != width || v.height != height {
                    bail_t!(
                        FailedPrecondition,
                        "database entry for sha1 {:?} is {}x{}, not {}x{}",
                        &sha1[..],
                        v.width,
                        v.height,
                        width,
                        height
                    );
                }
                return Ok(id);
            }
        }

        let mut stmt = self.conn.prepare_cached(INSERT_VIDEO_SAMPLE_ENTRY_SQL).err_kind(ErrorKind::Internal)?;
        stmt.execute(named_params! {
            ":sha1": &sha1_bytes[..],
            ":width": i64::from(width),
            ":height": i64::from(height),
            ":rfc6381_codec": &rfc6381_codec,
            ":data": &data,
        }).err_kind(ErrorKind::Internal)?;

        let id = self.conn.last_insert_rowid() as i32;
        self.state.video_sample_entries.insert(
            id,
            Arc::new(VideoSampleEntry {
                id,
                width,
                height,
                sha1: sha1_bytes,
                rfc6381_codec,
                data,
            }),
        );
        Ok(id)
    }
}

/// Initializes a connection to the current schema.
pub fn init(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    conn.execute_batch(
        r#"
        pragma journal_mode = wal;
        pragma page_size = 16384;
        "#,
    ).err_kind(ErrorKind::Internal)?;
    let tx = conn.transaction().err_kind(ErrorKind::Internal)?;
    tx.execute_batch(include_str!("schema.sql")).err_kind(ErrorKind::Internal)?;
    tx.commit().err_kind(ErrorKind::Internal)?;
    Ok(())
}

/// Gets the schema version from the given database connection, or `None` if
/// the database has not yet been initialized.
pub fn get_schema_version(conn: &rusqlite::Connection) -> Result<Option<i32>, Error> {
    let ver_tables: i32 = conn.query_row(
        "select count(*) from sqlite_master where name = 'version'",
        params![],
        |row| row.get(0),
    ).err_kind(ErrorKind::Internal)?;
    if ver_tables == 0 {
        return Ok(None);
    }
    conn.query_row("select max(id) from version", params![], |row| row.get(0))
        .err_kind(ErrorKind::Internal)
        .map(Some)
}

/// The recording database. Abstracts away SQLite queries. Also maintains
/// in-memory state (loaded on startup, and updated on successful commit) to
/// avoid expensive scans over the recording table on common queries.
pub struct Database(Mutex<LockedDatabase>);

impl Database {
    /// Creates the database from a caller-supplied SQLite connection.
    pub fn new(conn: rusqlite::Connection) -> Result<Database, Error> {
        conn.execute_batch("pragma foreign_keys = on;").err_kind(ErrorKind::Internal)?;
        let list_recordings_sql = format!(
            r#"
            select
                recording.id,
                recording.start_time_90k,
                recording.duration_90k,
                recording.sample_file_bytes,
                recording.video_samples,
                recording.video_sync_samples,
                recording.sample_file_sha1,
                recording.video_sample_entry_id
            from
                recording
            where
                camera_id = :camera_id and
                recording.start_time_90k > :start_time_90k - {} and
                recording.start_time_90k < :end_time_90k and
                recording.start_time_90k + recording.duration_90k > :start_time_90k
            order by
                recording.start_time_90k
            "#,
            MAX_RECORDING_DURATION
        );
        let list_camera_recordings_sql = format!("{list_recordings_sql} desc");
        let db = Database(Mutex::new(LockedDatabase {
            conn,
            state: State {
                cameras_by_id: BTreeMap::new(),
                cameras_by_uuid: BTreeMap::new(),
                video_sample_entries: BTreeMap::new(),
                playback_cache: RefCell::new(LruCache::with_hasher(1024, Default::default())),
                list_recordings_sql,
                list_camera_recordings_sql,
            },
        }));
        {
            let l = &mut *db.lock();
            l.init_video_sample_entries()?;
            l.init_cameras()?;
            let state = &mut l.state;
            for (&camera_id, camera) in &mut state.cameras_by_id {
                init_recordings(&mut l.conn, camera_id, camera)?;
            }
        }
        Ok(db)
    }

    /// Locks the database; the returned reference is the only way to perform
    /// (read or write) operations.
    pub fn lock(&self) -> MutexGuard<LockedDatabase> {
        self.0.lock().unwrap()
    }

    /// For testing: closes the database and returns the connection. This
    /// allows verification that a newly opened database is in an acceptable
    /// state.
    pub fn close(self) -> rusqlite::Connection {
        self.0.into_inner().unwrap().conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use rusqlite::Connection;
    use std::fmt::Debug;

    fn setup_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema).unwrap();
        conn
    }

    fn setup_camera(conn: &Connection, uuid: Uuid, short_name: &str) -> i32 {
        let uuid_bytes = &uuid.as_bytes()[..];
        conn.execute(
            r#"
            insert into camera (uuid,  short_name,  description,  host,  username,  password,
                                main_rtsp_path,  sub_rtsp_path,  retain_bytes)
                        values (:uuid, :short_name, :description, :host, :username, :password,
                                :main_rtsp_path, :sub_rtsp_path, :retain_bytes)
            "#,
            named_params! {
                ":uuid": uuid_bytes,
                ":short_name": short_name,
                ":description": "",
                ":host": "test-camera",
                ":username": "foo",
                ":password": "bar",
                ":main_rtsp_path": "/main",
                ":sub_rtsp_path": "/sub",
                ":retain_bytes": 42i64,
            },
        )
        .unwrap();
        conn.last_insert_rowid() as i32
    }

    fn assert_no_recordings(db: &Database, uuid: Uuid) {
        let mut rows = 0;
        let mut camera_id = -1;
        {
            let db = db.lock();
            for row in db.cameras_by_id().values() {
                rows += 1;
                camera_id = row.id;
                assert_eq!(uuid, row.uuid);
                assert_eq!("test-camera", row.host);
                assert_eq!("foo", row.username);
                assert_eq!("bar", row.password);
                assert_eq!("/main", row.main_rtsp_path);
                assert_eq!("/sub", row.sub_rtsp_path);
                assert_eq!(42, row.retain_bytes);
                assert_eq!(None, row.range);
                assert_eq!(Duration(0), row.duration);
                assert_eq!(0, row.sample_file_bytes);
            }
        }
        assert_eq!(1, rows);

        rows = 0;
        {
            let db = db.lock();
            let all_time = Time(i64::min_value())..Time(i64::max_value());
            db.list_recordings(camera_id, &all_time, |_row| {
                rows += 1;
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(0, rows);
    }

    fn assert_single_recording(db: &Database, camera_uuid: Uuid, r: &RecordingToInsert) {
        let mut rows = 0;
        let mut camera_id = -1;
        {
            let db = db.lock();
            for row in db.cameras_by_id().values() {
                rows += 1;
                camera_id = row.id;
                assert_eq!(camera_uuid, row.uuid);
                assert_eq!(Some(r.time.clone()), row.range);
                assert_eq!(i64::from(r.sample_file_bytes), row.sample_file_bytes);
                assert_eq!(r.time.end - r.time.start, row.duration);
            }
        }
        assert_eq!(1, rows);

        rows = 0;
        let mut recording_id = -1;
        {
            let db = db.lock();
            let all_time = Time(i64::min_value())..Time(i64::max_value());
            db.list_recordings(camera_id, &all_time, |row| {
                rows += 1;
                recording_id = row.id;
                assert_eq!(r.time, row.start..row.start + Duration(i64::from(row.duration_90k)));
                assert_eq!(r.video_samples, row.video_samples);
                assert_eq!(r.video_sync_samples, row.video_sync_samples);
                assert_eq!(r.sample_file_bytes, row.sample_file_bytes);
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(1, rows);

        rows = 0;
        db.lock()
            .list_oldest_sample_files(camera_id, |row| {
                rows += 1;
                assert_eq!(recording_id, row.recording_id);
                assert_eq!(r.sample_file_uuid, row.uuid);
                assert_eq!(r.time, row.time);
                assert_eq!(r.sample_file_bytes, row.sample_file_bytes);
                true
            })
            .unwrap();
        assert_eq!(1, rows);
    }

    fn assert_unsorted_eq<T>(mut a: Vec<T>, mut b: Vec<T>)
    where
        T: Debug + Ord,
    {
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn test_adjust_days() {
        testutil::init();
        let mut m = BTreeMap::new();

        // Create a day.
        let test_time = Time(130647162600000i64); // 2015-12-31 23:59:00 (Pacific).
        let one_min = Duration(60 * TIME_UNITS_PER_SEC);
        let two_min = Duration(2 * 60 * TIME_UNITS_PER_SEC);
        let three_min = Duration(3 * 60 * TIME_UNITS_PER_SEC);
        let four_min = Duration(4 * 60 * TIME_UNITS_PER_SEC);
        let test_day1 = &CameraDayKey(*b"2015-12-31");
        let test_day2 = &CameraDayKey(*b"2016-01-01");
        adjust_days(test_time..test_time + one_min, 1, &mut m);
        assert_eq!(1, m.len());
        assert_eq!(
            Some(&CameraDayValue {
                recordings: 1,
                duration: one_min
            }),
            m.get(test_day1)
        );

        // Add to a day.
        adjust_days(test_time..test_time + one_min, 1, &mut m);
        assert_eq!(1, m.len());
        assert_eq!(
            Some(&CameraDayValue {
                recordings: 2,
                duration: two_min
            }),
            m.get(test_day1)
        );

        // Subtract from a day.
        adjust_days(test_time..test_time + one_min, -1, &mut m);
        assert_eq!(1, m.len());
        assert_eq!(
            Some(&CameraDayValue {
                recordings: 1,
                duration: one_min
            }),
            m.get(test_day1)
        );

        // Remove a day.
        adjust_days(test_time..test_time + one_min, -1, &mut m);
        assert_eq!(0, m.len());

        // Create two days.
        adjust_days(test_time..test_time + three_min, 1, &mut m);
        assert_eq!(2, m.len());
        assert_eq!(
            Some(&CameraDayValue {
                recordings: 1,
                duration: one_min
            }),
            m.get(test_day1)
        );
        assert_eq!(
            Some(&CameraDayValue {
                recordings: 1,
                duration: two_min
            }),
            m.get(test_day2)
        );

        // Add to two days.
        adjust_days(test_time..test_time + three_min, 1, &mut m);
        assert_eq!(2, m.len());
        assert_eq!(
            Some(&CameraDayValue {
                recordings: 2,
                duration: two_min
            }),
            m.get(test_day1)
        );
        assert_eq!(
            Some(&CameraDayValue {
                recordings: 2,
                duration: four_min
            }),
            m.get(test_day2)
        );

        // Subtract from two days.
        adjust_days(test_time..test_time + three_min, -1, &mut m);
        assert_eq!(2, m.len());
        assert_eq!(
            Some(&CameraDayValue {
                recordings: 1,
                duration: one_min
            }),
            m.get(test_day1)
        );
        assert_eq!(
            Some(&CameraDayValue {
                recordings: 1,
                duration: two_min
            }),
            m.get(test_day2)
        );

        // Remove two days.
        adjust_days(test_time..test_time + three_min, -1, &mut m);
        assert_eq!(0, m.len());
    }

    #[test]
    fn test_day_bounds() {
        testutil::init();
        assert_eq!(
            CameraDayKey(*b"2015-12-31").bounds(),
            Time(130639392000000)..Time(130647168000000)
        );
    }

    /// Basic test of running some queries on an empty database.
    #[test]
    fn test_empty_db() {
        testutil::init();
        let conn = setup_conn();
        let db = Database::new(conn).unwrap();
        let db = db.lock();
        assert_eq!(0, db.cameras_by_id().values().count());
    }

    /// Basic test of the full lifecycle of recording. Does not exercise
    /// error cases.
    #[test]
    fn test_full_lifecycle() {
        testutil::init();
        let conn = setup_conn();
        let camera_uuid = Uuid::new_v4();
        let camera_id = setup_camera(&conn, camera_uuid, "testcam");
        let db = Database::new(conn).unwrap();
        assert_no_recordings(&db, camera_uuid);

        assert_eq!(db.lock().list_reserved_sample_files().unwrap(), &[] as &[uuid::Uuid]);

        let (uuid_to_use, uuid_to_keep);
        {
            let mut db = db.lock();
            let mut tx = db.tx().unwrap();
            uuid_to_use = tx.reserve_sample_file().unwrap();
            uuid_to_keep = tx.reserve_sample_file().unwrap();
            tx.commit().unwrap();
        }

        assert_unsorted_eq(
            db.lock().list_reserved_sample_files().unwrap(),
            vec![uuid_to_use, uuid_to_keep],
        );

        let vse_id = db
            .lock()
            .insert_video_sample_entry(768, 512, [0u8; 100].to_vec(), "avc1.000000".to_owned())
            .unwrap();
        assert!(vse_id > 0, "vse_id = {}", vse_id);

        // Inserting a recording should succeed and remove its uuid from the
        // reserved table.
        let start = Time(1430006400 * TIME_UNITS_PER_SEC);
        let recording = RecordingToInsert {
            camera_id,
            sample_file_bytes: 42,
            time: start..start + Duration(TIME_UNITS_PER_SEC),
            local_time_delta: Duration(0),
            video_samples: 1,
            video_sync_samples: 1,
            video_sample_entry_id: vse_id,
            sample_file_uuid: uuid_to_use,
            video_index: [0u8; 100].to_vec(),
            sample_file_sha1: [0u8; 20],
        };
        {
            let mut db = db.lock();
            let mut tx = db.tx().unwrap();
            tx.insert_recording(&recording).unwrap();
            tx.commit().unwrap();
        }
        assert_unsorted_eq(db.lock().list_reserved_sample_files().unwrap(), vec![uuid_to_keep]);

        // Queries should return the correct result (with caches updated on
        // insert).
        assert_single_recording(&db, camera_uuid, &recording);

        // Queries on a fresh database should return the correct result (with
        // caches populated from existing database contents rather than built
        // on insert).
        let conn = db.close();
        let db = Database::new(conn).unwrap();
        assert_single_recording(&db, camera_uuid, &recording);

        // Deleting a recording should succeed, update the min/max times, and
        // re-reserve the uuid.
        {
            let mut db = db.lock();
            let mut v = Vec::new();
            db.list_oldest_sample_files(camera_id, |r| {
                v.push(r);
                true
            })
            .unwrap();
            assert_eq!(1, v.len());
            let mut tx = db.tx().unwrap();
            tx.delete_recordings(&v).unwrap();
            tx.commit().unwrap();
        }
        assert_no_recordings(&db, camera_uuid);
        assert_unsorted_eq(
            db.lock().list_reserved_sample_files().unwrap(),
            vec![uuid_to_use, uuid_to_keep],
        );
    }

    #[test]
    fn test_drop_tx() {
        testutil::init();
        let conn = setup_conn();
        let db = Database::new(conn).unwrap();
        let mut db = db.lock();
        {
            let mut tx = db.tx().unwrap();
            tx.reserve_sample_file().unwrap();
            // drop tx without committing.
        }

        // The dropped tx should have done nothing.
        assert_eq!(db.list_reserved_sample_files().unwrap(), &[] as &[uuid::Uuid]);

        // Following transactions should succeed.
        let uuid;
        {
            let mut tx = db.tx().unwrap();
            uuid = tx.reserve_sample_file().unwrap();
            tx.commit().unwrap();
        }
        assert_eq!(db.list_reserved_sample_files().unwrap(), &[uuid]);
    }
}
