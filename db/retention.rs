// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Retention enforcement: deleting the oldest recordings to stay within each
//! camera's byte quota.
//!
//! Deletion is a two-step commit mirroring the one used for insertion, in
//! the opposite order: first a transaction removes recording rows and
//! reserves their uuids in state `deleting`, then the files are unlinked and
//! the directory synced, and only then are the reservations cleared. A crash
//! at any point leaves uuids protected by reservations, which are cleaned up
//! on the next startup. At no point can a uuid be reused while its file
//! might still exist.

use base::{bail_t, Error};
use crate::db::{self, Database};
use crate::dir::SampleFileDir;
use std::io;
use std::sync::MutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Queues of sample files in mid-deletion, owned by a camera's recording
/// worker. Entries survive failed attempts and are retried on the next call.
#[derive(Debug, Default)]
pub struct Garbage {
    /// Files possibly present on disk whose uuids are no longer referenced
    /// by recording rows.
    pub to_unlink: Vec<Uuid>,

    /// Files known to be gone from disk whose `deleting` reservations remain.
    pub to_mark_deleted: Vec<Uuid>,
}

impl Garbage {
    pub fn is_empty(&self) -> bool {
        self.to_unlink.is_empty() && self.to_mark_deleted.is_empty()
    }
}

/// Deletes recordings as necessary to bring the camera's disk usage (plus
/// `extra_bytes_needed` about to be written) within its quota, then unlinks
/// the files and clears their reservations.
///
/// Called from the recording worker before each new recording is opened. An
/// error (such as a file which can't be unlinked) leaves the work queued in
/// `g`; the reservation keeps the uuid safe, and the worker retries before
/// the next rotation.
pub fn make_room(
    db: &Database,
    dir: &SampleFileDir,
    camera_id: i32,
    extra_bytes_needed: i64,
    g: &mut Garbage,
) -> Result<(), Error> {
    // Retry anything left over from a previous failed attempt.
    collect_garbage(db, dir, g);
    if !g.to_unlink.is_empty() {
        bail_t!(Internal, "failed to unlink {} sample files from prior attempt", g.to_unlink.len());
    }

    let mut to_delete = Vec::new();
    {
        let mut l = db.lock();
        {
            let camera = match l.cameras_by_id().get(&camera_id) {
                None => bail_t!(NotFound, "no such camera {}", camera_id),
                Some(c) => c,
            };
            get_rows_to_delete(&l, camera_id, camera, extra_bytes_needed, &mut to_delete)?;
        }
        if to_delete.is_empty() && g.to_mark_deleted.is_empty() {
            return Ok(());
        }
        let mut tx = l.tx()?;
        tx.mark_sample_files_deleted(&g.to_mark_deleted)?;
        tx.delete_recordings(&to_delete)?;
        tx.commit()?;
    }
    g.to_mark_deleted.clear();
    g.to_unlink.extend(to_delete.iter().map(|row| row.uuid));

    collect_garbage(db, dir, g);
    if !g.to_unlink.is_empty() {
        bail_t!(Internal, "failed to unlink {} sample files", g.to_unlink.len());
    }
    Ok(())
}

/// Unlinks any files left over from stale reservations (of either state)
/// and clears the reservations. To be called on startup, before recording.
pub fn delete_stale_reservations(db: &Database, dir: &SampleFileDir) -> Result<(), Error> {
    let mut g = Garbage {
        to_unlink: db.lock().list_reserved_sample_files()?,
        to_mark_deleted: Vec::new(),
    };
    if g.to_unlink.is_empty() {
        return Ok(());
    }
    info!("Cleaning {} stale reserved sample files", g.to_unlink.len());
    collect_garbage(db, dir, &mut g);
    if !g.is_empty() {
        bail_t!(
            Internal,
            "startup cleanup incomplete: {} files not unlinked, {} reservations not cleared",
            g.to_unlink.len(),
            g.to_mark_deleted.len()
        );
    }
    Ok(())
}

/// Gets rows to delete to bring a camera's disk usage within bounds.
fn get_rows_to_delete(
    db: &MutexGuard<db::LockedDatabase>,
    camera_id: i32,
    camera: &db::Camera,
    extra_bytes_needed: i64,
    to_delete: &mut Vec<db::ListOldestSampleFilesRow>,
) -> Result<(), Error> {
    let bytes_needed = camera.sample_file_bytes + extra_bytes_needed - camera.retain_bytes;
    if bytes_needed <= 0 {
        debug!("{}: have remaining quota of {}", camera.short_name, -bytes_needed);
        return Ok(());
    }
    let mut bytes_to_delete = 0;
    let mut n = 0;
    db.list_oldest_sample_files(camera_id, |row| {
        bytes_to_delete += i64::from(row.sample_file_bytes);
        to_delete.push(row);
        n += 1;
        bytes_needed > bytes_to_delete // continue as long as more deletions are needed.
    })?;
    if bytes_needed > bytes_to_delete {
        bail_t!(
            ResourceExhausted,
            "{}: couldn't find enough files to delete: {} left.",
            camera.short_name,
            bytes_needed - bytes_to_delete
        );
    }
    info!(
        "{}: deleting {} bytes in {} recordings ({} bytes needed)",
        camera.short_name, bytes_to_delete, n, bytes_needed
    );
    Ok(())
}

/// Attempts to unlink all queued files, then syncs the directory and clears
/// reservations for files known to be gone. Failures are logged and the
/// entries stay queued for a later retry.
pub fn collect_garbage(db: &Database, dir: &SampleFileDir, g: &mut Garbage) {
    try_unlink(dir, g);
    if g.to_mark_deleted.is_empty() {
        return;
    }
    if let Err(e) = dir.sync() {
        warn!("Unable to sync sample file dir: {}", e);
        return;
    }
    let r = (|| -> Result<(), Error> {
        let mut l = db.lock();
        let mut tx = l.tx()?;
        tx.mark_sample_files_deleted(&g.to_mark_deleted)?;
        tx.commit()?;
        Ok(())
    })();
    match r {
        Ok(()) => g.to_mark_deleted.clear(),
        Err(e) => warn!("Unable to mark sample files deleted: {}", e),
    }
}

/// Tries to unlink all the uuids in `g.to_unlink`. Any which can't be
/// unlinked will be retained in the vec; the rest move to
/// `g.to_mark_deleted`.
fn try_unlink(dir: &SampleFileDir, g: &mut Garbage) {
    let to_mark_deleted = &mut g.to_mark_deleted;
    g.to_unlink.retain(|&uuid| {
        if let Err(e) = dir.unlink(uuid) {
            if e.kind() == io::ErrorKind::NotFound {
                warn!("Sample file {} already deleted!", uuid);
                to_mark_deleted.push(uuid);
                false
            } else {
                warn!("Unable to unlink {}: {}", uuid, e);
                true
            }
        } else {
            to_mark_deleted.push(uuid);
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{Duration, Time, TIME_UNITS_PER_SEC};
    use crate::testutil::{self, TestDb, TEST_CAMERA_ID};

    /// Writes a sample file of the given size and inserts a recording row
    /// referencing it.
    fn add_recording_with_file(tdb: &TestDb, start_sec: i64, bytes: i32) -> Uuid {
        let uuid = {
            let mut l = tdb.db.lock();
            let mut tx = l.tx().unwrap();
            let uuid = tx.reserve_sample_file().unwrap();
            tx.commit().unwrap();
            uuid
        };
        let mut w = tdb.dir.create_writer(uuid).unwrap();
        w.write(&vec![0u8; bytes as usize]).unwrap();
        let (sha1, len) = w.close().unwrap();
        assert_eq!(i64::from(bytes), len);
        tdb.dir.sync().unwrap();

        let mut e = crate::recording::SampleIndexEncoder::new();
        e.add_sample(TIME_UNITS_PER_SEC as i32, bytes, true);
        let start = Time(start_sec * TIME_UNITS_PER_SEC);
        let mut l = tdb.db.lock();
        let vse_id = l
            .insert_video_sample_entry(1920, 1080, [0u8; 100].to_vec(), "avc1.000000".to_owned())
            .unwrap();
        let mut tx = l.tx().unwrap();
        tx.insert_recording(&db::RecordingToInsert {
            camera_id: TEST_CAMERA_ID,
            sample_file_bytes: bytes,
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
        uuid
    }

    /// Starting with four recordings of sizes 1, 3, 5, and 7 totalling 16
    /// for a camera with retain_bytes = 8, retention should delete the three
    /// oldest (freeing 9), leaving just the 7-byte recording.
    #[test]
    fn test_make_room() {
        testutil::init();
        let tdb = TestDb::new_with_retain(8);
        let u1 = add_recording_with_file(&tdb, 1430006400, 1);
        let u2 = add_recording_with_file(&tdb, 1430006401, 3);
        let u3 = add_recording_with_file(&tdb, 1430006402, 5);
        let u4 = add_recording_with_file(&tdb, 1430006403, 7);
        assert_eq!(16, tdb.db.lock().cameras_by_id()[&TEST_CAMERA_ID].sample_file_bytes);

        let mut g = Garbage::default();
        make_room(&tdb.db, &tdb.dir, TEST_CAMERA_ID, 0, &mut g).unwrap();
        assert!(g.is_empty());

        {
            let l = tdb.db.lock();
            let camera = &l.cameras_by_id()[&TEST_CAMERA_ID];
            assert_eq!(7, camera.sample_file_bytes);
            let mut rows = Vec::new();
            l.list_oldest_sample_files(TEST_CAMERA_ID, |row| {
                rows.push(row);
                true
            })
            .unwrap();
            assert_eq!(1, rows.len());
            assert_eq!(u4, rows[0].uuid);

            // Reservations were cleared after the successful unlink.
            assert_eq!(l.list_reserved_sample_files().unwrap(), &[] as &[uuid::Uuid]);
        }

        // The deleted files are gone; the survivor remains.
        for u in &[u1, u2, u3] {
            tdb.dir.open_sample_file(*u).unwrap_err();
        }
        tdb.dir.open_sample_file(u4).unwrap();

        // A second pass has nothing to do.
        make_room(&tdb.db, &tdb.dir, TEST_CAMERA_ID, 0, &mut g).unwrap();
        assert_eq!(7, tdb.db.lock().cameras_by_id()[&TEST_CAMERA_ID].sample_file_bytes);
    }

    /// Stale reservations (as left by a crash) should be cleaned at startup:
    /// present files unlinked, reservations cleared either way.
    #[test]
    fn test_delete_stale_reservations() {
        testutil::init();
        let tdb = TestDb::new();
        let (with_file, without_file) = {
            let mut l = tdb.db.lock();
            let mut tx = l.tx().unwrap();
            let a = tx.reserve_sample_file().unwrap();
            let b = tx.reserve_sample_file().unwrap();
            tx.commit().unwrap();
            (a, b)
        };
        let mut w = tdb.dir.create_writer(with_file).unwrap();
        w.write(b"orphaned").unwrap();
        w.close().unwrap();

        delete_stale_reservations(&tdb.db, &tdb.dir).unwrap();
        assert_eq!(tdb.db.lock().list_reserved_sample_files().unwrap(), &[] as &[uuid::Uuid]);
        tdb.dir.open_sample_file(with_file).unwrap_err();
        tdb.dir.open_sample_file(without_file).unwrap_err();
    }
}
