// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Shared test infrastructure.

use crate::db;
use crate::dir;
use crate::recording::{self, Duration, Time, TIME_UNITS_PER_SEC};
use lazy_static::lazy_static;
use rusqlite::named_params;
use std::env;
use std::sync::{Arc, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

lazy_static! {
    pub static ref TEST_CAMERA_UUID: Uuid =
        Uuid::parse_str("ce2d9bc2-0cd3-4204-9324-7b5ccb07183c").unwrap();
}

/// id of the camera created by `TestDb::new` below.
pub const TEST_CAMERA_ID: i32 = 1;

/// Performs global initialization for tests.
///    * set up logging. (Note the output can be confusing unless
///      `RUST_TEST_THREADS=1` is set in the program's environment prior to
///      running.)
///    * set `TZ=America/Los_Angeles` so that tests that care about calendar
///      time get the expected results regardless of machine setup.
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
        env::set_var("TZ", "America/Los_Angeles");
        time::tzset();
    });
}

pub struct TestDb {
    pub db: Arc<db::Database>,
    pub dir: Arc<dir::SampleFileDir>,
    pub tmpdir: tempfile::TempDir,
}

impl TestDb {
    /// Creates a test database with one camera and a scratch sample file
    /// directory.
    pub fn new() -> TestDb {
        TestDb::new_with_retain(1048576)
    }

    pub fn new_with_retain(retain_bytes: i64) -> TestDb {
        let tmpdir = tempfile::TempDir::new().unwrap();

        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema).unwrap();
        let uuid_bytes = &TEST_CAMERA_UUID.as_bytes()[..];
        conn.execute(
            r#"
            insert into camera (uuid,  short_name,  description,  host,  username,  password,
                                main_rtsp_path,  sub_rtsp_path,  retain_bytes)
                        values (:uuid, :short_name, :description, :host, :username, :password,
                                :main_rtsp_path, :sub_rtsp_path, :retain_bytes)
            "#,
            named_params! {
                ":uuid": uuid_bytes,
                ":short_name": "test camera",
                ":description": "",
                ":host": "test-camera",
                ":username": "foo",
                ":password": "bar",
                ":main_rtsp_path": "/main",
                ":sub_rtsp_path": "/sub",
                ":retain_bytes": retain_bytes,
            },
        )
        .unwrap();
        assert_eq!(i64::from(TEST_CAMERA_ID), conn.last_insert_rowid());
        let db = Arc::new(db::Database::new(conn).unwrap());
        let path = tmpdir.path().to_str().unwrap().to_owned();
        let dir = dir::SampleFileDir::new(&path).unwrap();
        TestDb { db, dir, tmpdir }
    }

    /// Inserts a recording row (with no backing sample file), returning the
    /// `ListRecordingsRow` as a fresh query would see it.
    pub fn create_recording(&self, r: &db::RecordingToInsert) -> db::ListRecordingsRow {
        let id;
        {
            let mut l = self.db.lock();
            let mut tx = l.tx().unwrap();
            tx.bypass_reservation_for_testing = true;
            id = tx.insert_recording(r).unwrap();
            tx.commit().unwrap();
        }
        let mut row = None;
        let all_time = Time(i64::min_value())..Time(i64::max_value());
        self.db
            .lock()
            .list_recordings(r.camera_id, &all_time, |it| {
                if it.id == id {
                    row = Some(it);
                }
                Ok(())
            })
            .unwrap();
        row.expect("inserted recording should be listed")
    }

    /// As `create_recording`, but builds the row from an encoder's output,
    /// with a fixed start time and a dummy video sample entry.
    pub fn insert_recording_from_encoder(
        &self,
        encoder: recording::SampleIndexEncoder,
    ) -> db::ListRecordingsRow {
        const START_TIME: Time = Time(1430006400i64 * TIME_UNITS_PER_SEC);
        self.insert_recording_from_encoder_at(encoder, START_TIME)
    }

    pub fn insert_recording_from_encoder_at(
        &self,
        encoder: recording::SampleIndexEncoder,
        start: Time,
    ) -> db::ListRecordingsRow {
        let vse_id = self
            .db
            .lock()
            .insert_video_sample_entry(1920, 1080, [0u8; 100].to_vec(), "avc1.000000".to_owned())
            .unwrap();
        self.create_recording(&db::RecordingToInsert {
            camera_id: TEST_CAMERA_ID,
            sample_file_bytes: encoder.sample_file_bytes,
            time: start..start + Duration(i64::from(encoder.total_duration_90k)),
            local_time_delta: Duration(0),
            video_samples: encoder.video_samples,
            video_sync_samples: encoder.video_sync_samples,
            video_sample_entry_id: vse_id,
            sample_file_uuid: Uuid::new_v4(),
            video_index: encoder.video_index,
            sample_file_sha1: [0u8; 20],
        })
    }
}
