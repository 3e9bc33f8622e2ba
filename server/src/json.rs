// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! JSON types for the web API.

use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ListCameras<'a> {
    // Use a custom serializer which presents the map's values as a sequence.
    #[serde(serialize_with = "ListCameras::serialize_cameras")]
    pub cameras: &'a BTreeMap<i32, db::Camera>,
}

impl<'a> ListCameras<'a> {
    /// Serializes cameras as a list (rather than a map), wrapping each
    /// camera in the `Camera` type to tweak the data returned.
    fn serialize_cameras<S>(
        cameras: &BTreeMap<i32, db::Camera>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(cameras.len()))?;
        for c in cameras.values() {
            seq.serialize_element(&Camera::new(c, false))?;
        }
        seq.end()
    }
}

/// JSON serialization wrapper for a single camera when processing `/` and
/// `/cameras/<uuid>/`.
#[derive(Debug, Serialize)]
pub struct Camera<'a> {
    pub uuid: Uuid,
    pub short_name: &'a str,
    pub description: &'a str,
    pub retain_bytes: i64,

    /// -1 when the camera has no recordings.
    pub min_start_time_90k: i64,

    /// -1 when the camera has no recordings.
    pub max_end_time_90k: i64,
    pub total_duration_90k: i64,
    pub total_sample_file_bytes: i64,

    #[serde(serialize_with = "Camera::serialize_days")]
    pub days: Option<&'a BTreeMap<db::CameraDayKey, db::CameraDayValue>>,
}

impl<'a> Camera<'a> {
    pub fn new(c: &'a db::Camera, include_days: bool) -> Self {
        Camera {
            uuid: c.uuid,
            short_name: &c.short_name,
            description: &c.description,
            retain_bytes: c.retain_bytes,
            min_start_time_90k: c.range.as_ref().map(|r| r.start.0).unwrap_or(-1),
            max_end_time_90k: c.range.as_ref().map(|r| r.end.0).unwrap_or(-1),
            total_duration_90k: c.duration.0,
            total_sample_file_bytes: c.sample_file_bytes,
            days: if include_days { Some(&c.days) } else { None },
        }
    }

    fn serialize_days<S>(
        days: &Option<&BTreeMap<db::CameraDayKey, db::CameraDayValue>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let days = match days {
            Some(d) => d,
            None => return serializer.serialize_none(),
        };
        let mut map = serializer.serialize_map(Some(days.len()))?;
        for (k, v) in *days {
            map.serialize_key(k.as_ref())?;
            let bounds = k.bounds();
            map.serialize_value(&CameraDayValue {
                start_time_90k: bounds.start.0,
                end_time_90k: bounds.end.0,
                total_duration_90k: v.duration.0,
            })?;
        }
        map.end()
    }
}

#[derive(Debug, Serialize)]
struct CameraDayValue {
    pub start_time_90k: i64,
    pub end_time_90k: i64,
    pub total_duration_90k: i64,
}

#[derive(Debug, Serialize)]
pub struct ListRecordings {
    pub recordings: Vec<Recording>,
}

#[derive(Debug, Serialize)]
pub struct Recording {
    pub start_time_90k: i64,
    pub end_time_90k: i64,
    pub sample_file_bytes: i64,
    pub video_samples: i64,
    pub video_sync_samples: i64,
    pub video_sample_entry_width: u16,
    pub video_sample_entry_height: u16,
    pub video_sample_entry_sha1: String,
}
