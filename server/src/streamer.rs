// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The per-camera recording pipeline.
//!
//! One worker (OS thread) per camera pulls packets from the camera's input
//! stream and turns them into durable, indexed recordings. The worker
//! validates timestamps, discards leading non-key frames, rotates to a new
//! recording at the first key frame past each wall-clock boundary, enforces
//! the camera's retention quota before opening each new file, and commits
//! each finished recording to the database only after the file and directory
//! have been synced.

use crate::h264;
use crate::stream;
use base::clock::{Clocks, TimerGuard};
use base::{bail_t, format_err_t, Error, ErrorKind, ResultExt};
use db::{dir, recording, retention};
use std::result::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use url::Url;

pub static ROTATE_INTERVAL_SEC: i64 = 60;

/// Common state that can be used by multiple `Streamer` instances.
///
/// `'a` is the lifetime of the opener reference, which each `Streamer`
/// retains; everything else is cloned into the streamer. The production
/// opener is a `'static` constant so streamers can move into their threads.
pub struct Environment<'a, 'b, C, O>
where
    C: Clocks + Clone,
    O: stream::Opener,
{
    pub clocks: &'b C,
    pub opener: &'a O,
    pub db: &'b Arc<db::Database>,
    pub dir: &'b Arc<dir::SampleFileDir>,
    pub shutdown: &'b Arc<AtomicBool>,
}

pub struct Streamer<'a, C, O>
where
    C: Clocks + Clone,
    O: stream::Opener,
{
    shutdown: Arc<AtomicBool>,

    // State below is only used by the thread in `run`.
    rotate_offset_sec: i64,
    rotate_interval_sec: i64,
    db: Arc<db::Database>,
    dir: Arc<dir::SampleFileDir>,
    clocks: C,
    opener: &'a O,
    camera_id: i32,
    short_name: String,
    url: Url,
    redacted_url: String,
    username: String,
    password: String,
    garbage: retention::Garbage,
}

/// A sample which has been written to disk but not yet added to the index.
/// Index writes are one sample behind disk writes because the duration of a
/// sample is the difference between its pts and the next sample's pts.
#[derive(Copy, Clone)]
struct UnindexedSample {
    pts: i64,
    len: i32,
    is_key: bool,
}

/// State for a recording in progress.
struct CurrentRecording {
    uuid: uuid::Uuid,
    w: dir::Writer,
    e: recording::SampleIndexEncoder,
    start: recording::Time,
    local_time_delta: recording::Duration,
    video_sample_entry_id: i32,
    unindexed: Option<UnindexedSample>,
}

impl<'a, C, O> Streamer<'a, C, O>
where
    C: 'a + Clocks + Clone,
    O: 'a + stream::Opener,
{
    pub fn new<'b>(
        env: &Environment<'a, 'b, C, O>,
        camera: &db::Camera,
        rotate_offset_sec: i64,
        rotate_interval_sec: i64,
    ) -> Result<Self, Error> {
        let url = Url::parse(&format!("rtsp://{}{}", camera.host, camera.main_rtsp_path))
            .err_kind(ErrorKind::InvalidArgument)?;
        let redacted_url = url.to_string();
        Ok(Streamer {
            shutdown: env.shutdown.clone(),
            rotate_offset_sec,
            rotate_interval_sec,
            db: env.db.clone(),
            dir: env.dir.clone(),
            clocks: env.clocks.clone(),
            opener: env.opener,
            camera_id: camera.id,
            short_name: camera.short_name.clone(),
            url,
            redacted_url,
            username: camera.username.clone(),
            password: camera.password.clone(),
            garbage: retention::Garbage::default(),
        })
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn run(&mut self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.run_once() {
                let sleep_time = time::Duration::seconds(1);
                warn!(
                    "{}: sleeping for {:?} after error: {}",
                    self.short_name, sleep_time, e
                );
                self.clocks.sleep(sleep_time);
            }
        }
        info!("{}: shutting down", self.short_name);
    }

    fn run_once(&mut self) -> Result<(), Error> {
        info!("{}: Opening input: {}", self.short_name, self.redacted_url);

        let mut options = retina::client::SessionOptions::default();
        if !self.username.is_empty() {
            options = options.creds(Some(retina::client::Credentials {
                username: self.username.clone(),
                password: self.password.clone(),
            }));
        }
        let (extra, mut stream) = {
            let _t = TimerGuard::new(&self.clocks, || format!("opening {}", self.redacted_url));
            self.opener
                .open(self.short_name.clone(), self.url.clone(), options)?
        };
        let video_sample_entry_id = {
            let _t = TimerGuard::new(&self.clocks, || "inserting video sample entry");
            self.db.lock().insert_video_sample_entry(
                extra.width,
                extra.height,
                extra.sample_entry.clone(),
                extra.rfc6381_codec.clone(),
            )?
        };
        debug!(
            "{}: video_sample_entry_id={}",
            self.short_name, video_sample_entry_id
        );

        let mut cur: Option<CurrentRecording> = None;
        let r = self.stream_packets(&mut *stream, &extra, video_sample_entry_id, &mut cur);

        // Finalize any recording in progress. With no following packet, the
        // last sample's duration is unknown (stored as zero).
        if let Some(cur) = cur.take() {
            let clocks = self.clocks.clone();
            let _t = TimerGuard::new(&clocks, || "closing writer");
            self.close_recording(cur, None);
        }
        r
    }

    /// Pulls packets until shutdown or error. A recording in progress is
    /// left in `cur` for the caller to finalize.
    fn stream_packets(
        &mut self,
        stream: &mut dyn stream::Stream,
        extra: &h264::ExtraData,
        video_sample_entry_id: i32,
        cur: &mut Option<CurrentRecording>,
    ) -> Result<(), Error> {
        let mut seen_key_frame = false;
        let mut prev_pts: Option<i64> = None;

        // The base of the recording timeline: the wall clock time of the
        // input's first key frame, minus that frame's pts. Each recording's
        // start time is this base plus its first packet's pts, so times are
        // continuous across rotations.
        let mut stream_base: Option<recording::Time> = None;

        // Seconds since epoch at which to next rotate, if a recording is
        // open.
        let mut rotate: Option<i64> = None;

        let mut transformed = Vec::new();
        while !self.shutdown.load(Ordering::SeqCst) {
            let pkt = {
                let _t = TimerGuard::new(&self.clocks, || "getting next packet");
                stream.next()?
            };
            let pts = pkt.pts.ok_or_else(|| format_err_t!(InvalidArgument, "packet with no pts"))?;
            let dts = pkt.dts.ok_or_else(|| format_err_t!(InvalidArgument, "packet with no dts"))?;
            if pts != dts {
                bail_t!(InvalidArgument, "pts {} != dts {}; B-frames are not supported", pts, dts);
            }
            if let Some(prev) = prev_pts {
                if pts <= prev {
                    bail_t!(InvalidArgument, "Rejecting non-increasing pts={} (previous pts={})", pts, prev);
                }
            }
            prev_pts = Some(pts);
            if !seen_key_frame && !pkt.is_key {
                continue;
            } else if !seen_key_frame {
                debug!("{}: have first key frame", self.short_name);
                seen_key_frame = true;
            }

            let frame_realtime = self.clocks.realtime();
            let local_time = recording::Time::new(frame_realtime);
            if let Some(r) = rotate {
                if frame_realtime.sec >= r && pkt.is_key {
                    trace!("{}: closing on normal rotation", self.short_name);
                    let clocks = self.clocks.clone();
                    let _t = TimerGuard::new(&clocks, || "closing writer");
                    let c = cur.take().expect("rotate implies an open recording");
                    self.close_recording(c, Some(pts));
                    rotate = None;
                }
            }
            if cur.is_none() {
                // Delete old recordings before any new one is written, then
                // reserve a uuid and open the new file.
                retention::make_room(&self.db, &self.dir, self.camera_id, 0, &mut self.garbage)?;
                let uuid = {
                    let _t = TimerGuard::new(&self.clocks, || "reserving uuid");
                    let mut l = self.db.lock();
                    let mut tx = l.tx()?;
                    let u = tx.reserve_sample_file()?;
                    tx.commit()?;
                    u
                };
                let w = {
                    let _t = TimerGuard::new(&self.clocks, || "creating writer");
                    self.dir.create_writer(uuid)?
                };
                let base = *stream_base.get_or_insert(local_time - recording::Duration(pts));
                let start = base + recording::Duration(pts);
                *cur = Some(CurrentRecording {
                    uuid,
                    w,
                    e: recording::SampleIndexEncoder::new(),
                    start,
                    local_time_delta: local_time - start,
                    video_sample_entry_id,
                    unindexed: None,
                });

                // Compute the next rotation boundary in wall time.
                let sec = frame_realtime.sec;
                let r = sec - (sec % self.rotate_interval_sec) + self.rotate_offset_sec;
                rotate = Some(r + if r <= sec { self.rotate_interval_sec } else { 0 });
            }

            let c = cur.as_mut().expect("recording was just opened");
            if let Some(unindexed) = c.unindexed.take() {
                // The duration of the previous sample is now known.
                c.e.add_sample((pts - unindexed.pts) as i32, unindexed.len, unindexed.is_key);
            }
            let data: &[u8] = if extra.need_transform {
                h264::transform_sample_data(&pkt.data, &mut transformed)?;
                &transformed
            } else {
                &pkt.data
            };
            {
                let _t = TimerGuard::new(&self.clocks, || format!("writing {} bytes", data.len()));
                c.w.write(data)?;
            }
            c.unindexed = Some(UnindexedSample {
                pts,
                len: data.len() as i32,
                is_key: pkt.is_key,
            });
        }
        Ok(())
    }

    /// Finalizes a recording: adds the final sample (using `next_pts` for
    /// its duration if known, zero otherwise), syncs and closes the file,
    /// and commits the row. Failures along the way leave the file queued
    /// for unlink; the reservation keeps the uuid safe until then.
    fn close_recording(&mut self, c: CurrentRecording, next_pts: Option<i64>) {
        let CurrentRecording {
            uuid,
            w,
            mut e,
            start,
            local_time_delta,
            video_sample_entry_id,
            unindexed,
        } = c;
        let unindexed = match unindexed {
            None => {
                // No packets were written; discard the empty file.
                info!("{}: discarding recording {} with no packets", self.short_name, uuid);
                self.garbage.to_unlink.push(uuid);
                retention::collect_garbage(&self.db, &self.dir, &mut self.garbage);
                return;
            }
            Some(u) => u,
        };
        let last_duration = match next_pts {
            None => 0,
            Some(p) => (p - unindexed.pts) as i32,
        };
        e.add_sample(last_duration, unindexed.len, unindexed.is_key);
        match w.close() {
            Err(err) => {
                warn!(
                    "{}: discarding recording {} due to write error: {}",
                    self.short_name, uuid, err
                );
                self.garbage.to_unlink.push(uuid);
            }
            Ok((sha1, bytes)) => {
                let r = (|| -> Result<(), Error> {
                    // The file and its contents must be durable before the
                    // database references them.
                    self.dir.sync().err_kind(ErrorKind::Internal)?;
                    let mut l = self.db.lock();
                    let mut tx = l.tx()?;
                    tx.insert_recording(&db::RecordingToInsert {
                        camera_id: self.camera_id,
                        sample_file_bytes: e.sample_file_bytes,
                        time: start
                            ..start + recording::Duration(i64::from(e.total_duration_90k)),
                        local_time_delta,
                        video_samples: e.video_samples,
                        video_sync_samples: e.video_sync_samples,
                        video_sample_entry_id,
                        sample_file_uuid: uuid,
                        video_index: e.video_index.clone(),
                        sample_file_sha1: sha1,
                    })?;
                    tx.commit()?;
                    Ok(())
                })();
                match r {
                    Err(err) => {
                        warn!(
                            "{}: discarding recording {} due to insert error: {}",
                            self.short_name, uuid, err
                        );
                        self.garbage.to_unlink.push(uuid);
                    }
                    Ok(()) => {
                        info!(
                            "{}: wrote recording {}: {} bytes, {} samples, [{}, {})",
                            self.short_name,
                            uuid,
                            bytes,
                            e.video_samples,
                            start,
                            start + recording::Duration(i64::from(e.total_duration_90k))
                        );
                    }
                }
            }
        }
        retention::collect_garbage(&self.db, &self.dir, &mut self.garbage);
    }
}
