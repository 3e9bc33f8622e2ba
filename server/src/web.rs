// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The HTTP interface: camera listings and `.mp4` serving.

use crate::json;
use crate::mp4;
use crate::resource;
use base::{strutil, ErrorKind};
use db::dir::SampleFileDir;
use db::recording::Time;
use http::{header, Request, Response, StatusCode};
use hyper::Body;
use std::cmp;
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;
use url::form_urlencoded;
use uuid::Uuid;

#[derive(Debug, Eq, PartialEq)]
enum Path {
    CamerasList,            // "/" or "/cameras/"
    Camera(Uuid),           // "/cameras/<uuid>/"
    CameraRecordings(Uuid), // "/cameras/<uuid>/recordings"
    CameraViewMp4(Uuid),    // "/cameras/<uuid>/view.mp4"
    NotFound,
}

fn decode_path(path: &str) -> Path {
    if path == "/" {
        return Path::CamerasList;
    }
    if !path.starts_with("/cameras/") {
        return Path::NotFound;
    }
    let path = &path["/cameras/".len()..];
    if path.is_empty() {
        return Path::CamerasList;
    }
    let slash = match path.find('/') {
        None => return Path::NotFound,
        Some(s) => s,
    };
    let (uuid, path) = path.split_at(slash);

    let uuid = match Uuid::parse_str(uuid) {
        Ok(u) => u,
        Err(_) => return Path::NotFound,
    };
    match path {
        "/" => Path::Camera(uuid),
        "/recordings" => Path::CameraRecordings(uuid),
        "/view.mp4" => Path::CameraViewMp4(uuid),
        _ => Path::NotFound,
    }
}

fn is_json(req: &Request<hyper::Body>) -> bool {
    req.headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false)
}

/// An error to propagate to the HTTP client, with a status code.
#[derive(Debug)]
struct HttpError {
    status: StatusCode,
    msg: String,
}

impl From<base::Error> for HttpError {
    /// Maps an error's kind to a HTTP status, per the taxonomy in
    /// `base::ErrorKind`: bad input is the client's fault, everything else
    /// the server's.
    fn from(e: base::Error) -> Self {
        let status = match e.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidArgument | ErrorKind::OutOfRange => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        HttpError {
            status,
            msg: e.to_string(),
        }
    }
}

fn internal<E: std::fmt::Display>(e: E) -> HttpError {
    HttpError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        msg: e.to_string(),
    }
}

fn bad_request<S: Into<String>>(msg: S) -> HttpError {
    HttpError {
        status: StatusCode::BAD_REQUEST,
        msg: msg.into(),
    }
}

fn not_found<S: Into<String>>(msg: S) -> HttpError {
    HttpError {
        status: StatusCode::NOT_FOUND,
        msg: msg.into(),
    }
}

fn plain_response<B: Into<Body>>(status: StatusCode, body: B) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body.into())
        .expect("plain response should be valid")
}

fn content_response(content_type: &'static str, body: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(body.into())
        .expect("content response should be valid")
}

/// Escapes `<` and `&` for interpolation into HTML text.
struct HtmlEscaped<'a>(&'a str);

impl<'a> fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut last_end = 0;
        for (start, part) in self.0.match_indices(|c| c == '<' || c == '&') {
            f.write_str(&self.0[last_end..start])?;
            f.write_str(if part == "<" { "&lt;" } else { "&amp;" })?;
            last_end = start + 1;
        }
        f.write_str(&self.0[last_end..])
    }
}

const BINARY_PREFIXES: &[&str] = &[" ", " Ki", " Mi", " Gi", " Ti", " Pi", " Ei"];
const DECIMAL_PREFIXES: &[&str] = &[" ", " k", " M", " G", " T", " P", " E"];

struct Humanized(i64);

impl Humanized {
    fn do_fmt(&self, base: f32, prefixes: &[&str], f: &mut fmt::Formatter) -> fmt::Result {
        let mut n = self.0 as f32;
        let mut i = 0;
        while n >= base && i < prefixes.len() - 1 {
            n /= base;
            i += 1;
        }
        write!(f, "{:.1}{}", n, prefixes[i])
    }
}

impl fmt::Display for Humanized {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.do_fmt(1000., DECIMAL_PREFIXES, f)
    }
}

impl fmt::Binary for Humanized {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.do_fmt(1024., BINARY_PREFIXES, f)
    }
}

struct HumanizedTimestamp(Option<Time>);

impl fmt::Display for HumanizedTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            None => f.write_str("n/a"),
            Some(t) => {
                let tm = time::at(time::Timespec {
                    sec: t.unix_seconds(),
                    nsec: 0,
                });
                write!(
                    f,
                    "{}",
                    tm.strftime("%a, %d %b %Y %H:%M:%S %Z").map_err(|_| fmt::Error)?
                )
            }
        }
    }
}

pub struct Service {
    db: Arc<db::Database>,
    dir: Arc<SampleFileDir>,
}

impl Service {
    pub fn new(db: Arc<db::Database>, dir: Arc<SampleFileDir>) -> Self {
        Service { db, dir }
    }

    pub async fn serve(
        self: Arc<Self>,
        req: Request<hyper::Body>,
    ) -> Result<Response<Body>, std::convert::Infallible> {
        let path = req.uri().path().to_owned();
        let query = req.uri().query().unwrap_or("").to_owned();
        let res = match decode_path(&path) {
            Path::CamerasList => self.list_cameras(&req),
            Path::Camera(uuid) => self.camera(uuid, &req),
            Path::CameraRecordings(uuid) => self.camera_recordings(uuid, &query, &req),
            Path::CameraViewMp4(uuid) => self.camera_view_mp4(uuid, &query, &req),
            Path::NotFound => Err(not_found("path not understood")),
        };
        Ok(res.unwrap_or_else(|e| {
            if e.status == StatusCode::INTERNAL_SERVER_ERROR {
                warn!("Error handling request {}: {}", path, e.msg);
            }
            plain_response(e.status, e.msg)
        }))
    }

    fn list_cameras(&self, req: &Request<hyper::Body>) -> Result<Response<Body>, HttpError> {
        let db = self.db.lock();
        if is_json(req) {
            let buf = serde_json::to_vec(&json::ListCameras {
                cameras: db.cameras_by_id(),
            })
            .map_err(internal)?;
            return Ok(content_response("application/json", buf));
        }
        let mut buf = Vec::new();
        buf.extend_from_slice(
            b"<!DOCTYPE html>\n\
              <html>\n\
              <head>\n\
              <title>Camera list</title>\n\
              <meta http-equiv=\"Content-Language\" content=\"en\">\n\
              <style type=\"text/css\">\n\
              .header { background-color: #ddd; }\n\
              td { padding-right: 3em; }\n\
              </style>\n\
              </head>\n\
              <body>\n\
              <table>\n",
        );
        for row in db.cameras_by_id().values() {
            write!(
                &mut buf,
                "<tr class=header><td colspan=2>\
                 <a href=\"/cameras/{}/\">{}</a></td></tr>\n\
                 <tr><td>description</td><td>{}</td></tr>\n\
                 <tr><td>space</td><td>{:b}B / {:b}B ({:.1}%)</td></tr>\n\
                 <tr><td>uuid</td><td>{}</td></tr>\n\
                 <tr><td>oldest recording</td><td>{}</td></tr>\n\
                 <tr><td>newest recording</td><td>{}</td></tr>\n\
                 <tr><td>total duration</td><td>{}</td></tr>\n",
                row.uuid,
                HtmlEscaped(&row.short_name),
                HtmlEscaped(&row.description),
                Humanized(row.sample_file_bytes),
                Humanized(row.retain_bytes),
                100. * row.sample_file_bytes as f32 / row.retain_bytes as f32,
                row.uuid,
                HumanizedTimestamp(row.range.as_ref().map(|r| r.start)),
                HumanizedTimestamp(row.range.as_ref().map(|r| r.end)),
                row.duration
            )
            .map_err(internal)?;
        }
        buf.extend_from_slice(b"</table>\n</body>\n</html>\n");
        Ok(content_response("text/html; charset=utf-8", buf))
    }

    fn camera(&self, uuid: Uuid, req: &Request<hyper::Body>) -> Result<Response<Body>, HttpError> {
        let db = self.db.lock();
        let camera = db.get_camera(uuid).ok_or_else(|| not_found("no such camera"))?;
        if is_json(req) {
            let buf = serde_json::to_vec(&json::Camera::new(camera, true))
                .map_err(internal)?;
            return Ok(content_response("application/json", buf));
        }
        let mut buf = Vec::new();
        write!(
            &mut buf,
            "<!DOCTYPE html>\n\
             <html>\n\
             <head>\n\
             <title>{0}</title>\n\
             <meta http-equiv=\"Content-Language\" content=\"en\">\n\
             <style type=\"text/css\">\n\
             tr:not(:first-child):hover {{ background-color: #ddd; }}\n\
             th, td {{ padding: 0.5ex 1.5em; text-align: right; }}\n\
             </style>\n\
             </head>\n\
             <body>\n\
             <h1>{0}</h1>\n\
             <p>{1}</p>\n\
             <table>\n\
             <tr><th>day</th><th>recordings</th><th>duration</th></tr>\n",
            HtmlEscaped(&camera.short_name),
            HtmlEscaped(&camera.description)
        )
        .map_err(internal)?;
        for (day, value) in &camera.days {
            let bounds = day.bounds();
            write!(
                &mut buf,
                "<tr><td><a href=\"view.mp4?start_time_90k={}&end_time_90k={}\">{}</a></td>\
                 <td>{}</td><td>{}</td></tr>\n",
                bounds.start.0,
                bounds.end.0,
                day.as_ref(),
                value.recordings,
                value.duration
            )
            .map_err(internal)?;
        }
        buf.extend_from_slice(b"</table>\n</body>\n</html>\n");
        Ok(content_response("text/html; charset=utf-8", buf))
    }

    fn camera_recordings(
        &self,
        uuid: Uuid,
        query: &str,
        req: &Request<hyper::Body>,
    ) -> Result<Response<Body>, HttpError> {
        if !is_json(req) {
            return Err(HttpError {
                status: StatusCode::NOT_ACCEPTABLE,
                msg: "only available for JSON requests".to_owned(),
            });
        }
        let range = get_optional_range(query)?;
        let mut out = json::ListRecordings {
            recordings: Vec::new(),
        };
        {
            let db = self.db.lock();
            let camera = db.get_camera(uuid).ok_or_else(|| not_found("no such camera"))?;
            db.list_camera_recordings(camera.id, &range, |row| {
                out.recordings.push(json::Recording {
                    start_time_90k: row.start.0,
                    end_time_90k: row.start.0 + i64::from(row.duration_90k),
                    sample_file_bytes: i64::from(row.sample_file_bytes),
                    video_samples: i64::from(row.video_samples),
                    video_sync_samples: i64::from(row.video_sync_samples),
                    video_sample_entry_width: row.video_sample_entry.width,
                    video_sample_entry_height: row.video_sample_entry.height,
                    video_sample_entry_sha1: strutil::hex(&row.video_sample_entry.sha1),
                });
                Ok(())
            })?;
        }
        let buf = serde_json::to_vec(&out).map_err(internal)?;
        Ok(content_response("application/json", buf))
    }

    fn camera_view_mp4(
        &self,
        uuid: Uuid,
        query: &str,
        req: &Request<hyper::Body>,
    ) -> Result<Response<Body>, HttpError> {
        let (mut start, mut end, mut include_ts) = (None, None, false);
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match &*key {
                "start_time_90k" => {
                    start = Some(i64::from_str(&value).map_err(|_| {
                        bad_request(format!("invalid start_time_90k {value:?}"))
                    })?)
                }
                "end_time_90k" => {
                    end = Some(
                        i64::from_str(&value)
                            .map_err(|_| bad_request(format!("invalid end_time_90k {value:?}")))?,
                    )
                }
                "ts" => include_ts = value == "true",
                _ => return Err(bad_request(format!("parameter {key} not understood"))),
            }
        }
        let (start, end) = match (start, end) {
            (Some(s), Some(e)) if s < e => (s, e),
            _ => {
                return Err(bad_request(
                    "start_time_90k and end_time_90k, with start < end, are required",
                ))
            }
        };

        let mut builder = mp4::Mp4FileBuilder::new();
        builder.include_timestamp_subtitle_track(include_ts);
        {
            let db = self.db.lock();
            let camera_id = db
                .get_camera(uuid)
                .ok_or_else(|| not_found("no such camera"))?
                .id;
            let desired = Time(start)..Time(end);
            db.list_recordings(camera_id, &desired, |r| {
                // Clamp the requested time window to this recording; skip
                // recordings that only touch the boundary.
                let rel_start = cmp::max(0, start - r.start.0) as i32;
                let rel_end = cmp::min(i64::from(r.duration_90k), end - r.start.0) as i32;
                if rel_start < rel_end {
                    builder.append(&db, r, rel_start..rel_end)?;
                }
                Ok(())
            })?;
        }
        if builder.len() == 0 {
            return Err(not_found("no recordings in range"));
        }
        let mp4 = builder.build(self.db.clone(), self.dir.clone())?;
        Ok(resource::serve(Arc::new(mp4), req))
    }
}

/// Parses optional `start_time_90k` and `end_time_90k` query parameters,
/// defaulting to the full range of possible values.
fn get_optional_range(query: &str) -> Result<std::ops::Range<Time>, HttpError> {
    let mut start = i64::min_value();
    let mut end = i64::max_value();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match &*key {
            "start_time_90k" => {
                start = i64::from_str(&value)
                    .map_err(|_| bad_request(format!("invalid start_time_90k {value:?}")))?
            }
            "end_time_90k" => {
                end = i64::from_str(&value)
                    .map_err(|_| bad_request(format!("invalid end_time_90k {value:?}")))?
            }
            _ => {}
        }
    }
    Ok(Time(start)..Time(end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_path() {
        let u = Uuid::parse_str("ce2d9bc2-0cd3-4204-9324-7b5ccb07183c").unwrap();
        assert_eq!(Path::CamerasList, decode_path("/"));
        assert_eq!(Path::CamerasList, decode_path("/cameras/"));
        assert_eq!(
            Path::Camera(u),
            decode_path("/cameras/ce2d9bc2-0cd3-4204-9324-7b5ccb07183c/")
        );
        assert_eq!(
            Path::CameraRecordings(u),
            decode_path("/cameras/ce2d9bc2-0cd3-4204-9324-7b5ccb07183c/recordings")
        );
        assert_eq!(
            Path::CameraViewMp4(u),
            decode_path("/cameras/ce2d9bc2-0cd3-4204-9324-7b5ccb07183c/view.mp4")
        );
        assert_eq!(Path::NotFound, decode_path("/cameras/not-a-uuid/"));
        assert_eq!(
            Path::NotFound,
            decode_path("/cameras/ce2d9bc2-0cd3-4204-9324-7b5ccb07183c/other")
        );
        assert_eq!(Path::NotFound, decode_path("/other"));
    }

    #[test]
    fn test_humanize() {
        assert_eq!("1.0 B", format!("{:b}B", Humanized(1)));
        assert_eq!("1.0 EiB", format!("{:b}B", Humanized(1i64 << 60)));
        assert_eq!("1.5 EiB", format!("{:b}B", Humanized((1i64 << 60) + (1i64 << 59))));
        assert_eq!("1.0 Mbps", format!("{}bps", Humanized(1_000_000)));
    }

    #[test]
    fn test_html_escaped() {
        assert_eq!("", format!("{}", HtmlEscaped("")));
        assert_eq!("no special chars", format!("{}", HtmlEscaped("no special chars")));
        assert_eq!("a &lt;tag> &amp; text", format!("{}", HtmlEscaped("a <tag> & text")));
    }

    #[test]
    fn test_get_optional_range() {
        let r = get_optional_range("").unwrap();
        assert_eq!(Time(i64::min_value())..Time(i64::max_value()), r);
        let r = get_optional_range("start_time_90k=1&end_time_90k=42").unwrap();
        assert_eq!(Time(1)..Time(42), r);
        get_optional_range("start_time_90k=nope").unwrap_err();
    }
}
