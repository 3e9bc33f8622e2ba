// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Byte-ranged HTTP resource serving, RFC 7233 style.
//!
//! The `Entity` trait is the contract between a virtual file (such as an
//! assembled `.mp4`) and the serving driver here: a known total size, eager
//! etag and modification time, and an `add_range` operation which appends
//! some prefix of a requested byte window to a buffer. `serve` turns an
//! entity into a streaming `hyper` response, honoring `Range:` and
//! `If-Range:` and client disconnect.

use base::Error;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use hyper::Body;
use smallvec::SmallVec;
use std::cmp;
use std::ops::Range;
use std::sync::Arc;
use tracing::warn;

/// The maximum number of bytes requested from an entity per `add_range`
/// call. The entity may return fewer (see `add_range`); the driver advances
/// and re-enters until the window is complete.
const CHUNK_SIZE: u64 = 65_536;

/// A byte-addressable resource for GET and HEAD serving.
pub trait Entity: Send + Sync + 'static {
    /// Returns the total length in bytes.
    fn len(&self) -> u64;

    /// Appends bytes of `range` to `out`, returning how many were added.
    /// The count may be less than the range's length (back-pressure from an
    /// expensive slice); the caller advances and calls again. A return of 0
    /// for a non-empty range is an error.
    fn add_range(&self, range: Range<u64>, out: &mut Vec<u8>) -> Result<u64, Error>;

    /// Returns the strong entity tag, including quotes, if there is one.
    fn etag(&self) -> Option<&str>;

    /// Returns the last modification time, if known.
    fn last_modified(&self) -> Option<time::Timespec>;

    fn content_type(&self) -> &'static str;
}

#[derive(Debug, Eq, PartialEq)]
enum ResolvedRanges {
    AbsentOrInvalid,
    NotSatisfiable,
    Satisfiable(SmallVec<[Range<u64>; 1]>),
}

/// Parses a `Range:` header value of the form `bytes=...` against a
/// resource of length `len`. A malformed header is treated as absent (the
/// whole resource is served); a well-formed header with no satisfiable
/// ranges is not satisfiable.
fn parse_range_header(range: Option<&str>, len: u64) -> ResolvedRanges {
    let range = match range {
        None => return ResolvedRanges::AbsentOrInvalid,
        Some(r) => r,
    };
    let spec = match range.strip_prefix("bytes=") {
        None => return ResolvedRanges::AbsentOrInvalid,
        Some(s) => s,
    };
    let mut ranges: SmallVec<[Range<u64>; 1]> = SmallVec::new();
    let mut any = false;
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return ResolvedRanges::AbsentOrInvalid;
        }
        any = true;
        if let Some(suffix) = part.strip_prefix('-') {
            // suffix-byte-range-spec: the final n bytes.
            let n: u64 = match suffix.parse() {
                Err(_) => return ResolvedRanges::AbsentOrInvalid,
                Ok(n) => n,
            };
            if n == 0 || len == 0 {
                continue;
            }
            ranges.push(len.saturating_sub(n)..len);
        } else {
            let (first, last) = match part.split_once('-') {
                None => return ResolvedRanges::AbsentOrInvalid,
                Some(fl) => fl,
            };
            let first: u64 = match first.parse() {
                Err(_) => return ResolvedRanges::AbsentOrInvalid,
                Ok(f) => f,
            };
            if last.is_empty() {
                if first >= len {
                    continue;
                }
                ranges.push(first..len);
            } else {
                let last: u64 = match last.parse() {
                    Err(_) => return ResolvedRanges::AbsentOrInvalid,
                    Ok(l) => l,
                };
                if last < first {
                    return ResolvedRanges::AbsentOrInvalid;
                }
                let end = cmp::min(last.saturating_add(1), len);
                if first >= end {
                    continue;
                }
                ranges.push(first..end);
            }
        }
    }
    if !any {
        return ResolvedRanges::AbsentOrInvalid;
    }
    if ranges.is_empty() {
        return ResolvedRanges::NotSatisfiable;
    }
    ResolvedRanges::Satisfiable(ranges)
}

/// Formats a timestamp as an HTTP-date (RFC 7231 section 7.1.1.1).
fn http_date(ts: time::Timespec) -> String {
    time::at_utc(ts)
        .strftime("%a, %d %b %Y %H:%M:%S GMT")
        .expect("strftime with fixed format should succeed")
        .to_string()
}

/// Returns a `Body` which streams `range` of `e` in chunks.
///
/// Each chunk is produced by a blocking `add_range` call (entities touch the
/// database and mmap sample files), so generation happens off the reactor
/// threads. Dropping the body (client disconnect) stops the stream and
/// releases any mapped files.
fn stream_entity<E: Entity>(e: Arc<E>, range: Range<u64>) -> Body {
    let s = futures::stream::unfold((e, range.start, range.end), |(e, pos, end)| async move {
        if pos >= end {
            return None;
        }
        let limit = cmp::min(end, pos + CHUNK_SIZE);
        let r = tokio::task::spawn_blocking({
            let e = e.clone();
            move || {
                let mut buf = Vec::with_capacity((limit - pos) as usize);
                let added = e.add_range(pos..limit, &mut buf)?;
                Ok::<_, Error>((buf, added))
            }
        })
        .await;
        type BoxedError = Box<dyn std::error::Error + Send + Sync>;
        let item: Result<(bytes::Bytes, u64), BoxedError> = match r {
            Err(join_err) => Err(Box::new(join_err)),
            Ok(Err(err)) => Err(Box::new(err.compat())),
            Ok(Ok((_, 0))) => Err(format!("no bytes added for range [{pos}, {limit})").into()),
            Ok(Ok((buf, added))) => Ok((bytes::Bytes::from(buf), added)),
        };
        match item {
            Err(err) => {
                warn!("error streaming range [{}, {}): {}", pos, end, err);
                Some((Err(err), (e, end, end)))
            }
            Ok((chunk, added)) => Some((Ok(chunk), (e, pos + added, end))),
        }
    });
    Body::wrap_stream(s)
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .body(body.into())
        .expect("static response should be valid")
}

/// Serves GET and HEAD requests for a given byte-ranged entity, handling
/// conditional and subrange requests.
pub fn serve<E: Entity>(e: Arc<E>, req: &Request<hyper::Body>) -> Response<Body> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        let mut resp = plain_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "This resource only supports GET and HEAD.",
        );
        resp.headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
        return resp;
    }

    let etag = e.etag().map(str::to_owned);
    let last_modified = e.last_modified();
    let mut builder = Response::builder().header(header::ACCEPT_RANGES, "bytes");
    if let Some(ref etag) = etag {
        builder = builder.header(header::ETAG, etag.as_str());
    }
    if let Some(lm) = last_modified {
        builder = builder.header(header::LAST_MODIFIED, http_date(lm));
    }

    // A matching If-None-Match means the client's copy is current.
    if let (Some(inm), Some(ref etag)) = (req.headers().get(header::IF_NONE_MATCH), &etag) {
        if inm.to_str().map(|v| v == *etag || v == "*").unwrap_or(false) {
            return builder
                .status(StatusCode::NOT_MODIFIED)
                .body(Body::empty())
                .expect("not-modified response should be valid");
        }
    }

    // An If-Range which doesn't match the current etag means the entity has
    // changed since the client's previous request; ignore the range and
    // serve the whole file so it doesn't splice old and new bytes.
    let mut range_hdr = req
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());
    if let Some(if_range) = req.headers().get(header::IF_RANGE) {
        let matches = match (if_range.to_str().ok(), &etag) {
            (Some(v), Some(e)) => v == e.as_str(),
            _ => false,
        };
        if !matches {
            range_hdr = None;
        }
    }

    let len = e.len();
    let (range, status) = match parse_range_header(range_hdr, len) {
        ResolvedRanges::AbsentOrInvalid => (0..len, StatusCode::OK),
        ResolvedRanges::Satisfiable(rs) => {
            if rs.len() == 1 {
                builder = builder.header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", rs[0].start, rs[0].end - 1, len),
                );
                (rs[0].clone(), StatusCode::PARTIAL_CONTENT)
            } else {
                // Ignore multi-part range headers for now. They require
                // additional complexity, and clients don't seem to send them
                // in the wild.
                (0..len, StatusCode::OK)
            }
        }
        ResolvedRanges::NotSatisfiable => {
            return builder
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{len}"))
                .body(Body::empty())
                .expect("non-satisfiable response should be valid");
        }
    };

    builder = builder
        .status(status)
        .header(header::CONTENT_TYPE, e.content_type())
        .header(header::CONTENT_LENGTH, range.end - range.start);
    let body = if req.method() == Method::HEAD {
        Body::empty()
    } else {
        stream_entity(e, range)
    };
    builder.body(body).expect("entity response should be valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rs(l: &[Range<u64>]) -> ResolvedRanges {
        ResolvedRanges::Satisfiable(l.iter().cloned().collect())
    }

    /// Tests the specific examples enumerated in RFC 7233 section 2.1.
    #[test]
    fn test_parse_ranges_rfc() {
        assert_eq!(rs(&[0..500]), parse_range_header(Some("bytes=0-499"), 10000));
        assert_eq!(rs(&[500..1000]), parse_range_header(Some("bytes=500-999"), 10000));
        assert_eq!(rs(&[9500..10000]), parse_range_header(Some("bytes=-500"), 10000));
        assert_eq!(rs(&[9500..10000]), parse_range_header(Some("bytes=9500-"), 10000));
        assert_eq!(
            rs(&[0..1, 9999..10000]),
            parse_range_header(Some("bytes=0-0,-1"), 10000)
        );
        assert_eq!(
            rs(&[500..601, 601..1000]),
            parse_range_header(Some("bytes=500-600,601-999"), 10000)
        );
        assert_eq!(
            rs(&[500..701, 601..1000]),
            parse_range_header(Some("bytes=500-700,601-999"), 10000)
        );
    }

    #[test]
    fn test_parse_ranges_satisfiability() {
        assert_eq!(
            ResolvedRanges::NotSatisfiable,
            parse_range_header(Some("bytes=10000-"), 10000)
        );
        assert_eq!(
            rs(&[0..500]),
            parse_range_header(Some("bytes=0-499,10000-"), 10000)
        );
        assert_eq!(ResolvedRanges::NotSatisfiable, parse_range_header(Some("bytes=-1"), 0));
        assert_eq!(ResolvedRanges::NotSatisfiable, parse_range_header(Some("bytes=0-0"), 0));
        assert_eq!(ResolvedRanges::NotSatisfiable, parse_range_header(Some("bytes=0-"), 0));
        assert_eq!(rs(&[0..1]), parse_range_header(Some("bytes=0-0"), 1));
        assert_eq!(rs(&[0..500]), parse_range_header(Some("bytes=0-10000"), 500));
    }

    #[test]
    fn test_parse_ranges_absent_or_invalid() {
        assert_eq!(ResolvedRanges::AbsentOrInvalid, parse_range_header(None, 10000));
        assert_eq!(
            ResolvedRanges::AbsentOrInvalid,
            parse_range_header(Some("bytes=499-0"), 10000)
        );
        assert_eq!(
            ResolvedRanges::AbsentOrInvalid,
            parse_range_header(Some("bytes=", ), 10000)
        );
        assert_eq!(
            ResolvedRanges::AbsentOrInvalid,
            parse_range_header(Some("units=0-499"), 10000)
        );
        assert_eq!(
            ResolvedRanges::AbsentOrInvalid,
            parse_range_header(Some("bytes=a-b"), 10000)
        );
    }

    struct FakeEntity {
        etag: Option<&'static str>,
        body: &'static [u8],
    }

    impl Entity for FakeEntity {
        fn len(&self) -> u64 {
            self.body.len() as u64
        }
        fn add_range(&self, range: Range<u64>, out: &mut Vec<u8>) -> Result<u64, Error> {
            out.extend_from_slice(&self.body[range.start as usize..range.end as usize]);
            Ok(range.end - range.start)
        }
        fn etag(&self) -> Option<&str> {
            self.etag
        }
        fn last_modified(&self) -> Option<time::Timespec> {
            Some(time::Timespec::new(1430006400, 0))
        }
        fn content_type(&self) -> &'static str {
            "application/octet-stream"
        }
    }

    fn entity() -> Arc<FakeEntity> {
        Arc::new(FakeEntity {
            etag: Some("\"foo\""),
            body: b"01234",
        })
    }

    fn get(headers: &[(header::HeaderName, &str)]) -> Request<hyper::Body> {
        let mut b = Request::get("/");
        for (n, v) in headers {
            b = b.header(n, *v);
        }
        b.body(hyper::Body::empty()).unwrap()
    }

    async fn body_bytes(resp: Response<Body>) -> Vec<u8> {
        hyper::body::to_bytes(resp.into_body()).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_serve_whole() {
        let resp = serve(entity(), &get(&[]));
        assert_eq!(StatusCode::OK, resp.status());
        assert_eq!("5", resp.headers()[header::CONTENT_LENGTH]);
        assert_eq!("\"foo\"", resp.headers()[header::ETAG]);
        assert_eq!("bytes", resp.headers()[header::ACCEPT_RANGES]);
        assert_eq!(
            "Sun, 26 Apr 2015 00:00:00 GMT",
            resp.headers()[header::LAST_MODIFIED]
        );
        assert_eq!(b"01234", &body_bytes(resp).await[..]);
    }

    #[tokio::test]
    async fn test_serve_range() {
        let resp = serve(entity(), &get(&[(header::RANGE, "bytes=1-3")]));
        assert_eq!(StatusCode::PARTIAL_CONTENT, resp.status());
        assert_eq!("bytes 1-3/5", resp.headers()[header::CONTENT_RANGE]);
        assert_eq!("3", resp.headers()[header::CONTENT_LENGTH]);
        assert_eq!(b"123", &body_bytes(resp).await[..]);
    }

    #[tokio::test]
    async fn test_serve_multi_range_falls_back_to_whole() {
        let resp = serve(entity(), &get(&[(header::RANGE, "bytes=0-0,-1")]));
        assert_eq!(StatusCode::OK, resp.status());
        assert_eq!(b"01234", &body_bytes(resp).await[..]);
    }

    #[tokio::test]
    async fn test_serve_not_satisfiable() {
        let resp = serve(entity(), &get(&[(header::RANGE, "bytes=500-")]));
        assert_eq!(StatusCode::RANGE_NOT_SATISFIABLE, resp.status());
        assert_eq!("bytes */5", resp.headers()[header::CONTENT_RANGE]);
        assert_eq!(b"", &body_bytes(resp).await[..]);
    }

    #[tokio::test]
    async fn test_serve_if_range() {
        // A matching If-Range honors the range.
        let resp = serve(
            entity(),
            &get(&[(header::RANGE, "bytes=1-3"), (header::IF_RANGE, "\"foo\"")]),
        );
        assert_eq!(StatusCode::PARTIAL_CONTENT, resp.status());
        assert_eq!(b"123", &body_bytes(resp).await[..]);

        // A non-matching If-Range serves the whole entity.
        let resp = serve(
            entity(),
            &get(&[(header::RANGE, "bytes=1-3"), (header::IF_RANGE, "\"bar\"")]),
        );
        assert_eq!(StatusCode::OK, resp.status());
        assert_eq!(b"01234", &body_bytes(resp).await[..]);
    }

    #[tokio::test]
    async fn test_serve_if_none_match() {
        let resp = serve(entity(), &get(&[(header::IF_NONE_MATCH, "\"foo\"")]));
        assert_eq!(StatusCode::NOT_MODIFIED, resp.status());
        assert_eq!(b"", &body_bytes(resp).await[..]);
    }

    #[tokio::test]
    async fn test_serve_head() {
        let req = Request::head("/").body(hyper::Body::empty()).unwrap();
        let resp = serve(entity(), &req);
        assert_eq!(StatusCode::OK, resp.status());
        assert_eq!("5", resp.headers()[header::CONTENT_LENGTH]);
        assert_eq!(b"", &body_bytes(resp).await[..]);
    }
}
