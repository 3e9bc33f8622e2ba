// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Video input streams.
//!
//! The recording pipeline consumes demuxed H.264 packets through the
//! `Opener`/`Stream` traits below: timestamps in 90 kHz units, key frame
//! flags, and codec configuration up front. The production implementation
//! wraps the `retina` RTSP library; tests substitute in-memory fakes.

use crate::h264;
use base::{bail_t, format_err_t, Error, ErrorKind, ResultExt};
use bytes::Bytes;
use futures::StreamExt;
use retina::client::Demuxed;
use retina::codec::{CodecItem, VideoParameters};
use std::convert::TryFrom;
use std::pin::Pin;
use std::result::Result;
use tracing::{debug, warn};
use url::Url;

static RETINA_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Opens a video input stream. This is a trait for test injection.
pub trait Opener: Send + Sync {
    /// Opens the given RTSP URL.
    ///
    /// Note: despite the blocking interface, this expects to be called from
    /// the context of a multithreaded tokio runtime with IO and time
    /// enabled.
    fn open(
        &self,
        label: String,
        url: Url,
        options: retina::client::SessionOptions,
    ) -> Result<(h264::ExtraData, Box<dyn Stream>), Error>;
}

/// A single demuxed video frame.
pub struct VideoFrame {
    /// The presentation timestamp in 90 kHz units. `None` if the source
    /// didn't supply one; such frames are rejected by the pipeline.
    pub pts: Option<i64>,

    /// The decode timestamp in 90 kHz units. Must equal `pts`; B-frames are
    /// unsupported.
    pub dts: Option<i64>,

    pub is_key: bool,
    pub data: Bytes,
}

pub trait Stream: Send {
    fn next(&mut self) -> Result<VideoFrame, Error>;
}

pub struct RealOpener;

pub const OPENER: RealOpener = RealOpener;

impl Opener for RealOpener {
    fn open(
        &self,
        label: String,
        url: Url,
        options: retina::client::SessionOptions,
    ) -> Result<(h264::ExtraData, Box<dyn Stream>), Error> {
        let options = options.user_agent(format!("Kestrel NVR {}", env!("CARGO_PKG_VERSION")));
        let rt_handle = tokio::runtime::Handle::current();
        let (inner, video_params, first_frame) = rt_handle
            .block_on(rt_handle.spawn(tokio::time::timeout(
                RETINA_TIMEOUT,
                RetinaStreamInner::play(label, url, options),
            )))
            .expect("RetinaStream::play task panicked, see earlier error")
            .map_err(|_| format_err_t!(DeadlineExceeded, "timeout opening stream"))??;
        let (width, height) = video_params.pixel_dimensions();
        let (width, height) = (
            u16::try_from(width).map_err(|_| format_err_t!(InvalidArgument, "width {} too large", width))?,
            u16::try_from(height).map_err(|_| format_err_t!(InvalidArgument, "height {} too large", height))?,
        );
        let extra_data = h264::ExtraData::parse(video_params.extra_data(), width, height)?;
        let stream = Box::new(RetinaStream {
            inner: Some(inner),
            rt_handle,
            first_frame: Some(first_frame),
        });
        Ok((extra_data, stream))
    }
}

/// Real stream, implemented with the Retina library.
///
/// Retina is asynchronous and tokio-based where the recording pipeline
/// expects a synchronous stream interface, so this blocks on the tokio
/// operations. One thread hand-off per frame via
/// `handle.block_on(handle.spawn(...))`.
struct RetinaStream {
    /// The actual stream details used from within the tokio reactor.
    ///
    /// Spawned tokio tasks must be `'static`, so ownership is passed to the
    /// task, and then returned when it completes.
    inner: Option<Box<RetinaStreamInner>>,

    rt_handle: tokio::runtime::Handle,

    /// The first frame, if not yet returned from `next`.
    ///
    /// This frame is special because it is fetched as part of getting the
    /// video parameters.
    first_frame: Option<retina::codec::VideoFrame>,
}

struct RetinaStreamInner {
    label: String,
    session: Demuxed,
}

impl RetinaStreamInner {
    /// Plays to the first key frame. No timeout; that's the caller's
    /// responsibility.
    async fn play(
        label: String,
        url: Url,
        options: retina::client::SessionOptions,
    ) -> Result<(Box<Self>, Box<VideoParameters>, retina::codec::VideoFrame), Error> {
        let mut session = retina::client::Session::describe(url, options)
            .await
            .err_kind(ErrorKind::Unavailable)?;
        debug!("connected to {:?}, tool {:?}", &label, session.tool());
        let (video_i, mut video_params) = session
            .streams()
            .iter()
            .enumerate()
            .find_map(|(i, s)| {
                if s.media == "video" && s.encoding_name == "h264" {
                    Some((
                        i,
                        s.parameters().and_then(|p| match p {
                            retina::codec::Parameters::Video(v) => Some(Box::new(v.clone())),
                            _ => None,
                        }),
                    ))
                } else {
                    None
                }
            })
            .ok_or_else(|| format_err_t!(FailedPrecondition, "couldn't find H.264 video stream"))?;
        session.setup(video_i).await.err_kind(ErrorKind::Unavailable)?;
        let session = session
            .play(retina::client::PlayOptions::default())
            .await
            .err_kind(ErrorKind::Unavailable)?;
        let mut session = session.demuxed().err_kind(ErrorKind::Unavailable)?;

        // First frame.
        let first_frame = loop {
            match Pin::new(&mut session).next().await {
                None => bail_t!(Unavailable, "stream closed before first frame"),
                Some(Err(e)) => bail_t!(Unavailable, "{}", e),
                Some(Ok(CodecItem::VideoFrame(mut v))) => {
                    if let Some(v) = v.new_parameters.take() {
                        video_params = Some(v);
                    }
                    if v.is_random_access_point {
                        break v;
                    }
                }
                Some(Ok(_)) => {}
            }
        };
        let self_ = Box::new(Self { label, session });
        Ok((
            self_,
            video_params.ok_or_else(|| format_err_t!(FailedPrecondition, "couldn't find H.264 parameters"))?,
            first_frame,
        ))
    }

    /// Fetches a non-initial frame.
    async fn fetch_next_frame(
        mut self: Box<Self>,
    ) -> Result<(Box<Self>, retina::codec::VideoFrame), Error> {
        loop {
            match Pin::new(&mut self.session)
                .next()
                .await
                .transpose()
                .err_kind(ErrorKind::Unavailable)?
            {
                None => bail_t!(Unavailable, "end of stream"),
                Some(CodecItem::VideoFrame(v)) => {
                    if let Some(p) = v.new_parameters {
                        // TODO: restart the recording without dropping the
                        // connection.
                        bail_t!(Unavailable, "parameter change: {:?}", p);
                    }
                    if v.loss > 0 {
                        warn!("{}: lost {} RTP packets @ {}", &self.label, v.loss, v.start_ctx());
                    }
                    return Ok((self, v));
                }
                Some(_) => {}
            }
        }
    }
}

impl Stream for RetinaStream {
    fn next(&mut self) -> Result<VideoFrame, Error> {
        let frame = self.first_frame.take().map(Ok).unwrap_or_else(move || {
            let inner = self.inner.take().expect("inner returns on success");
            let (inner, frame) = self
                .rt_handle
                .block_on(self.rt_handle.spawn(tokio::time::timeout(
                    RETINA_TIMEOUT,
                    inner.fetch_next_frame(),
                )))
                .expect("fetch_next_frame task panicked, see earlier error")
                .map_err(|_| format_err_t!(DeadlineExceeded, "timeout getting next frame"))??;
            self.inner = Some(inner);
            Ok::<_, Error>(frame)
        })?;
        // Retina demuxes H.264 without B-frame reordering, so the decode
        // timestamp equals the presentation timestamp.
        let ts = frame.timestamp.elapsed();
        Ok(VideoFrame {
            pts: Some(ts),
            dts: Some(ts),
            is_key: frame.is_random_access_point,
            data: frame.into_data().into(),
        })
    }
}
