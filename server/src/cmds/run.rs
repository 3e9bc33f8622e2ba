// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use crate::stream;
use crate::streamer;
use crate::web;
use base::clock::RealClocks;
use base::{format_err_t, Error, ErrorKind, ResultExt};
use bpaf::Bpaf;
use db::{dir, retention};
use futures::future::FutureExt;
use hyper::service::{make_service_fn, service_fn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

#[derive(Bpaf, Debug)]
pub struct Args {
    /// Directory holding the SQLite3 index database.
    #[bpaf(argument("PATH"), fallback_with(crate::default_db_dir))]
    db_dir: PathBuf,

    /// Directory holding video sample files.
    #[bpaf(argument("PATH"), fallback_with(crate::default_sample_file_dir))]
    sample_file_dir: PathBuf,

    /// Bind address for the unencrypted HTTP server.
    #[bpaf(argument("ADDR"), fallback(std::net::SocketAddr::from(([0, 0, 0, 0], 8080))))]
    http_addr: std::net::SocketAddr,

    /// Opens the database in read-only mode and disables recording.
    #[bpaf(switch)]
    read_only: bool,
}

#[tokio::main]
pub async fn run(args: Args) -> Result<i32, Error> {
    let clocks = RealClocks {};
    let (_db_dir, conn) = super::open_conn(
        &args.db_dir,
        if args.read_only {
            super::OpenMode::ReadOnly
        } else {
            super::OpenMode::ReadWrite
        },
    )?;
    let db = Arc::new(db::Database::new(conn)?);
    info!("Database is loaded.");

    let sample_path = args
        .sample_file_dir
        .to_str()
        .ok_or_else(|| {
            format_err_t!(InvalidArgument, "sample file dir {:?} is not valid UTF-8", args.sample_file_dir)
        })?;
    let dir = dir::SampleFileDir::new(sample_path)?;

    if !args.read_only {
        // Files for reservations left over from a previous process (of
        // either state) are garbage; remove them before recording starts.
        retention::delete_stale_reservations(&db, &dir)?;
    }

    let svc = Arc::new(web::Service::new(db.clone(), dir.clone()));

    // Start a streamer thread per camera, with rotation times staggered
    // across the rotate interval.
    let shutdown_streamers = Arc::new(AtomicBool::new(false));
    let mut streamers = Vec::new();
    if !args.read_only {
        let l = db.lock();
        let num_cameras = l.cameras_by_id().len() as i64;
        let env = streamer::Environment {
            clocks: &clocks,
            opener: &stream::OPENER,
            db: &db,
            dir: &dir,
            shutdown: &shutdown_streamers,
        };
        for (i, camera) in l.cameras_by_id().values().enumerate() {
            let rotate_offset_sec = streamer::ROTATE_INTERVAL_SEC * i as i64 / num_cameras;
            let mut streamer = streamer::Streamer::new(
                &env,
                camera,
                rotate_offset_sec,
                streamer::ROTATE_INTERVAL_SEC,
            )?;
            info!("Starting streamer for {}", streamer.short_name());
            let name = format!("s-{}", streamer.short_name());
            streamers.push(
                thread::Builder::new()
                    .name(name)
                    .spawn(move || streamer.run())
                    .expect("can't create thread"),
            );
        }
    }

    // Start the web interface.
    let make_svc = make_service_fn(move |_conn| {
        futures::future::ok::<_, std::convert::Infallible>(service_fn({
            let svc = Arc::clone(&svc);
            move |req| Arc::clone(&svc).serve(req)
        }))
    });
    let server = hyper::server::Server::try_bind(&args.http_addr)
        .err_kind(ErrorKind::Unavailable)?
        .tcp_nodelay(true)
        .serve(make_svc);

    let mut int = signal(SignalKind::interrupt()).err_kind(ErrorKind::Internal)?;
    let mut term = signal(SignalKind::terminate()).err_kind(ErrorKind::Internal)?;
    let shutdown = futures::future::select(Box::pin(int.recv()), Box::pin(term.recv()));

    let (shutdown_tx, shutdown_rx) = futures::channel::oneshot::channel();
    let server = server.with_graceful_shutdown(shutdown_rx.map(|_| ()));
    let server_handle = tokio::spawn(server);

    info!("Ready to serve HTTP requests");
    shutdown.await;
    shutdown_tx.send(()).expect("server is still running");

    info!("Shutting down streamers.");
    shutdown_streamers.store(true, Ordering::SeqCst);
    for streamer in streamers.drain(..) {
        streamer.join().expect("streamer thread shouldn't panic");
    }

    info!("Waiting for HTTP requests to finish.");
    server_handle
        .await
        .err_kind(ErrorKind::Internal)?
        .err_kind(ErrorKind::Unavailable)?;
    info!("Exiting.");
    Ok(0)
}
