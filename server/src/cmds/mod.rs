// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommands and their shared helpers.

use base::{format_err_t, Error, ErrorKind, ResultExt};
use db::dir;
use std::path::Path;

pub mod init;
pub mod run;
pub mod ts;

#[derive(Copy, Clone, PartialEq, Eq)]
enum OpenMode {
    ReadOnly,
    ReadWrite,
    Create,
}

/// Locks and opens the database.
/// The returned `dir::Fd` holds the lock and should be kept open as long as
/// the `Connection` is.
fn open_conn(db_dir: &Path, mode: OpenMode) -> Result<(dir::Fd, rusqlite::Connection), Error> {
    let dir_str = db_dir
        .to_str()
        .ok_or_else(|| format_err_t!(InvalidArgument, "db dir {:?} is not valid UTF-8", db_dir))?;
    let dir = dir::Fd::open(dir_str, mode == OpenMode::Create)
        .map_err(|e| format_err_t!(Internal, "unable to open db dir {:?}: {}", db_dir, e))?;
    let ro = mode == OpenMode::ReadOnly;
    dir.lock(if ro { libc::LOCK_SH } else { libc::LOCK_EX } | libc::LOCK_NB)
        .map_err(|e| {
            format_err_t!(
                FailedPrecondition,
                "db dir {:?} already in use; can't get {} lock: {}",
                db_dir,
                if ro { "shared" } else { "exclusive" },
                e
            )
        })?;
    let conn = rusqlite::Connection::open_with_flags(
        db_dir.join("db"),
        match mode {
            OpenMode::ReadOnly => rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
            OpenMode::ReadWrite => rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE,
            OpenMode::Create => {
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            }
        } | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .err_kind(ErrorKind::Internal)?;
    Ok((dir, conn))
}
