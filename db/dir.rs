// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Sample file directory management.
//!
//! Each recording's video samples are written to a flat file in a dedicated
//! directory, named by the recording's sample file uuid. This module opens
//! those files for reading and writing and syncs the directory itself, which
//! must happen before the database transaction that references (or
//! unreferences) a file.

use base::{bail_t, Error, ErrorKind, ResultExt};
use openssl::hash;
use std::ffi;
use std::fs;
use std::io::{self, Write};
use std::mem;
use std::os::unix::io::FromRawFd;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// A file descriptor associated with a directory (not necessarily the sample
/// file dir).
#[derive(Debug)]
pub struct Fd(libc::c_int);

impl Drop for Fd {
    fn drop(&mut self) {
        if unsafe { libc::close(self.0) } < 0 {
            let e = io::Error::last_os_error();
            warn!("Unable to close directory: {}", e);
        }
    }
}

impl Fd {
    /// Opens the given path as a directory, optionally creating it first.
    pub fn open(path: &str, mkdir: bool) -> Result<Fd, io::Error> {
        let cstring =
            ffi::CString::new(path).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if mkdir && unsafe { libc::mkdir(cstring.as_ptr(), 0o700) } != 0 {
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::AlreadyExists {
                return Err(e);
            }
        }
        let fd = unsafe { libc::open(cstring.as_ptr(), libc::O_DIRECTORY | libc::O_RDONLY, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Fd(fd))
    }

    /// Locks the directory with the specified `flock` operation.
    pub fn lock(&self, operation: libc::c_int) -> Result<(), io::Error> {
        let ret = unsafe { libc::flock(self.0, operation) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Syncs the directory itself.
    pub fn sync(&self) -> Result<(), io::Error> {
        let res = unsafe { libc::fsync(self.0) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// A sample file directory. There is one per server, shared by all cameras.
///
/// The database (and thus the reservation table) assumes a single process
/// writing to this directory; see `schema.sql`.
pub struct SampleFileDir {
    /// The open file descriptor for the directory. Used to create files, to
    /// sync the directory, and to open sample files for reading during video
    /// serving.
    fd: Fd,
}

impl SampleFileDir {
    pub fn new(path: &str) -> Result<Arc<SampleFileDir>, Error> {
        let fd = Fd::open(path, true)
            .map_err(|e| base::format_err_t!(Internal, "unable to open sample file dir {}: {}", path, e))?;
        Ok(Arc::new(SampleFileDir { fd }))
    }

    /// Opens the given sample file for reading.
    pub fn open_sample_file(&self, uuid: Uuid) -> Result<fs::File, io::Error> {
        self.open_int(uuid, libc::O_RDONLY, 0)
    }

    /// Creates a writer for a new sample file with the given (reserved) uuid.
    ///
    /// Note this doesn't wait for previous deletions to complete; it's
    /// assumed the directory has sufficient space for a couple recordings per
    /// camera in addition to the cameras' total `retain_bytes`.
    pub fn create_writer(&self, uuid: Uuid) -> Result<Writer, Error> {
        let f = match self.open_int(uuid, libc::O_WRONLY | libc::O_EXCL | libc::O_CREAT, 0o600) {
            Ok(f) => f,
            Err(e) => bail_t!(Internal, "unable to create sample file {}: {}", uuid, e),
        };
        Writer::open(f, uuid)
    }

    /// Opens a sample file within this directory with the given flags and
    /// (if creating) mode.
    fn open_int(&self, uuid: Uuid, flags: libc::c_int, mode: libc::c_int) -> Result<fs::File, io::Error> {
        let p = SampleFileDir::get_rel_pathname(uuid);
        let fd = unsafe { libc::openat(self.fd.0, p.as_ptr(), flags, mode) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { Ok(fs::File::from_raw_fd(fd)) }
    }

    /// Gets a pathname for a sample file suitable for passing to open or
    /// unlink.
    ///
    /// libc::c_char is i8 on some platforms (Linux/arm) and u8 on others.
    #[allow(clippy::useless_transmute)]
    fn get_rel_pathname(uuid: Uuid) -> [libc::c_char; 37] {
        let mut buf = [0u8; 37];
        write!(&mut buf[..36], "{}", uuid.hyphenated()).expect("can't format uuid to pathname buf");
        unsafe { mem::transmute::<[u8; 37], [libc::c_char; 37]>(buf) }
    }

    /// Unlinks the given sample file within this directory.
    pub fn unlink(&self, uuid: Uuid) -> Result<(), io::Error> {
        let p = SampleFileDir::get_rel_pathname(uuid);
        let res = unsafe { libc::unlinkat(self.fd.0, p.as_ptr(), 0) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Syncs the directory itself.
    pub fn sync(&self) -> Result<(), io::Error> {
        self.fd.sync()
    }
}

/// A writer for a single sample file, maintaining a running SHA-1 digest and
/// byte count.
///
/// The caller is responsible for the *directory* fsync and for the database
/// transaction which makes the file live; on any error here, the file's uuid
/// should be left reserved and the file scheduled for unlink.
pub struct Writer {
    f: fs::File,
    uuid: Uuid,
    hasher: hash::Hasher,
    bytes_written: i64,

    /// Set if a failed write couldn't be rolled back; all further operations
    /// fail immediately.
    corrupt: bool,
}

impl Writer {
    pub fn open(f: fs::File, uuid: Uuid) -> Result<Self, Error> {
        Ok(Writer {
            f,
            uuid,
            hasher: hash::Hasher::new(hash::MessageDigest::sha1()).err_kind(ErrorKind::Internal)?,
            bytes_written: 0,
            corrupt: false,
        })
    }

    pub fn bytes_written(&self) -> i64 {
        self.bytes_written
    }

    /// Writes all of `pkt`, or rolls the file back to its pre-call length
    /// and returns an error. If the rollback itself fails, the writer is
    /// marked corrupt; the file must be discarded.
    pub fn write(&mut self, pkt: &[u8]) -> Result<(), Error> {
        if self.corrupt {
            bail_t!(Internal, "{}: writer is corrupt", self.uuid);
        }
        let mut written = 0;
        while written < pkt.len() {
            match self.f.write(&pkt[written..]) {
                Ok(0) => {
                    self.rollback_partial_write(written);
                    bail_t!(Internal, "{}: write returned 0", self.uuid);
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.rollback_partial_write(written);
                    bail_t!(Internal, "{}: write failed: {}", self.uuid, e);
                }
            }
        }
        self.hasher.update(pkt).err_kind(ErrorKind::Internal)?;
        self.bytes_written += pkt.len() as i64;
        Ok(())
    }

    fn rollback_partial_write(&mut self, written: usize) {
        if written == 0 {
            return;
        }
        if let Err(e) = self.f.set_len(self.bytes_written as u64) {
            warn!("{}: unable to roll back partial write: {}", self.uuid, e);
            self.corrupt = true;
        }
    }

    /// Syncs and closes the file, returning its SHA-1 digest and length.
    /// On error the caller should treat the uuid as still reserved and
    /// schedule the file for unlink.
    pub fn close(mut self) -> Result<([u8; 20], i64), Error> {
        if self.corrupt {
            bail_t!(Internal, "{}: closing corrupt writer", self.uuid);
        }
        self.f.sync_all().err_kind(ErrorKind::Internal)?;
        let mut sha1 = [0u8; 20];
        sha1.copy_from_slice(&self.hasher.finish().err_kind(ErrorKind::Internal)?);
        Ok((sha1, self.bytes_written))
    }
}
