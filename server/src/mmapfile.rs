// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Memory-mapped file serving.

use base::{bail_t, Error, ErrorKind, ResultExt};
use memmap2::MmapOptions;
use std::fs::File;
use std::ops::Range;

/// A byte range of a sample file, served by mapping.
///
/// The file in question must be immutable, as files shrinking during `mmap`
/// will cause the process to fail with `SIGBUS`. Kestrel NVR sample files
/// satisfy this requirement: they are never modified after their recording
/// rows are inserted, and they are only unlinked (not truncated) when
/// deleted.
pub struct MmapFileSlice {
    f: File,
    range: Range<u64>,
}

impl MmapFileSlice {
    pub fn new(f: File, range: Range<u64>) -> MmapFileSlice {
        MmapFileSlice { f, range }
    }

    /// Appends `range` (relative to this slice) to `out`.
    pub fn write_to(&self, range: Range<u64>, out: &mut Vec<u8>) -> Result<(), Error> {
        let r = self.range.start + range.start..self.range.start + range.end;
        if r.end > self.range.end {
            bail_t!(OutOfRange, "requested={:?} within={:?}", range, self.range);
        }
        if r.start == r.end {
            return Ok(());
        }

        // mmap offsets must be page-aligned; map from the preceding page
        // boundary and skip the difference.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        let aligned_start = r.start - (r.start % page_size);
        let skip = (r.start - aligned_start) as usize;
        let len = (r.end - aligned_start) as usize;
        let mmap = unsafe { MmapOptions::new().offset(aligned_start).len(len).map(&self.f) }
            .err_kind(ErrorKind::Internal)?;
        out.extend_from_slice(&mmap[skip..]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_write_to() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        let path = tmpdir.path().join("f");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(b"0123456789").unwrap();
        }
        let f = std::fs::File::open(&path).unwrap();
        let s = MmapFileSlice::new(f, 2..8); // "234567"
        let mut out = Vec::new();
        s.write_to(0..6, &mut out).unwrap();
        assert_eq!(b"234567", &out[..]);
        out.clear();
        s.write_to(1..3, &mut out).unwrap();
        assert_eq!(b"34", &out[..]);
        s.write_to(1..7, &mut out).unwrap_err();
    }
}
