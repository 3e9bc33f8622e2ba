// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Tools for implementing a virtual file as a ordered list of byte slices.

use base::{bail_t, Error};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Range;

/// One slice of a composite virtual file. Writes a byte range of itself into
/// a caller-supplied buffer, given a context (typically the virtual file the
/// slice indexes into).
pub trait ContextWriter<Ctx> {
    /// Appends bytes `r` of this slice (of total length `l`) to `out`.
    fn write_to(&self, ctx: &Ctx, r: Range<u64>, l: u64, out: &mut Vec<u8>) -> Result<(), Error>;

    /// True if serving this slice is expensive (it opens or maps a file).
    /// When a read spans multiple slices, the composite stops before a lazy
    /// slice which isn't the first of the read, returning a short count so
    /// the caller flushes what it has and re-enters. This keeps only one
    /// file mapped at a time no matter how many segments a read covers.
    fn is_lazy(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct SliceInfo<W> {
    end: u64,
    writer: W,
}

/// An ordered list of slices, forming a sparse virtual file of their
/// concatenation.
pub struct Slices<W, C> {
    len: u64,
    slices: Vec<SliceInfo<W>>,
    phantom: PhantomData<C>,
}

impl<W, C> fmt::Debug for Slices<W, C>
where
    W: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} slices with overall length {}:", self.slices.len(), self.len)?;
        let mut start = 0;
        for (i, s) in self.slices.iter().enumerate() {
            write!(
                f,
                "\ni {:7}: range [{:12}, {:12}) len {:12}: {:?}",
                i,
                start,
                s.end,
                s.end - start,
                s.writer
            )?;
            start = s.end;
        }
        Ok(())
    }
}

impl<W, C> Slices<W, C>
where
    W: ContextWriter<C>,
{
    pub fn new() -> Slices<W, C> {
        Slices {
            len: 0,
            slices: Vec::new(),
            phantom: PhantomData,
        }
    }

    pub fn reserve(&mut self, additional: usize) {
        self.slices.reserve(additional)
    }

    pub fn append(&mut self, len: u64, writer: W) {
        self.len += len;
        self.slices.push(SliceInfo {
            end: self.len,
            writer,
        });
    }

    /// Returns the total byte length of all slices.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns the number of slices.
    pub fn num(&self) -> usize {
        self.slices.len()
    }

    /// Appends bytes of `range` to `out`, returning the number of bytes
    /// added. The count may be short of the full range: writing stops before
    /// a lazy slice which isn't the first slice of this call, so the caller
    /// must advance `range.start` and call again until the full range has
    /// been delivered.
    pub fn write_range(&self, ctx: &C, range: Range<u64>, out: &mut Vec<u8>) -> Result<u64, Error> {
        if range.start > range.end || range.end > self.len {
            bail_t!(OutOfRange, "bad range {:?} for slice of length {}", range, self.len);
        }
        if range.start == range.end {
            return Ok(0);
        }

        // Binary search for the first slice of the range to write,
        // determining its index and (from the preceding slice) the start of
        // its range.
        let (mut i, mut slice_start) = match self.slices.binary_search_by_key(&range.start, |s| s.end)
        {
            Ok(i) => (i + 1, self.slices[i].end), // desired start == slice i's end; first is i+1!
            Err(i) if i == 0 => (i, 0),           // desired start < slice 0's end; first is 0.
            Err(i) => (i, self.slices[i - 1].end), // desired start < slice i's end; first is i.
        };

        // Iterate through and write each slice until the end of the range or
        // a lazy stopping point.
        let mut written = 0;
        let mut start_pos = range.start - slice_start;
        loop {
            let s = &self.slices[i];
            let l = s.end - slice_start;
            if written > 0 && s.writer.is_lazy() {
                return Ok(written);
            }
            if range.end <= s.end {
                // Last slice.
                s.writer.write_to(ctx, start_pos..range.end - slice_start, l, out)?;
                return Ok(written + (range.end - slice_start) - start_pos);
            }
            s.writer.write_to(ctx, start_pos..l, l, out)?;
            written += l - start_pos;

            // Set up the next iteration.
            start_pos = 0;
            slice_start = s.end;
            i += 1;
        }
    }
}

/// Calls `f` with a buffer, then appends the section of it defined by `r` to
/// `out`. This is useful for easily implementing `ContextWriter` for pieces
/// that generate data on-the-fly rather than simply copying an existing
/// buffer.
pub fn clip_to_range<F>(r: Range<u64>, l: u64, out: &mut Vec<u8>, f: F) -> Result<(), Error>
where
    F: FnOnce(&mut Vec<u8>) -> Result<(), Error>,
{
    let mut buf = Vec::with_capacity(l as usize);
    f(&mut buf)?;
    if buf.len() as u64 != l {
        bail_t!(Internal, "expected {} bytes, got {}", l, buf.len());
    }
    out.extend_from_slice(&buf[r.start as usize..r.end as usize]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, Eq, PartialEq)]
    pub struct FakeWrite {
        writer: &'static str,
        range: Range<u64>,
    }

    pub struct FakeWriter {
        name: &'static str,
        lazy: bool,
    }

    impl ContextWriter<RefCell<Vec<FakeWrite>>> for FakeWriter {
        fn write_to(
            &self,
            ctx: &RefCell<Vec<FakeWrite>>,
            r: Range<u64>,
            _l: u64,
            out: &mut Vec<u8>,
        ) -> Result<(), Error> {
            ctx.borrow_mut().push(FakeWrite {
                writer: self.name,
                range: r.clone(),
            });
            out.resize(out.len() + (r.end - r.start) as usize, 0);
            Ok(())
        }

        fn is_lazy(&self) -> bool {
            self.lazy
        }
    }

    fn eager(name: &'static str) -> FakeWriter {
        FakeWriter { name, lazy: false }
    }

    fn new_slices() -> Slices<FakeWriter, RefCell<Vec<FakeWrite>>> {
        let mut s = Slices::new();
        s.append(5, eager("a"));
        s.append(13, eager("b"));
        s.append(7, eager("c"));
        s.append(17, eager("d"));
        s.append(19, eager("e"));
        s
    }

    #[test]
    fn size() {
        assert_eq!(5 + 13 + 7 + 17 + 19, new_slices().len());
    }

    #[test]
    fn exact_slice() {
        // Test writing exactly slice b.
        let s = new_slices();
        let w = RefCell::new(Vec::new());
        let mut out = Vec::new();
        assert_eq!(13, s.write_range(&w, 5..18, &mut out).unwrap());
        assert_eq!(&[FakeWrite { writer: "b", range: 0..13 }], &w.borrow()[..]);
    }

    #[test]
    fn offset_first() {
        // Test writing part of slice a.
        let s = new_slices();
        let w = RefCell::new(Vec::new());
        let mut out = Vec::new();
        assert_eq!(2, s.write_range(&w, 1..3, &mut out).unwrap());
        assert_eq!(&[FakeWrite { writer: "a", range: 1..3 }], &w.borrow()[..]);
    }

    #[test]
    fn offset_mid() {
        // Test writing part of slice b, all of slice c, and part of slice d.
        let s = new_slices();
        let w = RefCell::new(Vec::new());
        let mut out = Vec::new();
        assert_eq!(9, s.write_range(&w, 17..26, &mut out).unwrap());
        assert_eq!(
            &[
                FakeWrite { writer: "b", range: 12..13 },
                FakeWrite { writer: "c", range: 0..7 },
                FakeWrite { writer: "d", range: 0..1 },
            ],
            &w.borrow()[..]
        );
    }

    #[test]
    fn everything() {
        let s = new_slices();
        let w = RefCell::new(Vec::new());
        let mut out = Vec::new();
        assert_eq!(61, s.write_range(&w, 0..61, &mut out).unwrap());
        assert_eq!(61, out.len());
        assert_eq!(
            &[
                FakeWrite { writer: "a", range: 0..5 },
                FakeWrite { writer: "b", range: 0..13 },
                FakeWrite { writer: "c", range: 0..7 },
                FakeWrite { writer: "d", range: 0..17 },
                FakeWrite { writer: "e", range: 0..19 },
            ],
            &w.borrow()[..]
        );
    }

    #[test]
    fn at_end() {
        let s = new_slices();
        let w = RefCell::new(Vec::new());
        let mut out = Vec::new();
        assert_eq!(0, s.write_range(&w, 61..61, &mut out).unwrap());
        let empty: &[FakeWrite] = &[];
        assert_eq!(empty, &w.borrow()[..]);
    }

    /// A lazy slice stops a multi-slice read early; the caller re-enters with
    /// an advanced start and gets the lazy slice first, where it does serve.
    #[test]
    fn lazy_stop_and_reenter() {
        let mut s = Slices::new();
        s.append(5, eager("a"));
        s.append(13, FakeWriter { name: "b", lazy: true });
        s.append(7, FakeWriter { name: "c", lazy: true });
        let w = RefCell::new(Vec::new());
        let mut out = Vec::new();
        assert_eq!(5, s.write_range(&w, 0..25, &mut out).unwrap());
        assert_eq!(&[FakeWrite { writer: "a", range: 0..5 }], &w.borrow()[..]);

        // Re-entering at the lazy slice serves it (and only it).
        w.borrow_mut().clear();
        out.clear();
        assert_eq!(13, s.write_range(&w, 5..25, &mut out).unwrap());
        assert_eq!(&[FakeWrite { writer: "b", range: 0..13 }], &w.borrow()[..]);

        w.borrow_mut().clear();
        out.clear();
        assert_eq!(7, s.write_range(&w, 18..25, &mut out).unwrap());
        assert_eq!(&[FakeWrite { writer: "c", range: 0..7 }], &w.borrow()[..]);
    }

    #[test]
    fn test_clip_to_range() {
        let mut out = Vec::new();

        // Simple case: everything.
        clip_to_range(0..5, 5, &mut out, |buf| {
            buf.extend_from_slice(b"01234");
            Ok(())
        })
        .unwrap();
        assert_eq!(b"01234", &out[..]);

        // Limiting to a prefix.
        out.clear();
        clip_to_range(0..2, 5, &mut out, |buf| {
            buf.extend_from_slice(b"01234");
            Ok(())
        })
        .unwrap();
        assert_eq!(b"01", &out[..]);

        // Limiting to part in the middle.
        out.clear();
        clip_to_range(2..4, 5, &mut out, |buf| {
            buf.extend_from_slice(b"01234");
            Ok(())
        })
        .unwrap();
        assert_eq!(b"23", &out[..]);

        // A wrong-sized generation is caught rather than served.
        out.clear();
        clip_to_range(0..5, 5, &mut out, |buf| {
            buf.extend_from_slice(b"0123");
            Ok(())
        })
        .unwrap_err();

        // Errors from the callback are propagated.
        out.clear();
        clip_to_range(0..4, 4, &mut out, |_| Err(base::format_err_t!(Internal, "some error")))
            .unwrap_err();
    }
}
