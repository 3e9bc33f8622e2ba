// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::time::Time;
use base::Error;
use bpaf::Bpaf;

#[derive(Bpaf, Debug)]
pub struct Args {
    /// Timestamp(s) to translate.
    ///
    /// May be either a 90 kHz unit count since epoch or an RFC-3339-like
    /// string, e.g. "2016-01-01T00:00:00:00000-07:00".
    #[bpaf(positional("TS"), some("must specify at least one timestamp"))]
    timestamps: Vec<String>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    for timestamp in &args.timestamps {
        let t = Time::parse(timestamp)?;
        println!("{} == {}", t, t.0);
    }
    Ok(0)
}
