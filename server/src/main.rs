// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use bpaf::Bpaf;
use tracing::{debug, error, trace};

mod cmds;
mod h264;
mod json;
mod mmapfile;
mod mp4;
mod resource;
mod slices;
mod stream;
mod streamer;
mod web;

/// Kestrel NVR: security camera network video recorder.
#[derive(Bpaf, Debug)]
#[bpaf(options, version)]
enum Args {
    /// Initializes a database.
    #[bpaf(command)]
    Init(#[bpaf(external(cmds::init::args))] cmds::init::Args),

    /// Runs the server, saving recordings and allowing web access.
    #[bpaf(command)]
    Run(#[bpaf(external(cmds::run::args))] cmds::run::Args),

    /// Translates between integer and human-readable timestamps.
    #[bpaf(command)]
    Ts(#[bpaf(external(cmds::ts::args))] cmds::ts::Args),
}

impl Args {
    fn run(self) -> Result<i32, base::Error> {
        match self {
            Args::Init(a) => cmds::init::run(a),
            Args::Run(a) => cmds::run::run(a),
            Args::Ts(a) => cmds::ts::run(a),
        }
    }
}

/// Returns the default database dir, for argument parsing with
/// `bpaf(fallback_with(...))`.
fn default_db_dir() -> Result<std::path::PathBuf, std::convert::Infallible> {
    Ok("/var/lib/kestrel-nvr/db".into())
}

/// Returns the default sample file dir, for argument parsing with
/// `bpaf(fallback_with(...))`.
fn default_sample_file_dir() -> Result<std::path::PathBuf, std::convert::Infallible> {
    Ok("/var/lib/kestrel-nvr/sample".into())
}

fn main() {
    base::tracing_setup::install();

    // Default to `--help` when no subcommand is specified.
    if std::env::args_os().len() < 2 {
        std::process::exit(
            args()
                .run_inner(bpaf::Args::from(&["--help"]))
                .unwrap_err()
                .exit_code(),
        );
    }

    let args = args().run();
    trace!("Parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            let e = failure::Error::from(e);
            error!("Exiting due to error: {}", base::prettify_failure(&e));
            std::process::exit(1);
        }
        Ok(rv) => {
            debug!("Exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
