// This file is part of Kestrel NVR, a security camera network video recorder.
// Copyright (C) 2024 The Kestrel NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

#[derive(Bpaf, Debug)]
pub struct Args {
    /// Directory holding the SQLite3 index database.
    ///
    /// This is typically on a flash device.
    #[bpaf(argument("PATH"), fallback_with(crate::default_db_dir))]
    db_dir: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let (_db_dir, mut conn) = super::open_conn(&args.db_dir, super::OpenMode::Create)?;

    // Check if the database has already been initialized.
    if let Some(v) = db::get_schema_version(&conn)? {
        info!("Database is already initialized with schema version {}.", v);
        return Ok(0);
    }

    db::init(&mut conn)?;
    info!("Database initialized.");
    Ok(0)
}
