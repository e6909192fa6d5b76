// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::path::PathBuf;

use clap::Parser;
use log::*;

use ringkv::config::Config;

/// An in-memory RESP key/value server driven by io_uring.
#[derive(Parser)]
#[command(name = "ringkv_server")]
struct Cli {
    /// Path to the INI configuration file. Defaults apply when omitted.
    config: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::read_from_file(path)?,
        None => Config::default(),
    };
    info!("{config}");

    ringkv::server::run(config)?;
    Ok(())
}
