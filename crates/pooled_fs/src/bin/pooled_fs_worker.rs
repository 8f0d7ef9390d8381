// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Worker process for `pooled_fs`.
//!
//! Speaks the framed protocol on stdin and stdout. Logs go to stderr and are filtered with
//! `RUST_LOG` (warnings and errors by default).

use std::io::{BufWriter, stdin, stdout};
use std::process::ExitCode;

use tracing::{Level, event};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

fn main() -> ExitCode {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    match pooled_fs::serve(stdin().lock(), BufWriter::new(stdout().lock())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            event!(Level::ERROR, message = "worker stopped", error = %e);
            ExitCode::FAILURE
        }
    }
}
