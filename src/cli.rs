// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Command-line surface.
//!
//! ```text
//! Usage: flexdns [options]
//!       flexdns (-h | --help | --version)
//!
//! Options:
//!    -q, --quiet             Disable INFO messages, WARN and ERROR will remain
//!    -d, --debug             Turn on DEBUG messages (default is only INFO)
//!    -h, --help              Show this message
//!    -v, --version           Show the version of flexdns
//!    -c FILE, --config=FILE  Path to the Corefile, default is ./Corefile
//!    --validate              Parse and validate the Corefile, then exit
//!    --workers N             Number of Tokio runtime worker threads
//! ```

use std::path::PathBuf;

use clap::Parser;

/// Cli struct for all options managed with clap derive api.
#[derive(Debug, Parser)]
#[clap(name = "flexdns", version, about)]
pub struct Cli {
    /// Parse and validate the Corefile, then exit without binding any listener
    #[clap(long = "validate")]
    pub validate: bool,

    /// Number of runtime workers, defaults to the number of CPU cores
    #[clap(long = "workers")]
    pub workers: Option<usize>,

    /// Disable INFO messages, WARN and ERROR will remain
    #[clap(short = 'q', long = "quiet", conflicts_with = "debug")]
    pub quiet: bool,

    /// Turn on `DEBUG` messages (default is only `INFO`)
    #[clap(short = 'd', long = "debug", conflicts_with = "quiet")]
    pub debug: bool,

    /// Path to the Corefile, or "stdin" to read it from standard input
    #[clap(
        short = 'c',
        long = "config",
        default_value = "./Corefile",
        value_name = "FILE",
        value_hint = clap::ValueHint::FilePath,
    )]
    pub config: PathBuf,
}
