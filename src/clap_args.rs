/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one batch of execution units
    Run {
        /// Path to the lockstep.toml file
        #[arg(short, long, default_value = "lockstep.toml")]
        config: PathBuf,
    },

    /// Validate the config and print the planned units without launching anything
    Check {
        #[arg(short, long, default_value = "lockstep.toml")]
        config: PathBuf,
    },
}

pub fn parse() -> Args {
    Args::parse()
}
