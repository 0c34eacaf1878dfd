/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::error::{OrchestratorError, Result};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

/// Exit status of a unit whose preamble ran out of polls before the start file appeared.
pub const BARRIER_TIMEOUT_EXIT_CODE: i64 = 124;

/// How often the preamble checks for the start file.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default time a unit waits for the start signal (16 minutes).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(16 * 60);

/// Filesystem start barrier.
///
/// Every unit command is prefixed with a shell preamble that polls for the start file. The
/// executer creates that file once all units are launched, which releases every unit at the
/// same instant no matter how staggered the launches were.
#[derive(Debug, Clone)]
pub struct StartBarrier {
    sentinel: PathBuf,
    timeout: Duration,
}

impl StartBarrier {
    pub fn new(sentinel: PathBuf, timeout: Duration) -> Self {
        Self { sentinel, timeout }
    }

    pub fn sentinel(&self) -> &Path {
        &self.sentinel
    }

    pub fn poll_budget(&self) -> u128 {
        (self.timeout.as_millis() / POLL_INTERVAL.as_millis()).max(1)
    }

    /// Shell fragment that blocks until `sentinel_as_seen` exists.
    ///
    /// Both paths are as seen from the unit, which differs from the host path for container
    /// units. When the budget runs out the fragment creates `marker_as_seen` and exits the
    /// shell with [`BARRIER_TIMEOUT_EXIT_CODE`] instead of falling through into the command.
    /// The marker tells a barrier timeout apart from a command exiting with the same code.
    pub fn preamble(&self, sentinel_as_seen: &Path, marker_as_seen: &Path) -> Result<String> {
        Ok(format!(
            "n=0; while [ ! -e {sentinel} ]; do if [ $n -ge {budget} ]; then : > {marker}; exit {code}; fi; n=$((n+1)); sleep {interval}; done; ",
            sentinel = quote(sentinel_as_seen)?,
            marker = quote(marker_as_seen)?,
            budget = self.poll_budget(),
            code = BARRIER_TIMEOUT_EXIT_CODE,
            interval = POLL_INTERVAL.as_secs_f32(),
        ))
    }

    /// Creates the start file, releasing every waiting unit.
    pub fn release(&self) -> Result<()> {
        if let Some(parent) = self.sentinel.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::File::create(&self.sentinel)?;
        debug!("start file {} created", self.sentinel.display());
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.sentinel.exists()
    }

    /// Removes the start file if present.
    pub fn reset(&self) -> Result<()> {
        remove_if_exists(&self.sentinel)
    }
}

fn quote(path: &Path) -> Result<String> {
    let path = path.to_string_lossy();
    shlex::try_quote(&path)
        .map(|quoted| quoted.into_owned())
        .map_err(|e| OrchestratorError::Configuration(format!("invalid path {}: {}", path, e)))
}

/// Removes `path` if present.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
