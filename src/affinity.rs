/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::error::{OrchestratorError, Result};
use itertools::Itertools;
use std::fmt;
use tracing::warn;

/// An ordered list of CPU ids assigned to a single execution unit.
///
/// Displays in the comma separated form understood by both `taskset --cpu-list` and
/// docker's `cpuset_cpus`, e.g. `4,5,0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuSet(Vec<usize>);

impl CpuSet {
    pub fn cores(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().join(","))
    }
}

/// Allocates `core_cnt` cores beginning at `start` on this host.
///
/// See [`cpu_set_with_total`].
pub fn cpu_set(start: usize, core_cnt: usize) -> Result<CpuSet> {
    cpu_set_with_total(start, core_cnt, num_cpus::get())
}

/// Allocates `core_cnt` consecutive core ids beginning at `start`, wrapping around
/// `total_cores`.
///
/// Asking for more cores than the host has is not an error: the request is clamped to
/// `total_cores` and a warning is logged. Each wrapped core is warned about as well.
///
/// # Errors
///
/// Returns [`OrchestratorError::Configuration`] if `core_cnt` is zero or the host reports no
/// cores at all.
pub fn cpu_set_with_total(start: usize, core_cnt: usize, total_cores: usize) -> Result<CpuSet> {
    if core_cnt == 0 {
        return Err(OrchestratorError::Configuration(
            "there should be at least one core assigned to each execution unit".to_string(),
        ));
    }
    if total_cores == 0 {
        return Err(OrchestratorError::Configuration(
            "host reports zero cores".to_string(),
        ));
    }

    let core_cnt = if core_cnt > total_cores {
        warn!(
            "requested core count {} exceeds total core count {}, using {} instead!",
            core_cnt, total_cores, total_cores
        );
        total_cores
    } else {
        core_cnt
    };

    let cores = (0..core_cnt)
        .map(|i| {
            let core = start + i;
            if core >= total_cores {
                let wrapped = core % total_cores;
                warn!(
                    "core index exceeded total core count, wrap around to core {} -> {}",
                    core, wrapped
                );
                wrapped
            } else {
                core
            }
        })
        .collect();

    Ok(CpuSet(cores))
}
