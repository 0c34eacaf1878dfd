/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use thiserror::Error;

/// Everything that can stop a batch from running to completion.
///
/// Each variant is fatal for the batch. The executer always runs its cleanup before handing
/// one of these back to the caller, so by the time you see it no unit is left running.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Bad configuration detected before anything was launched.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A port one of the units needs is already bound on this host.
    #[error("port {port} is already in use, make sure ports [{first}:{last}] are free to use")]
    ResourceConflict { port: u16, first: u16, last: u16 },

    /// The process or container runtime refused to start a unit.
    #[error("unable to launch execution unit {unit}")]
    LaunchFailure { unit: String },

    /// A unit exited with a non-zero status.
    #[error("execution unit {unit} has failed/or crashed with exit code {code}")]
    UnitFailed { unit: String, code: i64 },

    /// A unit gave up waiting for the start signal.
    #[error("execution unit {unit} never received the start signal")]
    BarrierTimeout { unit: String },

    /// A PRE or POST plugin failed, or a monitor could not be started.
    #[error("{phase} failed: {message}")]
    Hook { phase: String, message: String },

    /// A shutdown signal arrived while the batch was running.
    #[error("interrupted by a shutdown signal")]
    Interrupted,

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Short stable label, used in log lines.
    pub fn as_label(&self) -> &'static str {
        match self {
            OrchestratorError::Configuration(_) => "configuration",
            OrchestratorError::ResourceConflict { .. } => "resource_conflict",
            OrchestratorError::LaunchFailure { .. } => "launch_failure",
            OrchestratorError::UnitFailed { .. } => "runtime_failure",
            OrchestratorError::BarrierTimeout { .. } => "barrier_timeout",
            OrchestratorError::Hook { .. } => "hook",
            OrchestratorError::Interrupted => "interrupted",
            OrchestratorError::Docker(_) => "docker",
            OrchestratorError::Io(_) => "io",
            OrchestratorError::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
