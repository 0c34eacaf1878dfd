/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod container;
pub mod process;

use crate::{
    affinity::CpuSet,
    application::Application,
    barrier::{remove_if_exists, StartBarrier, BARRIER_TIMEOUT_EXIT_CODE},
    config::ExecutionType,
    error::{OrchestratorError, Result},
    workspace::{Workspace, CONTAINER_HOME},
};
use container::ContainerUnit;
use itertools::Itertools;
use process::ProcessUnit;
use std::{fs, path::PathBuf};
use tracing::error;

/// `<C|N><3 digit index>_<app name>`, `C` for containers and `N` for native processes.
pub fn unit_name(kind: ExecutionType, idx: usize, app_name: &str) -> String {
    let prefix = match kind {
        ExecutionType::Container => "C",
        ExecutionType::Process => "N",
    };
    format!("{}{:03}_{}", prefix, idx, app_name)
}

/// State shared by every kind of execution unit.
#[derive(Debug, Clone)]
pub struct UnitBase {
    pub idx: usize,
    pub name: String,
    pub app: Application,
    pub workspace: Workspace,
    pub barrier: StartBarrier,
}

impl UnitBase {
    pub fn new(
        kind: ExecutionType,
        idx: usize,
        app: Application,
        workspace: Workspace,
        barrier: StartBarrier,
    ) -> Self {
        Self {
            idx,
            name: unit_name(kind, idx, &app.name),
            app,
            workspace,
            barrier,
        }
    }

    /// Host path of the file the unit's stdout is redirected to.
    pub fn output_file(&self) -> PathBuf {
        self.workspace.output_file(&self.name)
    }

    /// Host path of the file the preamble creates when the start signal never came.
    pub fn timeout_marker(&self) -> PathBuf {
        self.workspace
            .output_file(&format!("{}.barrier_timeout", self.name))
    }

    /// Clears what a previous run of the same unit may have left behind.
    fn prepare_launch(&self) -> Result<()> {
        remove_if_exists(&self.timeout_marker())
    }

    /// The adapted output as a single `k=v;` line, whatever the number of lines the
    /// application printed.
    fn output(&self) -> Result<String> {
        let raw = fs::read_to_string(self.output_file())?;
        let adapted = self.app.adapt(&raw)?;
        let fields = adapted
            .lines()
            .map(|line| line.trim().trim_end_matches(';'))
            .filter(|line| !line.is_empty())
            .join(";");
        Ok(format!(
            "execution_unit={};app={};{}",
            self.name, self.app.name, fields
        ))
    }

    fn check_exit(&self, code: i64) -> Result<()> {
        match code {
            0 => Ok(()),
            BARRIER_TIMEOUT_EXIT_CODE if self.timeout_marker().exists() => {
                error!("{} gave up waiting for the start signal", self.name);
                Err(OrchestratorError::BarrierTimeout {
                    unit: self.name.clone(),
                })
            }
            code => {
                error!(
                    "{} has failed/or crashed with exit code {}",
                    self.name, code
                );
                Err(OrchestratorError::UnitFailed {
                    unit: self.name.clone(),
                    code,
                })
            }
        }
    }
}

/// One running instance of a benchmarked application.
pub enum ExecutionUnit {
    Container(ContainerUnit),
    Process(ProcessUnit),
}

impl ExecutionUnit {
    fn base(&self) -> &UnitBase {
        match self {
            ExecutionUnit::Container(unit) => &unit.base,
            ExecutionUnit::Process(unit) => &unit.base,
        }
    }

    pub fn kind(&self) -> ExecutionType {
        match self {
            ExecutionUnit::Container(_) => ExecutionType::Container,
            ExecutionUnit::Process(_) => ExecutionType::Process,
        }
    }

    pub fn idx(&self) -> usize {
        self.base().idx
    }

    pub fn name(&self) -> &str {
        &self.base().name
    }

    pub fn app(&self) -> &Application {
        &self.base().app
    }

    pub fn output_file(&self) -> PathBuf {
        self.base().output_file()
    }

    pub fn core_set(&self) -> &CpuSet {
        match self {
            ExecutionUnit::Container(unit) => &unit.core_set,
            ExecutionUnit::Process(unit) => &unit.core_set,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            ExecutionUnit::Container(unit) => unit.port,
            ExecutionUnit::Process(unit) => unit.port,
        }
    }

    /// The results directory as seen from inside the unit.
    pub fn results_dir(&self) -> PathBuf {
        let workspace = &self.base().workspace;
        match self {
            ExecutionUnit::Container(_) => workspace.container_path(workspace.results_dir()),
            ExecutionUnit::Process(_) => workspace.results_dir().to_path_buf(),
        }
    }

    /// The home directory as seen from inside the unit.
    pub fn home_dir(&self) -> PathBuf {
        let workspace = &self.base().workspace;
        match self {
            ExecutionUnit::Container(_) => PathBuf::from(CONTAINER_HOME),
            ExecutionUnit::Process(_) => workspace.home_dir().to_path_buf(),
        }
    }

    /// The application directory as seen from inside the unit.
    pub fn work_dir(&self) -> PathBuf {
        let workspace = &self.base().workspace;
        match self {
            ExecutionUnit::Container(_) => workspace.container_path(&workspace.app_dir()),
            ExecutionUnit::Process(_) => workspace.app_dir(),
        }
    }

    /// Starts the unit detached, blocked on the start barrier.
    ///
    /// Returns `Ok(false)` if the runtime refused to start the unit.
    pub async fn launch(&mut self, command: &str) -> Result<bool> {
        match self {
            ExecutionUnit::Container(unit) => unit.launch(command).await,
            ExecutionUnit::Process(unit) => unit.launch(command).await,
        }
    }

    /// Blocks until the unit terminates. A non-zero exit status is an error.
    pub async fn wait(&mut self) -> Result<()> {
        match self {
            ExecutionUnit::Container(unit) => unit.wait().await,
            ExecutionUnit::Process(unit) => unit.wait().await,
        }
    }

    /// Stops the unit and everything it started. Safe to call on units that were never
    /// launched or are already gone.
    pub async fn stop(&mut self) {
        match self {
            ExecutionUnit::Container(unit) => unit.stop().await,
            ExecutionUnit::Process(unit) => unit.stop().await,
        }
    }

    /// The unit's adapted output, prefixed with `execution_unit=<name>;app=<app>;`.
    pub fn output(&self) -> Result<String> {
        self.base().output()
    }
}
