/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::path::{Path, PathBuf};

/// Where the home directory is mounted inside every container unit.
pub const CONTAINER_HOME: &str = "/home";

/// Directory layout shared by the executer and all of its units.
///
/// * `home_dir` - the orchestrator's home directory, bind mounted into containers.
/// * `app_dir` - directory (relative to home) holding the start file and unit outputs.
/// * `results_dir` - where monitors, plugins and the result merger write their files.
#[derive(Debug, Clone)]
pub struct Workspace {
    home_dir: PathBuf,
    app_dir: PathBuf,
    results_dir: PathBuf,
}

impl Workspace {
    pub fn new(home_dir: &Path, app_dir: &Path, results_dir: &Path) -> Self {
        let home_dir = absolute(home_dir);
        let results_dir = if results_dir.is_absolute() {
            results_dir.to_path_buf()
        } else {
            home_dir.join(results_dir)
        };

        Self {
            home_dir,
            app_dir: app_dir.to_path_buf(),
            results_dir,
        }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Absolute host path of the shared application directory.
    pub fn app_dir(&self) -> PathBuf {
        if self.app_dir.is_absolute() {
            self.app_dir.clone()
        } else {
            self.home_dir.join(&self.app_dir)
        }
    }

    pub fn sentinel(&self) -> PathBuf {
        self.app_dir().join("start")
    }

    pub fn output_file(&self, unit_name: &str) -> PathBuf {
        self.app_dir().join(unit_name)
    }

    /// Translates a host path into the path a container unit sees for the same file.
    ///
    /// Only paths below the home directory are visible under [`CONTAINER_HOME`]; anything
    /// else is returned unchanged.
    pub fn container_path(&self, host_path: &Path) -> PathBuf {
        match host_path.strip_prefix(&self.home_dir) {
            Ok(rel) => Path::new(CONTAINER_HOME).join(rel),
            Err(_) => host_path.to_path_buf(),
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.app_dir())?;
        std::fs::create_dir_all(&self.results_dir)
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
