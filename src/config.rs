/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{application::Application, monitors::MonitorKind, plugins::ExecutionTime, platform};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    time::Duration,
};

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub containers: ContainersConfig,
    #[serde(rename(serialize = "app", deserialize = "app"))]
    pub apps: Vec<Application>,
    #[serde(default, rename(serialize = "plugin", deserialize = "plugin"))]
    pub plugins: Vec<PluginConfig>,
    #[serde(default, rename(serialize = "nic", deserialize = "nic"))]
    pub nics: Vec<NicConfig>,
}

impl Config {
    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config file {}", path.display()))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        let config = toml::from_str::<Config>(conf_str)
            .map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.apps.is_empty() {
            anyhow::bail!("At least one [[app]] must be configured");
        }

        let unit_count = self.benchmark.unit_count;
        if unit_count == 0 {
            anyhow::bail!("unit_count must be at least 1");
        }
        if self.apps.len() > 1 && unit_count < self.apps.len() {
            anyhow::bail!(
                "Minimum number of units must be greater or equal to the number of applications({}). Adjust `unit_count` and try again!",
                self.apps.len()
            );
        }
        if self.containers.core_count == 0 {
            anyhow::bail!("core_count must be at least 1");
        }
        if let Some(offsets) = &self.containers.core_affinity_offsets {
            if offsets.len() < unit_count {
                anyhow::bail!(
                    "core_affinity_offsets has {} entries but {} units are requested",
                    offsets.len(),
                    unit_count
                );
            }
        }
        if let Some(port) = self.containers.port {
            if port as usize + unit_count - 1 > u16::MAX as usize {
                anyhow::bail!("port range starting at {} exceeds {}", port, u16::MAX);
            }
        }

        Ok(())
    }

    /// Assigns an application to every unit, round-robin.
    pub fn apps_per_unit(&self) -> Vec<Application> {
        assign_round_robin(&self.apps, self.benchmark.unit_count)
    }

    pub fn is_multi_app(&self) -> bool {
        self.apps.len() > 1
    }

    pub fn nic(&self, idx: usize) -> Option<&NicConfig> {
        self.nics.get(idx)
    }
}

/// Returns `count` applications where the i-th is `apps[i % apps.len()]`.
pub fn assign_round_robin<T: Clone>(apps: &[T], count: usize) -> Vec<T> {
    if apps.is_empty() {
        return vec![];
    }
    (0..count).map(|i| apps[i % apps.len()].clone()).collect()
}

#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionType {
    Container,
    Process,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BenchmarkConfig {
    pub exec_env: ExecutionType,
    #[serde(default = "default_threads")]
    pub threads: u32,
    #[serde(default = "default_duration")]
    pub duration: u64,
    #[serde(default)]
    pub noise: u32,
    #[serde(default)]
    pub initial_size: u64,
    #[serde(default = "default_unit_count")]
    pub unit_count: usize,
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    #[serde(default = "default_barrier_timeout_secs")]
    pub barrier_timeout_secs: u64,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,
    #[serde(default = "default_app_dir")]
    pub app_dir: PathBuf,
    #[serde(default)]
    pub monitors: Vec<MonitorKind>,
    pub nic_script: Option<PathBuf>,
}

impl BenchmarkConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_secs(self.barrier_timeout_secs)
    }
}

fn default_threads() -> u32 {
    1
}
fn default_duration() -> u64 {
    5
}
fn default_unit_count() -> usize {
    1
}
fn default_settle_secs() -> u64 {
    5
}
fn default_barrier_timeout_secs() -> u64 {
    16 * 60
}
fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}
fn default_home_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_app_dir() -> PathBuf {
    PathBuf::from("apps")
}

/// Resources shared by all units, whatever their execution type.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ContainersConfig {
    pub image: Option<String>,
    #[serde(default = "default_core_count")]
    pub core_count: usize,
    pub core_affinity_offsets: Option<Vec<usize>>,
    pub port: Option<u16>,
}

impl Default for ContainersConfig {
    fn default() -> Self {
        Self {
            image: None,
            core_count: default_core_count(),
            core_affinity_offsets: None,
            port: None,
        }
    }
}

fn default_core_count() -> usize {
    1
}

impl ContainersConfig {
    /// The image to run, defaulting to one matching the host OS.
    pub fn image(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| platform::default_image(platform::get_os()).to_string())
    }

    /// Core affinity offsets for `count` units. Without explicit offsets, unit `i` starts at
    /// `core_count * i`.
    pub fn core_affinity_offsets(&self, count: usize) -> Vec<usize> {
        match &self.core_affinity_offsets {
            Some(offsets) => offsets.iter().take(count).copied().collect(),
            None => (0..count).map(|i| self.core_count * i).collect(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct PluginConfig {
    pub name: String,
    pub timing: ExecutionTime,
    pub command: String,
    pub stop: Option<String>,
    #[serde(default)]
    pub background: bool,
}

/// A NIC moved into a container's network namespace.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct NicConfig {
    pub nic: String,
    pub ip: String,
    pub netmask: String,
    /// IRQ affinity of the NIC, defaults to the container's CPU set.
    pub core_affinity_offset: Option<String>,
}
