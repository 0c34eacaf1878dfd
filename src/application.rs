/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::error::{OrchestratorError, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Describes one benchmarked application.
///
/// `command` is a template, placeholders are replaced by [`Application::get_cmd`]:
///
/// | placeholder      | value                                          |
/// |------------------|------------------------------------------------|
/// | `{plugins}`      | command fragments of all `with` plugins        |
/// | `{threads}`      | number of threads                              |
/// | `{duration}`     | benchmark duration in seconds                  |
/// | `{noise}`        | noise level                                    |
/// | `{initial_size}` | initial size, or the unit's port if configured |
/// | `{port}`         | the unit's port (empty without networking)     |
/// | `{index}`        | index of the unit                              |
/// | `{n_units}`      | total number of units                          |
/// | `{work_dir}`     | working directory                              |
/// | `{homedir}`      | home directory                                 |
/// | `{res_dir}`      | results directory as seen by the unit          |
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct Application {
    pub name: String,
    pub command: String,
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub cd: bool,
    pub adapter: Option<Adapter>,
}

/// Runtime values substituted into an application's command template.
#[derive(Debug, Clone)]
pub struct CommandParams<'a> {
    pub plugins: &'a str,
    pub threads: u32,
    pub duration: u64,
    pub noise: u32,
    pub initial_size: u64,
    pub port: Option<u16>,
    pub index: usize,
    pub n_units: usize,
    pub work_dir: &'a Path,
    pub homedir: &'a Path,
    pub res_dir: &'a Path,
}

impl Application {
    pub fn get_cmd(&self, params: &CommandParams) -> String {
        let port = params.port.map(|p| p.to_string()).unwrap_or_default();
        self.command
            .replace("{plugins}", params.plugins)
            .replace("{threads}", &params.threads.to_string())
            .replace("{duration}", &params.duration.to_string())
            .replace("{noise}", &params.noise.to_string())
            .replace("{initial_size}", &params.initial_size.to_string())
            .replace("{port}", &port)
            .replace("{index}", &params.index.to_string())
            .replace("{n_units}", &params.n_units.to_string())
            .replace("{work_dir}", &params.work_dir.to_string_lossy())
            .replace("{homedir}", &params.homedir.to_string_lossy())
            .replace("{res_dir}", &params.res_dir.to_string_lossy())
    }

    /// The `cd <path> && ` prefix for applications that must run from their own directory.
    pub fn change_dir(&self) -> Result<Option<String>> {
        if !self.cd {
            return Ok(None);
        }

        let path = self.path.as_ref().ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "path is not set while change directory is requested for app {}",
                self.name
            ))
        })?;
        let path = path.to_string_lossy();
        let quoted = shlex::try_quote(&path)
            .map_err(|e| OrchestratorError::Configuration(format!("invalid path {path}: {e}")))?;

        Ok(Some(format!("cd {} && ", quoted)))
    }

    /// Brings raw unit output into the `key=value;...` line format.
    pub fn adapt(&self, raw: &str) -> Result<String> {
        match &self.adapter {
            Some(adapter) => adapter.adapt(raw),
            None => Ok(raw.to_string()),
        }
    }
}

/// Transforms the raw output of an application into `key=value;...` lines.
pub trait OutputAdapter {
    fn adapt(&self, raw: &str) -> Result<String>;
}

/// Built-in output adapters.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Adapter {
    /// Each non-empty line is a JSON object. All objects are merged into one record, later
    /// lines overriding earlier ones.
    Json,
    /// Each non-empty line is a `key: value` or `key=value` pair, all joined into one record.
    Lines,
}

impl OutputAdapter for Adapter {
    fn adapt(&self, raw: &str) -> Result<String> {
        match self {
            Adapter::Json => {
                let mut merged = serde_json::Map::new();
                for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    merged.extend(serde_json::from_str::<serde_json::Map<String, Value>>(line)?);
                }
                Ok(merged
                    .iter()
                    .map(|(k, v)| match v {
                        Value::String(s) => format!("{k}={s}"),
                        v => format!("{k}={v}"),
                    })
                    .join(";"))
            }

            Adapter::Lines => Ok(raw
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| match l.split_once('=').or_else(|| l.split_once(':')) {
                    Some((k, v)) => format!("{}={}", k.trim(), v.trim()),
                    None => l.to_string(),
                })
                .join(";")),
        }
    }
}
