/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::config::PluginConfig;
use anyhow::Context;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::path::Path;
use subprocess::{Exec, NullFile, Popen};
use tracing::{debug, info, warn};

/// When a plugin runs relative to the start signal.
#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTime {
    /// Before monitors start and the start file is created.
    Pre,
    /// Spliced into the command of every unit.
    With,
    /// Right after the start file is created.
    Post,
    /// During cleanup.
    Cleanup,
}

/// Values available to plugin commands.
#[derive(Debug, Clone, Copy)]
pub struct PluginContext<'a> {
    pub n_units: usize,
    pub homedir: &'a Path,
    pub res_dir: &'a Path,
}

pub trait Plugin: Send {
    fn name(&self) -> &str;

    fn exec_time(&self) -> ExecutionTime;

    /// The command fragment of this plugin, used by `with` plugins.
    fn get_command(&self, ctx: &PluginContext) -> String;

    fn execute(&mut self, ctx: &PluginContext) -> anyhow::Result<()>;

    /// Stops whatever the plugin left running. Must be safe to call more than once.
    fn stop(&mut self) -> anyhow::Result<()>;
}

/// A plugin backed by a shell command.
///
/// Foreground plugins run to completion and fail on a non-zero exit. Background plugins are
/// spawned detached and killed by [`Plugin::stop`].
pub struct ShellPlugin {
    config: PluginConfig,
    child: Option<Popen>,
}

impl ShellPlugin {
    pub fn new(config: PluginConfig) -> Self {
        Self {
            config,
            child: None,
        }
    }

    fn render(template: &str, ctx: &PluginContext) -> String {
        template
            .replace("{n_units}", &ctx.n_units.to_string())
            .replace("{homedir}", &ctx.homedir.to_string_lossy())
            .replace("{res_dir}", &ctx.res_dir.to_string_lossy())
    }
}

impl Plugin for ShellPlugin {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn exec_time(&self) -> ExecutionTime {
        self.config.timing
    }

    fn get_command(&self, ctx: &PluginContext) -> String {
        Self::render(&self.config.command, ctx)
    }

    fn execute(&mut self, ctx: &PluginContext) -> anyhow::Result<()> {
        let command = self.get_command(ctx);
        let exec = Exec::shell(&command).cwd(ctx.res_dir);

        if self.config.background {
            debug!("starting background plugin {}: {}", self.config.name, command);
            let child = exec
                .stdout(NullFile)
                .stderr(NullFile)
                .detached()
                .popen()
                .context(format!("Failed to spawn plugin {}", self.config.name))?;
            self.child = Some(child);
            return Ok(());
        }

        debug!("running plugin {}: {}", self.config.name, command);
        let status = exec
            .join()
            .context(format!("Failed to run plugin {}", self.config.name))?;
        if !status.success() {
            anyhow::bail!(
                "Plugin {} failed with {:?}. Command: {}",
                self.config.name,
                status,
                command
            );
        }
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(mut child) = self.child.take() {
            if child.poll().is_none() {
                child
                    .kill()
                    .context(format!("Failed to kill plugin {}", self.config.name))?;
                child.wait()?;
            }
        }

        if let Some(stop) = &self.config.stop {
            let status = Exec::shell(stop).join()?;
            if !status.success() {
                warn!("stop command of plugin {} failed: {}", self.config.name, stop);
            }
        }
        Ok(())
    }
}

/// Runs the configured plugins at their execution time.
#[derive(Default)]
pub struct PluginRunner {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginRunner {
    pub fn new(plugins: Vec<Box<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn from_config(plugins: &[PluginConfig]) -> Self {
        Self::new(
            plugins
                .iter()
                .cloned()
                .map(|cfg| Box::new(ShellPlugin::new(cfg)) as Box<dyn Plugin>)
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Command fragments of all `with` plugins, in configuration order.
    pub fn with_commands(&self, ctx: &PluginContext) -> String {
        self.plugins
            .iter()
            .filter(|p| p.exec_time() == ExecutionTime::With)
            .map(|p| p.get_command(ctx))
            .join(" ")
    }

    /// Executes every plugin registered for `exec_time`, stopping at the first failure.
    pub fn call(&mut self, exec_time: ExecutionTime, ctx: &PluginContext) -> anyhow::Result<()> {
        for plugin in self
            .plugins
            .iter_mut()
            .filter(|p| p.exec_time() == exec_time)
        {
            info!("executing {:?} plugin {}", exec_time, plugin.name());
            plugin.execute(ctx)?;
        }
        Ok(())
    }

    /// Stops all plugins. Failures are logged and do not prevent the remaining plugins from
    /// being stopped.
    pub fn stop_all(&mut self) {
        for plugin in self.plugins.iter_mut() {
            if let Err(e) = plugin.stop() {
                warn!("failed to stop plugin {}: {}", plugin.name(), e);
            }
        }
    }
}
