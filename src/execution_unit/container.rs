/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::UnitBase;
use crate::{
    affinity::CpuSet,
    config::NicConfig,
    error::{OrchestratorError, Result},
    workspace::CONTAINER_HOME,
};
use anyhow::Context;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions, WaitContainerOptions,
    },
    errors::Error as DockerError,
    image::CreateImageOptions,
    models::{HostConfig, MountPoint, PortBinding},
    Docker,
};
use futures_util::{StreamExt, TryStreamExt};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use subprocess::{Exec, NullFile};
use sysinfo::System;
use tracing::{debug, error, info, warn};

/// Host paths bound into every container in addition to the home directory.
static SYSTEM_BINDS: [&str; 4] = ["/usr", "/mnt", "/lib/modules", "/etc"];

static DEFAULT_NIC_SCRIPT: &str = "../scripts/add-nic-to-container.sh";

/// An execution unit running inside its own docker container.
pub struct ContainerUnit {
    pub(crate) base: UnitBase,
    pub(crate) core_set: CpuSet,
    pub(crate) port: Option<u16>,
    image: String,
    nic: Option<NicConfig>,
    nic_script: Option<PathBuf>,
    docker: Docker,
    container_id: Option<String>,
}

impl ContainerUnit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base: UnitBase,
        docker: Docker,
        image: String,
        core_set: CpuSet,
        port: Option<u16>,
        nic: Option<NicConfig>,
        nic_script: Option<PathBuf>,
    ) -> Self {
        Self {
            base,
            core_set,
            port,
            image,
            nic,
            nic_script,
            docker,
            container_id: None,
        }
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    /// The command line run by `bash -c` inside the container.
    pub fn wrap_command(&self, command: &str) -> Result<String> {
        let workspace = &self.base.workspace;
        let preamble = self
            .base
            .barrier
            .preamble(
                &workspace.container_path(self.base.barrier.sentinel()),
                &workspace.container_path(&self.base.timeout_marker()),
            )?;
        let change_dir = self.base.app.change_dir()?.unwrap_or_default();

        let output = workspace.container_path(&self.base.output_file());
        let output = output.to_string_lossy();
        let output = shlex::try_quote(&output).map_err(|e| {
            OrchestratorError::Configuration(format!("invalid output path {}: {}", output, e))
        })?;

        Ok(format!("{}{}{} > {}", preamble, change_dir, command, output))
    }

    fn container_config(&self, commands: String, host_home_dir: &Path) -> Config<String> {
        let mut binds = vec![format!(
            "{}:{}:rw",
            host_home_dir.to_string_lossy(),
            CONTAINER_HOME
        )];
        binds.extend(SYSTEM_BINDS.iter().map(|p| format!("{p}:{p}:rw")));

        let mut host_config = HostConfig {
            binds: Some(binds),
            cpuset_cpus: Some(self.core_set.to_string()),
            privileged: Some(true),
            ..Default::default()
        };

        let mut config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["bash".to_string(), "-c".to_string(), commands]),
            working_dir: Some(CONTAINER_HOME.to_string()),
            ..Default::default()
        };

        if let Some(port) = self.port {
            config.exposed_ports = Some(HashMap::from([(format!("{}/tcp", port), HashMap::new())]));
            host_config.port_bindings = Some(HashMap::from([(
                format!("{}/tcp", port),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.to_string()),
                }]),
            )]));
        }

        config.host_config = Some(host_config);
        config
    }

    pub(crate) async fn launch(&mut self, command: &str) -> Result<bool> {
        let commands = self.wrap_command(command)?;
        self.base.prepare_launch()?;

        // a leftover container with the same name would make creation fail
        self.stop().await;

        let Some(host_home_dir) = self.host_home_dir().await else {
            return Ok(false);
        };

        info!("Starting Container: {}", self.base.name);
        let config = self.container_config(commands, &host_home_dir);
        let create_options = CreateContainerOptions {
            name: self.base.name.clone(),
            ..Default::default()
        };

        let container = match self
            .docker
            .create_container(Some(create_options), config)
            .await
        {
            Ok(container) => container,
            Err(e) => {
                error!("Could not create container {}: {}", self.base.name, e);
                return Ok(false);
            }
        };
        self.container_id = Some(container.id.clone());

        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            error!("Could not start container {}: {}", self.base.name, e);
            return Ok(false);
        }

        if let Some(nic) = self.nic.clone() {
            if let Err(e) = self.add_nic(&nic).await {
                error!("Could not attach {} to {}: {:#}", nic.nic, self.base.name, e);
                return Ok(false);
            }
        }

        info!(
            "Container {} is created, will run on {} => {:?}, and will run on cores={} and waiting for start signal",
            self.base.name, self.base.idx, self.port, self.core_set
        );
        Ok(true)
    }

    pub(crate) async fn wait(&mut self) -> Result<()> {
        info!("Waiting for Container: {} to stop", self.base.name);
        let mut stream = Box::pin(
            self.docker
                .wait_container(&self.base.name, None::<WaitContainerOptions<String>>),
        );

        let code = match stream.next().await {
            Some(Ok(response)) => response.status_code,
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(OrchestratorError::UnitFailed {
                    unit: self.base.name.clone(),
                    code: -1,
                })
            }
        };

        self.base.check_exit(code)
    }

    pub(crate) async fn stop(&mut self) {
        let name = self.base.name.clone();

        if let Err(e) = self
            .docker
            .stop_container(&name, None::<StopContainerOptions>)
            .await
        {
            if !is_not_found(&e) {
                debug!("stopping container {}: {}", name, e);
            }
        }

        match self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => info!("Container: {} has been stopped and removed", name),
            Err(e) if is_not_found(&e) => {}
            Err(e) => warn!("failed to remove container {}: {}", name, e),
        }

        if self.nic.is_some() {
            let netns = name.clone();
            let res = tokio::task::spawn_blocking(move || {
                Exec::cmd("sudo")
                    .args(&["ip", "netns", "del", netns.as_str()])
                    .stdout(NullFile)
                    .stderr(NullFile)
                    .join()
            })
            .await;
            match res {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!("removing network namespace {}: {}", name, e),
                Err(e) => debug!("removing network namespace {}: {}", name, e),
            }
        }

        self.container_id = None;
    }

    /// Moves the configured NIC into the container's network namespace.
    async fn add_nic(&self, nic: &NicConfig) -> anyhow::Result<()> {
        let inspect = self
            .docker
            .inspect_container(&self.base.name, None::<InspectContainerOptions>)
            .await?;
        let pid = inspect
            .state
            .and_then(|state| state.pid)
            .context("Container should have a root PID")?;

        let irq_affinity = nic
            .core_affinity_offset
            .clone()
            .unwrap_or_else(|| self.core_set.to_string());
        let script = self
            .nic_script
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_NIC_SCRIPT));

        let args = vec![
            nic.nic.clone(),
            irq_affinity,
            pid.to_string(),
            self.base.name.clone(),
            nic.ip.clone(),
            nic.netmask.clone(),
        ];
        let status = tokio::task::spawn_blocking(move || {
            Exec::cmd("sudo").arg(script).args(&args).join()
        })
        .await?
        .context("Failed to run the NIC setup script")?;
        if !status.success() {
            anyhow::bail!("NIC setup script exited with {:?}", status);
        }
        Ok(())
    }

    /// The host path of the home directory.
    ///
    /// When the orchestrator itself runs inside a container, binding its home directory would
    /// mount whatever the host has at that path. Instead, the bind source of the orchestrator's
    /// own container whose destination is the home directory is used.
    async fn host_home_dir(&self) -> Option<PathBuf> {
        let home_dir = self.base.workspace.home_dir().to_path_buf();
        if !Path::new("/.dockerenv").exists() {
            return Some(home_dir);
        }

        let hostname = System::host_name()?;
        let inspect = match self
            .docker
            .inspect_container(&hostname, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) => {
                error!("Unable to determine orchestrator container: {}", e);
                return None;
            }
        };

        let mounts = inspect.mounts.unwrap_or_default();
        let source = find_bind_source(&mounts, &home_dir);
        if source.is_none() {
            error!(
                "orchestrator container doesn't map '{}'. Can't create containers",
                home_dir.display()
            );
        }
        source
    }
}

/// Finds the host source of the mount whose destination is `dest`.
pub fn find_bind_source(mounts: &[MountPoint], dest: &Path) -> Option<PathBuf> {
    mounts.iter().find_map(|mount| match (&mount.source, &mount.destination) {
        (Some(source), Some(destination)) if Path::new(destination) == dest => {
            debug!("volume bind: host: {} -> to: {}", source, destination);
            Some(PathBuf::from(source))
        }
        _ => None,
    })
}

fn is_not_found(e: &DockerError) -> bool {
    matches!(
        e,
        DockerError::DockerResponseServerError {
            status_code: 404 | 304,
            ..
        }
    )
}

/// Pulls `image` unless it is already present.
pub async fn ensure_image(docker: &Docker, image: &str) -> Result<()> {
    if docker.inspect_image(image).await.is_ok() {
        return Ok(());
    }

    info!("Docker image {} does not exist. Pulling it now...", image);
    docker
        .create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        )
        .try_for_each(|info| async move {
            if let Some(status) = info.status {
                debug!("{}", status);
            }
            Ok(())
        })
        .await?;
    Ok(())
}
