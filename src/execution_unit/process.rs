/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::UnitBase;
use crate::{affinity::CpuSet, error::Result};
use std::{fs::File, process::Stdio};
use subprocess::{Exec, NullFile};
use sysinfo::{Pid, System};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// An execution unit running as a native process group on the host.
pub struct ProcessUnit {
    pub(crate) base: UnitBase,
    pub(crate) core_set: CpuSet,
    pub(crate) port: Option<u16>,
    child: Option<Child>,
    pgid: Option<u32>,
}

impl ProcessUnit {
    pub fn new(base: UnitBase, core_set: CpuSet, port: Option<u16>) -> Self {
        Self {
            base,
            core_set,
            port,
            child: None,
            pgid: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.id())
    }

    /// The process group of the launched unit, kept until the unit is stopped.
    pub fn pgid(&self) -> Option<u32> {
        self.pgid
    }

    /// The full shell line run for `command`: barrier preamble, optional `cd`, then the
    /// command pinned to the unit's cores.
    pub fn wrap_command(&self, command: &str) -> Result<String> {
        let preamble = self
            .base
            .barrier
            .preamble(self.base.barrier.sentinel(), &self.base.timeout_marker())?;
        let change_dir = self.base.app.change_dir()?.unwrap_or_default();
        Ok(format!(
            "{}{}taskset --cpu-list {} {}",
            preamble, change_dir, self.core_set, command
        ))
    }

    pub(crate) async fn launch(&mut self, command: &str) -> Result<bool> {
        let commands = self.wrap_command(command)?;
        self.base.prepare_launch()?;
        let outfile = File::create(self.base.output_file())?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&commands)
            .current_dir(self.base.workspace.home_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::from(outfile))
            .stderr(Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        match cmd.spawn() {
            Ok(child) => {
                info!("launched process {} with {}", self.base.name, commands);
                // process_group(0) makes the child the leader of its own group
                self.pgid = child.id();
                self.child = Some(child);
                Ok(true)
            }
            Err(e) => {
                error!("Could not launch process {}: {}", self.base.name, e);
                Ok(false)
            }
        }
    }

    pub(crate) async fn wait(&mut self) -> Result<()> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };

        let status = child.wait().await?;
        // killed by a signal
        let code = status.code().map(i64::from).unwrap_or(-1);
        debug!("process {} exited with {:?}", self.base.name, status);
        self.base.check_exit(code)
    }

    /// Kills everything the unit started: its process tree while the leader is alive, then
    /// its whole process group, even when the leader already exited.
    pub(crate) async fn stop(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        let mut child = self.child.take();

        let leader_running = match child.as_mut().map(|child| child.try_wait()) {
            Some(Ok(None)) => true,
            Some(Err(e)) => {
                warn!("unable to query process {}: {}", self.base.name, e);
                true
            }
            _ => false,
        };
        // the leader is not reaped yet, so its pid cannot have been reused
        if leader_running {
            if let Err(e) = tokio::task::spawn_blocking(move || kill_process_tree(pgid)).await {
                warn!("failed to kill process tree of {}: {}", self.base.name, e);
            }
        }
        kill_process_group(pgid).await;

        if let Some(mut child) = child {
            if let Err(e) = child.wait().await {
                warn!("failed to reap process {}: {}", self.base.name, e);
            }
        }
        info!("process {} has been stopped", self.base.name);
    }
}

/// Kills `pid` and all of its descendants, deepest first. Processes that are already gone are
/// ignored. Blocks while sysinfo scans the process table.
pub fn kill_process_tree(pid: u32) {
    let mut system = System::new_all();
    system.refresh_all();

    let mut tree = vec![Pid::from_u32(pid)];
    let mut i = 0;
    while i < tree.len() {
        let parent = tree[i];
        tree.extend(
            system
                .processes()
                .iter()
                .filter(|(_, proc)| proc.parent() == Some(parent))
                .map(|(child_pid, _)| *child_pid),
        );
        i += 1;
    }

    for pid in tree.iter().rev() {
        if let Some(proc) = system.process(*pid) {
            if !proc.kill() {
                debug!("unable to kill {}", pid);
            }
        }
    }
}

/// Sends SIGKILL to every process of group `pgid`. An empty group is not an error.
pub async fn kill_process_group(pgid: u32) {
    let res = tokio::task::spawn_blocking(move || {
        Exec::cmd("sh")
            .arg("-c")
            .arg(format!("kill -KILL -- -{}", pgid))
            .stdout(NullFile)
            .stderr(NullFile)
            .join()
    })
    .await;

    match res {
        Ok(Ok(status)) if status.success() => debug!("killed process group {}", pgid),
        Ok(Ok(_)) => debug!("process group {} is already empty", pgid),
        Ok(Err(e)) => warn!("unable to kill process group {}: {}", pgid, e),
        Err(e) => warn!("unable to kill process group {}: {}", pgid, e),
    }
}

/// Live (non-zombie) members of process group `pgid`, as listed by `pgrep`. `None` when
/// `pgrep` is not installed.
#[cfg(all(test, unix))]
pub(crate) fn live_group_members(pgid: u32) -> Option<Vec<u32>> {
    let out = std::process::Command::new("pgrep")
        .arg("-g")
        .arg(pgid.to_string())
        .output()
        .ok()?;
    let members = String::from_utf8_lossy(&out.stdout)
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| {
            // the state follows the parenthesised command name
            std::fs::read_to_string(format!("/proc/{}/stat", pid))
                .ok()
                .and_then(|stat| {
                    stat.rsplit_once(')')
                        .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                })
                .map(|zombie| !zombie)
                .unwrap_or(false)
        })
        .collect();
    Some(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        affinity::cpu_set_with_total, application::Application, barrier::StartBarrier,
        config::ExecutionType, error::OrchestratorError, workspace::Workspace,
    };
    use std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    };

    fn unit(dir: &Path, command_timeout: Duration) -> ProcessUnit {
        let workspace = Workspace::new(dir, Path::new("apps"), Path::new("results"));
        workspace.ensure_dirs().expect("should be able to create workspace");
        let barrier = StartBarrier::new(workspace.sentinel(), command_timeout);
        let base = UnitBase::new(
            ExecutionType::Process,
            0,
            Application {
                name: "sleep".to_string(),
                command: "sleep 1".to_string(),
                path: None,
                cd: false,
                adapter: None,
            },
            workspace,
            barrier,
        );
        ProcessUnit::new(base, cpu_set_with_total(0, 1, 1).unwrap(), None)
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("lockstep-process-{}", nanoid::nanoid!(8)))
    }

    #[test]
    fn wraps_the_command_with_preamble_and_pinning() -> anyhow::Result<()> {
        let dir = scratch_dir();
        let unit = unit(&dir, Duration::from_secs(1));
        let wrapped = unit.wrap_command("./bm -t 1")?;

        assert!(wrapped.starts_with("n=0; while [ ! -e "));
        assert!(wrapped.ends_with("taskset --cpu-list 0 ./bm -t 1"));

        fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[tokio::test]
    async fn stopping_an_unlaunched_unit_is_a_no_op() {
        let mut unit = unit(&scratch_dir(), Duration::from_secs(1));
        unit.stop().await;
        unit.stop().await;
        assert!(unit.wait().await.is_ok());
    }

    #[cfg(target_family = "unix")]
    mod unix {
        use super::*;

        fn has_taskset() -> bool {
            std::process::Command::new("taskset")
                .arg("--version")
                .output()
                .is_ok()
        }

        #[tokio::test]
        async fn stop_kills_the_whole_process_tree() -> anyhow::Result<()> {
            if !has_taskset() {
                return Ok(());
            }
            let dir = scratch_dir();
            let mut unit = unit(&dir, Duration::from_secs(30));
            unit.base.barrier.release()?;

            assert!(unit.launch("sh -c 'sleep 60 & sleep 60'").await?);
            let pid = unit.pid().expect("launched unit should have a pid");
            tokio::time::sleep(Duration::from_millis(500)).await;

            unit.stop().await;

            let mut system = System::new_all();
            system.refresh_all();
            assert!(system.process(Pid::from_u32(pid)).is_none());
            assert!(!system
                .processes()
                .values()
                .any(|p| p.parent() == Some(Pid::from_u32(pid))));

            fs::remove_dir_all(dir)?;
            Ok(())
        }

        #[tokio::test]
        async fn non_zero_exit_is_a_runtime_failure() -> anyhow::Result<()> {
            if !has_taskset() {
                return Ok(());
            }
            let dir = scratch_dir();
            let mut unit = unit(&dir, Duration::from_secs(30));
            unit.base.barrier.release()?;

            assert!(unit.launch("sh -c 'exit 3'").await?);
            match unit.wait().await {
                Err(OrchestratorError::UnitFailed { code, unit }) => {
                    assert_eq!(code, 3);
                    assert_eq!(unit, "N000_sleep");
                }
                other => panic!("expected a unit failure, got {:?}", other),
            }

            fs::remove_dir_all(dir)?;
            Ok(())
        }

        #[tokio::test]
        async fn stop_kills_background_work_left_by_an_exited_unit() -> anyhow::Result<()> {
            if !has_taskset() {
                return Ok(());
            }
            let dir = scratch_dir();
            let mut unit = unit(&dir, Duration::from_secs(30));
            unit.base.barrier.release()?;

            assert!(unit.launch("sh -c 'sleep 77 >/dev/null 2>&1 &'").await?);
            let pgid = unit.pgid().expect("launched unit should have a process group");
            unit.wait().await?;

            unit.stop().await;
            tokio::time::sleep(Duration::from_millis(300)).await;

            if let Some(members) = live_group_members(pgid) {
                assert!(members.is_empty(), "left in group {}: {:?}", pgid, members);
            }
            assert_eq!(unit.pgid(), None);

            fs::remove_dir_all(dir)?;
            Ok(())
        }

        #[tokio::test]
        async fn exit_code_124_from_the_app_is_a_runtime_failure() -> anyhow::Result<()> {
            if !has_taskset() {
                return Ok(());
            }
            let dir = scratch_dir();
            let mut unit = unit(&dir, Duration::from_secs(30));
            unit.base.barrier.release()?;

            assert!(unit.launch("sh -c 'exit 124'").await?);
            match unit.wait().await {
                Err(OrchestratorError::UnitFailed { code, .. }) => assert_eq!(code, 124),
                other => panic!("expected a unit failure, got {:?}", other),
            }
            assert!(!unit.base.timeout_marker().exists());

            fs::remove_dir_all(dir)?;
            Ok(())
        }

        #[tokio::test]
        async fn missing_start_signal_is_a_barrier_timeout() -> anyhow::Result<()> {
            let dir = scratch_dir();
            let mut unit = unit(&dir, Duration::from_millis(200));

            assert!(unit.launch("true").await?);
            assert!(matches!(
                unit.wait().await,
                Err(OrchestratorError::BarrierTimeout { .. })
            ));

            fs::remove_dir_all(dir)?;
            Ok(())
        }
    }
}
