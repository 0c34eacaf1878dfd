/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    affinity::{cpu_set_with_total, CpuSet},
    application::{Application, CommandParams},
    barrier::StartBarrier,
    config::{Config, ExecutionType},
    error::{OrchestratorError, Result},
    execution_unit::{
        container::{ensure_image, ContainerUnit},
        process::ProcessUnit,
        ExecutionUnit, UnitBase,
    },
    monitors::MonitorSet,
    plugins::{ExecutionTime, PluginContext, PluginRunner},
    ports::ensure_ports_free,
    results::Record,
    signals,
    workspace::Workspace,
};
use bollard::Docker;
use colored::Colorize;
use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::select;
use tracing::{debug, error, info, warn};

/// Runtime values shared by every unit of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RunVariables {
    pub exec_env: ExecutionType,
    pub threads: u32,
    pub duration: u64,
    pub noise: u32,
    pub initial_size: u64,
    pub unit_count: usize,
    pub port_start: Option<u16>,
}

impl RunVariables {
    pub fn from_config(config: &Config) -> Self {
        Self {
            exec_env: config.benchmark.exec_env,
            threads: config.benchmark.threads,
            duration: config.benchmark.duration,
            noise: config.benchmark.noise,
            initial_size: config.benchmark.initial_size,
            unit_count: config.benchmark.unit_count,
            port_start: config.containers.port,
        }
    }

    /// The fields added to every saved result record.
    pub fn header(&self) -> Record {
        let exec_env = match self.exec_env {
            ExecutionType::Container => "container",
            ExecutionType::Process => "process",
        };
        Record::from([
            ("exec_env".to_string(), exec_env.to_string()),
            ("threads".to_string(), self.threads.to_string()),
            ("duration".to_string(), self.duration.to_string()),
            ("noise".to_string(), self.noise.to_string()),
            ("initial_size".to_string(), self.initial_size.to_string()),
            ("unit_count".to_string(), self.unit_count.to_string()),
        ])
    }
}

/// Where and on which resources a unit will run.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitPlan {
    pub idx: usize,
    pub app: Application,
    pub core_set: CpuSet,
    pub port: Option<u16>,
}

/// Assigns an application, a CPU set and a port to each of the `apps.len()` units.
///
/// `apps` must already hold one application per unit (see [`Config::apps_per_unit`]).
pub fn plan_units(
    config: &Config,
    apps: Vec<Application>,
    total_cores: usize,
) -> Result<Vec<UnitPlan>> {
    let unit_count = config.benchmark.unit_count;
    if apps.len() != unit_count {
        return Err(OrchestratorError::Configuration(format!(
            "{} applications given for {} units",
            apps.len(),
            unit_count
        )));
    }

    let offsets = config.containers.core_affinity_offsets(unit_count);
    if offsets.len() < unit_count {
        return Err(OrchestratorError::Configuration(format!(
            "core_affinity_offsets has {} entries but {} units are requested",
            offsets.len(),
            unit_count
        )));
    }

    apps.into_iter()
        .zip(offsets)
        .enumerate()
        .map(|(idx, (app, offset))| {
            let core_set =
                cpu_set_with_total(offset, config.containers.core_count, total_cores)?;
            let port = match config.containers.port {
                Some(base) => Some(u16::try_from(base as usize + idx).map_err(|_| {
                    OrchestratorError::Configuration(format!(
                        "port range starting at {} exceeds {}",
                        base,
                        u16::MAX
                    ))
                })?),
                None => None,
            };
            Ok(UnitPlan {
                idx,
                app,
                core_set,
                port,
            })
        })
        .collect()
}

/// Runs one batch of execution units in lockstep.
///
/// Units are launched blocked on the start barrier, released all at once by
/// [`Executer::signal_start`], and always torn down by [`Executer::cleanup`].
pub struct Executer {
    workspace: Workspace,
    barrier: StartBarrier,
    units: Vec<ExecutionUnit>,
    plugins: Arc<Mutex<PluginRunner>>,
    monitors: MonitorSet,
    settle: Duration,
    cleaned_up: bool,
}

impl Executer {
    pub fn new(
        workspace: Workspace,
        barrier: StartBarrier,
        plugins: PluginRunner,
        monitors: MonitorSet,
    ) -> Self {
        Self {
            workspace,
            barrier,
            units: vec![],
            plugins: Arc::new(Mutex::new(plugins)),
            monitors,
            settle: Duration::from_secs(5),
            cleaned_up: false,
        }
    }

    /// How long to wait between the last launch and the start signal.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Builds the executer and its units as described by `config`. For container batches
    /// the image is pulled first if it is missing.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let workspace = Workspace::new(
            &config.benchmark.home_dir,
            &config.benchmark.app_dir,
            &config.benchmark.results_dir,
        );
        workspace.ensure_dirs()?;

        let plans = plan_units(config, config.apps_per_unit(), num_cpus::get())?;
        let docker = match config.benchmark.exec_env {
            ExecutionType::Container => {
                let docker = Docker::connect_with_defaults()?;
                ensure_image(&docker, &config.containers.image()).await?;
                Some(docker)
            }
            ExecutionType::Process => None,
        };

        Self::from_plans(config, workspace, plans, docker)
    }

    /// Builds the executer from already planned units. `docker` is required for container
    /// batches.
    pub fn from_plans(
        config: &Config,
        workspace: Workspace,
        plans: Vec<UnitPlan>,
        docker: Option<Docker>,
    ) -> Result<Self> {
        let barrier = StartBarrier::new(workspace.sentinel(), config.benchmark.barrier_timeout());
        let plugins = PluginRunner::from_config(&config.plugins);
        let monitors = MonitorSet::from_kinds(&config.benchmark.monitors, workspace.results_dir());
        let mut executer = Executer::new(workspace, barrier, plugins, monitors)
            .with_settle(config.benchmark.settle());

        let kind = config.benchmark.exec_env;
        for plan in plans {
            let base = UnitBase::new(
                kind,
                plan.idx,
                plan.app,
                executer.workspace.clone(),
                executer.barrier.clone(),
            );
            let unit = match (kind, &docker) {
                (ExecutionType::Process, _) => {
                    ExecutionUnit::Process(ProcessUnit::new(base, plan.core_set, plan.port))
                }
                (ExecutionType::Container, Some(docker)) => {
                    ExecutionUnit::Container(ContainerUnit::new(
                        base,
                        docker.clone(),
                        config.containers.image(),
                        plan.core_set,
                        plan.port,
                        config.nic(plan.idx).cloned(),
                        config.benchmark.nic_script.clone(),
                    ))
                }
                (ExecutionType::Container, None) => {
                    return Err(OrchestratorError::Configuration(
                        "container units need a docker client".to_string(),
                    ))
                }
            };
            executer.add_exec_unit(unit);
        }

        Ok(executer)
    }

    pub fn add_exec_unit(&mut self, unit: ExecutionUnit) {
        self.units.push(unit);
    }

    pub fn units(&self) -> &[ExecutionUnit] {
        &self.units
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Runs `f` on the plugins from the blocking pool, plugins wait on shell commands.
    async fn with_plugins<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PluginRunner) -> T + Send + 'static,
    {
        let plugins = self.plugins.clone();
        let res = tokio::task::spawn_blocking(move || {
            let mut plugins = plugins.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut *plugins)
        })
        .await?;
        Ok(res)
    }

    async fn call_plugins(&self, exec_time: ExecutionTime) -> anyhow::Result<()> {
        let n_units = self.units.len();
        let home_dir = self.workspace.home_dir().to_path_buf();
        let res_dir = self.workspace.results_dir().to_path_buf();
        self.with_plugins(move |plugins| {
            plugins.call(
                exec_time,
                &PluginContext {
                    n_units,
                    homedir: &home_dir,
                    res_dir: &res_dir,
                },
            )
        })
        .await?
    }

    /// Launches every unit, releases them together, waits for all of them and cleans up.
    ///
    /// A shutdown signal (SIGINT, SIGTERM, SIGQUIT) aborts the batch with
    /// [`OrchestratorError::Interrupted`]. Cleanup runs whatever the outcome, before the
    /// first error is returned.
    pub async fn exec_all(&mut self, vars: &RunVariables) -> Result<()> {
        self.exec_all_until(vars, signals::wait_for_shutdown_signal())
            .await
    }

    /// Like [`Executer::exec_all`], aborting when `shutdown` completes instead of on a signal.
    pub async fn exec_all_until<F>(&mut self, vars: &RunVariables, shutdown: F) -> Result<()>
    where
        F: Future<Output = std::io::Result<()>>,
    {
        let shutdown = async {
            if let Err(e) = shutdown.await {
                warn!("unable to listen for shutdown signals: {}", e);
                std::future::pending::<()>().await;
            }
        };

        let result = select! {
            result = self.run_units(vars) => result,
            _ = shutdown => {
                warn!("shutdown signal received, tearing down all units");
                Err(OrchestratorError::Interrupted)
            }
        };
        self.cleanup().await;
        result
    }

    async fn run_units(&mut self, vars: &RunVariables) -> Result<()> {
        if let Some(port_start) = vars.port_start {
            ensure_ports_free(port_start, self.units.len()).await?;
        }

        let launch_failure = self.launch_all(vars).await?;

        self.signal_start().await?;

        if let Some(unit) = launch_failure {
            return Err(OrchestratorError::LaunchFailure { unit });
        }

        for unit in self.units.iter_mut() {
            info!("waiting for {} to finish", unit.name());
            unit.wait().await?;
        }
        Ok(())
    }

    /// Launches the units in order. Returns the name of the first unit that failed to
    /// launch; no unit after it is launched.
    async fn launch_all(&mut self, vars: &RunVariables) -> Result<Option<String>> {
        let n_units = self.units.len();
        for idx in 0..n_units {
            let unit = &self.units[idx];
            let res_dir = unit.results_dir();
            let home_dir = unit.home_dir();
            let work_dir = unit.work_dir();
            let plugins = self
                .plugins
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .with_commands(&PluginContext {
                    n_units,
                    homedir: &home_dir,
                    res_dir: &res_dir,
                });

            // the port doubles as initial size for applications that take it there
            let initial_size = match unit.port() {
                Some(port) => port as u64,
                None => vars.initial_size,
            };
            let command = unit.app().get_cmd(&CommandParams {
                plugins: &plugins,
                threads: vars.threads,
                duration: vars.duration,
                noise: vars.noise,
                initial_size,
                port: unit.port(),
                index: idx,
                n_units,
                work_dir: &work_dir,
                homedir: &home_dir,
                res_dir: &res_dir,
            });

            let unit = &mut self.units[idx];
            debug!("launching {} with {}", unit.name(), command);
            if !unit.launch(&command).await? {
                error!("{} could not be launched, not launching any further units", unit.name());
                return Ok(Some(unit.name().to_string()));
            }
        }
        Ok(None)
    }

    /// Gives the start signal: PRE plugins, monitors, the sentinel file, POST plugins.
    pub async fn signal_start(&mut self) -> Result<()> {
        info!(
            "Waiting for {:?}, before giving the start signal",
            self.settle
        );
        tokio::time::sleep(self.settle).await;

        self.call_plugins(ExecutionTime::Pre)
            .await
            .map_err(|e| hook_error("pre plugins", e))?;
        self.monitors
            .start_all()
            .await
            .map_err(|e| hook_error("starting monitors", e))?;
        self.barrier.release()?;
        println!("> {}", "start signal given".green());
        self.call_plugins(ExecutionTime::Post)
            .await
            .map_err(|e| hook_error("post plugins", e))?;
        Ok(())
    }

    /// Stops every unit, removes the sentinel, stops monitors, runs CLEANUP plugins and stops
    /// all plugins. Runs only once, later calls are no-ops. Failures are logged.
    pub async fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        info!("cleaning up, stopping all processes/containers");
        for unit in self.units.iter_mut() {
            unit.stop().await;
        }
        if let Err(e) = self.barrier.reset() {
            warn!("unable to remove start file: {}", e);
        }
        self.monitors.stop_all().await;
        if let Err(e) = self.call_plugins(ExecutionTime::Cleanup).await {
            warn!("cleanup plugins failed: {:#}", e);
        }
        if let Err(e) = self.with_plugins(|plugins| plugins.stop_all()).await {
            warn!("unable to stop plugins: {}", e);
        }
    }

    /// One line per unit: the monitors' results followed by the unit's output.
    pub fn collect_results(&self) -> Result<String> {
        let stat_prefix = self.monitors.collect_results();
        self.units
            .iter()
            .map(|unit| Ok(format!("{}{}\n", stat_prefix, unit.output()?)))
            .collect()
    }
}

fn hook_error(phase: &str, e: anyhow::Error) -> OrchestratorError {
    error!("{} failed: {:#}", phase, e);
    OrchestratorError::Hook {
        phase: phase.to_string(),
        message: format!("{:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        monitors::Monitor,
        plugins::Plugin,
        results::{merge, parse_output},
    };
    use async_trait::async_trait;
    use std::{
        fs,
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    type Log = Arc<Mutex<Vec<String>>>;

    struct RecordingPlugin {
        name: String,
        time: ExecutionTime,
        sentinel: PathBuf,
        log: Log,
    }

    impl Plugin for RecordingPlugin {
        fn name(&self) -> &str {
            &self.name
        }

        fn exec_time(&self) -> ExecutionTime {
            self.time
        }

        fn get_command(&self, _ctx: &PluginContext) -> String {
            String::new()
        }

        fn execute(&mut self, _ctx: &PluginContext) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!(
                "plugin:{}:sentinel={}",
                self.name,
                self.sentinel.exists()
            ));
            Ok(())
        }

        fn stop(&mut self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("stop:{}", self.name));
            Ok(())
        }
    }

    struct RecordingMonitor {
        sentinel: PathBuf,
        log: Log,
    }

    #[async_trait]
    impl Monitor for RecordingMonitor {
        fn kind(&self) -> &str {
            "recording"
        }

        async fn start(&mut self) -> anyhow::Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("monitor:start:sentinel={}", self.sentinel.exists()));
            Ok(())
        }

        async fn stop(&mut self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push("monitor:stop".to_string());
            Ok(())
        }

        fn collect(&self) -> String {
            "rec=1;".to_string()
        }
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("lockstep-executer-{}", nanoid::nanoid!(8)))
    }

    fn config(unit_count: usize, extra: &str) -> anyhow::Result<Config> {
        Config::try_from_str(&format!(
            r#"
            [benchmark]
            exec_env = "process"
            unit_count = {unit_count}
            settle_secs = 0
            barrier_timeout_secs = 30
            {extra}

            [[app]]
            name = "echo"
            command = "echo ops={{index}}"
            "#
        ))
    }

    fn recording_executer(dir: &Path, log: &Log) -> Executer {
        let workspace = Workspace::new(dir, Path::new("apps"), Path::new("results"));
        workspace
            .ensure_dirs()
            .expect("should be able to create workspace");
        let sentinel = workspace.sentinel();
        let plugin = |name: &str, time| {
            Box::new(RecordingPlugin {
                name: name.to_string(),
                time,
                sentinel: sentinel.clone(),
                log: log.clone(),
            }) as Box<dyn Plugin>
        };
        let plugins = PluginRunner::new(vec![
            plugin("pre", ExecutionTime::Pre),
            plugin("post", ExecutionTime::Post),
            plugin("cleanup", ExecutionTime::Cleanup),
        ]);
        let monitors = MonitorSet::new(vec![Box::new(RecordingMonitor {
            sentinel: sentinel.clone(),
            log: log.clone(),
        })]);
        let barrier = StartBarrier::new(sentinel, Duration::from_secs(30));
        Executer::new(workspace, barrier, plugins, monitors).with_settle(Duration::ZERO)
    }

    fn process_unit(executer: &Executer, idx: usize, command: &str) -> ExecutionUnit {
        process_unit_in(executer, executer.workspace.clone(), idx, command)
    }

    fn process_unit_in(
        executer: &Executer,
        workspace: Workspace,
        idx: usize,
        command: &str,
    ) -> ExecutionUnit {
        let base = UnitBase::new(
            ExecutionType::Process,
            idx,
            Application {
                name: "sh".to_string(),
                command: command.to_string(),
                path: None,
                cd: false,
                adapter: None,
            },
            workspace,
            executer.barrier.clone(),
        );
        ExecutionUnit::Process(ProcessUnit::new(
            base,
            cpu_set_with_total(0, 1, 1).expect("one core is always available"),
            None,
        ))
    }

    fn vars(unit_count: usize) -> RunVariables {
        RunVariables {
            exec_env: ExecutionType::Process,
            threads: 1,
            duration: 1,
            noise: 0,
            initial_size: 0,
            unit_count,
            port_start: None,
        }
    }

    fn has_taskset() -> bool {
        std::process::Command::new("taskset")
            .arg("--version")
            .output()
            .is_ok()
    }

    #[test]
    fn plans_cpu_sets_and_ports() -> anyhow::Result<()> {
        let config = config(
            3,
            r#"
            [containers]
            core_count = 2
            core_affinity_offsets = [0, 2, 4]
            port = 9000
            "#,
        )?;

        let plans = plan_units(&config, config.apps_per_unit(), 8)?;

        let sets = plans.iter().map(|p| p.core_set.to_string()).collect::<Vec<_>>();
        assert_eq!(sets, vec!["0,1", "2,3", "4,5"]);
        let ports = plans.iter().map(|p| p.port).collect::<Vec<_>>();
        assert_eq!(ports, vec![Some(9000), Some(9001), Some(9002)]);
        Ok(())
    }

    #[test]
    fn plan_needs_one_application_per_unit() -> anyhow::Result<()> {
        let config = config(3, "")?;
        let apps = config.apps.clone();
        assert!(matches!(
            plan_units(&config, apps, 8),
            Err(OrchestratorError::Configuration(_))
        ));
        Ok(())
    }

    #[test]
    fn builds_named_units_round_robin() -> anyhow::Result<()> {
        let config = Config::try_from_str(
            r#"
            [benchmark]
            exec_env = "process"
            unit_count = 3

            [[app]]
            name = "server"
            command = "./server"

            [[app]]
            name = "client"
            command = "./client"
            "#,
        )?;
        let dir = scratch_dir();
        let workspace = Workspace::new(&dir, Path::new("apps"), Path::new("results"));
        let plans = plan_units(&config, config.apps_per_unit(), 4)?;
        let executer = Executer::from_plans(&config, workspace, plans, None)?;

        let names = executer.units().iter().map(|u| u.name()).collect::<Vec<_>>();
        assert_eq!(names, vec!["N000_server", "N001_client", "N002_server"]);
        Ok(())
    }

    #[tokio::test]
    async fn signal_start_runs_hooks_in_order() -> anyhow::Result<()> {
        let dir = scratch_dir();
        let log: Log = Arc::new(Mutex::new(vec![]));
        let mut executer = recording_executer(&dir, &log);

        executer.signal_start().await?;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "plugin:pre:sentinel=false",
                "monitor:start:sentinel=false",
                "plugin:post:sentinel=true",
            ]
        );

        executer.cleanup().await;
        assert!(!executer.workspace.sentinel().exists());
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    struct SlowPlugin(Duration);

    impl Plugin for SlowPlugin {
        fn name(&self) -> &str {
            "slow"
        }

        fn exec_time(&self) -> ExecutionTime {
            ExecutionTime::Pre
        }

        fn get_command(&self, _ctx: &PluginContext) -> String {
            String::new()
        }

        fn execute(&mut self, _ctx: &PluginContext) -> anyhow::Result<()> {
            std::thread::sleep(self.0);
            Ok(())
        }

        fn stop(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_plugins_do_not_stall_the_runtime() -> anyhow::Result<()> {
        let dir = scratch_dir();
        let workspace = Workspace::new(&dir, Path::new("apps"), Path::new("results"));
        workspace.ensure_dirs()?;
        let barrier = StartBarrier::new(workspace.sentinel(), Duration::from_secs(30));
        let plugins = PluginRunner::new(vec![Box::new(SlowPlugin(Duration::from_millis(400)))]);
        let mut executer = Executer::new(workspace, barrier, plugins, MonitorSet::default())
            .with_settle(Duration::ZERO);

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = ticks.clone();
            async move {
                let mut interval = tokio::time::interval(Duration::from_millis(20));
                loop {
                    interval.tick().await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        executer.signal_start().await?;
        ticker.abort();

        assert!(ticks.load(Ordering::SeqCst) >= 5);

        executer.cleanup().await;
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[tokio::test]
    async fn port_conflict_aborts_before_launching() -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let dir = scratch_dir();
        let log: Log = Arc::new(Mutex::new(vec![]));
        let mut executer = recording_executer(&dir, &log);
        let unit = process_unit(&executer, 0, "echo never");
        executer.add_exec_unit(unit);

        let vars = RunVariables {
            port_start: Some(port),
            ..vars(1)
        };
        assert!(matches!(
            executer.exec_all(&vars).await,
            Err(OrchestratorError::ResourceConflict { .. })
        ));

        assert!(!executer.units()[0].output_file().exists());
        let log = log.lock().unwrap();
        assert!(!log.iter().any(|l| l.starts_with("plugin:pre")));
        assert_eq!(log.iter().filter(|l| *l == "plugin:cleanup:sentinel=false").count(), 1);

        fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[cfg(target_family = "unix")]
    mod unix {
        use super::*;
        use sysinfo::{Pid, ProcessStatus, System};

        #[tokio::test]
        async fn cleanup_runs_once_after_success() -> anyhow::Result<()> {
            if !has_taskset() {
                return Ok(());
            }
            let dir = scratch_dir();
            let log: Log = Arc::new(Mutex::new(vec![]));
            let mut executer = recording_executer(&dir, &log);
            for idx in 0..2 {
                let unit = process_unit(&executer, idx, "echo ok=1");
                executer.add_exec_unit(unit);
            }

            executer.exec_all(&vars(2)).await?;
            executer.cleanup().await;

            let log = log.lock().unwrap().clone();
            assert_eq!(log.iter().filter(|l| l.starts_with("plugin:cleanup")).count(), 1);
            assert_eq!(log.iter().filter(|l| *l == "monitor:stop").count(), 1);
            assert_eq!(log.iter().filter(|l| *l == "stop:pre").count(), 1);
            assert!(!executer.workspace.sentinel().exists());

            assert_eq!(
                executer.collect_results()?,
                "rec=1;execution_unit=N000_sh;app=sh;ok=1\nrec=1;execution_unit=N001_sh;app=sh;ok=1\n"
            );

            fs::remove_dir_all(dir)?;
            Ok(())
        }

        #[tokio::test]
        async fn cleanup_runs_once_after_unit_failure() -> anyhow::Result<()> {
            if !has_taskset() {
                return Ok(());
            }
            let dir = scratch_dir();
            let log: Log = Arc::new(Mutex::new(vec![]));
            let mut executer = recording_executer(&dir, &log);
            let failing = process_unit(&executer, 0, "sh -c 'exit 5'");
            let sleeper = process_unit(&executer, 1, "sleep 60");
            executer.add_exec_unit(failing);
            executer.add_exec_unit(sleeper);

            match executer.exec_all(&vars(2)).await {
                Err(OrchestratorError::UnitFailed { unit, code }) => {
                    assert_eq!(unit, "N000_sh");
                    assert_eq!(code, 5);
                }
                other => panic!("expected a unit failure, got {:?}", other),
            }

            let log = log.lock().unwrap().clone();
            assert_eq!(log.iter().filter(|l| l.starts_with("plugin:cleanup")).count(), 1);
            assert!(!executer.workspace.sentinel().exists());

            fs::remove_dir_all(dir)?;
            Ok(())
        }

        fn is_running(pid: u32) -> bool {
            let mut system = System::new_all();
            system.refresh_all();
            system
                .process(Pid::from_u32(pid))
                .map(|p| p.status() != ProcessStatus::Zombie)
                .unwrap_or(false)
        }

        #[tokio::test]
        async fn launch_failure_stops_launching_and_cleans_up() -> anyhow::Result<()> {
            let dir = scratch_dir();
            let log: Log = Arc::new(Mutex::new(vec![]));
            let mut executer = recording_executer(&dir, &log);

            // a home directory that does not exist makes the spawn fail
            let broken = Workspace::new(
                &dir.join("missing"),
                &executer.workspace.app_dir(),
                executer.workspace.results_dir(),
            );
            let first = process_unit(&executer, 0, "sleep 60");
            let failing = process_unit_in(&executer, broken, 1, "sleep 60");
            let never = process_unit(&executer, 2, "sleep 60");
            executer.add_exec_unit(first);
            executer.add_exec_unit(failing);
            executer.add_exec_unit(never);

            match executer.exec_all(&vars(3)).await {
                Err(OrchestratorError::LaunchFailure { unit }) => assert_eq!(unit, "N001_sh"),
                other => panic!("expected a launch failure, got {:?}", other),
            }

            assert!(executer.units()[0].output_file().exists());
            assert!(!executer.units()[2].output_file().exists());
            assert!(!executer.workspace.sentinel().exists());
            let log = log.lock().unwrap().clone();
            assert_eq!(log.iter().filter(|l| *l == "plugin:pre:sentinel=false").count(), 1);
            assert_eq!(log.iter().filter(|l| l.starts_with("plugin:cleanup")).count(), 1);
            assert_eq!(log.iter().filter(|l| *l == "stop:pre").count(), 1);

            fs::remove_dir_all(dir)?;
            Ok(())
        }

        #[tokio::test]
        async fn shutdown_signal_interrupts_and_cleans_up() -> anyhow::Result<()> {
            if !has_taskset() {
                return Ok(());
            }
            let dir = scratch_dir();
            let log: Log = Arc::new(Mutex::new(vec![]));
            let mut executer = recording_executer(&dir, &log);
            let pid_file = dir.join("sleeper.pid");
            let unit = process_unit(
                &executer,
                0,
                &format!("sh -c 'echo $$ > {}; exec sleep 60'", pid_file.display()),
            );
            executer.add_exec_unit(unit);

            let shutdown = async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            };
            assert!(matches!(
                executer.exec_all_until(&vars(1), shutdown).await,
                Err(OrchestratorError::Interrupted)
            ));
            tokio::time::sleep(Duration::from_millis(300)).await;

            let pid: u32 = fs::read_to_string(&pid_file)?.trim().parse()?;
            assert!(!is_running(pid));
            assert!(!executer.workspace.sentinel().exists());
            let logged = log.lock().unwrap().clone();
            assert_eq!(logged.iter().filter(|l| l.starts_with("plugin:cleanup")).count(), 1);
            assert_eq!(logged.iter().filter(|l| *l == "monitor:stop").count(), 1);

            executer.cleanup().await;
            assert_eq!(log.lock().unwrap().len(), logged.len());

            fs::remove_dir_all(dir)?;
            Ok(())
        }

        #[tokio::test]
        async fn three_units_end_to_end() -> anyhow::Result<()> {
            if !has_taskset() {
                return Ok(());
            }
            let dir = scratch_dir();
            let config = config(
                3,
                &format!(
                    r#"
                    home_dir = "{}"

                    [containers]
                    core_count = 1
                    core_affinity_offsets = [0, 0, 0]
                    "#,
                    dir.display()
                ),
            )?;
            let mut executer = Executer::from_config(&config).await?;

            executer.exec_all(&RunVariables::from_config(&config)).await?;
            let output = executer.collect_results()?;

            assert_eq!(
                output,
                "execution_unit=N000_echo;app=echo;ops=0\n\
                 execution_unit=N001_echo;app=echo;ops=1\n\
                 execution_unit=N002_echo;app=echo;ops=2\n"
            );

            let header = RunVariables::from_config(&config).header();
            let merged = merge(parse_output(&output), executer.workspace.results_dir(), &header)?;
            assert_eq!(merged.len(), 3);
            assert_eq!(merged[2].get("ops").map(String::as_str), Some("2"));

            fs::remove_dir_all(dir)?;
            Ok(())
        }
    }
}
