/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{Monitor, MonitorKind};
use async_trait::async_trait;
use chrono::Utc;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};
use sysinfo::System;
use tokio::{sync::Mutex, task::JoinSet, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub timestamp: i64,
    pub value: f64,
}

struct StopHandle {
    token: CancellationToken,
    join_set: JoinSet<()>,
    shared_samples: Arc<Mutex<Vec<Sample>>>,
}

/// Samples host wide CPU or memory usage (percent) with sysinfo.
///
/// On stop the samples are written to `monitor_<kind>.csv` in the results directory.
pub struct SystemMonitor {
    kind: MonitorKind,
    results_dir: PathBuf,
    interval: Duration,
    handle: Option<StopHandle>,
    samples: Vec<Sample>,
}

impl SystemMonitor {
    pub fn new(kind: MonitorKind, results_dir: &Path) -> Self {
        Self {
            kind,
            results_dir: results_dir.to_path_buf(),
            interval: Duration::from_millis(500),
            handle: None,
            samples: vec![],
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn csv_path(&self) -> PathBuf {
        self.results_dir
            .join(format!("monitor_{}.csv", self.kind.as_str()))
    }

    fn write_csv(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.results_dir)?;
        let mut file = fs::File::create(self.csv_path())?;
        writeln!(file, "timestamp_ms,{}", self.kind.as_str())?;
        for sample in self.samples.iter() {
            writeln!(file, "{},{:.3}", sample.timestamp, sample.value)?;
        }
        Ok(())
    }
}

/// Loops forever pushing a sample every `interval`. Intended to run inside a task that gets
/// cancelled.
async fn keep_sampling(kind: MonitorKind, interval: Duration, samples: Arc<Mutex<Vec<Sample>>>) {
    let mut system = System::new();

    // cpu usage is computed between two refreshes
    system.refresh_cpu_usage();

    loop {
        tokio::time::sleep(interval.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL)).await;

        let value = match kind {
            MonitorKind::Cpu => {
                system.refresh_cpu_usage();
                system.global_cpu_usage() as f64
            }
            MonitorKind::Memory => {
                system.refresh_memory();
                match system.total_memory() {
                    0 => 0.0,
                    total => system.used_memory() as f64 / total as f64 * 100.0,
                }
            }
        };

        trace!("[{}] sample: {:.3}", kind.as_str(), value);
        samples.lock().await.push(Sample {
            timestamp: Utc::now().timestamp_millis(),
            value,
        });
    }
}

#[async_trait]
impl Monitor for SystemMonitor {
    fn kind(&self) -> &str {
        self.kind.as_str()
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        let token = CancellationToken::new();
        let shared_samples = Arc::new(Mutex::new(vec![]));
        let mut join_set = JoinSet::new();
        {
            let token = token.clone();
            let shared_samples = shared_samples.clone();
            let kind = self.kind;
            let interval = self.interval;

            join_set.spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = keep_sampling(kind, interval, shared_samples) => {}
                }
            });
        }

        self.handle = Some(StopHandle {
            token,
            join_set,
            shared_samples,
        });
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        handle.token.cancel();
        while handle.join_set.join_next().await.is_some() {}

        self.samples = std::mem::take(&mut *handle.shared_samples.lock().await);
        debug!(
            "monitor {} collected {} samples",
            self.kind.as_str(),
            self.samples.len()
        );
        self.write_csv()
    }

    fn collect(&self) -> String {
        if self.samples.is_empty() {
            return String::new();
        }

        let n = self.samples.len() as f64;
        let avg = self.samples.iter().map(|s| s.value).sum::<f64>() / n;
        let max = self
            .samples
            .iter()
            .map(|s| s.value)
            .fold(f64::MIN, f64::max);

        format!(
            "{kind}_avg={avg:.2};{kind}_max={max:.2};",
            kind = self.kind.as_str()
        )
    }
}
