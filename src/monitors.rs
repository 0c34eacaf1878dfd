/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod system;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use system::SystemMonitor;
use tracing::{info, warn};

#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorKind {
    Cpu,
    Memory,
}

impl MonitorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorKind::Cpu => "cpu",
            MonitorKind::Memory => "memory",
        }
    }
}

/// A background collector active between the start signal and cleanup.
#[async_trait]
pub trait Monitor: Send {
    fn kind(&self) -> &str;

    async fn start(&mut self) -> anyhow::Result<()>;

    /// Stops collecting. Must be safe to call on a monitor that was never started.
    async fn stop(&mut self) -> anyhow::Result<()>;

    /// The monitor's contribution to each unit's result line, `key=value;` pairs.
    fn collect(&self) -> String;
}

/// All monitors of one batch.
#[derive(Default)]
pub struct MonitorSet {
    monitors: Vec<Box<dyn Monitor>>,
}

impl MonitorSet {
    pub fn new(monitors: Vec<Box<dyn Monitor>>) -> Self {
        Self { monitors }
    }

    pub fn from_kinds(kinds: &[MonitorKind], results_dir: &Path) -> Self {
        Self::new(
            kinds
                .iter()
                .map(|kind| Box::new(SystemMonitor::new(*kind, results_dir)) as Box<dyn Monitor>)
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    pub async fn start_all(&mut self) -> anyhow::Result<()> {
        for monitor in self.monitors.iter_mut() {
            info!("starting monitor {}", monitor.kind());
            monitor.start().await?;
        }
        Ok(())
    }

    pub async fn stop_all(&mut self) {
        for monitor in self.monitors.iter_mut() {
            if let Err(e) = monitor.stop().await {
                warn!("failed to stop monitor {}: {}", monitor.kind(), e);
            }
        }
    }

    pub fn collect_results(&self) -> String {
        self.monitors
            .iter()
            .map(|monitor| monitor.collect().trim().to_string())
            .collect()
    }
}
