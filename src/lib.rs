/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod affinity;
pub mod application;
pub mod barrier;
pub mod clap_args;
pub mod config;
pub mod error;
pub mod executer;
pub mod execution_unit;
pub mod monitors;
pub mod platform;
pub mod plugins;
pub mod ports;
pub mod results;
pub mod signals;
pub mod summary;
pub mod workspace;

use config::Config;
use error::Result;
use executer::{plan_units, Executer, RunVariables, UnitPlan};
use results::Record;
use tracing::info;

/// Runs one batch described by `config` and returns the merged result records.
///
/// The records are also saved to `experiment_results.json` in the results directory.
pub async fn run(config: &Config) -> Result<Vec<Record>> {
    let vars = RunVariables::from_config(config);
    let mut executer = Executer::from_config(config).await?;
    info!(
        "running {} execution units as {:?}",
        executer.units().len(),
        vars.exec_env
    );

    executer.exec_all(&vars).await?;

    let output = executer.collect_results()?;
    let header = vars.header();
    let results_dir = executer.workspace().results_dir();
    let records = results::merge(results::parse_output(&output), results_dir, &header)?;
    results::save(&records, results_dir, &header)?;

    Ok(records)
}

/// The units `config` would launch, on this host.
pub fn plan(config: &Config) -> Result<Vec<UnitPlan>> {
    plan_units(config, config.apps_per_unit(), num_cpus::get())
}
