/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::error::Result;
use itertools::Itertools;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};
use tracing::{debug, warn};

pub const RESULTS_FILE: &str = "experiment_results.json";
pub const FULL_RESULTS_FILE: &str = "experiment_results_full.json";

/// One unit's result line, as key/value pairs.
pub type Record = BTreeMap<String, String>;

/// Parses the output of a batch, one `k=v;k=v;` line per unit, into records.
///
/// Empty lines are skipped. A field without `=` is kept with an empty value.
pub fn parse_output(output: &str) -> Vec<Record> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.trim_end_matches(';')
                .split(';')
                .filter(|field| !field.is_empty())
                .map(|field| match field.split_once('=') {
                    Some((key, value)) => (key.to_string(), value.to_string()),
                    None => (field.to_string(), String::new()),
                })
                .collect()
        })
        .collect()
}

/// Reduces `records` to the keys all of them share.
///
/// When the key sets diverge, the untouched records, extended with the `header` fields, are
/// saved to [`FULL_RESULTS_FILE`] in `save_dir` before the extra keys are dropped.
pub fn merge(records: Vec<Record>, save_dir: &Path, header: &Record) -> Result<Vec<Record>> {
    let Some(first) = records.first() else {
        return Ok(records);
    };

    let common: BTreeSet<&String> = records
        .iter()
        .skip(1)
        .fold(first.keys().collect(), |acc, record| {
            acc.into_iter().filter(|key| record.contains_key(*key)).collect()
        });

    if records.iter().all(|record| record.len() == common.len()) {
        debug!("all {} records share the same keys", records.len());
        return Ok(records);
    }

    let dropped = records
        .iter()
        .flat_map(|record| record.keys())
        .filter(|key| !common.contains(key))
        .unique()
        .join(", ");
    warn!(
        "Results have different keys, keeping only the common ones. Dropped: {}. Complete results are saved in {}",
        dropped, FULL_RESULTS_FILE
    );

    let full = records
        .iter()
        .map(|record| {
            let mut record = record.clone();
            record.extend(header.clone());
            record
        })
        .collect_vec();
    fs::create_dir_all(save_dir)?;
    fs::write(
        save_dir.join(FULL_RESULTS_FILE),
        serde_json::to_string_pretty(&full)?,
    )?;

    let common: BTreeSet<String> = common.into_iter().cloned().collect();
    Ok(records
        .into_iter()
        .map(|record| {
            record
                .into_iter()
                .filter(|(key, _)| common.contains(key))
                .collect()
        })
        .collect())
}

/// Writes the final records, each extended with the `header` fields, to [`RESULTS_FILE`].
pub fn save(records: &[Record], save_dir: &Path, header: &Record) -> Result<()> {
    let rows = records
        .iter()
        .map(|record| {
            let mut record = record.clone();
            record.extend(header.clone());
            record
        })
        .collect_vec();
    fs::create_dir_all(save_dir)?;
    fs::write(
        save_dir.join(RESULTS_FILE),
        serde_json::to_string_pretty(&rows)?,
    )?;
    Ok(())
}
