/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::ExecutionType, executer::UnitPlan, execution_unit::unit_name, results::Record,
};
use colored::*;
use itertools::Itertools;
use term_table::{row::Row, table_cell::TableCell, Table, TableStyle};

/// Renders merged records as a table, one row per unit.
///
/// Columns are the union of all keys, `execution_unit` and `app` first.
pub fn results_table(records: &[Record]) -> String {
    let columns = records
        .iter()
        .flat_map(|record| record.keys())
        .unique()
        .sorted_by_key(|key| match key.as_str() {
            "execution_unit" => (0, key.to_string()),
            "app" => (1, key.to_string()),
            _ => (2, key.to_string()),
        })
        .collect_vec();

    let header = Row::new(
        columns
            .iter()
            .map(|col| TableCell::builder(col.bold()).build())
            .collect_vec(),
    );
    let rows = records.iter().map(|record| {
        Row::new(
            columns
                .iter()
                .map(|col| TableCell::new(record.get(*col).map(String::as_str).unwrap_or("--")))
                .collect_vec(),
        )
    });

    Table::builder()
        .rows(std::iter::once(header).chain(rows).collect())
        .style(TableStyle::rounded())
        .build()
        .render()
}

/// Renders the planned units of a batch.
pub fn plan_table(kind: ExecutionType, plans: &[UnitPlan]) -> String {
    let header = Row::new(vec![
        TableCell::builder("Unit".bold()).build(),
        TableCell::builder("CPU set".bold()).build(),
        TableCell::builder("Port".bold()).build(),
    ]);
    let rows = plans.iter().map(|plan| {
        Row::new(vec![
            TableCell::new(unit_name(kind, plan.idx, &plan.app.name).green()),
            TableCell::new(plan.core_set.to_string()),
            TableCell::new(
                plan.port
                    .map(|port| port.to_string())
                    .unwrap_or("--".to_string()),
            ),
        ])
    });

    Table::builder()
        .rows(std::iter::once(header).chain(rows).collect())
        .style(TableStyle::rounded())
        .build()
        .render()
}
