// Copyright 2019-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::perfmon::Perfmon;
use super::plan::PlanDescription;
use super::pseudo_schema::PseudoSchema;
use crate::expr::{Var, VarNo};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExplainOptions {
    pub verbose: bool,
    pub analyze: bool,
}

/// Names a column of the pseudo relation, or of the relation scanned at
/// `depth` for hash keys.
fn column_name(schema: &PseudoSchema, var: &Var, depth: usize) -> String {
    let entry = match var.varno {
        VarNo::Pseudo => schema.entry(var.attno),
        VarNo::Scan => schema
            .entries()
            .iter()
            .find(|e| e.srcdepth == depth && e.srcresno + 1 == var.attno as usize),
        VarNo::Rel(_) => None,
    };
    match entry {
        Some(entry) => entry.resname.clone(),
        None => format!("?column{}?", var.attno),
    }
}

/// Renders the plan of a hash join, one `label: value` line per property.
pub fn explain(
    description: &PlanDescription,
    bulkload: bool,
    perfmon: Option<&Perfmon>,
    options: ExplainOptions,
) -> String {
    let schema = &description.schema;
    let mut lines: Vec<(String, String)> = Vec::new();

    let pscan_tlist = schema
        .entries()
        .iter()
        .map(|e| {
            if e.ref_host {
                e.resname.clone()
            } else {
                format!("({})", e.resname)
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    lines.push(("pscan tlist".to_string(), pscan_tlist));

    for (index, depth) in description.resolved.depths.iter().enumerate() {
        let d = index + 1;
        let name = |var: &Var| column_name(schema, var, d);

        for clause in &depth.hash_clauses {
            lines.push((format!("hash clause {}", d), clause.deparse(&name)));
        }
        for clause in &depth.qual {
            lines.push((format!("qual clause {}", d), clause.deparse(&name)));
        }

        let keys = depth
            .hash_inner
            .iter()
            .map(|key| key.deparse(&name))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push((format!("Depth {}", d), format!("hash keys: {}", keys)));

        if let Some(cost) = description.estimate.depths.get(index) {
            lines.push((
                format!("Depth {}", d),
                format!(
                    "Buckets: {}  Batches: {}  Memory Usage: {:.2}%",
                    cost.nslots,
                    cost.nloops,
                    100.0 * cost.threshold_ratio
                ),
            ));
        }
    }

    for clause in &description.resolved.host {
        let name = |var: &Var| column_name(schema, var, 0);
        lines.push(("host clause".to_string(), clause.deparse(&name)));
    }

    lines.push((
        "Bulkload".to_string(),
        if bulkload { "On" } else { "Off" }.to_string(),
    ));

    if options.verbose {
        lines.push((
            "Kernel source".to_string(),
            description.kernel.source.clone(),
        ));
    }
    if options.analyze {
        if let Some(perfmon) = perfmon {
            lines.extend(perfmon.explain_lines());
        }
    }

    let mut out = format!("{}\n", description.strategy);
    for (label, value) in lines {
        out.push_str(&format!("  {}: {}\n", label, value));
    }
    out
}
