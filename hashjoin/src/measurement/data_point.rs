/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

use super::hash_join_bench::HashJoinBench;
use crate::error::Result;
use crate::types::*;
use crate::CmdOpt;
use device_runtime::Device;
use serde::Serializer;
use serde_derive::Serialize;
use sql_ops::join::GpuHashJoinConfig;
use std::string::ToString;
use std::time::Duration;

#[derive(Clone, Debug, Default, Serialize)]
pub struct DataPoint {
    pub data_set: Option<String>,
    pub hostname: String,
    pub execution_mode: Option<ArgExecutionMode>,
    pub device_name: Option<String>,
    pub compute_units: Option<usize>,
    pub queues: Option<usize>,
    pub device_memory_bytes: Option<usize>,
    pub max_async_chunks: Option<usize>,
    pub chunk_bytes: Option<usize>,
    pub max_alloc_bytes: Option<usize>,
    pub distribution: Option<ArgDistribution>,
    pub selectivity: Option<u32>,
    pub payload_bytes: Option<usize>,
    pub outer_tuples: Option<usize>,
    #[serde(serialize_with = "serialize_vec")]
    pub inner_tuples: Option<Vec<usize>>,
    pub result_tuples: Option<usize>,
    pub warm_up: Option<bool>,
    pub plan_ns: Option<f64>,
    pub join_ns: Option<f64>,
    pub hash_build_ns: Option<f64>,
    pub outer_load_ns: Option<f64>,
    pub materialize_ns: Option<f64>,
    pub dma_send_ns: Option<f64>,
    pub kern_exec_ns: Option<f64>,
    pub kern_proj_ns: Option<f64>,
    pub dma_recv_ns: Option<f64>,
    pub sessions: Option<u64>,
    pub retries: Option<u64>,
    pub dma_send_bytes: Option<u64>,
    pub dma_recv_bytes: Option<u64>,
    pub relation_gen_ns: Option<f64>,
}

impl DataPoint {
    pub fn new() -> Result<DataPoint> {
        let hostname = hostname::get_hostname().ok_or_else(|| "Couldn't get hostname")?;

        let dp = DataPoint {
            hostname,
            ..DataPoint::default()
        };

        Ok(dp)
    }

    pub fn fill_from_cmd_options(&self, cmd: &CmdOpt) -> DataPoint {
        DataPoint {
            data_set: Some(cmd.data_set.to_string()),
            execution_mode: Some(cmd.execution_mode),
            distribution: Some(cmd.distribution),
            selectivity: cmd.selectivity,
            payload_bytes: Some(cmd.payload_len),
            ..self.clone()
        }
    }

    pub fn fill_from_device(&self, device: &Device, config: &GpuHashJoinConfig) -> DataPoint {
        let props = device.properties();
        DataPoint {
            device_name: Some(props.name.clone()),
            compute_units: Some(props.compute_units),
            queues: Some(props.queues),
            device_memory_bytes: Some(props.mem_capacity),
            max_async_chunks: Some(config.max_async_chunks),
            chunk_bytes: Some(config.chunk_size),
            max_alloc_bytes: Some(config.max_alloc_size),
            ..self.clone()
        }
    }

    pub fn fill_from_hash_join_bench(&self, hjb: &HashJoinBench) -> DataPoint {
        DataPoint {
            outer_tuples: Some(hjb.outer_len),
            inner_tuples: Some(hjb.inner_lens.clone()),
            ..self.clone()
        }
    }

    pub fn set_init_time(&self, data_gen: Duration) -> DataPoint {
        DataPoint {
            relation_gen_ns: Some(data_gen.as_nanos() as f64),
            ..self.clone()
        }
    }
}

/// Serialize `Option<Vec<T>>` by converting it into a `String`.
///
/// This is necessary because the `csv` crate does not support nesting `Vec`
/// instead of flattening it.
fn serialize_vec<S, T>(option: &Option<Vec<T>>, ser: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
    T: ToString,
{
    if let Some(vec) = option {
        let record = vec
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(",");
        ser.serialize_str(&record)
    } else {
        ser.serialize_none()
    }
}
