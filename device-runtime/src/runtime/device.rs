// Copyright 2018-2022 Clemens Lutz
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

use super::memory::{DeviceMem, MemAccount};
use super::queue::{CommandProcessor, CommandQueue, Submission};
use crate::error::{ErrorKind, Result};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde_derive::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

/// Static properties of a device.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceProperties {
    pub name: String,
    pub mem_capacity: usize,
    pub local_mem_size: usize,
    pub max_work_group_size: usize,
    pub compute_units: usize,
    pub queues: usize,
}

/// Transfer and execution counters of a device.
#[derive(Debug, Default)]
pub(crate) struct DeviceStats {
    pub(crate) num_dma_send: CachePadded<AtomicU64>,
    pub(crate) bytes_dma_send: CachePadded<AtomicU64>,
    pub(crate) num_dma_recv: CachePadded<AtomicU64>,
    pub(crate) bytes_dma_recv: CachePadded<AtomicU64>,
    pub(crate) num_kernel_launch: CachePadded<AtomicU64>,
    pub(crate) time_kernel_ns: CachePadded<AtomicU64>,
}

impl DeviceStats {
    pub(crate) fn record_send(&self, bytes: usize) {
        self.num_dma_send.fetch_add(1, Ordering::Relaxed);
        self.bytes_dma_send
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_recv(&self, bytes: usize) {
        self.num_dma_recv.fetch_add(1, Ordering::Relaxed);
        self.bytes_dma_recv
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_launch(&self, nanos: u64) {
        self.num_kernel_launch.fetch_add(1, Ordering::Relaxed);
        self.time_kernel_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DeviceStatsSnapshot {
        DeviceStatsSnapshot {
            num_dma_send: self.num_dma_send.load(Ordering::Relaxed),
            bytes_dma_send: self.bytes_dma_send.load(Ordering::Relaxed),
            num_dma_recv: self.num_dma_recv.load(Ordering::Relaxed),
            bytes_dma_recv: self.bytes_dma_recv.load(Ordering::Relaxed),
            num_kernel_launch: self.num_kernel_launch.load(Ordering::Relaxed),
            time_kernel_ns: self.time_kernel_ns.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct DeviceStatsSnapshot {
    pub num_dma_send: u64,
    pub bytes_dma_send: u64,
    pub num_dma_recv: u64,
    pub bytes_dma_recv: u64,
    pub num_kernel_launch: u64,
    pub time_kernel_ns: u64,
}

/// A handle to a compute device.
///
/// Handles are cheap to clone and share the device's memory, command
/// processors, and thread pool.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    props: DeviceProperties,
    account: Arc<MemAccount>,
    stats: Arc<DeviceStats>,
    processors: Vec<Mutex<Sender<Submission>>>,
    next_processor: AtomicUsize,
}

pub struct DeviceBuilder {
    name: String,
    mem_capacity: usize,
    local_mem_size: usize,
    max_work_group_size: usize,
    compute_units: usize,
    queues: usize,
}

impl DeviceBuilder {
    const DEFAULT_MEM_CAPACITY: usize = 1024 * 1024 * 1024;
    const DEFAULT_LOCAL_MEM_SIZE: usize = 48 * 1024;
    const DEFAULT_MAX_WORK_GROUP_SIZE: usize = 1024;

    pub fn new() -> Self {
        Self {
            name: "host-emulated device".to_string(),
            mem_capacity: Self::DEFAULT_MEM_CAPACITY,
            local_mem_size: Self::DEFAULT_LOCAL_MEM_SIZE,
            max_work_group_size: Self::DEFAULT_MAX_WORK_GROUP_SIZE,
            compute_units: 4,
            queues: 2,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn mem_capacity(mut self, bytes: usize) -> Self {
        self.mem_capacity = bytes;
        self
    }

    pub fn local_mem_size(mut self, bytes: usize) -> Self {
        self.local_mem_size = bytes;
        self
    }

    pub fn max_work_group_size(mut self, size: usize) -> Self {
        self.max_work_group_size = size;
        self
    }

    pub fn compute_units(mut self, units: usize) -> Self {
        self.compute_units = units;
        self
    }

    pub fn queues(mut self, queues: usize) -> Self {
        self.queues = queues;
        self
    }

    pub fn build(self) -> Result<Device> {
        if self.compute_units == 0 || self.queues == 0 {
            Err(ErrorKind::InvalidArgument(
                "Device requires at least one compute unit and one queue".to_string(),
            ))?;
        }
        if self.max_work_group_size == 0 {
            Err(ErrorKind::InvalidArgument(
                "Maximum work group size must be positive".to_string(),
            ))?;
        }

        let props = DeviceProperties {
            name: self.name,
            mem_capacity: self.mem_capacity,
            local_mem_size: self.local_mem_size,
            max_work_group_size: self.max_work_group_size,
            compute_units: self.compute_units,
            queues: self.queues,
        };

        let pool: Arc<ThreadPool> = Arc::new(
            ThreadPoolBuilder::new()
                .num_threads(props.compute_units)
                .thread_name(|index| format!("device-cu-{}", index))
                .build()?,
        );
        let stats = Arc::new(DeviceStats::default());

        let processors = (0..props.queues)
            .map(|index| {
                let (tx, rx) = mpsc::channel();
                let processor = CommandProcessor::new(pool.clone(), stats.clone(), props.clone());
                thread::Builder::new()
                    .name(format!("device-queue-{}", index))
                    .spawn(move || processor.run(rx))?;
                Ok(Mutex::new(tx))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            name = %props.name,
            mem_capacity = props.mem_capacity,
            compute_units = props.compute_units,
            queues = props.queues,
            "device started"
        );

        Ok(Device {
            inner: Arc::new(DeviceInner {
                account: Arc::new(MemAccount::new(props.mem_capacity)),
                props,
                stats,
                processors,
                next_processor: AtomicUsize::new(0),
            }),
        })
    }
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Device {
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder::new()
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.inner.props
    }

    /// Allocates a zero-initialized buffer in device memory.
    pub fn alloc(&self, len: usize) -> Result<DeviceMem> {
        DeviceMem::new(self.inner.account.clone(), len)
    }

    pub fn mem_used(&self) -> usize {
        self.inner.account.used()
    }

    pub fn mem_capacity(&self) -> usize {
        self.inner.account.capacity()
    }

    pub fn stats(&self) -> DeviceStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Creates an empty batch of commands.
    pub fn queue(&self) -> CommandQueue {
        CommandQueue::new(self.clone())
    }

    pub(crate) fn dispatch(&self, submission: Submission) {
        let processors = &self.inner.processors;
        let index = self.inner.next_processor.fetch_add(1, Ordering::Relaxed) % processors.len();

        let sender = processors[index].lock();
        if let Err(mpsc::SendError(submission)) = sender.send(submission) {
            submission.abort("device command processor terminated");
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("props", &self.inner.props)
            .field("mem_used", &self.mem_used())
            .finish()
    }
}
