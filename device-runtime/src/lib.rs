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

//! # The Device Runtime
//!
//! `device-runtime` models a data-parallel compute device behind an
//! asynchronous command queue. The model follows OpenCL: device buffers are
//! filled and drained by DMA commands, kernels are launched over an
//! N-dimensional range split into work groups, and every command signals an
//! [`Event`](runtime::event::Event) on completion.
//!
//! The backend shipped with this crate emulates the device on the host:
//!
//! - Device memory is a separate allocation per buffer. DMA commands really
//!   copy bytes, so data structures transferred to the device must be
//!   relocatable.
//! - Each command queue lane is served by a command processor thread that
//!   executes submissions in order.
//! - Kernels are host functions bound to the entry points of a program. Work
//!   groups are dispatched as morsels onto a `rayon` thread pool.
//! - Programs are "compiled" by a front end that checks the source text for
//!   syntactic balance and resolves every `__kernel` entry point. Failures
//!   produce a build log in the usual `line N: error: ...` format.
//!
//! Memory is accounted against the configured capacity of the device.
//! Allocations beyond the capacity fail with
//! [`ErrorKind::OutOfMemory`](error::ErrorKind::OutOfMemory).

pub mod error;
pub mod runtime;

pub use runtime::device::{Device, DeviceBuilder, DeviceProperties, DeviceStatsSnapshot};
pub use runtime::event::{Event, EventStatus};
pub use runtime::memory::{DeviceMem, PinnedMem};
pub use runtime::program::{Kernel, KernelArg, KernelHandle, LaunchDim, Program, ProgramBuilder};
pub use runtime::queue::CommandQueue;
pub use runtime::dispatcher::LaunchContext;
