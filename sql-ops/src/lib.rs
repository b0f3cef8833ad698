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

//! # The SQL Operator Library
//!
//! `sql-ops` implements a hash join that runs on an accelerator device. The
//! join handles a chain of inner relations in a single pass over the outer
//! relation:
//!
//! ```text
//! outer ⋈ inner_1 ⋈ inner_2 ⋈ ... ⋈ inner_n
//! ```
//!
//! Each inner relation is loaded into one hash table of a multi-level hash
//! buffer. The outer relation is split into chunks, and each chunk is joined
//! with the buffer by a join session on the device.
//!
//! # Planning
//!
//! The [`GpuHashJoinPlanner`](join::GpuHashJoinPlanner) rewrites all
//! expressions of the join into references to a pseudo relation. The pseudo
//! relation holds all columns that the host or the device reads. From the
//! rewritten expressions, the planner generates the source of the device
//! program and estimates the size of the hash buffer.
//!
//! # Execution
//!
//! The [`GpuHashJoin`](join::GpuHashJoin) node builds the device program,
//! loads the hash buffer, and keeps several join sessions in flight. Each
//! session runs two kernels:
//!
//! 1. `kern_gpuhashjoin_main` probes the hash tables with every outer row and
//!    writes one result tuple per match. A result tuple refers to the outer
//!    row and to the matched entry of each depth.
//! 2. `kern_gpuhashjoin_projection` resolves the result tuples into columns
//!    of the pseudo relation.
//!
//! If the estimated result size is too small, the projection reports the
//! actual size and is retried once with a large enough destination.
//!
//! # Memory budget
//!
//! A hash buffer never exceeds `max_alloc_size` bytes. If the inner relations
//! don't fit, the buffer is divided into several buffers, and the outer
//! relation is scanned once per buffer. Dividing requires that all relations
//! can be rewound.

pub mod data_store;
pub mod error;
pub mod eval;
pub mod expr;
pub mod join;
pub mod row_source;
pub mod types;
