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

//! The hash join.
//!
//! Planning resolves the join into a [`PseudoSchema`] and generates the
//! device program. Execution loads the inner relations into multi-level hash
//! buffers and joins the outer relation chunk by chunk in [`JoinSession`]s.

pub mod codegen;
pub mod cost;
pub mod explain;
pub mod gpu_hash_join;
pub mod hash_builder;
pub mod kernel;
pub mod multi_hash;
pub mod perfmon;
pub mod plan;
pub mod pseudo_schema;
pub mod session;

pub use codegen::{DeviceCodeTranslator, GeneratedKernel, KernelCodeGenerator, KernelSourceTranslator};
pub use explain::ExplainOptions;
pub use gpu_hash_join::{GpuHashJoin, JoinBatch};
pub use multi_hash::{BufferOffset, MultiHashBuffer};
pub use perfmon::Perfmon;
pub use plan::{
    AcceleratorStrategy, GpuHashJoinConfig, GpuHashJoinPlan, GpuHashJoinPlanner,
    GpuHashJoinStrategy, InnerRelationSpec, JoinSpec, OuterRelationSpec, PlanDescription,
};
pub use pseudo_schema::{DepthClauses, PseudoEntry, PseudoSchema};
pub use session::{JoinSession, SessionState};
