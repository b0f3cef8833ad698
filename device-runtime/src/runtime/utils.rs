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

use super::device::DeviceProperties;
use super::program::LaunchDim;
use std::cmp;

/// Minimum work group size that keeps all lanes of a compute unit busy.
const MIN_WORK_GROUP_SIZE: usize = 32;

/// Computes the launch dimensions for `nitems` work items.
///
/// With `larger_is_better`, the work group size is the device maximum, e.g.,
/// for kernels that cooperate within a group. Otherwise, a small group size is
/// chosen to balance load across compute units. In both cases, the group size
/// is limited so that `unit_sz` bytes of local memory per work item fit into
/// the device's local memory, and rounded down to a power of two.
///
/// The global size is `nitems` rounded up to a multiple of the group size,
/// and at least one work group.
pub fn compute_workgroup_size(
    props: &DeviceProperties,
    nitems: usize,
    larger_is_better: bool,
    unit_sz: usize,
) -> LaunchDim {
    let mut local = if larger_is_better {
        props.max_work_group_size
    } else {
        cmp::min(props.max_work_group_size, MIN_WORK_GROUP_SIZE)
    };

    if unit_sz > 0 {
        local = cmp::min(local, props.local_mem_size / unit_sz);
    }
    let local = prev_power_of_two(cmp::max(local, 1));

    let ngroups = cmp::max((nitems + local - 1) / local, 1);

    LaunchDim::new(ngroups * local, local)
}

fn prev_power_of_two(x: usize) -> usize {
    let next = x.next_power_of_two();
    if next == x {
        x
    } else {
        next >> 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> DeviceProperties {
        DeviceProperties {
            name: "test".to_string(),
            mem_capacity: 1 << 20,
            local_mem_size: 4096,
            max_work_group_size: 1000,
            compute_units: 2,
            queues: 1,
        }
    }

    #[test]
    fn larger_is_better_uses_max_power_of_two() {
        let dim = compute_workgroup_size(&props(), 5000, true, 0);
        assert_eq!(dim.local, 512);
        assert_eq!(dim.global, 5120);
    }

    #[test]
    fn local_memory_limits_group_size() {
        let dim = compute_workgroup_size(&props(), 100, true, 64);
        assert_eq!(dim.local, 64);
        assert_eq!(dim.global, 128);
    }

    #[test]
    fn empty_launch_has_one_group() {
        let dim = compute_workgroup_size(&props(), 0, false, 0);
        assert_eq!(dim, LaunchDim::new(32, 32));
    }
}
