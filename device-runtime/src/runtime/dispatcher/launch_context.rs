/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

use super::morsel_dispatcher::MorselDispatcher;
use crate::error::Result;
use crate::runtime::device::DeviceProperties;
use crate::runtime::program::LaunchDim;
use parking_lot::Mutex;
use rayon::ThreadPool;
use std::cmp;
use std::ops::Range;

/// The execution context of one kernel launch.
///
/// A kernel processes its work items in work groups of `dim.local` items.
/// Work groups are dispatched as morsels to the device's compute units, which
/// race for the next group until all items are processed.
pub struct LaunchContext<'a> {
    pool: &'a ThreadPool,
    dim: LaunchDim,
    props: &'a DeviceProperties,
}

impl<'a> LaunchContext<'a> {
    pub(crate) fn new(pool: &'a ThreadPool, dim: LaunchDim, props: &'a DeviceProperties) -> Self {
        Self { pool, dim, props }
    }

    pub fn dim(&self) -> LaunchDim {
        self.dim
    }

    pub fn properties(&self) -> &DeviceProperties {
        self.props
    }

    /// Runs `work_group` for each work group that covers `nitems` work items.
    ///
    /// The results are returned in work item order, regardless of the order in
    /// which the compute units finished their groups. After the first failed
    /// group no new groups are started, and the first error is returned.
    pub fn for_each_group<F, R>(&self, nitems: usize, work_group: F) -> Result<Vec<R>>
    where
        F: Fn(Range<usize>) -> Result<R> + Sync,
        R: Send,
    {
        let group_len = self.dim.local;
        let ngroups = (nitems + group_len - 1) / group_len;
        let workers = cmp::max(1, cmp::min(self.pool.current_num_threads(), ngroups));

        let dispatcher = MorselDispatcher::new(nitems, group_len);
        let results = Mutex::new(Vec::with_capacity(ngroups));
        let failure = Mutex::new(None);

        {
            let dispatcher = &dispatcher;
            let results = &results;
            let failure = &failure;
            let work_group = &work_group;

            self.pool.scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(move |_| {
                        for group in dispatcher.iter() {
                            if failure.lock().is_some() {
                                break;
                            }
                            let start = group.start;
                            match work_group(group) {
                                Ok(r) => results.lock().push((start, r)),
                                Err(e) => {
                                    failure.lock().get_or_insert(e);
                                    break;
                                }
                            }
                        }
                    });
                }
            });
        }

        if let Some(error) = failure.into_inner() {
            return Err(error);
        }

        let mut results = results.into_inner();
        results.sort_by_key(|(start, _)| *start);
        Ok(results.into_iter().map(|(_, r)| r).collect())
    }
}
