/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

use std::cmp;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Hands out consecutive work groups to competing workers.
pub(super) struct MorselDispatcher {
    offset: AtomicUsize,
    data_len: usize,
    morsel_len: usize,
}

impl MorselDispatcher {
    pub(super) fn new(data_len: usize, morsel_len: usize) -> Self {
        let offset = AtomicUsize::new(0);

        Self {
            offset,
            data_len,
            morsel_len: cmp::max(morsel_len, 1),
        }
    }

    pub(super) fn dispatch(&self) -> Option<Range<usize>> {
        let morsel = self.offset.fetch_add(self.morsel_len, Ordering::SeqCst);
        if morsel >= self.data_len {
            return None;
        }
        let morsel_len = cmp::min(self.data_len - morsel, self.morsel_len);

        Some(Range {
            start: morsel,
            end: morsel + morsel_len,
        })
    }

    pub(super) fn iter(&self) -> MorselIter<'_> {
        MorselIter { dispatcher: self }
    }
}

pub(super) struct MorselIter<'d> {
    dispatcher: &'d MorselDispatcher,
}

impl<'d> Iterator for MorselIter<'d> {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        self.dispatcher.dispatch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_range_without_overlap() {
        let dispatcher = MorselDispatcher::new(10, 4);
        let morsels: Vec<_> = dispatcher.iter().collect();
        assert_eq!(morsels, vec![0..4, 4..8, 8..10]);
        assert_eq!(dispatcher.dispatch(), None);
    }

    #[test]
    fn empty_range() {
        let dispatcher = MorselDispatcher::new(0, 4);
        assert_eq!(dispatcher.dispatch(), None);
    }
}
