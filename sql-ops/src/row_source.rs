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

//! Input relations of the join.

use crate::data_store::{encode_row, RowStore};
use crate::error::{ErrorKind, Result};
use crate::types::{Row, TypeInfo};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A chunk of rows handed over as a whole.
///
/// `rindex` selects the rows of the chunk that are visible. `None` means that
/// all rows are visible.
#[derive(Clone, Debug)]
pub struct BulkChunk {
    pub store: RowStore,
    pub rindex: Option<Vec<u32>>,
}

impl BulkChunk {
    pub fn nvisible(&self) -> usize {
        self.rindex
            .as_ref()
            .map_or_else(|| self.store.nitems(), |r| r.len())
    }
}

/// A scan that produces the rows of one relation.
///
/// The produced rows correspond column by column to the scan's target list.
pub trait RowSource: Send {
    fn types(&self) -> Arc<[TypeInfo]>;

    fn next_row(&mut self) -> Result<Option<Row>>;

    /// Returns the next chunk of at most `budget` bytes. Only called if
    /// `supports_bulk()` is true.
    fn next_bulk(&mut self, _budget: usize) -> Result<Option<BulkChunk>> {
        Err(ErrorKind::InvalidArgument("row source does not support bulk scans".to_string()).into())
    }

    fn supports_bulk(&self) -> bool {
        false
    }

    /// Restarts the scan from the first row.
    fn rescan(&mut self) -> Result<()>;

    fn supports_rewind(&self) -> bool {
        true
    }

    fn estimated_rows(&self) -> f64;

    /// Average width of a row in bytes.
    fn estimated_width(&self) -> usize;

    /// Executor parameters the scan depends on.
    fn param_deps(&self) -> &[u32] {
        &[]
    }
}

/// A relation held in memory.
pub struct MemoryRelation {
    types: Arc<[TypeInfo]>,
    rows: Arc<Vec<Row>>,
    pos: usize,
    rewindable: bool,
    bulk: bool,
    bulk_filter: Option<Box<dyn Fn(&Row) -> bool + Send>>,
    param_deps: Vec<u32>,
    estimates: Option<(f64, usize)>,
    rows_read: Arc<AtomicUsize>,
}

impl MemoryRelation {
    pub fn new(types: Vec<TypeInfo>, rows: Vec<Row>) -> Result<Self> {
        Self::from_shared(Arc::from(types), Arc::new(rows))
    }

    /// Scans rows that are shared with other relations, e.g., across
    /// repeated runs of the same join.
    pub fn from_shared(types: Arc<[TypeInfo]>, rows: Arc<Vec<Row>>) -> Result<Self> {
        if let Some(row) = rows.iter().find(|row| row.len() != types.len()) {
            Err(ErrorKind::InvalidArgument(format!(
                "row with {} columns in relation with {} columns",
                row.len(),
                types.len()
            )))?;
        }

        Ok(Self {
            types,
            rows,
            pos: 0,
            rewindable: true,
            bulk: false,
            bulk_filter: None,
            param_deps: Vec::new(),
            estimates: None,
            rows_read: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Forbids rewinding, like a scan over a stream.
    pub fn non_rewindable(mut self) -> Self {
        self.rewindable = false;
        self
    }

    pub fn with_bulk(mut self) -> Self {
        self.bulk = true;
        self
    }

    /// Enables bulk scans that mark only the rows passing `filter` as
    /// visible, without removing the others from the chunk.
    pub fn with_bulk_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Row) -> bool + Send + 'static,
    {
        self.bulk = true;
        self.bulk_filter = Some(Box::new(filter));
        self
    }

    pub fn with_param_deps(mut self, params: Vec<u32>) -> Self {
        self.param_deps = params;
        self
    }

    /// Overrides the planner estimates, which default to the exact values.
    pub fn with_estimates(mut self, rows: f64, width: usize) -> Self {
        self.estimates = Some((rows, width));
        self
    }

    /// Counts the rows handed out over all scans.
    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        self.rows_read.clone()
    }
}

impl RowSource for MemoryRelation {
    fn types(&self) -> Arc<[TypeInfo]> {
        self.types.clone()
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        let row = self.rows.get(self.pos).cloned();
        if row.is_some() {
            self.pos += 1;
            self.rows_read.fetch_add(1, Ordering::Relaxed);
        }
        Ok(row)
    }

    fn next_bulk(&mut self, budget: usize) -> Result<Option<BulkChunk>> {
        if !self.bulk {
            Err(ErrorKind::InvalidArgument(
                "bulk scan on a relation without bulk support".to_string(),
            ))?;
        }
        if self.pos >= self.rows.len() {
            return Ok(None);
        }

        let mut store = RowStore::new(self.types.clone(), budget);
        let mut rindex = Vec::new();
        while let Some(row) = self.rows.get(self.pos) {
            if !store.insert_row(row)? {
                break;
            }
            if self.bulk_filter.as_ref().map_or(true, |f| f(row)) {
                rindex.push((store.nitems() - 1) as u32);
            }
            self.pos += 1;
            self.rows_read.fetch_add(1, Ordering::Relaxed);
        }

        let rindex = if self.bulk_filter.is_some() {
            Some(rindex)
        } else {
            None
        };
        Ok(Some(BulkChunk { store, rindex }))
    }

    fn supports_bulk(&self) -> bool {
        self.bulk
    }

    fn rescan(&mut self) -> Result<()> {
        if !self.rewindable && self.pos > 0 {
            Err(ErrorKind::InvalidArgument(
                "relation does not support rewind".to_string(),
            ))?;
        }
        self.pos = 0;
        Ok(())
    }

    fn supports_rewind(&self) -> bool {
        self.rewindable
    }

    fn estimated_rows(&self) -> f64 {
        self.estimates
            .map_or(self.rows.len() as f64, |(rows, _)| rows)
    }

    fn estimated_width(&self) -> usize {
        if let Some((_, width)) = self.estimates {
            return width;
        }
        if self.rows.is_empty() {
            return 8 * self.types.len();
        }
        let total: usize = self
            .rows
            .iter()
            .map(|row| encode_row(&self.types, row).map_or(0, |bytes| bytes.len()))
            .sum();
        total / self.rows.len()
    }

    fn param_deps(&self) -> &[u32] {
        &self.param_deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Datum;

    fn relation() -> MemoryRelation {
        let rows = (0..10).map(|i| vec![Datum::Int8(i)]).collect();
        MemoryRelation::new(vec![TypeInfo::int8()], rows).unwrap()
    }

    #[test]
    fn rescan_restarts_scan() {
        let mut rel = relation();
        while rel.next_row().unwrap().is_some() {}
        rel.rescan().unwrap();
        assert_eq!(rel.next_row().unwrap(), Some(vec![Datum::Int8(0)]));
        assert_eq!(rel.read_counter().load(Ordering::Relaxed), 11);
    }

    #[test]
    fn non_rewindable_refuses_rescan() {
        let mut rel = relation().non_rewindable();
        assert!(!rel.supports_rewind());
        rel.next_row().unwrap();
        assert!(rel.rescan().is_err());
    }

    #[test]
    fn bulk_filter_marks_visible_rows() {
        let mut rel = relation().with_bulk_filter(|row| row[0] != Datum::Int8(3));
        let chunk = rel.next_bulk(1 << 20).unwrap().unwrap();
        assert_eq!(chunk.store.nitems(), 10);
        assert_eq!(chunk.nvisible(), 9);
        assert!(rel.next_bulk(1 << 20).unwrap().is_none());
    }
}
