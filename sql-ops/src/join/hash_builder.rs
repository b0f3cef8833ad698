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

//! Loads the inner relations into multi-level hash buffers.
//!
//! Each inner relation is loaded by one level of the loader. The level of
//! depth `d` asks the level of depth `d + 1` for a buffer that contains the
//! tables of all deeper depths, and then appends its own table.
//!
//! If a table does not fit into the buffer, the level stops at the first row
//! that does not fit and keeps the row for the next chunk. The buffer is then
//! marked as divided. The loader produces one buffer per combination of
//! chunks, where deeper levels vary fastest. While deeper levels produce
//! more buffers, a level reuses a copy of its current chunk. When the deeper
//! levels are exhausted, the level loads its next chunk and rescans the
//! deeper levels.

use super::multi_hash::{entry_len, table_header_len, MultiHashBuffer, MultiHashWriter};
use crate::data_store::{encode_row, ColumnMeta};
use crate::error::{ErrorKind, Result};
use crate::eval::{ExprEvaluator, ParamValues, RowAccess};
use crate::expr::Expr;
use crate::row_source::RowSource;
use crate::types::{Row, TypeInfo};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Computes the hash value of a row from its key values.
///
/// NULL keys don't contribute to the hash.
pub fn hash_keys<'a, I>(keys: I) -> u32
where
    I: IntoIterator<Item = &'a crate::types::Datum>,
{
    keys.into_iter()
        .filter_map(|key| key.key_bytes())
        .fold(0, |crc, bytes| crc32c::crc32c_append(crc, &bytes))
}

/// Configuration of one level of the loader.
pub struct LevelSpec {
    pub source: Box<dyn RowSource>,
    /// Hash keys in terms of the scanned relation (`VarNo::Scan`).
    pub hash_keys: Vec<Expr>,
    pub nslots: usize,
    pub threshold_ratio: f64,
}

struct HashLevel {
    depth: usize,
    source: Box<dyn RowSource>,
    types: Arc<[TypeInfo]>,
    colmeta: Vec<ColumnMeta>,
    hash_keys: Vec<Expr>,
    nslots: usize,
    threshold_ratio: f64,
    overflow: Option<Row>,
    scan_done: bool,
    nchunks: usize,
    curr_chunk: Option<Vec<u8>>,
}

impl HashLevel {
    /// True if all rows of the relation were loaded since the last rescan.
    fn is_done(&self) -> bool {
        self.nchunks > 0 && self.scan_done && self.overflow.is_none()
    }

    fn limit(&self, writer: &MultiHashWriter) -> f64 {
        self.threshold_ratio * writer.capacity() as f64
    }

    fn rescan(&mut self) -> Result<()> {
        if !self.source.supports_rewind() {
            Err(ErrorKind::InvalidArgument(format!(
                "inner relation at depth {} cannot be rewound",
                self.depth
            )))?;
        }
        self.source.rescan()?;
        self.overflow = None;
        self.scan_done = false;
        self.nchunks = 0;
        self.curr_chunk = None;
        Ok(())
    }
}

/// Doubles the buffer capacity unless that exceeds `max_alloc_size`.
fn try_expand(writer: &mut MultiHashWriter, hashtable_size: &mut usize, max_alloc_size: usize) -> bool {
    match std::cmp::max(writer.capacity(), 1).checked_mul(2) {
        Some(new_capacity) if new_capacity <= max_alloc_size => {
            writer.expand(new_capacity);
            *hashtable_size = std::cmp::max(*hashtable_size, new_capacity);
            true
        }
        _ => false,
    }
}

/// Builds multi-level hash buffers from the inner relations of a join.
pub struct MultiHashLoader {
    levels: Vec<HashLevel>,
    hashtable_size: usize,
    max_alloc_size: usize,
    evaluator: Arc<dyn ExprEvaluator>,
    divided: bool,
    nbuffers: usize,
    rows_loaded: u64,
    time_inner_load: Duration,
}

impl MultiHashLoader {
    /// Creates a loader. `levels[0]` is the inner relation of depth 1.
    pub fn new(
        levels: Vec<LevelSpec>,
        hashtable_size: usize,
        max_alloc_size: usize,
        evaluator: Arc<dyn ExprEvaluator>,
    ) -> Result<Self> {
        if levels.is_empty() {
            Err(ErrorKind::InvalidArgument(
                "hash buffer without inner relations".to_string(),
            ))?;
        }
        if hashtable_size > max_alloc_size {
            Err(ErrorKind::HashBuild(format!(
                "initial hash buffer of {} bytes exceeds max_alloc_size of {} bytes",
                hashtable_size, max_alloc_size
            )))?;
        }

        let levels = levels
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                let types = spec.source.types();
                HashLevel {
                    depth: index + 1,
                    colmeta: types.iter().map(ColumnMeta::of).collect(),
                    types,
                    source: spec.source,
                    hash_keys: spec.hash_keys,
                    nslots: std::cmp::max(spec.nslots, 1),
                    threshold_ratio: spec.threshold_ratio,
                    overflow: None,
                    scan_done: false,
                    nchunks: 0,
                    curr_chunk: None,
                }
            })
            .collect();

        Ok(Self {
            levels,
            hashtable_size,
            max_alloc_size,
            evaluator,
            divided: false,
            nbuffers: 0,
            rows_loaded: 0,
            time_inner_load: Duration::default(),
        })
    }

    pub fn depths(&self) -> usize {
        self.levels.len()
    }

    /// The current capacity of new buffers. Grows with each expansion.
    pub fn hashtable_size(&self) -> usize {
        self.hashtable_size
    }

    /// True if any buffer so far didn't hold all inner rows.
    pub fn is_divided(&self) -> bool {
        self.divided
    }

    pub fn buffers_loaded(&self) -> usize {
        self.nbuffers
    }

    pub fn rows_loaded(&self) -> u64 {
        self.rows_loaded
    }

    pub fn time_inner_load(&self) -> Duration {
        self.time_inner_load
    }

    /// The executor parameters that any inner relation depends on.
    pub fn param_deps(&self) -> Vec<u32> {
        let mut deps: Vec<u32> = self
            .levels
            .iter()
            .flat_map(|l| l.source.param_deps().iter().copied())
            .collect();
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    /// Fails if any inner relation cannot be rewound.
    pub fn check_rewindable(&self) -> Result<()> {
        match self.levels.iter().find(|l| !l.source.supports_rewind()) {
            Some(level) => Err(ErrorKind::InvalidArgument(format!(
                "inner relation at depth {} cannot be rewound for a divided hash buffer",
                level.depth
            ))
            .into()),
            None => Ok(()),
        }
    }

    /// Restarts loading from the first chunk of every inner relation.
    pub fn rescan(&mut self) -> Result<()> {
        for level in &mut self.levels {
            level.rescan()?;
        }
        self.divided = false;
        self.nbuffers = 0;
        Ok(())
    }

    /// Loads the next combination of inner chunks. Returns `None` after the
    /// last combination.
    pub fn next_buffer(&mut self, params: &ParamValues) -> Result<Option<Arc<MultiHashBuffer>>> {
        let start = Instant::now();

        let mut writer = match self.level_next(0, params)? {
            Some(writer) => writer,
            None => return Ok(None),
        };

        self.divided |= self
            .levels
            .iter()
            .any(|l| l.nchunks > 1 || !l.is_done());
        writer.set_divided(self.divided);
        let buffer = Arc::new(writer.freeze()?);

        self.nbuffers += 1;
        self.time_inner_load += start.elapsed();
        debug!(
            buffer = self.nbuffers,
            usage = buffer.usage(),
            capacity = buffer.capacity(),
            divided = buffer.is_divided(),
            "loaded multi-level hash buffer"
        );

        Ok(Some(buffer))
    }

    fn level_next(&mut self, index: usize, params: &ParamValues) -> Result<Option<MultiHashWriter>> {
        if index + 1 == self.levels.len() {
            if self.levels[index].is_done() {
                return Ok(None);
            }
            let mut writer = MultiHashWriter::new(self.hashtable_size, self.levels.len());
            self.fill(index, &mut writer, params)?;
            return Ok(Some(writer));
        }

        match self.level_next(index + 1, params)? {
            Some(mut writer) => {
                match self.levels[index].curr_chunk.take() {
                    Some(chunk) => {
                        let appended = self.append_chunk(index, &mut writer, &chunk);
                        self.levels[index].curr_chunk = Some(chunk);
                        appended?;
                    }
                    None => self.fill(index, &mut writer, params)?,
                }
                Ok(Some(writer))
            }
            None => {
                if self.levels[index].is_done() {
                    return Ok(None);
                }
                for level in &mut self.levels[index + 1..] {
                    level.rescan()?;
                }
                match self.level_next(index + 1, params)? {
                    Some(mut writer) => {
                        self.fill(index, &mut writer, params)?;
                        Ok(Some(writer))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    fn append_chunk(&mut self, index: usize, writer: &mut MultiHashWriter, chunk: &[u8]) -> Result<()> {
        let level = &self.levels[index];
        while (writer.usage() + chunk.len()) as f64 > level.limit(writer) {
            if !try_expand(writer, &mut self.hashtable_size, self.max_alloc_size) {
                Err(ErrorKind::HashBuild(
                    "No multi-hashtables expandable any more".to_string(),
                ))?;
            }
        }
        writer.append_table(level.depth, chunk)
    }

    fn fill(&mut self, index: usize, writer: &mut MultiHashWriter, params: &ParamValues) -> Result<()> {
        let deepest = index + 1 == self.levels.len();
        let MultiHashLoader {
            levels,
            hashtable_size,
            max_alloc_size,
            evaluator,
            rows_loaded,
            ..
        } = self;
        let level = &mut levels[index];

        let header = table_header_len(level.colmeta.len()) + 8 * level.nslots;
        while (writer.usage() + header) as f64 > level.limit(writer) {
            if !try_expand(writer, hashtable_size, *max_alloc_size) {
                Err(ErrorKind::HashBuild(
                    "No multi-hashtables expandable any more".to_string(),
                ))?;
            }
        }
        writer.begin_table(level.depth, &level.colmeta, level.nslots)?;

        let param_lookup = |id: u32| params.get(&id).cloned();
        loop {
            let row = match level.overflow.take() {
                Some(row) => row,
                None => match level.source.next_row()? {
                    Some(row) => row,
                    None => {
                        level.scan_done = true;
                        break;
                    }
                },
            };

            let encoded = encode_row(&level.types, &row)?;
            let needed = entry_len(encoded.len());
            let mut fits = true;
            while (writer.usage() + needed) as f64 > level.limit(writer) {
                if !try_expand(writer, hashtable_size, *max_alloc_size) {
                    fits = false;
                    break;
                }
            }
            if !fits {
                if writer.table_nitems() == 0 {
                    Err(ErrorKind::HashBuild(format!(
                        "row of {} bytes does not fit into an empty hash table at depth {}",
                        needed, level.depth
                    )))?;
                }
                level.overflow = Some(row);
                break;
            }

            let access = RowAccess {
                row: &row,
                params: &param_lookup,
            };
            let keys = level
                .hash_keys
                .iter()
                .map(|key| evaluator.eval(key, &access))
                .collect::<Result<Vec<_>>>()?;
            writer.insert(hash_keys(&keys), &encoded)?;
            *rows_loaded += 1;
        }

        let chunk = writer.end_table()?;
        level.nchunks += 1;
        if !deepest {
            level.curr_chunk = Some(chunk);
        }
        if level.overflow.is_some() {
            debug!(
                depth = level.depth,
                chunk = level.nchunks,
                "hash table is full, inner relation continues in the next chunk"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::HostEvaluator;
    use crate::expr::VarNo;
    use crate::join::multi_hash::MultiHashView;
    use crate::row_source::MemoryRelation;
    use crate::types::Datum;

    fn level(keys: Vec<i64>, ratio: f64) -> LevelSpec {
        let rows = keys.into_iter().map(|k| vec![Datum::Int8(k)]).collect();
        LevelSpec {
            source: Box::new(MemoryRelation::new(vec![TypeInfo::int8()], rows).unwrap()),
            hash_keys: vec![Expr::var(VarNo::Scan, 1, TypeInfo::int8())],
            nslots: 16,
            threshold_ratio: ratio,
        }
    }

    fn count_rows(buffer: &MultiHashBuffer, depth: usize) -> usize {
        buffer.view().unwrap().table(depth).unwrap().nitems()
    }

    #[test]
    fn hash_skips_null_keys() {
        let key = Datum::Int4(42);
        assert_eq!(hash_keys(&[key.clone(), Datum::Null]), hash_keys(&[key]));
        assert_eq!(hash_keys(&[]), 0);
    }

    #[test]
    fn single_buffer_when_everything_fits() {
        let mut loader = MultiHashLoader::new(
            vec![level((0..100).collect(), 1.0)],
            1 << 16,
            1 << 20,
            Arc::new(HostEvaluator),
        )
        .unwrap();
        let params = ParamValues::new();

        let buffer = loader.next_buffer(&params).unwrap().unwrap();
        assert_eq!(count_rows(&buffer, 1), 100);
        assert!(!buffer.is_divided());
        assert!(loader.next_buffer(&params).unwrap().is_none());
    }

    #[test]
    fn growth_doubles_capacity() {
        let mut loader = MultiHashLoader::new(
            vec![level((0..1000).collect(), 1.0)],
            512,
            1 << 20,
            Arc::new(HostEvaluator),
        )
        .unwrap();
        let buffer = loader.next_buffer(&ParamValues::new()).unwrap().unwrap();

        assert_eq!(count_rows(&buffer, 1), 1000);
        assert!(loader.hashtable_size() > 512);
        assert!(loader.hashtable_size().is_power_of_two());
        assert!(!buffer.is_divided());
    }

    #[test]
    fn nested_chunks_vary_deepest_fastest() {
        let mut loader = MultiHashLoader::new(
            vec![level((0..300).collect(), 1.0), level((0..300).collect(), 0.5)],
            4096,
            16384,
            Arc::new(HostEvaluator),
        )
        .unwrap();
        let params = ParamValues::new();

        let mut combinations = Vec::new();
        while let Some(buffer) = loader.next_buffer(&params).unwrap() {
            assert!(buffer.is_divided());
            let view = MultiHashView::new(buffer.bytes()).unwrap();
            combinations.push((
                view.table(1).unwrap().nitems(),
                view.table(2).unwrap().nitems(),
            ));
        }

        let depth1: usize = combinations
            .iter()
            .scan(None, |last, &(d1, d2)| {
                let first_of_chunk = d2 == combinations[0].1 && *last != Some(d1);
                *last = Some(d1);
                Some(if first_of_chunk { d1 } else { 0 })
            })
            .sum();
        assert!(combinations.len() > 2);
        assert_eq!(depth1, 300);
        let depth2: usize = combinations
            .iter()
            .take_while(|&&(d1, _)| d1 == combinations[0].0)
            .map(|&(_, d2)| d2)
            .sum();
        assert_eq!(depth2, 300);
    }

    #[test]
    fn oversized_row_is_fatal() {
        let rows = vec![vec![Datum::Text("x".repeat(4096))]];
        let spec = LevelSpec {
            source: Box::new(MemoryRelation::new(vec![TypeInfo::text()], rows).unwrap()),
            hash_keys: vec![],
            nslots: 4,
            threshold_ratio: 1.0,
        };
        let mut loader =
            MultiHashLoader::new(vec![spec], 256, 1024, Arc::new(HostEvaluator)).unwrap();

        match loader.next_buffer(&ParamValues::new()) {
            Err(e) => assert_eq!(e.stage(), Some("hash build")),
            Ok(_) => panic!("expected a hash build error"),
        }
    }

    #[test]
    fn dividing_requires_rewindable_deeper_levels() {
        let rows: Vec<Row> = (0..300).map(|k| vec![Datum::Int8(k)]).collect();
        let deeper = LevelSpec {
            source: Box::new(
                MemoryRelation::new(vec![TypeInfo::int8()], rows)
                    .unwrap()
                    .non_rewindable(),
            ),
            hash_keys: vec![Expr::var(VarNo::Scan, 1, TypeInfo::int8())],
            nslots: 16,
            threshold_ratio: 0.5,
        };
        let mut loader = MultiHashLoader::new(
            vec![level((0..300).collect(), 1.0), deeper],
            4096,
            16384,
            Arc::new(HostEvaluator),
        )
        .unwrap();
        assert!(loader.check_rewindable().is_err());

        let params = ParamValues::new();
        let result = (0..100).try_for_each(|_| loader.next_buffer(&params).map(|_| ()));
        match result {
            Err(e) => match e.kind() {
                ErrorKind::InvalidArgument(_) => {}
                other => panic!("unexpected error kind {:?}", other),
            },
            Ok(()) => panic!("rescan of a non-rewindable relation succeeded"),
        }
    }
}
