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

//! Device-side semantics of the hash join program.
//!
//! The main kernel probes the multi-level hash buffer with each outer row and
//! writes one result tuple per match into the result buffer. A result tuple
//! consists of `nrels` `u32` values: the 1-based index of the outer row,
//! followed by the offset of the matched hash entry relative to its table for
//! each depth.
//!
//! ```text
//! kern_resultbuf: nrels: u32 | nrooms: u32 | nitems: u32 | errcode: i32 | tuples[nrooms * nrels]: u32
//! kern_row_map:   enabled: u32 | nvalid: u32 | rindex[nvalid]: u32
//! ```
//!
//! The projection kernel turns the result tuples into tuple slots of the
//! host-visible pseudo columns. By-value columns are copied into the slot,
//! by-reference columns are stored as a packed [`HostRef`].

use super::codegen::{JoinKernelPlan, MAIN_KERNEL, PROJECTION_KERNEL};
use super::hash_builder::hash_keys;
use super::multi_hash::{BufferOffset, EntryView, HashTableView, MultiHashView};
use crate::data_store::{
    datum_offset, decode_datum, read_i32, read_u32, write_u32, HostRef, ParamBuffer, RowStoreView,
    SlotStoreHeader, SlotStoreMut,
};
use crate::error::{Error, ErrorKind, Result};
use crate::eval::{ExprEvaluator, TupleAccess};
use crate::expr::{Expr, Var};
use crate::types::Datum;
use device_runtime::{Device, Kernel, KernelArg, KernelHandle, LaunchContext, Program, ProgramBuilder};
use std::sync::Arc;
use tracing::debug;

/// The destination store ran out of slots.
pub const DATA_STORE_NO_SPACE: i32 = 2;

pub const RESULT_BUFFER_HEADER: usize = 16;

const RB_NRELS: usize = 0;
const RB_NROOMS: usize = 4;
const RB_NITEMS: usize = 8;
const RB_ERRCODE: usize = 12;

/// The header of a result buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResultBufferHeader {
    pub nrels: usize,
    pub nrooms: usize,
    pub nitems: usize,
    pub errcode: i32,
}

impl ResultBufferHeader {
    pub fn new(nrels: usize, nrooms: usize) -> Self {
        Self {
            nrels,
            nrooms,
            nitems: 0,
            errcode: 0,
        }
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            nrels: read_u32(bytes, RB_NRELS)? as usize,
            nrooms: read_u32(bytes, RB_NROOMS)? as usize,
            nitems: read_u32(bytes, RB_NITEMS)? as usize,
            errcode: read_i32(bytes, RB_ERRCODE)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![0; RESULT_BUFFER_HEADER];
        self.write(&mut bytes)?;
        Ok(bytes)
    }

    fn write(&self, bytes: &mut [u8]) -> Result<()> {
        write_u32(bytes, RB_NRELS, self.nrels as u32)?;
        write_u32(bytes, RB_NROOMS, self.nrooms as u32)?;
        write_u32(bytes, RB_NITEMS, self.nitems as u32)?;
        write_u32(bytes, RB_ERRCODE, self.errcode as u32)
    }

    /// The length of a result buffer with `nrooms` tuples.
    pub fn length_for(nrels: usize, nrooms: usize) -> usize {
        RESULT_BUFFER_HEADER + 4 * nrels * nrooms
    }
}

/// Serializes the row map that restricts the main kernel to a subset of the
/// outer rows. Without an index, all rows are visible.
pub fn row_map_bytes(rindex: Option<&[u32]>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + 4 * rindex.map_or(0, |r| r.len()));
    match rindex {
        Some(rindex) => {
            bytes.extend_from_slice(&1_u32.to_le_bytes());
            bytes.extend_from_slice(&(rindex.len() as u32).to_le_bytes());
            rindex
                .iter()
                .for_each(|i| bytes.extend_from_slice(&i.to_le_bytes()));
        }
        None => bytes.extend_from_slice(&[0; 8]),
    }
    bytes
}

fn visible_rows(row_map: &[u8], nitems: usize) -> Result<Vec<u32>> {
    if read_u32(row_map, 0)? == 0 {
        return Ok((0..nitems as u32).collect());
    }
    let nvalid = read_u32(row_map, 4)? as usize;
    (0..nvalid)
        .map(|i| {
            let index = read_u32(row_map, 8 + 4 * i)?;
            if index as usize >= nitems {
                Err(ErrorKind::InternalError(format!(
                    "row map refers to row {} of {}",
                    index, nitems
                )))?;
            }
            Ok(index)
        })
        .collect()
}

fn to_device_error(error: Error) -> device_runtime::error::Error {
    device_runtime::error::ErrorKind::RuntimeError(error.to_string()).into()
}

/// The columns of the pseudo relation visible while probing a depth.
struct PseudoTuple<'a, 'b> {
    plan: &'b JoinKernelPlan,
    outer_row: &'a [u8],
    matched: &'b [EntryView<'a>],
    kparams: &'a [u8],
}

impl<'a, 'b> TupleAccess for PseudoTuple<'a, 'b> {
    fn var(&self, var: &Var) -> Result<Datum> {
        let entry = (var.attno as usize)
            .checked_sub(1)
            .and_then(|i| self.plan.entries.get(i))
            .ok_or_else(|| {
                ErrorKind::InternalError(format!("pseudo column {} does not exist", var.attno))
            })?;
        let types = &self.plan.source_types[entry.srcdepth];

        if entry.srcdepth == 0 {
            return decode_datum(types, self.outer_row, entry.srcresno);
        }
        match self.matched.get(entry.srcdepth - 1) {
            Some(kentry) => decode_datum(types, kentry.row(), entry.srcresno),
            None => Err(ErrorKind::InternalError(format!(
                "pseudo column {} of depth {} is not bound yet",
                var.attno, entry.srcdepth
            ))
            .into()),
        }
    }

    fn param(&self, id: u32) -> Result<Datum> {
        let (index, ty) = self
            .plan
            .used_params
            .iter()
            .enumerate()
            .find_map(|(index, p)| match p {
                Expr::Param(pid, ty) if *pid == id => Some((index, ty)),
                _ => None,
            })
            .ok_or_else(|| {
                ErrorKind::InternalError(format!("parameter ${} is not in the parameter buffer", id))
            })?;
        ParamBuffer::get(self.kparams, index, ty)
    }
}

/// `kern_gpuhashjoin_main(kparams, kmhash, kds, krowmap, kresults)`
pub struct MainKernel {
    plan: Arc<JoinKernelPlan>,
    evaluator: Arc<dyn ExprEvaluator>,
}

impl MainKernel {
    pub fn new(plan: Arc<JoinKernelPlan>, evaluator: Arc<dyn ExprEvaluator>) -> Self {
        Self { plan, evaluator }
    }

    fn probe<'a>(
        &self,
        tables: &[HashTableView<'a>],
        outer_row: &'a [u8],
        matched: &mut Vec<EntryView<'a>>,
        kparams: &'a [u8],
        kds_index: u32,
        out: &mut Vec<u32>,
    ) -> Result<()> {
        let depth = matched.len() + 1;
        if depth > self.plan.ndepths() {
            out.push(kds_index + 1);
            out.extend(matched.iter().map(|e| e.table_offset().0 as u32));
            return Ok(());
        }

        let spec = &self.plan.depths[depth - 1];
        let table = &tables[depth - 1];
        let hash = {
            let tuple = PseudoTuple {
                plan: &self.plan,
                outer_row,
                matched: matched.as_slice(),
                kparams,
            };
            let keys = spec
                .hash_outer
                .iter()
                .map(|key| self.evaluator.eval(key, &tuple))
                .collect::<Result<Vec<_>>>()?;
            hash_keys(keys.iter())
        };

        let mut kentry = table.first_entry(hash)?;
        while let Some(entry) = kentry {
            if entry.hash() == hash {
                matched.push(entry);
                let pass = {
                    let tuple = PseudoTuple {
                        plan: &self.plan,
                        outer_row,
                        matched: matched.as_slice(),
                        kparams,
                    };
                    self.evaluator.qual(&spec.hash_clauses, &tuple)?
                        && self.evaluator.qual(&spec.qual, &tuple)?
                };
                if pass {
                    self.probe(tables, outer_row, matched, kparams, kds_index, out)?;
                }
                matched.pop();
            }
            kentry = table.next_entry(&entry)?;
        }

        Ok(())
    }

    fn execute(&self, ctx: &LaunchContext<'_>, args: &[KernelArg]) -> Result<()> {
        let kparams = KernelArg::mem_at(args, 0)?;
        let kmhash = KernelArg::mem_at(args, 1)?;
        let kds = KernelArg::mem_at(args, 2)?;
        let krowmap = KernelArg::mem_at(args, 3)?;
        let kresults = KernelArg::mem_at(args, 4)?;
        let nrels = self.plan.nrels();

        let tuples = {
            let kparams = kparams.read();
            let kmhash = kmhash.read();
            let kds = kds.read();
            let krowmap = krowmap.read();

            let view = MultiHashView::new(&kmhash)?;
            let tables = (1..=self.plan.ndepths())
                .map(|depth| view.table(depth))
                .collect::<Result<Vec<_>>>()?;
            let outer = RowStoreView::new(&kds)?;
            let rows = visible_rows(&krowmap, outer.nitems())?;
            let kparams: &[u8] = &kparams;

            let groups = ctx.for_each_group(rows.len(), |range| {
                let mut out = Vec::new();
                let mut matched = Vec::with_capacity(tables.len());
                for &kds_index in &rows[range] {
                    let (_, outer_row) = outer.row(kds_index as usize).map_err(to_device_error)?;
                    self.probe(&tables, outer_row, &mut matched, kparams, kds_index, &mut out)
                        .map_err(to_device_error)?;
                }
                Ok(out)
            })?;
            groups.concat()
        };

        let nitems = tuples.len() / nrels;
        let mut header = ResultBufferHeader::read(&kresults.read())?;
        if header.nrels != nrels {
            Err(ErrorKind::InternalError(format!(
                "result buffer holds {} relations, join has {}",
                header.nrels, nrels
            )))?;
        }
        if nitems > header.nrooms {
            debug!(
                nrooms = header.nrooms,
                nitems, "expanding result buffer on the device"
            );
            kresults.resize(ResultBufferHeader::length_for(nrels, nitems))?;
            header.nrooms = nitems;
        }
        header.nitems = nitems;

        let mut kresults = kresults.write();
        header.write(&mut kresults)?;
        let body = &mut kresults[RESULT_BUFFER_HEADER..RESULT_BUFFER_HEADER + 4 * tuples.len()];
        for (chunk, value) in body.chunks_exact_mut(4).zip(&tuples) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }

        Ok(())
    }
}

impl Kernel for MainKernel {
    fn launch(
        &self,
        ctx: &LaunchContext<'_>,
        args: &[KernelArg],
    ) -> device_runtime::error::Result<()> {
        self.execute(ctx, args).map_err(to_device_error)
    }
}

/// `kern_gpuhashjoin_projection(kmhash, kds, kresults, kds_dest)`
pub struct ProjectionKernel {
    plan: Arc<JoinKernelPlan>,
}

impl ProjectionKernel {
    pub fn new(plan: Arc<JoinKernelPlan>) -> Self {
        Self { plan }
    }

    fn project(
        &self,
        tables: &[HashTableView<'_>],
        outer: &RowStoreView<'_>,
        tuple: &[u32],
    ) -> Result<Vec<Option<u64>>> {
        self.plan
            .host_entries()
            .iter()
            .map(|entry| {
                let depth = entry.srcdepth;
                let (row_start, row) = if depth == 0 {
                    let index = (tuple[0] as usize).checked_sub(1).ok_or_else(|| {
                        ErrorKind::InternalError("result tuple without outer row".to_string())
                    })?;
                    outer.row(index)?
                } else {
                    let kentry = tables[depth - 1]
                        .entry(BufferOffset(tuple[depth] as u64))?
                        .ok_or_else(|| {
                            ErrorKind::InternalError(format!(
                                "result tuple without entry at depth {}",
                                depth
                            ))
                        })?;
                    (kentry.row_offset(), kentry.row())
                };

                let types = &self.plan.source_types[depth];
                let ty = &types[entry.srcresno];
                let offset = match datum_offset(types, row, entry.srcresno)? {
                    None => return Ok(None),
                    Some(offset) => offset,
                };

                if ty.is_varlena() || !ty.byval {
                    return Ok(Some(
                        HostRef {
                            depth: depth as u16,
                            offset: (row_start + offset) as u64,
                        }
                        .pack(),
                    ));
                }
                if ty.len <= 0 || ty.len > 8 {
                    Err(ErrorKind::InternalError(format!(
                        "unexpected type length {} of by-value type {}",
                        ty.len, ty.name
                    )))?;
                }
                let len = ty.len as usize;
                let stored = row.get(offset..offset + len).ok_or_else(|| {
                    ErrorKind::InternalError(format!("truncated datum in column {}", entry.resname))
                })?;
                let mut raw = [0_u8; 8];
                raw[..len].copy_from_slice(stored);
                Ok(Some(u64::from_le_bytes(raw)))
            })
            .collect()
    }

    fn execute(&self, ctx: &LaunchContext<'_>, args: &[KernelArg]) -> Result<()> {
        let kmhash = KernelArg::mem_at(args, 0)?;
        let kds = KernelArg::mem_at(args, 1)?;
        let kresults = KernelArg::mem_at(args, 2)?;
        let kdest = KernelArg::mem_at(args, 3)?;

        let dest = SlotStoreHeader::read(&kdest.read())?;
        if dest.ncols as usize != self.plan.nhost {
            Err(ErrorKind::InternalError(format!(
                "destination has {} columns, join projects {}",
                dest.ncols, self.plan.nhost
            )))?;
        }

        let slots = {
            let kresults = kresults.read();
            let header = ResultBufferHeader::read(&kresults)?;
            if header.nitems > dest.nrooms as usize {
                drop(kresults);
                let mut kdest = kdest.write();
                let mut store = SlotStoreMut::new(&mut kdest)?;
                store.set_errcode(DATA_STORE_NO_SPACE)?;
                store.set_nitems(header.nitems)?;
                return Ok(());
            }

            let kmhash = kmhash.read();
            let kds = kds.read();
            let view = MultiHashView::new(&kmhash)?;
            let tables = (1..=self.plan.ndepths())
                .map(|depth| view.table(depth))
                .collect::<Result<Vec<_>>>()?;
            let outer = RowStoreView::new(&kds)?;
            let nrels = header.nrels;
            let body = kresults
                .get(RESULT_BUFFER_HEADER..ResultBufferHeader::length_for(nrels, header.nitems))
                .ok_or_else(|| ErrorKind::InternalError("truncated result buffer".to_string()))?;

            let groups = ctx.for_each_group(header.nitems, |range| {
                range
                    .map(|i| {
                        let tuple: Vec<u32> = body[4 * nrels * i..4 * nrels * (i + 1)]
                            .chunks_exact(4)
                            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                            .collect();
                        self.project(&tables, &outer, &tuple)
                            .map_err(to_device_error)
                    })
                    .collect::<device_runtime::error::Result<Vec<_>>>()
            })?;
            groups.concat()
        };

        let mut kdest = kdest.write();
        let mut store = SlotStoreMut::new(&mut kdest)?;
        for (row, values) in slots.iter().enumerate() {
            store.put(row, values)?;
        }
        store.set_nitems(slots.len())?;
        store.set_errcode(0)?;

        Ok(())
    }
}

impl Kernel for ProjectionKernel {
    fn launch(
        &self,
        ctx: &LaunchContext<'_>,
        args: &[KernelArg],
    ) -> device_runtime::error::Result<()> {
        self.execute(ctx, args).map_err(to_device_error)
    }
}

/// The built join program and its entry points.
pub struct JoinKernels {
    pub program: Program,
    pub main: KernelHandle,
    pub projection: KernelHandle,
}

impl JoinKernels {
    /// Builds the program from `source` and binds the kernels to `plan`.
    pub fn build(
        device: &Device,
        source: &str,
        plan: Arc<JoinKernelPlan>,
        evaluator: Arc<dyn ExprEvaluator>,
    ) -> Result<Self> {
        let program = ProgramBuilder::new(source)
            .kernel(MAIN_KERNEL, Arc::new(MainKernel::new(plan.clone(), evaluator)))
            .kernel(PROJECTION_KERNEL, Arc::new(ProjectionKernel::new(plan)))
            .build(device)
            .map_err(|e| {
                let build_log = match e.kind() {
                    device_runtime::error::ErrorKind::BuildFailure(log) => Some(log.clone()),
                    _ => None,
                };
                match build_log {
                    Some(build_log) => Error::from(ErrorKind::KernelCompile {
                        source: source.to_string(),
                        build_log,
                    }),
                    None => Error::from(e),
                }
            })?;
        debug!(log = program.build_log(), "built hash join program");

        let main = program.kernel(MAIN_KERNEL)?;
        let projection = program.kernel(PROJECTION_KERNEL)?;
        Ok(Self {
            program,
            main,
            projection,
        })
    }
}
