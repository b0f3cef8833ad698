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

//! The execution node of the hash join.
//!
//! The node loads the inner relations into a multi-level hash buffer, splits
//! the outer relation into chunks, and keeps up to `max_async_chunks` join
//! sessions in flight. Finished sessions arrive in completion order, which
//! need not be the submission order.
//!
//! If the hash buffer is divided, the outer relation is scanned once per
//! buffer.

use super::explain::{explain, ExplainOptions};
use super::hash_builder::MultiHashLoader;
use super::kernel::JoinKernels;
use super::multi_hash::MultiHashBuffer;
use super::perfmon::Perfmon;
use super::plan::{GpuHashJoinConfig, GpuHashJoinPlan, PlanDescription};
use super::session::{JoinSession, OuterChunk, SessionContext};
use crate::data_store::{HostRef, ParamBuffer, RowStore, SlotStore};
use crate::error::{ErrorKind, Result};
use crate::eval::{ExprEvaluator, ParamValues, RowAccess};
use crate::expr::Expr;
use crate::row_source::RowSource;
use crate::types::{Datum, Row, TypeInfo};
use device_runtime::Device;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// The result rows of one join session.
///
/// Rows are in the layout of the host columns of the pseudo relation.
/// Variable-length and by-reference columns point into the outer chunk or
/// into the hash buffer, which the batch keeps alive.
pub struct JoinBatch {
    types: Arc<[TypeInfo]>,
    slots: SlotStore,
    outer: Arc<Vec<u8>>,
    hash_buffer: Arc<MultiHashBuffer>,
    rindex: Option<Vec<u32>>,
}

impl JoinBatch {
    pub fn types(&self) -> &Arc<[TypeInfo]> {
        &self.types
    }

    /// The number of result rows, including rows filtered by host clauses.
    pub fn nitems(&self) -> usize {
        self.slots.nitems()
    }

    /// The rows that passed the host clauses. `None` if all rows are visible.
    pub fn rindex(&self) -> Option<&[u32]> {
        self.rindex.as_deref()
    }

    pub fn nvisible(&self) -> usize {
        self.rindex.as_ref().map_or(self.nitems(), |r| r.len())
    }

    pub fn hash_buffer(&self) -> &Arc<MultiHashBuffer> {
        &self.hash_buffer
    }

    /// Decodes result row `index`.
    pub fn row(&self, index: usize) -> Result<Row> {
        self.types
            .iter()
            .enumerate()
            .map(|(col, ty)| {
                let bits = match self.slots.value(index, col)? {
                    None => return Ok(Datum::Null),
                    Some(bits) => bits,
                };
                if !ty.is_varlena() && ty.byval {
                    return Datum::from_value_bits(ty, bits);
                }

                let host_ref = HostRef::unpack(bits);
                let bytes = if host_ref.depth == 0 {
                    &self.outer
                } else {
                    self.hash_buffer.bytes()
                };
                let stored = bytes.get(host_ref.offset as usize..).ok_or_else(|| {
                    ErrorKind::InternalError(format!(
                        "host reference to offset {} of depth {} out of bounds",
                        host_ref.offset, host_ref.depth
                    ))
                })?;
                Datum::decode(ty, stored)
            })
            .collect()
    }

    /// Decodes all visible rows in order.
    pub fn visible_rows(&self) -> Result<Vec<Row>> {
        match &self.rindex {
            Some(rindex) => rindex.iter().map(|&i| self.row(i as usize)).collect(),
            None => (0..self.nitems()).map(|i| self.row(i)).collect(),
        }
    }

    fn visible_index(&self, position: usize) -> usize {
        match &self.rindex {
            Some(rindex) => rindex[position] as usize,
            None => position,
        }
    }
}

impl std::fmt::Debug for JoinBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("JoinBatch")
            .field("nitems", &self.nitems())
            .field("nvisible", &self.nvisible())
            .finish()
    }
}

pub struct GpuHashJoin {
    description: PlanDescription,
    config: GpuHashJoinConfig,
    ctx: Arc<SessionContext>,
    evaluator: Arc<dyn ExprEvaluator>,
    outer: Box<dyn RowSource>,
    outer_types: Arc<[TypeInfo]>,
    loader: MultiHashLoader,
    host_types: Arc<[TypeInfo]>,
    pseudo_tlist: bool,
    params: ParamValues,
    kparams: Option<Arc<Vec<u8>>>,
    hash_buffer: Option<Arc<MultiHashBuffer>>,
    overflow: Option<Row>,
    begun: bool,
    scan_done: bool,
    num_running: usize,
    next_session: u64,
    tx: Sender<Result<JoinSession>>,
    rx: Receiver<Result<JoinSession>>,
    current: Option<(JoinBatch, usize)>,
    perfmon: Perfmon,
}

impl GpuHashJoin {
    /// Prepares the execution of `plan` on `device`. Builds the device
    /// program, but doesn't touch any relation yet.
    pub fn new(
        plan: GpuHashJoinPlan,
        device: &Device,
        evaluator: Arc<dyn ExprEvaluator>,
    ) -> Result<Self> {
        let GpuHashJoinPlan {
            description,
            config,
            outer,
            levels,
        } = plan;

        let kernel_plan = description.kernel.plan.clone();
        let kernels = JoinKernels::build(
            device,
            &description.kernel.source,
            kernel_plan.clone(),
            evaluator.clone(),
        )?;
        let loader = MultiHashLoader::new(
            levels,
            description.estimate.hashtable_size,
            config.max_alloc_size,
            evaluator.clone(),
        )?;

        let host_types: Vec<TypeInfo> = description
            .schema
            .host_entries()
            .iter()
            .map(|e| e.ty.clone())
            .collect();
        let outer_types = outer.types();
        let pseudo_tlist = description.is_pseudo_tlist();
        let ctx = Arc::new(SessionContext {
            device: device.clone(),
            kernels,
            plan: kernel_plan,
            config: config.clone(),
            row_population_ratio: description.row_population_ratio,
        });
        let (tx, rx) = mpsc::channel();

        Ok(Self {
            description,
            config,
            ctx,
            evaluator,
            outer,
            outer_types,
            loader,
            host_types: host_types.into(),
            pseudo_tlist,
            params: ParamValues::new(),
            kparams: None,
            hash_buffer: None,
            overflow: None,
            begun: false,
            scan_done: false,
            num_running: 0,
            next_session: 0,
            tx,
            rx,
            current: None,
            perfmon: Perfmon::default(),
        })
    }

    pub fn description(&self) -> &PlanDescription {
        &self.description
    }

    /// True if batches can be handed out without projection.
    pub fn supports_bulk(&self) -> bool {
        self.config.enable_bulkload && self.pseudo_tlist
    }

    /// The number of join sessions in flight.
    pub fn num_running(&self) -> usize {
        self.num_running
    }

    pub fn perfmon(&self) -> Perfmon {
        let mut perfmon = self.perfmon;
        perfmon.time_inner_load = self.loader.time_inner_load();
        perfmon
    }

    pub fn explain(&self, options: ExplainOptions) -> String {
        let perfmon = self.perfmon();
        explain(
            &self.description,
            self.supports_bulk(),
            Some(&perfmon),
            options,
        )
    }

    /// Binds an executor parameter. Takes effect for sessions launched after
    /// the next [`rescan`](GpuHashJoin::rescan).
    pub fn set_param(&mut self, id: u32, value: Datum) {
        self.params.insert(id, value);
        self.kparams = None;
    }

    /// Returns the next result row, projected to the target list.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some((batch, position)) = &mut self.current {
                if *position < batch.nvisible() {
                    let index = batch.visible_index(*position);
                    *position += 1;
                    let row = batch.row(index)?;
                    return self.project(row).map(Some);
                }
            }
            self.current = None;

            match self.next_bulk()? {
                Some(batch) => self.current = Some((batch, 0)),
                None => return Ok(None),
            }
        }
    }

    /// Returns the result rows of the next finished session. Batches without
    /// visible rows are skipped.
    pub fn next_bulk(&mut self) -> Result<Option<JoinBatch>> {
        let batch = self.fetch();
        if batch.is_err() {
            self.abort();
        }
        batch
    }

    /// Restarts the join. `changed` names the executor parameters that
    /// changed since the last scan.
    ///
    /// The hash buffer is kept if it holds all inner rows and none of the
    /// inner relations depends on a changed parameter.
    pub fn rescan(&mut self, changed: &[u32]) -> Result<()> {
        self.drain();
        self.current = None;
        self.kparams = None;

        let deps = self.loader.param_deps();
        let reuse = match &self.hash_buffer {
            Some(buffer) => !buffer.is_divided() && !changed.iter().any(|p| deps.contains(p)),
            None => false,
        };

        if reuse {
            debug!("rescan keeps the hash buffer");
        } else {
            self.hash_buffer = None;
            if self.loader.buffers_loaded() > 0 {
                self.loader.rescan()?;
            }
            self.begun = false;
        }

        self.outer.rescan()?;
        self.overflow = None;
        self.scan_done = false;
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        if self.description.estimate.numbatches > 1 {
            self.loader.check_rewindable()?;
            self.check_outer_rewindable()?;
        }

        self.hash_buffer = self.loader.next_buffer(&self.params)?;
        self.scan_done = self.hash_buffer.is_none();
        self.begun = true;
        Ok(())
    }

    fn check_outer_rewindable(&self) -> Result<()> {
        if !self.outer.supports_rewind() {
            Err(ErrorKind::InvalidArgument(
                "outer relation cannot be rewound for a divided hash buffer".to_string(),
            ))?;
        }
        Ok(())
    }

    fn fetch(&mut self) -> Result<Option<JoinBatch>> {
        if !self.begun {
            self.begin()?;
        }

        while let Some(session) = self.next_result()? {
            let start = Instant::now();
            self.perfmon += session.perfmon();
            let batch = self.materialize(session)?;
            self.perfmon.time_materialize += start.elapsed();

            if batch.nvisible() > 0 {
                return Ok(Some(batch));
            }
        }
        Ok(None)
    }

    /// Waits for the next finished session, launching new sessions while
    /// there is room.
    fn next_result(&mut self) -> Result<Option<JoinSession>> {
        while self.num_running < self.config.max_async_chunks && !self.scan_done {
            self.launch_session()?;
            if let Ok(result) = self.rx.try_recv() {
                self.num_running -= 1;
                return result.map(Some);
            }
        }
        if self.num_running == 0 {
            return Ok(None);
        }

        match self.rx.recv_timeout(self.config.queue_timeout) {
            Ok(result) => {
                self.num_running -= 1;
                result.map(Some)
            }
            Err(RecvTimeoutError::Timeout) => {
                Err(ErrorKind::Timeout("message queue wait timeout".to_string()).into())
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(ErrorKind::InternalError("session channel disconnected".to_string()).into())
            }
        }
    }

    /// Launches a session for the next outer chunk. Moves on to the next
    /// hash buffer if the outer relation is exhausted.
    fn launch_session(&mut self) -> Result<()> {
        loop {
            let hash_buffer = match &self.hash_buffer {
                Some(buffer) => buffer.clone(),
                None => {
                    self.scan_done = true;
                    return Ok(());
                }
            };

            if let Some(chunk) = self.next_outer_chunk()? {
                if chunk.nvisible() == 0 {
                    continue;
                }
                let kparams = self.kparams()?;
                let session = JoinSession::new(
                    self.next_session,
                    self.ctx.clone(),
                    hash_buffer,
                    chunk,
                    kparams,
                );
                self.next_session += 1;
                session.submit(self.tx.clone())?;
                self.num_running += 1;
                return Ok(());
            }

            if !self.loader.is_divided() {
                self.scan_done = true;
                return Ok(());
            }

            self.hash_buffer = None;
            match self.loader.next_buffer(&self.params)? {
                None => {
                    self.scan_done = true;
                    return Ok(());
                }
                Some(buffer) => {
                    self.check_outer_rewindable()?;
                    self.outer.rescan()?;
                    self.overflow = None;
                    self.hash_buffer = Some(buffer);
                }
            }
        }
    }

    fn next_outer_chunk(&mut self) -> Result<Option<OuterChunk>> {
        let start = Instant::now();

        let chunk = if self.config.enable_bulkload && self.outer.supports_bulk() {
            self.outer
                .next_bulk(self.config.chunk_size)?
                .map(|bulk| OuterChunk::new(&bulk.store, bulk.rindex))
        } else {
            let mut store = RowStore::new(self.outer_types.clone(), self.config.chunk_size);
            if let Some(row) = self.overflow.take() {
                store.insert_row(&row)?;
            }
            while let Some(row) = self.outer.next_row()? {
                if !store.insert_row(&row)? {
                    self.overflow = Some(row);
                    break;
                }
            }
            if store.is_empty() {
                None
            } else {
                Some(OuterChunk::new(&store, None))
            }
        };

        self.perfmon.time_outer_load += start.elapsed();
        Ok(chunk)
    }

    /// The parameter buffer of the current scan.
    fn kparams(&mut self) -> Result<Arc<Vec<u8>>> {
        if let Some(kparams) = &self.kparams {
            return Ok(kparams.clone());
        }

        let values = self
            .ctx
            .plan
            .used_params
            .iter()
            .map(|expr| match expr {
                Expr::Const(value, ty) => Ok((value.clone(), ty.clone())),
                Expr::Param(id, ty) => Ok((
                    self.params.get(id).cloned().unwrap_or(Datum::Null),
                    ty.clone(),
                )),
                other => Err(ErrorKind::InternalError(format!(
                    "{:?} is neither a constant nor a parameter",
                    other
                ))
                .into()),
            })
            .collect::<Result<Vec<_>>>()?;
        let kparams = Arc::new(ParamBuffer::build(&values)?);
        self.kparams = Some(kparams.clone());
        Ok(kparams)
    }

    fn materialize(&self, session: JoinSession) -> Result<JoinBatch> {
        let id = session.id();
        let (slots, outer, hash_buffer) = session.into_result().ok_or_else(|| {
            ErrorKind::InternalError(format!("session {} finished without result", id))
        })?;
        let mut batch = JoinBatch {
            types: self.host_types.clone(),
            slots,
            outer: outer.bytes,
            hash_buffer,
            rindex: None,
        };

        let host = &self.description.resolved.host;
        if !host.is_empty() {
            let params = |id: u32| self.params.get(&id).cloned();
            let mut rindex = Vec::with_capacity(batch.nitems());
            for index in 0..batch.nitems() {
                let row = batch.row(index)?;
                let tuple = RowAccess {
                    row: &row,
                    params: &params,
                };
                if self.evaluator.qual(host, &tuple)? {
                    rindex.push(index as u32);
                }
            }
            batch.rindex = Some(rindex);
        }

        Ok(batch)
    }

    fn project(&self, row: Row) -> Result<Row> {
        if self.pseudo_tlist {
            return Ok(row);
        }

        let params = |id: u32| self.params.get(&id).cloned();
        let tuple = RowAccess {
            row: &row,
            params: &params,
        };
        self.description
            .resolved
            .tlist
            .iter()
            .map(|tle| self.evaluator.eval(&tle.expr, &tuple))
            .collect()
    }

    /// Waits for the sessions in flight. Sessions that don't finish within
    /// the queue timeout are abandoned.
    fn drain(&mut self) {
        while self.num_running > 0 {
            match self.rx.recv_timeout(self.config.queue_timeout) {
                Ok(_) => self.num_running -= 1,
                Err(_) => {
                    warn!(
                        running = self.num_running,
                        "abandoning join sessions that didn't finish in time"
                    );
                    self.num_running = 0;
                    let (tx, rx) = mpsc::channel();
                    self.tx = tx;
                    self.rx = rx;
                }
            }
        }
    }

    fn abort(&mut self) {
        self.drain();
        self.current = None;
        self.hash_buffer = None;
        self.scan_done = true;
    }
}

impl std::fmt::Debug for GpuHashJoin {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("GpuHashJoin")
            .field("description", &self.description)
            .field("num_running", &self.num_running)
            .finish()
    }
}
