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

//! A join session joins one outer chunk with a hash buffer on the device.
//!
//! ```text
//! Created -> BuffersAllocated -> Submitted -> AwaitingCompletion -> Done
//!                                                  |     ^       \-> Fatal
//!                                                  v     |
//!                                               OverflowRetry
//! ```
//!
//! The session is moved into the completion callback of its command queue.
//! On completion, it is sent back to the execution node over a channel,
//! or the error is sent instead.

use super::codegen::JoinKernelPlan;
use super::kernel::{row_map_bytes, JoinKernels, ResultBufferHeader, DATA_STORE_NO_SPACE};
use super::multi_hash::{MultiHashBuffer, ResidencyToken};
use super::perfmon::Perfmon;
use super::plan::GpuHashJoinConfig;
use crate::data_store::{RowStore, SlotStore, SlotStoreHeader};
use crate::error::{Error, ErrorKind, Result};
use device_runtime::runtime::utils::compute_workgroup_size;
use device_runtime::{CommandQueue, Device, DeviceMem, Event, KernelArg, PinnedMem};
use std::cmp;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// State shared by all sessions of an execution node.
pub struct SessionContext {
    pub device: Device,
    pub kernels: JoinKernels,
    pub plan: Arc<JoinKernelPlan>,
    pub config: GpuHashJoinConfig,
    pub row_population_ratio: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    BuffersAllocated,
    Submitted,
    AwaitingCompletion,
    OverflowRetry,
    Done,
    Fatal,
}

/// A sealed outer chunk and its visible rows.
#[derive(Clone, Debug)]
pub struct OuterChunk {
    pub bytes: Arc<Vec<u8>>,
    pub nitems: usize,
    /// The visible rows. `None` if all rows are visible.
    pub rindex: Option<Vec<u32>>,
}

impl OuterChunk {
    pub fn new(store: &RowStore, rindex: Option<Vec<u32>>) -> Self {
        Self {
            bytes: Arc::new(store.seal()),
            nitems: store.nitems(),
            rindex,
        }
    }

    pub fn nvisible(&self) -> usize {
        self.rindex.as_ref().map_or(self.nitems, |r| r.len())
    }
}

/// The number of destination slots for `nvisible` outer rows.
pub fn destination_rooms(nvisible: usize, ratio: f64, margin: f64) -> usize {
    cmp::max(1, (nvisible as f64 * ratio * margin).ceil() as usize)
}

/// Checks the destination status of a finished projection.
///
/// Returns the exact number of destination slots to retry with if the
/// destination overflowed for the first time. A second overflow is fatal.
fn projection_retry(id: u64, dest: &SlotStoreHeader, retried: bool) -> Result<Option<usize>> {
    match dest.errcode {
        0 => Ok(None),
        DATA_STORE_NO_SPACE if !retried => Ok(Some(dest.nitems as usize)),
        DATA_STORE_NO_SPACE => Err(ErrorKind::KernelExecution(format!(
            "session {}: {} result rows don't fit into {} slots after retry",
            id, dest.nitems, dest.nrooms
        ))
        .into()),
        errcode => Err(ErrorKind::KernelExecution(format!(
            "session {}: projection reported error code {}",
            id, errcode
        ))
        .into()),
    }
}

struct SessionBuffers {
    kparams: DeviceMem,
    kds: DeviceMem,
    krowmap: DeviceMem,
    kresults: DeviceMem,
    kdest: DeviceMem,
}

#[derive(Default)]
struct SessionEvents {
    sent: Option<Event>,
    main: Option<Event>,
    projection: Option<Event>,
    received: Option<Event>,
}

pub struct JoinSession {
    id: u64,
    state: SessionState,
    ctx: Arc<SessionContext>,
    hash_buffer: Arc<MultiHashBuffer>,
    residency: Option<ResidencyToken>,
    outer: OuterChunk,
    kparams: Arc<Vec<u8>>,
    nrooms: usize,
    buffers: Option<SessionBuffers>,
    status: PinnedMem,
    dest: PinnedMem,
    result: Option<SlotStore>,
    retried: bool,
    submitted_at: Option<Instant>,
    retried_at: Option<Instant>,
    events: SessionEvents,
    perfmon: Perfmon,
}

fn elapsed(from: Option<Instant>, to: Option<&Event>) -> std::time::Duration {
    match (from, to.and_then(|e| e.finished_at())) {
        (Some(from), Some(to)) => to.saturating_duration_since(from),
        _ => std::time::Duration::default(),
    }
}

impl JoinSession {
    pub fn new(
        id: u64,
        ctx: Arc<SessionContext>,
        hash_buffer: Arc<MultiHashBuffer>,
        outer: OuterChunk,
        kparams: Arc<Vec<u8>>,
    ) -> Self {
        let nrooms = destination_rooms(
            outer.nvisible(),
            ctx.row_population_ratio,
            ctx.config.row_population_margin,
        );

        Self {
            id,
            state: SessionState::Created,
            ctx,
            hash_buffer,
            residency: None,
            outer,
            kparams,
            nrooms,
            buffers: None,
            status: PinnedMem::new(ResultBufferHeader::length_for(0, 0)),
            dest: PinnedMem::new(0),
            result: None,
            retried: false,
            submitted_at: None,
            retried_at: None,
            events: SessionEvents::default(),
            perfmon: Perfmon::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The number of destination slots.
    pub fn nrooms(&self) -> usize {
        self.nrooms
    }

    pub fn retried(&self) -> bool {
        self.retried
    }

    pub fn outer(&self) -> &OuterChunk {
        &self.outer
    }

    pub fn hash_buffer(&self) -> &Arc<MultiHashBuffer> {
        &self.hash_buffer
    }

    pub fn perfmon(&self) -> Perfmon {
        self.perfmon
    }

    /// The destination store of a finished session.
    pub fn result(&self) -> Option<&SlotStore> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Option<(SlotStore, OuterChunk, Arc<MultiHashBuffer>)> {
        let JoinSession {
            result,
            outer,
            hash_buffer,
            ..
        } = self;
        result.map(|r| (r, outer, hash_buffer))
    }

    fn allocate(&mut self) -> Result<()> {
        let device = &self.ctx.device;
        let nrels = self.ctx.plan.nrels();
        let nhost = self.ctx.plan.nhost;

        self.residency = Some(self.hash_buffer.acquire_device(device)?);
        self.buffers = Some(SessionBuffers {
            kparams: device.alloc(self.kparams.len())?,
            kds: device.alloc(self.outer.bytes.len())?,
            krowmap: device.alloc(8 + 4 * self.outer.rindex.as_ref().map_or(0, |r| r.len()))?,
            kresults: device.alloc(ResultBufferHeader::length_for(nrels, self.nrooms))?,
            kdest: device.alloc(SlotStore::length_for(nhost, self.nrooms))?,
        });
        self.dest.resize(SlotStore::length_for(nhost, self.nrooms));
        self.state = SessionState::BuffersAllocated;
        Ok(())
    }

    /// Releases the device buffers and the share of the resident hash buffer.
    fn release(&mut self) {
        self.buffers = None;
        self.residency = None;
    }

    fn buffers(&self) -> Result<&SessionBuffers> {
        self.buffers.as_ref().ok_or_else(|| {
            ErrorKind::InternalError(format!("session {} has no device buffers", self.id)).into()
        })
    }

    fn enqueue_projection(&mut self, queue: &mut CommandQueue) -> Result<()> {
        let ctx = self.ctx.clone();
        let buffers = self.buffers()?;
        let residency = self.residency.as_ref().ok_or_else(|| {
            ErrorKind::InternalError(format!("session {} holds no hash buffer", self.id))
        })?;

        let dim = compute_workgroup_size(ctx.device.properties(), self.nrooms, false, 0);
        let projection = queue.enqueue_launch(
            &ctx.kernels.projection,
            dim,
            vec![
                KernelArg::Mem(residency.mem().clone()),
                KernelArg::Mem(buffers.kds.clone()),
                KernelArg::Mem(buffers.kresults.clone()),
                KernelArg::Mem(buffers.kdest.clone()),
            ],
        )?;
        queue.enqueue_read(
            &buffers.kresults,
            0,
            ResultBufferHeader::length_for(0, 0),
            &self.status,
        )?;
        let dest_len = SlotStore::length_for(ctx.plan.nhost, self.nrooms);
        let received = queue.enqueue_read(&buffers.kdest, 0, dest_len, &self.dest)?;

        self.events.projection = Some(projection);
        self.events.received = Some(received);
        self.perfmon.num_kern_proj += 1;
        self.perfmon.num_dma_recv += 2;
        self.perfmon.bytes_dma_recv += (ResultBufferHeader::length_for(0, 0) + dest_len) as u64;
        Ok(())
    }

    /// Submits the session. The outcome is sent on `tx` once the device
    /// finished.
    pub fn submit(mut self, tx: Sender<Result<JoinSession>>) -> Result<()> {
        if self.state == SessionState::Created {
            self.allocate()?;
        }

        let ctx = self.ctx.clone();
        let mut queue = ctx.device.queue();
        let residency = self.residency.as_ref().ok_or_else(|| {
            ErrorKind::InternalError(format!("session {} holds no hash buffer", self.id))
        })?;
        let buffers = self.buffers()?;
        let nrels = ctx.plan.nrels();

        queue.enqueue_wait(residency.ready());
        let kresults_header = Arc::new(ResultBufferHeader::new(nrels, self.nrooms).to_bytes()?);
        let row_map = Arc::new(row_map_bytes(self.outer.rindex.as_deref()));
        let dest_init = Arc::new(SlotStore::init_bytes(ctx.plan.nhost, self.nrooms));
        let sent_bytes = self.kparams.len()
            + self.outer.bytes.len()
            + row_map.len()
            + kresults_header.len()
            + dest_init.len();

        queue.enqueue_write(&buffers.kparams, 0, self.kparams.clone())?;
        queue.enqueue_write(&buffers.kds, 0, self.outer.bytes.clone())?;
        queue.enqueue_write(&buffers.krowmap, 0, row_map)?;
        queue.enqueue_write(&buffers.kresults, 0, kresults_header)?;
        let sent = queue.enqueue_write(&buffers.kdest, 0, dest_init)?;

        let dim = compute_workgroup_size(ctx.device.properties(), self.outer.nvisible(), false, 0);
        let main = queue.enqueue_launch(
            &ctx.kernels.main,
            dim,
            vec![
                KernelArg::Mem(buffers.kparams.clone()),
                KernelArg::Mem(residency.mem().clone()),
                KernelArg::Mem(buffers.kds.clone()),
                KernelArg::Mem(buffers.krowmap.clone()),
                KernelArg::Mem(buffers.kresults.clone()),
            ],
        )?;

        self.events.sent = Some(sent);
        self.events.main = Some(main);
        self.perfmon.num_sessions += 1;
        self.perfmon.num_kern_exec += 1;
        self.perfmon.num_dma_send += 5;
        self.perfmon.bytes_dma_send += sent_bytes as u64;
        self.enqueue_projection(&mut queue)?;
        self.state = SessionState::Submitted;

        debug!(
            session = self.id,
            nitems = self.outer.nitems,
            nvisible = self.outer.nvisible(),
            nrooms = self.nrooms,
            "submitting join session"
        );
        self.submitted_at = Some(Instant::now());
        self.state = SessionState::AwaitingCompletion;
        queue.submit(move |result| self.complete(result, tx));
        Ok(())
    }

    /// Prepares a projection into a destination of exactly `nitems` slots.
    fn prepare_retry(&mut self, nitems: usize) -> Result<CommandQueue> {
        let nhost = self.ctx.plan.nhost;
        let dest_len = SlotStore::length_for(nhost, nitems);
        let kdest = self.buffers()?.kdest.clone();
        kdest.resize(dest_len)?;
        self.nrooms = nitems;
        self.dest.resize(dest_len);

        let mut queue = self.ctx.device.queue();
        let dest_init = Arc::new(SlotStore::init_bytes(nhost, nitems));
        self.perfmon.num_dma_send += 1;
        self.perfmon.bytes_dma_send += dest_init.len() as u64;
        queue.enqueue_write(&kdest, 0, dest_init)?;
        self.enqueue_projection(&mut queue)?;
        self.perfmon.num_retries += 1;
        Ok(queue)
    }

    fn fail(mut self, error: Error, tx: &Sender<Result<JoinSession>>) {
        self.state = SessionState::Fatal;
        self.release();
        debug!(session = self.id, error = %error, "join session failed");
        drop(self);
        // The node may be gone already, e.g., after a timeout.
        let _ = tx.send(Err(error));
    }

    fn complete(mut self, result: device_runtime::error::Result<()>, tx: Sender<Result<JoinSession>>) {
        if let Err(e) = result {
            let error = ErrorKind::KernelExecution(format!("session {}: {}", self.id, e)).into();
            return self.fail(error, &tx);
        }

        let status = ResultBufferHeader::read(&self.status.lock());
        let dest = SlotStoreHeader::read(&self.dest.lock());
        let (status, dest) = match (status, dest) {
            (Ok(status), Ok(dest)) => (status, dest),
            (Err(e), _) | (_, Err(e)) => return self.fail(e, &tx),
        };

        if status.errcode != 0 {
            let error = ErrorKind::KernelExecution(format!(
                "session {}: device reported error code {}",
                self.id, status.errcode
            ))
            .into();
            return self.fail(error, &tx);
        }

        match projection_retry(self.id, &dest, self.retried) {
            Ok(None) => {}
            Ok(Some(nitems)) => {
                warn!(
                    session = self.id,
                    nrooms = dest.nrooms,
                    nitems,
                    "destination buffer too small, retrying projection"
                );
                self.retried = true;
                self.state = SessionState::OverflowRetry;
                self.retried_at = Some(Instant::now());
                return match self.prepare_retry(nitems) {
                    Ok(queue) => {
                        self.state = SessionState::AwaitingCompletion;
                        queue.submit(move |result| self.complete(result, tx));
                    }
                    Err(e) => self.fail(e, &tx),
                };
            }
            Err(e) => return self.fail(e, &tx),
        }

        match SlotStore::from_bytes(self.dest.to_vec()) {
            Ok(store) => self.result = Some(store),
            Err(e) => return self.fail(e, &tx),
        }

        self.perfmon.time_dma_send += elapsed(self.submitted_at, self.events.sent.as_ref());
        self.perfmon.time_kern_exec += elapsed(
            self.events.sent.as_ref().and_then(|e| e.finished_at()),
            self.events.main.as_ref(),
        );
        let projection_start = if self.retried {
            self.retried_at
        } else {
            self.events.main.as_ref().and_then(|e| e.finished_at())
        };
        self.perfmon.time_kern_proj += elapsed(projection_start, self.events.projection.as_ref());
        self.perfmon.time_dma_recv += elapsed(
            self.events
                .projection
                .as_ref()
                .and_then(|e| e.finished_at()),
            self.events.received.as_ref(),
        );

        self.release();
        self.state = SessionState::Done;
        debug!(
            session = self.id,
            nitems = dest.nitems,
            retried = self.retried,
            "join session done"
        );
        let _ = tx.send(Ok(self));
    }
}
