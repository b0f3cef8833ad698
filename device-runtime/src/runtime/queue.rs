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

//! Asynchronous command submission.
//!
//! Commands are recorded into a [`CommandQueue`] and handed to the device as
//! one submission. A submission executes in order on one of the device's
//! command processors. Submissions on different processors run concurrently,
//! so the only ordering between two submissions is expressed with
//! [`CommandQueue::enqueue_wait`].
//!
//! A failed command fails its own event and all events that follow it in the
//! same submission. The submission's completion callback then receives the
//! error.

use super::device::{Device, DeviceProperties, DeviceStats};
use super::dispatcher::LaunchContext;
use super::event::Event;
use super::memory::{DeviceMem, PinnedMem};
use super::program::{KernelArg, KernelHandle, LaunchDim};
use crate::error::{ErrorKind, Result};
use rayon::ThreadPool;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Instant;

type Callback = Box<dyn FnOnce(Result<()>) + Send>;
type HostBytes = Arc<dyn AsRef<[u8]> + Send + Sync>;

pub(crate) enum Command {
    Write {
        dst: DeviceMem,
        offset: usize,
        src: HostBytes,
        event: Event,
    },
    Read {
        src: DeviceMem,
        offset: usize,
        len: usize,
        dst: PinnedMem,
        event: Event,
    },
    Wait {
        on: Event,
        event: Event,
    },
    Launch {
        kernel: KernelHandle,
        dim: LaunchDim,
        args: Vec<KernelArg>,
        event: Event,
    },
}

impl Command {
    fn event(&self) -> &Event {
        match self {
            Command::Write { event, .. }
            | Command::Read { event, .. }
            | Command::Wait { event, .. }
            | Command::Launch { event, .. } => event,
        }
    }
}

pub(crate) struct Submission {
    commands: Vec<Command>,
    callback: Callback,
}

impl Submission {
    /// Fails all events and reports the failure to the callback without
    /// executing any command.
    pub(crate) fn abort(self, msg: &str) {
        for command in &self.commands {
            command.event().fail(msg);
        }
        (self.callback)(Err(ErrorKind::RuntimeError(msg.to_string()).into()));
    }
}

/// A batch of device commands.
///
/// Each `enqueue_*` method records one command and returns the event that
/// the command signals on completion. Nothing executes before
/// [`submit`](CommandQueue::submit) is called.
pub struct CommandQueue {
    device: Device,
    commands: Vec<Command>,
}

impl CommandQueue {
    pub(crate) fn new(device: Device) -> Self {
        Self {
            device,
            commands: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Copies `src` from host memory into `dst` starting at `offset`.
    pub fn enqueue_write<S>(&mut self, dst: &DeviceMem, offset: usize, src: Arc<S>) -> Result<Event>
    where
        S: AsRef<[u8]> + Send + Sync + 'static,
    {
        let len = (*src).as_ref().len();
        let end = offset
            .checked_add(len)
            .ok_or_else(|| ErrorKind::IntegerOverflow("DMA write range".to_string()))?;
        if end > dst.len() {
            Err(ErrorKind::InvalidArgument(format!(
                "DMA write of {} bytes at offset {} exceeds buffer of {} bytes",
                len,
                offset,
                dst.len()
            )))?;
        }

        let event = Event::new();
        self.commands.push(Command::Write {
            dst: dst.clone(),
            offset,
            src,
            event: event.clone(),
        });
        Ok(event)
    }

    /// Copies `len` bytes at `offset` of `src` into the prefix of `dst`.
    ///
    /// The source range is checked at execution time, because a preceding
    /// kernel may resize the buffer.
    pub fn enqueue_read(
        &mut self,
        src: &DeviceMem,
        offset: usize,
        len: usize,
        dst: &PinnedMem,
    ) -> Result<Event> {
        if len > dst.len() {
            Err(ErrorKind::InvalidArgument(format!(
                "DMA read of {} bytes exceeds pinned buffer of {} bytes",
                len,
                dst.len()
            )))?;
        }

        let event = Event::new();
        self.commands.push(Command::Read {
            src: src.clone(),
            offset,
            len,
            dst: dst.clone(),
            event: event.clone(),
        });
        Ok(event)
    }

    /// Blocks the remainder of this batch until `on` completes.
    ///
    /// `on` must belong to a batch submitted before this one. Otherwise the
    /// command processor waits forever.
    pub fn enqueue_wait(&mut self, on: &Event) -> Event {
        let event = Event::new();
        self.commands.push(Command::Wait {
            on: on.clone(),
            event: event.clone(),
        });
        event
    }

    pub fn enqueue_launch(
        &mut self,
        kernel: &KernelHandle,
        dim: LaunchDim,
        args: Vec<KernelArg>,
    ) -> Result<Event> {
        let max_wgs = self.device.properties().max_work_group_size;
        if dim.local == 0 || dim.local > max_wgs {
            Err(ErrorKind::InvalidArgument(format!(
                "Work group size {} out of range 1..={}",
                dim.local, max_wgs
            )))?;
        }
        if dim.global % dim.local != 0 {
            Err(ErrorKind::InvalidArgument(format!(
                "Global size {} is not a multiple of work group size {}",
                dim.global, dim.local
            )))?;
        }

        let event = Event::new();
        self.commands.push(Command::Launch {
            kernel: kernel.clone(),
            dim,
            args,
            event: event.clone(),
        });
        Ok(event)
    }

    /// Hands the batch to the device. `callback` runs on a command processor
    /// thread after the last command finished or the first command failed.
    pub fn submit<F>(mut self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let submission = Submission {
            commands: std::mem::take(&mut self.commands),
            callback: Box::new(callback),
        };
        self.device.dispatch(submission);
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        for command in &self.commands {
            command.event().fail("command queue dropped before submission");
        }
    }
}

/// Executes submissions on behalf of one device queue.
pub(crate) struct CommandProcessor {
    pool: Arc<ThreadPool>,
    stats: Arc<DeviceStats>,
    props: DeviceProperties,
}

impl CommandProcessor {
    pub(crate) fn new(pool: Arc<ThreadPool>, stats: Arc<DeviceStats>, props: DeviceProperties) -> Self {
        Self { pool, stats, props }
    }

    pub(crate) fn run(self, rx: Receiver<Submission>) {
        for Submission { commands, callback } in rx.iter() {
            let result = self.execute(commands);
            callback(result);
        }
    }

    fn execute(&self, commands: Vec<Command>) -> Result<()> {
        let mut commands = commands.into_iter();

        while let Some(command) = commands.next() {
            let event = command.event().clone();
            match self.execute_one(command) {
                Ok(()) => event.complete(),
                Err(error) => {
                    event.fail(error.to_string());
                    for rest in commands {
                        rest.event().fail("aborted after a preceding command failed");
                    }
                    return Err(error);
                }
            }
        }

        Ok(())
    }

    fn execute_one(&self, command: Command) -> Result<()> {
        match command {
            Command::Write {
                dst, offset, src, ..
            } => {
                let bytes = (*src).as_ref();
                let mut mem = dst.write();
                let target = mem.get_mut(offset..offset.saturating_add(bytes.len())).ok_or_else(|| {
                    ErrorKind::RuntimeError(format!(
                        "DMA write out of bounds of device buffer {}",
                        dst.id()
                    ))
                })?;
                target.copy_from_slice(bytes);
                self.stats.record_send(bytes.len());
            }
            Command::Read {
                src,
                offset,
                len,
                dst,
                ..
            } => {
                let mem = src.read();
                let source = mem.get(offset..offset.saturating_add(len)).ok_or_else(|| {
                    ErrorKind::RuntimeError(format!(
                        "DMA read of {} bytes at offset {} out of bounds of device buffer {}",
                        len,
                        offset,
                        src.id()
                    ))
                })?;
                let mut host = dst.lock();
                if host.len() < len {
                    host.resize(len, 0);
                }
                host[..len].copy_from_slice(source);
                self.stats.record_recv(len);
            }
            Command::Wait { on, .. } => {
                on.wait()?;
            }
            Command::Launch {
                kernel, dim, args, ..
            } => {
                let ctx = LaunchContext::new(&self.pool, dim, &self.props);
                let start = Instant::now();
                kernel.launch(&ctx, &args).map_err(|e| {
                    ErrorKind::LaunchFailure(format!("{}: {}", kernel.name(), e))
                })?;
                self.stats
                    .record_launch(start.elapsed().as_nanos() as u64);
            }
        }

        Ok(())
    }
}
