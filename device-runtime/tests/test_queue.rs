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

use device_runtime::error::{ErrorKind, Result as RtResult};
use device_runtime::{
    Device, EventStatus, Kernel, KernelArg, LaunchContext, LaunchDim, PinnedMem, ProgramBuilder,
};
use std::error::Error;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn write_then_read_round_trips_bytes() -> Result<(), Box<dyn Error>> {
    let device = Device::builder().build()?;
    let mem = device.alloc(16)?;
    let host = PinnedMem::new(8);

    let mut queue = device.queue();
    queue.enqueue_write(&mem, 4, Arc::new(vec![1_u8, 2, 3, 4, 5, 6, 7, 8]))?;
    let read = queue.enqueue_read(&mem, 2, 8, &host)?;
    queue.submit(|_| {});
    read.wait()?;

    assert_eq!(host.to_vec(), vec![0, 0, 1, 2, 3, 4, 5, 6]);

    let stats = device.stats();
    assert_eq!(stats.num_dma_send, 1);
    assert_eq!(stats.bytes_dma_send, 8);
    assert_eq!(stats.num_dma_recv, 1);
    assert_eq!(stats.bytes_dma_recv, 8);

    Ok(())
}

#[test]
fn out_of_bounds_write_is_rejected_at_enqueue() -> Result<(), Box<dyn Error>> {
    let device = Device::builder().build()?;
    let mem = device.alloc(4)?;

    let mut queue = device.queue();
    let result = queue.enqueue_write(&mem, 2, Arc::new(vec![0_u8; 4]));
    assert!(result.is_err());
    assert!(queue.is_empty());

    Ok(())
}

#[test]
fn allocation_beyond_capacity_fails() -> Result<(), Box<dyn Error>> {
    let device = Device::builder().mem_capacity(1024).build()?;
    let _a = device.alloc(1000)?;

    match device.alloc(100) {
        Err(e) => match e.kind() {
            ErrorKind::OutOfMemory(_) => {}
            other => panic!("unexpected error kind: {:?}", other),
        },
        Ok(_) => panic!("allocation beyond capacity succeeded"),
    }
    assert_eq!(device.mem_used(), 1000);

    Ok(())
}

struct Failing;

impl Kernel for Failing {
    fn launch(&self, _ctx: &LaunchContext<'_>, _args: &[KernelArg]) -> RtResult<()> {
        Err(ErrorKind::RuntimeError("division by zero".to_string()).into())
    }
}

#[test]
fn failed_command_fails_remaining_events() -> Result<(), Box<dyn Error>> {
    let device = Device::builder().build()?;
    let program = ProgramBuilder::new("__kernel void failing() {}")
        .kernel("failing", Arc::new(Failing))
        .build(&device)?;
    let mem = device.alloc(4)?;
    let host = PinnedMem::new(4);

    let mut queue = device.queue();
    let launch = queue.enqueue_launch(&program.kernel("failing")?, LaunchDim::new(32, 32), vec![])?;
    let read = queue.enqueue_read(&mem, 0, 4, &host)?;

    let (tx, rx) = mpsc::channel();
    queue.submit(move |result| {
        tx.send(result.map_err(|e| e.to_string())).unwrap();
    });

    let message = match rx.recv()? {
        Err(message) => message,
        Ok(()) => panic!("submission with failing kernel succeeded"),
    };
    assert!(message.contains("failing"));
    assert!(launch.wait().is_err());
    match read.status() {
        EventStatus::Failed(_) => {}
        other => panic!("unexpected status of trailing event: {:?}", other),
    }

    Ok(())
}

#[test]
fn wait_orders_submissions_across_queues() -> Result<(), Box<dyn Error>> {
    let device = Device::builder().queues(4).build()?;
    let mem = device.alloc(1024)?;

    let mut upload = device.queue();
    let uploaded = upload.enqueue_write(&mem, 0, Arc::new(vec![7_u8; 1024]))?;
    upload.submit(|_| {});

    let (tx, rx) = mpsc::channel();
    for _ in 0..8 {
        let host = PinnedMem::new(1024);
        let mut queue = device.queue();
        queue.enqueue_wait(&uploaded);
        queue.enqueue_read(&mem, 0, 1024, &host)?;
        let tx = tx.clone();
        queue.submit(move |result| {
            let ok = result.is_ok() && host.to_vec().iter().all(|&b| b == 7);
            tx.send(ok).unwrap();
        });
    }
    drop(tx);

    let results: Vec<bool> = rx.iter().collect();
    assert_eq!(results.len(), 8);
    assert!(results.into_iter().all(|ok| ok));
    assert_eq!(device.stats().num_dma_send, 1);

    Ok(())
}

#[test]
fn dropped_queue_fails_its_events() -> Result<(), Box<dyn Error>> {
    let device = Device::builder().build()?;
    let mem = device.alloc(4)?;

    let mut queue = device.queue();
    let event = queue.enqueue_write(&mem, 0, Arc::new(vec![1_u8; 4]))?;
    drop(queue);

    assert!(event.wait_timeout(Duration::from_secs(1)).is_err());
    match event.status() {
        EventStatus::Failed(message) => assert!(message.contains("dropped")),
        other => panic!("unexpected status: {:?}", other),
    }
    Ok(())
}
