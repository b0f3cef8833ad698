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

//! Device and pinned host memory.
//!
//! `DeviceMem` lives in the address space of the device. The host may only
//! access it through DMA commands on a [`CommandQueue`](super::queue::CommandQueue),
//! or from inside a kernel. `PinnedMem` is page-locked host memory that
//! serves as the target of device-to-host transfers.

use crate::error::{ErrorKind, Result};
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, MutexGuard, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_MEM_ID: AtomicU64 = AtomicU64::new(1);

/// Byte accounting of a device's memory capacity.
#[derive(Debug)]
pub(crate) struct MemAccount {
    used: AtomicUsize,
    capacity: usize,
}

impl MemAccount {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            capacity,
        }
    }

    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn reserve(&self, bytes: usize) -> Result<()> {
        let capacity = self.capacity;
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(bytes).filter(|&total| total <= capacity)
            })
            .map(|_| ())
            .map_err(|used| {
                ErrorKind::OutOfMemory(format!(
                    "requested {} bytes with {} of {} bytes in use",
                    bytes, used, capacity
                ))
                .into()
            })
    }

    pub(crate) fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// A buffer in device memory.
///
/// Cloning a `DeviceMem` clones the handle, not the allocation. The memory is
/// returned to the device when the last handle is dropped.
#[derive(Clone)]
pub struct DeviceMem {
    inner: Arc<DeviceMemInner>,
}

struct DeviceMemInner {
    id: u64,
    data: RwLock<Vec<u8>>,
    account: Arc<MemAccount>,
}

impl DeviceMem {
    pub(crate) fn new(account: Arc<MemAccount>, len: usize) -> Result<Self> {
        account.reserve(len)?;

        Ok(Self {
            inner: Arc::new(DeviceMemInner {
                id: NEXT_MEM_ID.fetch_add(1, Ordering::Relaxed),
                data: RwLock::new(vec![0; len]),
                account,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if both handles refer to the same allocation.
    pub fn same_allocation(&self, other: &DeviceMem) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Maps the buffer for reading. Only valid on the device side, i.e.,
    /// inside of kernels and command processors.
    pub fn read(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.inner.data.read(), |v| v.as_slice())
    }

    /// Maps the buffer for writing. Only valid on the device side.
    pub fn write(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        RwLockWriteGuard::map(self.inner.data.write(), |v| v.as_mut_slice())
    }

    /// Resizes the buffer in place, preserving its prefix.
    ///
    /// Growing the buffer is accounted against the device capacity and fails
    /// with `OutOfMemory` if the capacity is exceeded.
    pub fn resize(&self, new_len: usize) -> Result<()> {
        let mut data = self.inner.data.write();
        let old_len = data.len();

        if new_len > old_len {
            self.inner.account.reserve(new_len - old_len)?;
        } else {
            self.inner.account.release(old_len - new_len);
        }
        data.resize(new_len, 0);

        Ok(())
    }
}

impl Drop for DeviceMemInner {
    fn drop(&mut self) {
        self.account.release(self.data.get_mut().len());
    }
}

impl std::fmt::Debug for DeviceMem {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DeviceMem")
            .field("id", &self.inner.id)
            .field("len", &self.len())
            .finish()
    }
}

/// Page-locked host memory used as DMA target.
#[derive(Clone, Debug, Default)]
pub struct PinnedMem {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl PinnedMem {
    pub fn new(len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(vec![0; len])),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resize(&self, new_len: usize) {
        self.inner.lock().resize(new_len, 0);
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.inner.lock()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounting_follows_resize_and_drop() {
        let account = Arc::new(MemAccount::new(1024));
        let mem = DeviceMem::new(account.clone(), 256).unwrap();
        assert_eq!(account.used(), 256);

        mem.resize(512).unwrap();
        assert_eq!(account.used(), 512);
        mem.resize(128).unwrap();
        assert_eq!(account.used(), 128);

        let clone = mem.clone();
        drop(mem);
        assert_eq!(account.used(), 128);
        drop(clone);
        assert_eq!(account.used(), 0);
    }

    #[test]
    fn reserve_beyond_capacity_fails() {
        let account = Arc::new(MemAccount::new(100));
        let _mem = DeviceMem::new(account.clone(), 60).unwrap();

        match DeviceMem::new(account.clone(), 60) {
            Err(e) => match e.kind() {
                ErrorKind::OutOfMemory(_) => {}
                other => panic!("unexpected error kind {:?}", other),
            },
            Ok(_) => panic!("allocation beyond capacity succeeded"),
        }
        assert_eq!(account.used(), 60);
    }

    #[test]
    fn resize_preserves_prefix() {
        let account = Arc::new(MemAccount::new(1024));
        let mem = DeviceMem::new(account, 4).unwrap();
        mem.write().copy_from_slice(&[1, 2, 3, 4]);
        mem.resize(8).unwrap();
        assert_eq!(&*mem.read(), &[1, 2, 3, 4, 0, 0, 0, 0]);
    }
}
