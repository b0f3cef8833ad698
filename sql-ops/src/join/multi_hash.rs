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

//! The multi-level hash buffer.
//!
//! The buffer holds one hash table per inner relation back to back in a
//! single byte array. All references within the buffer are offsets, so the
//! buffer can be reallocated, and copied to the device and walked there
//! without any fix-ups.
//!
//! ```text
//! buffer:  length: u64 | usage: u64 | ntables: u32 | is_divided: u32 | htable_offset[ntables + 1]: u64 | tables
//! table:   length: u64 | usage: u64 | ncols: u32 | nitems: u32 | nslots: u32 | pad: u32 | colmeta[ncols] | slots[nslots]: u64 | entries
//! entry:   next: u64 | hash: u32 | rowid: u32 | t_len: u32 | pad: u32 | row
//! ```
//!
//! `htable_offset[0]` is unused, because depth 0 is the outer relation.
//! Table offsets are relative to the buffer start. Slot heads and chain links
//! are [`BufferOffset`]s relative to the table start. Tables are appended
//! from the deepest depth to depth 1.

use crate::data_store::{align8, read_u32, read_u64, write_u32, write_u64, ColumnMeta};
use crate::error::{ErrorKind, Result};
use device_runtime::{Device, DeviceMem, Event, EventStatus};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const MH_LENGTH: usize = 0;
const MH_USAGE: usize = 8;
const MH_NTABLES: usize = 16;
const MH_DIVIDED: usize = 20;
const MH_OFFSETS: usize = 24;

const HT_LENGTH: usize = 0;
const HT_USAGE: usize = 8;
const HT_NCOLS: usize = 16;
const HT_NITEMS: usize = 20;
const HT_NSLOTS: usize = 24;
const HT_COLMETA: usize = 32;

const E_NEXT: usize = 0;
const E_HASH: usize = 8;
const E_ROWID: usize = 12;
const E_TLEN: usize = 16;
pub const ENTRY_HEADER_LEN: usize = 24;

pub fn multihash_header_len(ntables: usize) -> usize {
    align8(MH_OFFSETS + 8 * (ntables + 1))
}

/// Length of a table header including its column metadata.
pub fn table_header_len(ncols: usize) -> usize {
    align8(HT_COLMETA + ColumnMeta::SIZE * ncols)
}

pub fn entry_len(row_len: usize) -> usize {
    ENTRY_HEADER_LEN + align8(row_len)
}

/// An offset relative to the start of a hash table. Zero is the null offset,
/// because the table header occupies the first bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BufferOffset(pub u64);

impl BufferOffset {
    pub const NONE: BufferOffset = BufferOffset(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

struct TableCursor {
    depth: usize,
    start: usize,
    nslots: usize,
    nitems: u32,
}

/// Builds a multi-level hash buffer.
///
/// The writer tracks the buffer capacity separately from the used bytes.
/// Growing the capacity reallocates the buffer and copies the used bytes.
pub struct MultiHashWriter {
    bytes: Vec<u8>,
    capacity: usize,
    ntables: usize,
    divided: bool,
    table: Option<TableCursor>,
}

impl MultiHashWriter {
    pub fn new(capacity: usize, ntables: usize) -> Self {
        let header = multihash_header_len(ntables);
        let mut bytes = Vec::with_capacity(std::cmp::max(capacity, header));
        bytes.resize(header, 0);
        bytes[MH_NTABLES..MH_NTABLES + 4].copy_from_slice(&(ntables as u32).to_le_bytes());

        Self {
            bytes,
            capacity,
            ntables,
            divided: false,
            table: None,
        }
    }

    pub fn ntables(&self) -> usize {
        self.ntables
    }

    pub fn usage(&self) -> usize {
        self.bytes.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reallocates the buffer with a larger capacity.
    pub fn expand(&mut self, new_capacity: usize) {
        if new_capacity > self.capacity {
            let mut bytes = Vec::with_capacity(new_capacity);
            bytes.extend_from_slice(&self.bytes);
            debug!(
                old = self.capacity,
                new = new_capacity,
                "expanded multi-level hash buffer"
            );
            self.bytes = bytes;
            self.capacity = new_capacity;
        }
    }

    pub fn set_divided(&mut self, divided: bool) {
        self.divided |= divided;
    }

    fn set_table_offset(&mut self, depth: usize, offset: usize) -> Result<()> {
        if depth == 0 || depth > self.ntables {
            Err(ErrorKind::InternalError(format!(
                "depth {} out of range 1..={}",
                depth, self.ntables
            )))?;
        }
        if read_u64(&self.bytes, MH_OFFSETS + 8 * depth)? != 0 {
            Err(ErrorKind::InternalError(format!(
                "hash table of depth {} already exists",
                depth
            )))?;
        }
        write_u64(&mut self.bytes, MH_OFFSETS + 8 * depth, offset as u64)
    }

    /// Starts the hash table of `depth` at the current end of the buffer.
    pub fn begin_table(&mut self, depth: usize, colmeta: &[ColumnMeta], nslots: usize) -> Result<()> {
        if self.table.is_some() {
            Err(ErrorKind::InternalError(
                "previous hash table was not finished".to_string(),
            ))?;
        }
        if nslots == 0 {
            Err(ErrorKind::InvalidArgument("hash table without slots".to_string()))?;
        }

        let start = self.bytes.len();
        self.set_table_offset(depth, start)?;

        let header = table_header_len(colmeta.len());
        self.bytes.resize(start + header + 8 * nslots, 0);
        let table = &mut self.bytes[start..];
        table[HT_NCOLS..HT_NCOLS + 4].copy_from_slice(&(colmeta.len() as u32).to_le_bytes());
        table[HT_NSLOTS..HT_NSLOTS + 4].copy_from_slice(&(nslots as u32).to_le_bytes());
        for (index, meta) in colmeta.iter().enumerate() {
            let offset = HT_COLMETA + ColumnMeta::SIZE * index;
            meta.write(&mut table[offset..offset + ColumnMeta::SIZE]);
        }

        self.table = Some(TableCursor {
            depth,
            start,
            nslots,
            nitems: 0,
        });
        Ok(())
    }

    /// The number of rows in the table being built.
    pub fn table_nitems(&self) -> usize {
        self.table.as_ref().map_or(0, |t| t.nitems as usize)
    }

    /// Appends an entry and links it at the head of its bucket.
    pub fn insert(&mut self, hash: u32, row: &[u8]) -> Result<()> {
        let (start, nslots, rowid) = match self.table {
            Some(ref t) => (t.start, t.nslots, t.nitems),
            None => Err(ErrorKind::InternalError(
                "insert into a hash buffer without open table".to_string(),
            ))?,
        };

        let offset = self.bytes.len();
        let relative = (offset - start) as u64;
        let slot = start + table_header_len(read_u32(&self.bytes, start + HT_NCOLS)? as usize)
            + 8 * (hash as usize % nslots);
        let head = read_u64(&self.bytes, slot)?;

        self.bytes.resize(offset + entry_len(row.len()), 0);
        write_u64(&mut self.bytes, offset + E_NEXT, head)?;
        write_u32(&mut self.bytes, offset + E_HASH, hash)?;
        write_u32(&mut self.bytes, offset + E_ROWID, rowid)?;
        write_u32(&mut self.bytes, offset + E_TLEN, row.len() as u32)?;
        self.bytes[offset + ENTRY_HEADER_LEN..offset + ENTRY_HEADER_LEN + row.len()]
            .copy_from_slice(row);
        write_u64(&mut self.bytes, slot, relative)?;

        if let Some(ref mut t) = self.table {
            t.nitems += 1;
        }
        Ok(())
    }

    /// Finishes the open table and returns a copy of it.
    pub fn end_table(&mut self) -> Result<Vec<u8>> {
        let cursor = self.table.take().ok_or_else(|| {
            ErrorKind::InternalError("no hash table to finish".to_string())
        })?;

        let start = cursor.start;
        let length = self.bytes.len() - start;
        let entries = length - table_header_len(read_u32(&self.bytes, start + HT_NCOLS)? as usize)
            - 8 * cursor.nslots;
        write_u64(&mut self.bytes, start + HT_LENGTH, length as u64)?;
        write_u64(&mut self.bytes, start + HT_USAGE, entries as u64)?;
        write_u32(&mut self.bytes, start + HT_NITEMS, cursor.nitems)?;

        debug!(
            depth = cursor.depth,
            nitems = cursor.nitems,
            length,
            "finished hash table"
        );
        Ok(self.bytes[start..].to_vec())
    }

    /// Appends a table built earlier. Its offsets stay valid, because they are
    /// relative to the table start.
    pub fn append_table(&mut self, depth: usize, table: &[u8]) -> Result<()> {
        if self.table.is_some() {
            Err(ErrorKind::InternalError(
                "cannot append a hash table while another is open".to_string(),
            ))?;
        }
        if read_u64(table, HT_LENGTH)? as usize != table.len() {
            Err(ErrorKind::InternalError("corrupt hash table chunk".to_string()))?;
        }

        let start = self.bytes.len();
        self.set_table_offset(depth, start)?;
        self.bytes.extend_from_slice(table);
        Ok(())
    }

    pub fn freeze(mut self) -> Result<MultiHashBuffer> {
        if self.table.is_some() {
            Err(ErrorKind::InternalError(
                "cannot freeze a hash buffer with an open table".to_string(),
            ))?;
        }

        let usage = self.bytes.len();
        let capacity = std::cmp::max(self.capacity, usage);
        write_u64(&mut self.bytes, MH_LENGTH, capacity as u64)?;
        write_u64(&mut self.bytes, MH_USAGE, usage as u64)?;
        write_u32(&mut self.bytes, MH_DIVIDED, self.divided as u32)?;

        let mut tables = Vec::with_capacity(self.ntables);
        {
            let view = MultiHashView::new(&self.bytes)?;
            for depth in 1..=self.ntables {
                let table = view.table(depth)?;
                tables.push(TableStats {
                    nitems: table.nitems(),
                    nslots: table.nslots(),
                    length: table.length(),
                });
            }
        }

        Ok(MultiHashBuffer {
            bytes: Arc::new(self.bytes),
            capacity,
            divided: self.divided,
            tables,
            residency: Mutex::new(Residency::default()),
            uploads: AtomicUsize::new(0),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableStats {
    pub nitems: usize,
    pub nslots: usize,
    pub length: usize,
}

#[derive(Default)]
struct Residency {
    n_kernel: usize,
    mem: Option<DeviceMem>,
    ready: Option<Event>,
}

/// A finished multi-level hash buffer, shared read-only by join sessions.
///
/// The buffer keeps at most one copy in device memory. The copy exists while
/// at least one session holds a [`ResidencyToken`].
pub struct MultiHashBuffer {
    bytes: Arc<Vec<u8>>,
    capacity: usize,
    divided: bool,
    tables: Vec<TableStats>,
    residency: Mutex<Residency>,
    uploads: AtomicUsize,
}

impl MultiHashBuffer {
    pub fn bytes(&self) -> &Arc<Vec<u8>> {
        &self.bytes
    }

    pub fn usage(&self) -> usize {
        self.bytes.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ntables(&self) -> usize {
        self.tables.len()
    }

    pub fn is_divided(&self) -> bool {
        self.divided
    }

    pub fn table_stats(&self, depth: usize) -> Option<TableStats> {
        depth.checked_sub(1).and_then(|i| self.tables.get(i)).copied()
    }

    pub fn view(&self) -> Result<MultiHashView<'_>> {
        MultiHashView::new(&self.bytes)
    }

    /// The number of transfers of the buffer to the device.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Makes the buffer resident on `device`.
    ///
    /// The first acquirer allocates device memory and submits the transfer.
    /// Later acquirers share the copy and the transfer's completion event.
    /// The transfer is submitted before the lock is released, so any session
    /// that waits on the event is submitted after the transfer. A copy whose
    /// transfer failed is replaced by a new transfer.
    pub fn acquire_device(self: &Arc<Self>, device: &Device) -> Result<ResidencyToken> {
        let mut residency = self.residency.lock();

        let resident = match (&residency.mem, &residency.ready) {
            (Some(mem), Some(ready)) => match ready.status() {
                EventStatus::Failed(_) => None,
                _ => Some((mem.clone(), ready.clone())),
            },
            _ => None,
        };

        let (mem, ready) = match resident {
            Some(resident) => resident,
            None => {
                let (mem, ready) = self.upload(device)?;
                residency.mem = Some(mem.clone());
                residency.ready = Some(ready.clone());
                (mem, ready)
            }
        };
        residency.n_kernel += 1;

        Ok(ResidencyToken {
            buffer: self.clone(),
            mem,
            ready,
        })
    }

    fn upload(&self, device: &Device) -> Result<(DeviceMem, Event)> {
        let mem = device.alloc(self.bytes.len())?;
        let mut queue = device.queue();
        let ready = queue.enqueue_write(&mem, 0, self.bytes.clone())?;
        let len = self.bytes.len();
        queue.submit(move |result| {
            if let Err(e) = result {
                warn!(error = %e, bytes = len, "hash buffer transfer failed");
            }
        });
        self.uploads.fetch_add(1, Ordering::SeqCst);
        debug!(bytes = len, "submitted hash buffer transfer");
        Ok((mem, ready))
    }

    /// The number of sessions currently holding the device copy.
    pub fn resident_sessions(&self) -> usize {
        self.residency.lock().n_kernel
    }
}

impl std::fmt::Debug for MultiHashBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MultiHashBuffer")
            .field("usage", &self.bytes.len())
            .field("capacity", &self.capacity)
            .field("divided", &self.divided)
            .field("tables", &self.tables)
            .finish()
    }
}

/// A session's share of the device copy of a hash buffer.
pub struct ResidencyToken {
    buffer: Arc<MultiHashBuffer>,
    mem: DeviceMem,
    ready: Event,
}

impl ResidencyToken {
    pub fn mem(&self) -> &DeviceMem {
        &self.mem
    }

    /// Completes when the transfer of the buffer finished.
    pub fn ready(&self) -> &Event {
        &self.ready
    }

    pub fn buffer(&self) -> &Arc<MultiHashBuffer> {
        &self.buffer
    }
}

impl Drop for ResidencyToken {
    fn drop(&mut self) {
        let mut residency = self.buffer.residency.lock();
        residency.n_kernel -= 1;
        if residency.n_kernel == 0 {
            residency.mem = None;
            residency.ready = None;
        }
    }
}

/// Read access to a multi-level hash buffer image.
#[derive(Clone, Copy)]
pub struct MultiHashView<'a> {
    bytes: &'a [u8],
    ntables: usize,
}

impl<'a> MultiHashView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let ntables = read_u32(bytes, MH_NTABLES)? as usize;
        if multihash_header_len(ntables) > bytes.len() {
            Err(ErrorKind::InternalError("truncated hash buffer header".to_string()))?;
        }
        Ok(Self { bytes, ntables })
    }

    pub fn ntables(&self) -> usize {
        self.ntables
    }

    pub fn is_divided(&self) -> Result<bool> {
        read_u32(self.bytes, MH_DIVIDED).map(|v| v != 0)
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn table(&self, depth: usize) -> Result<HashTableView<'a>> {
        if depth == 0 || depth > self.ntables {
            Err(ErrorKind::InternalError(format!(
                "no hash table at depth {}",
                depth
            )))?;
        }
        let base = read_u64(self.bytes, MH_OFFSETS + 8 * depth)? as usize;
        if base == 0 {
            Err(ErrorKind::InternalError(format!(
                "hash table of depth {} is missing",
                depth
            )))?;
        }
        let length = read_u64(self.bytes, base + HT_LENGTH)? as usize;
        let ncols = read_u32(self.bytes, base + HT_NCOLS)? as usize;
        let nslots = read_u32(self.bytes, base + HT_NSLOTS)? as usize;
        if base + length > self.bytes.len() || table_header_len(ncols) + 8 * nslots > length {
            Err(ErrorKind::InternalError(format!(
                "corrupt hash table at depth {}",
                depth
            )))?;
        }

        Ok(HashTableView {
            bytes: self.bytes,
            base,
            length,
            ncols,
            nslots,
            nitems: read_u32(self.bytes, base + HT_NITEMS)? as usize,
        })
    }
}

#[derive(Clone, Copy)]
pub struct HashTableView<'a> {
    bytes: &'a [u8],
    base: usize,
    length: usize,
    ncols: usize,
    nslots: usize,
    nitems: usize,
}

impl<'a> HashTableView<'a> {
    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nslots(&self) -> usize {
        self.nslots
    }

    pub fn nitems(&self) -> usize {
        self.nitems
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn colmeta(&self, col: usize) -> Option<ColumnMeta> {
        if col >= self.ncols {
            return None;
        }
        let offset = self.base + HT_COLMETA + ColumnMeta::SIZE * col;
        Some(ColumnMeta::read(&self.bytes[offset..offset + ColumnMeta::SIZE]))
    }

    /// The entry at `offset`, or `None` for the null offset.
    pub fn entry(&self, offset: BufferOffset) -> Result<Option<EntryView<'a>>> {
        if offset.is_none() {
            return Ok(None);
        }
        let relative = offset.0 as usize;
        if relative < table_header_len(self.ncols) + 8 * self.nslots
            || relative + ENTRY_HEADER_LEN > self.length
        {
            Err(ErrorKind::InternalError(format!(
                "hash entry offset {} out of table bounds",
                relative
            )))?;
        }

        let start = self.base + relative;
        let t_len = read_u32(self.bytes, start + E_TLEN)? as usize;
        if relative + ENTRY_HEADER_LEN + t_len > self.length {
            Err(ErrorKind::InternalError(format!(
                "hash entry at offset {} exceeds its table",
                relative
            )))?;
        }

        Ok(Some(EntryView {
            offset: start,
            relative: offset,
            next: BufferOffset(read_u64(self.bytes, start + E_NEXT)?),
            hash: read_u32(self.bytes, start + E_HASH)?,
            rowid: read_u32(self.bytes, start + E_ROWID)?,
            row: &self.bytes[start + ENTRY_HEADER_LEN..start + ENTRY_HEADER_LEN + t_len],
        }))
    }

    /// The head of the bucket chain for `hash`.
    pub fn first_entry(&self, hash: u32) -> Result<Option<EntryView<'a>>> {
        let slot = self.base + table_header_len(self.ncols) + 8 * (hash as usize % self.nslots);
        self.entry(BufferOffset(read_u64(self.bytes, slot)?))
    }

    /// The successor of `entry` in its bucket chain.
    ///
    /// Chains are built by head insertion, so links always point backwards.
    /// A forward link means the buffer is corrupt.
    pub fn next_entry(&self, entry: &EntryView<'a>) -> Result<Option<EntryView<'a>>> {
        if !entry.next.is_none() && entry.next >= entry.relative {
            Err(ErrorKind::InternalError(format!(
                "hash chain loops at offset {}",
                entry.relative.0
            )))?;
        }
        self.entry(entry.next)
    }

    /// Visits all entries, bucket by bucket.
    pub fn for_each_entry<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&EntryView<'a>) -> Result<()>,
    {
        for slot in 0..self.nslots {
            let head = read_u64(self.bytes, self.base + table_header_len(self.ncols) + 8 * slot)?;
            let mut entry = self.entry(BufferOffset(head))?;
            while let Some(e) = entry {
                f(&e)?;
                entry = self.next_entry(&e)?;
            }
        }
        Ok(())
    }
}

/// One entry of a hash table.
#[derive(Clone, Copy, Debug)]
pub struct EntryView<'a> {
    offset: usize,
    relative: BufferOffset,
    next: BufferOffset,
    hash: u32,
    rowid: u32,
    row: &'a [u8],
}

impl<'a> EntryView<'a> {
    /// Offset of the entry relative to the start of the buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Offset of the entry relative to the start of its table.
    pub fn table_offset(&self) -> BufferOffset {
        self.relative
    }

    /// Offset of the row data relative to the start of the buffer.
    pub fn row_offset(&self) -> usize {
        self.offset + ENTRY_HEADER_LEN
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn rowid(&self) -> u32 {
        self.rowid
    }

    pub fn row(&self) -> &'a [u8] {
        self.row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeInfo;

    fn colmeta() -> Vec<ColumnMeta> {
        vec![ColumnMeta::of(&TypeInfo::int4())]
    }

    fn chain(table: &HashTableView<'_>, hash: u32) -> Vec<u32> {
        let mut rowids = Vec::new();
        let mut entry = table.first_entry(hash).unwrap();
        while let Some(e) = entry {
            if e.hash() == hash {
                rowids.push(e.rowid());
            }
            entry = table.next_entry(&e).unwrap();
        }
        rowids
    }

    #[test]
    fn chains_link_last_inserted_first() {
        let mut writer = MultiHashWriter::new(4096, 1);
        writer.begin_table(1, &colmeta(), 4).unwrap();
        writer.insert(5, &[0, 1, 0, 0, 0]).unwrap();
        writer.insert(9, &[0, 2, 0, 0, 0]).unwrap();
        writer.insert(5, &[0, 3, 0, 0, 0]).unwrap();
        writer.end_table().unwrap();
        let buffer = writer.freeze().unwrap();

        let view = buffer.view().unwrap();
        let table = view.table(1).unwrap();
        assert_eq!(table.nitems(), 3);
        assert_eq!(chain(&table, 5), vec![2, 0]);
        assert_eq!(chain(&table, 9), vec![1]);
        assert_eq!(buffer.table_stats(1).unwrap().nitems, 3);
    }

    #[test]
    fn appended_chunk_keeps_its_links() {
        let mut writer = MultiHashWriter::new(4096, 2);
        writer.begin_table(2, &colmeta(), 2).unwrap();
        writer.insert(1, &[0, 7, 0, 0, 0]).unwrap();
        writer.end_table().unwrap();
        writer.begin_table(1, &colmeta(), 2).unwrap();
        writer.insert(3, &[0, 8, 0, 0, 0]).unwrap();
        writer.insert(3, &[0, 9, 0, 0, 0]).unwrap();
        let chunk = writer.end_table().unwrap();

        let mut other = MultiHashWriter::new(4096, 2);
        other.begin_table(2, &colmeta(), 8).unwrap();
        other.end_table().unwrap();
        other.append_table(1, &chunk).unwrap();
        let buffer = other.freeze().unwrap();

        let view = buffer.view().unwrap();
        assert_eq!(chain(&view.table(1).unwrap(), 3), vec![1, 0]);
        assert_eq!(view.table(2).unwrap().nitems(), 0);
    }

    #[test]
    fn duplicate_table_is_rejected() {
        let mut writer = MultiHashWriter::new(1024, 1);
        writer.begin_table(1, &colmeta(), 1).unwrap();
        writer.end_table().unwrap();
        assert!(writer.begin_table(1, &colmeta(), 1).is_err());
        assert!(writer.begin_table(2, &colmeta(), 1).is_err());
    }

    #[test]
    fn expand_preserves_content() {
        let mut writer = MultiHashWriter::new(64, 1);
        writer.begin_table(1, &colmeta(), 1).unwrap();
        writer.insert(1, &[0, 1, 0, 0, 0]).unwrap();
        writer.expand(128);
        writer.insert(1, &[0, 2, 0, 0, 0]).unwrap();
        writer.end_table().unwrap();
        assert_eq!(writer.capacity(), 128);

        let buffer = writer.freeze().unwrap();
        let view = buffer.view().unwrap();
        assert_eq!(chain(&view.table(1).unwrap(), 1), vec![1, 0]);
    }

    #[test]
    fn failed_transfer_is_uploaded_again() {
        let device = Device::builder().build().unwrap();
        let mut writer = MultiHashWriter::new(1024, 1);
        writer.begin_table(1, &colmeta(), 4).unwrap();
        writer.insert(5, &[0, 1, 0, 0, 0]).unwrap();
        writer.end_table().unwrap();
        let buffer = Arc::new(writer.freeze().unwrap());

        // A queue dropped before submission fails its commands.
        let failed = {
            let mem = device.alloc(buffer.bytes.len()).unwrap();
            let mut queue = device.queue();
            let ready = queue
                .enqueue_write(&mem, 0, buffer.bytes.clone())
                .unwrap();
            drop(queue);
            (mem, ready)
        };
        assert!(matches!(failed.1.status(), EventStatus::Failed(_)));
        {
            let mut residency = buffer.residency.lock();
            residency.mem = Some(failed.0);
            residency.ready = Some(failed.1);
        }

        let token = buffer.acquire_device(&device).unwrap();
        token.ready().wait().unwrap();
        assert_eq!(buffer.upload_count(), 1);

        let shared = buffer.acquire_device(&device).unwrap();
        assert_eq!(buffer.upload_count(), 1);
        assert_eq!(buffer.resident_sessions(), 2);
        drop(shared);
        drop(token);
        assert_eq!(buffer.resident_sessions(), 0);
    }
}
