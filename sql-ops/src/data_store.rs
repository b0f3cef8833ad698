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

//! Data stores exchanged with the device.
//!
//! All stores are flat byte buffers without pointers. Offsets are relative
//! to the start of the buffer, so that a store keeps its meaning after it is
//! copied to device memory and back.
//!
//! # Row format
//!
//! A serialized row starts with a NULL bitmap of `ceil(ncols / 8)` bytes. Bit
//! `i % 8` of byte `i / 8` is set if column `i` is NULL. The non-NULL columns
//! follow in column order without padding. Fixed-length columns occupy
//! their type length in little-endian byte order. Variable-length columns
//! consist of a `u32` length followed by the content.
//!
//! # Row store
//!
//! ```text
//! length: u64 | nitems: u32 | ncols: u32 | index_offset: u64 | colmeta[ncols] | rows | index[nitems]: u64
//! ```
//!
//! Each row is stored as `t_len: u32 | pad: u32 | row bytes`, padded to 8
//! bytes. The index holds the offset of each row header.
//!
//! # Slot store
//!
//! ```text
//! length: u64 | nitems: u32 | nrooms: u32 | ncols: u32 | errcode: i32 | slots[nrooms]
//! ```
//!
//! A slot is `values[ncols]: u64 | isnull[ncols]: u8`, padded to 8 bytes.
//! By-value datums are stored as their value bits. By-reference datums are
//! stored as a [`HostRef`] into the host copy of the buffer they come from.

use crate::error::{ErrorKind, Result};
use crate::types::{Datum, Row, TypeInfo};
use std::convert::TryInto;
use std::sync::Arc;

pub(crate) fn align8(len: usize) -> usize {
    (len + 7) & !7
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| out_of_bounds(offset, bytes.len()))
}

pub(crate) fn read_i32(bytes: &[u8], offset: usize) -> Result<i32> {
    read_u32(bytes, offset).map(|v| v as i32)
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    bytes
        .get(offset..offset + 8)
        .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .ok_or_else(|| out_of_bounds(offset, bytes.len()))
}

pub(crate) fn write_u32(bytes: &mut [u8], offset: usize, value: u32) -> Result<()> {
    let len = bytes.len();
    bytes
        .get_mut(offset..offset + 4)
        .ok_or_else(|| out_of_bounds(offset, len))?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub(crate) fn write_u64(bytes: &mut [u8], offset: usize, value: u64) -> Result<()> {
    let len = bytes.len();
    bytes
        .get_mut(offset..offset + 8)
        .ok_or_else(|| out_of_bounds(offset, len))?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn out_of_bounds(offset: usize, len: usize) -> crate::error::Error {
    ErrorKind::InternalError(format!(
        "access at offset {} out of bounds of {} byte buffer",
        offset, len
    ))
    .into()
}

/// Per-column layout information needed to decode a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColumnMeta {
    pub attlen: i16,
    pub attbyval: bool,
}

impl ColumnMeta {
    pub const SIZE: usize = 4;

    pub fn of(ty: &TypeInfo) -> Self {
        Self {
            attlen: ty.len,
            attbyval: ty.byval,
        }
    }

    pub(crate) fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.attlen.to_le_bytes());
        out[2] = self.attbyval as u8;
        out[3] = 0;
    }

    pub(crate) fn read(bytes: &[u8]) -> Self {
        Self {
            attlen: i16::from_le_bytes([bytes[0], bytes[1]]),
            attbyval: bytes[2] != 0,
        }
    }
}

/// Serializes a row in the row format.
pub fn encode_row(types: &[TypeInfo], row: &[Datum]) -> Result<Vec<u8>> {
    if types.len() != row.len() {
        Err(ErrorKind::InvalidArgument(format!(
            "row has {} columns, relation has {}",
            row.len(),
            types.len()
        )))?;
    }

    let bitmap_len = (types.len() + 7) / 8;
    let mut out = vec![0_u8; bitmap_len];
    for (index, (ty, datum)) in types.iter().zip(row).enumerate() {
        if datum.is_null() {
            out[index / 8] |= 1 << (index % 8);
        } else {
            datum.encode(ty, &mut out)?;
        }
    }

    Ok(out)
}

/// Locates column `col` in a serialized row. Returns the byte offset of the
/// stored datum relative to the row start, or `None` if the datum is NULL.
pub fn datum_offset(types: &[TypeInfo], row: &[u8], col: usize) -> Result<Option<usize>> {
    if col >= types.len() {
        Err(ErrorKind::InternalError(format!(
            "column {} out of range of {} columns",
            col,
            types.len()
        )))?;
    }

    let is_null = |i: usize| row.get(i / 8).map(|b| b & (1 << (i % 8)) != 0);
    let mut offset = (types.len() + 7) / 8;

    for (index, ty) in types.iter().enumerate().take(col + 1) {
        let null = is_null(index)
            .ok_or_else(|| ErrorKind::InternalError("truncated null bitmap".to_string()))?;
        if index == col {
            return Ok(if null { None } else { Some(offset) });
        }
        if !null {
            let rest = row
                .get(offset..)
                .ok_or_else(|| ErrorKind::InternalError("truncated row".to_string()))?;
            offset += Datum::stored_len(ty, rest)?;
        }
    }

    unreachable!("column index checked above")
}

pub fn decode_datum(types: &[TypeInfo], row: &[u8], col: usize) -> Result<Datum> {
    match datum_offset(types, row, col)? {
        None => Ok(Datum::Null),
        Some(offset) => Datum::decode(&types[col], &row[offset..]),
    }
}

pub fn decode_row(types: &[TypeInfo], row: &[u8]) -> Result<Row> {
    (0..types.len())
        .map(|col| decode_datum(types, row, col))
        .collect()
}

/// A reference to a by-reference datum in a host-side buffer.
///
/// Depth 0 refers to the outer row store, depth `d > 0` to the multi-level
/// hash buffer. The offset is the absolute byte offset of the stored datum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostRef {
    pub depth: u16,
    pub offset: u64,
}

impl HostRef {
    const OFFSET_BITS: u32 = 48;

    pub fn pack(self) -> u64 {
        ((self.depth as u64) << Self::OFFSET_BITS) | (self.offset & ((1 << Self::OFFSET_BITS) - 1))
    }

    pub fn unpack(bits: u64) -> Self {
        Self {
            depth: (bits >> Self::OFFSET_BITS) as u16,
            offset: bits & ((1 << Self::OFFSET_BITS) - 1),
        }
    }
}

const RS_LENGTH: usize = 0;
const RS_NITEMS: usize = 8;
const RS_NCOLS: usize = 12;
const RS_INDEX_OFFSET: usize = 16;
const RS_COLMETA: usize = 24;
const ROW_HEADER: usize = 8;

/// A chunk of outer relation rows in the row store format.
///
/// Rows are appended until the chunk reaches its byte budget. Row offsets
/// are stable, because rows are never moved.
#[derive(Clone, Debug)]
pub struct RowStore {
    types: Arc<[TypeInfo]>,
    budget: usize,
    data: Vec<u8>,
    index: Vec<u64>,
}

impl RowStore {
    pub fn new(types: Arc<[TypeInfo]>, budget: usize) -> Self {
        let rows_start = align8(RS_COLMETA + ColumnMeta::SIZE * types.len());
        let mut data = vec![0_u8; rows_start];
        for (index, ty) in types.iter().enumerate() {
            let offset = RS_COLMETA + ColumnMeta::SIZE * index;
            ColumnMeta::of(ty).write(&mut data[offset..offset + ColumnMeta::SIZE]);
        }
        data[RS_NCOLS..RS_NCOLS + 4].copy_from_slice(&(types.len() as u32).to_le_bytes());

        Self {
            types,
            budget,
            data,
            index: Vec::new(),
        }
    }

    pub fn types(&self) -> &Arc<[TypeInfo]> {
        &self.types
    }

    pub fn nitems(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The size of the sealed store in bytes.
    pub fn length(&self) -> usize {
        self.data.len() + 8 * self.index.len()
    }

    /// Appends a row. Returns `false` without modifying the store if the row
    /// does not fit into the budget. An empty store accepts any row.
    pub fn insert_row(&mut self, row: &[Datum]) -> Result<bool> {
        let encoded = encode_row(&self.types, row)?;
        let row_len = ROW_HEADER + align8(encoded.len());

        if !self.is_empty() && self.length() + row_len + 8 > self.budget {
            return Ok(false);
        }

        let offset = self.data.len();
        let t_len: u32 = encoded
            .len()
            .try_into()
            .map_err(|_| ErrorKind::IntegerOverflow("row longer than 4 GiB".to_string()))?;
        self.data.extend_from_slice(&t_len.to_le_bytes());
        self.data.extend_from_slice(&[0_u8; 4]);
        self.data.extend_from_slice(&encoded);
        self.data.resize(offset + row_len, 0);
        self.index.push(offset as u64);

        Ok(true)
    }

    pub fn row(&self, index: usize) -> Result<Row> {
        let offset = *self.index.get(index).ok_or_else(|| {
            ErrorKind::InvalidArgument(format!("row {} out of range", index))
        })? as usize;
        let t_len = read_u32(&self.data, offset)? as usize;
        decode_row(
            &self.types,
            &self.data[offset + ROW_HEADER..offset + ROW_HEADER + t_len],
        )
    }

    /// Serializes the store into its device representation.
    pub fn seal(&self) -> Vec<u8> {
        let mut bytes = self.data.clone();
        let index_offset = bytes.len() as u64;
        for offset in &self.index {
            bytes.extend_from_slice(&offset.to_le_bytes());
        }
        let length = bytes.len() as u64;
        bytes[RS_LENGTH..RS_LENGTH + 8].copy_from_slice(&length.to_le_bytes());
        bytes[RS_NITEMS..RS_NITEMS + 4].copy_from_slice(&(self.index.len() as u32).to_le_bytes());
        bytes[RS_INDEX_OFFSET..RS_INDEX_OFFSET + 8].copy_from_slice(&index_offset.to_le_bytes());
        bytes
    }
}

/// Read access to a sealed row store.
#[derive(Clone, Copy)]
pub struct RowStoreView<'a> {
    bytes: &'a [u8],
    nitems: usize,
    index_offset: usize,
}

impl<'a> RowStoreView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let nitems = read_u32(bytes, RS_NITEMS)? as usize;
        let index_offset = read_u64(bytes, RS_INDEX_OFFSET)? as usize;
        if index_offset + 8 * nitems > bytes.len() {
            Err(ErrorKind::InternalError("corrupt row store index".to_string()))?;
        }
        Ok(Self {
            bytes,
            nitems,
            index_offset,
        })
    }

    pub fn nitems(&self) -> usize {
        self.nitems
    }

    pub fn ncols(&self) -> Result<usize> {
        read_u32(self.bytes, RS_NCOLS).map(|n| n as usize)
    }

    pub fn colmeta(&self, col: usize) -> Result<ColumnMeta> {
        let offset = RS_COLMETA + ColumnMeta::SIZE * col;
        self.bytes
            .get(offset..offset + ColumnMeta::SIZE)
            .map(ColumnMeta::read)
            .ok_or_else(|| out_of_bounds(offset, self.bytes.len()))
    }

    /// Returns the absolute offset of the row data and the row bytes.
    pub fn row(&self, index: usize) -> Result<(usize, &'a [u8])> {
        if index >= self.nitems {
            Err(ErrorKind::InternalError(format!(
                "row {} out of range of {} rows",
                index, self.nitems
            )))?;
        }
        let offset = read_u64(self.bytes, self.index_offset + 8 * index)? as usize;
        let t_len = read_u32(self.bytes, offset)? as usize;
        let start = offset + ROW_HEADER;
        let row = self
            .bytes
            .get(start..start + t_len)
            .ok_or_else(|| out_of_bounds(start, self.bytes.len()))?;
        Ok((start, row))
    }
}

const SS_LENGTH: usize = 0;
const SS_NITEMS: usize = 8;
const SS_NROOMS: usize = 12;
const SS_NCOLS: usize = 16;
const SS_ERRCODE: usize = 20;
pub const SLOT_STORE_HEADER: usize = 24;

/// The destination of the join's projection, one tuple slot per result row.
#[derive(Clone, Debug)]
pub struct SlotStore {
    bytes: Vec<u8>,
}

impl SlotStore {
    pub fn slot_size(ncols: usize) -> usize {
        8 * ncols + align8(ncols)
    }

    pub fn length_for(ncols: usize, nrooms: usize) -> usize {
        SLOT_STORE_HEADER + Self::slot_size(ncols) * nrooms
    }

    /// Creates the initial device image of an empty store.
    pub fn init_bytes(ncols: usize, nrooms: usize) -> Vec<u8> {
        let length = Self::length_for(ncols, nrooms);
        let mut bytes = vec![0_u8; length];
        bytes[SS_LENGTH..SS_LENGTH + 8].copy_from_slice(&(length as u64).to_le_bytes());
        bytes[SS_NROOMS..SS_NROOMS + 4].copy_from_slice(&(nrooms as u32).to_le_bytes());
        bytes[SS_NCOLS..SS_NCOLS + 4].copy_from_slice(&(ncols as u32).to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let store = Self { bytes };
        let needed = Self::length_for(store.ncols(), store.nitems());
        if store.nitems() > store.nrooms() || needed > store.bytes.len() {
            Err(ErrorKind::InternalError(format!(
                "slot store with {} items in {} rooms is truncated",
                store.nitems(),
                store.nrooms()
            )))?;
        }
        Ok(store)
    }

    fn header_u32(&self, offset: usize) -> usize {
        read_u32(&self.bytes, offset).unwrap_or(0) as usize
    }

    pub fn nitems(&self) -> usize {
        self.header_u32(SS_NITEMS)
    }

    pub fn nrooms(&self) -> usize {
        self.header_u32(SS_NROOMS)
    }

    pub fn ncols(&self) -> usize {
        self.header_u32(SS_NCOLS)
    }

    pub fn errcode(&self) -> i32 {
        read_i32(&self.bytes, SS_ERRCODE).unwrap_or(0)
    }

    /// Returns the raw slot value, or `None` for NULL.
    pub fn value(&self, row: usize, col: usize) -> Result<Option<u64>> {
        let ncols = self.ncols();
        if row >= self.nitems() || col >= ncols {
            Err(ErrorKind::InvalidArgument(format!(
                "slot ({}, {}) out of range",
                row, col
            )))?;
        }
        let slot = SLOT_STORE_HEADER + Self::slot_size(ncols) * row;
        if self.bytes[slot + 8 * ncols + col] != 0 {
            return Ok(None);
        }
        read_u64(&self.bytes, slot + 8 * col).map(Some)
    }
}

/// Read access to the header of a slot store image.
pub struct SlotStoreHeader {
    pub length: u64,
    pub nitems: u32,
    pub nrooms: u32,
    pub ncols: u32,
    pub errcode: i32,
}

impl SlotStoreHeader {
    pub fn read(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            length: read_u64(bytes, SS_LENGTH)?,
            nitems: read_u32(bytes, SS_NITEMS)?,
            nrooms: read_u32(bytes, SS_NROOMS)?,
            ncols: read_u32(bytes, SS_NCOLS)?,
            errcode: read_i32(bytes, SS_ERRCODE)?,
        })
    }
}

/// Write access to a slot store image in device memory.
pub struct SlotStoreMut<'a> {
    bytes: &'a mut [u8],
    ncols: usize,
    nrooms: usize,
}

impl<'a> SlotStoreMut<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Result<Self> {
        let header = SlotStoreHeader::read(bytes)?;
        let ncols = header.ncols as usize;
        let nrooms = header.nrooms as usize;
        if SlotStore::length_for(ncols, nrooms) > bytes.len() {
            Err(ErrorKind::InternalError("slot store image is truncated".to_string()))?;
        }
        Ok(Self {
            bytes,
            ncols,
            nrooms,
        })
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nrooms(&self) -> usize {
        self.nrooms
    }

    pub fn set_nitems(&mut self, nitems: usize) -> Result<()> {
        write_u32(self.bytes, SS_NITEMS, nitems as u32)
    }

    pub fn set_errcode(&mut self, errcode: i32) -> Result<()> {
        write_u32(self.bytes, SS_ERRCODE, errcode as u32)
    }

    /// Stores one slot. `values[i]` is `None` for NULL.
    pub fn put(&mut self, row: usize, values: &[Option<u64>]) -> Result<()> {
        if row >= self.nrooms || values.len() != self.ncols {
            Err(ErrorKind::InternalError(format!(
                "slot {} with {} values does not fit the store",
                row,
                values.len()
            )))?;
        }
        let slot = SLOT_STORE_HEADER + SlotStore::slot_size(self.ncols) * row;
        for (col, value) in values.iter().enumerate() {
            let isnull = slot + 8 * self.ncols + col;
            match value {
                Some(bits) => {
                    write_u64(self.bytes, slot + 8 * col, *bits)?;
                    self.bytes[isnull] = 0;
                }
                None => {
                    write_u64(self.bytes, slot + 8 * col, 0)?;
                    self.bytes[isnull] = 1;
                }
            }
        }
        Ok(())
    }
}

/// Constants and parameter values referenced by device code.
///
/// ```text
/// length: u64 | nparams: u32 | pad: u32 | offsets[nparams]: u64 | params
/// ```
///
/// Each parameter is stored as `isnull: u8` followed by the stored datum.
pub struct ParamBuffer;

impl ParamBuffer {
    pub fn build(values: &[(Datum, TypeInfo)]) -> Result<Vec<u8>> {
        let header = 16 + 8 * values.len();
        let mut bytes = vec![0_u8; header];
        write_u32(&mut bytes, 8, values.len() as u32)?;

        for (index, (datum, ty)) in values.iter().enumerate() {
            let offset = bytes.len() as u64;
            write_u64(&mut bytes, 16 + 8 * index, offset)?;
            if datum.is_null() {
                bytes.push(1);
            } else {
                bytes.push(0);
                datum.encode(ty, &mut bytes)?;
            }
        }
        let length = bytes.len() as u64;
        write_u64(&mut bytes, 0, length)?;

        Ok(bytes)
    }

    pub fn nparams(bytes: &[u8]) -> Result<usize> {
        read_u32(bytes, 8).map(|n| n as usize)
    }

    pub fn get(bytes: &[u8], index: usize, ty: &TypeInfo) -> Result<Datum> {
        if index >= Self::nparams(bytes)? {
            Err(ErrorKind::InternalError(format!(
                "parameter {} out of range",
                index
            )))?;
        }
        let offset = read_u64(bytes, 16 + 8 * index)? as usize;
        match bytes.get(offset) {
            Some(0) => Datum::decode(ty, &bytes[offset + 1..]),
            Some(_) => Ok(Datum::Null),
            None => Err(out_of_bounds(offset, bytes.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types() -> Arc<[TypeInfo]> {
        Arc::from(vec![TypeInfo::int4(), TypeInfo::text(), TypeInfo::int8()])
    }

    #[test]
    fn row_store_respects_budget() {
        let mut store = RowStore::new(types(), 128);
        let row = vec![Datum::Int4(1), Datum::Text("abc".to_string()), Datum::Int8(2)];
        let mut inserted = 0;
        while store.insert_row(&row).unwrap() {
            inserted += 1;
        }
        assert!(inserted > 0);
        assert_eq!(store.nitems(), inserted);
        assert!(store.length() <= 128);
    }

    #[test]
    fn empty_row_store_accepts_oversized_row() {
        let mut store = RowStore::new(types(), 8);
        let row = vec![Datum::Int4(1), Datum::Text("x".repeat(100)), Datum::Null];
        assert!(store.insert_row(&row).unwrap());
        assert!(!store.insert_row(&row).unwrap());
        assert_eq!(store.row(0).unwrap(), row);
    }

    #[test]
    fn sealed_view_locates_datums() {
        let mut store = RowStore::new(types(), 4096);
        store
            .insert_row(&[Datum::Int4(7), Datum::Null, Datum::Int8(9)])
            .unwrap();
        store
            .insert_row(&[Datum::Int4(8), Datum::Text("hi".to_string()), Datum::Int8(10)])
            .unwrap();
        let bytes = store.seal();
        let view = RowStoreView::new(&bytes).unwrap();

        assert_eq!(view.nitems(), 2);
        assert_eq!(view.ncols().unwrap(), 3);
        assert_eq!(view.colmeta(1).unwrap(), ColumnMeta::of(&TypeInfo::text()));

        let (start, row) = view.row(1).unwrap();
        let offset = datum_offset(&types(), row, 1).unwrap().unwrap();
        assert_eq!(
            Datum::decode(&TypeInfo::text(), &bytes[start + offset..]).unwrap(),
            Datum::Text("hi".to_string())
        );
        assert_eq!(datum_offset(&types(), view.row(0).unwrap().1, 1).unwrap(), None);
    }

    #[test]
    fn slot_store_put_and_read() {
        let mut bytes = SlotStore::init_bytes(2, 3);
        {
            let mut slots = SlotStoreMut::new(&mut bytes).unwrap();
            slots.put(0, &[Some(5), None]).unwrap();
            slots.put(1, &[Some(6), Some(7)]).unwrap();
            assert!(slots.put(3, &[None, None]).is_err());
            slots.set_nitems(2).unwrap();
        }
        let store = SlotStore::from_bytes(bytes).unwrap();
        assert_eq!(store.nitems(), 2);
        assert_eq!(store.value(0, 0).unwrap(), Some(5));
        assert_eq!(store.value(0, 1).unwrap(), None);
        assert_eq!(store.value(1, 1).unwrap(), Some(7));
        assert!(store.value(2, 0).is_err());
    }

    #[test]
    fn param_buffer_round_trip_with_null() {
        let values = vec![
            (Datum::Int4(3), TypeInfo::int4()),
            (Datum::Null, TypeInfo::text()),
            (Datum::Text("p".to_string()), TypeInfo::text()),
        ];
        let bytes = ParamBuffer::build(&values).unwrap();
        assert_eq!(ParamBuffer::nparams(&bytes).unwrap(), 3);
        assert_eq!(ParamBuffer::get(&bytes, 0, &TypeInfo::int4()).unwrap(), Datum::Int4(3));
        assert_eq!(ParamBuffer::get(&bytes, 1, &TypeInfo::text()).unwrap(), Datum::Null);
        assert_eq!(
            ParamBuffer::get(&bytes, 2, &TypeInfo::text()).unwrap(),
            Datum::Text("p".to_string())
        );
    }

    #[test]
    fn host_ref_packing() {
        let r = HostRef {
            depth: 3,
            offset: 123_456,
        };
        assert_eq!(HostRef::unpack(r.pack()), r);
    }
}
