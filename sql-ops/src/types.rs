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

//! SQL data types and values.
//!
//! Types follow the catalog conventions of the database: a type is identified
//! by its object id, has a fixed length in bytes or `-1` for variable-length
//! ("varlena") types, and is either passed by value or by reference.

use crate::error::{ErrorKind, Result};
use num_traits::ToPrimitive;
use std::cmp::Ordering;
use std::convert::TryInto;

pub type TypeId = u32;

/// Length of variable-length types.
pub const VARLENA: i16 = -1;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypeInfo {
    pub type_id: TypeId,
    pub name: String,
    pub typmod: i32,
    pub collation: u32,
    pub len: i16,
    pub byval: bool,
}

macro_rules! builtin_types {
    ($(($name:ident, $Oid:ident, $oid:expr, $len:expr, $byval:expr)),*) => {
        paste::item! {
            $(
                pub const [<$Oid _OID>]: TypeId = $oid;
            )*
        }

        impl TypeInfo {
            $(
                pub fn $name() -> Self {
                    Self {
                        type_id: $oid,
                        name: stringify!($name).to_string(),
                        typmod: -1,
                        collation: 0,
                        len: $len,
                        byval: $byval,
                    }
                }
            )*
        }
    };
}

builtin_types!(
    (bool, BOOL, 16, 1, true),
    (int2, INT2, 21, 2, true),
    (int4, INT4, 23, 4, true),
    (int8, INT8, 20, 8, true),
    (float4, FLOAT4, 700, 4, true),
    (float8, FLOAT8, 701, 8, true),
    (text, TEXT, 25, VARLENA, false)
);

/// Default collation of text types.
pub const DEFAULT_COLLATION_OID: u32 = 100;

impl TypeInfo {
    /// Declares a type that is not built in. Values of custom types are
    /// represented as `Datum::Bytes`.
    pub fn custom(type_id: TypeId, name: &str, len: i16, byval: bool) -> Self {
        Self {
            type_id,
            name: name.to_string(),
            typmod: -1,
            collation: 0,
            len,
            byval,
        }
    }

    pub fn with_collation(mut self, collation: u32) -> Self {
        self.collation = collation;
        self
    }

    pub fn with_typmod(mut self, typmod: i32) -> Self {
        self.typmod = typmod;
        self
    }

    pub fn is_varlena(&self) -> bool {
        self.len == VARLENA
    }
}

/// A value of some SQL type.
#[derive(Clone, Debug, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// The bytes that identify the value for hashing.
    ///
    /// Fixed-length values contribute their value bytes, variable-length
    /// values their content without length header. NULL contributes nothing.
    pub fn key_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Datum::Null => None,
            Datum::Bool(v) => Some(vec![*v as u8]),
            Datum::Int2(v) => Some(v.to_le_bytes().to_vec()),
            Datum::Int4(v) => Some(v.to_le_bytes().to_vec()),
            Datum::Int8(v) => Some(v.to_le_bytes().to_vec()),
            Datum::Float4(v) => Some(v.to_le_bytes().to_vec()),
            Datum::Float8(v) => Some(v.to_le_bytes().to_vec()),
            Datum::Text(s) => Some(s.as_bytes().to_vec()),
            Datum::Bytes(b) => Some(b.clone()),
        }
    }

    /// Appends the stored representation of a non-NULL value.
    ///
    /// Fixed-length types store exactly `ty.len` bytes. Variable-length
    /// types store a `u32` length followed by the content.
    pub fn encode(&self, ty: &TypeInfo, out: &mut Vec<u8>) -> Result<()> {
        let bytes = self.key_bytes().ok_or_else(|| {
            ErrorKind::InternalError("cannot encode NULL as a value".to_string())
        })?;

        if ty.is_varlena() {
            let len: u32 = bytes.len().try_into().map_err(|_| {
                ErrorKind::IntegerOverflow("varlena datum longer than 4 GiB".to_string())
            })?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&bytes);
        } else {
            if ty.len <= 0 || bytes.len() != ty.len as usize {
                Err(ErrorKind::InvalidArgument(format!(
                    "value {:?} does not match type {} of length {}",
                    self, ty.name, ty.len
                )))?;
            }
            out.extend_from_slice(&bytes);
        }

        Ok(())
    }

    /// Returns the number of bytes the stored representation at the start of
    /// `bytes` occupies.
    pub fn stored_len(ty: &TypeInfo, bytes: &[u8]) -> Result<usize> {
        if ty.is_varlena() {
            let header = bytes
                .get(0..4)
                .ok_or_else(|| ErrorKind::InternalError("truncated varlena header".to_string()))?;
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            Ok(4 + len)
        } else if ty.len > 0 {
            Ok(ty.len as usize)
        } else {
            Err(ErrorKind::InternalError(format!("invalid type length {}", ty.len)).into())
        }
    }

    /// Decodes the stored representation at the start of `bytes`.
    pub fn decode(ty: &TypeInfo, bytes: &[u8]) -> Result<Datum> {
        let len = Self::stored_len(ty, bytes)?;
        let stored = bytes.get(0..len).ok_or_else(|| {
            ErrorKind::InternalError(format!("truncated datum of type {}", ty.name))
        })?;
        let content = if ty.is_varlena() { &stored[4..] } else { stored };

        let datum = match (ty.type_id, content.len()) {
            (BOOL_OID, 1) => Datum::Bool(content[0] != 0),
            (INT2_OID, 2) => Datum::Int2(i16::from_le_bytes([content[0], content[1]])),
            (INT4_OID, 4) => Datum::Int4(i32::from_le_bytes(array4(content))),
            (INT8_OID, 8) => Datum::Int8(i64::from_le_bytes(array8(content))),
            (FLOAT4_OID, 4) => Datum::Float4(f32::from_le_bytes(array4(content))),
            (FLOAT8_OID, 8) => Datum::Float8(f64::from_le_bytes(array8(content))),
            (TEXT_OID, _) => Datum::Text(String::from_utf8(content.to_vec()).map_err(|_| {
                ErrorKind::InternalError("invalid UTF-8 in text datum".to_string())
            })?),
            _ => Datum::Bytes(content.to_vec()),
        };

        Ok(datum)
    }

    /// The value bits of a by-value datum, as stored in a tuple slot.
    pub fn to_value_bits(&self) -> Option<u64> {
        let mut raw = [0_u8; 8];
        let bytes = self.key_bytes()?;
        if bytes.len() > 8 {
            return None;
        }
        raw[..bytes.len()].copy_from_slice(&bytes);
        Some(u64::from_le_bytes(raw))
    }

    /// Reconstructs a by-value datum from the value bits of a tuple slot.
    pub fn from_value_bits(ty: &TypeInfo, bits: u64) -> Result<Datum> {
        if !ty.byval || ty.len <= 0 || ty.len > 8 {
            Err(ErrorKind::InternalError(format!(
                "type {} is not passed by value",
                ty.name
            )))?;
        }
        let raw = bits.to_le_bytes();
        Self::decode(ty, &raw[..ty.len as usize])
    }

    fn to_i64(&self) -> Option<i64> {
        match self {
            Datum::Int2(v) => Some(*v as i64),
            Datum::Int4(v) => Some(*v as i64),
            Datum::Int8(v) => Some(*v),
            _ => None,
        }
    }

    fn to_f64(&self) -> Option<f64> {
        match self {
            Datum::Int2(v) => v.to_f64(),
            Datum::Int4(v) => v.to_f64(),
            Datum::Int8(v) => v.to_f64(),
            Datum::Float4(v) => v.to_f64(),
            Datum::Float8(v) => Some(*v),
            _ => None,
        }
    }

    /// Compares two non-NULL values. Numeric values compare across types.
    pub fn compare(&self, other: &Datum) -> Option<Ordering> {
        match (self, other) {
            (Datum::Null, _) | (_, Datum::Null) => None,
            (Datum::Bool(a), Datum::Bool(b)) => Some(a.cmp(b)),
            (Datum::Text(a), Datum::Text(b)) => Some(a.cmp(b)),
            (Datum::Bytes(a), Datum::Bytes(b)) => Some(a.cmp(b)),
            (a, b) => match (a.to_i64(), b.to_i64()) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => a.to_f64()?.partial_cmp(&b.to_f64()?),
            },
        }
    }

    /// Converts an integer or float result into the representation of `ty`.
    pub fn from_numeric(ty: &TypeInfo, int: Option<i64>, float: f64) -> Result<Datum> {
        let out_of_range =
            || -> crate::error::Error { ErrorKind::Evaluation(format!("{} out of range", ty.name)).into() };

        let datum = match ty.type_id {
            INT2_OID => Datum::Int2(int.and_then(|v| v.to_i16()).ok_or_else(out_of_range)?),
            INT4_OID => Datum::Int4(int.and_then(|v| v.to_i32()).ok_or_else(out_of_range)?),
            INT8_OID => Datum::Int8(int.ok_or_else(out_of_range)?),
            FLOAT4_OID => Datum::Float4(float as f32),
            FLOAT8_OID => Datum::Float8(float),
            _ => Err(ErrorKind::Evaluation(format!(
                "type {} has no arithmetic",
                ty.name
            )))?,
        };

        Ok(datum)
    }

    /// Returns the integer and float views of a numeric value.
    pub fn numeric_parts(&self) -> Option<(Option<i64>, f64)> {
        Some((self.to_i64(), self.to_f64()?))
    }
}

fn array4(b: &[u8]) -> [u8; 4] {
    [b[0], b[1], b[2], b[3]]
}

fn array8(b: &[u8]) -> [u8; 8] {
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}

pub type Row = Vec<Datum>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varlena_encoding_has_length_header() {
        let mut out = Vec::new();
        Datum::Text("abc".to_string())
            .encode(&TypeInfo::text(), &mut out)
            .unwrap();
        assert_eq!(out, vec![3, 0, 0, 0, b'a', b'b', b'c']);
        assert_eq!(Datum::stored_len(&TypeInfo::text(), &out).unwrap(), 7);
        assert_eq!(
            Datum::decode(&TypeInfo::text(), &out).unwrap(),
            Datum::Text("abc".to_string())
        );
    }

    #[test]
    fn key_bytes_exclude_length_header() {
        assert_eq!(
            Datum::Text("ab".to_string()).key_bytes(),
            Some(b"ab".to_vec())
        );
        assert_eq!(Datum::Int4(1).key_bytes(), Some(vec![1, 0, 0, 0]));
        assert_eq!(Datum::Null.key_bytes(), None);
    }

    #[test]
    fn fixed_length_mismatch_is_rejected() {
        let mut out = Vec::new();
        assert!(Datum::Int8(1).encode(&TypeInfo::int4(), &mut out).is_err());
    }

    #[test]
    fn value_bits_preserve_negative_values() {
        let bits = Datum::Int2(-2).to_value_bits().unwrap();
        assert_eq!(
            Datum::from_value_bits(&TypeInfo::int2(), bits).unwrap(),
            Datum::Int2(-2)
        );
    }

    #[test]
    fn numeric_comparison_across_types() {
        assert_eq!(
            Datum::Int4(2).compare(&Datum::Int8(2)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Datum::Int4(1).compare(&Datum::Float8(1.5)),
            Some(Ordering::Less)
        );
        assert_eq!(Datum::Null.compare(&Datum::Int4(1)), None);
    }
}
