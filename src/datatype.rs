//! # Datatype and Operation Registry
//!
//! `Datatype` is an opaque, `Copy`, value-like descriptor carrying an
//! element size and a kind tag; `Operation` selects a
//! commutative-associative reduction. Neither type owns any resources, so
//! both are cheap to pass by value throughout `collective.rs`.
//!
//! The dynamic-typed reduction of the system this crate replaces dispatched
//! by runtime type checks; here that becomes a
//! static table indexed by `(OpKind, DatatypeKind)`, each kernel a plain
//! function over byte slices reinterpreted as the right primitive type.
//! Unsupported combinations are rejected with [`MpiError::InvalidDatatype`]
//! rather than silently truncating or panicking.

use crate::error::{invalid_datatype, MpiError, Result};

/// Element kind, used to select the right reduction kernel and to render
/// readable names in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatatypeKind {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
    LongDouble,
    Byte,
    Packed,
    Bool,
    ComplexFloat,
    ComplexDouble,
    ComplexLongDouble,
    /// `(i32 value, i32 index)` pair, analogous to MPI's `MPI_2INT`. Only
    /// [`Operation::MinLoc`]/[`Operation::MaxLoc`] apply.
    Int32Int,
    /// `(i64 value, i32 index)` pair, analogous to MPI's `MPI_LONG_INT`.
    Int64Int,
    /// `(f32 value, i32 index)` pair, analogous to MPI's `MPI_FLOAT_INT`.
    Float32Int,
    /// `(f64 value, i32 index)` pair, analogous to MPI's `MPI_DOUBLE_INT`.
    Float64Int,
}

impl DatatypeKind {
    fn name(self) -> &'static str {
        match self {
            DatatypeKind::Int8 => "int8",
            DatatypeKind::Uint8 => "uint8",
            DatatypeKind::Int16 => "int16",
            DatatypeKind::Uint16 => "uint16",
            DatatypeKind::Int32 => "int32",
            DatatypeKind::Uint32 => "uint32",
            DatatypeKind::Int64 => "int64",
            DatatypeKind::Uint64 => "uint64",
            DatatypeKind::Float32 => "float32",
            DatatypeKind::Float64 => "float64",
            DatatypeKind::LongDouble => "long_double",
            DatatypeKind::Byte => "byte",
            DatatypeKind::Packed => "packed",
            DatatypeKind::Bool => "bool",
            DatatypeKind::ComplexFloat => "complex_float",
            DatatypeKind::ComplexDouble => "complex_double",
            DatatypeKind::ComplexLongDouble => "complex_long_double",
            DatatypeKind::Int32Int => "int32_int",
            DatatypeKind::Int64Int => "int64_int",
            DatatypeKind::Float32Int => "float32_int",
            DatatypeKind::Float64Int => "float64_int",
        }
    }
}

/// Opaque datatype descriptor: element size in bytes plus a kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datatype {
    pub(crate) kind: DatatypeKind,
    pub elem_size: usize,
}

macro_rules! predefined_datatype {
    ($name:ident, $kind:expr, $size:expr) => {
        pub const $name: Datatype = Datatype {
            kind: $kind,
            elem_size: $size,
        };
    };
}

impl Datatype {
    predefined_datatype!(INT8, DatatypeKind::Int8, 1);
    predefined_datatype!(UINT8, DatatypeKind::Uint8, 1);
    predefined_datatype!(INT16, DatatypeKind::Int16, 2);
    predefined_datatype!(UINT16, DatatypeKind::Uint16, 2);
    predefined_datatype!(INT32, DatatypeKind::Int32, 4);
    predefined_datatype!(UINT32, DatatypeKind::Uint32, 4);
    predefined_datatype!(INT64, DatatypeKind::Int64, 8);
    predefined_datatype!(UINT64, DatatypeKind::Uint64, 8);
    predefined_datatype!(FLOAT32, DatatypeKind::Float32, 4);
    predefined_datatype!(FLOAT64, DatatypeKind::Float64, 8);
    predefined_datatype!(LONG_DOUBLE, DatatypeKind::LongDouble, 16);
    predefined_datatype!(BYTE, DatatypeKind::Byte, 1);
    predefined_datatype!(PACKED, DatatypeKind::Packed, 1);
    predefined_datatype!(BOOL, DatatypeKind::Bool, 1);
    predefined_datatype!(COMPLEX_FLOAT, DatatypeKind::ComplexFloat, 8);
    predefined_datatype!(COMPLEX_DOUBLE, DatatypeKind::ComplexDouble, 16);
    predefined_datatype!(COMPLEX_LONG_DOUBLE, DatatypeKind::ComplexLongDouble, 32);
    predefined_datatype!(INT32_INT, DatatypeKind::Int32Int, 8);
    predefined_datatype!(INT64_INT, DatatypeKind::Int64Int, 12);
    predefined_datatype!(FLOAT32_INT, DatatypeKind::Float32Int, 8);
    predefined_datatype!(FLOAT64_INT, DatatypeKind::Float64Int, 12);

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Reduction operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Max,
    Min,
    Sum,
    Product,
    LogicalAnd,
    LogicalOr,
    LogicalXor,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    MinLoc,
    MaxLoc,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::Max => "max",
            Operation::Min => "min",
            Operation::Sum => "sum",
            Operation::Product => "product",
            Operation::LogicalAnd => "logical_and",
            Operation::LogicalOr => "logical_or",
            Operation::LogicalXor => "logical_xor",
            Operation::BitwiseAnd => "bitwise_and",
            Operation::BitwiseOr => "bitwise_or",
            Operation::BitwiseXor => "bitwise_xor",
            Operation::MinLoc => "minloc",
            Operation::MaxLoc => "maxloc",
        }
    }
}

/// Fold `src` element-wise into `dst` using `op` over elements of `dtype`.
/// Both slices must have equal length, a multiple of `dtype.elem_size`.
///
/// Every arithmetic operation must apply at least to int32, int64, float32,
/// float64; boolean operations additionally apply to 1-byte
/// bool; `MinLoc`/`MaxLoc` apply to the paired `*_INT` datatypes
/// (`INT32_INT`, `INT64_INT`, `FLOAT32_INT`, `FLOAT64_INT`), each element a
/// `(value, index)` pair rather than a bare scalar. Combinations with no
/// defined semantics (e.g. logical-and on float, MinLoc on a bare int32)
/// fail with `MpiError::InvalidDatatype` rather than guessing.
pub fn reduce_into(dst: &mut [u8], src: &[u8], dtype: Datatype, op: Operation) -> Result<()> {
    if dst.len() != src.len() {
        return Err(MpiError::OperationFailed(
            "reduce buffers must have equal length".to_string(),
        ));
    }
    if dst.len() % dtype.elem_size != 0 {
        return Err(MpiError::OperationFailed(
            "buffer length is not a multiple of the element size".to_string(),
        ));
    }

    macro_rules! numeric_fold {
        ($ty:ty, $from_bytes:ident) => {{
            for chunk_start in (0..dst.len()).step_by(dtype.elem_size) {
                let range = chunk_start..chunk_start + dtype.elem_size;
                let a = <$ty>::from_le_bytes(dst[range.clone()].try_into().unwrap());
                let b = <$ty>::from_le_bytes(src[range.clone()].try_into().unwrap());
                let folded = numeric_op::<$ty>(op, a, b, dtype)?;
                dst[range].copy_from_slice(&folded.to_le_bytes());
            }
            return Ok(());
        }};
    }

    // `(value, index)` pairs for MinLoc/MaxLoc: compare the value half,
    // break ties by keeping the lower index, mirroring conventional MPI
    // MINLOC/MAXLOC semantics.
    macro_rules! loc_fold {
        ($ty:ty) => {{
            if !matches!(op, Operation::MinLoc | Operation::MaxLoc) {
                return Err(invalid_datatype(op.name(), dtype.name()));
            }
            let val_size = std::mem::size_of::<$ty>();
            let elem = val_size + 4;
            for chunk_start in (0..dst.len()).step_by(elem) {
                let val_range = chunk_start..chunk_start + val_size;
                let idx_range = chunk_start + val_size..chunk_start + elem;
                let a_val = <$ty>::from_le_bytes(dst[val_range.clone()].try_into().unwrap());
                let b_val = <$ty>::from_le_bytes(src[val_range.clone()].try_into().unwrap());
                let a_idx = i32::from_le_bytes(dst[idx_range.clone()].try_into().unwrap());
                let b_idx = i32::from_le_bytes(src[idx_range.clone()].try_into().unwrap());
                let take_a = match op {
                    Operation::MinLoc => a_val < b_val || (a_val == b_val && a_idx <= b_idx),
                    Operation::MaxLoc => a_val > b_val || (a_val == b_val && a_idx <= b_idx),
                    _ => unreachable!(),
                };
                let (keep_val, keep_idx) = if take_a { (a_val, a_idx) } else { (b_val, b_idx) };
                dst[val_range].copy_from_slice(&keep_val.to_le_bytes());
                dst[idx_range].copy_from_slice(&keep_idx.to_le_bytes());
            }
            return Ok(());
        }};
    }

    match dtype.kind {
        DatatypeKind::Int8 => numeric_fold!(i8, from_le_bytes),
        DatatypeKind::Uint8 if matches!(op, Operation::LogicalAnd | Operation::LogicalOr | Operation::LogicalXor) => {
            for i in 0..dst.len() {
                let a = dst[i] != 0;
                let b = src[i] != 0;
                dst[i] = (bool_op(op, a, b)?) as u8;
            }
            return Ok(());
        }
        DatatypeKind::Uint8 => numeric_fold!(u8, from_le_bytes),
        DatatypeKind::Int16 => numeric_fold!(i16, from_le_bytes),
        DatatypeKind::Uint16 => numeric_fold!(u16, from_le_bytes),
        DatatypeKind::Int32 => numeric_fold!(i32, from_le_bytes),
        DatatypeKind::Uint32 => numeric_fold!(u32, from_le_bytes),
        DatatypeKind::Int64 => numeric_fold!(i64, from_le_bytes),
        DatatypeKind::Uint64 => numeric_fold!(u64, from_le_bytes),
        DatatypeKind::Float32 => numeric_fold!(f32, from_le_bytes),
        DatatypeKind::Float64 => numeric_fold!(f64, from_le_bytes),
        DatatypeKind::Bool => {
            for i in 0..dst.len() {
                let a = dst[i] != 0;
                let b = src[i] != 0;
                dst[i] = (bool_op(op, a, b)?) as u8;
            }
            Ok(())
        }
        DatatypeKind::Int32Int => loc_fold!(i32),
        DatatypeKind::Int64Int => loc_fold!(i64),
        DatatypeKind::Float32Int => loc_fold!(f32),
        DatatypeKind::Float64Int => loc_fold!(f64),
        other => Err(invalid_datatype(op.name(), other.name())),
    }
}

/// Numeric trait bound shared by every arithmetic-capable kernel below.
trait Numeric: Copy + PartialOrd {
    fn checked_add(self, rhs: Self) -> Self;
    fn checked_mul(self, rhs: Self) -> Self;
    fn bitand(self, rhs: Self) -> Option<Self>;
    fn bitor(self, rhs: Self) -> Option<Self>;
    fn bitxor(self, rhs: Self) -> Option<Self>;
}

macro_rules! impl_numeric_int {
    ($ty:ty) => {
        impl Numeric for $ty {
            fn checked_add(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }
            fn checked_mul(self, rhs: Self) -> Self {
                self.wrapping_mul(rhs)
            }
            fn bitand(self, rhs: Self) -> Option<Self> {
                Some(self & rhs)
            }
            fn bitor(self, rhs: Self) -> Option<Self> {
                Some(self | rhs)
            }
            fn bitxor(self, rhs: Self) -> Option<Self> {
                Some(self ^ rhs)
            }
        }
    };
}

macro_rules! impl_numeric_float {
    ($ty:ty) => {
        impl Numeric for $ty {
            fn checked_add(self, rhs: Self) -> Self {
                self + rhs
            }
            fn checked_mul(self, rhs: Self) -> Self {
                self * rhs
            }
            fn bitand(self, _rhs: Self) -> Option<Self> {
                None
            }
            fn bitor(self, _rhs: Self) -> Option<Self> {
                None
            }
            fn bitxor(self, _rhs: Self) -> Option<Self> {
                None
            }
        }
    };
}

impl_numeric_int!(i8);
impl_numeric_int!(u8);
impl_numeric_int!(i16);
impl_numeric_int!(u16);
impl_numeric_int!(i32);
impl_numeric_int!(u32);
impl_numeric_int!(i64);
impl_numeric_int!(u64);
impl_numeric_float!(f32);
impl_numeric_float!(f64);

fn numeric_op<T: Numeric>(op: Operation, a: T, b: T, dtype: Datatype) -> Result<T> {
    match op {
        Operation::Max => Ok(if a > b { a } else { b }),
        Operation::Min => Ok(if a < b { a } else { b }),
        Operation::Sum => Ok(a.checked_add(b)),
        Operation::Product => Ok(a.checked_mul(b)),
        Operation::BitwiseAnd => a.bitand(b).ok_or_else(|| invalid_datatype(op.name(), dtype.name())),
        Operation::BitwiseOr => a.bitor(b).ok_or_else(|| invalid_datatype(op.name(), dtype.name())),
        Operation::BitwiseXor => a.bitxor(b).ok_or_else(|| invalid_datatype(op.name(), dtype.name())),
        Operation::LogicalAnd | Operation::LogicalOr | Operation::LogicalXor => {
            Err(invalid_datatype(op.name(), dtype.name()))
        }
        Operation::MinLoc | Operation::MaxLoc => {
            Err(invalid_datatype(op.name(), dtype.name()))
        }
    }
}

fn bool_op(op: Operation, a: bool, b: bool) -> Result<bool> {
    match op {
        Operation::LogicalAnd => Ok(a && b),
        Operation::LogicalOr => Ok(a || b),
        Operation::LogicalXor => Ok(a != b),
        Operation::BitwiseAnd => Ok(a && b),
        Operation::BitwiseOr => Ok(a || b),
        Operation::BitwiseXor => Ok(a != b),
        _ => Err(invalid_datatype(op.name(), DatatypeKind::Bool.name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_int32() {
        let mut dst = 3i32.to_le_bytes().to_vec();
        let src = 4i32.to_le_bytes().to_vec();
        reduce_into(&mut dst, &src, Datatype::INT32, Operation::Sum).unwrap();
        assert_eq!(i32::from_le_bytes(dst.try_into().unwrap()), 7);
    }

    #[test]
    fn sum_float64() {
        let mut dst = 1.5f64.to_le_bytes().to_vec();
        let src = 2.25f64.to_le_bytes().to_vec();
        reduce_into(&mut dst, &src, Datatype::FLOAT64, Operation::Sum).unwrap();
        assert_eq!(f64::from_le_bytes(dst.try_into().unwrap()), 3.75);
    }

    #[test]
    fn max_int64_multi_element() {
        let mut dst = Vec::new();
        dst.extend(1i64.to_le_bytes());
        dst.extend(9i64.to_le_bytes());
        let mut src = Vec::new();
        src.extend(5i64.to_le_bytes());
        src.extend(2i64.to_le_bytes());

        reduce_into(&mut dst, &src, Datatype::INT64, Operation::Max).unwrap();
        let first = i64::from_le_bytes(dst[0..8].try_into().unwrap());
        let second = i64::from_le_bytes(dst[8..16].try_into().unwrap());
        assert_eq!(first, 5);
        assert_eq!(second, 9);
    }

    #[test]
    fn logical_and_on_bool() {
        let mut dst = vec![1u8];
        let src = vec![0u8];
        reduce_into(&mut dst, &src, Datatype::BOOL, Operation::LogicalAnd).unwrap();
        assert_eq!(dst[0], 0);
    }

    #[test]
    fn logical_and_on_float_is_invalid_datatype() {
        let mut dst = 1.0f32.to_le_bytes().to_vec();
        let src = 2.0f32.to_le_bytes().to_vec();
        let err = reduce_into(&mut dst, &src, Datatype::FLOAT32, Operation::LogicalAnd).unwrap_err();
        assert!(matches!(err, MpiError::InvalidDatatype { .. }));
    }

    #[test]
    fn bitwise_and_on_float_is_invalid_datatype() {
        let mut dst = 1.0f64.to_le_bytes().to_vec();
        let src = 2.0f64.to_le_bytes().to_vec();
        let err = reduce_into(&mut dst, &src, Datatype::FLOAT64, Operation::BitwiseAnd).unwrap_err();
        assert!(matches!(err, MpiError::InvalidDatatype { .. }));
    }

    #[test]
    fn minloc_int32_keeps_smaller_value_and_its_index() {
        let mut dst = Vec::new();
        dst.extend(9i32.to_le_bytes());
        dst.extend(0i32.to_le_bytes()); // (value=9, index=0)
        let mut src = Vec::new();
        src.extend(3i32.to_le_bytes());
        src.extend(1i32.to_le_bytes()); // (value=3, index=1)

        reduce_into(&mut dst, &src, Datatype::INT32_INT, Operation::MinLoc).unwrap();
        assert_eq!(i32::from_le_bytes(dst[0..4].try_into().unwrap()), 3);
        assert_eq!(i32::from_le_bytes(dst[4..8].try_into().unwrap()), 1);
    }

    #[test]
    fn maxloc_float64_breaks_ties_with_lower_index() {
        let mut dst = Vec::new();
        dst.extend(2.5f64.to_le_bytes());
        dst.extend(4i32.to_le_bytes()); // (value=2.5, index=4)
        let mut src = Vec::new();
        src.extend(2.5f64.to_le_bytes());
        src.extend(1i32.to_le_bytes()); // (value=2.5, index=1), same value, lower index

        reduce_into(&mut dst, &src, Datatype::FLOAT64_INT, Operation::MaxLoc).unwrap();
        assert_eq!(f64::from_le_bytes(dst[0..8].try_into().unwrap()), 2.5);
        assert_eq!(i32::from_le_bytes(dst[8..12].try_into().unwrap()), 1);
    }

    #[test]
    fn minloc_on_bare_int32_is_invalid_datatype() {
        let mut dst = 1i32.to_le_bytes().to_vec();
        let src = 2i32.to_le_bytes().to_vec();
        let err = reduce_into(&mut dst, &src, Datatype::INT32, Operation::MinLoc).unwrap_err();
        assert!(matches!(err, MpiError::InvalidDatatype { .. }));
    }

    #[test]
    fn sum_on_int32_int_pair_is_invalid_datatype() {
        let mut dst = vec![0u8; 8];
        let src = vec![0u8; 8];
        let err = reduce_into(&mut dst, &src, Datatype::INT32_INT, Operation::Sum).unwrap_err();
        assert!(matches!(err, MpiError::InvalidDatatype { .. }));
    }

    #[test]
    fn sum_overflow_saturates_per_platform_wrap() {
        let mut dst = i32::MAX.to_le_bytes().to_vec();
        let src = 1i32.to_le_bytes().to_vec();
        reduce_into(&mut dst, &src, Datatype::INT32, Operation::Sum).unwrap();
        assert_eq!(i32::from_le_bytes(dst.try_into().unwrap()), i32::MIN);
    }
}
