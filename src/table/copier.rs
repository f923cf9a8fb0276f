//! Polymorphic column copiers.
//!
//! Each copier materializes one column of a publish batch into its typed
//! output array, applying the backfill and default-fill policy. A cell
//! whose type or shape disagrees with the column's bound type aborts the
//! copy and flags a retype; the serializer then drops the transitional
//! batch and rebuilds the schema before the next publish.
//!
//! Backfill is intentionally asymmetric: a scalar column clears its
//! `last` value after every successful copy, so a missed update shows up
//! as a default-valued gap, while an array column carries `last` across
//! rows. Callers wanting uniform behavior must redefine both copiers.

use std::marker::PhantomData;

use super::{ArrayCell, ColumnData, ColumnState, Shape};
use crate::aligner::SliceBatch;
use crate::value::{ElemType, ValueBuf};

/// Outcome of copying one column of a batch.
pub(crate) enum CopyResult {
    Data(ColumnData),
    /// Type or shape mismatch; the batch must be dropped and the schema
    /// rebuilt.
    Retype,
}

pub(crate) trait ColumnCopier: Send {
    fn copy(&self, batch: &SliceBatch, coln: usize, column: &mut ColumnState) -> CopyResult;
}

/// Maps a Rust element type onto its buffer variant and output column.
pub(crate) trait Element: Copy + Send + 'static {
    const ELEM: ElemType;
    /// Output value for absent cells: 0 for integers, NaN for floats.
    const DEFAULT: Self;

    fn extract(buf: &ValueBuf, idx: usize) -> Self;
    fn column(values: Vec<Self>) -> ColumnData;
}

macro_rules! impl_element {
    ($ty:ty, $elem:ident, $default:expr) => {
        impl Element for $ty {
            const ELEM: ElemType = ElemType::$elem;
            const DEFAULT: Self = $default;

            fn extract(buf: &ValueBuf, idx: usize) -> Self {
                match buf {
                    ValueBuf::$elem(v) => v.get(idx).copied().unwrap_or(Self::DEFAULT),
                    _ => Self::DEFAULT,
                }
            }

            fn column(values: Vec<Self>) -> ColumnData {
                ColumnData::$elem(values)
            }
        }
    };
}

impl_element!(i8, I8, 0);
impl_element!(i16, I16, 0);
impl_element!(i32, I32, 0);
impl_element!(f32, F32, f32::NAN);
impl_element!(f64, F64, f64::NAN);

/// Copier for a scalar column of element type `T`.
pub(crate) struct ScalarCopier<T: Element>(PhantomData<T>);

impl<T: Element> ScalarCopier<T> {
    pub(crate) fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T: Element> ColumnCopier for ScalarCopier<T> {
    fn copy(&self, batch: &SliceBatch, coln: usize, column: &mut ColumnState) -> CopyResult {
        let mut scratch = vec![T::DEFAULT; batch.len()];

        for (r, (_key, cells)) in batch.iter().enumerate() {
            let mut cell = cells[coln].clone();
            if cell.is_none() {
                // Backfill a row the column missed while disconnected.
                cell = column.last.clone();
            }

            let value = match cell {
                Some(v) if v.is_connected() => v,
                _ => {
                    // Disconnected or absent with nothing to backfill;
                    // the default stays in place.
                    column.last = None;
                    continue;
                }
            };

            if value.count != 1 || value.buffer.elem_type() != T::ELEM {
                column.elem = value.buffer.elem_type();
                column.shape = if value.count == 1 {
                    Shape::Scalar
                } else {
                    Shape::Array
                };
                column.last = None;
                return CopyResult::Retype;
            }

            scratch[r] = T::extract(&value.buffer, 0);
            // No backfill from data rows: a missed update must remain
            // visible as a gap.
            column.last = None;
        }

        CopyResult::Data(T::column(scratch))
    }
}

/// Copier for an array column. Accepts any element count; an array column
/// never switches back to scalar.
pub(crate) struct ArrayCopier;

impl ColumnCopier for ArrayCopier {
    fn copy(&self, batch: &SliceBatch, coln: usize, column: &mut ColumnState) -> CopyResult {
        let mut scratch: Vec<Option<ArrayCell>> = vec![None; batch.len()];

        for (r, (_key, cells)) in batch.iter().enumerate() {
            let mut cell = cells[coln].clone();
            if cell.is_none() {
                cell = column.last.clone();
            }

            let value = match cell {
                Some(v) if v.is_connected() => v,
                _ => {
                    column.last = None;
                    continue;
                }
            };

            if value.buffer.elem_type() != column.elem {
                column.elem = value.buffer.elem_type();
                column.last = None;
                return CopyResult::Retype;
            }

            scratch[r] = Some(ArrayCell::from_buf(&value.buffer));
            // Arrays do persist: a disconnected row repeats the previous
            // waveform rather than collapsing to an empty cell.
            column.last = Some(value);
        }

        CopyResult::Data(ColumnData::Array(scratch))
    }
}

/// Bind the copier matching a column's current type and shape.
pub(crate) fn bind_copier(elem: ElemType, shape: Shape) -> Box<dyn ColumnCopier> {
    match shape {
        Shape::Array => Box::new(ArrayCopier),
        Shape::Scalar => match elem {
            ElemType::I8 => Box::new(ScalarCopier::<i8>::new()),
            ElemType::I16 => Box::new(ScalarCopier::<i16>::new()),
            ElemType::I32 => Box::new(ScalarCopier::<i32>::new()),
            ElemType::F32 => Box::new(ScalarCopier::<f32>::new()),
            ElemType::F64 => Box::new(ScalarCopier::<f64>::new()),
        },
    }
}
