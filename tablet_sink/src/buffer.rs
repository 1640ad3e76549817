//! Per channel accumulation of rows into size bounded columnar blocks.

use std::sync::Arc;

use arrow::{
    array::UInt32Array,
    compute::{concat_batches, take_record_batch},
    datatypes::SchemaRef,
    error::ArrowError,
    record_batch::RecordBatch,
};
use thiserror::Error;

use crate::ids::TabletId;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("failed to build column values: {0}")]
    Arrow(#[from] ArrowError),
}

/// A reference to one row of a (projected) source block.
#[derive(Debug, Clone)]
pub struct BlockRow {
    block: Arc<RecordBatch>,
    row: usize,
}

impl BlockRow {
    pub fn new(block: Arc<RecordBatch>, row: usize) -> Self {
        debug_assert!(row < block.num_rows());
        Self { block, row }
    }

    pub fn block(&self) -> &Arc<RecordBatch> {
        &self.block
    }

    pub fn row(&self) -> usize {
        self.row
    }
}

/// Flush thresholds of a [`BlockBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub max_rows: usize,
    pub max_bytes: usize,
}

/// A run of rows selected from a single source block.
#[derive(Debug)]
struct Segment {
    block: Arc<RecordBatch>,
    rows: Vec<u32>,
    /// Approximate in-memory size of one row of `block`.
    row_bytes: usize,
}

/// Accumulates the rows destined for one node, in append order.
///
/// Appending only records a reference to the source row; the columnar block
/// is materialised once, by [`BlockBuffer::finish()`], when the buffer is
/// about to be serialised for sending.
#[derive(Debug)]
pub struct BlockBuffer {
    schema: SchemaRef,
    segments: Vec<Segment>,
    tablet_ids: Vec<TabletId>,
    approx_bytes: usize,
}

impl BlockBuffer {
    pub fn new(schema: SchemaRef) -> Self {
        Self {
            schema,
            segments: Vec::new(),
            tablet_ids: Vec::new(),
            approx_bytes: 0,
        }
    }

    /// Append `row`, destined for `tablet_id`.
    pub fn push(&mut self, row: &BlockRow, tablet_id: TabletId) {
        match self.segments.last_mut() {
            Some(segment) if Arc::ptr_eq(&segment.block, &row.block) => {
                segment.rows.push(row.row as u32);
                self.approx_bytes += segment.row_bytes;
            }
            _ => {
                let row_bytes = row.block.get_array_memory_size() / row.block.num_rows().max(1);
                self.segments.push(Segment {
                    block: Arc::clone(&row.block),
                    rows: vec![row.row as u32],
                    row_bytes,
                });
                self.approx_bytes += row_bytes;
            }
        }
        self.tablet_ids.push(tablet_id);
    }

    pub fn num_rows(&self) -> usize {
        self.tablet_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tablet_ids.is_empty()
    }

    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes
    }

    /// Returns true once either limit is reached.
    pub fn is_full(&self, limits: BufferLimits) -> bool {
        self.num_rows() >= limits.max_rows || self.approx_bytes >= limits.max_bytes
    }

    /// The destination tablet of every buffered row, in append order.
    pub fn tablet_ids(&self) -> &[TabletId] {
        &self.tablet_ids
    }

    /// Swap the buffered rows out, leaving an empty buffer in place.
    pub fn take(&mut self) -> Self {
        std::mem::replace(self, Self::new(Arc::clone(&self.schema)))
    }

    /// Materialise the buffered rows into a single block, preserving append
    /// order. Returns [`None`] for an empty buffer.
    pub fn finish(self) -> Result<Option<RecordBatch>, BufferError> {
        if self.is_empty() {
            return Ok(None);
        }

        let parts = self
            .segments
            .iter()
            .map(|s| take_record_batch(&s.block, &UInt32Array::from(s.rows.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(concat_batches(&self.schema, &parts)?))
    }
}
