//! Row level validation of projected blocks against the declared table
//! schema.

use std::sync::Arc;

use arrow::{
    array::{Array, BooleanArray, Decimal128Array, Int64Array, StringArray},
    record_batch::RecordBatch,
};
use thiserror::Error;
use tracing::warn;

use crate::schema::{ColumnType, TableSchema};

/// The number of row errors kept in a [`ValidationOutcome`] for diagnostics.
const MAX_REPORTED_ERRORS: usize = 16;

/// Decides when the density of invalid rows is high enough to stop the load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterPolicy {
    pub max_filter_ratio: f64,
    pub filter_ratio_min_rows: u64,
    pub max_filtered_rows: Option<u64>,
}

/// Why a single row was rejected.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RowErrorKind {
    #[error("null value in non-nullable column")]
    NullInRequiredColumn,

    #[error("value {value} out of range for {column_type:?}")]
    IntegerOverflow { value: i64, column_type: ColumnType },

    #[error("string of {len} bytes exceeds declared length {max}")]
    StringTooLong { len: usize, max: usize },

    #[error("decimal value exceeds precision {precision}")]
    DecimalOverflow { precision: u8 },
}

/// A rejected row.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("row {row}, column {column}: {kind}")]
pub struct RowError {
    pub row: usize,
    pub column: String,
    pub kind: RowErrorKind,
}

/// The result of validating one block.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    /// One entry per row, `true` for rows to keep.
    pub filter: BooleanArray,
    pub filtered_rows: usize,
    /// Set when the cumulative filtered row count crossed the
    /// [`FilterPolicy`] threshold.
    pub stop_processing: bool,
    /// The first few row errors of this block.
    pub errors: Vec<RowError>,
}

/// Validates blocks and tracks the cumulative filtered row density of a
/// load.
#[derive(Debug)]
pub struct BlockValidator {
    schema: Arc<TableSchema>,
    policy: FilterPolicy,
    rows_seen: u64,
    rows_filtered: u64,
}

impl BlockValidator {
    pub fn new(schema: Arc<TableSchema>, policy: FilterPolicy) -> Self {
        Self {
            schema,
            policy,
            rows_seen: 0,
            rows_filtered: 0,
        }
    }

    /// Validate `block`, which must already be projected onto the table
    /// schema (see [`TableSchema::project()`]).
    pub fn validate(&mut self, block: &RecordBatch) -> ValidationOutcome {
        let num_rows = block.num_rows();
        let mut keep = vec![true; num_rows];
        let mut errors = Vec::new();

        let mut reject = |row: usize, column: &str, kind: RowErrorKind, keep: &mut [bool]| {
            if !keep[row] {
                // Only the first problem of each row is reported.
                return;
            }
            keep[row] = false;
            if errors.len() < MAX_REPORTED_ERRORS {
                errors.push(RowError {
                    row,
                    column: column.to_string(),
                    kind,
                });
            }
        };

        for (idx, col) in self.schema.columns().iter().enumerate() {
            let array = block.column(idx);

            if !col.nullable && array.null_count() > 0 {
                for row in (0..num_rows).filter(|r| array.is_null(*r)) {
                    reject(row, &col.name, RowErrorKind::NullInRequiredColumn, &mut keep);
                }
            }

            match col.column_type {
                ColumnType::TinyInt | ColumnType::SmallInt | ColumnType::Int => {
                    let (min, max) = match col.column_type {
                        ColumnType::TinyInt => (i8::MIN as i64, i8::MAX as i64),
                        ColumnType::SmallInt => (i16::MIN as i64, i16::MAX as i64),
                        _ => (i32::MIN as i64, i32::MAX as i64),
                    };
                    let Some(values) = array.as_any().downcast_ref::<Int64Array>() else {
                        continue;
                    };
                    for row in 0..num_rows {
                        if values.is_null(row) {
                            continue;
                        }
                        let value = values.value(row);
                        if value < min || value > max {
                            reject(
                                row,
                                &col.name,
                                RowErrorKind::IntegerOverflow {
                                    value,
                                    column_type: col.column_type,
                                },
                                &mut keep,
                            );
                        }
                    }
                }
                ColumnType::Char(max) | ColumnType::Varchar(max) => {
                    let Some(values) = array.as_any().downcast_ref::<StringArray>() else {
                        continue;
                    };
                    for row in 0..num_rows {
                        if values.is_null(row) {
                            continue;
                        }
                        let len = values.value(row).len();
                        if len > max {
                            reject(
                                row,
                                &col.name,
                                RowErrorKind::StringTooLong { len, max },
                                &mut keep,
                            );
                        }
                    }
                }
                ColumnType::Decimal { precision, .. } => {
                    let Some(values) = array.as_any().downcast_ref::<Decimal128Array>() else {
                        continue;
                    };
                    let limit = 10_u128.pow(precision as u32);
                    for row in 0..num_rows {
                        if values.is_null(row) {
                            continue;
                        }
                        if values.value(row).unsigned_abs() >= limit {
                            reject(
                                row,
                                &col.name,
                                RowErrorKind::DecimalOverflow { precision },
                                &mut keep,
                            );
                        }
                    }
                }
                ColumnType::BigInt | ColumnType::Double | ColumnType::Boolean => {}
            }
        }

        let filtered_rows = keep.iter().filter(|k| !**k).count();
        self.rows_seen += num_rows as u64;
        let stop_processing = self.observe_filtered(filtered_rows);

        ValidationOutcome {
            filter: BooleanArray::from(keep),
            filtered_rows,
            stop_processing,
            errors,
        }
    }

    /// Record `rows` additional filtered rows (rows already counted as seen,
    /// but dropped after validation, for example for having no partition).
    ///
    /// Returns true if the load should stop.
    pub fn observe_filtered(&mut self, rows: usize) -> bool {
        self.rows_filtered += rows as u64;

        if let Some(max) = self.policy.max_filtered_rows {
            if self.rows_filtered > max {
                warn!(
                    rows_filtered = self.rows_filtered,
                    max_filtered_rows = max,
                    "filtered row limit exceeded"
                );
                return true;
            }
        }

        if self.rows_seen >= self.policy.filter_ratio_min_rows && self.rows_seen > 0 {
            let ratio = self.rows_filtered as f64 / self.rows_seen as f64;
            if ratio > self.policy.max_filter_ratio {
                warn!(
                    rows_filtered = self.rows_filtered,
                    rows_seen = self.rows_seen,
                    ratio,
                    max_filter_ratio = self.policy.max_filter_ratio,
                    "filtered row ratio exceeded"
                );
                return true;
            }
        }

        false
    }

    pub fn rows_seen(&self) -> u64 {
        self.rows_seen
    }

    pub fn rows_filtered(&self) -> u64 {
        self.rows_filtered
    }
}
