//! The declared schema of the destination table and the projection of
//! incoming blocks onto it.

use std::sync::Arc;

use arrow::{
    array::{Array, ArrayRef, Decimal128Array},
    datatypes::{DataType, Field, Schema, SchemaRef, DECIMAL128_MAX_PRECISION},
    record_batch::RecordBatch,
};
use thiserror::Error;

/// Errors describing an invalid [`TableSchema`], or a block that does not
/// match it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("table schema has no columns")]
    Empty,

    #[error("column {0} declared more than once")]
    DuplicateColumn(String),

    #[error("column {name} declares invalid decimal({precision}, {scale})")]
    InvalidDecimal { name: String, precision: u8, scale: i8 },

    #[error("column {0} declares a zero length string type")]
    InvalidLength(String),

    #[error("block is missing column {0}")]
    MissingColumn(String),

    #[error("block does not form a valid batch: {0}")]
    InvalidBlock(String),

    #[error("block column {name} has type {got}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: DataType,
        got: DataType,
    },
}

/// The declared type of a table column.
///
/// Integer columns arrive in blocks as `Int64` and are narrowed to their
/// declared width during validation; string and decimal columns carry their
/// declared length / precision limits the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Double,
    Boolean,
    /// Fixed length string, limit in bytes.
    Char(usize),
    /// Variable length string, limit in bytes.
    Varchar(usize),
    Decimal { precision: u8, scale: i8 },
}

impl ColumnType {
    /// The Arrow type this column takes in a projected block.
    pub fn arrow_type(&self) -> DataType {
        match self {
            Self::TinyInt | Self::SmallInt | Self::Int | Self::BigInt => DataType::Int64,
            Self::Double => DataType::Float64,
            Self::Boolean => DataType::Boolean,
            Self::Char(_) | Self::Varchar(_) => DataType::Utf8,
            Self::Decimal { scale, .. } => DataType::Decimal128(DECIMAL128_MAX_PRECISION, *scale),
        }
    }

    /// Returns true if this is one of the integer types.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::TinyInt | Self::SmallInt | Self::Int | Self::BigInt
        )
    }

    fn accepts(&self, got: &DataType) -> bool {
        match (self, got) {
            // Any declared precision is accepted, values are checked per row.
            (Self::Decimal { scale, .. }, DataType::Decimal128(_, s)) => scale == s,
            (_, got) => self.arrow_type() == *got,
        }
    }
}

/// A single declared column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnSchema {
    /// A nullable column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }

    /// Mark this column as required (non-null).
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// The destination table's column set, in table order.
#[derive(Debug, Clone)]
pub struct TableSchema {
    columns: Vec<ColumnSchema>,
    arrow: SchemaRef,
}

impl TableSchema {
    pub fn new(columns: impl IntoIterator<Item = ColumnSchema>) -> Result<Self, SchemaError> {
        let columns = columns.into_iter().collect::<Vec<_>>();
        if columns.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut fields = Vec::with_capacity(columns.len());
        for (i, col) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == col.name) {
                return Err(SchemaError::DuplicateColumn(col.name.clone()));
            }
            match col.column_type {
                ColumnType::Decimal { precision, scale }
                    if precision == 0
                        || precision > DECIMAL128_MAX_PRECISION
                        || scale < 0
                        || scale as u8 > precision =>
                {
                    return Err(SchemaError::InvalidDecimal {
                        name: col.name.clone(),
                        precision,
                        scale,
                    });
                }
                ColumnType::Char(0) | ColumnType::Varchar(0) => {
                    return Err(SchemaError::InvalidLength(col.name.clone()));
                }
                _ => {}
            }
            // Required columns may still hold nulls until validation filters
            // them out, so every projected field is nullable.
            fields.push(Field::new(&col.name, col.column_type.arrow_type(), true));
        }

        Ok(Self {
            columns,
            arrow: Arc::new(Schema::new(fields)),
        })
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    /// Position of the column called `name`, if any.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// The Arrow schema of every projected block, and of the column values
    /// sent to storage nodes.
    pub fn arrow_schema(&self) -> SchemaRef {
        Arc::clone(&self.arrow)
    }

    /// Select the table's columns out of `block` by name, in table order.
    ///
    /// Columns in `block` the table does not declare are ignored.
    pub fn project(&self, block: &RecordBatch) -> Result<RecordBatch, SchemaError> {
        let block_schema = block.schema();
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.columns.len());

        for col in &self.columns {
            let idx = block_schema
                .index_of(&col.name)
                .map_err(|_| SchemaError::MissingColumn(col.name.clone()))?;
            let array = block.column(idx);

            if !col.column_type.accepts(array.data_type()) {
                return Err(SchemaError::TypeMismatch {
                    name: col.name.clone(),
                    expected: col.column_type.arrow_type(),
                    got: array.data_type().clone(),
                });
            }

            let array = match (col.column_type, array.data_type()) {
                (ColumnType::Decimal { scale, .. }, DataType::Decimal128(p, _))
                    if *p != DECIMAL128_MAX_PRECISION =>
                {
                    // Normalise to a single wire type; the declared precision is
                    // enforced row by row during validation.
                    let widened = array
                        .as_any()
                        .downcast_ref::<Decimal128Array>()
                        .map(|a| {
                            a.clone()
                                .with_precision_and_scale(DECIMAL128_MAX_PRECISION, scale)
                        });
                    match widened {
                        Some(Ok(a)) => Arc::new(a) as ArrayRef,
                        _ => {
                            return Err(SchemaError::TypeMismatch {
                                name: col.name.clone(),
                                expected: col.column_type.arrow_type(),
                                got: array.data_type().clone(),
                            })
                        }
                    }
                }
                _ => Arc::clone(array),
            };
            arrays.push(array);
        }

        RecordBatch::try_new(Arc::clone(&self.arrow), arrays)
            .map_err(|e| SchemaError::InvalidBlock(e.to_string()))
    }
}
