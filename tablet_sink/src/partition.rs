//! Routing of rows to partitions, tablets and replica nodes.

use std::{
    fmt::Debug,
    sync::atomic::{AtomicUsize, Ordering},
};

use arrow::{
    array::{Array, AsArray},
    datatypes::{DataType, Decimal128Type, Float64Type, Int64Type},
    record_batch::RecordBatch,
};
use hashbrown::{HashMap, HashSet};
use thiserror::Error;

use crate::{
    ids::{IndexId, NodeId, PartitionId, TabletId},
    schema::{SchemaError, TableSchema},
};

/// Inconsistent partitioning metadata or schema, detected at prepare time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid table schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("no indexes configured")]
    NoIndexes,

    #[error("no partitions configured")]
    NoPartitions,

    #[error("unknown column {0:?}")]
    UnknownColumn(String),

    #[error("partition column {0:?} is not an integer column")]
    NonIntegerPartitionColumn(String),

    #[error("{0} partitions configured without a partition column")]
    MultiplePartitionsWithoutColumn(usize),

    #[error("partition {partition} has an empty range")]
    EmptyRange { partition: PartitionId },

    #[error("partitions {a} and {b} overlap")]
    Overlap { a: PartitionId, b: PartitionId },

    #[error("partition {partition} has no tablets for index {index}")]
    MissingIndex {
        partition: PartitionId,
        index: IndexId,
    },

    #[error("partition {partition} declares tablets for unknown index {index}")]
    UnknownIndex {
        partition: PartitionId,
        index: IndexId,
    },

    #[error("partition {partition} has no tablets")]
    NoTablets { partition: PartitionId },

    #[error(
        "partition {partition} index {index} has {got} buckets, expected {expected}"
    )]
    BucketMismatch {
        partition: PartitionId,
        index: IndexId,
        expected: usize,
        got: usize,
    },

    #[error("tablet {0} is declared more than once")]
    DuplicateTablet(TabletId),

    #[error("tablet {0} has no replicas")]
    NoReplicas(TabletId),

    #[error("tablet {tablet} lists node {node} as a replica more than once")]
    DuplicateReplica { tablet: TabletId, node: NodeId },

    #[error("tablet {tablet} has {replicas} replica(s) but the write quorum requires {required}")]
    QuorumExceedsReplicas {
        tablet: TabletId,
        replicas: usize,
        required: usize,
    },

    #[error("write quorum must require at least one replica")]
    InvalidQuorum,

    #[error("sink is already prepared")]
    AlreadyPrepared,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PartitionError {
    /// The row's partition key is null or outside every partition range.
    #[error("no partition for row {row} (key {key:?})")]
    NoPartition { row: usize, key: Option<i64> },
}

/// The tablets (buckets) of one index within one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTablets {
    pub index_id: IndexId,
    pub tablets: Vec<TabletId>,
}

/// One range partition, covering keys in `[start, end)`. A missing bound is
/// unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub id: PartitionId,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub tablets: Vec<IndexTablets>,
}

/// The replica nodes of a tablet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletLocation {
    pub tablet_id: TabletId,
    pub node_ids: Vec<NodeId>,
}

/// Partitioning metadata of the destination table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionConfig {
    /// The integer range partition key. When unset the table has exactly one
    /// partition.
    pub partition_column: Option<String>,
    /// Columns hashed to pick a bucket. When empty, rows are spread over the
    /// buckets round-robin.
    pub distribution_columns: Vec<String>,
    pub indexes: Vec<IndexId>,
    pub partitions: Vec<PartitionSpec>,
    pub locations: Vec<TabletLocation>,
}

/// The destination of one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRow<'a> {
    pub partition_id: PartitionId,
    /// One tablet per index, in the order of [`PartitionResolver::indexes()`].
    pub tablets: &'a [(IndexId, TabletId)],
}

/// Maps rows of a projected block to their destination tablets.
pub trait PartitionResolver: Send + Sync + Debug {
    /// Every index rows are written to.
    fn indexes(&self) -> &[IndexId];

    /// Resolve `row` of `block`, which must be projected onto the table
    /// schema the resolver was built for.
    fn resolve(&self, block: &RecordBatch, row: usize) -> Result<ResolvedRow<'_>, PartitionError>;

    /// The replica nodes of `tablet_id`.
    fn replicas(&self, tablet_id: TabletId) -> Option<&[NodeId]>;

    /// Every tablet of every partition, paired with its index.
    fn tablets(&self) -> Vec<(IndexId, TabletId)>;
}

#[derive(Debug)]
struct Partition {
    id: PartitionId,
    start: Option<i64>,
    end: Option<i64>,
    /// Per bucket, the tablet of every index in index order.
    buckets: Vec<Vec<(IndexId, TabletId)>>,
}

impl Partition {
    fn contains(&self, key: i64) -> bool {
        self.start.map_or(true, |s| s <= key) && self.end.map_or(true, |e| key < e)
    }
}

/// Range partitioning with hash (or round-robin) bucketing, built once at
/// prepare time and shared read-only by the sink.
#[derive(Debug)]
pub struct TablePartitionParam {
    indexes: Vec<IndexId>,
    partition_column: Option<usize>,
    distribution_columns: Vec<usize>,
    /// Sorted by start, non-overlapping.
    partitions: Vec<Partition>,
    replicas: HashMap<TabletId, Vec<NodeId>>,
    tablets: Vec<(IndexId, TabletId)>,
    next_bucket: AtomicUsize,
}

impl TablePartitionParam {
    pub fn new(schema: &TableSchema, config: PartitionConfig) -> Result<Self, ConfigError> {
        let PartitionConfig {
            partition_column,
            distribution_columns,
            indexes,
            mut partitions,
            locations,
        } = config;

        if indexes.is_empty() {
            return Err(ConfigError::NoIndexes);
        }
        if partitions.is_empty() {
            return Err(ConfigError::NoPartitions);
        }

        let column = |name: &str| {
            schema
                .column_index(name)
                .ok_or_else(|| ConfigError::UnknownColumn(name.to_string()))
        };

        let partition_column = match partition_column {
            Some(name) => {
                let idx = column(&name)?;
                if !schema.columns()[idx].column_type.is_integer() {
                    return Err(ConfigError::NonIntegerPartitionColumn(name));
                }
                Some(idx)
            }
            None if partitions.len() > 1 => {
                return Err(ConfigError::MultiplePartitionsWithoutColumn(
                    partitions.len(),
                ));
            }
            None => None,
        };

        let distribution_columns = distribution_columns
            .iter()
            .map(|name| column(name))
            .collect::<Result<Vec<_>, _>>()?;

        partitions.sort_by_key(|p| p.start.map_or(i128::MIN, i128::from));
        for p in &partitions {
            if let (Some(s), Some(e)) = (p.start, p.end) {
                if s >= e {
                    return Err(ConfigError::EmptyRange { partition: p.id });
                }
            }
        }
        for pair in partitions.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            let disjoint = match (a.end, b.start) {
                (Some(end), Some(start)) => end <= start,
                _ => false,
            };
            if !disjoint {
                return Err(ConfigError::Overlap { a: a.id, b: b.id });
            }
        }

        let index_set = indexes.iter().copied().collect::<HashSet<_>>();
        let mut seen = HashSet::new();
        let mut tablets = Vec::new();
        let partitions = partitions
            .into_iter()
            .map(|p| {
                if let Some(unknown) = p.tablets.iter().find(|t| !index_set.contains(&t.index_id))
                {
                    return Err(ConfigError::UnknownIndex {
                        partition: p.id,
                        index: unknown.index_id,
                    });
                }

                let per_index = indexes
                    .iter()
                    .map(|index| {
                        p.tablets
                            .iter()
                            .find(|t| t.index_id == *index)
                            .map(|t| t.tablets.as_slice())
                            .ok_or(ConfigError::MissingIndex {
                                partition: p.id,
                                index: *index,
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                let num_buckets = per_index[0].len();
                if num_buckets == 0 {
                    return Err(ConfigError::NoTablets { partition: p.id });
                }

                for (index, buckets) in indexes.iter().zip(&per_index) {
                    if buckets.len() != num_buckets {
                        return Err(ConfigError::BucketMismatch {
                            partition: p.id,
                            index: *index,
                            expected: num_buckets,
                            got: buckets.len(),
                        });
                    }
                    for tablet in buckets.iter() {
                        if !seen.insert(*tablet) {
                            return Err(ConfigError::DuplicateTablet(*tablet));
                        }
                        tablets.push((*index, *tablet));
                    }
                }

                let buckets = (0..num_buckets)
                    .map(|b| {
                        indexes
                            .iter()
                            .zip(&per_index)
                            .map(|(index, buckets)| (*index, buckets[b]))
                            .collect()
                    })
                    .collect();

                Ok(Partition {
                    id: p.id,
                    start: p.start,
                    end: p.end,
                    buckets,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut replicas = locations
            .into_iter()
            .map(|l| (l.tablet_id, l.node_ids))
            .collect::<HashMap<_, _>>();
        replicas.retain(|tablet, _| seen.contains(tablet));
        for (_, tablet) in &tablets {
            match replicas.get(tablet) {
                Some(nodes) if !nodes.is_empty() => check_distinct_replicas(*tablet, nodes)?,
                _ => return Err(ConfigError::NoReplicas(*tablet)),
            }
        }

        Ok(Self {
            indexes,
            partition_column,
            distribution_columns,
            partitions,
            replicas,
            tablets,
            next_bucket: AtomicUsize::new(0),
        })
    }

    fn find_partition(&self, block: &RecordBatch, row: usize) -> Result<&Partition, PartitionError> {
        let Some(idx) = self.partition_column else {
            return self
                .partitions
                .first()
                .ok_or(PartitionError::NoPartition { row, key: None });
        };

        let array = block.column(idx);
        let key = match array.as_primitive_opt::<Int64Type>() {
            Some(keys) if keys.is_valid(row) => keys.value(row),
            _ => return Err(PartitionError::NoPartition { row, key: None }),
        };

        let candidate = self
            .partitions
            .partition_point(|p| p.start.map_or(true, |s| s <= key));
        candidate
            .checked_sub(1)
            .map(|i| &self.partitions[i])
            .filter(|p| p.contains(key))
            .ok_or(PartitionError::NoPartition {
                row,
                key: Some(key),
            })
    }

    fn bucket(&self, block: &RecordBatch, row: usize, num_buckets: usize) -> usize {
        if self.distribution_columns.is_empty() {
            return self.next_bucket.fetch_add(1, Ordering::Relaxed) % num_buckets;
        }

        let mut hasher = crc32fast::Hasher::new();
        for idx in &self.distribution_columns {
            hash_value(&mut hasher, block.column(*idx).as_ref(), row);
        }
        hasher.finalize() as usize % num_buckets
    }
}

impl PartitionResolver for TablePartitionParam {
    fn indexes(&self) -> &[IndexId] {
        &self.indexes
    }

    fn resolve(&self, block: &RecordBatch, row: usize) -> Result<ResolvedRow<'_>, PartitionError> {
        let partition = self.find_partition(block, row)?;
        let bucket = self.bucket(block, row, partition.buckets.len());
        Ok(ResolvedRow {
            partition_id: partition.id,
            tablets: &partition.buckets[bucket],
        })
    }

    fn replicas(&self, tablet_id: TabletId) -> Option<&[NodeId]> {
        self.replicas.get(&tablet_id).map(Vec::as_slice)
    }

    fn tablets(&self) -> Vec<(IndexId, TabletId)> {
        self.tablets.clone()
    }
}

/// Fails if `nodes` names the same node more than once.
pub(crate) fn check_distinct_replicas(tablet: TabletId, nodes: &[NodeId]) -> Result<(), ConfigError> {
    let mut seen = HashSet::with_capacity(nodes.len());
    match nodes.iter().find(|n| !seen.insert(**n)) {
        Some(node) => Err(ConfigError::DuplicateReplica {
            tablet,
            node: *node,
        }),
        None => Ok(()),
    }
}

fn hash_value(hasher: &mut crc32fast::Hasher, array: &dyn Array, row: usize) {
    if array.is_null(row) {
        hasher.update(&[0]);
        return;
    }
    hasher.update(&[1]);

    match array.data_type() {
        DataType::Int64 => hasher.update(&array.as_primitive::<Int64Type>().value(row).to_le_bytes()),
        DataType::Float64 => hasher.update(
            &array
                .as_primitive::<Float64Type>()
                .value(row)
                .to_bits()
                .to_le_bytes(),
        ),
        DataType::Decimal128(_, _) => hasher.update(
            &array
                .as_primitive::<Decimal128Type>()
                .value(row)
                .to_le_bytes(),
        ),
        DataType::Boolean => hasher.update(&[array.as_boolean().value(row) as u8]),
        DataType::Utf8 => {
            // Length prefixed, so adjacent columns cannot shift bytes between them.
            let value = array.as_string::<i32>().value(row);
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Int64Array, StringArray};
    use assert_matches::assert_matches;

    use super::*;
    use crate::schema::{ColumnSchema, ColumnType};

    const BASE: IndexId = IndexId::new(1);
    const ROLLUP: IndexId = IndexId::new(2);

    fn schema() -> TableSchema {
        TableSchema::new([
            ColumnSchema::new("day", ColumnType::Int),
            ColumnSchema::new("user", ColumnType::Varchar(32)),
            ColumnSchema::new("score", ColumnType::Double),
        ])
        .unwrap()
    }

    fn block(days: Vec<Option<i64>>, users: Vec<&str>) -> RecordBatch {
        let scores = arrow::array::Float64Array::from(vec![1.0; days.len()]);
        RecordBatch::try_new(
            schema().arrow_schema(),
            vec![
                Arc::new(Int64Array::from(days)) as ArrayRef,
                Arc::new(StringArray::from(users)),
                Arc::new(scores),
            ],
        )
        .unwrap()
    }

    fn partition(id: i64, start: Option<i64>, end: Option<i64>, first_tablet: i64) -> PartitionSpec {
        PartitionSpec {
            id: PartitionId::new(id),
            start,
            end,
            tablets: vec![
                IndexTablets {
                    index_id: BASE,
                    tablets: vec![TabletId::new(first_tablet), TabletId::new(first_tablet + 1)],
                },
                IndexTablets {
                    index_id: ROLLUP,
                    tablets: vec![
                        TabletId::new(first_tablet + 100),
                        TabletId::new(first_tablet + 101),
                    ],
                },
            ],
        }
    }

    fn locations(partitions: &[PartitionSpec]) -> Vec<TabletLocation> {
        partitions
            .iter()
            .flat_map(|p| p.tablets.iter())
            .flat_map(|t| t.tablets.iter())
            .map(|t| TabletLocation {
                tablet_id: *t,
                node_ids: vec![NodeId::new(1), NodeId::new(2)],
            })
            .collect()
    }

    fn config() -> PartitionConfig {
        let partitions = vec![
            partition(20, Some(100), None, 20),
            partition(10, None, Some(100), 10),
        ];
        PartitionConfig {
            partition_column: Some("day".to_string()),
            distribution_columns: vec!["user".to_string()],
            indexes: vec![BASE, ROLLUP],
            locations: locations(&partitions),
            partitions,
        }
    }

    #[test]
    fn test_range_lookup() {
        let param = TablePartitionParam::new(&schema(), config()).unwrap();
        let b = block(
            vec![Some(-5), Some(99), Some(100), Some(i64::MAX)],
            vec!["a", "a", "a", "a"],
        );

        let got = (0..4)
            .map(|row| param.resolve(&b, row).unwrap().partition_id.get())
            .collect::<Vec<_>>();
        assert_eq!(got, vec![10, 10, 20, 20]);

        let resolved = param.resolve(&b, 0).unwrap();
        assert_eq!(resolved.tablets.len(), 2);
        assert_eq!(resolved.tablets[0].0, BASE);
        assert_eq!(resolved.tablets[1].0, ROLLUP);
        // Both indexes use the same bucket.
        assert_eq!(
            resolved.tablets[1].1.get() - resolved.tablets[0].1.get(),
            100
        );
    }

    #[test]
    fn test_null_or_unmatched_key() {
        let mut cfg = config();
        cfg.partitions.retain(|p| p.id == PartitionId::new(20));
        cfg.locations = locations(&cfg.partitions);
        let param = TablePartitionParam::new(&schema(), cfg).unwrap();

        let b = block(vec![None, Some(3)], vec!["a", "b"]);
        assert_matches!(
            param.resolve(&b, 0),
            Err(PartitionError::NoPartition { row: 0, key: None })
        );
        assert_matches!(
            param.resolve(&b, 1),
            Err(PartitionError::NoPartition {
                row: 1,
                key: Some(3)
            })
        );
    }

    #[test]
    fn test_hash_bucket_is_stable() {
        let param = TablePartitionParam::new(&schema(), config()).unwrap();
        let b = block(
            vec![Some(1), Some(2), Some(3)],
            vec!["alice", "bob", "alice"],
        );

        let t0 = param.resolve(&b, 0).unwrap().tablets[0].1;
        let t2 = param.resolve(&b, 2).unwrap().tablets[0].1;
        assert_eq!(t0, t2);
        assert_eq!(param.resolve(&b, 0).unwrap().tablets[0].1, t0);
    }

    #[test]
    fn test_round_robin_without_distribution_columns() {
        let mut cfg = config();
        cfg.distribution_columns.clear();
        let param = TablePartitionParam::new(&schema(), cfg).unwrap();
        let b = block(vec![Some(1); 4], vec!["a"; 4]);

        let got = (0..4)
            .map(|row| param.resolve(&b, row).unwrap().tablets[0].1.get())
            .collect::<Vec<_>>();
        assert_eq!(got, vec![10, 11, 10, 11]);
    }

    #[test]
    fn test_single_partition_without_column() {
        let mut cfg = config();
        cfg.partition_column = None;
        assert_matches!(
            TablePartitionParam::new(&schema(), cfg.clone()),
            Err(ConfigError::MultiplePartitionsWithoutColumn(2))
        );

        cfg.partitions.truncate(1);
        cfg.locations = locations(&cfg.partitions);
        let param = TablePartitionParam::new(&schema(), cfg).unwrap();
        let b = block(vec![None], vec!["a"]);
        assert_eq!(
            param.resolve(&b, 0).unwrap().partition_id,
            PartitionId::new(20)
        );
    }

    #[test]
    fn test_tablets_and_replicas() {
        let param = TablePartitionParam::new(&schema(), config()).unwrap();
        assert_eq!(param.tablets().len(), 8);
        assert_eq!(
            param.replicas(TabletId::new(10)),
            Some([NodeId::new(1), NodeId::new(2)].as_slice())
        );
        assert_eq!(param.replicas(TabletId::new(999)), None);
    }

    #[test]
    fn test_config_errors() {
        let s = schema();

        let mut cfg = config();
        cfg.indexes.clear();
        assert_matches!(TablePartitionParam::new(&s, cfg), Err(ConfigError::NoIndexes));

        let mut cfg = config();
        cfg.partitions.clear();
        assert_matches!(
            TablePartitionParam::new(&s, cfg),
            Err(ConfigError::NoPartitions)
        );

        let mut cfg = config();
        cfg.partition_column = Some("nope".to_string());
        assert_matches!(
            TablePartitionParam::new(&s, cfg),
            Err(ConfigError::UnknownColumn(c)) if c == "nope"
        );

        let mut cfg = config();
        cfg.partition_column = Some("user".to_string());
        assert_matches!(
            TablePartitionParam::new(&s, cfg),
            Err(ConfigError::NonIntegerPartitionColumn(_))
        );

        let mut cfg = config();
        cfg.partitions[0].start = Some(50);
        assert_matches!(
            TablePartitionParam::new(&s, cfg),
            Err(ConfigError::Overlap { .. })
        );

        let mut cfg = config();
        cfg.partitions[1].end = Some(-10);
        cfg.partitions[1].start = Some(-10);
        assert_matches!(
            TablePartitionParam::new(&s, cfg),
            Err(ConfigError::EmptyRange { .. })
        );

        let mut cfg = config();
        cfg.partitions[0].tablets.pop();
        assert_matches!(
            TablePartitionParam::new(&s, cfg),
            Err(ConfigError::MissingIndex { index, .. }) if index == ROLLUP
        );

        let mut cfg = config();
        cfg.partitions[0].tablets[1].tablets.pop();
        assert_matches!(
            TablePartitionParam::new(&s, cfg),
            Err(ConfigError::BucketMismatch {
                expected: 2,
                got: 1,
                ..
            })
        );

        let mut cfg = config();
        cfg.partitions[0].tablets[0].tablets[0] = TabletId::new(10);
        assert_matches!(
            TablePartitionParam::new(&s, cfg),
            Err(ConfigError::DuplicateTablet(_))
        );

        let mut cfg = config();
        cfg.locations[0].node_ids.clear();
        assert_matches!(
            TablePartitionParam::new(&s, cfg),
            Err(ConfigError::NoReplicas(_))
        );

        let mut cfg = config();
        cfg.locations.pop();
        assert_matches!(
            TablePartitionParam::new(&s, cfg),
            Err(ConfigError::NoReplicas(_))
        );

        let mut cfg = config();
        cfg.locations[0].node_ids = vec![NodeId::new(1), NodeId::new(1)];
        assert_matches!(
            TablePartitionParam::new(&s, cfg),
            Err(ConfigError::DuplicateReplica { node, .. }) if node == NodeId::new(1)
        );
    }

    #[test]
    fn test_string_hash_is_length_prefixed() {
        let row_hash = |a: &str, b: &str| {
            let mut hasher = crc32fast::Hasher::new();
            hash_value(&mut hasher, &StringArray::from(vec![a]), 0);
            hash_value(&mut hasher, &StringArray::from(vec![b]), 0);
            hasher.finalize()
        };
        assert_eq!(row_hash("ab", "c"), row_hash("ab", "c"));
        assert_ne!(row_hash("ab", "c"), row_hash("a", "bc"));
    }
}
