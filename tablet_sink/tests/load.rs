use std::{sync::Arc, time::Duration};

use arrow::{
    array::{ArrayRef, Int64Array, StringArray},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use assert_matches::assert_matches;
use tablet_sink::{
    CloseError, ColumnSchema, ColumnType, DispatchPool, IndexId, IndexTablets, NodeId,
    PartitionConfig, PartitionId, PartitionSpec, SendError, SinkConfig, TableSchema, TableSink,
    TabletId, TabletLocation, WriteQuorum,
};

mod common;
use common::{Behaviour, StorageCluster};

const BASE: IndexId = IndexId::new(1);
const ROLLUP: IndexId = IndexId::new(2);

fn schema() -> TableSchema {
    TableSchema::new([
        ColumnSchema::new("id", ColumnType::BigInt).not_null(),
        ColumnSchema::new("day", ColumnType::Int),
        ColumnSchema::new("name", ColumnType::Varchar(16)),
    ])
    .unwrap()
}

fn block(rows: &[(Option<i64>, i64, &str)]) -> RecordBatch {
    // Column order differs from the table schema and carries an extra column.
    RecordBatch::try_new(
        Arc::new(Schema::new(vec![
            Field::new("name", DataType::Utf8, true),
            Field::new("extra", DataType::Int64, true),
            Field::new("day", DataType::Int64, true),
            Field::new("id", DataType::Int64, true),
        ])),
        vec![
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.2))) as ArrayRef,
            Arc::new(Int64Array::from(vec![0; rows.len()])),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.1))),
            Arc::new(Int64Array::from_iter(rows.iter().map(|r| r.0))),
        ],
    )
    .unwrap()
}

/// One unpartitioned tablet of the base index on `nodes`.
fn single_tablet(tablet: TabletId, nodes: &[i64]) -> PartitionConfig {
    PartitionConfig {
        partition_column: None,
        distribution_columns: vec![],
        indexes: vec![BASE],
        partitions: vec![PartitionSpec {
            id: PartitionId::new(1),
            start: None,
            end: None,
            tablets: vec![IndexTablets {
                index_id: BASE,
                tablets: vec![tablet],
            }],
        }],
        locations: vec![TabletLocation {
            tablet_id: tablet,
            node_ids: nodes.iter().map(|n| NodeId::new(*n)).collect(),
        }],
    }
}

/// Days before 100 go to tablets 1/2 (rollup 11/12), the rest to tablets
/// 3/4 (rollup 13/14), bucketed by id. Every tablet has replicas on two of
/// nodes 1 to 3.
fn two_partitions() -> PartitionConfig {
    let partition = |id, start, end, first: i64| PartitionSpec {
        id: PartitionId::new(id),
        start,
        end,
        tablets: vec![
            IndexTablets {
                index_id: BASE,
                tablets: vec![TabletId::new(first), TabletId::new(first + 1)],
            },
            IndexTablets {
                index_id: ROLLUP,
                tablets: vec![TabletId::new(first + 10), TabletId::new(first + 11)],
            },
        ],
    };

    let tablets = [1, 2, 3, 4, 11, 12, 13, 14];
    PartitionConfig {
        partition_column: Some("day".to_string()),
        distribution_columns: vec!["id".to_string()],
        indexes: vec![BASE, ROLLUP],
        partitions: vec![
            partition(1, None, Some(100), 1),
            partition(2, Some(100), None, 3),
        ],
        locations: tablets
            .iter()
            .map(|t| TabletLocation {
                tablet_id: TabletId::new(*t),
                node_ids: vec![NodeId::new(t % 3 + 1), NodeId::new((t + 1) % 3 + 1)],
            })
            .collect(),
    }
}

fn config() -> SinkConfig {
    SinkConfig {
        poll_interval: Duration::from_millis(1),
        retry_backoff: Duration::from_millis(1),
        max_retries: 2,
        close_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn open(cluster: &Arc<StorageCluster>, config: SinkConfig, partitioning: PartitionConfig) -> TableSink {
    let pool = DispatchPool::from_config(&config);
    let mut sink = TableSink::new(config, Arc::clone(cluster) as _);
    sink.prepare(schema(), partitioning).unwrap();
    sink.open(pool).await.unwrap();
    sink
}

#[test_log::test(tokio::test)]
async fn test_three_rows_two_healthy_replicas() {
    tokio::time::pause();
    let cluster = Arc::new(StorageCluster::default());
    let tablet = TabletId::new(7);
    let mut sink = open(&cluster, config(), single_tablet(tablet, &[1, 2])).await;

    sink.send(&block(&[(Some(1), 1, "a"), (Some(2), 1, "b"), (Some(3), 1, "c")]))
        .await
        .unwrap();
    let summary = sink.close(Ok::<_, String>(())).await.unwrap();

    assert_eq!(summary.rows_total, 3);
    assert_eq!(summary.rows_sent, 3);
    assert_eq!(summary.rows_filtered, 0);
    assert_eq!(summary.tablets[&tablet].replicas, 2);
    assert_eq!(summary.tablets[&tablet].acked_replicas, 2);

    for node in [1, 2] {
        assert_eq!(cluster.node(NodeId::new(node)).rows(tablet), vec![1, 2, 3]);
    }
}

#[test_log::test(tokio::test)]
async fn test_null_in_required_column_is_filtered() {
    tokio::time::pause();
    let cluster = Arc::new(StorageCluster::default());
    let tablet = TabletId::new(7);
    let mut sink = open(&cluster, config(), single_tablet(tablet, &[1, 2])).await;

    // Below the filter ratio threshold, so the load carries on.
    sink.send(&block(&[(None, 1, "a")])).await.unwrap();
    assert_eq!(sink.rows_filtered(), 1);

    let summary = sink.close(Ok::<_, String>(())).await.unwrap();
    assert_eq!(summary.rows_filtered, 1);
    assert_eq!(summary.rows_sent, 0);
    assert_eq!(cluster.node(NodeId::new(1)).total_rows(), 0);
    assert_eq!(cluster.node(NodeId::new(2)).total_rows(), 0);
    assert!(summary.nodes.iter().all(|n| n.rows_added == 0));
}

#[test_log::test(tokio::test)]
async fn test_rows_arrive_in_append_order() {
    tokio::time::pause();
    let cluster = Arc::new(StorageCluster::default());
    let mut sink = open(
        &cluster,
        SinkConfig {
            batch_size_rows: 3,
            ..config()
        },
        two_partitions(),
    )
    .await;

    let mut next = 0;
    for _ in 0..10 {
        let rows = (0..7)
            .map(|i| {
                next += 1;
                (Some(next), if i % 2 == 0 { 50 } else { 150 }, "x")
            })
            .collect::<Vec<_>>();
        sink.send(&block(&rows)).await.unwrap();
    }
    let summary = sink.close(Ok::<_, String>(())).await.unwrap();

    assert_eq!(summary.rows_sent, 70);
    assert_eq!(summary.tablets.len(), 8);
    assert!(summary.tablets.values().all(|t| t.acked_replicas == 2));

    let config = two_partitions();
    for location in &config.locations {
        let mut per_replica = location
            .node_ids
            .iter()
            .map(|n| cluster.node(*n).rows(location.tablet_id));
        let first = per_replica.next().unwrap();
        // Same rows on every replica, in ascending (append) order.
        assert!(per_replica.all(|r| r == first));
        assert!(first.windows(2).all(|w| w[0] < w[1]));
    }

    // Every row landed once per index.
    let base_rows = [1, 2, 3, 4]
        .iter()
        .map(|t| {
            let tablet = TabletId::new(*t);
            let node = config
                .locations
                .iter()
                .find(|l| l.tablet_id == tablet)
                .unwrap()
                .node_ids[0];
            cluster.node(node).rows(tablet).len()
        })
        .sum::<usize>();
    assert_eq!(base_rows, 70);
}

#[test_log::test(tokio::test)]
async fn test_silent_replica_fails_only_its_tablet() {
    tokio::time::pause();
    let cluster = Arc::new(StorageCluster::default());
    let mut partitioning = single_tablet(TabletId::new(1), &[1, 2]);
    partitioning.partitions[0].tablets[0]
        .tablets
        .push(TabletId::new(2));
    partitioning.locations.push(TabletLocation {
        tablet_id: TabletId::new(2),
        node_ids: vec![NodeId::new(3), NodeId::new(4)],
    });
    cluster.set_behaviour(NodeId::new(2), Behaviour::Silent);

    let mut sink = open(
        &cluster,
        SinkConfig {
            rpc_timeout: Duration::from_secs(3600),
            ..config()
        },
        partitioning,
    )
    .await;

    let rows = (1..=10).map(|i| (Some(i), 1, "z")).collect::<Vec<_>>();
    sink.send(&block(&rows)).await.unwrap();

    let err = sink.close(Ok::<_, String>(())).await.unwrap_err();
    let summary = err.summary().unwrap().clone();
    assert_matches!(err, CloseError::Quorum(e) => {
        assert_eq!(e.failed, vec![TabletId::new(1)]);
    });

    assert_eq!(summary.tablets[&TabletId::new(1)].acked_replicas, 1);
    assert_eq!(summary.tablets[&TabletId::new(2)].acked_replicas, 2);
    assert_eq!(summary.rows_sent, 10);
    let silent = summary
        .nodes
        .iter()
        .find(|n| n.node_id == NodeId::new(2))
        .unwrap();
    assert!(silent.failure.is_some());
}

#[test_log::test(tokio::test)]
async fn test_failing_replicas_within_quorum() {
    tokio::time::pause();
    let cluster = Arc::new(StorageCluster::default());
    let tablet = TabletId::new(7);
    cluster.set_behaviour(NodeId::new(4), Behaviour::RejectWrites);
    cluster.set_behaviour(NodeId::new(5), Behaviour::Unreachable);

    let mut sink = open(
        &cluster,
        SinkConfig {
            write_quorum: WriteQuorum::Majority,
            ..config()
        },
        single_tablet(tablet, &[1, 2, 3, 4, 5]),
    )
    .await;

    sink.send(&block(&[(Some(1), 1, "a"), (Some(2), 1, "b")]))
        .await
        .unwrap();
    let summary = sink.close(Ok::<_, String>(())).await.unwrap();

    assert_eq!(summary.tablets[&tablet].acked_replicas, 3);
    let node = |id| {
        summary
            .nodes
            .iter()
            .find(|n| n.node_id == NodeId::new(id))
            .unwrap()
    };

    // A rejection is final, a dropped connection is retried.
    let rejected = node(4);
    assert_eq!(rejected.retries, 0);
    assert_eq!(rejected.rows_acked, 0);
    assert!(rejected.failure.is_some());

    let unreachable = node(5);
    assert_eq!(unreachable.retries, 2);
    assert_eq!(unreachable.rows_acked, 0);
    assert!(unreachable.failure.is_some());
}

#[test_log::test(tokio::test)]
async fn test_open_refused_by_one_replica() {
    tokio::time::pause();
    let cluster = Arc::new(StorageCluster::default());
    let tablet = TabletId::new(7);
    cluster.set_behaviour(NodeId::new(2), Behaviour::RefuseOpen);

    let mut sink = TableSink::new(config(), Arc::clone(&cluster) as _);
    sink.prepare(schema(), single_tablet(tablet, &[1, 2, 3])).unwrap();
    sink.open(DispatchPool::new(4)).await.unwrap();

    sink.send(&block(&[(Some(1), 1, "a")])).await.unwrap();
    let summary = sink.close(Ok::<_, String>(())).await.unwrap();
    assert_eq!(summary.tablets[&tablet].acked_replicas, 2);
    assert_eq!(cluster.node(NodeId::new(2)).total_rows(), 0);
}

#[test_log::test(tokio::test)]
async fn test_upstream_failure_cancels_without_draining() {
    tokio::time::pause();
    let cluster = Arc::new(StorageCluster::default());
    let tablet = TabletId::new(7);
    let mut sink = open(&cluster, config(), single_tablet(tablet, &[1, 2])).await;

    sink.send(&block(&[(Some(1), 1, "a")])).await.unwrap();
    let err = sink.close(Err("query cancelled")).await.unwrap_err();

    let summary = assert_matches!(err, CloseError::Aborted { reason, summary } => {
        assert_eq!(reason, "query cancelled");
        summary
    });
    assert_eq!(summary.tablets[&tablet].acked_replicas, 0);
    assert!(summary.nodes.iter().all(|n| n.rows_dropped == 1));

    tokio::time::sleep(Duration::from_millis(10)).await;
    for node in [1, 2] {
        let node = cluster.node(NodeId::new(node));
        assert!(node.cancelled());
        assert_eq!(node.total_rows(), 0);
    }
}

#[test_log::test(tokio::test)]
async fn test_rows_without_partition() {
    tokio::time::pause();
    let cluster = Arc::new(StorageCluster::default());
    let mut partitioning = two_partitions();
    partitioning.partitions.retain(|p| p.id == PartitionId::new(2));

    let mut sink = open(&cluster, config(), partitioning.clone()).await;
    sink.send(&block(&[(Some(1), 50, "a"), (Some(2), 150, "b")]))
        .await
        .unwrap();
    let summary = sink.close(Ok::<_, String>(())).await.unwrap();
    assert_eq!(summary.rows_sent, 1);
    assert_eq!(summary.rows_filtered, 1);

    let mut sink = open(
        &cluster,
        SinkConfig {
            abort_on_missing_partition: true,
            ..config()
        },
        partitioning,
    )
    .await;
    assert_matches!(
        sink.send(&block(&[(Some(1), 50, "a")])).await,
        Err(SendError::NoPartition(_))
    );
}

/// Drives a whole load through the crate level error type, as a load
/// driver would.
async fn run_load(
    cluster: &Arc<StorageCluster>,
    partitioning: PartitionConfig,
    blocks: &[RecordBatch],
) -> tablet_sink::Result<tablet_sink::LoadSummary> {
    let config = config();
    let pool = DispatchPool::from_config(&config);
    let mut sink = TableSink::new(config, Arc::clone(cluster) as _);
    sink.prepare(schema(), partitioning)?;
    sink.open(pool).await?;
    for block in blocks {
        sink.send(block).await?;
    }
    Ok(sink.close(Ok::<_, String>(())).await?)
}

#[test_log::test(tokio::test)]
async fn test_load_driver_error_conversion() {
    tokio::time::pause();
    let cluster = Arc::new(StorageCluster::default());
    let tablet = TabletId::new(5);

    let summary = run_load(
        &cluster,
        single_tablet(tablet, &[1]),
        &[block(&[(Some(1), 1, "a")]), block(&[(Some(2), 1, "b")])],
    )
    .await
    .unwrap();
    assert_eq!(summary.rows_sent, 2);
    assert_eq!(cluster.node(NodeId::new(1)).rows(tablet), vec![1, 2]);

    let mut no_tablets = single_tablet(tablet, &[1]);
    no_tablets.locations.clear();
    let err = run_load(&cluster, no_tablets, &[]).await.unwrap_err();
    assert_matches!(err, tablet_sink::Error::Config(_));

    cluster.set_behaviour(NodeId::new(2), Behaviour::RefuseOpen);
    let err = run_load(&cluster, single_tablet(tablet, &[2]), &[])
        .await
        .unwrap_err();
    assert_matches!(err, tablet_sink::Error::Open(_));
}
