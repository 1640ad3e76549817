//! The top level coordinator of a table load.

use std::{collections::BTreeMap, fmt::Display, sync::Arc, time::Duration};

use arrow::{array::BooleanArray, record_batch::RecordBatch};
use futures::future::join_all;
use thiserror::Error;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    buffer::BlockRow,
    client::NodeClientFactory,
    config::{SinkConfig, WriteQuorum},
    dispatch::DispatchPool,
    ids::{LoadId, TabletId},
    index_channel::{IndexChannel, TabletSummary, UnderReplicated},
    node_channel::{ChannelTarget, NodeChannel, NodeChannelStats},
    partition::{
        check_distinct_replicas, ConfigError, PartitionConfig, PartitionError, PartitionResolver,
        TablePartitionParam,
    },
    schema::{SchemaError, TableSchema},
    validate::BlockValidator,
};

/// The outcome of a load, reported on success and failure alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub load_id: LoadId,
    /// Rows of every block passed to [`TableSink::send()`].
    pub rows_total: u64,
    /// Rows routed to their replica channels.
    pub rows_sent: u64,
    /// Rows that failed validation or matched no partition.
    pub rows_filtered: u64,
    /// Valid rows of a block whose send failed before they were routed.
    pub rows_abandoned: u64,
    pub tablets: BTreeMap<TabletId, TabletSummary>,
    pub nodes: Vec<NodeChannelStats>,
}

/// Some tablets were acknowledged by fewer replicas than the write quorum.
#[derive(Debug, Error)]
#[error(
    "{} tablet(s) acknowledged by fewer replicas than the write quorum: {failed:?}",
    .failed.len()
)]
pub struct QuorumError {
    pub failed: Vec<TabletId>,
    pub summary: Box<LoadSummary>,
}

#[derive(Debug, Error, Clone, Copy)]
pub enum OpenError {
    #[error("sink is not prepared")]
    NotPrepared,

    #[error("sink is already open")]
    AlreadyOpen,

    #[error("not enough replicas opened: {0}")]
    IntolerableFailure(UnderReplicated),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("sink is not open")]
    NotOpen,

    #[error("block does not match the table schema: {0}")]
    SchemaMismatch(#[from] SchemaError),

    #[error("too many filtered rows: {filtered} of {total}")]
    TooManyFilteredRows { filtered: u64, total: u64 },

    #[error(transparent)]
    NoPartition(#[from] PartitionError),

    #[error("write quorum lost: {0}")]
    QuorumLost(UnderReplicated),
}

#[derive(Debug, Error)]
pub enum CloseError {
    #[error(transparent)]
    Quorum(#[from] QuorumError),

    #[error("load aborted: {reason}")]
    Aborted {
        reason: String,
        summary: Box<LoadSummary>,
    },

    #[error("sink was never opened")]
    NotOpen,

    #[error("sink is already closed")]
    AlreadyClosed,
}

impl CloseError {
    /// The summary of the load, when it got far enough to have one.
    pub fn summary(&self) -> Option<&LoadSummary> {
        match self {
            Self::Quorum(e) => Some(&e.summary),
            Self::Aborted { summary, .. } => Some(summary),
            Self::NotOpen | Self::AlreadyClosed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Prepared,
    Open,
    Closed,
}

#[derive(Debug)]
struct Prepared {
    schema: Arc<TableSchema>,
    resolver: Arc<dyn PartitionResolver>,
    validator: BlockValidator,
    /// In the order of [`PartitionResolver::indexes()`].
    index_channels: Vec<IndexChannel>,
}

impl Prepared {
    fn node_channels(&self) -> impl Iterator<Item = &Arc<NodeChannel>> + '_ {
        self.index_channels
            .iter()
            .flat_map(|ic| ic.node_channels())
    }

    /// Route the rows of `block` kept by `filter` to their replica channels,
    /// recording progress in `routed`.
    ///
    /// A row either reaches its replicas in every index or, when some tablet
    /// is already below `quorum`, none of them.
    fn route(
        &self,
        block: &Arc<RecordBatch>,
        filter: &BooleanArray,
        config: &SinkConfig,
        load_id: LoadId,
        routed: &mut Routed,
    ) -> Result<(), SendError> {
        let quorum = config.write_quorum;
        for row in (0..block.num_rows()).filter(|r| filter.value(*r)) {
            let resolved = match self.resolver.resolve(block, row) {
                Ok(r) => r,
                Err(e) if config.abort_on_missing_partition => return Err(e.into()),
                Err(e) => {
                    debug!(%load_id, error=%e, "filtered row without partition");
                    routed.no_partition += 1;
                    continue;
                }
            };

            let tablets = || self.index_channels.iter().zip(resolved.tablets);
            for (ic, (_, tablet)) in tablets() {
                let live = ic.live_replicas(*tablet);
                check_quorum(load_id, *tablet, live, quorum.required(ic.replicas(*tablet)))?;
            }

            // A channel failing between the check and the append leaves the
            // row on fewer replicas; it still counts as sent.
            let row_ref = BlockRow::new(Arc::clone(block), row);
            let appended = tablets()
                .map(|(ic, (_, tablet))| {
                    let live = ic.add_row(*tablet, &row_ref);
                    (*tablet, live, quorum.required(ic.replicas(*tablet)))
                })
                .collect::<Vec<_>>();
            routed.sent += 1;
            for (tablet, live, required) in appended {
                check_quorum(load_id, tablet, live, required)?;
            }
        }
        Ok(())
    }
}

fn check_quorum(
    load_id: LoadId,
    tablet: TabletId,
    live: usize,
    required: usize,
) -> Result<(), SendError> {
    if live >= required {
        return Ok(());
    }
    error!(%load_id, %tablet, live, required, "tablet lost its write quorum");
    Err(SendError::QuorumLost(UnderReplicated {
        tablet,
        live,
        required,
    }))
}

#[derive(Debug)]
struct Ticker {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default, Clone, Copy)]
struct RowCounters {
    total: u64,
    sent: u64,
    filtered: u64,
    abandoned: u64,
}

/// How far routing one block got.
#[derive(Debug, Default, Clone, Copy)]
struct Routed {
    sent: usize,
    no_partition: usize,
}

/// Writes the rows of one load to the replicas of their tablets.
///
/// Driven through `prepare → open → send* → close` by a single producer.
/// Network work happens on a background task started by [`Self::open()`]
/// that periodically advances every [`NodeChannel`].
#[derive(Debug)]
pub struct TableSink {
    config: Arc<SinkConfig>,
    clients: Arc<dyn NodeClientFactory>,
    load_id: LoadId,
    sender_id: u32,
    num_senders: u32,

    phase: Phase,
    prepared: Option<Prepared>,
    ticker: Option<Ticker>,
    rows: RowCounters,
}

impl TableSink {
    pub fn new(config: SinkConfig, clients: Arc<dyn NodeClientFactory>) -> Self {
        Self {
            config: Arc::new(config),
            clients,
            load_id: LoadId::new(),
            sender_id: 0,
            num_senders: 1,
            phase: Phase::Created,
            prepared: None,
            ticker: None,
            rows: RowCounters::default(),
        }
    }

    pub fn with_load_id(mut self, load_id: LoadId) -> Self {
        self.load_id = load_id;
        self
    }

    /// Identify this sink as sender `sender_id` of `num_senders` writing the
    /// same load in parallel.
    pub fn with_sender(mut self, sender_id: u32, num_senders: u32) -> Self {
        self.sender_id = sender_id;
        self.num_senders = num_senders.max(1);
        self
    }

    pub fn load_id(&self) -> LoadId {
        self.load_id
    }

    /// Rows filtered so far.
    pub fn rows_filtered(&self) -> u64 {
        self.rows.filtered
    }

    /// Resolve the partitioning metadata and allocate an index channel per
    /// index and a node channel per (index, replica node).
    pub fn prepare(
        &mut self,
        schema: TableSchema,
        partitioning: PartitionConfig,
    ) -> Result<(), ConfigError> {
        if self.phase != Phase::Created {
            return Err(ConfigError::AlreadyPrepared);
        }
        let resolver = TablePartitionParam::new(&schema, partitioning)?;
        self.prepare_with_resolver(schema, Arc::new(resolver))
    }

    /// Like [`Self::prepare()`], routing rows through a caller provided
    /// resolver.
    pub fn prepare_with_resolver(
        &mut self,
        schema: TableSchema,
        resolver: Arc<dyn PartitionResolver>,
    ) -> Result<(), ConfigError> {
        if self.phase != Phase::Created {
            return Err(ConfigError::AlreadyPrepared);
        }
        if self.config.write_quorum == WriteQuorum::Fixed(0) {
            return Err(ConfigError::InvalidQuorum);
        }

        let mut per_index: BTreeMap<_, Vec<_>> = BTreeMap::new();
        for (index_id, tablet) in resolver.tablets() {
            let replicas = match resolver.replicas(tablet) {
                Some(r) if !r.is_empty() => r.to_vec(),
                _ => return Err(ConfigError::NoReplicas(tablet)),
            };
            check_distinct_replicas(tablet, &replicas)?;
            let required = self.config.write_quorum.required(replicas.len());
            if required > replicas.len() {
                return Err(ConfigError::QuorumExceedsReplicas {
                    tablet,
                    replicas: replicas.len(),
                    required,
                });
            }
            per_index
                .entry(index_id)
                .or_default()
                .push((tablet, replicas));
        }

        let schema = Arc::new(schema);
        let arrow_schema = schema.arrow_schema();
        let index_channels = resolver
            .indexes()
            .iter()
            .map(|index_id| {
                let tablets = per_index.remove(index_id).unwrap_or_default();
                IndexChannel::new(*index_id, tablets, |node_id, tablets| {
                    NodeChannel::new(
                        ChannelTarget {
                            load_id: self.load_id,
                            index_id: *index_id,
                            node_id,
                            sender_id: self.sender_id,
                            num_senders: self.num_senders,
                        },
                        tablets,
                        Arc::clone(&arrow_schema),
                        Arc::clone(&self.config),
                        self.clients.client(node_id),
                    )
                })
            })
            .collect::<Vec<_>>();

        let prepared = Prepared {
            validator: BlockValidator::new(Arc::clone(&schema), self.config.filter_policy()),
            schema,
            resolver,
            index_channels,
        };

        info!(
            load_id=%self.load_id,
            sender_id=self.sender_id,
            indexes=prepared.index_channels.len(),
            node_channels=prepared.node_channels().count(),
            "prepared table sink"
        );

        self.prepared = Some(prepared);
        self.phase = Phase::Prepared;
        Ok(())
    }

    /// Open every node channel and start driving them on `pool`.
    ///
    /// Channels that fail their handshake are marked failed; the open only
    /// fails if that leaves some tablet below the write quorum.
    pub async fn open(&mut self, pool: DispatchPool) -> Result<(), OpenError> {
        let prepared = match (self.phase, &self.prepared) {
            (Phase::Prepared, Some(p)) => p,
            (Phase::Created, _) => return Err(OpenError::NotPrepared),
            _ => return Err(OpenError::AlreadyOpen),
        };

        let channels = prepared.node_channels().cloned().collect::<Vec<_>>();
        let results = join_all(channels.iter().map(|ch| ch.open_wait())).await;
        for (ch, res) in channels.iter().zip(&results) {
            if let Err(e) = res {
                warn!(
                    load_id=%self.load_id,
                    node_id=%ch.node_id(),
                    index_id=%ch.index_id(),
                    error=%e,
                    "node channel failed to open"
                );
            }
        }

        if let Some(failure) = prepared
            .index_channels
            .iter()
            .find_map(|ic| ic.find_intolerable_failure(self.config.write_quorum))
        {
            error!(
                load_id=%self.load_id,
                tablet=%failure.tablet,
                live=failure.live,
                required=failure.required,
                "not enough replicas opened"
            );
            channels.iter().for_each(|ch| ch.cancel());
            return Err(OpenError::IntolerableFailure(failure));
        }

        let shutdown = CancellationToken::new();
        let handle = pool.spawn_untracked(drive_channels(
            channels,
            pool.clone(),
            self.config.poll_interval,
            shutdown.clone(),
        ));
        self.ticker = Some(Ticker { shutdown, handle });
        self.phase = Phase::Open;

        info!(load_id=%self.load_id, "opened table sink");
        Ok(())
    }

    /// Validate `block` and route every valid row to the replicas of its
    /// tablet.
    ///
    /// Invalid rows are counted as filtered; the call only fails on a
    /// filtered row density over the configured limit, a schema mismatch, or
    /// a tablet losing its write quorum. Waits, without holding up the
    /// network side, while a node channel has more pending requests than
    /// allowed.
    pub async fn send(&mut self, block: &RecordBatch) -> Result<(), SendError> {
        let prepared = match (self.phase, self.prepared.as_mut()) {
            (Phase::Open, Some(p)) => p,
            _ => return Err(SendError::NotOpen),
        };
        if block.num_rows() == 0 {
            return Ok(());
        }

        let block = Arc::new(prepared.schema.project(block)?);
        let num_rows = block.num_rows();
        self.rows.total += num_rows as u64;

        let outcome = prepared.validator.validate(&block);
        self.rows.filtered += outcome.filtered_rows as u64;
        if !outcome.errors.is_empty() {
            debug!(
                load_id=%self.load_id,
                filtered=outcome.filtered_rows,
                first_error=?outcome.errors[0],
                "filtered invalid rows"
            );
        }
        let kept = num_rows - outcome.filtered_rows;
        if outcome.stop_processing {
            self.rows.abandoned += kept as u64;
            return Err(self.too_many_filtered());
        }

        let mut routed = Routed::default();
        let res = prepared.route(&block, &outcome.filter, &self.config, self.load_id, &mut routed);
        self.rows.sent += routed.sent as u64;
        self.rows.filtered += routed.no_partition as u64;
        self.rows.abandoned += (kept - routed.sent - routed.no_partition) as u64;
        res?;

        if routed.no_partition > 0 && prepared.validator.observe_filtered(routed.no_partition) {
            return Err(self.too_many_filtered());
        }

        for ch in prepared.node_channels() {
            ch.wait_for_capacity().await;
        }
        Ok(())
    }

    /// Finish the load.
    ///
    /// When `status` is an error the load is abandoned: every channel is
    /// cancelled without draining. Otherwise the remaining rows are flushed,
    /// every channel drains until `close_timeout`, and each tablet's
    /// acknowledged replicas are checked against the write quorum.
    pub async fn close<E>(&mut self, status: Result<(), E>) -> Result<LoadSummary, CloseError>
    where
        E: Display + Send,
    {
        let reason = match (self.phase, status) {
            (Phase::Closed, _) => return Err(CloseError::AlreadyClosed),
            (Phase::Created, Ok(())) | (Phase::Prepared, Ok(())) => {
                return Err(CloseError::NotOpen)
            }
            (_, Err(e)) => Some(e.to_string()),
            (Phase::Open, Ok(())) => None,
        };
        self.phase = Phase::Closed;

        if let Some(reason) = reason {
            if let Some(prepared) = &self.prepared {
                prepared.node_channels().for_each(|ch| ch.cancel());
            }
            self.stop_ticker().await;

            let summary = self.summary();
            warn!(load_id=%self.load_id, %reason, "table sink aborted");
            return Err(CloseError::Aborted {
                reason,
                summary: Box::new(summary),
            });
        }

        if let Some(prepared) = &self.prepared {
            let channels = prepared.node_channels().collect::<Vec<_>>();
            channels.iter().for_each(|ch| ch.mark_close());

            let deadline = Instant::now() + self.config.close_timeout;
            let results = join_all(channels.iter().map(|ch| ch.close_wait(deadline))).await;
            for (ch, res) in channels.iter().zip(results) {
                if let Err(e) = res {
                    warn!(
                        load_id=%self.load_id,
                        node_id=%ch.node_id(),
                        index_id=%ch.index_id(),
                        error=%e,
                        "node channel did not close cleanly"
                    );
                }
            }
        }
        self.stop_ticker().await;

        let summary = self.summary();
        let quorum = self.config.write_quorum;
        let failed = summary
            .tablets
            .iter()
            .filter(|(_, t)| t.acked_replicas < quorum.required(t.replicas))
            .map(|(tablet, _)| *tablet)
            .collect::<Vec<_>>();

        if !failed.is_empty() {
            error!(
                load_id=%self.load_id,
                tablets=?failed,
                "tablets below write quorum"
            );
            return Err(QuorumError {
                failed,
                summary: Box::new(summary),
            }
            .into());
        }

        info!(
            load_id=%self.load_id,
            rows_sent=summary.rows_sent,
            rows_filtered=summary.rows_filtered,
            tablets=summary.tablets.len(),
            "closed table sink"
        );
        Ok(summary)
    }

    /// Queue every channel's partially filled buffer for sending now,
    /// instead of waiting for it to reach the flush threshold.
    ///
    /// Lets a driver bound the latency of rows on a slow trickling load.
    pub fn flush(&self) {
        if let (Phase::Open, Some(prepared)) = (self.phase, &self.prepared) {
            prepared.node_channels().for_each(|ch| ch.try_send_block());
        }
    }

    /// A snapshot of the load's progress.
    pub fn summary(&self) -> LoadSummary {
        let (tablets, nodes) = match &self.prepared {
            Some(prepared) => (
                prepared
                    .index_channels
                    .iter()
                    .flat_map(|ic| ic.tablet_summaries())
                    .collect(),
                prepared.node_channels().map(|ch| ch.stats()).collect(),
            ),
            None => Default::default(),
        };

        LoadSummary {
            load_id: self.load_id,
            rows_total: self.rows.total,
            rows_sent: self.rows.sent,
            rows_filtered: self.rows.filtered,
            rows_abandoned: self.rows.abandoned,
            tablets,
            nodes,
        }
    }

    fn too_many_filtered(&self) -> SendError {
        SendError::TooManyFilteredRows {
            filtered: self.rows.filtered,
            total: self.rows.total,
        }
    }

    async fn stop_ticker(&mut self) {
        if let Some(Ticker { shutdown, handle }) = self.ticker.take() {
            shutdown.cancel();
            if let Err(e) = handle.await {
                warn!(load_id=%self.load_id, error=%e, "channel driver task failed");
            }
        }
    }
}

impl Drop for TableSink {
    fn drop(&mut self) {
        if let Some(ticker) = &self.ticker {
            ticker.shutdown.cancel();
        }
    }
}

/// Advance every channel once per `interval` until `shutdown` fires.
async fn drive_channels(
    channels: Vec<Arc<NodeChannel>>,
    pool: DispatchPool,
    interval: Duration,
    shutdown: CancellationToken,
) {
    debug!(channels = channels.len(), "started node channel driver");
    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while !shutdown.is_cancelled() {
        for ch in &channels {
            ch.try_send_and_fetch_status(&pool);
        }

        tokio::select! {
            _ = interval.tick() => {},
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("stopped node channel driver");
}
