//! CLI config for the tablet sink.

use std::time::Duration;

use tablet_sink::{SinkConfig, WriteQuorum};

/// Parsable [`WriteQuorum`]: `majority`, `all` or a replica count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteQuorumArg(WriteQuorum);

impl std::str::FromStr for WriteQuorumArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "majority" => Ok(Self(WriteQuorum::Majority)),
            "all" => Ok(Self(WriteQuorum::All)),
            n => match n.parse::<usize>() {
                Ok(0) => Err("write quorum must be at least 1".to_string()),
                Ok(n) => Ok(Self(WriteQuorum::Fixed(n))),
                Err(_) => Err(format!(
                    "invalid write quorum '{s}', expected 'majority', 'all' or a replica count"
                )),
            },
        }
    }
}

impl From<WriteQuorumArg> for WriteQuorum {
    fn from(v: WriteQuorumArg) -> Self {
        v.0
    }
}

/// CLI config for the tablet sink.
#[derive(Debug, Clone, clap::Parser)]
#[allow(missing_copy_implementations)]
pub struct TabletSinkConfig {
    /// Flush a node channel's buffer once it holds this many rows.
    #[clap(
        long = "tablet-sink-batch-size-rows",
        env = "TABLET_SINK_BATCH_SIZE_ROWS",
        default_value = "4096",
        action
    )]
    pub batch_size_rows: usize,

    /// Flush a node channel's buffer once it holds approximately this many
    /// bytes.
    #[clap(
        long = "tablet-sink-batch-size-bytes",
        env = "TABLET_SINK_BATCH_SIZE_BYTES",
        default_value = "8388608",
        action
    )]
    pub batch_size_bytes: usize,

    /// The number of flushed requests a node channel may queue before the
    /// producer is held back.
    #[clap(
        long = "tablet-sink-max-pending-requests",
        env = "TABLET_SINK_MAX_PENDING_REQUESTS",
        default_value = "16",
        action
    )]
    pub max_pending_requests: usize,

    /// Timeout of a single RPC to a storage node.
    #[clap(
        long = "tablet-sink-rpc-timeout",
        env = "TABLET_SINK_RPC_TIMEOUT",
        default_value = "5s",
        value_parser = humantime::parse_duration,
    )]
    pub rpc_timeout: Duration,

    /// Overall deadline of the open handshake with a storage node, retries
    /// included.
    #[clap(
        long = "tablet-sink-open-timeout",
        env = "TABLET_SINK_OPEN_TIMEOUT",
        default_value = "60s",
        value_parser = humantime::parse_duration,
    )]
    pub open_timeout: Duration,

    /// Deadline for every node channel to drain when the load closes.
    #[clap(
        long = "tablet-sink-close-timeout",
        env = "TABLET_SINK_CLOSE_TIMEOUT",
        default_value = "300s",
        value_parser = humantime::parse_duration,
    )]
    pub close_timeout: Duration,

    /// Retries of a failed RPC before the node channel is failed.
    #[clap(
        long = "tablet-sink-max-retries",
        env = "TABLET_SINK_MAX_RETRIES",
        default_value = "3",
        action
    )]
    pub max_retries: usize,

    /// Delay before the first retry, doubled for every following one.
    #[clap(
        long = "tablet-sink-retry-backoff",
        env = "TABLET_SINK_RETRY_BACKOFF",
        default_value = "50ms",
        value_parser = humantime::parse_duration,
    )]
    pub retry_backoff: Duration,

    /// Upper bound of the retry delay.
    #[clap(
        long = "tablet-sink-max-retry-backoff",
        env = "TABLET_SINK_MAX_RETRY_BACKOFF",
        default_value = "5s",
        value_parser = humantime::parse_duration,
    )]
    pub max_retry_backoff: Duration,

    /// Period at which every node channel is polled and dispatched.
    #[clap(
        long = "tablet-sink-poll-interval",
        env = "TABLET_SINK_POLL_INTERVAL",
        default_value = "5ms",
        value_parser = humantime::parse_duration,
    )]
    pub poll_interval: Duration,

    /// Maximum number of RPCs in flight across all node channels.
    #[clap(
        long = "tablet-sink-dispatch-concurrency",
        env = "TABLET_SINK_DISPATCH_CONCURRENCY",
        default_value = "64",
        action
    )]
    pub dispatch_concurrency: usize,

    /// Fraction of filtered rows above which the load is stopped.
    #[clap(
        long = "tablet-sink-max-filter-ratio",
        env = "TABLET_SINK_MAX_FILTER_RATIO",
        default_value = "0.1",
        action
    )]
    pub max_filter_ratio: f64,

    /// Rows that must be seen before the filter ratio is enforced.
    #[clap(
        long = "tablet-sink-filter-ratio-min-rows",
        env = "TABLET_SINK_FILTER_RATIO_MIN_ROWS",
        default_value = "1024",
        action
    )]
    pub filter_ratio_min_rows: u64,

    /// Absolute limit of filtered rows. Unlimited when unset.
    #[clap(
        long = "tablet-sink-max-filtered-rows",
        env = "TABLET_SINK_MAX_FILTERED_ROWS",
        action
    )]
    pub max_filtered_rows: Option<u64>,

    /// Fail the load on a row that matches no partition instead of filtering
    /// it.
    #[clap(
        long = "tablet-sink-abort-on-missing-partition",
        env = "TABLET_SINK_ABORT_ON_MISSING_PARTITION",
        default_value = "false",
        action
    )]
    pub abort_on_missing_partition: bool,

    /// Replica acknowledgements required per tablet: `majority`, `all` or a
    /// replica count.
    #[clap(
        long = "tablet-sink-write-quorum",
        env = "TABLET_SINK_WRITE_QUORUM",
        default_value = "majority",
        action
    )]
    pub write_quorum: WriteQuorumArg,
}

impl From<TabletSinkConfig> for SinkConfig {
    fn from(c: TabletSinkConfig) -> Self {
        Self {
            batch_size_rows: c.batch_size_rows,
            batch_size_bytes: c.batch_size_bytes,
            max_pending_requests: c.max_pending_requests,
            rpc_timeout: c.rpc_timeout,
            open_timeout: c.open_timeout,
            close_timeout: c.close_timeout,
            max_retries: c.max_retries,
            retry_backoff: c.retry_backoff,
            max_retry_backoff: c.max_retry_backoff,
            poll_interval: c.poll_interval,
            dispatch_concurrency: c.dispatch_concurrency,
            max_filter_ratio: c.max_filter_ratio,
            filter_ratio_min_rows: c.filter_ratio_min_rows,
            max_filtered_rows: c.max_filtered_rows,
            abort_on_missing_partition: c.abort_on_missing_partition,
            write_quorum: c.write_quorum.into(),
        }
    }
}
