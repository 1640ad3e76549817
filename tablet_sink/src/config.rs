//! Tunables for a [`TableSink`](crate::TableSink) and its channels.

use std::time::Duration;

use crate::{buffer::BufferLimits, validate::FilterPolicy};

/// The number of replicas of a tablet that must acknowledge a load for the
/// tablet to be considered durably written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteQuorum {
    /// More than half of the replicas.
    #[default]
    Majority,
    /// Every replica.
    All,
    /// A fixed replica count.
    Fixed(usize),
}

impl WriteQuorum {
    /// The number of acknowledgements required for a tablet with `replicas`
    /// replicas.
    pub fn required(&self, replicas: usize) -> usize {
        match self {
            Self::Majority => replicas / 2 + 1,
            Self::All => replicas,
            Self::Fixed(n) => *n,
        }
    }
}

/// Configuration shared read-only by the sink and every channel it owns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkConfig {
    /// Flush a channel's buffer once it holds this many rows.
    pub batch_size_rows: usize,
    /// Flush a channel's buffer once it holds approximately this many bytes.
    pub batch_size_bytes: usize,
    /// Pending requests a channel may queue before the producer is held back.
    pub max_pending_requests: usize,

    /// Bound on a single RPC, including waiting for the response.
    pub rpc_timeout: Duration,
    /// Overall deadline of a channel's open handshake, retries included.
    pub open_timeout: Duration,
    /// Deadline for every channel to drain once the sink closes.
    pub close_timeout: Duration,

    /// Attempts made after the first failure of an RPC before a channel is
    /// failed.
    pub max_retries: usize,
    /// Delay before the first retry; doubled for every following attempt.
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,

    /// Period of the dispatch tick driving every channel.
    pub poll_interval: Duration,
    /// Upper bound on in-flight dispatches across all channels.
    pub dispatch_concurrency: usize,

    /// Fraction of filtered rows above which the load stops.
    pub max_filter_ratio: f64,
    /// Rows that must be seen before `max_filter_ratio` is enforced.
    pub filter_ratio_min_rows: u64,
    /// Absolute cap on filtered rows, if any.
    pub max_filtered_rows: Option<u64>,
    /// Fail the send on a row with no matching partition instead of
    /// filtering it.
    pub abort_on_missing_partition: bool,

    pub write_quorum: WriteQuorum,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size_rows: 4096,
            batch_size_bytes: 8 * 1024 * 1024,
            max_pending_requests: 16,
            rpc_timeout: Duration::from_secs(5),
            open_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(300),
            max_retries: 3,
            retry_backoff: Duration::from_millis(50),
            max_retry_backoff: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
            dispatch_concurrency: 64,
            max_filter_ratio: 0.1,
            filter_ratio_min_rows: 1024,
            max_filtered_rows: None,
            abort_on_missing_partition: false,
            write_quorum: WriteQuorum::Majority,
        }
    }
}

impl SinkConfig {
    pub fn buffer_limits(&self) -> BufferLimits {
        BufferLimits {
            max_rows: self.batch_size_rows.max(1),
            max_bytes: self.batch_size_bytes.max(1),
        }
    }

    pub fn filter_policy(&self) -> FilterPolicy {
        FilterPolicy {
            max_filter_ratio: self.max_filter_ratio,
            filter_ratio_min_rows: self.filter_ratio_min_rows,
            max_filtered_rows: self.max_filtered_rows,
        }
    }

    /// The delay before retry number `attempt` (starting at 1).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(16) as u32;
        self.retry_backoff
            .saturating_mul(1 << shift)
            .min(self.max_retry_backoff)
    }
}
