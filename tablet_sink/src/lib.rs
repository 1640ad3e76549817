//! The distributed write path of a table load.
//!
//! A [`TableSink`] accepts validated row blocks from the upstream query / load
//! pipeline and fans every row out to the storage nodes holding a replica of
//! the row's tablet:
//!
//! ```text
//!   block ──► validate ──► partition ──► IndexChannel ──► NodeChannel (node 1)
//!                                                    ├──► NodeChannel (node 2)
//!                                                    └──► NodeChannel (node 3)
//! ```
//!
//! Each [`NodeChannel`] accumulates rows in a columnar [`BlockBuffer`], moves
//! full buffers into a FIFO pending queue and dispatches them one at a time
//! through a [`ReusableRequestSlot`]. A single background task spawned at
//! [`TableSink::open()`] polls every channel, so there is no thread per
//! destination node and the producer calling [`TableSink::send()`] never waits
//! on network I/O (only on flow control when a node falls behind).
//!
//! Shutdown is either a drain ([`NodeChannel::mark_close()`] followed by
//! [`NodeChannel::close_wait()`]) or an abandon ([`NodeChannel::cancel()`]).
//! At close, per-tablet replica acknowledgements are checked against the
//! configured [`WriteQuorum`].

pub mod buffer;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod ids;
pub mod index_channel;
pub mod node_channel;
pub mod partition;
pub mod request;
pub mod schema;
pub mod sink;
pub mod validate;

pub use buffer::{BlockBuffer, BlockRow, BufferError};
pub use client::{NodeClient, NodeClientFactory, RpcError};
pub use config::{SinkConfig, WriteQuorum};
pub use dispatch::{DispatchPool, DispatchToken};
pub use ids::{IndexId, LoadId, NodeId, PartitionId, TabletId};
pub use index_channel::{IndexChannel, TabletSummary, UnderReplicated};
pub use node_channel::{
    ChannelError, ChannelHealth, ChannelState, ChannelTarget, NodeChannel, NodeChannelStats,
};
pub use partition::{
    ConfigError, IndexTablets, PartitionConfig, PartitionError, PartitionResolver, PartitionSpec,
    ResolvedRow, TablePartitionParam, TabletLocation,
};
pub use request::{AddBlockRequest, AddBlockResponse, OpenRequest, ReusableRequestSlot};
pub use schema::{ColumnSchema, ColumnType, SchemaError, TableSchema};
pub use sink::{CloseError, LoadSummary, OpenError, QuorumError, SendError, TableSink};
pub use validate::{BlockValidator, FilterPolicy, ValidationOutcome};

use thiserror::Error;

/// Any error a load driver may observe from a [`TableSink`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid sink configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to open sink: {0}")]
    Open(#[from] OpenError),

    #[error("failed to send block: {0}")]
    Send(#[from] SendError),

    #[error("failed to close sink: {0}")]
    Close(#[from] CloseError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
