//! The RPC surface of a storage node, as seen by a node channel.

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    ids::{IndexId, LoadId, NodeId},
    request::{AddBlockRequest, AddBlockResponse, OpenRequest},
};

/// Errors experienced when calling a storage node.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The connection to the node is not established.
    #[error("node {0} is not connected")]
    NotConnected(NodeId),

    /// The call did not complete within the RPC timeout.
    #[error("rpc timed out after {0:?}")]
    Timeout(Duration),

    /// The node returned an error response.
    #[error("node rejected request: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl RpcError {
    /// Returns true if the call may succeed when repeated. A node's explicit
    /// rejection is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotConnected(_) | Self::Timeout(_) | Self::Transport(_) => true,
            Self::Rejected(_) => false,
        }
    }
}

/// An abstract RPC client for one storage node.
#[async_trait]
pub trait NodeClient: Send + Sync + Debug {
    /// Ask the node to open tablet writers for a load, and wait for it to be
    /// ready.
    async fn open(&self, request: &OpenRequest) -> Result<(), RpcError>;

    /// Send one batch of rows. `column_values` is the Arrow IPC stream of the
    /// rows described by `request`, empty when the request carries none.
    async fn add_block(
        &self,
        request: &AddBlockRequest,
        column_values: &[u8],
    ) -> Result<AddBlockResponse, RpcError>;

    /// Tell the node to abandon the load. Best effort.
    async fn cancel(&self, load_id: LoadId, index_id: IndexId, sender_id: u32)
        -> Result<(), RpcError>;
}

/// Hands out a [`NodeClient`] per destination node.
///
/// Connections are expected to be established lazily; connection failures
/// surface as [`RpcError`]s on the first call.
pub trait NodeClientFactory: Send + Sync + Debug {
    fn client(&self, node_id: NodeId) -> Arc<dyn NodeClient>;
}
