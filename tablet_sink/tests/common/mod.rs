//! An in-memory storage cluster receiving the writes of a table sink.

use std::{io::Cursor, sync::Arc};

use arrow::{array::AsArray, datatypes::Int64Type, ipc::reader::StreamReader};
use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tablet_sink::{
    AddBlockRequest, AddBlockResponse, IndexId, LoadId, NodeClient, NodeClientFactory, NodeId,
    OpenRequest, RpcError, TabletId,
};

/// How a storage node responds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum Behaviour {
    #[default]
    Healthy,
    /// Rejects the open handshake.
    RefuseOpen,
    /// Rejects every write.
    RejectWrites,
    /// Drops the connection on every write.
    Unreachable,
    /// Never answers a write.
    Silent,
}

#[derive(Debug, Default)]
struct NodeState {
    behaviour: Behaviour,
    opened: HashMap<IndexId, Vec<TabletId>>,
    /// The first column of every received row, per tablet, in arrival order.
    rows: HashMap<TabletId, Vec<i64>>,
    /// Applied (index, packet_seq) pairs.
    applied: HashSet<(IndexId, u64)>,
    cancelled: bool,
}

/// A storage node applying writes in arrival order.
#[derive(Debug)]
pub(crate) struct StorageNode {
    node_id: NodeId,
    state: Mutex<NodeState>,
}

impl StorageNode {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: Mutex::default(),
        }
    }

    pub(crate) fn rows(&self, tablet: TabletId) -> Vec<i64> {
        self.state
            .lock()
            .rows
            .get(&tablet)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn total_rows(&self) -> usize {
        self.state.lock().rows.values().map(Vec::len).sum()
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.state.lock().cancelled
    }
}

#[async_trait]
impl NodeClient for StorageNode {
    async fn open(&self, request: &OpenRequest) -> Result<(), RpcError> {
        let mut state = self.state.lock();
        if state.behaviour == Behaviour::RefuseOpen {
            return Err(RpcError::NotConnected(self.node_id));
        }
        state
            .opened
            .insert(request.index_id, request.tablets.clone());
        Ok(())
    }

    async fn add_block(
        &self,
        request: &AddBlockRequest,
        column_values: &[u8],
    ) -> Result<AddBlockResponse, RpcError> {
        let behaviour = self.state.lock().behaviour;
        match behaviour {
            Behaviour::Healthy | Behaviour::RefuseOpen => {}
            Behaviour::RejectWrites => {
                return Err(RpcError::Rejected("tablet writer closed".to_string()))
            }
            Behaviour::Unreachable => {
                return Err(RpcError::Transport("connection reset".to_string()))
            }
            Behaviour::Silent => futures::future::pending().await,
        }

        let values = if column_values.is_empty() {
            vec![]
        } else {
            StreamReader::try_new(Cursor::new(column_values), None)
                .map_err(|e| RpcError::Rejected(e.to_string()))?
                .map(|batch| {
                    let batch = batch.map_err(|e| RpcError::Rejected(e.to_string()))?;
                    Ok(batch
                        .column(0)
                        .as_primitive::<Int64Type>()
                        .values()
                        .to_vec())
                })
                .collect::<Result<Vec<_>, RpcError>>()?
                .concat()
        };
        assert_eq!(values.len(), request.tablet_ids.len());

        let mut state = self.state.lock();
        if !state.opened.contains_key(&request.index_id) {
            return Err(RpcError::Rejected("load not opened".to_string()));
        }
        if state.applied.insert((request.index_id, request.packet_seq)) {
            for (tablet, value) in request.tablet_ids.iter().zip(values) {
                state.rows.entry(*tablet).or_default().push(value);
            }
        }

        let committed_tablets = if request.eos {
            state.opened[&request.index_id].clone()
        } else {
            vec![]
        };
        Ok(AddBlockResponse { committed_tablets })
    }

    async fn cancel(
        &self,
        _load_id: LoadId,
        _index_id: IndexId,
        _sender_id: u32,
    ) -> Result<(), RpcError> {
        self.state.lock().cancelled = true;
        Ok(())
    }
}

/// Hands out the [`StorageNode`]s of a cluster, creating healthy nodes on
/// first use.
#[derive(Debug, Default)]
pub(crate) struct StorageCluster {
    nodes: Mutex<HashMap<NodeId, Arc<StorageNode>>>,
}

impl StorageCluster {
    pub(crate) fn node(&self, node_id: NodeId) -> Arc<StorageNode> {
        Arc::clone(
            self.nodes
                .lock()
                .entry(node_id)
                .or_insert_with(|| Arc::new(StorageNode::new(node_id))),
        )
    }

    pub(crate) fn set_behaviour(&self, node_id: NodeId, behaviour: Behaviour) {
        self.node(node_id).state.lock().behaviour = behaviour;
    }
}

impl NodeClientFactory for StorageCluster {
    fn client(&self, node_id: NodeId) -> Arc<dyn NodeClient> {
        self.node(node_id)
    }
}
