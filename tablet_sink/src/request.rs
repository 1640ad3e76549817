//! Wire level requests and the reusable single in-flight request slot of a
//! node channel.

use std::{sync::Arc, time::Duration};

use arrow::{datatypes::SchemaRef, ipc::writer::StreamWriter, record_batch::RecordBatch};
use futures::FutureExt;
use tokio::{task::JoinHandle, time::Instant};

use crate::{
    buffer::BufferError,
    client::{NodeClient, RpcError},
    dispatch::DispatchToken,
    ids::{IndexId, LoadId, TabletId},
};

/// Handshake asking a node to prepare tablet writers for a load.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub load_id: LoadId,
    pub index_id: IndexId,
    pub sender_id: u32,
    pub num_senders: u32,
    /// Every tablet of `index_id` this node holds a replica of.
    pub tablets: Vec<TabletId>,
    /// Schema of the column values in every following [`AddBlockRequest`].
    pub schema: SchemaRef,
}

/// The header of one batch of rows sent to a node.
///
/// The column values travel next to the header as an Arrow IPC stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddBlockRequest {
    pub load_id: LoadId,
    pub index_id: IndexId,
    pub sender_id: u32,
    /// Per channel sequence number, unchanged across retries of the same
    /// request so the receiver can discard duplicates.
    pub packet_seq: u64,
    /// The destination tablet of each row, in row order.
    pub tablet_ids: Vec<TabletId>,
    /// Marks the last request of the channel.
    pub eos: bool,
}

impl AddBlockRequest {
    pub fn num_rows(&self) -> usize {
        self.tablet_ids.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddBlockResponse {
    /// Tablets the node committed; only populated in response to the eos
    /// request.
    pub committed_tablets: Vec<TabletId>,
}

type DispatchResult = (Vec<u8>, Result<AddBlockResponse, RpcError>);

#[derive(Debug)]
enum SlotState {
    Free,
    /// Serialised and waiting to be (re)dispatched.
    Ready {
        request: Arc<AddBlockRequest>,
        attempts: usize,
        not_before: Option<Instant>,
    },
    InFlight {
        request: Arc<AddBlockRequest>,
        attempts: usize,
        handle: JoinHandle<DispatchResult>,
    },
}

/// Result of polling a [`ReusableRequestSlot`].
#[derive(Debug)]
pub enum SlotPoll {
    /// Nothing is in flight.
    Idle,
    /// A dispatch is still waiting for its response.
    Pending,
    Acked {
        request: Arc<AddBlockRequest>,
        response: AddBlockResponse,
    },
    Failed {
        request: Arc<AddBlockRequest>,
        attempts: usize,
        error: RpcError,
        /// False when the node's answer is final, or when the serialised
        /// payload was lost with the dispatch and the request cannot be sent
        /// again.
        retryable: bool,
    },
}

/// Holds at most one request of a node channel at a time, together with the
/// byte buffer its column values are serialised into.
///
/// The buffer is owned by the slot and lent to the dispatch task for the
/// duration of one RPC, which hands it back with the response; the
/// allocation is reused by every request of the channel. A new request can
/// only be loaded once the previous response was observed.
#[derive(Debug)]
pub struct ReusableRequestSlot {
    column_values: Vec<u8>,
    state: SlotState,
}

impl Default for ReusableRequestSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ReusableRequestSlot {
    pub fn new() -> Self {
        Self {
            column_values: Vec::new(),
            state: SlotState::Free,
        }
    }

    /// Returns true if a new request may be loaded.
    pub fn is_free(&self) -> bool {
        matches!(self.state, SlotState::Free)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, SlotState::InFlight { .. })
    }

    /// Returns true if the loaded request may be dispatched at `now`.
    pub fn is_ready(&self, now: Instant) -> bool {
        match &self.state {
            SlotState::Ready { not_before, .. } => not_before.map_or(true, |t| t <= now),
            _ => false,
        }
    }

    /// Rows of the request held by the slot, if any.
    pub fn rows(&self) -> usize {
        match &self.state {
            SlotState::Free => 0,
            SlotState::Ready { request, .. } | SlotState::InFlight { request, .. } => {
                request.num_rows()
            }
        }
    }

    /// The serialised column values of the loaded request.
    #[cfg(test)]
    pub(crate) fn column_values(&self) -> &[u8] {
        &self.column_values
    }

    /// Serialise `block` into the slot's buffer and hold `request` for
    /// dispatch. An eos request may carry no rows.
    ///
    /// Must only be called while [`Self::is_free()`].
    pub fn load(
        &mut self,
        request: AddBlockRequest,
        block: Option<&RecordBatch>,
    ) -> Result<(), BufferError> {
        debug_assert!(self.is_free(), "loading a busy request slot");

        self.column_values.clear();
        if let Some(block) = block {
            let mut writer = StreamWriter::try_new(&mut self.column_values, &block.schema())?;
            writer.write(block)?;
            writer.finish()?;
        }

        self.state = SlotState::Ready {
            request: Arc::new(request),
            attempts: 0,
            not_before: None,
        };
        Ok(())
    }

    /// Dispatch the loaded request to `client`, consuming `token`.
    ///
    /// The RPC is bounded to `rpc_timeout`. Returns false, dropping the
    /// token, if there is nothing ready to send.
    pub fn dispatch(
        &mut self,
        token: DispatchToken,
        client: Arc<dyn NodeClient>,
        rpc_timeout: Duration,
    ) -> bool {
        let (request, attempts) = match std::mem::replace(&mut self.state, SlotState::Free) {
            SlotState::Ready {
                request, attempts, ..
            } => (request, attempts),
            other => {
                self.state = other;
                return false;
            }
        };

        let column_values = std::mem::take(&mut self.column_values);
        let req = Arc::clone(&request);
        let handle = token.spawn(async move {
            let result =
                match tokio::time::timeout(rpc_timeout, client.add_block(&req, &column_values))
                    .await
                {
                    Ok(v) => v,
                    Err(_) => Err(RpcError::Timeout(rpc_timeout)),
                };
            (column_values, result)
        });

        self.state = SlotState::InFlight {
            request,
            attempts: attempts + 1,
            handle,
        };
        true
    }

    /// Collect the response of the in-flight dispatch without waiting for it.
    ///
    /// Frees the slot once a response was observed; a failed request can be
    /// put back with [`Self::retry()`].
    pub fn poll(&mut self) -> SlotPoll {
        let (request, attempts, mut handle) =
            match std::mem::replace(&mut self.state, SlotState::Free) {
                SlotState::InFlight {
                    request,
                    attempts,
                    handle,
                } => (request, attempts, handle),
                other => {
                    self.state = other;
                    return SlotPoll::Idle;
                }
            };

        let joined = if handle.is_finished() {
            (&mut handle).now_or_never()
        } else {
            None
        };

        match joined {
            None => {
                self.state = SlotState::InFlight {
                    request,
                    attempts,
                    handle,
                };
                SlotPoll::Pending
            }
            Some(Ok((column_values, Ok(response)))) => {
                self.column_values = column_values;
                SlotPoll::Acked { request, response }
            }
            Some(Ok((column_values, Err(error)))) => {
                self.column_values = column_values;
                SlotPoll::Failed {
                    request,
                    attempts,
                    retryable: error.is_retryable(),
                    error,
                }
            }
            Some(Err(e)) => SlotPoll::Failed {
                request,
                attempts,
                error: RpcError::Transport(format!("dispatch task failed: {e}")),
                retryable: false,
            },
        }
    }

    /// Put a failed request back, to be dispatched again no earlier than
    /// `not_before`.
    pub fn retry(&mut self, request: Arc<AddBlockRequest>, attempts: usize, not_before: Instant) {
        debug_assert!(self.is_free(), "retrying into a busy request slot");
        self.state = SlotState::Ready {
            request,
            attempts,
            not_before: Some(not_before),
        };
    }

    /// Drop the held request, aborting it if in flight. Returns the number
    /// of rows dropped.
    pub fn clear(&mut self) -> usize {
        let rows = self.rows();
        if let SlotState::InFlight { handle, .. } = &self.state {
            handle.abort();
        }
        self.state = SlotState::Free;
        self.column_values.clear();
        rows
    }
}
