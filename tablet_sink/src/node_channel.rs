//! The pipeline of buffered writes to a single storage node.
//!
//! ```text
//!            add_row           try_send_and_fetch_status
//!   rows ──► BlockBuffer ──► pending (FIFO) ──► ReusableRequestSlot ──► node
//!              (flush when full)                  (one request in flight)
//! ```
//!
//! State machine:
//!
//! ```text
//!   Open ──► Sending ◄──► WaitingAck
//!     │         │              │
//!     └─────────┴──────┬───────┘
//!          mark_close  ▼
//!                   Closing ──► Closed
//!
//!   cancel: any non-terminal state ──► Cancelled
//! ```
//!
//! A channel that exhausts its retry budget is marked failed: its queued data
//! is dropped, it stops accepting rows, and [`NodeChannel::mark_close()`]
//! takes it straight to `Closed` so shutdown always terminates.

use std::{collections::VecDeque, sync::Arc};

use arrow::datatypes::SchemaRef;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{watch, Notify},
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    buffer::{BlockBuffer, BlockRow, BufferError},
    client::{NodeClient, RpcError},
    config::SinkConfig,
    dispatch::DispatchPool,
    ids::{IndexId, LoadId, NodeId, TabletId},
    request::{AddBlockRequest, OpenRequest, ReusableRequestSlot, SlotPoll},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Accepting rows, nothing queued for sending.
    Open,
    /// Requests are queued and waiting for dispatch.
    Sending,
    /// A request is in flight.
    WaitingAck,
    /// No longer accepting rows; draining queued requests.
    Closing,
    /// Every request, including the final one, was acknowledged (or the
    /// channel failed).
    Closed,
    /// Abandoned without waiting for outstanding requests.
    Cancelled,
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }
}

/// Summary returned from [`NodeChannel::try_send_and_fetch_status()`] for the
/// caller's polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelHealth {
    /// Nothing queued or in flight.
    Idle,
    /// Requests are queued or in flight.
    Busy,
    /// Reached a terminal state.
    Finished,
    /// Permanently failed.
    Failed,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("opening node {node_id} failed after {attempts} attempt(s): {source}")]
    Open {
        node_id: NodeId,
        attempts: usize,
        source: RpcError,
    },

    #[error("sending to node {node_id} failed after {attempts} attempt(s): {source}")]
    Send {
        node_id: NodeId,
        attempts: usize,
        source: RpcError,
    },

    #[error("failed to build request for node {node_id}: {source}")]
    Buffer {
        node_id: NodeId,
        source: BufferError,
    },

    #[error("channel to node {node_id} did not close before the deadline")]
    CloseTimeout { node_id: NodeId },

    #[error("channel to node {node_id} was cancelled")]
    Cancelled { node_id: NodeId },

    #[error("channel to node {node_id} is {state:?} and not accepting rows")]
    NotAccepting { node_id: NodeId, state: ChannelState },

    #[error("channel to node {node_id} failed: {reason}")]
    Failed { node_id: NodeId, reason: String },
}

/// The identity of a node channel within a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTarget {
    pub load_id: LoadId,
    pub index_id: IndexId,
    pub node_id: NodeId,
    /// This sender's position among all senders of the load.
    pub sender_id: u32,
    pub num_senders: u32,
}

/// A point-in-time view of a channel's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeChannelStats {
    pub node_id: NodeId,
    pub index_id: IndexId,
    pub state: ChannelState,
    /// Rows accepted by [`NodeChannel::add_row()`].
    pub rows_added: u64,
    /// Rows buffered, queued or in flight.
    pub rows_pending: u64,
    pub rows_acked: u64,
    /// Rows discarded by cancellation or failure.
    pub rows_dropped: u64,
    pub requests_dispatched: u64,
    pub requests_acked: u64,
    pub retries: u64,
    pub failure: Option<String>,
}

#[derive(Debug)]
struct PendingBlock {
    buffer: BlockBuffer,
    request: AddBlockRequest,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    rows_added: u64,
    rows_acked: u64,
    rows_dropped: u64,
    requests_dispatched: u64,
    requests_acked: u64,
    retries: u64,
}

#[derive(Debug)]
struct Inner {
    state: ChannelState,
    buffer: BlockBuffer,
    pending: VecDeque<PendingBlock>,
    slot: ReusableRequestSlot,
    next_packet_seq: u64,
    failure: Option<String>,
    committed_tablets: Vec<TabletId>,
    counters: Counters,
}

impl Inner {
    fn rows_pending(&self) -> usize {
        self.buffer.num_rows()
            + self
                .pending
                .iter()
                .map(|p| p.buffer.num_rows())
                .sum::<usize>()
            + self.slot.rows()
    }

    /// Drop every buffered, queued and in-flight row.
    fn clear(&mut self) -> usize {
        let mut dropped = self.buffer.take().num_rows();
        dropped += self
            .pending
            .drain(..)
            .map(|p| p.buffer.num_rows())
            .sum::<usize>();
        dropped += self.slot.clear();
        self.counters.rows_dropped += dropped as u64;
        dropped
    }
}

/// Buffers rows for one destination node and sends them, in order, one
/// request at a time.
///
/// The producer side ([`Self::add_row()`]) never waits on the network; the
/// network side is advanced exclusively by
/// [`Self::try_send_and_fetch_status()`], which a scheduler calls
/// periodically. All methods take `&self` and may be called from different
/// tasks.
#[derive(Debug)]
pub struct NodeChannel {
    target: ChannelTarget,
    tablets: Vec<TabletId>,
    schema: SchemaRef,
    config: Arc<SinkConfig>,
    client: Arc<dyn NodeClient>,

    inner: Mutex<Inner>,
    state_tx: watch::Sender<ChannelState>,
    /// Signalled whenever the pending queue shrinks.
    space_available: Notify,
}

impl NodeChannel {
    /// Initialise a channel to `target.node_id` for `tablets`, allocating its
    /// buffer and request slot. The channel starts [`ChannelState::Open`].
    pub fn new(
        target: ChannelTarget,
        tablets: Vec<TabletId>,
        schema: SchemaRef,
        config: Arc<SinkConfig>,
        client: Arc<dyn NodeClient>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Open);
        let inner = Inner {
            state: ChannelState::Open,
            buffer: BlockBuffer::new(Arc::clone(&schema)),
            pending: VecDeque::new(),
            slot: ReusableRequestSlot::new(),
            next_packet_seq: 0,
            failure: None,
            committed_tablets: Vec::new(),
            counters: Counters::default(),
        };

        Self {
            target,
            tablets,
            schema,
            config,
            client,
            inner: Mutex::new(inner),
            state_tx,
            space_available: Notify::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.target.node_id
    }

    pub fn index_id(&self) -> IndexId {
        self.target.index_id
    }

    /// The tablets this channel carries replicas of.
    pub fn tablets(&self) -> &[TabletId] {
        &self.tablets
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    pub fn is_failed(&self) -> bool {
        self.inner.lock().failure.is_some()
    }

    /// Returns true if the channel can still deliver rows.
    pub fn is_healthy(&self) -> bool {
        let inner = self.inner.lock();
        inner.failure.is_none() && inner.state != ChannelState::Cancelled
    }

    /// The tablets the node committed, once the channel closed successfully.
    pub fn committed_tablets(&self) -> Vec<TabletId> {
        let inner = self.inner.lock();
        if inner.state == ChannelState::Closed && inner.failure.is_none() {
            inner.committed_tablets.clone()
        } else {
            vec![]
        }
    }

    pub fn stats(&self) -> NodeChannelStats {
        let inner = self.inner.lock();
        NodeChannelStats {
            node_id: self.target.node_id,
            index_id: self.target.index_id,
            state: inner.state,
            rows_added: inner.counters.rows_added,
            rows_pending: inner.rows_pending() as u64,
            rows_acked: inner.counters.rows_acked,
            rows_dropped: inner.counters.rows_dropped,
            requests_dispatched: inner.counters.requests_dispatched,
            requests_acked: inner.counters.requests_acked,
            retries: inner.counters.retries,
            failure: inner.failure.clone(),
        }
    }

    /// Perform the open handshake, waiting for the node to be ready to
    /// receive the load.
    ///
    /// Failed attempts are retried with exponential backoff up to
    /// `max_retries` times within `open_timeout`, after which the channel is
    /// marked failed.
    pub async fn open_wait(&self) -> Result<(), ChannelError> {
        let node_id = self.target.node_id;
        let request = OpenRequest {
            load_id: self.target.load_id,
            index_id: self.target.index_id,
            sender_id: self.target.sender_id,
            num_senders: self.target.num_senders,
            tablets: self.tablets.clone(),
            schema: Arc::clone(&self.schema),
        };
        let deadline = Instant::now() + self.config.open_timeout;

        let mut attempts = 0;
        loop {
            if self.state() == ChannelState::Cancelled {
                return Err(ChannelError::Cancelled { node_id });
            }

            attempts += 1;
            let rpc_timeout = self.config.rpc_timeout;
            let e = match tokio::time::timeout(rpc_timeout, self.client.open(&request)).await {
                Ok(Ok(())) => {
                    info!(
                        %node_id,
                        index_id=%self.target.index_id,
                        tablets=self.tablets.len(),
                        attempts,
                        "opened node channel"
                    );
                    return Ok(());
                }
                Ok(Err(e)) => e,
                Err(_) => RpcError::Timeout(rpc_timeout),
            };

            let delay = self.config.backoff(attempts);
            if attempts > self.config.max_retries || Instant::now() + delay >= deadline {
                let err = ChannelError::Open {
                    node_id,
                    attempts,
                    source: e,
                };
                self.fail(err.to_string());
                return Err(err);
            }

            warn!(%node_id, error=%e, attempts, ?delay, "failed to open node channel, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    /// Append one row destined for `tablet_id`.
    ///
    /// Once the buffer reaches its flush threshold it is moved into the
    /// pending queue together with a freshly built request header. This call
    /// never waits on network I/O.
    pub fn add_row(&self, row: &BlockRow, tablet_id: TabletId) -> Result<(), ChannelError> {
        let node_id = self.target.node_id;
        let mut inner = self.inner.lock();

        if let Some(reason) = &inner.failure {
            return Err(ChannelError::Failed {
                node_id,
                reason: reason.clone(),
            });
        }
        match inner.state {
            ChannelState::Closing | ChannelState::Closed | ChannelState::Cancelled => {
                return Err(ChannelError::NotAccepting {
                    node_id,
                    state: inner.state,
                });
            }
            ChannelState::Open | ChannelState::Sending | ChannelState::WaitingAck => {}
        }

        inner.buffer.push(row, tablet_id);
        inner.counters.rows_added += 1;
        if inner.buffer.is_full(self.config.buffer_limits()) {
            self.enqueue_buffer(&mut inner, false);
        }
        Ok(())
    }

    /// Move the current buffer into the pending queue without waiting for
    /// the flush threshold. Does nothing for an empty buffer.
    pub fn try_send_block(&self) {
        let mut inner = self.inner.lock();
        if inner.failure.is_some() || inner.buffer.is_empty() {
            return;
        }
        if matches!(
            inner.state,
            ChannelState::Open | ChannelState::Sending | ChannelState::WaitingAck
        ) {
            self.enqueue_buffer(&mut inner, false);
        }
    }

    /// Advance the channel without blocking: collect the response of the
    /// in-flight request, if it arrived, then dispatch the oldest pending
    /// request if the request slot is free and `pool` has a token to spare.
    ///
    /// A failed request is retried after a backoff until `max_retries` is
    /// exhausted, at which point the channel is failed.
    pub fn try_send_and_fetch_status(&self, pool: &DispatchPool) -> ChannelHealth {
        let node_id = self.target.node_id;
        let mut inner = self.inner.lock();

        if inner.failure.is_some() {
            return ChannelHealth::Failed;
        }
        if inner.state.is_terminal() {
            return ChannelHealth::Finished;
        }

        match inner.slot.poll() {
            SlotPoll::Idle | SlotPoll::Pending => {}
            SlotPoll::Acked { request, response } => {
                inner.counters.requests_acked += 1;
                inner.counters.rows_acked += request.num_rows() as u64;
                if request.eos {
                    inner.committed_tablets = response.committed_tablets;
                    self.set_state(&mut inner, ChannelState::Closed);
                    info!(
                        %node_id,
                        index_id=%self.target.index_id,
                        rows_acked=inner.counters.rows_acked,
                        requests_acked=inner.counters.requests_acked,
                        "node channel closed"
                    );
                    return ChannelHealth::Finished;
                }
            }
            SlotPoll::Failed {
                request,
                attempts,
                error,
                retryable,
            } => {
                if retryable && attempts <= self.config.max_retries {
                    let delay = self.config.backoff(attempts);
                    warn!(
                        %node_id,
                        packet_seq=request.packet_seq,
                        attempts,
                        error=%error,
                        ?delay,
                        "failed to send block, retrying"
                    );
                    inner.counters.retries += 1;
                    inner.slot.retry(request, attempts, Instant::now() + delay);
                } else {
                    inner.counters.rows_dropped += request.num_rows() as u64;
                    let err = ChannelError::Send {
                        node_id,
                        attempts,
                        source: error,
                    };
                    self.fail_locked(&mut inner, err.to_string());
                    return ChannelHealth::Failed;
                }
            }
        }

        if inner.slot.is_free() {
            if let Some(PendingBlock { buffer, request }) = inner.pending.pop_front() {
                self.space_available.notify_waiters();
                let loaded = match buffer.finish() {
                    Ok(block) => inner.slot.load(request, block.as_ref()),
                    Err(e) => Err(e),
                };
                if let Err(source) = loaded {
                    let err = ChannelError::Buffer { node_id, source };
                    self.fail_locked(&mut inner, err.to_string());
                    return ChannelHealth::Failed;
                }
            }
        }

        if inner.slot.is_ready(Instant::now()) {
            if let Some(token) = pool.try_acquire() {
                inner
                    .slot
                    .dispatch(token, Arc::clone(&self.client), self.config.rpc_timeout);
                inner.counters.requests_dispatched += 1;
            }
        }

        let next = match inner.state {
            ChannelState::Closing => ChannelState::Closing,
            _ if inner.slot.is_in_flight() => ChannelState::WaitingAck,
            _ if !inner.slot.is_free() || !inner.pending.is_empty() => ChannelState::Sending,
            _ => ChannelState::Open,
        };
        self.set_state(&mut inner, next);

        if inner.slot.is_free() && inner.pending.is_empty() {
            ChannelHealth::Idle
        } else {
            ChannelHealth::Busy
        }
    }

    /// Stop accepting rows and queue the remaining buffered rows as the
    /// final (eos) request. Queued and in-flight requests keep draining.
    pub fn mark_close(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            ChannelState::Closing | ChannelState::Closed | ChannelState::Cancelled => return,
            ChannelState::Open | ChannelState::Sending | ChannelState::WaitingAck => {}
        }

        if inner.failure.is_some() {
            self.set_state(&mut inner, ChannelState::Closed);
            return;
        }

        self.enqueue_buffer(&mut inner, true);
        self.set_state(&mut inner, ChannelState::Closing);
        debug!(
            node_id=%self.target.node_id,
            pending=inner.pending.len(),
            "marked node channel for close"
        );
    }

    /// Wait for the channel to reach a terminal state, giving up at
    /// `deadline`.
    ///
    /// The channel only progresses while something keeps calling
    /// [`Self::try_send_and_fetch_status()`]. On timeout the channel is
    /// cancelled and recorded as failed.
    pub async fn close_wait(&self, deadline: Instant) -> Result<(), ChannelError> {
        let node_id = self.target.node_id;
        let mut rx = self.state_tx.subscribe();

        let waited = tokio::time::timeout_at(deadline, async {
            rx.wait_for(|s| s.is_terminal()).await.map(|s| *s)
        })
        .await;

        let state = match waited {
            Ok(Ok(state)) => state,
            // The sender lives as long as the channel.
            Ok(Err(_)) => ChannelState::Cancelled,
            Err(_) => {
                let err = ChannelError::CloseTimeout { node_id };
                warn!(%node_id, "node channel close timed out");
                self.abandon(Some(err.to_string()));
                return Err(err);
            }
        };

        let inner = self.inner.lock();
        match (&inner.failure, state) {
            (Some(reason), _) => Err(ChannelError::Failed {
                node_id,
                reason: reason.clone(),
            }),
            (None, ChannelState::Cancelled) => Err(ChannelError::Cancelled { node_id }),
            (None, _) => Ok(()),
        }
    }

    /// Abandon the channel immediately: drop all buffered, queued and
    /// in-flight requests without waiting for acknowledgement, and tell the
    /// node (best effort) to discard the load.
    ///
    /// Errors observed after cancellation are not reported.
    pub fn cancel(&self) {
        self.abandon(None);
    }

    /// Drop all buffered and queued rows without sending them.
    pub fn clear_all_blocks(&self) -> usize {
        let dropped = self.inner.lock().clear();
        self.space_available.notify_waiters();
        debug!(node_id=%self.target.node_id, dropped, "cleared node channel blocks");
        dropped
    }

    /// Wait while the pending queue holds more than `max_pending_requests`
    /// requests. Returns immediately once the channel is terminal or failed.
    pub async fn wait_for_capacity(&self) {
        loop {
            let notified = self.space_available.notified();
            {
                let inner = self.inner.lock();
                if inner.pending.len() <= self.config.max_pending_requests
                    || inner.state.is_terminal()
                    || inner.failure.is_some()
                {
                    return;
                }
            }
            notified.await;
        }
    }

    fn enqueue_buffer(&self, inner: &mut Inner, eos: bool) {
        let buffer = inner.buffer.take();
        let request = AddBlockRequest {
            load_id: self.target.load_id,
            index_id: self.target.index_id,
            sender_id: self.target.sender_id,
            packet_seq: inner.next_packet_seq,
            tablet_ids: buffer.tablet_ids().to_vec(),
            eos,
        };
        inner.next_packet_seq += 1;
        inner.pending.push_back(PendingBlock { buffer, request });

        if inner.state == ChannelState::Open {
            self.set_state(inner, ChannelState::Sending);
        }
    }

    fn set_state(&self, inner: &mut Inner, to: ChannelState) {
        if inner.state == to {
            return;
        }
        debug!(
            node_id=%self.target.node_id,
            from=?inner.state,
            ?to,
            "node channel state transition"
        );
        inner.state = to;
        self.state_tx.send_replace(to);
    }

    fn fail(&self, reason: String) {
        let mut inner = self.inner.lock();
        self.fail_locked(&mut inner, reason);
    }

    fn fail_locked(&self, inner: &mut Inner, reason: String) {
        // A cancelled channel reports nothing further.
        if inner.failure.is_some() || inner.state.is_terminal() {
            return;
        }

        let dropped = inner.clear();
        error!(
            node_id=%self.target.node_id,
            index_id=%self.target.index_id,
            dropped,
            %reason,
            "node channel failed"
        );
        inner.failure = Some(reason);

        let next = if inner.state == ChannelState::Closing {
            ChannelState::Closed
        } else {
            ChannelState::Open
        };
        self.set_state(inner, next);
        self.space_available.notify_waiters();
    }

    fn abandon(&self, failure: Option<String>) {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            if inner.failure.is_none() {
                inner.failure = failure;
            }
            self.set_state(&mut inner, ChannelState::Cancelled);
        }
        // Terminal now: no row or dispatch can race the clear.
        let dropped = self.clear_all_blocks();

        info!(
            node_id=%self.target.node_id,
            index_id=%self.target.index_id,
            dropped,
            "cancelled node channel"
        );

        if let Ok(handle) = Handle::try_current() {
            let client = Arc::clone(&self.client);
            let target = self.target;
            let rpc_timeout = self.config.rpc_timeout;
            handle.spawn(async move {
                let res = tokio::time::timeout(
                    rpc_timeout,
                    client.cancel(target.load_id, target.index_id, target.sender_id),
                )
                .await;
                if let Ok(Err(e)) = res {
                    debug!(node_id=%target.node_id, error=%e, "cancel rpc failed");
                }
            });
        }
    }
}
