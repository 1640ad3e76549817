//! Fan-out of rows to every replica of a tablet within one index.

use std::{collections::BTreeMap, fmt::Display, sync::Arc};

use hashbrown::{HashMap, HashSet};

use crate::{
    buffer::BlockRow,
    config::WriteQuorum,
    ids::{IndexId, NodeId, TabletId},
    node_channel::NodeChannel,
};

/// Per tablet replica acknowledgement counts, reported at close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabletSummary {
    pub index_id: IndexId,
    pub replicas: usize,
    pub acked_replicas: usize,
}

/// A tablet that has fewer usable replicas than the write quorum requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnderReplicated {
    pub tablet: TabletId,
    pub live: usize,
    pub required: usize,
}

impl Display for UnderReplicated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tablet {} has {} live replica(s), the write quorum requires {}",
            self.tablet, self.live, self.required
        )
    }
}

/// Groups the [`NodeChannel`]s replicating one index, one channel per
/// destination node.
#[derive(Debug)]
pub struct IndexChannel {
    index_id: IndexId,
    channels: BTreeMap<NodeId, Arc<NodeChannel>>,
    /// The replica channels of every tablet, in replica order.
    tablets: HashMap<TabletId, Vec<Arc<NodeChannel>>>,
}

impl IndexChannel {
    /// Build the channels for `tablets`, each listed with its replica nodes.
    ///
    /// `new_channel` is called once per distinct node with every tablet that
    /// node holds a replica of.
    pub fn new(
        index_id: IndexId,
        tablets: impl IntoIterator<Item = (TabletId, Vec<NodeId>)>,
        mut new_channel: impl FnMut(NodeId, Vec<TabletId>) -> NodeChannel,
    ) -> Self {
        let tablets = tablets.into_iter().collect::<Vec<_>>();

        let mut per_node: BTreeMap<NodeId, Vec<TabletId>> = BTreeMap::new();
        for (tablet, nodes) in &tablets {
            for node in nodes {
                per_node.entry(*node).or_default().push(*tablet);
            }
        }

        let channels = per_node
            .into_iter()
            .map(|(node, tablets)| (node, Arc::new(new_channel(node, tablets))))
            .collect::<BTreeMap<_, _>>();

        let tablets = tablets
            .into_iter()
            .map(|(tablet, nodes)| {
                let mut seen = HashSet::new();
                let replicas = nodes
                    .iter()
                    .filter(|n| seen.insert(**n))
                    .filter_map(|n| channels.get(n).map(Arc::clone))
                    .collect();
                (tablet, replicas)
            })
            .collect();

        Self {
            index_id,
            channels,
            tablets,
        }
    }

    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    pub fn node_channels(&self) -> impl Iterator<Item = &Arc<NodeChannel>> + '_ {
        self.channels.values()
    }

    /// Forward `row` to every replica channel of `tablet_id`.
    ///
    /// Returns the number of replicas that accepted the row, which excludes
    /// failed and cancelled channels.
    pub fn add_row(&self, tablet_id: TabletId, row: &BlockRow) -> usize {
        self.tablets
            .get(&tablet_id)
            .map(|replicas| {
                replicas
                    .iter()
                    .filter(|ch| ch.add_row(row, tablet_id).is_ok())
                    .count()
            })
            .unwrap_or_default()
    }

    pub fn replicas(&self, tablet_id: TabletId) -> usize {
        self.tablets.get(&tablet_id).map_or(0, Vec::len)
    }

    /// Replicas of `tablet_id` whose channel can still deliver rows.
    pub fn live_replicas(&self, tablet_id: TabletId) -> usize {
        self.tablets
            .get(&tablet_id)
            .map_or(0, |r| r.iter().filter(|ch| ch.is_healthy()).count())
    }

    /// Find a tablet whose live replicas can no longer satisfy `quorum`.
    pub fn find_intolerable_failure(&self, quorum: WriteQuorum) -> Option<UnderReplicated> {
        self.tablets.keys().find_map(|tablet| {
            let live = self.live_replicas(*tablet);
            let required = quorum.required(self.replicas(*tablet));
            (live < required).then_some(UnderReplicated {
                tablet: *tablet,
                live,
                required,
            })
        })
    }

    /// Replica acknowledgement counts of every tablet, from the tablets each
    /// successfully closed channel committed.
    pub fn tablet_summaries(&self) -> impl Iterator<Item = (TabletId, TabletSummary)> + '_ {
        let committed = self
            .channels
            .iter()
            .map(|(node, ch)| (*node, ch.committed_tablets().into_iter().collect::<HashSet<_>>()))
            .collect::<HashMap<_, _>>();

        self.tablets.iter().map(move |(tablet, replicas)| {
            let acked_replicas = replicas
                .iter()
                .filter(|ch| {
                    committed
                        .get(&ch.node_id())
                        .is_some_and(|c| c.contains(tablet))
                })
                .count();
            (
                *tablet,
                TabletSummary {
                    index_id: self.index_id,
                    replicas: replicas.len(),
                    acked_replicas,
                },
            )
        })
    }
}
