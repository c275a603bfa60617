//! Partitioning of resolved operations into per-tablet, per-consistency-class requests.

use std::{fmt::Display, sync::Arc};

use super::in_flight_op::InFlightOp;
use crate::{
    operation::{ConsistencyLevel, OperationType},
    tablet::RemoteTablet,
};

/// Maximum number of variable size row payloads a single response may carry.
pub(crate) const MAX_SIDECAR_SLICES: usize = 8;

/// The class of request an operation is sent in.
///
/// Operations of different classes are never sent in the same request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpGroup {
    Write,
    /// Must be served by the tablet leader.
    LeaderRead,
    /// May be served by any replica.
    ConsistentPrefixRead,
}

impl OpGroup {
    /// Classify an in-flight operation.
    pub(crate) fn of(op: &InFlightOp, allow_follower_reads: bool) -> Self {
        let operation = op.operation();
        if !operation.read_only() {
            return Self::Write;
        }

        let follower_read = operation.op_type() == OperationType::RedisRead && allow_follower_reads;
        let consistent_prefix = operation.op_type() == OperationType::QlRead
            && operation.consistency_level() == ConsistencyLevel::ConsistentPrefix;
        if follower_read || consistent_prefix {
            Self::ConsistentPrefixRead
        } else {
            Self::LeaderRead
        }
    }
}

impl Display for OpGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Write => f.write_str("write"),
            Self::LeaderRead => f.write_str("leader read"),
            Self::ConsistentPrefixRead => f.write_str("consistent prefix read"),
        }
    }
}

/// An operation drained from the batcher queue along with its resolved destination.
#[derive(Debug)]
pub(crate) struct ResolvedOp {
    pub(crate) tablet: Arc<RemoteTablet>,
    pub(crate) op: Arc<InFlightOp>,
}

/// A set of operations sent to one tablet in one request.
#[derive(Debug)]
pub(crate) struct DispatchGroup {
    pub(crate) tablet: Arc<RemoteTablet>,
    pub(crate) group: OpGroup,
    pub(crate) ops: Vec<Arc<InFlightOp>>,
    pub(crate) need_consistent_read: bool,
    pub(crate) allow_local_calls_in_curr_thread: bool,
}

/// Options applying to every group of one flush.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GroupingOptions {
    pub(crate) force_consistent_read: bool,
    pub(crate) allow_follower_reads: bool,
    pub(crate) allow_local_calls_in_curr_thread: bool,
}

/// Sort `ops` by (tablet, class, admission order) and cut them into dispatch groups.
///
/// A new group starts whenever the tablet or the class changes, or once the current group
/// holds [`MAX_SIDECAR_SLICES`] operations returning row payloads. Consistent reads are
/// requested from every group unless the whole flush is a single group. Only the last group may
/// be executed locally on the calling thread.
pub(crate) fn build_dispatch_groups(
    ops: Vec<ResolvedOp>,
    options: GroupingOptions,
) -> Vec<DispatchGroup> {
    let mut ops = ops
        .into_iter()
        .map(|r| (OpGroup::of(&r.op, options.allow_follower_reads), r))
        .collect::<Vec<_>>();
    ops.sort_by(|(lgroup, l), (rgroup, r)| {
        l.tablet
            .tablet_id()
            .cmp(r.tablet.tablet_id())
            .then(lgroup.cmp(rgroup))
            .then(l.op.sequence_number().cmp(&r.op.sequence_number()))
    });

    let mut groups: Vec<DispatchGroup> = vec![];
    let mut num_sidecars = 0;
    for (group, ResolvedOp { tablet, op }) in ops {
        let boundary = groups.last().is_none_or(|g| {
            g.tablet.tablet_id() != tablet.tablet_id()
                || g.group != group
                || num_sidecars >= MAX_SIDECAR_SLICES
        });
        if boundary {
            num_sidecars = 0;
        }
        if op.operation().returns_sidecar() {
            num_sidecars += 1;
        }

        match groups.last_mut() {
            Some(g) if !boundary => g.ops.push(op),
            _ => groups.push(DispatchGroup {
                tablet,
                group,
                ops: vec![op],
                need_consistent_read: false,
                allow_local_calls_in_curr_thread: false,
            }),
        }
    }

    let need_consistent_read = options.force_consistent_read || groups.len() > 1;
    for g in &mut groups {
        g.need_consistent_read = need_consistent_read;
    }
    if let Some(last) = groups.last_mut() {
        last.allow_local_calls_in_curr_thread = options.allow_local_calls_in_curr_thread;
    }

    groups
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use proptest::prelude::*;

    use super::*;
    use crate::{
        operation::{Operation, OperationKind, PartitionSchema, RowKey, Table},
        tablet::TabletId,
    };

    const OPTIONS: GroupingOptions = GroupingOptions {
        force_consistent_read: false,
        allow_follower_reads: false,
        allow_local_calls_in_curr_thread: true,
    };

    fn tablet(id: &str) -> Arc<RemoteTablet> {
        Arc::new(RemoteTablet::new(TabletId::new(id), Bytes::new(), Bytes::new()))
    }

    fn write() -> OperationKind {
        OperationKind::QlWrite {
            key: RowKey::hashed([Bytes::from_static(b"k")]),
            returns_rows: false,
            payload: Bytes::new(),
        }
    }

    fn read(consistency_level: ConsistencyLevel) -> OperationKind {
        OperationKind::QlRead {
            key: RowKey::hashed([Bytes::from_static(b"k")]),
            consistency_level,
            payload: Bytes::new(),
        }
    }

    fn redis_read() -> OperationKind {
        OperationKind::RedisRead {
            key: Bytes::from_static(b"k"),
            payload: Bytes::new(),
        }
    }

    fn resolved(tablet: &Arc<RemoteTablet>, seq: u64, kind: OperationKind) -> ResolvedOp {
        let table = Arc::new(Table::new("t", PartitionSchema::Hash));
        ResolvedOp {
            tablet: Arc::clone(tablet),
            op: Arc::new(InFlightOp::new(
                Arc::new(Operation::new(table, kind)),
                vec![],
                seq,
            )),
        }
    }

    fn seqs(g: &DispatchGroup) -> Vec<u64> {
        g.ops.iter().map(|op| op.sequence_number()).collect()
    }

    #[test]
    fn classification() {
        let t = tablet("a");
        let w = resolved(&t, 0, write());
        let strong = resolved(&t, 1, read(ConsistencyLevel::Strong));
        let prefix = resolved(&t, 2, read(ConsistencyLevel::ConsistentPrefix));
        let redis = resolved(&t, 3, redis_read());

        assert_eq!(OpGroup::of(&w.op, false), OpGroup::Write);
        assert_eq!(OpGroup::of(&strong.op, true), OpGroup::LeaderRead);
        assert_eq!(OpGroup::of(&prefix.op, false), OpGroup::ConsistentPrefixRead);
        assert_eq!(OpGroup::of(&redis.op, false), OpGroup::LeaderRead);
        assert_eq!(OpGroup::of(&redis.op, true), OpGroup::ConsistentPrefixRead);
    }

    #[test]
    fn single_group_keeps_admission_order() {
        let t = tablet("a");
        let ops = vec![
            resolved(&t, 2, write()),
            resolved(&t, 0, write()),
            resolved(&t, 1, write()),
        ];

        let groups = build_dispatch_groups(ops, OPTIONS);
        assert_eq!(groups.len(), 1);
        assert_eq!(seqs(&groups[0]), [0, 1, 2]);
        assert_eq!(groups[0].group, OpGroup::Write);
        assert!(!groups[0].need_consistent_read);
        assert!(groups[0].allow_local_calls_in_curr_thread);
    }

    #[test]
    fn force_consistent_read_applies_to_single_group() {
        let t = tablet("a");
        let groups = build_dispatch_groups(
            vec![resolved(&t, 0, write())],
            GroupingOptions {
                force_consistent_read: true,
                ..OPTIONS
            },
        );
        assert_eq!(groups.len(), 1);
        assert!(groups[0].need_consistent_read);
    }

    #[test]
    fn split_by_tablet_and_class() {
        let a = tablet("a");
        let b = tablet("b");
        let ops = vec![
            resolved(&b, 0, read(ConsistencyLevel::Strong)),
            resolved(&a, 1, read(ConsistencyLevel::ConsistentPrefix)),
            resolved(&a, 2, write()),
            resolved(&a, 3, read(ConsistencyLevel::Strong)),
            resolved(&a, 4, write()),
        ];

        let groups = build_dispatch_groups(ops, OPTIONS);
        let got = groups
            .iter()
            .map(|g| (g.tablet.tablet_id().to_string(), g.group, seqs(g)))
            .collect::<Vec<_>>();
        assert_eq!(
            got,
            [
                ("a".to_string(), OpGroup::Write, vec![2, 4]),
                ("a".to_string(), OpGroup::LeaderRead, vec![3]),
                ("a".to_string(), OpGroup::ConsistentPrefixRead, vec![1]),
                ("b".to_string(), OpGroup::LeaderRead, vec![0]),
            ]
        );

        // More than one request: all of them need a consistent read, and only the last may be
        // run locally.
        assert!(groups.iter().all(|g| g.need_consistent_read));
        let local = groups
            .iter()
            .map(|g| g.allow_local_calls_in_curr_thread)
            .collect::<Vec<_>>();
        assert_eq!(local, [false, false, false, true]);
    }

    #[test]
    fn split_on_sidecar_limit() {
        let t = tablet("a");
        let ops = (0..(2 * MAX_SIDECAR_SLICES as u64 + 1))
            .map(|seq| resolved(&t, seq, read(ConsistencyLevel::Strong)))
            .collect();

        let groups = build_dispatch_groups(ops, OPTIONS);
        let sizes = groups.iter().map(|g| g.ops.len()).collect::<Vec<_>>();
        assert_eq!(sizes, [MAX_SIDECAR_SLICES, MAX_SIDECAR_SLICES, 1]);
        assert!(groups.iter().all(|g| g.need_consistent_read));
    }

    #[test]
    fn writes_without_sidecars_are_not_split() {
        let t = tablet("a");
        let ops = (0..(3 * MAX_SIDECAR_SLICES as u64))
            .map(|seq| resolved(&t, seq, write()))
            .collect();

        let groups = build_dispatch_groups(ops, OPTIONS);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].ops.len(), 3 * MAX_SIDECAR_SLICES);
    }

    #[test]
    fn empty_input() {
        assert!(build_dispatch_groups(vec![], OPTIONS).is_empty());
    }

    proptest! {
        /// Every operation lands in exactly one group, groups never mix tablets or classes, and
        /// admission order is preserved within a (tablet, class) pair.
        #[test]
        fn grouping_invariants(layout in prop::collection::vec((0..4_usize, 0..3_u8), 1..64)) {
            let tablets = (0..4).map(|i| tablet(&format!("tablet-{i}"))).collect::<Vec<_>>();
            let ops = layout
                .iter()
                .enumerate()
                .map(|(seq, (t, kind))| {
                    let kind = match kind {
                        0 => write(),
                        1 => read(ConsistencyLevel::Strong),
                        _ => read(ConsistencyLevel::ConsistentPrefix),
                    };
                    resolved(&tablets[*t], seq as u64, kind)
                })
                .collect();

            let groups = build_dispatch_groups(ops, OPTIONS);

            let mut all = groups.iter().flat_map(seqs).collect::<Vec<_>>();
            all.sort_unstable();
            prop_assert_eq!(all, (0..layout.len() as u64).collect::<Vec<_>>());

            for g in &groups {
                prop_assert!(!g.ops.is_empty());
                prop_assert!(g.ops.iter().all(|op| OpGroup::of(op, false) == g.group));
                prop_assert!(seqs(g).windows(2).all(|w| w[0] < w[1]));
            }

            let mut last_seq = hashbrown::HashMap::new();
            for g in &groups {
                let key = (g.tablet.tablet_id().clone(), g.group);
                let first = seqs(g)[0];
                if let Some(prev) = last_seq.insert(key, *seqs(g).last().unwrap()) {
                    prop_assert!(prev < first);
                }
            }

            prop_assert_eq!(groups.len() > 1, groups.iter().all(|g| g.need_consistent_read));
        }
    }
}
