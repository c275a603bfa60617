//! Tablet destinations and the lookup service that resolves partition keys to them.

use std::{fmt::Display, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use iox_time::Time;

use crate::{Result, operation::Table};

/// Identifier of a tablet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TabletId(Arc<str>);

impl TabletId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TabletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tablet owning the partition key range `[partition_start, partition_end)`.
///
/// An empty `partition_end` is unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTablet {
    tablet_id: TabletId,
    partition_start: Bytes,
    partition_end: Bytes,
}

impl RemoteTablet {
    pub fn new(
        tablet_id: TabletId,
        partition_start: impl Into<Bytes>,
        partition_end: impl Into<Bytes>,
    ) -> Self {
        Self {
            tablet_id,
            partition_start: partition_start.into(),
            partition_end: partition_end.into(),
        }
    }

    pub fn tablet_id(&self) -> &TabletId {
        &self.tablet_id
    }

    pub fn partition_start(&self) -> &[u8] {
        &self.partition_start
    }

    pub fn partition_end(&self) -> &[u8] {
        &self.partition_end
    }

    /// True if `partition_key` falls in the key range of this tablet.
    pub fn contains_key(&self, partition_key: &[u8]) -> bool {
        partition_key >= &self.partition_start[..]
            && (self.partition_end.is_empty() || partition_key < &self.partition_end[..])
    }
}

/// Resolves the tablet owning a partition key.
///
/// Every admitted operation without a known destination results in exactly one call.
#[async_trait]
pub trait TabletLookup: std::fmt::Debug + Send + Sync {
    async fn lookup_tablet_by_key(
        &self,
        table: &Table,
        partition_key: &[u8],
        deadline: Time,
    ) -> Result<Arc<RemoteTablet>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_range_membership() {
        let first = RemoteTablet::new(TabletId::new("t1"), Bytes::new(), Bytes::from_static(b"m"));
        let last = RemoteTablet::new(TabletId::new("t2"), Bytes::from_static(b"m"), Bytes::new());

        assert!(first.contains_key(b""));
        assert!(first.contains_key(b"a"));
        assert!(!first.contains_key(b"m"));
        assert!(last.contains_key(b"m"));
        assert!(last.contains_key(b"zzz"));
        assert!(!last.contains_key(b"a"));
    }

    #[test]
    fn tablet_ids_order_lexicographically() {
        let mut ids = vec![TabletId::new("b"), TabletId::new("a"), TabletId::new("c")];
        ids.sort();
        assert_eq!(
            ids.iter().map(TabletId::as_str).collect::<Vec<_>>(),
            ["a", "b", "c"]
        );
    }
}
