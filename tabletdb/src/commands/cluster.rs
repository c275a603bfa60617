//! An in-process stand-in for the tablet location service and the tablet servers.

use std::{
    num::NonZeroU16,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use iox_time::Time;
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tabletdb_client::{
    Error, HybridTime, PartitionSchema, ReadHybridTime, RemoteTablet, Result, RowError, Table,
    TabletId, TabletLookup, TabletRequest, TabletResponse, TabletServerClient,
};

/// Failures and latency injected by a [`SimulatedCluster`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct Faults {
    /// Upper bound of the uniformly distributed latency of every call.
    pub(crate) max_latency: Duration,
    pub(crate) lookup_failure_rate: f64,
    pub(crate) request_failure_rate: f64,
    pub(crate) row_failure_rate: f64,
}

/// A hash partitioned table split evenly over a fixed set of tablets.
///
/// Serves both the tablet lookups and the tablet server requests of a batcher. Every successful
/// request propagates a fresh hybrid time.
#[derive(Debug)]
pub(crate) struct SimulatedCluster {
    table: Arc<Table>,
    tablets: Vec<Arc<RemoteTablet>>,
    faults: Faults,
    rng: Mutex<StdRng>,
    hybrid_time: AtomicU64,
    lookups: AtomicU64,
    requests: AtomicU64,
}

impl SimulatedCluster {
    pub(crate) fn new(table_name: &str, n_tablets: NonZeroU16, faults: Faults, seed: u64) -> Self {
        let n = usize::from(n_tablets.get());
        let boundary = |i: usize| {
            if i == 0 || i == n {
                vec![]
            } else {
                PartitionSchema::encode_multi_column_hash_value((i * 0x1_0000 / n) as u16)
            }
        };
        let tablets = (0..n)
            .map(|i| {
                Arc::new(RemoteTablet::new(
                    TabletId::new(format!("{table_name}-tablet-{i}")),
                    boundary(i),
                    boundary(i + 1),
                ))
            })
            .collect();

        Self {
            table: Arc::new(Table::new(table_name, PartitionSchema::Hash)),
            tablets,
            faults,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            hybrid_time: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
            requests: AtomicU64::new(0),
        }
    }

    pub(crate) fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub(crate) fn tablets(&self) -> &[Arc<RemoteTablet>] {
        &self.tablets
    }

    /// Number of tablet lookups served so far.
    pub(crate) fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Number of tablet server requests served so far.
    pub(crate) fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn latency(&self) -> Duration {
        let max = self.faults.max_latency.as_micros() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.rng.lock().gen_range(0..=max))
    }

    fn should_fail(&self, rate: f64) -> bool {
        rate > 0.0 && self.rng.lock().gen_bool(rate.min(1.0))
    }

    async fn simulate_latency(&self) {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl TabletLookup for SimulatedCluster {
    async fn lookup_tablet_by_key(
        &self,
        table: &Table,
        partition_key: &[u8],
        _deadline: Time,
    ) -> Result<Arc<RemoteTablet>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;

        if table.name() != self.table.name() {
            return Err(Error::LookupFailed(format!("table {} not found", table.name())));
        }
        if self.should_fail(self.faults.lookup_failure_rate) {
            return Err(Error::LookupFailed("injected lookup failure".to_string()));
        }

        self.tablets
            .iter()
            .find(|t| t.contains_key(partition_key))
            .map(Arc::clone)
            .ok_or_else(|| {
                Error::LookupFailed(format!(
                    "no tablet covers partition key {}",
                    hex::encode(partition_key)
                ))
            })
    }
}

#[async_trait]
impl TabletServerClient for SimulatedCluster {
    async fn send(&self, request: TabletRequest) -> Result<TabletResponse> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;

        let tablet_id = request.tablet.tablet_id();
        if self.should_fail(self.faults.request_failure_rate) {
            return Err(Error::Network(format!(
                "injected failure sending to {tablet_id}"
            )));
        }

        let mut per_row_errors = vec![];
        for (row_index, op) in request.operations.iter().enumerate() {
            let misrouted = op
                .partition_key()
                .map(|key| !request.tablet.contains_key(&key))
                .unwrap_or(true);
            if misrouted {
                per_row_errors.push(RowError {
                    row_index,
                    error: Error::Remote(format!("{op} does not belong to tablet {tablet_id}")),
                });
            } else if self.should_fail(self.faults.row_failure_rate) {
                per_row_errors.push(RowError {
                    row_index,
                    error: Error::Remote("injected row failure".to_string()),
                });
            }
        }

        let now = HybridTime::new(self.hybrid_time.fetch_add(1, Ordering::SeqCst) + 1);
        debug!(
            %tablet_id,
            group=%request.group,
            n_ops=request.operations.len(),
            n_errors=per_row_errors.len(),
            "served request"
        );

        Ok(TabletResponse {
            per_row_errors,
            propagated_hybrid_time: Some(now),
            used_read_time: request.need_consistent_read.then_some(ReadHybridTime {
                read: now,
                global_limit: now,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tabletdb_client::{Operation, OperationKind, RowKey};

    use super::*;

    fn cluster(n_tablets: u16, faults: Faults) -> SimulatedCluster {
        SimulatedCluster::new("bananas", NonZeroU16::new(n_tablets).unwrap(), faults, 42)
    }

    #[test]
    fn tablets_cover_the_hash_space() {
        let cluster = cluster(7, Faults::default());
        assert_eq!(cluster.tablets().len(), 7);

        for hash in (0..=u16::MAX).step_by(97).chain([u16::MAX]) {
            let key = PartitionSchema::encode_multi_column_hash_value(hash);
            let owners = cluster
                .tablets()
                .iter()
                .filter(|t| t.contains_key(&key))
                .count();
            assert_eq!(owners, 1, "hash {hash}");
        }
    }

    #[test]
    fn single_tablet_is_unbounded() {
        let cluster = cluster(1, Faults::default());
        let tablet = &cluster.tablets()[0];
        assert!(tablet.partition_start().is_empty());
        assert!(tablet.partition_end().is_empty());
    }

    #[tokio::test]
    async fn lookup_resolves_owner() {
        let cluster = cluster(4, Faults::default());
        let key = PartitionSchema::encode_multi_column_hash_value(0xc000);

        let tablet = cluster
            .lookup_tablet_by_key(cluster.table(), &key, Time::MAX)
            .await
            .unwrap();
        assert_eq!(tablet.tablet_id().as_str(), "bananas-tablet-3");
        assert_eq!(cluster.lookups(), 1);
    }

    #[tokio::test]
    async fn lookup_of_unknown_table_fails() {
        let cluster = cluster(4, Faults::default());
        let other = Table::new("platanos", PartitionSchema::Hash);

        let err = cluster
            .lookup_tablet_by_key(&other, &[0, 0], Time::MAX)
            .await
            .unwrap_err();
        assert_eq!(err, Error::LookupFailed("table platanos not found".to_string()));
    }

    #[tokio::test]
    async fn injected_lookup_failures() {
        let cluster = cluster(
            2,
            Faults {
                lookup_failure_rate: 1.0,
                ..Default::default()
            },
        );

        let err = cluster
            .lookup_tablet_by_key(cluster.table(), &[0, 0], Time::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LookupFailed(_)));
    }

    fn request(cluster: &SimulatedCluster, tablet: usize, keys: &[&'static str]) -> TabletRequest {
        let operations = keys
            .iter()
            .map(|&k| {
                Arc::new(Operation::new(
                    Arc::clone(cluster.table()),
                    OperationKind::QlWrite {
                        key: RowKey::hashed([Bytes::from_static(k.as_bytes())]),
                        returns_rows: false,
                        payload: Bytes::from_static(b"v"),
                    },
                ))
            })
            .collect();
        TabletRequest {
            group: tabletdb_client::OpGroup::Write,
            tablet: Arc::clone(&cluster.tablets()[tablet]),
            operations,
            need_consistent_read: true,
            allow_local_calls_in_curr_thread: false,
            transaction: None,
            may_have_metadata: false,
            deadline: Time::MAX,
        }
    }

    #[tokio::test]
    async fn responses_propagate_increasing_hybrid_times() {
        let cluster = cluster(1, Faults::default());

        let first = cluster.send(request(&cluster, 0, &["a", "b"])).await.unwrap();
        let second = cluster.send(request(&cluster, 0, &["c"])).await.unwrap();

        assert!(first.per_row_errors.is_empty());
        assert_eq!(first.propagated_hybrid_time, Some(HybridTime::new(1)));
        assert_eq!(second.propagated_hybrid_time, Some(HybridTime::new(2)));
        assert_eq!(
            second.used_read_time,
            Some(ReadHybridTime {
                read: HybridTime::new(2),
                global_limit: HybridTime::new(2),
            })
        );
        assert_eq!(cluster.requests(), 2);
    }

    #[tokio::test]
    async fn misrouted_rows_are_rejected() {
        let cluster = cluster(2, Faults::default());
        let keys = ["a", "b", "c", "d", "e", "f", "g", "h"];

        let response = cluster.send(request(&cluster, 0, &keys)).await.unwrap();

        let expected = keys
            .iter()
            .filter(|k| {
                let key = PartitionSchema::encode_multi_column_hash_value(
                    PartitionSchema::hash_columns([k.as_bytes()]),
                );
                !cluster.tablets()[0].contains_key(&key)
            })
            .count();
        assert_eq!(response.per_row_errors.len(), expected);
    }

    #[tokio::test]
    async fn injected_request_failures() {
        let cluster = cluster(
            1,
            Faults {
                request_failure_rate: 1.0,
                ..Default::default()
            },
        );

        let err = cluster.send(request(&cluster, 0, &["a"])).await.unwrap_err();
        assert_eq!(
            err,
            Error::Network("injected failure sending to bananas-tablet-0".to_string())
        );
    }

    #[tokio::test]
    async fn injected_row_failures() {
        let cluster = cluster(
            1,
            Faults {
                row_failure_rate: 1.0,
                ..Default::default()
            },
        );

        let response = cluster.send(request(&cluster, 0, &["a", "b"])).await.unwrap();
        let rows = response
            .per_row_errors
            .iter()
            .map(|e| e.row_index)
            .collect::<Vec<_>>();
        assert_eq!(rows, [0, 1]);
    }
}
