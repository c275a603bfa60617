//! Pushes batches of generated row operations through batchers backed by a simulated cluster.

use std::{
    fmt::Display,
    num::{NonZeroU16, NonZeroUsize},
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use clap::Parser;
use futures::{StreamExt, stream};
use iox_time::{SystemProvider, TimeProvider};
use observability_deps::tracing::{debug, info};
use rand::{Rng, SeedableRng, distributions::Alphanumeric, rngs::StdRng};
use tabletdb_clap_blocks::batcher::BatcherCliConfig;
use tabletdb_client::{
    Batcher, BatcherArgs, BatcherMetrics, BatcherPhase, CallbackPool, ConsistencyLevel,
    ErrorCollector, LatestObservedHybridTime, Operation, OperationKind, RowKey, Session,
};
use tokio::runtime::Handle;

use super::cluster::{Faults, SimulatedCluster};

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("{name} must be between 0 and 1, got {value}")]
    InvalidRate { name: &'static str, value: f64 },

    #[error("--ops-per-batch must be at least 1")]
    EmptyBatches,
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Parser)]
pub(crate) struct Config {
    /// Logging options
    #[clap(flatten)]
    pub(crate) logging_config: trogging::cli::LoggingConfig,

    /// Batcher options
    #[clap(flatten)]
    batcher_config: BatcherCliConfig,

    /// Number of batches to run.
    #[clap(long = "batches", env = "TABLETDB_LOAD_BATCHES", default_value = "100")]
    batches: usize,

    /// Number of operations admitted to every batch.
    #[clap(
        long = "ops-per-batch",
        env = "TABLETDB_LOAD_OPS_PER_BATCH",
        default_value = "64"
    )]
    ops_per_batch: usize,

    /// Number of batches in flight at any time.
    #[clap(
        long = "concurrency",
        env = "TABLETDB_LOAD_CONCURRENCY",
        default_value = "4"
    )]
    concurrency: NonZeroUsize,

    /// Number of tablets the table is split into.
    #[clap(long = "tablets", env = "TABLETDB_LOAD_TABLETS", default_value = "8")]
    tablets: NonZeroU16,

    /// Share of the generated operations that are reads.
    #[clap(
        long = "read-fraction",
        env = "TABLETDB_LOAD_READ_FRACTION",
        default_value = "0.25"
    )]
    read_fraction: f64,

    /// Size of the payload of every generated write, in bytes.
    #[clap(
        long = "payload-size",
        env = "TABLETDB_LOAD_PAYLOAD_SIZE",
        default_value = "128"
    )]
    payload_size: usize,

    /// Upper bound of the latency of every simulated lookup and request.
    #[clap(
        long = "max-latency",
        env = "TABLETDB_LOAD_MAX_LATENCY",
        default_value = "1ms",
        value_parser = humantime::parse_duration
    )]
    max_latency: Duration,

    /// Probability of a tablet lookup failing.
    #[clap(
        long = "lookup-failure-rate",
        env = "TABLETDB_LOAD_LOOKUP_FAILURE_RATE",
        default_value = "0"
    )]
    lookup_failure_rate: f64,

    /// Probability of a whole tablet server request failing.
    #[clap(
        long = "request-failure-rate",
        env = "TABLETDB_LOAD_REQUEST_FAILURE_RATE",
        default_value = "0"
    )]
    request_failure_rate: f64,

    /// Probability of a single row of a successful request failing.
    #[clap(
        long = "row-failure-rate",
        env = "TABLETDB_LOAD_ROW_FAILURE_RATE",
        default_value = "0"
    )]
    row_failure_rate: f64,

    /// Seed of the operation generator and the injected faults.
    #[clap(long = "seed", env = "TABLETDB_LOAD_SEED", default_value = "0")]
    seed: u64,
}

impl Config {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("--read-fraction", self.read_fraction),
            ("--lookup-failure-rate", self.lookup_failure_rate),
            ("--request-failure-rate", self.request_failure_rate),
            ("--row-failure-rate", self.row_failure_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidRate { name, value });
            }
        }
        if self.ops_per_batch == 0 {
            return Err(Error::EmptyBatches);
        }
        Ok(())
    }

    fn faults(&self) -> Faults {
        Faults {
            max_latency: self.max_latency,
            lookup_failure_rate: self.lookup_failure_rate,
            request_failure_rate: self.request_failure_rate,
            row_failure_rate: self.row_failure_rate,
        }
    }
}

/// Counts the batches reported back by their batchers.
#[derive(Debug, Default)]
struct LoadSession {
    flushed: AtomicUsize,
    aborted: AtomicUsize,
}

impl Session for LoadSession {
    fn flush_finished(&self, batcher: &Batcher) {
        match batcher.phase() {
            BatcherPhase::Aborted => self.aborted.fetch_add(1, Ordering::Relaxed),
            _ => self.flushed.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// Outcome of one batch.
#[derive(Debug)]
struct BatchOutcome {
    status: tabletdb_client::Result<()>,
    admitted: usize,
    rejected: usize,
    failed_ops: usize,
}

/// Summary of a load run.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct LoadReport {
    pub(crate) batches: usize,
    pub(crate) failed_batches: usize,
    pub(crate) ops: usize,
    pub(crate) rejected_ops: usize,
    pub(crate) failed_ops: usize,
    pub(crate) lookups: u64,
    pub(crate) requests: u64,
    pub(crate) requests_failed: u64,
    pub(crate) row_errors: u64,
    pub(crate) sessions_notified: usize,
    pub(crate) elapsed: Duration,
}

impl LoadReport {
    fn ops_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.ops as f64 / secs
    }
}

impl Display for LoadReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "batches: {} ({} failed)",
            self.batches, self.failed_batches
        )?;
        writeln!(
            f,
            "operations: {} admitted, {} rejected, {} failed",
            self.ops, self.rejected_ops, self.failed_ops
        )?;
        writeln!(
            f,
            "cluster: {} lookups, {} requests",
            self.lookups, self.requests
        )?;
        writeln!(
            f,
            "requests: {} failed, {} row errors",
            self.requests_failed, self.row_errors
        )?;
        writeln!(f, "sessions notified: {}", self.sessions_notified)?;
        write!(
            f,
            "elapsed: {} ({:.0} ops/s)",
            humantime::format_duration(self.elapsed),
            self.ops_per_second()
        )
    }
}

pub(crate) async fn command(config: Config) -> Result<LoadReport> {
    config.validate()?;

    let cluster = Arc::new(SimulatedCluster::new(
        "load",
        config.tablets,
        config.faults(),
        config.seed,
    ));
    let session = Arc::new(LoadSession::default());
    let weak_session: Weak<dyn Session> = Arc::downgrade(&session);
    let clock = Arc::new(LatestObservedHybridTime::new());
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
    let callback_pool = CallbackPool::spawn(&Handle::current());
    let metrics = metric::Registry::default();
    let batcher_metrics = BatcherMetrics::new(&metrics);
    let batcher_config = config.batcher_config.batcher_config();
    let mut generator = OperationGenerator::new(&config, Arc::clone(&cluster));

    info!(
        batches = config.batches,
        ops_per_batch = config.ops_per_batch,
        tablets = config.tablets.get(),
        concurrency = config.concurrency.get(),
        "starting load"
    );

    let start = Instant::now();
    let outcomes = stream::iter(0..config.batches)
        .map(|_| {
            let ops = generator.batch(config.ops_per_batch);
            let args = BatcherArgs {
                tablet_lookup: Arc::clone(&cluster) as _,
                tablet_client: Arc::clone(&cluster) as _,
                error_collector: Arc::new(ErrorCollector::new()),
                session: Some(Weak::clone(&weak_session)),
                transaction: None,
                read_point: None,
                clock: Arc::clone(&clock) as _,
                time_provider: Arc::clone(&time_provider),
                runtime: Handle::current(),
                callback_pool: Some(callback_pool.clone()),
                metrics: batcher_metrics.clone(),
                config: batcher_config,
            };
            run_batch(args, ops)
        })
        .buffer_unordered(config.concurrency.get())
        .collect::<Vec<_>>()
        .await;
    let elapsed = start.elapsed();

    let mut report = LoadReport {
        batches: outcomes.len(),
        lookups: cluster.lookups(),
        requests: cluster.requests(),
        requests_failed: batcher_metrics.requests_failed(),
        row_errors: batcher_metrics.rows_errored(),
        sessions_notified: session.flushed.load(Ordering::Relaxed)
            + session.aborted.load(Ordering::Relaxed),
        elapsed,
        ..Default::default()
    };
    for outcome in outcomes {
        if outcome.status.is_err() {
            report.failed_batches += 1;
        }
        report.ops += outcome.admitted;
        report.rejected_ops += outcome.rejected;
        report.failed_ops += outcome.failed_ops;
    }

    info!(
        failed_batches = report.failed_batches,
        failed_ops = report.failed_ops,
        latest_hybrid_time = %clock.get(),
        ?elapsed,
        "load finished"
    );

    Ok(report)
}

async fn run_batch(args: BatcherArgs, ops: Vec<Arc<Operation>>) -> BatchOutcome {
    let error_collector = Arc::clone(&args.error_collector);
    let batcher = Batcher::new(args);

    let mut admitted = 0;
    let mut rejected = 0;
    for op in ops {
        match batcher.add(op) {
            Ok(()) => admitted += 1,
            Err(e) => {
                debug!(%e, "operation rejected");
                rejected += 1;
            }
        }
    }

    let status = batcher.flush().await;
    if let Err(e) = &status {
        debug!(%e, "batch failed");
    }

    BatchOutcome {
        status,
        admitted,
        rejected,
        failed_ops: error_collector.count_errors(),
    }
}

/// Generates random QL reads and writes against the table of a cluster.
#[derive(Debug)]
struct OperationGenerator {
    cluster: Arc<SimulatedCluster>,
    rng: StdRng,
    read_fraction: f64,
    payload_size: usize,
}

impl OperationGenerator {
    fn new(config: &Config, cluster: Arc<SimulatedCluster>) -> Self {
        Self {
            cluster,
            // Distinct from the stream the cluster injects faults with.
            rng: StdRng::seed_from_u64(config.seed.wrapping_add(1)),
            read_fraction: config.read_fraction,
            payload_size: config.payload_size,
        }
    }

    fn batch(&mut self, n: usize) -> Vec<Arc<Operation>> {
        (0..n).map(|_| Arc::new(self.operation())).collect()
    }

    fn operation(&mut self) -> Operation {
        let key = RowKey::hashed([Bytes::from(format!("row-{}", self.rng.r#gen::<u32>()))]);
        let kind = if self.rng.gen_bool(self.read_fraction) {
            let consistency_level = if self.rng.gen_bool(0.5) {
                ConsistencyLevel::Strong
            } else {
                ConsistencyLevel::ConsistentPrefix
            };
            OperationKind::QlRead {
                key,
                consistency_level,
                payload: Bytes::new(),
            }
        } else {
            let payload: String = (&mut self.rng)
                .sample_iter(&Alphanumeric)
                .take(self.payload_size)
                .map(char::from)
                .collect();
            OperationKind::QlWrite {
                key,
                returns_rows: false,
                payload: Bytes::from(payload),
            }
        };
        Operation::new(Arc::clone(self.cluster.table()), kind)
    }
}
