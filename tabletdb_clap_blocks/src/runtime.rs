//! Config for the tokio runtime driving lookups and tablet server requests.

use std::{
    num::{NonZeroU32, NonZeroUsize},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

/// Tokio runtime type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TokioRuntimeType {
    /// Current-thread runtime.
    CurrentThread,

    /// Multi-thread runtime.
    #[default]
    MultiThread,
}

/// CLI config for the tokio runtime.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct TokioRuntimeConfig {
    /// Set the maximum number of runtime worker threads to use.
    ///
    /// Defaults to the number of logical cores on the system.
    #[clap(long = "num-threads", env = "TABLETDB_NUM_THREADS", action)]
    pub num_threads: Option<NonZeroUsize>,

    /// Tokio runtime type.
    #[clap(
        long = "runtime-type",
        env = "TABLETDB_RUNTIME_TYPE",
        default_value_t = TokioRuntimeType::default(),
        value_enum,
        action
    )]
    pub runtime_type: TokioRuntimeType,

    /// Sets the number of scheduler ticks after which the scheduler will poll for external
    /// events (timers, I/O, and so on).
    #[clap(
        long = "runtime-event-interval",
        env = "TABLETDB_RUNTIME_EVENT_INTERVAL",
        action
    )]
    pub event_interval: Option<NonZeroU32>,

    /// Specifies the limit for additional threads spawned by the runtime.
    #[clap(
        long = "runtime-max-blocking-threads",
        env = "TABLETDB_RUNTIME_MAX_BLOCKING_THREADS",
        action
    )]
    pub max_blocking_threads: Option<NonZeroUsize>,

    /// Sets a custom timeout for a thread in the blocking pool of the runtime.
    #[clap(
        long = "runtime-thread-keep-alive",
        env = "TABLETDB_RUNTIME_THREAD_KEEP_ALIVE",
        value_parser = humantime::parse_duration
    )]
    pub thread_keep_alive: Option<Duration>,
}

impl TokioRuntimeConfig {
    /// Creates the tokio runtime builder.
    pub fn builder(&self) -> Result<tokio::runtime::Builder, std::io::Error> {
        self.builder_with_name("main")
    }

    /// Creates the tokio runtime builder, naming worker threads after `name`.
    pub fn builder_with_name(&self, name: &str) -> Result<tokio::runtime::Builder, std::io::Error> {
        // NOTE: no log macros will work here, the subscriber is installed once the runtime runs.
        let mut builder = match self.runtime_type {
            TokioRuntimeType::CurrentThread => tokio::runtime::Builder::new_current_thread(),
            TokioRuntimeType::MultiThread => {
                let mut builder = tokio::runtime::Builder::new_multi_thread();
                let num_threads = match self.num_threads {
                    None => std::thread::available_parallelism()?,
                    Some(n) => n,
                };
                builder.worker_threads(num_threads.get());
                builder
            }
        };
        builder.enable_all();

        let thread_counter = Arc::new(AtomicUsize::new(1));
        let name = name.to_owned();
        builder.thread_name_fn(move || {
            format!(
                "TabletDB Tokio {} {}",
                name,
                thread_counter.fetch_add(1, Ordering::SeqCst)
            )
        });

        if let Some(x) = self.event_interval {
            builder.event_interval(x.get());
        }

        if let Some(x) = self.max_blocking_threads {
            builder.max_blocking_threads(x.get());
        }

        if let Some(x) = self.thread_keep_alive {
            builder.thread_keep_alive(x);
        }

        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use std::{ffi::OsString, future::Future};

    use clap::Parser;
    use futures::FutureExt;
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn test_parse() {
        let cfg = TokioRuntimeConfig::parse_from([
            "my_binary",
            "--num-threads",
            "3",
            "--runtime-type",
            "current-thread",
            "--runtime-thread-keep-alive",
            "5s",
        ]);
        assert_eq!(cfg.num_threads, NonZeroUsize::new(3));
        assert_eq!(cfg.runtime_type, TokioRuntimeType::CurrentThread);
        assert_eq!(cfg.thread_keep_alive, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_thread_name() {
        assert_runtime_thread_property(
            TokioRuntimeConfig::parse_from(std::iter::empty::<OsString>())
                .builder()
                .unwrap(),
            || {
                assert_thread_name("TabletDB Tokio main");
            },
        );
        assert_runtime_thread_property(
            TokioRuntimeConfig::parse_from(std::iter::empty::<OsString>())
                .builder_with_name("foo")
                .unwrap(),
            || {
                assert_thread_name("TabletDB Tokio foo");
            },
        );
    }

    #[test]
    fn test_io() {
        assert_runtime_thread_property_async(
            TokioRuntimeConfig::parse_from(std::iter::empty::<OsString>())
                .builder()
                .unwrap(),
            || async move {
                assert!(is_io_enabled().await);
            },
        );
    }

    #[track_caller]
    fn assert_runtime_thread_property<F>(builder: tokio::runtime::Builder, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert_runtime_thread_property_async(builder, || async move { f() });
    }

    #[track_caller]
    fn assert_runtime_thread_property_async<F, Fut>(mut builder: tokio::runtime::Builder, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let rt = builder.build().unwrap();
        rt.block_on(async move {
            tokio::spawn(async move { f().await }).await.unwrap();
        });
    }

    #[track_caller]
    fn assert_thread_name(prefix: &'static str) {
        let thread = std::thread::current();
        let tname = thread.name().expect("thread is named");

        assert!(tname.starts_with(prefix), "Invalid thread name: {tname}",);
    }

    async fn is_io_enabled() -> bool {
        TcpListener::bind("127.0.0.1:0")
            .catch_unwind()
            .await
            .is_ok()
    }
}
