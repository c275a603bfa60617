//! Execution of flush callbacks away from the thread that observed completion.

use observability_deps::tracing::debug;
use tokio::{runtime::Handle, sync::mpsc};

/// A unit of work submitted to a [`CallbackPool`].
pub type CallbackTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs callbacks, one after the other, on a task of a tokio runtime.
///
/// Callbacks must not block. Cloning yields another handle to the same pool; the pool stops
/// once every handle is dropped or its runtime shuts down.
#[derive(Debug, Clone)]
pub struct CallbackPool {
    tx: mpsc::UnboundedSender<CallbackTask>,
}

impl CallbackPool {
    pub fn spawn(runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<CallbackTask>();
        runtime.spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
            }
            debug!("callback pool stopped");
        });
        Self { tx }
    }

    /// Queue `task`, handing it back if the pool is no longer running.
    pub fn submit(&self, task: CallbackTask) -> Result<(), CallbackTask> {
        self.tx.send(task).map_err(|e| e.0)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use parking_lot::Mutex;
    use test_helpers::timeout::FutureTimeout;
    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn runs_in_submission_order() {
        let pool = CallbackPool::spawn(&Handle::current());
        let seen = Arc::new(Mutex::new(vec![]));

        for i in 0..10 {
            let seen = Arc::clone(&seen);
            assert!(pool.submit(Box::new(move || seen.lock().push(i))).is_ok());
        }
        let (tx, rx) = oneshot::channel();
        assert!(
            pool.submit(Box::new(move || {
                let _ = tx.send(());
            }))
            .is_ok()
        );
        rx.with_timeout_panic(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn hands_task_back_once_stopped() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let pool = CallbackPool::spawn(runtime.handle());
        drop(runtime);

        let ran = Arc::new(Mutex::new(false));
        let task = {
            let ran = Arc::clone(&ran);
            Box::new(move || *ran.lock() = true)
        };
        let task = pool.submit(task).unwrap_err();
        assert!(!*ran.lock());
        task();
        assert!(*ran.lock());
    }
}
