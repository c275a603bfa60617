//! Per-operation error sink.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Error, operation::Operation};

/// An error recorded against one operation.
#[derive(Debug, Clone)]
pub struct OperationError {
    operation: Arc<Operation>,
    error: Error,
}

impl OperationError {
    pub fn operation(&self) -> &Arc<Operation> {
        &self.operation
    }

    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn into_parts(self) -> (Arc<Operation>, Error) {
        (self.operation, self.error)
    }
}

/// Accumulates the errors of failed operations.
///
/// Appends are safe from any number of threads; callers inspect the errors once a batch has
/// finished to learn which operations failed and why.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    errors: Mutex<Vec<OperationError>>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&self, operation: Arc<Operation>, error: Error) {
        self.errors.lock().push(OperationError { operation, error });
    }

    pub fn count_errors(&self) -> usize {
        self.errors.lock().len()
    }

    /// A copy of the errors recorded so far, in the order they were recorded.
    pub fn errors(&self) -> Vec<OperationError> {
        self.errors.lock().clone()
    }

    /// Drain the recorded errors.
    pub fn take_errors(&self) -> Vec<OperationError> {
        std::mem::take(&mut *self.errors.lock())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::operation::{OperationKind, PartitionSchema, Table};

    fn op(key: &'static [u8]) -> Arc<Operation> {
        Arc::new(Operation::new(
            Arc::new(Table::new("kv", PartitionSchema::Hash)),
            OperationKind::RedisWrite {
                key: Bytes::from_static(key),
                payload: Bytes::new(),
            },
        ))
    }

    #[test]
    fn collects_and_drains() {
        let collector = ErrorCollector::new();
        let a = op(b"a");
        let b = op(b"b");

        collector.add_error(Arc::clone(&a), Error::Network("reset".to_string()));
        collector.add_error(Arc::clone(&b), Error::Aborted("shutdown".to_string()));
        assert_eq!(collector.count_errors(), 2);

        let errors = collector.errors();
        assert!(Arc::ptr_eq(errors[0].operation(), &a));
        assert_eq!(errors[1].error(), &Error::Aborted("shutdown".to_string()));

        let drained = collector.take_errors();
        assert_eq!(drained.len(), 2);
        assert_eq!(collector.count_errors(), 0);

        let (operation, error) = drained.into_iter().nth(1).unwrap().into_parts();
        assert!(Arc::ptr_eq(&operation, &b));
        assert!(matches!(error, Error::Aborted(_)));
    }

    #[test]
    fn concurrent_appends() {
        let collector = Arc::new(ErrorCollector::new());
        let handles = (0..8)
            .map(|_| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        collector.add_error(op(b"k"), Error::TimedOut("slow".to_string()));
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(collector.count_errors(), 800);
    }
}
